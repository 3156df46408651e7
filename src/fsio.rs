use std::fs;
use std::io;
use std::path::Path;

/// Write a file atomically: write to a sibling temp file, then rename over
/// the target. Readers observe either the prior or the new content, never a
/// partial write.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::registry::{ParameterRegistry, PipelinePhase};
use crate::fsio::atomic_write;

#[derive(Debug, Error)]
pub enum PresetError {
    #[error("failed to write preset")]
    Io(#[from] std::io::Error),
    #[error("failed to serialise preset")]
    Json(#[from] serde_json::Error),
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),
}

/// A saved snapshot of one strategy's pipeline parameters:
/// phase → parameter name → value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub strategy_key: String,
    pub created_at: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
}

/// Stores presets as one JSON file each under a presets directory.
/// Overwriting an existing preset keeps a `.bak` copy of the old file.
pub struct PresetManager {
    presets_dir: PathBuf,
}

impl PresetManager {
    pub fn new(presets_dir: impl Into<PathBuf>) -> Self {
        Self {
            presets_dir: presets_dir.into(),
        }
    }

    /// Snapshot the current registry state for one strategy.
    pub fn from_registry(
        name: impl Into<String>,
        description: impl Into<String>,
        strategy_key: &str,
        registry: &ParameterRegistry,
    ) -> Result<Preset, PresetError> {
        let strategy = registry
            .strategy(strategy_key)
            .ok_or_else(|| PresetError::UnknownStrategy(strategy_key.to_string()))?;

        let mut parameters: BTreeMap<String, BTreeMap<String, serde_yaml::Value>> =
            BTreeMap::new();
        for phase in PipelinePhase::ALL {
            let Some(phase_params) = strategy.phase(phase) else {
                continue;
            };
            let entry = parameters.entry(phase.as_str().to_string()).or_default();
            for (param_name, source) in phase_params.iter() {
                entry.insert(param_name.clone(), source.value.clone());
            }
        }

        Ok(Preset {
            name: name.into(),
            description: description.into(),
            strategy_key: strategy_key.to_string(),
            created_at: Utc::now().to_rfc3339(),
            parameters,
        })
    }

    /// Apply a preset through the registry's normal update path, one
    /// parameter at a time. Returns the success of each
    /// `"phase.parameter"`; partial failure is reported, not rolled back.
    pub fn apply_to_registry(
        preset: &Preset,
        registry: &mut ParameterRegistry,
    ) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();

        for (phase_name, params) in &preset.parameters {
            let Some(phase) = PipelinePhase::from_str(phase_name) else {
                tracing::warn!(phase = %phase_name, "unknown phase in preset, skipping");
                continue;
            };
            for (param_name, value) in params {
                let ok = registry.update_parameter(
                    &preset.strategy_key,
                    phase,
                    param_name,
                    value.clone(),
                );
                results.insert(format!("{phase_name}.{param_name}"), ok);
            }
        }
        results
    }

    /// Persist a preset, backing up any file being replaced.
    pub fn save(&self, preset: &Preset) -> Result<PathBuf, PresetError> {
        std::fs::create_dir_all(&self.presets_dir)?;

        let filename = format!(
            "{}_{}.json",
            safe_filename(&preset.name),
            safe_filename(&preset.strategy_key)
        );
        let path = self.presets_dir.join(filename);

        if path.exists() {
            let backup = path.with_extension("json.bak");
            std::fs::copy(&path, &backup)?;
            tracing::debug!(backup = %backup.display(), "backed up existing preset");
        }

        let json = serde_json::to_vec_pretty(preset)?;
        atomic_write(&path, &json)?;
        tracing::info!(path = %path.display(), "preset saved");
        Ok(path)
    }

    /// Load a preset by name (or exact filename), optionally filtered by
    /// strategy.
    pub fn load(&self, name: &str, strategy_key: Option<&str>) -> Option<Preset> {
        if name.ends_with(".json") {
            let path = self.presets_dir.join(name);
            if path.exists() {
                return load_file(&path);
            }
        }

        self.list_all().into_iter().find(|preset| {
            preset.name == name
                && strategy_key.is_none_or(|key| preset.strategy_key == key)
        })
    }

    pub fn list_all(&self) -> Vec<Preset> {
        let Ok(entries) = std::fs::read_dir(&self.presets_dir) else {
            return Vec::new();
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "json")
                    && !p.to_string_lossy().ends_with(".json.bak")
            })
            .collect();
        paths.sort();

        paths.iter().filter_map(|p| load_file(p)).collect()
    }

    pub fn list_for_strategy(&self, strategy_key: &str) -> Vec<Preset> {
        self.list_all()
            .into_iter()
            .filter(|p| p.strategy_key == strategy_key)
            .collect()
    }

    /// Delete a preset by name. Returns true if a file was removed.
    pub fn delete(&self, name: &str) -> Result<bool, PresetError> {
        let Ok(entries) = std::fs::read_dir(&self.presets_dir) else {
            return Ok(false);
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(preset) = load_file(&path) {
                    if preset.name == name {
                        std::fs::remove_file(&path)?;
                        tracing::info!(path = %path.display(), "preset deleted");
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }
}

fn load_file(path: &Path) -> Option<Preset> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(preset) => Some(preset),
        Err(err) => {
            tracing::error!(path = %path.display(), %err, "failed to parse preset");
            None
        }
    }
}

/// Keep alphanumerics, `-` and `_`; everything else becomes `_`.
fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

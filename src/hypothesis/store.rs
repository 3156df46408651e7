use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use super::models::{Hypothesis, HypothesisBatch, HypothesisStatus};
use crate::fsio::atomic_write;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write hypothesis store")]
    Io(#[from] std::io::Error),
    #[error("failed to serialise hypothesis store")]
    Json(#[from] serde_json::Error),
}

const STORE_VERSION: u32 = 1;

#[derive(Default)]
struct Inner {
    hypotheses: BTreeMap<String, Hypothesis>,
    batches: BTreeMap<String, HypothesisBatch>,
}

/// JSON-backed store for hypotheses and batches.
///
/// The whole store is one document (`{version, updated_at, hypotheses,
/// batches}`) rewritten atomically on every save: readers observe either the
/// prior or the new file, never a torn one. Malformed records are skipped on
/// load with a warning rather than failing the whole store.
pub struct HypothesisStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl HypothesisStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let inner = Mutex::new(load_file(&path));
        Self { path, inner }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn save(&self, hypothesis: &Hypothesis) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner
            .hypotheses
            .insert(hypothesis.id.clone(), hypothesis.clone());
        self.persist(&inner)?;
        tracing::debug!(id = %hypothesis.id, name = %hypothesis.name(), "saved hypothesis");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Hypothesis> {
        self.inner.lock().expect("store lock").hypotheses.get(id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Hypothesis> {
        self.inner
            .lock()
            .expect("store lock")
            .hypotheses
            .values()
            .find(|h| h.name() == name)
            .cloned()
    }

    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        if inner.hypotheses.remove(id).is_none() {
            return Ok(false);
        }
        self.persist(&inner)?;
        tracing::info!(id, "deleted hypothesis");
        Ok(true)
    }

    /// All hypotheses, newest first.
    pub fn list_all(&self) -> Vec<Hypothesis> {
        let inner = self.inner.lock().expect("store lock");
        let mut all: Vec<Hypothesis> = inner.hypotheses.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub fn list_completed(&self) -> Vec<Hypothesis> {
        self.list_all()
            .into_iter()
            .filter(Hypothesis::is_completed)
            .collect()
    }

    pub fn get_by_strategy(&self, strategy: &str) -> Vec<Hypothesis> {
        self.list_completed()
            .into_iter()
            .filter(|h| h.config.strategy_type.eq_ignore_ascii_case(strategy))
            .collect()
    }

    pub fn get_by_tag(&self, tag: &str) -> Vec<Hypothesis> {
        self.list_all()
            .into_iter()
            .filter(|h| h.tags.iter().any(|t| t == tag))
            .collect()
    }

    /// Best completed hypotheses by composite score, requiring a minimum
    /// trade count for statistical standing.
    pub fn best_overall(&self, limit: usize, min_trades: usize) -> Vec<Hypothesis> {
        let mut candidates: Vec<Hypothesis> = self
            .list_completed()
            .into_iter()
            .filter(|h| {
                h.score.is_some()
                    && h.result_summary
                        .as_ref()
                        .is_some_and(|s| s.total_trades >= min_trades)
            })
            .collect();
        candidates.sort_by(|a, b| {
            let score_a = a.score.map_or(0.0, |s| s.total_score());
            let score_b = b.score.map_or(0.0, |s| s.total_score());
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(limit);
        candidates
    }

    pub fn save_batch(&self, batch: &HypothesisBatch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.batches.insert(batch.name.clone(), batch.clone());
        self.persist(&inner)
    }

    pub fn get_batch(&self, name: &str) -> Option<HypothesisBatch> {
        self.inner.lock().expect("store lock").batches.get(name).cloned()
    }

    pub fn list_batches(&self) -> Vec<HypothesisBatch> {
        self.inner
            .lock()
            .expect("store lock")
            .batches
            .values()
            .cloned()
            .collect()
    }

    pub fn batch_hypotheses(&self, batch_name: &str) -> Vec<Hypothesis> {
        let Some(batch) = self.get_batch(batch_name) else {
            return Vec::new();
        };
        batch
            .hypothesis_ids
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let all = self.list_all();
        let completed = all.iter().filter(|h| h.is_completed()).count();
        let draft = all
            .iter()
            .filter(|h| h.status == HypothesisStatus::Draft)
            .count();
        let failed = all
            .iter()
            .filter(|h| h.status == HypothesisStatus::Failed)
            .count();

        let mut by_strategy: BTreeMap<String, usize> = BTreeMap::new();
        for h in &all {
            *by_strategy
                .entry(h.config.strategy_type.clone())
                .or_insert(0) += 1;
        }

        StoreStats {
            total_hypotheses: all.len(),
            completed,
            draft,
            failed,
            by_strategy,
            total_batches: self.inner.lock().expect("store lock").batches.len(),
        }
    }

    pub fn clear_all(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.hypotheses.clear();
        inner.batches.clear();
        self.persist(&inner)?;
        tracing::warn!("cleared all hypotheses from store");
        Ok(())
    }

    fn persist(&self, inner: &Inner) -> Result<(), StoreError> {
        let document = serde_json::json!({
            "version": STORE_VERSION,
            "updated_at": Utc::now().to_rfc3339(),
            "hypotheses": inner.hypotheses.values().collect::<Vec<_>>(),
            "batches": inner.batches.values().collect::<Vec<_>>(),
        });
        let bytes = serde_json::to_vec_pretty(&document)?;
        atomic_write(&self.path, &bytes)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoreStats {
    pub total_hypotheses: usize,
    pub completed: usize,
    pub draft: usize,
    pub failed: usize,
    pub by_strategy: BTreeMap<String, usize>,
    pub total_batches: usize,
}

fn load_file(path: &Path) -> Inner {
    let mut inner = Inner::default();

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "hypothesis store not found, starting fresh");
            return inner;
        }
        Err(err) => {
            tracing::error!(path = %path.display(), %err, "failed to read hypothesis store");
            return inner;
        }
    };

    let document: Value = match serde_json::from_str(&raw) {
        Ok(document) => document,
        Err(err) => {
            tracing::error!(path = %path.display(), %err, "failed to parse hypothesis store");
            return inner;
        }
    };

    for record in document
        .get("hypotheses")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        match serde_json::from_value::<Hypothesis>(record.clone()) {
            Ok(hypothesis) => {
                inner.hypotheses.insert(hypothesis.id.clone(), hypothesis);
            }
            Err(err) => tracing::warn!(%err, "skipping malformed hypothesis record"),
        }
    }

    for record in document
        .get("batches")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        match serde_json::from_value::<HypothesisBatch>(record.clone()) {
            Ok(batch) => {
                inner.batches.insert(batch.name.clone(), batch);
            }
            Err(err) => tracing::warn!(%err, "skipping malformed batch record"),
        }
    }

    tracing::info!(
        path = %path.display(),
        hypotheses = inner.hypotheses.len(),
        batches = inner.batches.len(),
        "loaded hypothesis store"
    );
    inner
}

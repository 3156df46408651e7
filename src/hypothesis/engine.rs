use chrono::Utc;
use rayon::prelude::*;

use super::models::{
    Hypothesis, HypothesisBatch, HypothesisConfig, HypothesisScore, HypothesisStatus,
    ResultSummary,
};
use super::store::HypothesisStore;
use crate::engine::core::BacktestEngine;

/// Runs hypotheses through the backtest engine, scoring and persisting the
/// outcomes. The store is injected; there is no process-wide default.
pub struct HypothesisEngine {
    store: HypothesisStore,
}

impl HypothesisEngine {
    pub fn new(store: HypothesisStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &HypothesisStore {
        &self.store
    }

    /// Create and persist a Draft hypothesis.
    pub fn create_hypothesis(&self, config: HypothesisConfig, tags: Vec<String>) -> Hypothesis {
        let mut hypothesis = Hypothesis::new(config);
        hypothesis.tags = tags;
        if let Err(err) = self.store.save(&hypothesis) {
            tracing::error!(%err, "failed to persist new hypothesis");
        }
        hypothesis
    }

    /// Run a hypothesis to completion. Failures (including cancellation)
    /// mark it Failed with an error message; a batch caller just moves on.
    pub fn run(&self, mut hypothesis: Hypothesis) -> Hypothesis {
        tracing::info!(id = %hypothesis.id, name = %hypothesis.name(), "running hypothesis");

        hypothesis.status = HypothesisStatus::Running;
        hypothesis.run_at = Some(Utc::now());
        if let Err(err) = self.store.save(&hypothesis) {
            tracing::error!(%err, "failed to persist running status");
        }

        let config = hypothesis.config.to_backtest_config();
        match BacktestEngine::new(config).run() {
            Ok(result) => {
                hypothesis.score = result.combined_metrics.as_ref().map(|metrics| {
                    let date_range_days =
                        (hypothesis.config.end_date - hypothesis.config.start_date).num_days();
                    HypothesisScore::from_metrics(
                        metrics,
                        result.degradation_score.unwrap_or(0.0),
                        metrics.total_trades,
                        date_range_days,
                    )
                });
                hypothesis.result_summary = Some(ResultSummary::from_result(&result));
                hypothesis.result = Some(result);
                hypothesis.status = HypothesisStatus::Completed;
                hypothesis.error_message = None;

                tracing::info!(
                    id = %hypothesis.id,
                    trades = hypothesis.result_summary.as_ref().map_or(0, |s| s.total_trades),
                    score = hypothesis.score.map(|s| s.total_score()),
                    "hypothesis completed"
                );
            }
            Err(err) => {
                tracing::error!(id = %hypothesis.id, %err, "hypothesis failed");
                hypothesis.status = HypothesisStatus::Failed;
                hypothesis.error_message = Some(err.to_string());
            }
        }

        if let Err(err) = self.store.save(&hypothesis) {
            tracing::error!(%err, "failed to persist hypothesis result");
        }
        hypothesis
    }

    pub fn run_by_id(&self, id: &str) -> Option<Hypothesis> {
        let hypothesis = self.store.get(id)?;
        Some(self.run(hypothesis))
    }

    pub fn run_by_name(&self, name: &str) -> Option<Hypothesis> {
        let hypothesis = self.store.get_by_name(name)?;
        Some(self.run(hypothesis))
    }

    /// Clone an existing hypothesis into a fresh Draft.
    pub fn clone_hypothesis(&self, id: &str, new_name: Option<&str>) -> Option<Hypothesis> {
        let source = self.store.get(id)?;
        let clone = source.clone_as_draft(new_name);
        if let Err(err) = self.store.save(&clone) {
            tracing::error!(%err, "failed to persist cloned hypothesis");
        }
        tracing::info!(
            source = %source.id,
            clone = %clone.id,
            name = %clone.name(),
            "cloned hypothesis"
        );
        Some(clone)
    }

    /// Update a hypothesis configuration. A Completed hypothesis loses its
    /// results and reverts to Draft. Destructive, so it is logged loudly.
    pub fn update_hypothesis(
        &self,
        id: &str,
        updates: &[(String, serde_json::Value)],
    ) -> Option<Hypothesis> {
        let mut hypothesis = self.store.get(id)?;

        if hypothesis.status == HypothesisStatus::Completed {
            tracing::warn!(
                id = %hypothesis.id,
                name = %hypothesis.name(),
                "updating completed hypothesis: results cleared, reverting to draft"
            );
        }
        hypothesis.clear_results();

        for (field, value) in updates {
            if !hypothesis.config.set_field(field, value) {
                tracing::warn!(field, "ignoring unknown or mistyped update field");
            }
        }

        if let Err(err) = self.store.save(&hypothesis) {
            tracing::error!(%err, "failed to persist updated hypothesis");
        }
        Some(hypothesis)
    }

    /// Sweep one parameter across a set of values. Children are created
    /// up front, run on the rayon pool (independent configurations share
    /// only read-only data), and collected into a batch record in value
    /// order.
    pub fn run_batch(
        &self,
        batch_name: &str,
        base_config: &HypothesisConfig,
        vary_parameter: &str,
        values: &[serde_json::Value],
    ) -> HypothesisBatch {
        let children: Vec<Hypothesis> = values
            .iter()
            .map(|value| {
                let mut config = base_config.clone();
                if !config.set_field(vary_parameter, value) {
                    tracing::warn!(
                        parameter = vary_parameter,
                        ?value,
                        "batch value did not apply cleanly"
                    );
                }
                config.name = format!("{batch_name}_{vary_parameter}_{value}");
                self.create_hypothesis(config, vec![batch_name.to_string()])
            })
            .collect();

        let ids: Vec<String> = children.iter().map(|h| h.id.clone()).collect();

        children.into_par_iter().for_each(|hypothesis| {
            self.run(hypothesis);
        });

        let batch = HypothesisBatch {
            name: batch_name.to_string(),
            description: format!("varying {vary_parameter} across {} values", values.len()),
            created_at: Utc::now(),
            hypothesis_ids: ids,
            varied_parameter: Some(vary_parameter.to_string()),
            varied_values: values.to_vec(),
        };
        if let Err(err) = self.store.save_batch(&batch) {
            tracing::error!(%err, "failed to persist batch record");
        }

        tracing::info!(
            batch = batch_name,
            hypotheses = batch.hypothesis_ids.len(),
            "batch complete"
        );
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::path::Path;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn engine(dir: &Path) -> HypothesisEngine {
        HypothesisEngine::new(HypothesisStore::new(dir.join("hypotheses.json")))
    }

    // No data files exist for these configs, so runs complete with an
    // empty, invalid result, the failure-tolerant path batches exercise.
    fn test_config() -> HypothesisConfig {
        HypothesisConfig::new("test", ymd(2024, 1, 1), ymd(2024, 6, 30))
    }

    #[test]
    fn create_persists_draft() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let h = engine.create_hypothesis(
            test_config(),
            vec!["smoke".to_string()],
        );

        let loaded = engine.store().get(&h.id).unwrap();
        assert_eq!(loaded.status, HypothesisStatus::Draft);
        assert_eq!(loaded.tags, vec!["smoke".to_string()]);
    }

    #[test]
    fn run_with_no_data_completes_with_invalid_result() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let h = engine.create_hypothesis(test_config(), vec![]);

        let finished = engine.run(h);
        // No data is not an execution failure: the result is simply invalid.
        assert_eq!(finished.status, HypothesisStatus::Completed);
        let summary = finished.result_summary.unwrap();
        assert!(!summary.is_valid);
        assert_eq!(summary.total_trades, 0);
    }

    #[test]
    fn run_by_id_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        assert!(engine.run_by_id("deadbeef").is_none());
    }

    #[test]
    fn clone_produces_fresh_draft() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let original = engine.create_hypothesis(test_config(), vec![]);

        let clone = engine.clone_hypothesis(&original.id, Some("variant")).unwrap();
        assert_ne!(clone.id, original.id);
        assert_eq!(clone.config.name, "variant");
        assert_eq!(clone.status, HypothesisStatus::Draft);
        assert!(engine.store().get(&clone.id).is_some());
    }

    #[test]
    fn update_completed_reverts_to_draft() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let h = engine.create_hypothesis(test_config(), vec![]);
        let completed = engine.run(h);
        assert_eq!(completed.status, HypothesisStatus::Completed);

        let updated = engine
            .update_hypothesis(
                &completed.id,
                &[("iv_percentile_min".to_string(), json!(75.0))],
            )
            .unwrap();

        assert_eq!(updated.status, HypothesisStatus::Draft);
        assert_eq!(updated.config.iv_percentile_min, 75.0);
        assert!(updated.result_summary.is_none());
        assert!(updated.score.is_none());
    }

    #[test]
    fn batch_creates_children_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let base = test_config();

        let values = vec![json!(60.0), json!(70.0), json!(80.0)];
        let batch = engine.run_batch("iv_scan", &base, "iv_percentile_min", &values);

        assert_eq!(batch.hypothesis_ids.len(), 3);
        assert_eq!(batch.varied_parameter.as_deref(), Some("iv_percentile_min"));

        let children = engine.store().batch_hypotheses("iv_scan");
        assert_eq!(children.len(), 3);
        for child in &children {
            // Each child ran to completion despite the empty data set.
            assert_eq!(child.status, HypothesisStatus::Completed);
            assert!(child.config.name.starts_with("iv_scan_iv_percentile_min_"));
        }
        let thresholds: Vec<f64> = children
            .iter()
            .map(|c| c.config.iv_percentile_min)
            .collect();
        assert!(thresholds.contains(&60.0));
        assert!(thresholds.contains(&80.0));
    }
}

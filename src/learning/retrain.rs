//! Retrain orchestration.
//!
//! Gates on outcome volume, trains a candidate model, compares it to
//! the serving model on the primary metric, and promotes only when the
//! regression gate passes. A failed retrain never disturbs the model
//! already in service.

use super::trainer::{self, Dataset, TrainConfig};
use crate::features::training_feature_names;
use crate::models::Outcome;
use crate::outcomes::OutcomesStore;
use crate::registry::{ModelRegistry, ModelType, LATEST};
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Tolerated regression when comparing candidate to serving model:
/// conversion may lose up to 0.01 AUC; regressors may gain up to 1%
/// RMSE.
const AUC_TOLERANCE: f64 = 0.01;
const RMSE_TOLERANCE_RATIO: f64 = 1.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainAction {
    Deployed,
    TrainedNotDeployed,
    Skipped,
    Failed,
}

impl RetrainAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrainAction::Deployed => "deployed",
            RetrainAction::TrainedNotDeployed => "trained_not_deployed",
            RetrainAction::Skipped => "skipped",
            RetrainAction::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelComparison {
    pub metric: String,
    pub previous: f64,
    pub new: f64,
    pub within_tolerance: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrainReport {
    pub property_id: String,
    pub model_type: ModelType,
    pub action: RetrainAction,
    pub reason: String,
    pub metrics: HashMap<String, f64>,
    pub comparison: Option<ModelComparison>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSummary {
    pub total: usize,
    pub deployed: usize,
    pub trained_not_deployed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub reports: Vec<RetrainReport>,
}

pub struct RetrainOrchestrator {
    store: Arc<OutcomesStore>,
    registry: Arc<ModelRegistry>,
    min_total_outcomes: usize,
    min_new_outcomes: usize,
    train_config: TrainConfig,
}

impl RetrainOrchestrator {
    pub fn new(
        store: Arc<OutcomesStore>,
        registry: Arc<ModelRegistry>,
        min_total_outcomes: usize,
        min_new_outcomes: usize,
    ) -> Self {
        Self {
            store,
            registry,
            min_total_outcomes,
            min_new_outcomes,
            train_config: TrainConfig::default(),
        }
    }

    pub fn with_train_config(mut self, train_config: TrainConfig) -> Self {
        self.train_config = train_config;
        self
    }

    /// Volume gate: enough total history and enough fresh outcomes in
    /// the last 7 days.
    fn gate(&self, property_id: &str) -> Result<(bool, String)> {
        let stats = self.store.stats(property_id)?;
        if !stats.exists {
            return Ok((false, format!("no outcomes found for property {property_id}")));
        }
        if stats.total_records < self.min_total_outcomes {
            return Ok((
                false,
                format!(
                    "insufficient total outcomes ({} < {})",
                    stats.total_records, self.min_total_outcomes
                ),
            ));
        }
        if stats.last_7_days < self.min_new_outcomes {
            return Ok((
                false,
                format!(
                    "insufficient new outcomes ({} < {} in last 7 days)",
                    stats.last_7_days, self.min_new_outcomes
                ),
            ));
        }
        Ok((
            true,
            format!(
                "{} total outcomes, {} new in last 7 days",
                stats.total_records, stats.last_7_days
            ),
        ))
    }

    fn target_for(outcome: &Outcome, model_type: ModelType) -> Option<f64> {
        match model_type {
            ModelType::Conversion => Some(if outcome.accepted { 1.0 } else { 0.0 }),
            // ADR regresses realized rates, so only booked outcomes count.
            ModelType::Adr => outcome.final_price.filter(|_| outcome.accepted),
            ModelType::Revpar => Some(if outcome.accepted {
                outcome.final_price.unwrap_or(outcome.quoted_price)
            } else {
                0.0
            }),
        }
    }

    /// Build the training matrix from stored outcome context snapshots.
    fn build_dataset(&self, property_id: &str, model_type: ModelType) -> Result<Dataset> {
        let outcomes = self.store.query(property_id, None, None, None)?;
        let feature_names: Vec<String> = training_feature_names()
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut rows = Vec::new();
        let mut targets = Vec::new();
        for outcome in &outcomes {
            let Some(target) = Self::target_for(outcome, model_type) else {
                continue;
            };
            let row: Vec<f64> = feature_names
                .iter()
                .map(|name| {
                    outcome
                        .context
                        .as_ref()
                        .and_then(|c| c.get(name))
                        .and_then(|v| v.as_f64())
                        .filter(|v| v.is_finite())
                        .unwrap_or(0.0)
                })
                .collect();
            rows.push(row);
            targets.push(target);
        }

        Ok(Dataset {
            feature_names,
            rows,
            targets,
        })
    }

    /// Retrain one (property, model type). Never errors: failures are
    /// reported as `Failed` and the serving model stays in place.
    pub async fn retrain(&self, property_id: &str, model_type: ModelType) -> RetrainReport {
        match self.try_retrain(property_id, model_type).await {
            Ok(report) => report,
            Err(err) => {
                warn!(property_id, %model_type, error = %err, "Retrain failed");
                RetrainReport {
                    property_id: property_id.to_string(),
                    model_type,
                    action: RetrainAction::Failed,
                    reason: err.to_string(),
                    metrics: HashMap::new(),
                    comparison: None,
                    version: None,
                }
            }
        }
    }

    async fn try_retrain(&self, property_id: &str, model_type: ModelType) -> Result<RetrainReport> {
        let (passes, gate_reason) = self.gate(property_id)?;
        if !passes {
            info!(property_id, %model_type, reason = %gate_reason, "Retrain skipped");
            return Ok(RetrainReport {
                property_id: property_id.to_string(),
                model_type,
                action: RetrainAction::Skipped,
                reason: gate_reason,
                metrics: HashMap::new(),
                comparison: None,
                version: None,
            });
        }

        info!(property_id, %model_type, reason = %gate_reason, "Retraining");

        let dataset = self.build_dataset(property_id, model_type)?;
        let trained = trainer::train(&dataset, model_type, &self.train_config)?;

        // Compare against the serving model, when there is one.
        let previous = self
            .registry
            .load(property_id, model_type, LATEST, false)
            .await
            .unwrap_or_else(|err| {
                warn!(property_id, %model_type, error = %err, "Could not load previous model for comparison");
                None
            });

        let metric_name = model_type.primary_metric();
        let new_value = trained.metrics.get(metric_name).copied().unwrap_or(0.0);

        let comparison = previous.as_ref().and_then(|prev| {
            let prev_value = prev.metadata.metrics.get(metric_name).copied()?;
            let within_tolerance = match model_type {
                ModelType::Conversion => new_value >= prev_value - AUC_TOLERANCE,
                ModelType::Adr | ModelType::Revpar => {
                    new_value <= prev_value * RMSE_TOLERANCE_RATIO
                }
            };
            Some(ModelComparison {
                metric: metric_name.to_string(),
                previous: prev_value,
                new: new_value,
                within_tolerance,
            })
        });

        if let Some(ref cmp) = comparison {
            if !cmp.within_tolerance {
                warn!(
                    property_id,
                    %model_type,
                    previous = cmp.previous,
                    new = cmp.new,
                    "Candidate regressed past tolerance, not deploying"
                );
                return Ok(RetrainReport {
                    property_id: property_id.to_string(),
                    model_type,
                    action: RetrainAction::TrainedNotDeployed,
                    reason: format!(
                        "candidate {metric_name} {:.4} regressed past serving {:.4}",
                        cmp.new, cmp.previous
                    ),
                    metrics: trained.metrics,
                    comparison,
                    version: None,
                });
            }
        }

        let metadata = self.registry.save_artifact(
            property_id,
            model_type,
            &trained.model,
            dataset.feature_names.clone(),
            trained.metrics.clone(),
            trained.feature_importance,
        )?;
        self.registry
            .promote_latest(property_id, model_type, &metadata.version)?;

        Ok(RetrainReport {
            property_id: property_id.to_string(),
            model_type,
            action: RetrainAction::Deployed,
            reason: format!("deployed version {}", metadata.version),
            metrics: trained.metrics,
            comparison,
            version: Some(metadata.version),
        })
    }

    /// All-properties sweep. Drift-flagged properties go first but pass
    /// through the same gate as everything else.
    pub async fn sweep(&self, model_type: ModelType, priority: &[String]) -> SweepSummary {
        let mut properties = match self.store.list_properties() {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "Sweep could not list properties");
                return SweepSummary::default();
            }
        };
        properties.sort_by_key(|p| !priority.contains(p));

        let mut summary = SweepSummary {
            total: properties.len(),
            ..SweepSummary::default()
        };

        for property_id in &properties {
            let report = self.retrain(property_id, model_type).await;
            match report.action {
                RetrainAction::Deployed => summary.deployed += 1,
                RetrainAction::TrainedNotDeployed => summary.trained_not_deployed += 1,
                RetrainAction::Skipped => summary.skipped += 1,
                RetrainAction::Failed => summary.failed += 1,
            }
            summary.reports.push(report);
        }

        info!(
            total = summary.total,
            deployed = summary.deployed,
            trained_not_deployed = summary.trained_not_deployed,
            skipped = summary.skipped,
            failed = summary.failed,
            "Retrain sweep complete"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn synthetic_outcome(i: usize, days_ago: i64) -> Outcome {
        let occupancy = (i % 10) as f64 / 10.0;
        let accepted = occupancy > 0.5;
        Outcome {
            property_id: "p1".to_string(),
            timestamp: Utc::now() - Duration::days(days_ago) + Duration::seconds(i as i64),
            stay_date: None,
            quoted_price: 100.0 + i as f64 % 50.0,
            accepted,
            final_price: accepted.then_some(100.0 + i as f64 % 50.0),
            context: Some(json!({
                "occupancy_rate": occupancy,
                "lead_time": (i % 30) as f64,
                "is_weekend": (i % 2) as f64,
            })),
            action_id: None,
        }
    }

    fn seeded_store(total: usize, recent: usize) -> Arc<OutcomesStore> {
        let store = Arc::new(OutcomesStore::in_memory().unwrap());
        let old: Vec<Outcome> = (0..total - recent)
            .map(|i| synthetic_outcome(i, 20))
            .collect();
        let fresh: Vec<Outcome> = (total - recent..total)
            .map(|i| synthetic_outcome(i, 1))
            .collect();
        store.append("p1", &old).unwrap();
        store.append("p1", &fresh).unwrap();
        store
    }

    fn orchestrator(
        store: Arc<OutcomesStore>,
        registry: Arc<ModelRegistry>,
        min_total: usize,
        min_new: usize,
    ) -> RetrainOrchestrator {
        RetrainOrchestrator::new(store, registry, min_total, min_new)
    }

    #[tokio::test]
    async fn test_gate_skips_thin_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(50, 10);
        let registry = Arc::new(ModelRegistry::new(dir.path()).unwrap());

        let report = orchestrator(store, registry, 1000, 100)
            .retrain("p1", ModelType::Conversion)
            .await;

        assert_eq!(report.action, RetrainAction::Skipped);
        assert!(report.reason.contains("insufficient total outcomes"));
    }

    #[tokio::test]
    async fn test_gate_requires_fresh_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(200, 5);
        let registry = Arc::new(ModelRegistry::new(dir.path()).unwrap());

        let report = orchestrator(store, registry, 100, 50)
            .retrain("p1", ModelType::Conversion)
            .await;

        assert_eq!(report.action, RetrainAction::Skipped);
        assert!(report.reason.contains("insufficient new outcomes"));
    }

    #[tokio::test]
    async fn test_first_train_deploys() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(300, 150);
        let registry = Arc::new(ModelRegistry::new(dir.path()).unwrap());

        let report = orchestrator(store, registry.clone(), 100, 50)
            .retrain("p1", ModelType::Conversion)
            .await;

        assert_eq!(report.action, RetrainAction::Deployed, "{}", report.reason);
        assert!(report.version.is_some());
        assert!(report.metrics.contains_key("auc"));

        let loaded = registry
            .load("p1", ModelType::Conversion, LATEST, true)
            .await
            .unwrap();
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn test_regressed_candidate_not_deployed() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(300, 150);
        let registry = Arc::new(ModelRegistry::new(dir.path()).unwrap());

        // Serving model claims a perfect AUC no candidate can match.
        let metadata = registry
            .save_artifact(
                "p1",
                ModelType::Conversion,
                &crate::registry::LinearModel {
                    weights: vec![0.0; training_feature_names().len()],
                    bias: 0.0,
                    link: crate::registry::LinkFunction::Logistic,
                },
                training_feature_names().iter().map(|s| s.to_string()).collect(),
                HashMap::from([("auc".to_string(), 1.0)]),
                HashMap::new(),
            )
            .unwrap();
        registry
            .promote_latest("p1", ModelType::Conversion, &metadata.version)
            .unwrap();

        let report = orchestrator(store, registry.clone(), 100, 50)
            .retrain("p1", ModelType::Conversion)
            .await;

        // Candidate AUC will be below 0.99, so the gate holds the old model.
        if report.action == RetrainAction::Deployed {
            // Only acceptable if the candidate really cleared the bar.
            assert!(report.comparison.unwrap().new >= 0.99);
        } else {
            assert_eq!(report.action, RetrainAction::TrainedNotDeployed);
            let serving = registry
                .load("p1", ModelType::Conversion, LATEST, false)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(serving.metadata.version, metadata.version);
        }
    }

    #[tokio::test]
    async fn test_sweep_summarizes() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(300, 150);
        // A second property with too little data to pass the gate.
        store
            .append("p2", &{
                let mut o = synthetic_outcome(1, 1);
                o.property_id = "p2".to_string();
                vec![o]
            })
            .unwrap();
        let registry = Arc::new(ModelRegistry::new(dir.path()).unwrap());

        let summary = orchestrator(store, registry, 100, 50)
            .sweep(ModelType::Conversion, &[])
            .await;

        assert_eq!(summary.total, 2);
        assert_eq!(summary.deployed, 1);
        assert_eq!(summary.skipped, 1);
    }
}

//! A/B testing framework for pricing policies.
//!
//! Deterministically routes traffic between the ML and rule-based
//! pricing paths, records per-decision results, and compares variants
//! with Welch two-sample t-tests.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pricing policy variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Ml,
    RuleBased,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Ml => "ml",
            Variant::RuleBased => "rule_based",
        }
    }
}

/// Identity used for deterministic variant assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomizationUnit {
    Property,
    User,
    Session,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub experiment_id: String,
    pub name: String,
    pub description: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Share of traffic routed to the ML variant, 0..=100.
    pub ml_traffic_percentage: f64,
    pub is_active: bool,
    pub randomization_unit: RandomizationUnit,
    pub metrics: Vec<String>,
}

/// One logged pricing decision with its eventual outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub experiment_id: String,
    pub timestamp: DateTime<Utc>,
    pub property_id: String,
    pub user_id: String,
    pub variant: Variant,
    pub price_quoted: f64,
    pub was_booked: bool,
    pub revenue: Option<f64>,
    pub lead_days: i64,
    pub los: u32,
    pub occupancy_rate: f64,
}

/// Routing decision for one request.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub experiment_id: String,
    pub variant: Variant,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VariantMetrics {
    pub count: usize,
    pub bookings: usize,
    pub conversion_rate: f64,
    pub adr: f64,
    pub revpar: f64,
    pub avg_price: f64,
    pub total_revenue: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiftSummary {
    pub conversion_rate: f64,
    pub adr: f64,
    pub revpar: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignificanceSummary {
    pub conversion_pvalue: Option<f64>,
    pub revpar_pvalue: Option<f64>,
    pub is_significant: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantComparison {
    pub experiment_id: String,
    pub ml: VariantMetrics,
    pub rule_based: VariantMetrics,
    pub lift: LiftSummary,
    pub significance: SignificanceSummary,
}

/// Experiment table plus the result log. Read-mostly: assignment takes
/// a read lock, experiment lifecycle changes take the write lock.
pub struct AbFramework {
    experiments: RwLock<HashMap<String, ExperimentConfig>>,
    results: RwLock<Vec<ExperimentResult>>,
}

impl Default for AbFramework {
    fn default() -> Self {
        Self::new()
    }
}

impl AbFramework {
    pub fn new() -> Self {
        Self {
            experiments: RwLock::new(HashMap::new()),
            results: RwLock::new(Vec::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_experiment(
        &self,
        name: &str,
        description: &str,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        ml_traffic_percentage: f64,
        randomization_unit: RandomizationUnit,
        metrics: Option<Vec<String>>,
    ) -> String {
        let experiment_id = Uuid::new_v4().simple().to_string()[..8].to_string();

        let config = ExperimentConfig {
            experiment_id: experiment_id.clone(),
            name: name.to_string(),
            description: description.to_string(),
            start_date,
            end_date,
            ml_traffic_percentage: ml_traffic_percentage.clamp(0.0, 100.0),
            is_active: true,
            randomization_unit,
            metrics: metrics
                .unwrap_or_else(|| vec!["conversion".into(), "adr".into(), "revpar".into()]),
        };

        self.experiments
            .write()
            .insert(experiment_id.clone(), config);
        info!(experiment_id, name, "Created experiment");
        experiment_id
    }

    /// Deterministic bucket in 1..=100 for (experiment, key).
    fn bucket(experiment_id: &str, key: &str) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(experiment_id.as_bytes());
        hasher.update(b":");
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(first) % 100 + 1
    }

    /// Assign a variant for a randomization key. Defaults to rule-based
    /// when the experiment is missing, inactive, or outside its window.
    pub fn assign_variant(&self, experiment_id: &str, key: &str) -> Variant {
        let experiments = self.experiments.read();
        let Some(experiment) = experiments.get(experiment_id) else {
            warn!(experiment_id, "Experiment not found, defaulting to rule-based");
            return Variant::RuleBased;
        };

        if !experiment.is_active {
            debug!(experiment_id, "Experiment inactive, defaulting to rule-based");
            return Variant::RuleBased;
        }

        let now = Utc::now();
        if now < experiment.start_date || now > experiment.end_date {
            debug!(experiment_id, "Experiment outside date range");
            return Variant::RuleBased;
        }

        let bucket = Self::bucket(experiment_id, key);
        if bucket as f64 <= experiment.ml_traffic_percentage {
            Variant::Ml
        } else {
            Variant::RuleBased
        }
    }

    fn randomization_key(unit: RandomizationUnit, property_id: &str, user_id: &str) -> String {
        match unit {
            RandomizationUnit::Property => property_id.to_string(),
            RandomizationUnit::User => user_id.to_string(),
            RandomizationUnit::Session => format!("{user_id}_{}", Utc::now().date_naive()),
        }
    }

    /// Routing decision for one request: the first active experiment
    /// (oldest start date wins, id breaks ties) covers it.
    pub fn route(&self, property_id: &str, user_id: &str) -> Option<Assignment> {
        let experiments = self.experiments.read();
        let experiment = experiments
            .values()
            .filter(|e| e.is_active)
            .min_by(|a, b| {
                a.start_date
                    .cmp(&b.start_date)
                    .then_with(|| a.experiment_id.cmp(&b.experiment_id))
            })?
            .clone();
        drop(experiments);

        let key =
            Self::randomization_key(experiment.randomization_unit, property_id, user_id);
        Some(Assignment {
            variant: self.assign_variant(&experiment.experiment_id, &key),
            experiment_id: experiment.experiment_id,
        })
    }

    /// Whether the ML pricing path should serve this (property, user).
    pub fn should_use_ml(
        &self,
        property_id: &str,
        user_id: &str,
        experiment_id: Option<&str>,
    ) -> bool {
        match experiment_id {
            Some(id) => {
                let unit = match self.experiments.read().get(id) {
                    Some(e) => e.randomization_unit,
                    None => return false,
                };
                let key = Self::randomization_key(unit, property_id, user_id);
                self.assign_variant(id, &key) == Variant::Ml
            }
            None => self
                .route(property_id, user_id)
                .map(|a| a.variant == Variant::Ml)
                .unwrap_or(false),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_result(
        &self,
        experiment_id: &str,
        property_id: &str,
        user_id: &str,
        variant: Variant,
        price_quoted: f64,
        was_booked: bool,
        revenue: Option<f64>,
        lead_days: i64,
        los: u32,
        occupancy_rate: f64,
    ) {
        let result = ExperimentResult {
            experiment_id: experiment_id.to_string(),
            timestamp: Utc::now(),
            property_id: property_id.to_string(),
            user_id: user_id.to_string(),
            variant,
            price_quoted,
            was_booked,
            revenue: if was_booked { revenue } else { None },
            lead_days,
            los,
            occupancy_rate,
        };

        self.results.write().push(result);
        debug!(
            experiment_id,
            variant = variant.as_str(),
            price_quoted,
            was_booked,
            "Logged experiment result"
        );
    }

    pub fn calculate_metrics(
        &self,
        experiment_id: &str,
        variant: Option<Variant>,
    ) -> VariantMetrics {
        let results = self.results.read();
        let filtered: Vec<&ExperimentResult> = results
            .iter()
            .filter(|r| {
                r.experiment_id == experiment_id
                    && variant.map(|v| r.variant == v).unwrap_or(true)
            })
            .collect();

        if filtered.is_empty() {
            return VariantMetrics::default();
        }

        let count = filtered.len();
        let bookings = filtered.iter().filter(|r| r.was_booked).count();
        let booked_revenues: Vec<f64> = filtered
            .iter()
            .filter(|r| r.was_booked)
            .filter_map(|r| r.revenue)
            .collect();

        let total_revenue: f64 = booked_revenues.iter().sum();
        let adr = if booked_revenues.is_empty() {
            0.0
        } else {
            total_revenue / booked_revenues.len() as f64
        };
        let avg_price =
            filtered.iter().map(|r| r.price_quoted).sum::<f64>() / count as f64;

        VariantMetrics {
            count,
            bookings,
            conversion_rate: bookings as f64 / count as f64,
            adr,
            revpar: total_revenue / count as f64,
            avg_price,
            total_revenue,
        }
    }

    /// Compare ML vs rule-based with lift and Welch t-tests (alpha 0.05
    /// on conversion).
    pub fn compare(&self, experiment_id: &str) -> VariantComparison {
        let ml = self.calculate_metrics(experiment_id, Some(Variant::Ml));
        let rule_based = self.calculate_metrics(experiment_id, Some(Variant::RuleBased));

        let results = self.results.read();
        let conversions = |variant: Variant| -> Vec<f64> {
            results
                .iter()
                .filter(|r| r.experiment_id == experiment_id && r.variant == variant)
                .map(|r| if r.was_booked { 1.0 } else { 0.0 })
                .collect()
        };
        let revpars = |variant: Variant| -> Vec<f64> {
            results
                .iter()
                .filter(|r| r.experiment_id == experiment_id && r.variant == variant)
                .map(|r| match (r.was_booked, r.revenue) {
                    (true, Some(rev)) => rev / r.los.max(1) as f64,
                    _ => 0.0,
                })
                .collect()
        };

        let conversion_pvalue =
            welch_t_test(&conversions(Variant::Ml), &conversions(Variant::RuleBased));
        let revpar_pvalue = welch_t_test(&revpars(Variant::Ml), &revpars(Variant::RuleBased));

        let lift = |ml_value: f64, rule_value: f64| {
            if rule_value > 0.0 {
                (ml_value - rule_value) / rule_value * 100.0
            } else {
                0.0
            }
        };

        VariantComparison {
            experiment_id: experiment_id.to_string(),
            lift: LiftSummary {
                conversion_rate: lift(ml.conversion_rate, rule_based.conversion_rate),
                adr: lift(ml.adr, rule_based.adr),
                revpar: lift(ml.revpar, rule_based.revpar),
            },
            significance: SignificanceSummary {
                conversion_pvalue,
                revpar_pvalue,
                is_significant: conversion_pvalue.map(|p| p < 0.05).unwrap_or(false),
            },
            ml,
            rule_based,
        }
    }

    pub fn get_experiment(&self, experiment_id: &str) -> Option<ExperimentConfig> {
        self.experiments.read().get(experiment_id).cloned()
    }

    pub fn list_experiments(&self, active_only: bool) -> Vec<ExperimentConfig> {
        self.experiments
            .read()
            .values()
            .filter(|e| !active_only || e.is_active)
            .cloned()
            .collect()
    }

    pub fn stop_experiment(&self, experiment_id: &str) {
        if let Some(experiment) = self.experiments.write().get_mut(experiment_id) {
            experiment.is_active = false;
            info!(experiment_id, "Stopped experiment");
        }
    }

    /// Export the result log for an experiment as JSON.
    pub fn export_results<P: AsRef<Path>>(
        &self,
        experiment_id: &str,
        path: P,
    ) -> anyhow::Result<usize> {
        let results = self.results.read();
        let filtered: Vec<&ExperimentResult> = results
            .iter()
            .filter(|r| r.experiment_id == experiment_id)
            .collect();
        std::fs::write(path.as_ref(), serde_json::to_vec_pretty(&filtered)?)?;
        info!(
            experiment_id,
            count = filtered.len(),
            path = %path.as_ref().display(),
            "Exported experiment results"
        );
        Ok(filtered.len())
    }
}

/// Welch two-sample t-test p-value. `None` when either sample is too
/// small or degenerate for the test to be meaningful.
pub fn welch_t_test(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() < 2 || b.len() < 2 {
        return None;
    }

    let (na, nb) = (a.len() as f64, b.len() as f64);
    let mean = |xs: &[f64]| xs.iter().sum::<f64>() / xs.len() as f64;
    let (ma, mb) = (mean(a), mean(b));
    let var = |xs: &[f64], m: f64| {
        xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() as f64 - 1.0)
    };
    let (va, vb) = (var(a, ma), var(b, mb));

    let se2 = va / na + vb / nb;
    if se2 <= 0.0 {
        return None;
    }

    let t = (ma - mb) / se2.sqrt();
    let df = se2.powi(2)
        / ((va / na).powi(2) / (na - 1.0) + (vb / nb).powi(2) / (nb - 1.0));
    if !df.is_finite() || df <= 0.0 {
        return None;
    }

    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    Some(2.0 * (1.0 - dist.cdf(t.abs())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn active_experiment(framework: &AbFramework, pct: f64) -> String {
        framework.create_experiment(
            "ml-rollout",
            "ML vs rules",
            Utc::now() - Duration::days(1),
            Utc::now() + Duration::days(30),
            pct,
            RandomizationUnit::Property,
            None,
        )
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let framework = AbFramework::new();
        let id = active_experiment(&framework, 50.0);

        let first = framework.assign_variant(&id, "property-1");
        for _ in 0..20 {
            assert_eq!(framework.assign_variant(&id, "property-1"), first);
        }
    }

    #[test]
    fn test_traffic_split_roughly_matches_percentage() {
        let framework = AbFramework::new();
        let id = active_experiment(&framework, 50.0);

        let ml_count = (0..1000)
            .filter(|i| framework.assign_variant(&id, &format!("key-{i}")) == Variant::Ml)
            .count();

        // 50/50 split, generous tolerance.
        assert!(ml_count > 400 && ml_count < 600, "ml_count = {ml_count}");
    }

    #[test]
    fn test_zero_and_full_traffic() {
        let framework = AbFramework::new();
        let none = active_experiment(&framework, 0.0);
        let all = active_experiment(&framework, 100.0);

        for i in 0..50 {
            let key = format!("key-{i}");
            assert_eq!(framework.assign_variant(&none, &key), Variant::RuleBased);
            assert_eq!(framework.assign_variant(&all, &key), Variant::Ml);
        }
    }

    #[test]
    fn test_unknown_experiment_defaults_to_rule_based() {
        let framework = AbFramework::new();
        assert_eq!(
            framework.assign_variant("missing", "key"),
            Variant::RuleBased
        );
    }

    #[test]
    fn test_inactive_experiment_defaults_to_rule_based() {
        let framework = AbFramework::new();
        let id = active_experiment(&framework, 100.0);
        framework.stop_experiment(&id);
        assert_eq!(framework.assign_variant(&id, "key"), Variant::RuleBased);
    }

    #[test]
    fn test_expired_experiment_defaults_to_rule_based() {
        let framework = AbFramework::new();
        let id = framework.create_experiment(
            "done",
            "past window",
            Utc::now() - Duration::days(60),
            Utc::now() - Duration::days(30),
            100.0,
            RandomizationUnit::User,
            None,
        );
        assert_eq!(framework.assign_variant(&id, "key"), Variant::RuleBased);
    }

    #[test]
    fn test_metrics_and_comparison() {
        let framework = AbFramework::new();
        let id = active_experiment(&framework, 50.0);

        // ML converts well at higher prices; rules convert poorly.
        for i in 0..100 {
            framework.log_result(
                &id, "p1", &format!("u{i}"), Variant::Ml, 150.0,
                i % 2 == 0, Some(150.0), 10, 2, 0.6,
            );
            framework.log_result(
                &id, "p1", &format!("u{i}"), Variant::RuleBased, 120.0,
                i % 10 == 0, Some(120.0), 10, 2, 0.6,
            );
        }

        let comparison = framework.compare(&id);
        assert_eq!(comparison.ml.count, 100);
        assert!((comparison.ml.conversion_rate - 0.5).abs() < 1e-9);
        assert!((comparison.rule_based.conversion_rate - 0.1).abs() < 1e-9);
        assert!(comparison.lift.conversion_rate > 0.0);

        let p = comparison.significance.conversion_pvalue.unwrap();
        assert!(p < 0.05, "p = {p}");
        assert!(comparison.significance.is_significant);
    }

    #[test]
    fn test_revenue_only_counts_bookings() {
        let framework = AbFramework::new();
        let id = active_experiment(&framework, 50.0);

        framework.log_result(&id, "p1", "u1", Variant::Ml, 200.0, false, Some(200.0), 5, 1, 0.5);
        framework.log_result(&id, "p1", "u2", Variant::Ml, 200.0, true, Some(200.0), 5, 1, 0.5);

        let metrics = framework.calculate_metrics(&id, Some(Variant::Ml));
        assert_eq!(metrics.bookings, 1);
        assert!((metrics.total_revenue - 200.0).abs() < 1e-9);
        assert!((metrics.revpar - 100.0).abs() < 1e-9);
        assert!((metrics.adr - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_welch_t_test_identical_samples() {
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let p = welch_t_test(&a, &a).unwrap();
        assert!(p > 0.99);
    }

    #[test]
    fn test_welch_t_test_separated_samples() {
        let a: Vec<f64> = (0..30).map(|i| 10.0 + (i % 3) as f64).collect();
        let b: Vec<f64> = (0..30).map(|i| 20.0 + (i % 3) as f64).collect();
        let p = welch_t_test(&a, &b).unwrap();
        assert!(p < 0.001);
    }
}

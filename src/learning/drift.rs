//! Feature drift detection.
//!
//! Two-sample Kolmogorov-Smirnov test plus Population Stability Index
//! over reference vs current feature windows. A feature drifts when
//! either test fires; retraining triggers when more than a quarter of
//! the monitored features drift.

use crate::outcomes::OutcomesStore;
use anyhow::Result;
use chrono::{Duration, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DriftConfig {
    /// KS drift when the p-value drops below this.
    pub ks_threshold: f64,
    /// PSI drift when the index exceeds this.
    pub psi_threshold: f64,
    /// Features with fewer clean samples than this are skipped.
    pub min_samples: usize,
    pub psi_buckets: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            ks_threshold: 0.05,
            psi_threshold: 0.2,
            min_samples: 100,
            psi_buckets: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureDrift {
    pub ks_statistic: f64,
    pub ks_pvalue: f64,
    pub ks_drifted: bool,
    pub psi: f64,
    pub psi_drifted: bool,
    pub is_drifted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftSummary {
    pub total_features: usize,
    pub drifted_features: usize,
    pub drift_percentage: f64,
    pub trigger_retrain: bool,
    pub drifted_feature_list: Vec<String>,
    pub skipped_features: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub summary: DriftSummary,
    pub feature_results: HashMap<String, FeatureDrift>,
}

pub struct DriftDetector {
    config: DriftConfig,
}

impl Default for DriftDetector {
    fn default() -> Self {
        Self::new(DriftConfig::default())
    }
}

impl DriftDetector {
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    /// Two-sample KS test: (statistic, p-value, drifted).
    pub fn ks_test(&self, reference: &[f64], current: &[f64]) -> (f64, f64, bool) {
        let mut a: Vec<f64> = reference.iter().copied().filter(|v| v.is_finite()).collect();
        let mut b: Vec<f64> = current.iter().copied().filter(|v| v.is_finite()).collect();

        if a.len() < self.config.min_samples || b.len() < self.config.min_samples {
            return (0.0, 1.0, false);
        }

        a.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
        b.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));

        let statistic = ks_statistic(&a, &b);
        let p_value = ks_pvalue(statistic, a.len(), b.len());
        (statistic, p_value, p_value < self.config.ks_threshold)
    }

    /// Population Stability Index over quantile buckets derived from
    /// the reference window: (psi, drifted).
    pub fn psi(&self, reference: &[f64], current: &[f64]) -> (f64, bool) {
        let mut a: Vec<f64> = reference.iter().copied().filter(|v| v.is_finite()).collect();
        let b: Vec<f64> = current.iter().copied().filter(|v| v.is_finite()).collect();

        if a.len() < self.config.min_samples || b.len() < self.config.min_samples {
            return (0.0, false);
        }

        a.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));

        // Interior bucket edges at reference quantiles; duplicate edges
        // collapse (constant features end up with one bucket, PSI 0).
        let mut edges: Vec<f64> = (1..self.config.psi_buckets)
            .map(|k| quantile_sorted(&a, k as f64 / self.config.psi_buckets as f64))
            .collect();
        edges.dedup();

        let ref_counts = bucket_proportions(&a, &edges);
        let cur_counts = bucket_proportions(&b, &edges);

        let psi: f64 = ref_counts
            .iter()
            .zip(cur_counts.iter())
            .map(|(&r, &c)| {
                let r = r.max(1e-4);
                let c = c.max(1e-4);
                (c - r) * (c / r).ln()
            })
            .sum();

        (psi, psi > self.config.psi_threshold)
    }

    /// Drift check across a feature list. Features missing from either
    /// window, or without enough clean samples, are skipped (logged,
    /// never fatal) but still count in the trigger denominator.
    pub fn detect(
        &self,
        reference: &HashMap<String, Vec<f64>>,
        current: &HashMap<String, Vec<f64>>,
        features: &[String],
    ) -> DriftReport {
        let per_feature: Vec<(String, Option<FeatureDrift>)> = features
            .par_iter()
            .map(|feature| {
                let (Some(ref_series), Some(cur_series)) =
                    (reference.get(feature), current.get(feature))
                else {
                    return (feature.clone(), None);
                };

                let ref_clean = ref_series.iter().filter(|v| v.is_finite()).count();
                let cur_clean = cur_series.iter().filter(|v| v.is_finite()).count();
                if ref_clean < self.config.min_samples || cur_clean < self.config.min_samples {
                    return (feature.clone(), None);
                }

                let (ks_statistic, ks_pvalue, ks_drifted) = self.ks_test(ref_series, cur_series);
                let (psi, psi_drifted) = self.psi(ref_series, cur_series);

                (
                    feature.clone(),
                    Some(FeatureDrift {
                        ks_statistic,
                        ks_pvalue,
                        ks_drifted,
                        psi,
                        psi_drifted,
                        is_drifted: ks_drifted || psi_drifted,
                    }),
                )
            })
            .collect();

        let mut feature_results = HashMap::new();
        let mut drifted_feature_list = Vec::new();
        let mut skipped_features = Vec::new();

        for (feature, result) in per_feature {
            match result {
                Some(drift) => {
                    if drift.is_drifted {
                        drifted_feature_list.push(feature.clone());
                    }
                    feature_results.insert(feature, drift);
                }
                None => {
                    warn!(feature, "Skipping drift check: insufficient samples");
                    skipped_features.push(feature);
                }
            }
        }
        drifted_feature_list.sort();

        let total_features = features.len();
        let drifted_features = drifted_feature_list.len();
        let drift_percentage = if total_features > 0 {
            drifted_features as f64 / total_features as f64 * 100.0
        } else {
            0.0
        };
        let trigger_retrain = drift_percentage > 25.0;

        info!(
            drifted = drifted_features,
            total = total_features,
            drift_percentage,
            trigger_retrain,
            "Drift detection complete"
        );

        DriftReport {
            summary: DriftSummary {
                total_features,
                drifted_features,
                drift_percentage,
                trigger_retrain,
                drifted_feature_list,
                skipped_features,
            },
            feature_results,
        }
    }

    /// Pull reference and current windows for a property from the
    /// outcomes store and run drift detection.
    pub fn monitor_property(
        &self,
        store: &OutcomesStore,
        property_id: &str,
        features: &[String],
        reference_days: i64,
        current_days: i64,
    ) -> Result<DriftReport> {
        let now = Utc::now();
        let reference_end = now - Duration::days(reference_days);
        let reference_start = reference_end - Duration::days(reference_days);
        let current_start = now - Duration::days(current_days);

        let mut reference = HashMap::new();
        let mut current = HashMap::new();
        for feature in features {
            reference.insert(
                feature.clone(),
                store.feature_series(
                    property_id,
                    feature,
                    Some(reference_start),
                    Some(reference_end),
                )?,
            );
            current.insert(
                feature.clone(),
                store.feature_series(property_id, feature, Some(current_start), None)?,
            );
        }

        Ok(self.detect(&reference, &current, features))
    }
}

/// Default features monitored for drift.
pub fn default_monitored_features() -> Vec<String> {
    [
        "quoted_price",
        "comp_p50",
        "occupancy_rate",
        "lead_time",
        "temperature",
        "day_of_week",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Max distance between the two empirical CDFs; inputs must be sorted.
fn ks_statistic(a: &[f64], b: &[f64]) -> f64 {
    let (n1, n2) = (a.len(), b.len());
    let (mut i, mut j) = (0usize, 0usize);
    let mut d: f64 = 0.0;

    while i < n1 && j < n2 {
        let x = a[i].min(b[j]);
        while i < n1 && a[i] <= x {
            i += 1;
        }
        while j < n2 && b[j] <= x {
            j += 1;
        }
        let f1 = i as f64 / n1 as f64;
        let f2 = j as f64 / n2 as f64;
        d = d.max((f1 - f2).abs());
    }

    d
}

/// Asymptotic two-sample KS p-value (Kolmogorov distribution tail).
fn ks_pvalue(statistic: f64, n1: usize, n2: usize) -> f64 {
    if statistic <= 0.0 {
        return 1.0;
    }
    let en = (n1 as f64 * n2 as f64) / (n1 as f64 + n2 as f64);
    let lambda = (en.sqrt() + 0.12 + 0.11 / en.sqrt()) * statistic;

    let mut sum = 0.0;
    let mut sign = 1.0;
    for j in 1..=100 {
        let j = j as f64;
        let term = sign * (-2.0 * j * j * lambda * lambda).exp();
        sum += term;
        if term.abs() < 1e-12 {
            break;
        }
        sign = -sign;
    }

    (2.0 * sum).clamp(0.0, 1.0)
}

/// Quantile by nearest rank on a sorted slice.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let index = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Proportion of values falling into each bucket defined by interior
/// edges: (-inf, e1], (e1, e2], ..., (e_k, inf).
fn bucket_proportions(values: &[f64], edges: &[f64]) -> Vec<f64> {
    let mut counts = vec![0usize; edges.len() + 1];
    for &v in values {
        let bucket = edges.partition_point(|&e| e < v);
        counts[bucket] += 1;
    }
    counts
        .into_iter()
        .map(|c| c as f64 / values.len() as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn normal_samples(mean: f64, std: f64, n: usize, seed: u64) -> Vec<f64> {
        // Box-Muller with a seeded generator for reproducibility.
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let u1: f64 = rng.gen_range(1e-12..1.0);
                let u2: f64 = rng.gen::<f64>();
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                mean + std * z
            })
            .collect()
    }

    #[test]
    fn test_identical_distributions_do_not_drift() {
        let detector = DriftDetector::default();
        let reference = normal_samples(150.0, 20.0, 500, 1);
        let current = normal_samples(150.0, 20.0, 500, 1);

        let (stat, p, ks_drifted) = detector.ks_test(&reference, &current);
        assert!(stat < 1e-12);
        assert!(p > 0.99, "p = {p}");
        assert!(!ks_drifted);

        let (psi, psi_drifted) = detector.psi(&reference, &current);
        assert!(psi < 0.2, "psi = {psi}");
        assert!(!psi_drifted);
    }

    #[test]
    fn test_shifted_mean_drifts() {
        let detector = DriftDetector::default();
        let reference = normal_samples(150.0, 20.0, 500, 1);
        let current = normal_samples(190.0, 20.0, 500, 2);

        let (stat, p, ks_drifted) = detector.ks_test(&reference, &current);
        assert!(stat > 0.5, "stat = {stat}");
        assert!(p < 0.05, "p = {p}");
        assert!(ks_drifted);

        let (psi, psi_drifted) = detector.psi(&reference, &current);
        assert!(psi > 0.2, "psi = {psi}");
        assert!(psi_drifted);
    }

    #[test]
    fn test_insufficient_samples_skipped() {
        let detector = DriftDetector::default();
        let reference = vec![1.0; 10];
        let current = vec![2.0; 10];

        let (stat, p, drifted) = detector.ks_test(&reference, &current);
        assert_eq!((stat, p, drifted), (0.0, 1.0, false));
    }

    #[test]
    fn test_detect_trigger_threshold() {
        let detector = DriftDetector::default();

        let features: Vec<String> = (0..4).map(|i| format!("f{i}")).collect();
        let mut reference = HashMap::new();
        let mut current = HashMap::new();
        for (i, feature) in features.iter().enumerate() {
            reference.insert(feature.clone(), normal_samples(100.0, 10.0, 300, i as u64));
            // Shift half of the features hard; the rest replay the
            // reference window exactly.
            let (mean, seed) = if i < 2 { (200.0, 100 + i as u64) } else { (100.0, i as u64) };
            current.insert(feature.clone(), normal_samples(mean, 10.0, 300, seed));
        }

        let report = detector.detect(&reference, &current, &features);
        assert_eq!(report.summary.total_features, 4);
        assert_eq!(report.summary.drifted_features, 2);
        assert!(report.summary.trigger_retrain);
        assert_eq!(report.summary.drifted_feature_list, vec!["f0", "f1"]);
    }

    #[test]
    fn test_detect_below_trigger() {
        let detector = DriftDetector::default();

        let features: Vec<String> = (0..5).map(|i| format!("f{i}")).collect();
        let mut reference = HashMap::new();
        let mut current = HashMap::new();
        for (i, feature) in features.iter().enumerate() {
            reference.insert(feature.clone(), normal_samples(100.0, 10.0, 300, i as u64));
            let (mean, seed) = if i == 0 { (200.0, 100) } else { (100.0, i as u64) };
            current.insert(feature.clone(), normal_samples(mean, 10.0, 300, seed));
        }

        let report = detector.detect(&reference, &current, &features);
        assert_eq!(report.summary.drifted_features, 1);
        // 1/5 = 20% does not clear the 25% trigger.
        assert!(!report.summary.trigger_retrain);
    }

    #[test]
    fn test_missing_feature_skipped_not_fatal() {
        let detector = DriftDetector::default();
        let features = vec!["present".to_string(), "absent".to_string()];

        let mut reference = HashMap::new();
        let mut current = HashMap::new();
        reference.insert("present".to_string(), normal_samples(100.0, 10.0, 300, 1));
        current.insert("present".to_string(), normal_samples(100.0, 10.0, 300, 2));

        let report = detector.detect(&reference, &current, &features);
        assert_eq!(report.summary.skipped_features, vec!["absent"]);
        assert!(report.feature_results.contains_key("present"));
    }

    #[test]
    fn test_constant_feature_has_zero_psi() {
        let detector = DriftDetector::default();
        let reference = vec![5.0; 200];
        let current = vec![5.0; 200];
        let (psi, drifted) = detector.psi(&reference, &current);
        assert!(psi.abs() < 1e-9);
        assert!(!drifted);
    }
}

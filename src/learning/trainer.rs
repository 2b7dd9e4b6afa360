//! Model training.
//!
//! Fits the linear scorer on stored outcomes with full-batch gradient
//! descent: logistic loss for conversion models, squared loss for the
//! ADR/RevPAR regressors. The split respects time ordering (latest
//! slice validates) and training early-stops on the validation metric.
//! Standardization is folded back into the weights so artifacts score
//! raw feature values.

use crate::registry::{LinearModel, LinkFunction, ModelType};
use anyhow::{bail, Result};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub max_epochs: usize,
    pub learning_rate: f64,
    pub l2: f64,
    pub early_stopping_rounds: usize,
    pub validation_fraction: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            max_epochs: 200,
            learning_rate: 0.1,
            l2: 1e-4,
            early_stopping_rounds: 10,
            validation_fraction: 0.2,
        }
    }
}

/// Time-ordered training matrix: `rows[i]` aligns with
/// `feature_names`, `targets[i]` is the label.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug)]
pub struct TrainedModel {
    pub model: LinearModel,
    pub metrics: HashMap<String, f64>,
    pub feature_importance: HashMap<String, f64>,
}

pub fn train(dataset: &Dataset, model_type: ModelType, config: &TrainConfig) -> Result<TrainedModel> {
    let n = dataset.len();
    let d = dataset.feature_names.len();
    if n < 20 {
        bail!("not enough samples to train: {n}");
    }
    if d == 0 {
        bail!("dataset has no features");
    }

    let link = match model_type {
        ModelType::Conversion => LinkFunction::Logistic,
        ModelType::Adr | ModelType::Revpar => LinkFunction::Identity,
    };

    // Time-respecting split: the newest slice validates.
    let n_val = ((n as f64 * config.validation_fraction) as usize).clamp(1, n - 1);
    let n_train = n - n_val;

    // Standardize on training statistics.
    let mut means = vec![0.0f64; d];
    let mut stds = vec![0.0f64; d];
    for j in 0..d {
        let mean = dataset.rows[..n_train].iter().map(|r| r[j]).sum::<f64>() / n_train as f64;
        let var = dataset.rows[..n_train]
            .iter()
            .map(|r| (r[j] - mean).powi(2))
            .sum::<f64>()
            / n_train as f64;
        means[j] = mean;
        stds[j] = if var.sqrt() > 1e-12 { var.sqrt() } else { 1.0 };
    }
    let standardize = |row: &[f64]| -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(j, &x)| (x - means[j]) / stds[j])
            .collect()
    };
    let train_rows: Vec<Vec<f64>> = dataset.rows[..n_train].iter().map(|r| standardize(r)).collect();
    let val_rows: Vec<Vec<f64>> = dataset.rows[n_train..].iter().map(|r| standardize(r)).collect();
    let train_y = &dataset.targets[..n_train];
    let val_y = &dataset.targets[n_train..];

    let mut weights = vec![0.0f64; d];
    let mut bias = match link {
        // Start regression at the target mean for faster convergence.
        LinkFunction::Identity => train_y.iter().sum::<f64>() / n_train as f64,
        LinkFunction::Logistic => 0.0,
    };

    let predict = |weights: &[f64], bias: f64, row: &[f64]| -> f64 {
        let z: f64 = weights.iter().zip(row).map(|(w, x)| w * x).sum::<f64>() + bias;
        match link {
            LinkFunction::Logistic => 1.0 / (1.0 + (-z).exp()),
            LinkFunction::Identity => z,
        }
    };

    let validation_score = |weights: &[f64], bias: f64| -> f64 {
        let preds: Vec<f64> = val_rows.iter().map(|r| predict(weights, bias, r)).collect();
        match link {
            // Higher is better.
            LinkFunction::Logistic => auc(&preds, val_y),
            // Negated RMSE so higher is better here too.
            LinkFunction::Identity => -rmse(&preds, val_y),
        }
    };

    let mut best_weights = weights.clone();
    let mut best_bias = bias;
    let mut best_score = validation_score(&weights, bias);
    let mut rounds_without_improvement = 0usize;

    for epoch in 0..config.max_epochs {
        // Full-batch gradient: X^T (pred - y) / n, plus L2.
        let mut grad_w = vec![0.0f64; d];
        let mut grad_b = 0.0f64;
        for (row, &y) in train_rows.iter().zip(train_y) {
            let err = predict(&weights, bias, row) - y;
            for (g, &x) in grad_w.iter_mut().zip(row) {
                *g += err * x;
            }
            grad_b += err;
        }
        for (g, &w) in grad_w.iter_mut().zip(&weights) {
            *g = *g / n_train as f64 + config.l2 * w;
        }
        grad_b /= n_train as f64;

        for (w, g) in weights.iter_mut().zip(&grad_w) {
            *w -= config.learning_rate * g;
        }
        bias -= config.learning_rate * grad_b;

        let score = validation_score(&weights, bias);
        if score > best_score + 1e-9 {
            best_score = score;
            best_weights = weights.clone();
            best_bias = bias;
            rounds_without_improvement = 0;
        } else {
            rounds_without_improvement += 1;
            if rounds_without_improvement >= config.early_stopping_rounds {
                debug!(epoch, best_score, "Early stopping");
                break;
            }
        }
    }

    // Fold standardization into the weights so the artifact consumes
    // raw feature values.
    let mut raw_weights = vec![0.0f64; d];
    let mut raw_bias = best_bias;
    for j in 0..d {
        raw_weights[j] = best_weights[j] / stds[j];
        raw_bias -= best_weights[j] * means[j] / stds[j];
    }

    let model = LinearModel {
        weights: raw_weights,
        bias: raw_bias,
        link,
    };

    let val_preds: Vec<f64> = val_rows
        .iter()
        .map(|r| predict(&best_weights, best_bias, r))
        .collect();
    let mut metrics = HashMap::new();
    match link {
        LinkFunction::Logistic => {
            metrics.insert("auc".to_string(), auc(&val_preds, val_y));
            metrics.insert("logloss".to_string(), logloss(&val_preds, val_y));
        }
        LinkFunction::Identity => {
            metrics.insert("rmse".to_string(), rmse(&val_preds, val_y));
            metrics.insert("mae".to_string(), mae(&val_preds, val_y));
        }
    }
    metrics.insert("train_samples".to_string(), n_train as f64);
    metrics.insert("validation_samples".to_string(), n_val as f64);

    // Importance on the standardized scale keeps features comparable.
    let feature_importance: HashMap<String, f64> = dataset
        .feature_names
        .iter()
        .zip(&best_weights)
        .map(|(name, w)| (name.clone(), w.abs()))
        .collect();

    info!(
        model_type = %model_type,
        samples = n,
        features = d,
        metrics = ?metrics,
        "Training complete"
    );

    Ok(TrainedModel {
        model,
        metrics,
        feature_importance,
    })
}

/// Rank-based AUC with tie-averaged ranks. Degenerate single-class
/// validation windows score 0.5.
pub fn auc(scores: &[f64], labels: &[f64]) -> f64 {
    let n = scores.len();
    let positives = labels.iter().filter(|&&l| l > 0.5).count();
    let negatives = n - positives;
    if positives == 0 || negatives == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        scores[a]
            .partial_cmp(&scores[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ranks = vec![0.0f64; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &index in &order[i..=j] {
            ranks[index] = avg_rank;
        }
        i = j + 1;
    }

    let positive_rank_sum: f64 = labels
        .iter()
        .zip(&ranks)
        .filter(|(&l, _)| l > 0.5)
        .map(|(_, &r)| r)
        .sum();

    let p = positives as f64;
    let q = negatives as f64;
    (positive_rank_sum - p * (p + 1.0) / 2.0) / (p * q)
}

pub fn rmse(predictions: &[f64], targets: &[f64]) -> f64 {
    let n = predictions.len().max(1) as f64;
    (predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| (p - t).powi(2))
        .sum::<f64>()
        / n)
        .sqrt()
}

pub fn mae(predictions: &[f64], targets: &[f64]) -> f64 {
    let n = predictions.len().max(1) as f64;
    predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| (p - t).abs())
        .sum::<f64>()
        / n
}

pub fn logloss(predictions: &[f64], targets: &[f64]) -> f64 {
    let n = predictions.len().max(1) as f64;
    predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| {
            let p = p.clamp(1e-12, 1.0 - 1e-12);
            -(t * p.ln() + (1.0 - t) * (1.0 - p).ln())
        })
        .sum::<f64>()
        / n
}

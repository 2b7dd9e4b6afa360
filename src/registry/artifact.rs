//! Model artifact format.
//!
//! An artifact is an opaque serialized learner plus a JSON metadata
//! sidecar. Artifacts are immutable once written; new training runs
//! produce a new version and move the `latest` pointer.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Conversion,
    Adr,
    Revpar,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Conversion => "conversion",
            ModelType::Adr => "adr",
            ModelType::Revpar => "revpar",
        }
    }

    /// Whether lower is better for this model's primary metric.
    pub fn primary_metric(&self) -> &'static str {
        match self {
            ModelType::Conversion => "auc",
            ModelType::Adr | ModelType::Revpar => "rmse",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conversion" => Ok(ModelType::Conversion),
            "adr" => Ok(ModelType::Adr),
            "revpar" => Ok(ModelType::Revpar),
            other => anyhow::bail!("unknown model type '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkFunction {
    Logistic,
    Identity,
}

/// Linear scorer over a fixed, ordered feature list. Conversion models
/// use the logistic link; ADR/RevPAR regressors use identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub weights: Vec<f64>,
    pub bias: f64,
    pub link: LinkFunction,
}

impl LinearModel {
    pub fn predict(&self, values: &[f64]) -> f64 {
        let z: f64 = self
            .weights
            .iter()
            .zip(values.iter())
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.bias;

        match self.link {
            LinkFunction::Logistic => 1.0 / (1.0 + (-z).exp()),
            LinkFunction::Identity => z,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize model")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("Failed to deserialize model")
    }
}

/// Sidecar metadata stored next to each artifact blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub property_id: String,
    pub model_type: ModelType,
    pub version: String,
    pub features: Vec<String>,
    pub feature_hash: String,
    pub metrics: HashMap<String, f64>,
    #[serde(default)]
    pub feature_importance: HashMap<String, f64>,
    pub checksum: String,
    pub timestamp: DateTime<Utc>,
}

impl ModelMetadata {
    pub fn num_features(&self) -> usize {
        self.features.len()
    }
}

pub fn checksum_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn feature_hash(names: &[String]) -> String {
    let mut hasher = Sha256::new();
    for name in names {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logistic_predict() {
        let model = LinearModel {
            weights: vec![1.0, -1.0],
            bias: 0.0,
            link: LinkFunction::Logistic,
        };
        let p = model.predict(&[0.0, 0.0]);
        assert!((p - 0.5).abs() < 1e-12);

        let high = model.predict(&[10.0, 0.0]);
        assert!(high > 0.99);
    }

    #[test]
    fn test_identity_predict() {
        let model = LinearModel {
            weights: vec![2.0, 3.0],
            bias: 1.0,
            link: LinkFunction::Identity,
        };
        assert!((model.predict(&[1.0, 1.0]) - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_round_trip() {
        let model = LinearModel {
            weights: vec![0.5, -0.25],
            bias: 0.1,
            link: LinkFunction::Logistic,
        };
        let bytes = model.to_bytes().unwrap();
        let restored = LinearModel::from_bytes(&bytes).unwrap();
        assert_eq!(restored.weights, model.weights);
        assert_eq!(restored.link, model.link);
    }

    #[test]
    fn test_checksum_changes_with_content() {
        let a = checksum_hex(b"model-a");
        let b = checksum_hex(b"model-b");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_model_type_round_trip() {
        for t in [ModelType::Conversion, ModelType::Adr, ModelType::Revpar] {
            assert_eq!(t.as_str().parse::<ModelType>().unwrap(), t);
        }
    }
}

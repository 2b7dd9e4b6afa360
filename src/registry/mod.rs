//! Model Registry
//!
//! Lazy-loads per-property model artifacts with checksum verification,
//! a hot in-memory cache, and an atomically updated `latest` pointer.
//! Readers hold an immutable handle for the life of their request: a
//! promotion mid-request never swaps a model out from under them.

pub mod artifact;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use artifact::{checksum_hex, feature_hash, LinearModel, LinkFunction, ModelMetadata, ModelType};

use crate::features::FeatureRecord;

pub const LATEST: &str = "latest";

/// An immutable loaded model handle. Shared between concurrent readers.
#[derive(Debug)]
pub struct LoadedModel {
    pub model: LinearModel,
    pub metadata: ModelMetadata,
}

impl LoadedModel {
    /// Reorders the record to this model's stored feature list. Unknown
    /// record entries are ignored; names the record lacks default to 0.
    pub fn predict_record(&self, record: &FeatureRecord) -> f64 {
        let values: Vec<f64> = self
            .metadata
            .features
            .iter()
            .map(|name| record.get(name).unwrap_or(0.0))
            .collect();
        self.model.predict(&values)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub property_id: String,
    pub model_type: ModelType,
    pub version: String,
    pub checksum: String,
    pub num_features: usize,
    pub metrics: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_artifacts: usize,
    pub cached_models: usize,
    pub model_dir: String,
}

type CacheKey = (String, ModelType);

pub struct ModelRegistry {
    model_dir: PathBuf,
    /// Hot cache keyed by (property, model type); the slot holds the
    /// currently promoted version and swaps atomically on promotion.
    slots: RwLock<HashMap<CacheKey, Arc<ArcSwap<LoadedModel>>>>,
    /// Per-key load locks so concurrent cold loads coalesce onto one I/O.
    load_locks: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ModelRegistry {
    pub fn new<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        let model_dir = model_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&model_dir)
            .with_context(|| format!("Failed to create model dir {}", model_dir.display()))?;

        Ok(Self {
            model_dir,
            slots: RwLock::new(HashMap::new()),
            load_locks: Mutex::new(HashMap::new()),
        })
    }

    fn blob_path(&self, property_id: &str, model_type: ModelType, version: &str) -> PathBuf {
        self.model_dir
            .join(format!("{property_id}_{model_type}_{version}.bin"))
    }

    fn metadata_path(&self, property_id: &str, model_type: ModelType, version: &str) -> PathBuf {
        self.model_dir
            .join(format!("{property_id}_{model_type}_{version}.json"))
    }

    fn latest_path(&self, property_id: &str, model_type: ModelType) -> PathBuf {
        self.model_dir
            .join(format!("{property_id}_{model_type}_latest.txt"))
    }

    /// Resolves the `latest` symbolic version to a concrete one.
    pub fn latest_version(&self, property_id: &str, model_type: ModelType) -> Option<String> {
        std::fs::read_to_string(self.latest_path(property_id, model_type))
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn load_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        self.load_locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Load a model and its metadata. Returns `Ok(None)` when no such
    /// artifact exists; checksum mismatches are hard errors (a corrupt
    /// artifact is never served).
    pub async fn load(
        &self,
        property_id: &str,
        model_type: ModelType,
        version: &str,
        use_cache: bool,
    ) -> Result<Option<Arc<LoadedModel>>> {
        let wants_latest = version == LATEST;
        let resolved = if wants_latest {
            match self.latest_version(property_id, model_type) {
                Some(v) => v,
                None => return Ok(None),
            }
        } else {
            version.to_string()
        };

        let key: CacheKey = (property_id.to_string(), model_type);

        if use_cache {
            if let Some(slot) = self.slots.read().get(&key) {
                let loaded = slot.load_full();
                if loaded.metadata.version == resolved {
                    debug!(property_id, %model_type, version = %resolved, "Model served from cache");
                    return Ok(Some(loaded));
                }
            }
        }

        // Single-flight: concurrent cold loads for the same key queue
        // behind one I/O and then hit the cache on re-check.
        let lock = self.load_lock(&key);
        let _guard = lock.lock().await;

        if use_cache {
            if let Some(slot) = self.slots.read().get(&key) {
                let loaded = slot.load_full();
                if loaded.metadata.version == resolved {
                    return Ok(Some(loaded));
                }
            }
        }

        let blob_path = self.blob_path(property_id, model_type, &resolved);
        if !blob_path.exists() {
            warn!(property_id, %model_type, version = %resolved, "Model artifact not found");
            return Ok(None);
        }

        let blob = tokio::fs::read(&blob_path)
            .await
            .with_context(|| format!("Failed to read {}", blob_path.display()))?;

        let metadata_path = self.metadata_path(property_id, model_type, &resolved);
        let metadata_bytes = tokio::fs::read(&metadata_path)
            .await
            .with_context(|| format!("Failed to read {}", metadata_path.display()))?;
        let metadata: ModelMetadata =
            serde_json::from_slice(&metadata_bytes).context("Failed to parse model metadata")?;

        let actual = checksum_hex(&blob);
        if actual != metadata.checksum {
            bail!(
                "checksum mismatch for {} {} v{}: expected {}, got {}",
                property_id,
                model_type,
                resolved,
                metadata.checksum,
                actual
            );
        }

        let model = LinearModel::from_bytes(&blob)?;
        let loaded = Arc::new(LoadedModel { model, metadata });

        if use_cache && wants_latest {
            let mut slots = self.slots.write();
            match slots.get(&key) {
                Some(slot) => slot.store(loaded.clone()),
                None => {
                    slots.insert(key, Arc::new(ArcSwap::new(loaded.clone())));
                }
            }
        }

        info!(property_id, %model_type, version = %loaded.metadata.version, "Model loaded");
        Ok(Some(loaded))
    }

    /// Score a feature record with the model for (property, type).
    /// Any failure (missing artifact, checksum error) returns `None`:
    /// model unavailability is never fatal to the request path.
    pub async fn predict(
        &self,
        property_id: &str,
        features: &FeatureRecord,
        model_type: ModelType,
        version: &str,
    ) -> Option<f64> {
        match self.load(property_id, model_type, version, true).await {
            Ok(Some(loaded)) => {
                let score = loaded.predict_record(features);
                debug!(property_id, %model_type, score, "Model prediction");
                Some(score)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(property_id, %model_type, error = %err, "Model load failed");
                None
            }
        }
    }

    /// Pre-load models for a set of properties.
    pub async fn warm_up(&self, property_ids: &[String], model_type: ModelType) -> usize {
        let mut loaded = 0usize;
        for property_id in property_ids {
            match self.load(property_id, model_type, LATEST, true).await {
                Ok(Some(_)) => loaded += 1,
                Ok(None) => {}
                Err(err) => warn!(property_id, error = %err, "Warm-up load failed"),
            }
        }
        info!(
            loaded,
            requested = property_ids.len(),
            "Model cache warm-up complete"
        );
        loaded
    }

    /// Write a new artifact (blob + metadata sidecar). Does not move the
    /// `latest` pointer; call [`promote_latest`] once the regression
    /// gate has passed.
    ///
    /// [`promote_latest`]: ModelRegistry::promote_latest
    pub fn save_artifact(
        &self,
        property_id: &str,
        model_type: ModelType,
        model: &LinearModel,
        features: Vec<String>,
        metrics: HashMap<String, f64>,
        feature_importance: HashMap<String, f64>,
    ) -> Result<ModelMetadata> {
        let version = Utc::now().format("%Y%m%d%H%M%S%f").to_string();
        let blob = model.to_bytes()?;
        let checksum = checksum_hex(&blob);

        let metadata = ModelMetadata {
            property_id: property_id.to_string(),
            model_type,
            version: version.clone(),
            feature_hash: feature_hash(&features),
            features,
            metrics,
            feature_importance,
            checksum,
            timestamp: Utc::now(),
        };

        let blob_path = self.blob_path(property_id, model_type, &version);
        std::fs::write(&blob_path, &blob)
            .with_context(|| format!("Failed to write {}", blob_path.display()))?;

        let metadata_path = self.metadata_path(property_id, model_type, &version);
        std::fs::write(&metadata_path, serde_json::to_vec_pretty(&metadata)?)
            .with_context(|| format!("Failed to write {}", metadata_path.display()))?;

        info!(property_id, %model_type, version, "Model artifact written");
        Ok(metadata)
    }

    /// Atomically repoint `latest` to `version` (temp file + rename) and
    /// invalidate the hot cache slot. Requests that already resolved a
    /// handle keep scoring on the version they loaded.
    pub fn promote_latest(
        &self,
        property_id: &str,
        model_type: ModelType,
        version: &str,
    ) -> Result<()> {
        let pointer = self.latest_path(property_id, model_type);
        let tmp = pointer.with_extension("txt.tmp");
        std::fs::write(&tmp, version)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &pointer)
            .with_context(|| format!("Failed to promote {}", pointer.display()))?;

        // Drop the cached slot so the next load resolves the new pointer.
        self.slots
            .write()
            .remove(&(property_id.to_string(), model_type));

        info!(property_id, %model_type, version, "Promoted latest model");
        Ok(())
    }

    /// Remove an artifact version from disk and evict it from cache.
    pub fn delete(&self, property_id: &str, model_type: ModelType, version: &str) -> Result<()> {
        for path in [
            self.blob_path(property_id, model_type, version),
            self.metadata_path(property_id, model_type, version),
        ] {
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to delete {}", path.display()))?;
            }
        }

        let key = (property_id.to_string(), model_type);
        let evict = self
            .slots
            .read()
            .get(&key)
            .map(|slot| slot.load().metadata.version == version)
            .unwrap_or(false);
        if evict {
            self.slots.write().remove(&key);
        }

        info!(property_id, %model_type, version, "Model artifact deleted");
        Ok(())
    }

    /// Top-N feature importances recorded with the artifact.
    pub async fn feature_importance(
        &self,
        property_id: &str,
        model_type: ModelType,
        version: &str,
        top_n: usize,
    ) -> Option<Vec<(String, f64)>> {
        let loaded = self.load(property_id, model_type, version, true).await.ok()??;
        let mut entries: Vec<(String, f64)> = loaded
            .metadata
            .feature_importance
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        entries.truncate(top_n);
        Some(entries)
    }

    pub fn loaded_models(&self) -> Vec<ModelSummary> {
        self.slots
            .read()
            .iter()
            .map(|((property_id, model_type), slot)| {
                let loaded = slot.load();
                ModelSummary {
                    property_id: property_id.clone(),
                    model_type: *model_type,
                    version: loaded.metadata.version.clone(),
                    checksum: loaded.metadata.checksum.clone(),
                    num_features: loaded.metadata.num_features(),
                    metrics: loaded.metadata.metrics.clone(),
                }
            })
            .collect()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        let total_artifacts = std::fs::read_dir(&self.model_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| {
                        e.path()
                            .extension()
                            .map(|ext| ext == "bin")
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0);

        RegistryStats {
            total_artifacts,
            cached_models: self.slots.read().len(),
            model_dir: self.model_dir.display().to_string(),
        }
    }
}

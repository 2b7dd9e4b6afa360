//! Competitor Rate Gateway
//!
//! Cache-backed, retrying fetch of competitor price bands (P10/P50/P90)
//! for a (property, stay date) pair. Missing upstream data is not an
//! error: pricing proceeds without the competitive cap and the lookup
//! records a degradation reason instead.

pub mod cache;
pub mod client;
pub mod mock;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use cache::BandCache;
pub use client::{FetchError, HttpCompetitorSource};
pub use mock::MockCompetitorSource;

/// Competitor price band for one (property, date).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitorBand {
    pub p10: Option<f64>,
    pub p50: f64,
    pub p90: Option<f64>,
    pub count: u32,
    pub source: String,
}

impl CompetitorBand {
    /// Spread between the P90 and P10 percentiles, when both are known.
    pub fn range(&self) -> Option<f64> {
        match (self.p10, self.p90) {
            (Some(p10), Some(p90)) => Some(p90 - p10),
            _ => None,
        }
    }
}

/// Upstream source of competitor bands. `Ok(None)` means the upstream
/// has no data for the pair; transport failures come back as errors so
/// the gateway can decide whether to retry.
#[async_trait]
pub trait CompetitorSource: Send + Sync {
    async fn fetch_band(
        &self,
        property_id: &str,
        stay_date: NaiveDate,
    ) -> Result<Option<CompetitorBand>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Total wall-clock budget for one lookup, retries included.
    pub fetch_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    /// Concurrent in-flight lookups for batch fan-out (hard-capped at 32).
    pub batch_concurrency: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(5),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(900),
            cache_capacity: 4096,
            batch_concurrency: 16,
        }
    }
}

/// Result of a band lookup. `band` is `None` when upstream has no data;
/// `degradation` carries a human-readable reason when the lookup fell
/// back to a stale entry or gave up.
#[derive(Debug, Clone, Default)]
pub struct BandLookup {
    pub band: Option<CompetitorBand>,
    pub degradation: Option<String>,
}

pub struct CompetitorGateway {
    source: Arc<dyn CompetitorSource>,
    cache: BandCache,
    config: GatewayConfig,
}

impl CompetitorGateway {
    pub fn new(source: Arc<dyn CompetitorSource>, config: GatewayConfig) -> Self {
        let cache = BandCache::new(config.cache_ttl, config.cache_capacity);
        Self {
            source,
            cache,
            config,
        }
    }

    /// Look up the competitor band for one (property, stay date) pair.
    pub async fn get_band(&self, property_id: &str, stay_date: NaiveDate) -> BandLookup {
        let key = (property_id.to_string(), stay_date);

        if let Some(cached) = self.cache.get(&key) {
            if cached.is_fresh {
                debug!(property_id, %stay_date, "Competitor band served from cache");
                return BandLookup {
                    band: cached.band,
                    degradation: None,
                };
            }
        }

        let fetched = tokio::time::timeout(
            self.config.fetch_timeout,
            self.fetch_with_retry(property_id, stay_date),
        )
        .await;

        match fetched {
            Ok(Ok(band)) => {
                self.cache.insert(key, band.clone());
                BandLookup {
                    band,
                    degradation: None,
                }
            }
            Ok(Err(err)) => self.degraded_lookup(&key, format!("competitor fetch failed: {err}")),
            Err(_) => self.degraded_lookup(
                &key,
                format!(
                    "competitor fetch timed out after {:?}",
                    self.config.fetch_timeout
                ),
            ),
        }
    }

    /// Batch lookup with bounded fan-out. Output order matches input
    /// order; a failed pair yields a missing band without aborting the
    /// rest of the batch.
    pub async fn get_bands(&self, pairs: &[(String, NaiveDate)]) -> Vec<BandLookup> {
        let concurrency = self.config.batch_concurrency.clamp(1, 32);

        let mut indexed: Vec<(usize, BandLookup)> = stream::iter(pairs.iter().enumerate())
            .map(|(idx, (property_id, stay_date))| async move {
                (idx, self.get_band(property_id, *stay_date).await)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, lookup)| lookup).collect()
    }

    /// Stale-while-revalidate: serve an expired cached band (with a
    /// degradation note) rather than nothing at all.
    fn degraded_lookup(&self, key: &(String, NaiveDate), reason: String) -> BandLookup {
        warn!(property_id = %key.0, stay_date = %key.1, reason = %reason, "Competitor lookup degraded");

        if let Some(stale) = self.cache.get(key) {
            if stale.band.is_some() {
                return BandLookup {
                    band: stale.band,
                    degradation: Some(format!("{reason}; serving cached competitor band")),
                };
            }
        }

        BandLookup {
            band: None,
            degradation: Some(reason),
        }
    }

    async fn fetch_with_retry(
        &self,
        property_id: &str,
        stay_date: NaiveDate,
    ) -> Result<Option<CompetitorBand>, FetchError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.source.fetch_band(property_id, stay_date).await {
                Ok(band) => return Ok(band),
                Err(FetchError::Permanent(msg)) => {
                    // Non-retryable rejection: treat as missing data.
                    warn!(property_id, %stay_date, reason = %msg, "Competitor source rejected request");
                    return Ok(None);
                }
                Err(err) if attempt < self.config.max_attempts => {
                    let backoff = self
                        .config
                        .backoff_base
                        .saturating_mul(1 << (attempt - 1))
                        .min(self.config.backoff_cap);
                    warn!(
                        property_id,
                        %stay_date,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Transient competitor fetch failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

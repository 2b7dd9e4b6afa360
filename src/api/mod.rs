//! HTTP API: application state wiring and route handlers.

pub mod routes;

use crate::experiments::{AbFramework, BanditConfig, BanditPool};
use crate::gateway::{
    CompetitorGateway, CompetitorSource, GatewayConfig, HttpCompetitorSource, MockCompetitorSource,
};
use crate::models::Config;
use crate::outcomes::OutcomesStore;
use crate::pricing::PricingEngine;
use crate::registry::ModelRegistry;
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Application state shared across all handlers and workers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub engine: Arc<PricingEngine>,
    pub outcomes: Arc<OutcomesStore>,
    pub registry: Arc<ModelRegistry>,
    pub experiments: Arc<AbFramework>,
    pub bandits: Arc<BanditPool>,
    pub started_at: Instant,
}

impl AppState {
    pub fn build(config: Config) -> Result<Self> {
        let source: Arc<dyn CompetitorSource> = if config.competitor_mock_mode {
            info!("Competitor gateway in mock mode");
            Arc::new(MockCompetitorSource::new(config.base_price))
        } else {
            Arc::new(HttpCompetitorSource::new(
                &config.backend_api_url,
                config.backend_api_key.as_deref(),
                config.fetch_timeout,
            )?)
        };

        let gateway = Arc::new(CompetitorGateway::new(
            source,
            GatewayConfig {
                fetch_timeout: config.fetch_timeout,
                cache_ttl: config.competitor_cache_ttl,
                ..GatewayConfig::default()
            },
        ));

        let registry = Arc::new(ModelRegistry::new(&config.model_dir)?);
        let outcomes = Arc::new(OutcomesStore::new(&config.outcomes_db_path)?);
        let experiments = Arc::new(AbFramework::new());
        let bandits = Arc::new(BanditPool::new(BanditConfig {
            epsilon: config.epsilon,
            learning_rate: config.learning_rate,
            discount_factor: config.discount_factor,
            min_price: config.min_price,
            max_price: config.max_price,
            conservative_mode: config.conservative_mode,
            property_base_price: config.base_price,
            ..BanditConfig::default()
        }));
        if let Some(dir) = &config.bandit_state_dir {
            let restored = bandits.load_all(dir);
            info!(restored, dir = %dir.display(), "Restored bandit state");
        }

        let engine = Arc::new(PricingEngine::new(
            config.clone(),
            gateway,
            registry.clone(),
            experiments.clone(),
            bandits.clone(),
        ));

        Ok(Self {
            config,
            engine,
            outcomes,
            registry,
            experiments,
            bandits,
            started_at: Instant::now(),
        })
    }
}

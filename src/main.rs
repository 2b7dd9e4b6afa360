//! RoomRate - dynamic pricing service for hospitality inventory.
//!
//! Serves price quotes over HTTP, ingests booking outcomes, and runs
//! the background learning loop (drift monitoring and gated weekly
//! retraining).

use anyhow::{Context, Result};
use roomrate_backend::api::{routes, AppState};
use roomrate_backend::learning::{
    default_monitored_features, DriftConfig, DriftDetector, RetrainOrchestrator,
};
use roomrate_backend::middleware::request_logging;
use roomrate_backend::models::Config;
use roomrate_backend::registry::ModelType;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::interval;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DRIFT_CHECK_INTERVAL: Duration = Duration::from_secs(6 * 3600);
const RETRAIN_SWEEP_INTERVAL: Duration = Duration::from_secs(7 * 24 * 3600);
const BANDIT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "roomrate=info,roomrate_backend=info,tower_http=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let state = AppState::build(config.clone())?;

    if !config.warm_up_properties.is_empty() {
        state
            .registry
            .warm_up(&config.warm_up_properties, ModelType::Conversion)
            .await;
    }

    spawn_background_workers(state.clone());

    let app = routes::router(state)
        .layer(axum::middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!(port = config.port, "Pricing service listening");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

/// Long-lived workers for the learning loop. They log and move on:
/// nothing here can affect the scoring path.
fn spawn_background_workers(state: AppState) {
    let drift_state = state.clone();
    tokio::spawn(async move {
        let detector = DriftDetector::new(DriftConfig {
            ks_threshold: drift_state.config.ks_threshold,
            psi_threshold: drift_state.config.psi_threshold,
            ..DriftConfig::default()
        });
        let orchestrator = RetrainOrchestrator::new(
            drift_state.outcomes.clone(),
            drift_state.registry.clone(),
            drift_state.config.min_total_outcomes,
            drift_state.config.min_new_outcomes,
        );
        let features = default_monitored_features();

        let mut ticker = interval(DRIFT_CHECK_INTERVAL);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            let properties = match drift_state.outcomes.list_properties() {
                Ok(properties) => properties,
                Err(err) => {
                    warn!(error = %err, "Drift monitor could not list properties");
                    continue;
                }
            };

            for property_id in properties {
                match detector.monitor_property(
                    &drift_state.outcomes,
                    &property_id,
                    &features,
                    30,
                    7,
                ) {
                    Ok(report) if report.summary.trigger_retrain => {
                        warn!(
                            property_id,
                            drifted = report.summary.drifted_features,
                            "Drift detected, triggering retrain"
                        );
                        let report = orchestrator
                            .retrain(&property_id, ModelType::Conversion)
                            .await;
                        info!(
                            property_id = %report.property_id,
                            action = report.action.as_str(),
                            reason = %report.reason,
                            "Drift-triggered retrain finished"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(property_id, error = %err, "Drift monitoring failed");
                    }
                }
            }
        }
    });

    if let Some(dir) = state.config.bandit_state_dir.clone() {
        let bandit_state = state.clone();
        tokio::spawn(async move {
            let mut ticker = interval(BANDIT_SNAPSHOT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match bandit_state.bandits.save_all(&dir) {
                    Ok(saved) => info!(saved, dir = %dir.display(), "Bandit state snapshotted"),
                    Err(err) => warn!(error = %err, "Bandit snapshot failed"),
                }
            }
        });
    }

    let sweep_state = state;
    tokio::spawn(async move {
        let orchestrator = RetrainOrchestrator::new(
            sweep_state.outcomes.clone(),
            sweep_state.registry.clone(),
            sweep_state.config.min_total_outcomes,
            sweep_state.config.min_new_outcomes,
        );

        let mut ticker = interval(RETRAIN_SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let summary = orchestrator.sweep(ModelType::Conversion, &[]).await;
            info!(
                total = summary.total,
                deployed = summary.deployed,
                skipped = summary.skipped,
                failed = summary.failed,
                "Weekly retrain sweep finished"
            );
        }
    });
}

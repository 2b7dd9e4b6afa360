//! Retrain sweep CLI.
//!
//! Retrains one property or sweeps every property with stored
//! outcomes, printing the gate/compare/promote report as JSON. Run
//! weekly from a scheduler.

use anyhow::Result;
use clap::Parser;
use roomrate_backend::learning::RetrainOrchestrator;
use roomrate_backend::models::Config;
use roomrate_backend::outcomes::OutcomesStore;
use roomrate_backend::registry::{ModelRegistry, ModelType};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(about = "Retrain pricing models from stored outcomes")]
struct Args {
    /// Retrain only this property; sweeps all properties when omitted.
    #[arg(long)]
    property_id: Option<String>,

    /// conversion, adr, or revpar.
    #[arg(long, default_value = "conversion")]
    model_type: String,

    /// Drift-flagged properties to prioritize during a sweep.
    #[arg(long)]
    prioritize: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let model_type: ModelType = args.model_type.parse()?;

    let config = Config::from_env()?;
    let store = Arc::new(OutcomesStore::new(&config.outcomes_db_path)?);
    let registry = Arc::new(ModelRegistry::new(&config.model_dir)?);

    let orchestrator = RetrainOrchestrator::new(
        store,
        registry,
        config.min_total_outcomes,
        config.min_new_outcomes,
    );

    match args.property_id {
        Some(property_id) => {
            let report = orchestrator.retrain(&property_id, model_type).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        None => {
            let summary = orchestrator.sweep(model_type, &args.prioritize).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

//! Drift check CLI.
//!
//! Compares reference and current feature windows for one property and
//! exits non-zero when the retrain trigger fires, so schedulers can
//! chain a retrain on drift.

use anyhow::Result;
use clap::Parser;
use roomrate_backend::learning::{default_monitored_features, DriftConfig, DriftDetector};
use roomrate_backend::models::Config;
use roomrate_backend::outcomes::OutcomesStore;

#[derive(Parser, Debug)]
#[command(about = "Detect feature drift for a property's outcomes")]
struct Args {
    #[arg(long)]
    property_id: String,

    /// Features to check; defaults to the standard monitored set.
    #[arg(long)]
    features: Vec<String>,

    #[arg(long, default_value_t = 30)]
    reference_days: i64,

    #[arg(long, default_value_t = 7)]
    current_days: i64,

    #[arg(long, default_value_t = 0.05)]
    ks_threshold: f64,

    #[arg(long, default_value_t = 0.2)]
    psi_threshold: f64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let store = OutcomesStore::new(&config.outcomes_db_path)?;

    let features = if args.features.is_empty() {
        default_monitored_features()
    } else {
        args.features.clone()
    };

    let detector = DriftDetector::new(DriftConfig {
        ks_threshold: args.ks_threshold,
        psi_threshold: args.psi_threshold,
        ..DriftConfig::default()
    });

    let report = detector.monitor_property(
        &store,
        &args.property_id,
        &features,
        args.reference_days,
        args.current_days,
    )?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.summary.trigger_retrain {
        std::process::exit(1);
    }
    Ok(())
}

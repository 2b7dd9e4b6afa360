//! Offline bandit evaluation CLI.
//!
//! Replays a JSON file of historical pricing episodes through a fresh
//! bandit and reports counterfactual revenue, conversion uplift, and
//! the arm distribution for the chosen policy.

use anyhow::{Context, Result};
use clap::Parser;
use roomrate_backend::experiments::{BanditConfig, EpisodeRecord, OfflineEvaluator};
use roomrate_backend::models::Config;

#[derive(Parser, Debug)]
#[command(about = "Evaluate bandit policies against historical pricing episodes")]
struct Args {
    /// JSON file holding an array of episode records.
    #[arg(long)]
    episodes_file: String,

    #[arg(long)]
    property_id: String,

    /// epsilon-greedy or thompson.
    #[arg(long, default_value = "epsilon-greedy")]
    policy: String,

    #[arg(long, default_value_t = 100)]
    simulations: usize,

    /// Exploration rate for the epsilon-greedy policy; defaults to the
    /// configured BANDIT_EPSILON.
    #[arg(long)]
    epsilon: Option<f64>,
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

    let bytes = std::fs::read(&args.episodes_file)
        .with_context(|| format!("Failed to read {}", args.episodes_file))?;
    let episodes: Vec<EpisodeRecord> =
        serde_json::from_slice(&bytes).context("Failed to parse episodes file")?;

    let bandit_config = BanditConfig {
        epsilon: args.epsilon.unwrap_or(config.epsilon),
        learning_rate: config.learning_rate,
        discount_factor: config.discount_factor,
        min_price: config.min_price,
        max_price: config.max_price,
        conservative_mode: config.conservative_mode,
        property_base_price: config.base_price,
        ..BanditConfig::default()
    };

    let evaluator = OfflineEvaluator::new(episodes);
    let result = match args.policy.as_str() {
        "epsilon-greedy" => {
            evaluator.evaluate_epsilon_greedy(&args.property_id, &bandit_config, args.simulations)
        }
        "thompson" => {
            evaluator.evaluate_thompson(&args.property_id, &bandit_config, args.simulations)
        }
        other => anyhow::bail!("unknown policy '{other}' (expected epsilon-greedy or thompson)"),
    };

    match result {
        Some(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        None => anyhow::bail!("no episodes found for property {}", args.property_id),
    }
}

//! Offline bandit policy evaluation.
//!
//! Replays historical pricing episodes through a fresh bandit and
//! estimates counterfactual revenue. Booking probability under a
//! counterfactual price follows a simple constant-elasticity model:
//! `p = p_hist * exp(elasticity * (p_new / p_hist - 1))`.

use super::bandit::{BanditConfig, BanditContext, ContextualBandit, ThompsonSamplingBandit};
use crate::models::Season;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Price elasticity of demand used for counterfactual booking odds.
pub const PRICE_ELASTICITY: f64 = -1.5;

/// One historical pricing episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub property_id: String,
    pub stay_date: String,
    pub quote_time: String,
    /// Price actually shown.
    pub price: f64,
    pub booking_made: bool,
    /// Revenue realized (0 when not booked).
    pub revenue: f64,
    pub occupancy_rate: f64,
    pub lead_days: i64,
    pub season: Season,
    pub day_of_week: u8,
    pub is_weekend: bool,
    pub is_holiday: bool,
    pub los: u32,
    pub competitor_p50: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OfflineEvaluationResult {
    pub policy_name: String,
    pub total_episodes: usize,
    pub total_reward: f64,
    pub avg_reward: f64,
    pub conversion_rate: f64,
    pub avg_price: f64,
    pub revenue_uplift_pct: f64,
    pub conversion_uplift_pct: f64,
    pub confidence_interval_95: (f64, f64),
    pub arm_distribution: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct SimulationOutcome {
    total_reward: f64,
    total_bookings: usize,
    episodes: usize,
    price_sum: f64,
    arm_counts: HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy)]
enum PolicyKind {
    EpsilonGreedy,
    Thompson,
}

pub struct OfflineEvaluator {
    episodes: Vec<EpisodeRecord>,
}

impl OfflineEvaluator {
    pub fn new(episodes: Vec<EpisodeRecord>) -> Self {
        info!(
            episodes = episodes.len(),
            "Loaded historical episodes for offline evaluation"
        );
        Self { episodes }
    }

    /// Evaluate the epsilon-greedy policy with Monte-Carlo replay
    /// (default 100 simulations over shuffled history).
    pub fn evaluate_epsilon_greedy(
        &self,
        property_id: &str,
        config: &BanditConfig,
        num_simulations: usize,
    ) -> Option<OfflineEvaluationResult> {
        self.evaluate(
            property_id,
            config,
            num_simulations,
            PolicyKind::EpsilonGreedy,
            format!("epsilon-greedy-{}", config.epsilon),
        )
    }

    /// Evaluate Thompson Sampling with Monte-Carlo replay.
    pub fn evaluate_thompson(
        &self,
        property_id: &str,
        config: &BanditConfig,
        num_simulations: usize,
    ) -> Option<OfflineEvaluationResult> {
        self.evaluate(
            property_id,
            config,
            num_simulations,
            PolicyKind::Thompson,
            "thompson-sampling".to_string(),
        )
    }

    fn evaluate(
        &self,
        property_id: &str,
        config: &BanditConfig,
        num_simulations: usize,
        policy: PolicyKind,
        policy_name: String,
    ) -> Option<OfflineEvaluationResult> {
        let episodes: Vec<&EpisodeRecord> = self
            .episodes
            .iter()
            .filter(|e| e.property_id == property_id)
            .collect();
        if episodes.is_empty() {
            warn!(property_id, "No historical data for offline evaluation");
            return None;
        }

        let outcomes: Vec<SimulationOutcome> = (0..num_simulations.max(1))
            .map(|sim| self.run_simulation(property_id, config, &episodes, sim as u64, policy))
            .collect();

        let sims = outcomes.len() as f64;
        let rewards: Vec<f64> = outcomes.iter().map(|o| o.total_reward).collect();
        let reward_mean = rewards.iter().sum::<f64>() / sims;
        let reward_std =
            (rewards.iter().map(|r| (r - reward_mean).powi(2)).sum::<f64>() / sims).sqrt();

        let conversion_rate = outcomes
            .iter()
            .map(|o| o.total_bookings as f64 / o.episodes.max(1) as f64)
            .sum::<f64>()
            / sims;
        let avg_price = outcomes
            .iter()
            .map(|o| o.price_sum / o.episodes.max(1) as f64)
            .sum::<f64>()
            / sims;

        let mut arm_distribution: HashMap<String, u64> = HashMap::new();
        for outcome in &outcomes {
            for (arm, count) in &outcome.arm_counts {
                *arm_distribution.entry(arm.clone()).or_insert(0) += count;
            }
        }
        for count in arm_distribution.values_mut() {
            *count /= outcomes.len() as u64;
        }

        // Historical baseline.
        let baseline_reward: f64 = episodes.iter().map(|e| e.revenue).sum();
        let baseline_conversion = episodes.iter().filter(|e| e.booking_made).count() as f64
            / episodes.len() as f64;

        let revenue_uplift_pct = if baseline_reward > 0.0 {
            (reward_mean - baseline_reward) / baseline_reward * 100.0
        } else {
            0.0
        };
        let conversion_uplift_pct = if baseline_conversion > 0.0 {
            (conversion_rate - baseline_conversion) / baseline_conversion * 100.0
        } else {
            0.0
        };

        let result = OfflineEvaluationResult {
            policy_name,
            total_episodes: episodes.len(),
            total_reward: reward_mean,
            avg_reward: reward_mean / episodes.len() as f64,
            conversion_rate,
            avg_price,
            revenue_uplift_pct,
            conversion_uplift_pct,
            confidence_interval_95: (
                reward_mean - 1.96 * reward_std,
                reward_mean + 1.96 * reward_std,
            ),
            arm_distribution,
        };

        info!(
            property_id,
            policy = %result.policy_name,
            revenue_uplift_pct = result.revenue_uplift_pct,
            conversion_uplift_pct = result.conversion_uplift_pct,
            "Offline evaluation complete"
        );

        Some(result)
    }

    fn run_simulation(
        &self,
        property_id: &str,
        config: &BanditConfig,
        episodes: &[&EpisodeRecord],
        seed: u64,
        policy: PolicyKind,
    ) -> SimulationOutcome {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut shuffled: Vec<&EpisodeRecord> = episodes.to_vec();
        shuffled.shuffle(&mut rng);

        let mut greedy = ContextualBandit::new(property_id, config.clone());
        let mut thompson =
            ThompsonSamplingBandit::new(property_id, 1.0, 1.0, config.min_price, config.max_price);

        let mut outcome = SimulationOutcome::default();

        for episode in shuffled {
            let context = BanditContext {
                occupancy_rate: episode.occupancy_rate,
                lead_days: episode.lead_days,
                season: episode.season,
                day_of_week: episode.day_of_week,
                is_weekend: episode.is_weekend,
                is_holiday: episode.is_holiday,
                los: episode.los,
                competitor_p50: episode.competitor_p50,
                // Historical price stands in as the base the delta acts on.
                base_price: episode.price,
            };

            let action = match policy {
                PolicyKind::EpsilonGreedy => greedy.select_arm(&context),
                PolicyKind::Thompson => thompson.select_arm(&context),
            };

            let booked = Self::simulate_booking(&mut rng, episode, action.final_price);
            let revenue = if booked { action.final_price } else { 0.0 };

            match policy {
                PolicyKind::EpsilonGreedy => greedy.update_reward(&action.arm_id, booked, revenue),
                PolicyKind::Thompson => thompson.update_reward(&action.arm_id, booked, revenue),
            }

            outcome.total_reward += revenue;
            outcome.total_bookings += usize::from(booked);
            outcome.episodes += 1;
            outcome.price_sum += action.final_price;
            *outcome.arm_counts.entry(action.arm_id).or_insert(0) += 1;
        }

        outcome
    }

    /// Booking simulation: higher counterfactual prices suppress the
    /// historical booking probability via constant elasticity.
    fn simulate_booking(
        rng: &mut ChaCha8Rng,
        episode: &EpisodeRecord,
        counterfactual_price: f64,
    ) -> bool {
        if episode.price <= 0.0 || !episode.booking_made {
            return false;
        }
        let price_ratio = counterfactual_price / episode.price;
        let probability = (PRICE_ELASTICITY * (price_ratio - 1.0)).exp().min(1.0);
        rng.gen::<f64>() < probability
    }
}

//! Route handlers for the pricing service.
//!
//! The only non-quote response on the scoring path is a 400 for an
//! input error; every other condition degrades inside the quote.

use super::AppState;
use crate::experiments::Variant;
use crate::models::{Outcome, PriceQuote, PricingRequest};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/score", post(score))
        .route("/outcomes", post(submit_outcomes))
        .route("/model-info", get(model_info))
        .route("/health", get(health))
        .route("/quotes/recent", get(recent_quotes))
        .route("/experiments", get(list_experiments).post(create_experiment))
        .route("/experiments/:experiment_id/stop", post(stop_experiment))
        .route("/experiments/:experiment_id/comparison", get(experiment_comparison))
        .route("/bandits/:property_id/statistics", get(bandit_statistics))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// GetPriceQuote.
async fn score(
    State(state): State<AppState>,
    Json(request): Json<PricingRequest>,
) -> Result<Json<PriceQuote>, (StatusCode, Json<ErrorBody>)> {
    match state.engine.score(&request).await {
        Ok(quote) => Ok(Json(quote)),
        Err(err) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: err.to_string(),
            }),
        )),
    }
}

/// One outcome on the wire.
#[derive(Debug, Deserialize)]
pub struct OutcomeSubmission {
    pub property_id: String,
    #[serde(default)]
    pub stay_date: Option<String>,
    pub quoted_price: f64,
    pub booked: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub final_price: Option<f64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub action_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitOutcomesRequest {
    pub outcomes: Vec<OutcomeSubmission>,
}

#[derive(Debug, Serialize)]
pub struct SubmitOutcomesResponse {
    pub success: bool,
    pub processed: usize,
    pub invalid: usize,
    pub duplicates: usize,
}

/// SubmitOutcomes. Stores the batch, posts bandit rewards for outcomes
/// that carry an action id, and forwards experiment attribution found
/// in the metadata.
async fn submit_outcomes(
    State(state): State<AppState>,
    Json(request): Json<SubmitOutcomesRequest>,
) -> Result<Json<SubmitOutcomesResponse>, (StatusCode, Json<ErrorBody>)> {
    let mut by_property: HashMap<String, Vec<Outcome>> = HashMap::new();
    for submission in &request.outcomes {
        by_property
            .entry(submission.property_id.clone())
            .or_default()
            .push(Outcome {
                property_id: submission.property_id.clone(),
                timestamp: submission.timestamp,
                stay_date: submission.stay_date.clone(),
                quoted_price: submission.quoted_price,
                accepted: submission.booked,
                final_price: submission.final_price,
                context: submission.metadata.clone(),
                action_id: submission.action_id.clone(),
            });
    }

    let mut processed = 0;
    let mut invalid = 0;
    let mut duplicates = 0;
    for (property_id, outcomes) in &by_property {
        match state.outcomes.append(property_id, outcomes) {
            Ok(stats) => {
                processed += stats.stored;
                invalid += stats.invalid;
                duplicates += stats.duplicates;
            }
            Err(err) => {
                warn!(property_id, error = %err, "Outcome append failed");
                return Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: format!("storage failure for {property_id}: {err} (processed {processed})"),
                    }),
                ));
            }
        }
    }

    for submission in &request.outcomes {
        // Delayed bandit rewards, matched by action id.
        if let Some(action_id) = &submission.action_id {
            let revenue = submission.final_price.unwrap_or(submission.quoted_price);
            let applied = state.bandits.post_reward(
                &submission.property_id,
                action_id,
                submission.booked,
                revenue,
            );
            debug!(
                property_id = %submission.property_id,
                action_id,
                applied,
                "Bandit reward post"
            );
        }

        // Experiment attribution riding along in the metadata.
        if let Some(metadata) = &submission.metadata {
            let experiment_id = metadata.get("experiment_id").and_then(|v| v.as_str());
            let variant = metadata.get("variant").and_then(|v| v.as_str());
            if let (Some(experiment_id), Some(variant)) = (experiment_id, variant) {
                let variant = match variant {
                    "ml" => Variant::Ml,
                    _ => Variant::RuleBased,
                };
                state.experiments.log_result(
                    experiment_id,
                    &submission.property_id,
                    metadata.get("user_id").and_then(|v| v.as_str()).unwrap_or(""),
                    variant,
                    submission.quoted_price,
                    submission.booked,
                    submission.final_price,
                    metadata.get("lead_days").and_then(|v| v.as_i64()).unwrap_or(0),
                    metadata.get("los").and_then(|v| v.as_u64()).unwrap_or(1) as u32,
                    metadata
                        .get("occupancy_rate")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.5),
                );
            }
        }
    }

    Ok(Json(SubmitOutcomesResponse {
        success: true,
        processed,
        invalid,
        duplicates,
    }))
}

#[derive(Debug, Serialize)]
pub struct ModelInfoResponse {
    pub engine: crate::pricing::engine::EngineInfo,
    pub properties_with_outcomes: Vec<String>,
}

/// GetModelInfo.
async fn model_info(State(state): State<AppState>) -> Json<ModelInfoResponse> {
    Json(ModelInfoResponse {
        engine: state.engine.engine_info(),
        properties_with_outcomes: state.outcomes.list_properties().unwrap_or_default(),
    })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
}

/// HealthCheck.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RecentQuotesQuery {
    pub limit: Option<usize>,
}

async fn recent_quotes(
    Query(params): Query<RecentQuotesQuery>,
    State(state): State<AppState>,
) -> Json<Vec<crate::pricing::QuoteLogEntry>> {
    Json(state.engine.recent_quotes(params.limit.unwrap_or(100)))
}

#[derive(Debug, Deserialize)]
pub struct CreateExperimentRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default = "default_ml_traffic")]
    pub ml_traffic_percentage: f64,
    #[serde(default = "default_randomization_unit")]
    pub randomization_unit: crate::experiments::RandomizationUnit,
    #[serde(default)]
    pub metrics: Option<Vec<String>>,
}

fn default_ml_traffic() -> f64 {
    50.0
}

fn default_randomization_unit() -> crate::experiments::RandomizationUnit {
    crate::experiments::RandomizationUnit::Property
}

#[derive(Debug, Serialize)]
pub struct CreateExperimentResponse {
    pub experiment_id: String,
}

async fn create_experiment(
    State(state): State<AppState>,
    Json(request): Json<CreateExperimentRequest>,
) -> Json<CreateExperimentResponse> {
    let experiment_id = state.experiments.create_experiment(
        &request.name,
        &request.description,
        request.start_date,
        request.end_date,
        request.ml_traffic_percentage,
        request.randomization_unit,
        request.metrics,
    );
    Json(CreateExperimentResponse { experiment_id })
}

#[derive(Debug, Deserialize)]
pub struct ListExperimentsQuery {
    #[serde(default)]
    pub active_only: bool,
}

async fn list_experiments(
    Query(params): Query<ListExperimentsQuery>,
    State(state): State<AppState>,
) -> Json<Vec<crate::experiments::ExperimentConfig>> {
    Json(state.experiments.list_experiments(params.active_only))
}

async fn stop_experiment(
    Path(experiment_id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, StatusCode> {
    if state.experiments.get_experiment(&experiment_id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    state.experiments.stop_experiment(&experiment_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn experiment_comparison(
    Path(experiment_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<crate::experiments::ab::VariantComparison>, StatusCode> {
    if state.experiments.get_experiment(&experiment_id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(state.experiments.compare(&experiment_id)))
}

async fn bandit_statistics(
    Path(property_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<crate::experiments::bandit::BanditStatistics>, StatusCode> {
    state
        .bandits
        .statistics(&property_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

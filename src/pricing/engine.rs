//! Pricing pipeline.
//!
//! Orchestrates one scoring request: validation, competitor fetch,
//! policy routing, ML or rule scoring, bandit adjustment, guardrails,
//! grid snap, and explanation. Only validation can fail the request;
//! every later step degrades inside the quote, and an internal error
//! lands on the named safe-default branch instead of a 5xx.

use crate::error::RequestError;
use crate::experiments::{AbFramework, BanditContext, BanditPool, Variant};
use crate::features::{self, AssemblyInput};
use crate::gateway::{BandLookup, CompetitorBand, CompetitorGateway};
use crate::models::{
    CompetitorEcho, ConfidenceBand, Config, ExpectedOutcome, PriceQuote, PricingMethod,
    PricingRequest, QuoteSafety,
};
use crate::pricing::guardrails::{snap_to_grid, Guardrails, EVENT_FLOOR_RATIO};
use crate::pricing::rules::{self, PriceContext};
use crate::registry::{ModelRegistry, ModelType, LATEST};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

const QUOTE_LOG_CAPACITY: usize = 1000;

/// Which branch of the state machine produced the quote. Exactly one
/// of these is recorded per scoring request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorePath {
    MlScored,
    RuleScored,
    MlDegradedToRule,
    Fallback,
}

impl ScorePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScorePath::MlScored => "ml_scored",
            ScorePath::RuleScored => "rule_scored",
            ScorePath::MlDegradedToRule => "ml_degraded_to_rule",
            ScorePath::Fallback => "fallback",
        }
    }
}

/// One line of the in-memory quote log.
#[derive(Debug, Clone, Serialize)]
pub struct QuoteLogEntry {
    pub timestamp: DateTime<Utc>,
    pub property_id: String,
    pub user_id: String,
    pub price: f64,
    pub pricing_method: PricingMethod,
    pub score_path: ScorePath,
    pub variant: Option<Variant>,
    pub experiment_id: Option<String>,
    pub arm_id: Option<String>,
    pub action_id: Option<String>,
    pub reasons: Vec<String>,
    pub latency_ms: u64,
}

/// Engine parameters surfaced by GetModelInfo.
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub model_type: String,
    pub base_price: f64,
    pub price_range: (f64, f64),
    pub loaded_models: Vec<crate::registry::ModelSummary>,
    pub registry: crate::registry::RegistryStats,
}

#[derive(Debug, Clone, Copy)]
struct ParsedRequest {
    stay: DateTime<Utc>,
    stay_date: NaiveDate,
    lead_days: i64,
    occupancy_rate: f64,
}

pub struct PricingEngine {
    config: Config,
    gateway: Arc<CompetitorGateway>,
    registry: Arc<ModelRegistry>,
    experiments: Arc<AbFramework>,
    bandits: Arc<BanditPool>,
    quote_log: Mutex<VecDeque<QuoteLogEntry>>,
}

impl PricingEngine {
    pub fn new(
        config: Config,
        gateway: Arc<CompetitorGateway>,
        registry: Arc<ModelRegistry>,
        experiments: Arc<AbFramework>,
        bandits: Arc<BanditPool>,
    ) -> Self {
        Self {
            config,
            gateway,
            registry,
            experiments,
            bandits,
            quote_log: Mutex::new(VecDeque::with_capacity(QUOTE_LOG_CAPACITY)),
        }
    }

    /// Score one pricing request. The only error exit is request
    /// validation; anything after that produces a quote.
    pub async fn score(&self, request: &PricingRequest) -> Result<PriceQuote, RequestError> {
        let started = Instant::now();
        let parsed = Self::validate(request)?;

        let quote = match tokio::time::timeout(
            self.config.scoring_timeout,
            self.score_pipeline(request, parsed, started),
        )
        .await
        {
            Ok(Ok(quote)) => quote,
            Ok(Err(err)) => {
                error!(property_id = %request.property_id, error = %err, "Scoring error, using fallback");
                self.fallback_quote(request, parsed, started)
            }
            Err(_) => {
                error!(property_id = %request.property_id, "Scoring timed out, using fallback");
                self.fallback_quote(request, parsed, started)
            }
        };

        Ok(quote)
    }

    fn validate(request: &PricingRequest) -> Result<ParsedRequest, RequestError> {
        let stay = parse_point_in_time(&request.stay_date)
            .ok_or_else(|| RequestError::InvalidStayDate(request.stay_date.clone()))?;
        let quote_time = parse_point_in_time(&request.quote_time)
            .ok_or_else(|| RequestError::InvalidQuoteTime(request.quote_time.clone()))?;

        // Same-day quotes are fine; only a stay in the past is rejected.
        if stay.date_naive() < quote_time.date_naive() {
            return Err(RequestError::StayBeforeQuote {
                stay: request.stay_date.clone(),
                quote: request.quote_time.clone(),
            });
        }

        if request.inventory.capacity == 0 {
            return Err(RequestError::NonPositiveCapacity);
        }
        if request.inventory.remaining > request.inventory.capacity {
            return Err(RequestError::RemainingExceedsCapacity {
                remaining: request.inventory.remaining,
                capacity: request.inventory.capacity,
            });
        }
        if request.product.los == 0 {
            return Err(RequestError::ZeroLengthOfStay);
        }
        if request.context.day_of_week > 6 {
            return Err(RequestError::InvalidDayOfWeek(request.context.day_of_week));
        }

        if let Some(grid) = &request.allowed_price_grid {
            if grid.is_empty() || grid.iter().any(|p| !p.is_finite() || *p <= 0.0) {
                return Err(RequestError::InvalidPriceGrid);
            }
        }

        let market = &request.market;
        let ordered = |lo: Option<f64>, hi: Option<f64>| match (lo, hi) {
            (Some(lo), Some(hi)) => lo <= hi,
            _ => true,
        };
        if !ordered(market.comp_price_p10, market.comp_price_p50)
            || !ordered(market.comp_price_p50, market.comp_price_p90)
            || !ordered(market.comp_price_p10, market.comp_price_p90)
        {
            return Err(RequestError::UnorderedMarketBand);
        }

        let lead_days = (stay - quote_time).num_days().max(0);
        let occupancy_rate =
            1.0 - request.inventory.remaining as f64 / request.inventory.capacity as f64;

        Ok(ParsedRequest {
            stay,
            stay_date: stay.date_naive(),
            lead_days,
            occupancy_rate,
        })
    }

    /// Competitor band: caller-provided percentiles win, the gateway
    /// fills in otherwise (when competitor pricing is enabled).
    async fn resolve_band(&self, request: &PricingRequest, stay_date: NaiveDate) -> BandLookup {
        if let Some(p50) = request.market.comp_price_p50 {
            return BandLookup {
                band: Some(CompetitorBand {
                    p10: request.market.comp_price_p10,
                    p50,
                    p90: request.market.comp_price_p90,
                    count: 0,
                    source: "provided".to_string(),
                }),
                degradation: None,
            };
        }

        if !request.toggles.use_competitors {
            return BandLookup::default();
        }

        self.gateway.get_band(&request.property_id, stay_date).await
    }

    async fn score_pipeline(
        &self,
        request: &PricingRequest,
        parsed: ParsedRequest,
        started: Instant,
    ) -> anyhow::Result<PriceQuote> {
        let lookup = self.resolve_band(request, parsed.stay_date).await;
        let band = lookup.band;
        let mut degradations: Vec<String> = lookup.degradation.into_iter().collect();

        // Routing: an active experiment decides the variant; without
        // one, the toggles do.
        let assignment = self.experiments.route(&request.property_id, &request.user_id);
        let variant = assignment.as_ref().map(|a| a.variant);
        let experiment_id = assignment.map(|a| a.experiment_id);
        let ml_allowed = request.toggles.use_ml && variant != Some(Variant::RuleBased);

        let base_price = band.as_ref().map(|b| b.p50).unwrap_or(self.config.base_price);
        let price_ctx = PriceContext {
            base_price,
            occupancy_rate: parsed.occupancy_rate,
            lead_days: parsed.lead_days,
            season: request.context.season,
            day_of_week: request.context.day_of_week,
            los: request.product.los,
            refundable: request.product.refundable,
            apply_seasonality: request.toggles.apply_seasonality,
            aggressive: request.toggles.aggressive,
            conservative: request.toggles.conservative,
        };

        let mut conversion_prob = None;
        let (mut price, method, path) = if ml_allowed {
            let record = features::assemble(&AssemblyInput {
                stay: parsed.stay,
                lead_days: parsed.lead_days,
                occupancy_rate: parsed.occupancy_rate,
                request,
                band: band.as_ref(),
            });

            match self
                .registry
                .predict(&request.property_id, &record, ModelType::Conversion, LATEST)
                .await
            {
                Some(prob) => {
                    conversion_prob = Some(prob);
                    (
                        rules::ml_price(prob, &price_ctx),
                        PricingMethod::MlElasticity,
                        ScorePath::MlScored,
                    )
                }
                None => {
                    warn!(
                        property_id = %request.property_id,
                        "ML prediction unavailable, degrading to rule-based"
                    );
                    degradations
                        .push("ML model unavailable; using rule-based pricing".to_string());
                    (
                        rules::rule_price(&price_ctx),
                        PricingMethod::RuleBased,
                        ScorePath::MlDegradedToRule,
                    )
                }
            }
        } else {
            (
                rules::rule_price(&price_ctx),
                PricingMethod::RuleBased,
                ScorePath::RuleScored,
            )
        };

        // Bandit adjustment: the selected delta applies to whichever
        // price the scoring path produced.
        let mut arm_id = None;
        let mut action_id = None;
        if request.toggles.use_bandit && ml_allowed {
            let bandit_ctx = BanditContext {
                occupancy_rate: parsed.occupancy_rate,
                lead_days: parsed.lead_days,
                season: request.context.season,
                day_of_week: request.context.day_of_week,
                is_weekend: matches!(request.context.day_of_week, 5 | 6),
                is_holiday: request.context.is_holiday,
                los: request.product.los,
                competitor_p50: band.as_ref().map(|b| b.p50),
                base_price: price,
            };
            let action = self.bandits.select(&request.property_id, &bandit_ctx);
            price *= 1.0 + action.delta_pct / 100.0;
            arm_id = Some(action.arm_id);
            action_id = Some(action.action_id);
        }

        // Guardrails: absolute bounds, competitive cap, event clamp,
        // then grid snap.
        let guardrails = Guardrails::new(self.config.min_price, self.config.max_price);
        let event_floor = (request.toggles.conservative
            && (request.context.is_holiday || parsed.occupancy_rate > 0.9))
            .then(|| base_price * EVENT_FLOOR_RATIO);
        let pre_snap = round2(guardrails.apply(
            price,
            band.as_ref().map(|b| b.p50),
            event_floor,
        ));
        let final_price = match &request.allowed_price_grid {
            Some(grid) => snap_to_grid(pre_snap, grid),
            None => pre_snap,
        };

        // Alternative rungs come from the pre-snap center so callers
        // see what the grid constrained away.
        let price_grid: Vec<f64> = [0.9, 0.95, 1.0, 1.05, 1.1]
            .iter()
            .map(|m| round2(guardrails.clamp(pre_snap * m)))
            .collect();

        let (lower_factor, upper_factor) = if parsed.lead_days > 180 {
            (0.85, 1.15)
        } else {
            (0.9, 1.1)
        };
        let conf_band = ConfidenceBand {
            lower: round2(guardrails.clamp(final_price * lower_factor)),
            upper: round2(guardrails.clamp(final_price * upper_factor)),
        };

        let demand_signal = conversion_prob.map(|p| 0.3 * p).unwrap_or(0.2);
        let expected = ExpectedOutcome {
            occ_now: round3(parsed.occupancy_rate),
            occ_end_bucket: round3((parsed.occupancy_rate + demand_signal).min(1.0)),
        };

        let reasons = self.build_reasons(
            request,
            parsed,
            band.as_ref(),
            final_price,
            conversion_prob,
            &degradations,
        );

        let competitor_data = band.map(|b| CompetitorEcho {
            p10: b.p10,
            p50: b.p50,
            p90: b.p90,
            count: (b.count > 0).then_some(b.count),
            source: b.source,
        });

        let quote = PriceQuote {
            price: final_price,
            price_grid,
            conf_band,
            expected,
            reasons,
            safety: QuoteSafety {
                pricing_method: method,
                ml_conversion_prob: conversion_prob.map(round4),
                occupancy_rate: round3(parsed.occupancy_rate),
                lead_days: parsed.lead_days,
                season: request.context.season,
                day_of_week: request.context.day_of_week,
                competitor_data,
            },
        };

        self.record_quote(
            request,
            &quote,
            path,
            variant,
            experiment_id,
            arm_id,
            action_id,
            started,
        );
        Ok(quote)
    }

    /// Safe default when anything inside the pipeline breaks: the
    /// property's base price with a wide band. Pricing never 5xxes for
    /// computable inputs.
    fn fallback_quote(
        &self,
        request: &PricingRequest,
        parsed: ParsedRequest,
        started: Instant,
    ) -> PriceQuote {
        let base = self.config.base_price;
        let quote = PriceQuote {
            price: round2(base),
            price_grid: [0.9, 0.95, 1.0, 1.05, 1.1]
                .iter()
                .map(|m| round2(base * m))
                .collect(),
            conf_band: ConfidenceBand {
                lower: round2(base * 0.8),
                upper: round2(base * 1.2),
            },
            expected: ExpectedOutcome {
                occ_now: 0.5,
                occ_end_bucket: 0.6,
            },
            reasons: vec!["Fallback pricing due to calculation error".to_string()],
            safety: QuoteSafety {
                pricing_method: PricingMethod::Fallback,
                ml_conversion_prob: None,
                occupancy_rate: round3(parsed.occupancy_rate),
                lead_days: parsed.lead_days,
                season: request.context.season,
                day_of_week: request.context.day_of_week,
                competitor_data: None,
            },
        };

        self.record_quote(
            request,
            &quote,
            ScorePath::Fallback,
            None,
            None,
            None,
            None,
            started,
        );
        quote
    }

    #[allow(clippy::too_many_arguments)]
    fn build_reasons(
        &self,
        request: &PricingRequest,
        parsed: ParsedRequest,
        band: Option<&CompetitorBand>,
        final_price: f64,
        conversion_prob: Option<f64>,
        degradations: &[String],
    ) -> Vec<String> {
        let mut reasons = Vec::new();

        if let Some(prob) = conversion_prob {
            reasons.push(format!(
                "ML elasticity model (conversion prob: {:.1}%)",
                prob * 100.0
            ));
            let demand = if prob > 0.7 {
                "High"
            } else if prob > 0.4 {
                "Medium"
            } else {
                "Low"
            };
            reasons.push(format!("Predicted demand: {demand}"));
        }

        // Competitive positioning.
        if let Some(band) = band {
            let p50 = band.p50;
            let diff_pct = (final_price - p50) / p50 * 100.0;
            if final_price > p50 * 1.1 {
                reasons.push(format!(
                    "Premium positioning: €{final_price:.2} vs market median €{p50:.2} (+{diff_pct:.0}%)"
                ));
            } else if final_price < p50 * 0.9 {
                reasons.push(format!(
                    "Competitive positioning: €{final_price:.2} vs market median €{p50:.2} ({diff_pct:.0}%)"
                ));
            } else {
                reasons.push(format!(
                    "Market-aligned: €{final_price:.2} vs market median €{p50:.2} ({diff_pct:+.0}%)"
                ));
            }

            if let (Some(p10), Some(p90)) = (band.p10, band.p90) {
                reasons.push(format!("Market range: €{p10:.2} (low) to €{p90:.2} (high)"));
                if band.count > 0 {
                    reasons.push(format!(
                        "Based on {} competitor properties ({})",
                        band.count, band.source
                    ));
                }
            }
        }

        // Occupancy signal.
        if parsed.occupancy_rate > 0.8 {
            reasons.push(format!(
                "High demand: {:.0}% occupancy",
                parsed.occupancy_rate * 100.0
            ));
        } else if parsed.occupancy_rate < 0.3 {
            reasons.push(format!(
                "Low demand: {:.0}% occupancy",
                parsed.occupancy_rate * 100.0
            ));
        }

        // Lead-time signal.
        if parsed.lead_days < 7 {
            reasons.push(format!("Last-minute booking ({} days)", parsed.lead_days));
        } else if parsed.lead_days > 90 {
            reasons.push(format!(
                "Advance booking discount ({} days)",
                parsed.lead_days
            ));
        }

        // Seasonal signal.
        reasons.push(format!("{} season pricing", request.context.season.as_str()));

        // Weekend premium (Friday/Saturday stays).
        if matches!(request.context.day_of_week, 4 | 5) {
            reasons.push("Weekend premium".to_string());
        }

        // Length-of-stay signal.
        if request.product.los >= 7 {
            reasons.push(format!(
                "Weekly stay discount ({} nights)",
                request.product.los
            ));
        }

        // Strategy toggles.
        if request.toggles.aggressive {
            reasons.push("Aggressive pricing strategy active".to_string());
        }
        if request.toggles.conservative {
            reasons.push("Conservative pricing strategy active".to_string());
        }

        // Degradation notes come last.
        reasons.extend(degradations.iter().cloned());

        reasons
    }

    #[allow(clippy::too_many_arguments)]
    fn record_quote(
        &self,
        request: &PricingRequest,
        quote: &PriceQuote,
        path: ScorePath,
        variant: Option<Variant>,
        experiment_id: Option<String>,
        arm_id: Option<String>,
        action_id: Option<String>,
        started: Instant,
    ) {
        let latency_ms = started.elapsed().as_millis() as u64;

        counter!("quotes_total", 1, "method" => quote.safety.pricing_method.as_str());
        histogram!("quote_latency_ms", latency_ms as f64);

        info!(
            property_id = %request.property_id,
            user_id = %request.user_id,
            price = quote.price,
            method = quote.safety.pricing_method.as_str(),
            path = path.as_str(),
            latency_ms,
            "Price quoted"
        );

        let entry = QuoteLogEntry {
            timestamp: Utc::now(),
            property_id: request.property_id.clone(),
            user_id: request.user_id.clone(),
            price: quote.price,
            pricing_method: quote.safety.pricing_method,
            score_path: path,
            variant,
            experiment_id,
            arm_id,
            action_id,
            reasons: quote.reasons.clone(),
            latency_ms,
        };

        let mut log = self.quote_log.lock();
        if log.len() >= QUOTE_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    pub fn recent_quotes(&self, limit: usize) -> Vec<QuoteLogEntry> {
        self.quote_log
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn engine_info(&self) -> EngineInfo {
        EngineInfo {
            model_type: "rule-based + ML elasticity".to_string(),
            base_price: self.config.base_price,
            price_range: (self.config.min_price, self.config.max_price),
            loaded_models: self.registry.loaded_models(),
            registry: self.registry.registry_stats(),
        }
    }
}

fn parse_point_in_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

fn round4(x: f64) -> f64 {
    (x * 10000.0).round() / 10000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiments::{BanditConfig, RandomizationUnit};
    use crate::gateway::{GatewayConfig, MockCompetitorSource};
    use crate::models::{
        InventorySnapshot, MarketSnapshot, Product, RequestContext, Season, StrategyToggles,
        Weather,
    };
    use crate::registry::{LinearModel, LinkFunction};
    use std::collections::HashMap;

    fn engine_with(config: Config, model_dir: &std::path::Path) -> PricingEngine {
        let gateway = Arc::new(CompetitorGateway::new(
            Arc::new(MockCompetitorSource::new(config.base_price)),
            GatewayConfig::default(),
        ));
        let registry = Arc::new(ModelRegistry::new(model_dir).unwrap());
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
        PricingEngine::new(config, gateway, registry, experiments, bandits)
    }

    /// Plants a constant-probability conversion model: zero weights,
    /// bias = logit(p).
    async fn plant_conversion_model(engine: &PricingEngine, property_id: &str, prob: f64) {
        let bias = (prob / (1.0 - prob)).ln();
        let metadata = engine
            .registry
            .save_artifact(
                property_id,
                ModelType::Conversion,
                &LinearModel {
                    weights: vec![0.0; 3],
                    bias,
                    link: LinkFunction::Logistic,
                },
                vec![
                    "occupancy_rate".to_string(),
                    "lead_time".to_string(),
                    "is_weekend".to_string(),
                ],
                HashMap::from([("auc".to_string(), 0.8)]),
                HashMap::new(),
            )
            .unwrap();
        engine
            .registry
            .promote_latest(property_id, ModelType::Conversion, &metadata.version)
            .unwrap();
    }

    fn summer_saturday_request() -> PricingRequest {
        PricingRequest {
            property_id: "p1".to_string(),
            user_id: "u1".to_string(),
            stay_date: "2025-07-19".to_string(),
            quote_time: "2025-07-12T10:00:00Z".to_string(),
            product: Product {
                product_type: "standard".to_string(),
                refundable: false,
                los: 2,
            },
            inventory: InventorySnapshot {
                capacity: 100,
                remaining: 15,
            },
            market: MarketSnapshot {
                comp_price_p10: Some(120.0),
                comp_price_p50: Some(160.0),
                comp_price_p90: Some(210.0),
            },
            context: RequestContext {
                season: Season::Summer,
                day_of_week: 5,
                is_holiday: false,
                weather: Weather {
                    temperature: Some(28.0),
                    precipitation: Some(0.0),
                },
            },
            toggles: StrategyToggles::default(),
            allowed_price_grid: None,
        }
    }

    #[tokio::test]
    async fn test_rejects_stay_before_quote() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Config::default(), dir.path());

        let mut request = summer_saturday_request();
        request.stay_date = "2025-07-01".to_string();

        let err = engine.score(&request).await.unwrap_err();
        assert!(matches!(err, RequestError::StayBeforeQuote { .. }));
    }

    #[tokio::test]
    async fn test_rejects_bad_inventory_and_grid() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Config::default(), dir.path());

        let mut request = summer_saturday_request();
        request.inventory.capacity = 0;
        assert!(matches!(
            engine.score(&request).await.unwrap_err(),
            RequestError::NonPositiveCapacity
        ));

        let mut request = summer_saturday_request();
        request.inventory.remaining = 200;
        assert!(matches!(
            engine.score(&request).await.unwrap_err(),
            RequestError::RemainingExceedsCapacity { .. }
        ));

        let mut request = summer_saturday_request();
        request.allowed_price_grid = Some(vec![]);
        assert!(matches!(
            engine.score(&request).await.unwrap_err(),
            RequestError::InvalidPriceGrid
        ));

        let mut request = summer_saturday_request();
        request.market.comp_price_p10 = Some(300.0);
        assert!(matches!(
            engine.score(&request).await.unwrap_err(),
            RequestError::UnorderedMarketBand
        ));
    }

    #[tokio::test]
    async fn test_summer_saturday_ml_capped_by_competitors() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Config::default(), dir.path());
        plant_conversion_model(&engine, "p1", 0.72).await;

        let quote = engine.score(&summer_saturday_request()).await.unwrap();

        // Raw ML price (160 x 1.2 x 1.1 x 1.3 x 1.25 = 343.2) must be
        // capped at 1.5 x P50 = 240.
        assert_eq!(quote.price, 240.0);
        assert_eq!(quote.safety.pricing_method, PricingMethod::MlElasticity);
        let prob = quote.safety.ml_conversion_prob.unwrap();
        assert!((prob - 0.72).abs() < 1e-3, "prob = {prob}");
        assert_eq!(quote.conf_band.lower, 216.0);
        assert_eq!(quote.conf_band.upper, 264.0);
        assert!(quote
            .reasons
            .iter()
            .any(|r| r.starts_with("ML elasticity model")));
        assert!(quote
            .reasons
            .iter()
            .any(|r| r.starts_with("Premium positioning")));
        assert!(quote.reasons.iter().any(|r| r.contains("High demand")));
    }

    #[tokio::test]
    async fn test_ml_unavailable_degrades_to_rules() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Config::default(), dir.path());

        let mut request = summer_saturday_request();
        request.market = MarketSnapshot::default();
        request.toggles.use_competitors = false;
        request.toggles.conservative = true;
        request.inventory = InventorySnapshot {
            capacity: 50,
            remaining: 45,
        };
        request.context.season = Season::Winter;
        request.context.day_of_week = 1;
        request.stay_date = "2025-02-04".to_string();
        request.quote_time = "2025-01-21T09:00:00Z".to_string();

        let quote = engine.score(&request).await.unwrap();

        assert_eq!(quote.safety.pricing_method, PricingMethod::RuleBased);
        // 100 x 0.9 (Winter) x 0.95 (Tue) x 1.05 (occ 0.1) x 1.1
        // (lead 14d) x 0.9 (conservative) = 88.88...
        let expected = 100.0 * 0.9 * 0.95 * 1.05 * 1.1 * 0.9;
        assert!((quote.price - round2(expected)).abs() < 1e-9, "price = {}", quote.price);
        assert!(quote.reasons.iter().any(|r| r.contains("Low demand")));
        assert!(quote
            .reasons
            .iter()
            .any(|r| r == "Conservative pricing strategy active"));
        assert!(quote
            .reasons
            .iter()
            .any(|r| r.contains("ML model unavailable")));

        let entries = engine.recent_quotes(1);
        assert_eq!(entries[0].score_path, ScorePath::MlDegradedToRule);
    }

    #[tokio::test]
    async fn test_grid_snap_last_minute_weekend() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Config::default(), dir.path());

        let mut request = summer_saturday_request();
        request.property_id = "p3".to_string();
        request.stay_date = "2025-11-15".to_string();
        request.quote_time = "2025-11-12T22:00:00Z".to_string();
        request.inventory = InventorySnapshot {
            capacity: 50,
            remaining: 20,
        };
        request.market = MarketSnapshot {
            comp_price_p10: Some(140.0),
            comp_price_p50: Some(170.0),
            comp_price_p90: Some(200.0),
        };
        request.context.season = Season::Fall;
        request.toggles.use_ml = false;
        request.allowed_price_grid = Some(vec![149.0, 169.0, 189.0, 209.0]);

        let quote = engine.score(&request).await.unwrap();

        // The published price lands on the allowed grid.
        let grid = [149.0, 169.0, 189.0, 209.0];
        assert!(
            grid.iter().any(|g| (g - quote.price).abs() < 1e-9),
            "price {} not on grid",
            quote.price
        );
        // Rungs reflect the pre-snap center: center rung x 0.9 and
        // x 1.1 bracket it symmetrically.
        assert_eq!(quote.price_grid.len(), 5);
        let center = quote.price_grid[2];
        assert!((quote.price_grid[0] - round2(center * 0.9)).abs() < 0.02);
        assert!((quote.price_grid[4] - round2(center * 1.1)).abs() < 0.02);
    }

    #[tokio::test]
    async fn test_conservative_holiday_floor() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Config::default(), dir.path());

        let mut request = summer_saturday_request();
        request.toggles.conservative = true;
        request.context.is_holiday = true;
        request.context.season = Season::Winter;
        request.product.los = 7;

        let quote = engine.score(&request).await.unwrap();
        // Base resolves to P50 = 160, so the floor is 128.
        assert!(quote.price >= 128.0 - 1e-9, "price = {}", quote.price);
    }

    #[tokio::test]
    async fn test_competitive_cap_property() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Config::default(), dir.path());

        let mut request = summer_saturday_request();
        request.toggles.aggressive = true;
        let quote = engine.score(&request).await.unwrap();
        assert!(quote.price <= 1.5 * 160.0 + 1e-9);
    }

    #[tokio::test]
    async fn test_band_ordering_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let engine = engine_with(config.clone(), dir.path());

        for remaining in [0, 15, 50, 100] {
            let mut request = summer_saturday_request();
            request.inventory = InventorySnapshot {
                capacity: 100,
                remaining,
            };
            let quote = engine.score(&request).await.unwrap();
            assert!(config.min_price <= quote.conf_band.lower + 1e-9);
            assert!(quote.conf_band.lower <= quote.price + 1e-9);
            assert!(quote.price <= quote.conf_band.upper + 1e-9);
            assert!(quote.conf_band.upper <= config.max_price + 1e-9);
        }
    }

    #[tokio::test]
    async fn test_bandit_adjustment_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Config::default(), dir.path());
        plant_conversion_model(&engine, "p1", 0.6).await;

        let mut request = summer_saturday_request();
        request.toggles.use_bandit = true;

        let quote = engine.score(&request).await.unwrap();
        assert!(quote.price > 0.0);

        let entries = engine.recent_quotes(1);
        assert!(entries[0].arm_id.is_some());
        assert!(entries[0].action_id.is_some());
    }

    #[tokio::test]
    async fn test_experiment_rule_variant_skips_ml() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Config::default(), dir.path());
        plant_conversion_model(&engine, "p1", 0.72).await;

        // 0% ML traffic: every key lands on the rule-based variant.
        engine.experiments.create_experiment(
            "all-rules",
            "holdout",
            Utc::now() - chrono::Duration::days(1),
            Utc::now() + chrono::Duration::days(1),
            0.0,
            RandomizationUnit::Property,
            None,
        );

        let quote = engine.score(&summer_saturday_request()).await.unwrap();
        assert_eq!(quote.safety.pricing_method, PricingMethod::RuleBased);

        let entries = engine.recent_quotes(1);
        assert_eq!(entries[0].score_path, ScorePath::RuleScored);
        assert_eq!(entries[0].variant, Some(Variant::RuleBased));
        assert!(entries[0].experiment_id.is_some());
    }
}

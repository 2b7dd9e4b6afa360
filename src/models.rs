use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Season of the stay date. Factors applied per season live in
/// `pricing::rules`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Season {
    Spring,
    Summer,
    Fall,
    Winter,
}

impl Season {
    pub fn as_str(&self) -> &'static str {
        match self {
            Season::Spring => "Spring",
            Season::Summer => "Summer",
            Season::Fall => "Fall",
            Season::Winter => "Winter",
        }
    }

    pub const ALL: [Season; 4] = [Season::Spring, Season::Summer, Season::Fall, Season::Winter];
}

/// Weather snapshot attached to a pricing request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Weather {
    pub temperature: Option<f64>,
    pub precipitation: Option<f64>,
}

/// Product being priced (room type, refundability, length of stay).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    #[serde(default = "default_product_type", rename = "type")]
    pub product_type: String,
    #[serde(default)]
    pub refundable: bool,
    #[serde(default = "default_los")]
    pub los: u32,
}

fn default_product_type() -> String {
    "standard".to_string()
}

fn default_los() -> u32 {
    1
}

impl Default for Product {
    fn default() -> Self {
        Self {
            product_type: default_product_type(),
            refundable: false,
            los: default_los(),
        }
    }
}

/// Inventory snapshot at quote time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub capacity: u32,
    pub remaining: u32,
}

/// Optional competitor percentiles supplied with the request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub comp_price_p10: Option<f64>,
    pub comp_price_p50: Option<f64>,
    pub comp_price_p90: Option<f64>,
}

/// Contextual inputs for a quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub season: Season,
    pub day_of_week: u8,
    #[serde(default)]
    pub is_holiday: bool,
    #[serde(default)]
    pub weather: Weather,
}

/// Strategy toggles controlling the pricing path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StrategyToggles {
    #[serde(default)]
    pub aggressive: bool,
    #[serde(default)]
    pub conservative: bool,
    #[serde(default = "default_true")]
    pub use_ml: bool,
    #[serde(default = "default_true")]
    pub use_competitors: bool,
    #[serde(default = "default_true")]
    pub apply_seasonality: bool,
    #[serde(default)]
    pub use_bandit: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StrategyToggles {
    fn default() -> Self {
        Self {
            aggressive: false,
            conservative: false,
            use_ml: true,
            use_competitors: true,
            apply_seasonality: true,
            use_bandit: false,
        }
    }
}

/// A single pricing request as received on the wire.
///
/// `stay_date` accepts either a date (`2025-07-19`) or a full RFC 3339
/// timestamp; date-only values are interpreted as midnight UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingRequest {
    pub property_id: String,
    #[serde(default)]
    pub user_id: String,
    pub stay_date: String,
    pub quote_time: String,
    #[serde(default)]
    pub product: Product,
    pub inventory: InventorySnapshot,
    #[serde(default)]
    pub market: MarketSnapshot,
    pub context: RequestContext,
    #[serde(default)]
    pub toggles: StrategyToggles,
    #[serde(default)]
    pub allowed_price_grid: Option<Vec<f64>>,
}

/// Lower/upper confidence bounds around the recommended price.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceBand {
    pub lower: f64,
    pub upper: f64,
}

/// Expected occupancy now and at the end of the booking window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExpectedOutcome {
    pub occ_now: f64,
    pub occ_end_bucket: f64,
}

/// How the recommended price was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMethod {
    MlElasticity,
    RuleBased,
    Fallback,
}

impl PricingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingMethod::MlElasticity => "ml_elasticity",
            PricingMethod::RuleBased => "rule_based",
            PricingMethod::Fallback => "fallback",
        }
    }
}

/// Competitor band echoed back in the quote for transparency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitorEcho {
    pub p10: Option<f64>,
    pub p50: f64,
    pub p90: Option<f64>,
    pub count: Option<u32>,
    pub source: String,
}

/// Diagnostic block attached to every quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteSafety {
    pub pricing_method: PricingMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml_conversion_prob: Option<f64>,
    pub occupancy_rate: f64,
    pub lead_days: i64,
    pub season: Season,
    pub day_of_week: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub competitor_data: Option<CompetitorEcho>,
}

/// The full quote returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: f64,
    pub price_grid: Vec<f64>,
    pub conf_band: ConfidenceBand,
    pub expected: ExpectedOutcome,
    pub reasons: Vec<String>,
    pub safety: QuoteSafety,
}

/// A booking outcome submitted back for learning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub property_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stay_date: Option<String>,
    pub quoted_price: f64,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_price: Option<f64>,
    /// Context snapshot at quote time (feature name -> value), used by
    /// retraining and drift monitoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    /// Bandit action this outcome rewards, if one was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub base_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub epsilon: f64,
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub conservative_mode: bool,
    pub ml_traffic_percentage: f64,
    pub ks_threshold: f64,
    pub psi_threshold: f64,
    pub min_new_outcomes: usize,
    pub min_total_outcomes: usize,
    pub competitor_cache_ttl: Duration,
    pub scoring_timeout: Duration,
    pub fetch_timeout: Duration,
    pub backend_api_url: String,
    pub backend_api_key: Option<String>,
    pub model_dir: PathBuf,
    pub outcomes_db_path: String,
    /// When set, bandit state is restored from and periodically
    /// snapshotted to this directory.
    pub bandit_state_dir: Option<PathBuf>,
    pub competitor_mock_mode: bool,
    pub warm_up_properties: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let port = env_parse("PORT", 8080u16);
        let base_price = env_parse("BASE_PRICE", 100.0f64);
        let min_price = env_parse("MIN_PRICE", 50.0f64);
        let max_price = env_parse("MAX_PRICE", 500.0f64);
        let epsilon = env_parse("BANDIT_EPSILON", 0.1f64);
        let learning_rate = env_parse("BANDIT_LEARNING_RATE", 0.1f64);
        let discount_factor = env_parse("BANDIT_DISCOUNT_FACTOR", 0.99f64);
        let conservative_mode = env_flag("CONSERVATIVE_MODE", false);
        let ml_traffic_percentage = env_parse("ML_TRAFFIC_PERCENTAGE", 50.0f64);
        let ks_threshold = env_parse("KS_THRESHOLD", 0.05f64);
        let psi_threshold = env_parse("PSI_THRESHOLD", 0.2f64);
        let min_new_outcomes = env_parse("MIN_NEW_OUTCOMES", 100usize);
        let min_total_outcomes = env_parse("MIN_TOTAL_OUTCOMES", 1000usize);
        let competitor_cache_ttl =
            Duration::from_secs(env_parse("COMPETITOR_CACHE_TTL_SECS", 900u64));
        let scoring_timeout = Duration::from_secs(env_parse("SCORING_TIMEOUT_SECS", 5u64));
        let fetch_timeout = Duration::from_secs(env_parse("FETCH_TIMEOUT_SECS", 5u64));

        let backend_api_url = std::env::var("BACKEND_API_URL")
            .unwrap_or_else(|_| "http://localhost:3001".to_string());
        let backend_api_key = std::env::var("BACKEND_API_KEY").ok().filter(|k| !k.is_empty());

        let model_dir = PathBuf::from(
            std::env::var("MODEL_DIR").unwrap_or_else(|_| "./data/models".to_string()),
        );
        let outcomes_db_path = std::env::var("OUTCOMES_DB_PATH")
            .unwrap_or_else(|_| "./data/outcomes.db".to_string());
        let bandit_state_dir = std::env::var("BANDIT_STATE_DIR")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let competitor_mock_mode = env_flag("COMPETITOR_MOCK_MODE", false);

        let warm_up_properties = std::env::var("WARM_UP_PROPERTIES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            port,
            base_price,
            min_price,
            max_price,
            epsilon,
            learning_rate,
            discount_factor,
            conservative_mode,
            ml_traffic_percentage,
            ks_threshold,
            psi_threshold,
            min_new_outcomes,
            min_total_outcomes,
            competitor_cache_ttl,
            scoring_timeout,
            fetch_timeout,
            backend_api_url,
            backend_api_key,
            model_dir,
            outcomes_db_path,
            bandit_state_dir,
            competitor_mock_mode,
            warm_up_properties,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            base_price: 100.0,
            min_price: 50.0,
            max_price: 500.0,
            epsilon: 0.1,
            learning_rate: 0.1,
            discount_factor: 0.99,
            conservative_mode: false,
            ml_traffic_percentage: 50.0,
            ks_threshold: 0.05,
            psi_threshold: 0.2,
            min_new_outcomes: 100,
            min_total_outcomes: 1000,
            competitor_cache_ttl: Duration::from_secs(900),
            scoring_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(5),
            backend_api_url: "http://localhost:3001".to_string(),
            backend_api_key: None,
            model_dir: PathBuf::from("./data/models"),
            outcomes_db_path: "./data/outcomes.db".to_string(),
            bandit_state_dir: None,
            competitor_mock_mode: false,
            warm_up_properties: Vec::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

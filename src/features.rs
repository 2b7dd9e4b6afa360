//! Feature assembly for model scoring.
//!
//! Builds the immutable, model-agnostic feature superset for one
//! pricing request. Assembly is pure and deterministic: no I/O, missing
//! numeric inputs default to 0, missing one-hot groups stay all-zero,
//! and no feature can come out NaN or infinite.
//!
//! Normalization conventions:
//! - `occupancy_rate` is already in [0, 1]
//! - binary flags are 0.0 / 1.0
//! - raw magnitudes (`lead_time`, `comp_*`, `temperature`) are passed
//!   through unscaled; scaling belongs to the model that consumes them

use crate::gateway::CompetitorBand;
use crate::models::{PricingRequest, Season};
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;

/// Ordered feature record. Ordering is fixed by assembly and the same
/// for every request; scorers reorder by name against the feature list
/// stored with each model. A name index rides alongside the ordered
/// pairs so lookups stay O(1).
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    pairs: Vec<(&'static str, f64)>,
    index: HashMap<&'static str, usize>,
}

impl FeatureRecord {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            pairs: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    fn push(&mut self, name: &'static str, value: f64) {
        let value = if value.is_finite() { value } else { 0.0 };
        self.index.insert(name, self.pairs.len());
        self.pairs.push((name, value));
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.index.get(name).map(|&i| self.pairs[i].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        self.pairs.iter().copied()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.pairs.iter().map(|(n, _)| *n).collect()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Inputs the assembler needs beyond the raw request: parsed stay date,
/// derived lead/occupancy, and the resolved competitor band.
pub struct AssemblyInput<'a> {
    pub stay: DateTime<Utc>,
    pub lead_days: i64,
    pub occupancy_rate: f64,
    pub request: &'a PricingRequest,
    pub band: Option<&'a CompetitorBand>,
}

/// Subset of the feature superset used for model training; values for
/// these names are recovered from stored outcome context snapshots.
pub fn training_feature_names() -> &'static [&'static str] {
    &[
        "day_of_week",
        "month",
        "is_weekend",
        "season_Spring",
        "season_Summer",
        "season_Fall",
        "season_Winter",
        "temperature",
        "precipitation",
        "is_holiday",
        "comp_p10",
        "comp_p50",
        "comp_p90",
        "occupancy_rate",
        "lead_time",
        "length_of_stay",
        "is_refundable",
        "is_last_minute",
    ]
}

pub fn assemble(input: &AssemblyInput) -> FeatureRecord {
    let request = input.request;
    let context = &request.context;
    let stay = input.stay;
    let day_of_week = f64::from(context.day_of_week);
    let lead_days = input.lead_days.max(0) as f64;

    let mut record = FeatureRecord::with_capacity(36);

    // Temporal derivatives of the stay date (UTC).
    record.push("day_of_week", day_of_week);
    record.push("day_of_month", f64::from(stay.day()));
    record.push("week_of_year", f64::from(stay.iso_week().week()));
    record.push("month", f64::from(stay.month()));
    record.push("quarter", f64::from((stay.month() - 1) / 3 + 1));
    let is_weekend = matches!(context.day_of_week, 5 | 6);
    record.push("is_weekend", flag(is_weekend));
    record.push("is_month_start", flag(stay.day() <= 7));
    record.push("is_month_end", flag(stay.day() >= 24));

    // Season one-hot.
    for season in Season::ALL {
        let name: &'static str = match season {
            Season::Spring => "season_Spring",
            Season::Summer => "season_Summer",
            Season::Fall => "season_Fall",
            Season::Winter => "season_Winter",
        };
        record.push(name, flag(context.season == season));
    }

    // Weather.
    let temperature = context.weather.temperature.unwrap_or(0.0);
    let precipitation = context.weather.precipitation.unwrap_or(0.0);
    record.push("temperature", temperature);
    record.push("precipitation", precipitation);
    record.push(
        "rain_on_weekend",
        flag(is_weekend && precipitation > 0.0),
    );

    record.push("is_holiday", flag(context.is_holiday));

    // Competitor band.
    let (p10, p50, p90, count) = match input.band {
        Some(band) => (
            band.p10.unwrap_or(0.0),
            band.p50,
            band.p90.unwrap_or(0.0),
            f64::from(band.count),
        ),
        None => (0.0, 0.0, 0.0, 0.0),
    };
    record.push("comp_p10", p10);
    record.push("comp_p50", p50);
    record.push("comp_p90", p90);
    record.push("comp_count", count);
    let comp_range = if p10 > 0.0 && p90 > 0.0 { p90 - p10 } else { 0.0 };
    record.push("comp_range", comp_range);
    record.push(
        "comp_range_pct",
        if p50 > 0.0 { comp_range / p50 * 100.0 } else { 0.0 },
    );

    record.push("occupancy_rate", input.occupancy_rate);

    // Product.
    let los = f64::from(request.product.los);
    record.push("length_of_stay", los);
    record.push("is_refundable", flag(request.product.refundable));
    record.push("is_short_stay", flag(request.product.los <= 2));
    record.push(
        "is_medium_stay",
        flag((3..=6).contains(&request.product.los)),
    );
    record.push("is_long_stay", flag(request.product.los >= 7));

    // Lead-time buckets.
    let lead = input.lead_days.max(0);
    record.push("lead_time", lead_days);
    record.push("is_last_minute", flag(lead <= 7));
    record.push("is_short_lead", flag(lead > 7 && lead <= 30));
    record.push("is_medium_lead", flag(lead > 30 && lead <= 90));
    record.push("is_long_lead", flag(lead > 90));

    // Interaction terms.
    let is_summer = flag(context.season == Season::Summer);
    let weekend = flag(is_weekend);
    let holiday = flag(context.is_holiday);
    let last_minute = flag(lead <= 7);
    record.push("weekend_summer", weekend * is_summer);
    record.push("holiday_weekend", holiday * weekend);
    record.push("occupancy_weekend", input.occupancy_rate * weekend);
    record.push("last_minute_weekend", last_minute * weekend);

    record
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InventorySnapshot, RequestContext, Weather};

    fn request(season: Season, day_of_week: u8) -> PricingRequest {
        PricingRequest {
            property_id: "p1".to_string(),
            user_id: "u1".to_string(),
            stay_date: "2025-07-19".to_string(),
            quote_time: "2025-07-12T10:00:00Z".to_string(),
            product: Default::default(),
            inventory: InventorySnapshot {
                capacity: 100,
                remaining: 15,
            },
            market: Default::default(),
            context: RequestContext {
                season,
                day_of_week,
                is_holiday: false,
                weather: Weather {
                    temperature: Some(28.0),
                    precipitation: Some(0.0),
                },
            },
            toggles: Default::default(),
            allowed_price_grid: None,
        }
    }

    fn stay(date: &str) -> DateTime<Utc> {
        format!("{date}T00:00:00Z").parse().unwrap()
    }

    #[test]
    fn test_ordering_is_deterministic() {
        let req = request(Season::Summer, 5);
        let input = AssemblyInput {
            stay: stay("2025-07-19"),
            lead_days: 7,
            occupancy_rate: 0.85,
            request: &req,
            band: None,
        };

        let a = assemble(&input);
        let b = assemble(&input);
        assert_eq!(a.names(), b.names());
        assert_eq!(a, b);
    }

    #[test]
    fn test_temporal_features() {
        let req = request(Season::Summer, 5);
        let input = AssemblyInput {
            stay: stay("2025-07-19"),
            lead_days: 7,
            occupancy_rate: 0.85,
            request: &req,
            band: None,
        };

        let record = assemble(&input);
        assert_eq!(record.get("month"), Some(7.0));
        assert_eq!(record.get("quarter"), Some(3.0));
        assert_eq!(record.get("day_of_month"), Some(19.0));
        assert_eq!(record.get("is_weekend"), Some(1.0));
        assert_eq!(record.get("is_month_start"), Some(0.0));
        assert_eq!(record.get("is_month_end"), Some(0.0));
    }

    #[test]
    fn test_season_one_hot() {
        let req = request(Season::Winter, 1);
        let input = AssemblyInput {
            stay: stay("2025-02-04"),
            lead_days: 14,
            occupancy_rate: 0.1,
            request: &req,
            band: None,
        };

        let record = assemble(&input);
        assert_eq!(record.get("season_Winter"), Some(1.0));
        assert_eq!(record.get("season_Summer"), Some(0.0));
        assert_eq!(record.get("season_Spring"), Some(0.0));
        assert_eq!(record.get("season_Fall"), Some(0.0));
    }

    #[test]
    fn test_missing_band_yields_zeros() {
        let req = request(Season::Summer, 5);
        let input = AssemblyInput {
            stay: stay("2025-07-19"),
            lead_days: 7,
            occupancy_rate: 0.85,
            request: &req,
            band: None,
        };

        let record = assemble(&input);
        assert_eq!(record.get("comp_p50"), Some(0.0));
        assert_eq!(record.get("comp_range"), Some(0.0));
        assert_eq!(record.get("comp_range_pct"), Some(0.0));
    }

    #[test]
    fn test_band_features() {
        let req = request(Season::Summer, 5);
        let band = CompetitorBand {
            p10: Some(120.0),
            p50: 160.0,
            p90: Some(210.0),
            count: 12,
            source: "test".to_string(),
        };
        let input = AssemblyInput {
            stay: stay("2025-07-19"),
            lead_days: 7,
            occupancy_rate: 0.85,
            request: &req,
            band: Some(&band),
        };

        let record = assemble(&input);
        assert_eq!(record.get("comp_p50"), Some(160.0));
        assert_eq!(record.get("comp_range"), Some(90.0));
        assert!((record.get("comp_range_pct").unwrap() - 56.25).abs() < 1e-9);
    }

    #[test]
    fn test_no_nan_with_pathological_weather() {
        let mut req = request(Season::Fall, 3);
        req.context.weather = Weather {
            temperature: Some(f64::NAN),
            precipitation: Some(f64::INFINITY),
        };
        let input = AssemblyInput {
            stay: stay("2025-10-03"),
            lead_days: 30,
            occupancy_rate: 0.5,
            request: &req,
            band: None,
        };

        let record = assemble(&input);
        assert!(record.iter().all(|(_, v)| v.is_finite()));
    }

    #[test]
    fn test_interaction_terms() {
        let mut req = request(Season::Summer, 5);
        req.context.is_holiday = true;
        let input = AssemblyInput {
            stay: stay("2025-07-19"),
            lead_days: 3,
            occupancy_rate: 0.6,
            request: &req,
            band: None,
        };

        let record = assemble(&input);
        assert_eq!(record.get("weekend_summer"), Some(1.0));
        assert_eq!(record.get("holiday_weekend"), Some(1.0));
        assert_eq!(record.get("last_minute_weekend"), Some(1.0));
        assert!((record.get("occupancy_weekend").unwrap() - 0.6).abs() < 1e-12);
    }
}

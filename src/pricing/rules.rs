//! Rule-based pricing tables and multiplier cascades.
//!
//! Pure functions of the request context. The rule cascade is both the
//! fallback when no model is available and the exploration baseline the
//! experiments compare against.

use crate::models::Season;

/// Seasonal price multipliers.
pub fn seasonal_factor(season: Season) -> f64 {
    match season {
        Season::Spring => 1.1,
        Season::Summer => 1.3,
        Season::Fall => 1.0,
        Season::Winter => 0.9,
    }
}

/// Day-of-week multipliers, Monday = 0. Peaks on Saturday.
pub fn dow_factor(day_of_week: u8) -> f64 {
    match day_of_week {
        0 => 0.95,
        1 => 0.95,
        2 => 1.0,
        3 => 1.05,
        4 => 1.15,
        5 => 1.25,
        6 => 1.1,
        _ => 1.0,
    }
}

/// Elasticity multiplier derived from predicted conversion probability.
/// High conversion implies inelastic demand and supports a premium.
pub fn elasticity_factor(conversion_prob: f64) -> f64 {
    if conversion_prob > 0.7 {
        1.2
    } else if conversion_prob > 0.5 {
        1.1
    } else if conversion_prob > 0.3 {
        1.0
    } else {
        0.9
    }
}

/// Length-of-stay discount.
pub fn los_discount(los: u32) -> f64 {
    if los >= 7 {
        0.85
    } else if los >= 3 {
        0.95
    } else {
        1.0
    }
}

/// Lead-time factor for the rule cascade: last-minute premium,
/// far-advance discount.
pub fn rule_lead_factor(lead_days: i64) -> f64 {
    if lead_days < 7 {
        1.2
    } else if lead_days < 14 {
        1.1
    } else if lead_days < 30 {
        1.0
    } else if lead_days < 90 {
        0.95
    } else {
        0.9
    }
}

/// Everything the multiplier cascades need, resolved by the pipeline.
#[derive(Debug, Clone)]
pub struct PriceContext {
    /// Competitor P50 when available, the property's configured base
    /// otherwise.
    pub base_price: f64,
    pub occupancy_rate: f64,
    pub lead_days: i64,
    pub season: Season,
    pub day_of_week: u8,
    pub los: u32,
    pub refundable: bool,
    pub apply_seasonality: bool,
    pub aggressive: bool,
    pub conservative: bool,
}

/// Rule-based price: seasonal, day-of-week, occupancy, lead-time, LOS,
/// refundability, and strategy toggles applied multiplicatively.
pub fn rule_price(ctx: &PriceContext) -> f64 {
    let mut price = ctx.base_price;

    if ctx.apply_seasonality {
        price *= seasonal_factor(ctx.season);
    }

    price *= dow_factor(ctx.day_of_week);

    // Up to +50% as the property fills.
    price *= 1.0 + ctx.occupancy_rate * 0.5;

    price *= rule_lead_factor(ctx.lead_days);
    price *= los_discount(ctx.los);

    if ctx.refundable {
        price *= 1.05;
    }
    if ctx.aggressive {
        price *= 1.15;
    }
    if ctx.conservative {
        price *= 0.90;
    }

    price
}

/// Elasticity-adjusted price from the predicted conversion probability.
pub fn ml_price(conversion_prob: f64, ctx: &PriceContext) -> f64 {
    let mut price = ctx.base_price * elasticity_factor(conversion_prob);

    // Occupancy pressure.
    if ctx.occupancy_rate > 0.8 {
        price *= 1.1;
    } else if ctx.occupancy_rate < 0.3 {
        price *= 0.95;
    }

    // Lead-time pressure.
    if ctx.lead_days < 7 {
        price *= 1.15;
    } else if ctx.lead_days > 90 {
        price *= 0.95;
    }

    price *= seasonal_factor(ctx.season);
    price *= dow_factor(ctx.day_of_week);
    price *= los_discount(ctx.los);

    price
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_ctx() -> PriceContext {
        PriceContext {
            base_price: 100.0,
            occupancy_rate: 0.5,
            lead_days: 20,
            season: Season::Fall,
            day_of_week: 2,
            los: 1,
            refundable: false,
            apply_seasonality: true,
            aggressive: false,
            conservative: false,
        }
    }

    #[test]
    fn test_rule_price_neutral_context() {
        // Fall (1.0) x Wednesday (1.0) x occupancy 0.5 (1.25) x
        // lead 20 (1.0) x LOS 1 (1.0) = 125
        let price = rule_price(&base_ctx());
        assert!((price - 125.0).abs() < 1e-9);
    }

    #[test]
    fn test_rule_price_winter_weekday_low_occupancy() {
        let ctx = PriceContext {
            occupancy_rate: 0.1,
            lead_days: 14,
            season: Season::Winter,
            day_of_week: 1,
            conservative: true,
            ..base_ctx()
        };
        // 100 x 0.9 x 0.95 x 1.05 x 1.0 x 0.90 = 80.79...
        let price = rule_price(&ctx);
        let expected = 100.0 * 0.9 * 0.95 * 1.05 * 1.0 * 0.90;
        assert!((price - expected).abs() < 1e-9);
        assert!(price < 100.0);
    }

    #[test]
    fn test_ml_price_high_conversion_premium() {
        let ctx = PriceContext {
            base_price: 160.0,
            occupancy_rate: 0.85,
            lead_days: 7,
            season: Season::Summer,
            day_of_week: 5,
            los: 2,
            ..base_ctx()
        };
        // 160 x 1.2 (elasticity) x 1.1 (occupancy) x 1.3 (Summer)
        //     x 1.25 (Saturday)
        let price = ml_price(0.72, &ctx);
        let expected = 160.0 * 1.2 * 1.1 * 1.3 * 1.25;
        assert!((price - expected).abs() < 1e-9);
    }

    #[test]
    fn test_ml_price_low_conversion_discount() {
        let ctx = base_ctx();
        let low = ml_price(0.2, &ctx);
        let high = ml_price(0.8, &ctx);
        assert!(low < high);
        assert!((elasticity_factor(0.2) - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_elasticity_table_boundaries() {
        assert_eq!(elasticity_factor(0.71), 1.2);
        assert_eq!(elasticity_factor(0.7), 1.1);
        assert_eq!(elasticity_factor(0.51), 1.1);
        assert_eq!(elasticity_factor(0.5), 1.0);
        assert_eq!(elasticity_factor(0.31), 1.0);
        assert_eq!(elasticity_factor(0.3), 0.9);
    }

    #[test]
    fn test_lead_factor_buckets() {
        assert_eq!(rule_lead_factor(0), 1.2);
        assert_eq!(rule_lead_factor(6), 1.2);
        assert_eq!(rule_lead_factor(7), 1.1);
        assert_eq!(rule_lead_factor(14), 1.0);
        assert_eq!(rule_lead_factor(30), 0.95);
        assert_eq!(rule_lead_factor(90), 0.9);
        assert_eq!(rule_lead_factor(365), 0.9);
    }

    #[test]
    fn test_los_discount_tiers() {
        assert_eq!(los_discount(1), 1.0);
        assert_eq!(los_discount(3), 0.95);
        assert_eq!(los_discount(7), 0.85);
        assert_eq!(los_discount(30), 0.85);
    }

    #[test]
    fn test_refundable_premium() {
        let mut ctx = base_ctx();
        let non_refundable = rule_price(&ctx);
        ctx.refundable = true;
        let refundable = rule_price(&ctx);
        assert!((refundable / non_refundable - 1.05).abs() < 1e-9);
    }
}

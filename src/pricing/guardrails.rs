//! Price guardrails and grid snapping.
//!
//! Applied in a fixed order after scoring: absolute bounds, then the
//! competitive cap, then the event clamp, then the grid snap. Snap
//! happens last so the published price always lands on the allowed
//! grid.

/// Cap relative to competitor P50: never price above 1.5x the market
/// median when one is known.
pub const COMPETITIVE_CAP_RATIO: f64 = 1.5;

/// Floor relative to the base price during high-demand events in
/// conservative mode.
pub const EVENT_FLOOR_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy)]
pub struct Guardrails {
    pub min_price: f64,
    pub max_price: f64,
}

impl Guardrails {
    pub fn new(min_price: f64, max_price: f64) -> Self {
        Self {
            min_price,
            max_price,
        }
    }

    /// Absolute bounds only.
    pub fn clamp(&self, price: f64) -> f64 {
        price.clamp(self.min_price, self.max_price)
    }

    /// Full cascade: absolute bounds, competitive cap, event floor.
    /// Grid snap is separate so callers can capture the pre-snap price.
    pub fn apply(
        &self,
        price: f64,
        competitor_p50: Option<f64>,
        event_floor: Option<f64>,
    ) -> f64 {
        let mut price = self.clamp(price);

        if let Some(p50) = competitor_p50 {
            price = price.min(p50 * COMPETITIVE_CAP_RATIO);
        }

        if let Some(floor) = event_floor {
            price = price.max(floor);
        }

        price
    }
}

/// Nearest-neighbor projection onto the allowed grid; ties break low.
pub fn snap_to_grid(price: f64, grid: &[f64]) -> f64 {
    let mut best = grid[0];
    let mut best_dist = (grid[0] - price).abs();

    for &candidate in &grid[1..] {
        let dist = (candidate - price).abs();
        if dist < best_dist || (dist == best_dist && candidate < best) {
            best = candidate;
            best_dist = dist;
        }
    }

    best
}

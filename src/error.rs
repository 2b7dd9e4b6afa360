//! Request validation errors.
//!
//! Input errors are the only caller-visible failure class: everything
//! else on the scoring path degrades inside the quote.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid stay_date '{0}': expected YYYY-MM-DD or RFC 3339")]
    InvalidStayDate(String),

    #[error("invalid quote_time '{0}': expected RFC 3339")]
    InvalidQuoteTime(String),

    #[error("stay_date {stay} is before quote_time {quote}")]
    StayBeforeQuote { stay: String, quote: String },

    #[error("inventory capacity must be positive")]
    NonPositiveCapacity,

    #[error("inventory remaining {remaining} exceeds capacity {capacity}")]
    RemainingExceedsCapacity { remaining: u32, capacity: u32 },

    #[error("length of stay must be at least 1 night")]
    ZeroLengthOfStay,

    #[error("day_of_week must be in 0..=6, got {0}")]
    InvalidDayOfWeek(u8),

    #[error("allowed_price_grid must be non-empty with finite positive prices")]
    InvalidPriceGrid,

    #[error("market percentiles must satisfy p10 <= p50 <= p90")]
    UnorderedMarketBand,
}

//! Pricing core: the request-time scoring pipeline, rule-based
//! multiplier cascades, and price guardrails.

pub mod engine;
pub mod guardrails;
pub mod rules;

pub use engine::{PricingEngine, QuoteLogEntry, ScorePath};
pub use guardrails::{snap_to_grid, Guardrails};
pub use rules::PriceContext;

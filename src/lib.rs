//! RoomRate pricing backend library.
//!
//! Dynamic pricing engine for hospitality inventory: request-time
//! scoring (features, models, rules, guardrails), the outcomes learning
//! loop (storage, drift, retraining), and the experimentation layer
//! (A/B routing and a contextual bandit).

pub mod api;
pub mod error;
pub mod experiments;
pub mod features;
pub mod gateway;
pub mod learning;
pub mod middleware;
pub mod models;
pub mod outcomes;
pub mod pricing;
pub mod registry;

pub use error::RequestError;
pub use models::{Config, PriceQuote, PricingRequest};

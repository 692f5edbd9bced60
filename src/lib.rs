//! TradeBridge backend library.
//!
//! Exposes the broker core (storage engine, HTTP surface, pre-filters) and
//! the producer-side outbox for use by the binary and integration tests.

pub mod api;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod outbox;
pub mod storage;

pub use api::{build_router, AppState};
pub use models::Config;

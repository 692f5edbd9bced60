//! HTTP pre-filters: shared-secret auth, rate limiting, request logging.

pub mod auth;
pub mod logging;
pub mod rate_limit;

pub use auth::require_api_key;
pub use logging::request_logging;
pub use rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimiter};

//! Circuit breaking for backend services.
//!
//! - [`CircuitBreaker`]: the per-service state machine
//! - [`BreakerRegistry`]: lazily creates and shares breakers by service name

mod circuit_breaker;
mod registry;

pub use circuit_breaker::{
    BreakerSnapshot, CallOutcome, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use registry::BreakerRegistry;

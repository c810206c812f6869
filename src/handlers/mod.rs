mod health;
mod proxy;

pub use health::{BreakerStatus, HealthResponse, health_check, readiness_check};
pub use proxy::proxy;

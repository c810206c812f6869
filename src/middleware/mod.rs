//! Request-level security and observability building blocks.
//!
//! - **Auth Guard**: JWT bearer verification producing a [`Principal`]
//! - **Client Identity**: network address resolution with trusted proxy CIDRs
//! - **Request ID**: generation and propagation of `X-Request-Id`
//!
//! The auth guard and identity resolution are per-route decisions, so the
//! dispatcher invokes them from its stage pipeline. The request ID layer wraps
//! the whole router.

pub mod auth;
pub mod ip;
pub mod request_id;

pub use auth::{AuthGuard, Principal};
pub use ip::{CidrRange, TrustedProxyConfig, UNKNOWN_IP, client_identity};
pub use request_id::{REQUEST_ID_HEADER, RequestIdLayer};

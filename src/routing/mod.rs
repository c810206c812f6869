//! Hot-reloadable routing.
//!
//! - [`model`]: the JSON document stored in the config source
//! - [`table`]: compilation into immutable snapshots and the atomic swap
//! - [`watcher`]: the background long-poll loop that drives reloads

pub mod model;
pub mod table;
pub mod watcher;

pub use model::{RouteDefinition, RoutingConfig, ServiceDefinition, TierDefinition};
pub use table::{RouteEntry, RoutingSnapshot, RoutingTable};
pub use watcher::ConfigWatcher;

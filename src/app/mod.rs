//! Application layer: dispatcher, runtime, admin API and metrics

pub mod dispatcher;
pub mod metrics;
pub mod runtime;
pub mod stats_api;

pub use dispatcher::Dispatcher;
pub use runtime::{Runtime, RuntimeConfig};
pub use stats_api::ApiState;

//! HTTP handlers shared by Courier edge services.

pub mod health;
pub mod metrics;

pub use health::{health_check, readiness_check};
pub use metrics::metrics_handler;

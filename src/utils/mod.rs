//! Utils Module
pub mod prometheus;
pub mod telemetry;

pub use prometheus::{install_metrics, track_requests};
pub use telemetry::init_telemetry;

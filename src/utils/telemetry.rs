//! Logging setup
//!
//! One subscriber for every binary: `RUST_LOG` when set, otherwise info for
//! this crate and for HTTP request traces.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const DEFAULT_FILTER: &str = "aifriend=info,tower_http=info";

pub fn init_telemetry() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // Ignore a second init (tests, embedded use)
    let _ = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

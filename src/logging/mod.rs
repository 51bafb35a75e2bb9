//! Process-wide tracing setup shared by the hub daemon and the CLI.

use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Install the global subscriber. `RUST_LOG` overrides `default_directive`.
/// A second call is a no-op so embedders and tests can initialize freely.
pub fn init_logging_with(default_directive: &str) {
    let filter: EnvFilter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let formatting_layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .compact();

    let subscriber = Registry::default().with(filter).with(formatting_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

pub fn init_logging() {
    init_logging_with("info");
}

//! Tracing subscriber setup.

use storesync_settings::LoggingSettings;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global subscriber. `RUST_LOG` overrides `logging.level`.
pub fn init(logging: &LoggingSettings) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let fmt_layer = if logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry().with(fmt_layer).init();
}

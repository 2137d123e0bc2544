use std::env::var;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{Layer, filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// Defaults to INFO; `RUST_LOG` overrides per-target levels and
/// `RUST_LOG_FORMAT=json` switches to line-delimited JSON output for
/// log shippers.
pub fn init() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let format = var("RUST_LOG_FORMAT").unwrap_or_default();

    let layer = match format.as_str() {
        "json" => tracing_subscriber::fmt::layer().json().with_filter(env_filter).boxed(),
        _ => tracing_subscriber::fmt::layer().compact().with_filter(env_filter).boxed(),
    };

    tracing_subscriber::registry().with(layer).init();
}

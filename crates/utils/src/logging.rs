//! provides logging helpers

use std::io::Stderr;

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::format::{DefaultFields, Format};
use tracing_subscriber::fmt::{layer, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// stderr fmt layer, unfiltered
pub fn get_fmt_layer<S>() -> Layer<S, DefaultFields, Format, fn() -> Stderr> {
    layer()
        .with_writer(std::io::stderr as fn() -> Stderr)
        .with_target(true)
}

/// `RUST_LOG` filter defaulting to `INFO`
pub fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
pub fn init() {
    registry()
        .with(get_fmt_layer().with_filter(env_filter()))
        .init();
}

//! Tracing initialization.
//!
//! Filtering follows `RUST_LOG` with an `info` default. Output goes to
//! stderr so piped stdout stays clean for tooling.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub fn init(verbosity: u8) {
    let default_directive = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(false);

    // init() panics when a global subscriber is already set; tests and
    // embedders may have installed their own, so fall back silently.
    let _ = Registry::default().with(filter).with(fmt_layer).try_init();
}

//! Tracing initialisation for idbshim hosts and tests.
//!
//! The store logs schema work (`✓ … table initialized`, `✓ index created`)
//! and connection state changes at `info`, failed rollbacks and native
//! close failures at `warn`, and transaction steps at `debug`. SQL text is
//! logged at `debug` only when `Config::debug` is on.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored
//! because the global subscriber can only be set once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crates whose events follow the requested level. Everything else stays
/// at `warn` unless `RUST_LOG` says otherwise.
const CRATES: [&str; 2] = ["idbshim_store", "idbshim_codec"];

/// Default filter when `RUST_LOG` is not set.
fn default_directives(level: Level) -> String {
    let mut directives = String::from("warn");
    for krate in CRATES {
        directives.push_str(&format!(",{krate}={}", level.as_str().to_lowercase()));
    }
    directives
}

/// Initialise the global tracing subscriber.
///
/// * `json`: emit newline-delimited JSON instead of human-readable lines.
/// * `level`: verbosity of the idbshim crates when `RUST_LOG` is not set.
///
/// Targets are kept so SQL lines can be told apart from host output.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().compact())
            .try_init()
            .ok();
    }
}

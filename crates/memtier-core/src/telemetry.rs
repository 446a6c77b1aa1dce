//! Tracing initialisation for memtier binaries.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored
//! because the global subscriber can only be set once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Env var holding an `EnvFilter` directive; takes precedence over `RUST_LOG`.
pub const LOG_ENV: &str = "MEMTIER_LOG";

/// Env var that switches output to JSON when set to `json`.
pub const LOG_FORMAT_ENV: &str = "MEMTIER_LOG_FORMAT";

/// Initialise the global tracing subscriber.
///
/// * `json` - emit newline-delimited JSON; also enabled by `MEMTIER_LOG_FORMAT=json`.
/// * `level` - default verbosity when neither `MEMTIER_LOG` nor `RUST_LOG` is set.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let json = json || json_from_env();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

fn json_from_env() -> bool {
    std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

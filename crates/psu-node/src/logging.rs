//! Tracing subscriber setup

use crate::config::LoggingSection;
use crate::error::{NodeError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Crates whose targets the configured level applies to
const NODE_TARGETS: [&str; 6] = [
    "psu_node",
    "psu_dht",
    "psu_relay",
    "psu_transfer",
    "psu_protocol",
    "psu_crypto",
];

/// Filter directives for `level`, e.g. `psu_node=info,psu_dht=info,...`
pub fn default_directives(level: &str) -> String {
    NODE_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &LoggingSection) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&config.level)))
        .map_err(|e| NodeError::Config(format!("invalid log level {}: {}", config.level, e)))?;

    let builder = fmt().with_env_filter(filter).with_target(true);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| NodeError::Config(format!("logging already initialized: {}", e)))
}

//! Tracing subscriber setup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ConfigError, ConfigResult};

/// Install the global subscriber. `RUST_LOG` directives are added on top of
/// the configured level.
pub fn init_logging(config: &LoggingConfig) -> ConfigResult<()> {
    let filter = build_filter(&config.level)?;

    let result = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(config.with_target))
            .try_init()
    };

    result.map_err(|e| ConfigError::InvalidValue {
        field: "logging".to_string(),
        value: e.to_string(),
    })
}

fn build_filter(level: &str) -> ConfigResult<EnvFilter> {
    let directive = match level.to_lowercase().as_str() {
        lvl @ ("trace" | "debug" | "info" | "warn" | "error") => format!("qan_agent={}", lvl),
        other => other.to_string(),
    };
    let parsed = directive.parse().map_err(|_| ConfigError::InvalidValue {
        field: "logging.level".to_string(),
        value: level.to_string(),
    })?;

    Ok(EnvFilter::from_default_env()
        .add_directive(parsed)
        .add_directive("tokio=warn".parse().map_err(|_| ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            value: "tokio=warn".to_string(),
        })?))
}

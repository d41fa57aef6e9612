//! Tracing subscriber setup driven by [`LoggingConfig`].

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use crate::config::LoggingConfig;
use crate::error::{RelayError, RelayResult};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a
/// global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> RelayResult<()> {
    let level = LevelFilter::from(tracing::Level::from(config.level));
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_targets);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.with_ansi(config.colored).try_init()
    };

    installed.map_err(|e| RelayError::config(format!("failed to install tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_an_error() {
        let config = LoggingConfig::default();
        // Another test may already have installed one; either way the
        // second call in this test must fail.
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}

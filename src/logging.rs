//! Tracing subscriber setup for the bench binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{BenchError, Result};

/// Installs the global subscriber. `RUST_LOG` takes precedence over `level`.
///
/// Events go to stderr so they stay out of the operator prompts on stdout.
pub fn init(level: &str) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| BenchError::Config(format!("invalid log level '{}': {}", level, e)))?,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .map_err(|e| BenchError::Config(format!("logging already initialised: {}", e)))
}

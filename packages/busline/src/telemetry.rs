use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::BusConfig;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to `default_filter`.
///
/// Returns `Ok(false)` if a global subscriber was already installed, so
/// repeated calls (e.g. from several tests) are harmless.
pub fn init_tracing(default_filter: &str) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .with_context(|| format!("invalid log filter '{}'", default_filter))?,
    };

    Ok(tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok())
}

/// [`init_tracing`] with the filter of `config`.
pub fn init_from_config(config: &BusConfig) -> Result<bool> {
    init_tracing(&config.log_filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let config = BusConfig::default();
        init_from_config(&config).unwrap();
        assert!(!init_tracing("info").unwrap());
    }
}

//! Tracing bootstrap.
//!
//! Thin wrapper over `tracing-subscriber`: pick a format, apply the
//! configured filter (overridable via `EVENTORY_LOG`), install once.
//! Libraries embedding this crate will usually install their own
//! subscriber instead; nothing here is required for correctness.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, LoggingConfig};

pub fn is_test_env() -> bool {
    std::env::var_os("RUST_TEST_THREADS").is_some()
}

fn env_filter(logging: &LoggingConfig) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_env("EVENTORY_LOG") {
        return filter;
    }
    match &logging.filter {
        Some(directive) => EnvFilter::try_new(directive)
            .unwrap_or_else(|_| EnvFilter::new("eventory=info")),
        None => EnvFilter::new("eventory=info"),
    }
}

/// Install the global subscriber. Returns `false` if one was already
/// installed (fine: first installer wins).
pub fn init(logging: &LoggingConfig) -> bool {
    let filter = env_filter(logging);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = match logging.format {
        LogFormat::Pretty => builder.pretty().finish().try_init(),
        LogFormat::Compact => builder.compact().finish().try_init(),
        LogFormat::Json => builder.json().finish().try_init(),
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        let logging = LoggingConfig::default();
        // Whatever the first call returns, the second cannot win again.
        let _ = init(&logging);
        assert!(!init(&logging));
    }
}

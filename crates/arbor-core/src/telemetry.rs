//! # Telemetry
//!
//! Tracing subscriber setup for processes embedding the runtime.
//!
//! `ARBOR_LOG_FORMAT=json` enables machine-parseable output; anything else
//! selects the human-readable text format. The filter comes from `RUST_LOG`
//! and defaults to `arbor_core=info`.

use crate::ArborError;
use crate::primitives::ENV_LOG_FORMAT;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Read the format from `ARBOR_LOG_FORMAT`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::parse(std::env::var(ENV_LOG_FORMAT).ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Install the global tracing subscriber with the format from the
/// environment.
pub fn init_tracing() -> Result<(), ArborError> {
    init_tracing_with(LogFormat::from_env())
}

/// Install the global tracing subscriber with an explicit format.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing_with(format: LogFormat) -> Result<(), ArborError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "arbor_core=info".into());

    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
    };

    result.map_err(|e| ArborError::Telemetry(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing() {
        assert_eq!(LogFormat::parse(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("text")), LogFormat::Text);
        assert_eq!(LogFormat::parse(None), LogFormat::Text);
    }

    #[test]
    fn second_init_fails() {
        let _ = init_tracing_with(LogFormat::Text);
        assert!(matches!(
            init_tracing_with(LogFormat::Text),
            Err(ArborError::Telemetry(_))
        ));
    }
}

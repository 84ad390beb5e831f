//! Telemetry and logging initialization

use tracing_subscriber::{fmt, EnvFilter};

/// Filter applied when neither RUST_LOG nor CONFLUX_LOG is set
const DEFAULT_FILTER: &str = "info,conflux_engine=debug";

/// Output encoding for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact single-line text, for terminals
    Text,
    /// One JSON object per line, for collectors
    Json,
}

impl LogFormat {
    /// `RUST_LOG_FORMAT=json` selects JSON; anything else is text
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("RUST_LOG_FORMAT").as_deref() {
            Ok("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

fn filter_from_env() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var("CONFLUX_LOG").unwrap_or_default()))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the process-wide subscriber.
///
/// Filtering comes from `RUST_LOG`, then `CONFLUX_LOG`, then an info-level
/// default with engine debug output; the format from `RUST_LOG_FORMAT`.
pub fn init_tracing() {
    init_tracing_as(LogFormat::from_env());
}

/// Install the subscriber with an explicit format, for embedders that manage
/// their own configuration.
pub fn init_tracing_as(format: LogFormat) {
    let builder = fmt()
        .with_env_filter(filter_from_env())
        .with_target(true);

    match format {
        LogFormat::Json => builder.json().with_current_span(true).init(),
        LogFormat::Text => builder.compact().init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_detection_defaults_to_text() {
        std::env::remove_var("RUST_LOG_FORMAT");
        assert_eq!(LogFormat::from_env(), LogFormat::Text);
    }
}

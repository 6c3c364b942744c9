//! Tracing bootstrap for the worker binaries.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Logging options read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Log file path; rotated daily. Stdout when unset.
    pub file: Option<String>,
    /// Force ANSI colors on or off.
    pub ansi: Option<bool>,
}

impl LogConfig {
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LOG_FORMAT` | `text` | `json` or `text` |
    /// | `LOG_FILE` | (stdout) | Log file path, rotated daily |
    /// | `LOG_ANSI` | auto | `true`/`false` override for colors |
    /// | `RUST_LOG` | `info,sqlx=warn` | Standard env filter |
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var("LOG_FORMAT").ok().as_deref(),
            std::env::var("LOG_FILE").ok(),
            std::env::var("LOG_ANSI").ok().as_deref(),
        )
    }

    fn from_values(format: Option<&str>, file: Option<String>, ansi: Option<&str>) -> Self {
        Self {
            json: format.is_some_and(|f| f.eq_ignore_ascii_case("json")),
            file: file.filter(|f| !f.trim().is_empty()),
            ansi: ansi.map(|v| v == "true" || v == "1"),
        }
    }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process, or buffered
/// file output is lost.
pub fn init_tracing(config: &LogConfig, default_file_name: &str) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(ref path) = config.file {
        let path = Path::new(path);
        let dir = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or(default_file_name);
        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        if config.json {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
        } else {
            // No ANSI in files unless asked for.
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(config.ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if config.json {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = config.ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_defaults_to_text_stdout() {
        let config = LogConfig::from_values(None, None, None);
        assert!(!config.json);
        assert!(config.file.is_none());
        assert!(config.ansi.is_none());
    }

    #[test]
    fn test_log_config_values() {
        let config =
            LogConfig::from_values(Some("JSON"), Some("/var/log/ocr.log".into()), Some("0"));
        assert!(config.json);
        assert_eq!(config.file.as_deref(), Some("/var/log/ocr.log"));
        assert_eq!(config.ansi, Some(false));

        let config = LogConfig::from_values(Some("text"), Some("  ".into()), Some("true"));
        assert!(!config.json);
        assert!(config.file.is_none());
        assert_eq!(config.ansi, Some(true));
    }
}

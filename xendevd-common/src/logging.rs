//! Logging initialization using tracing.

use std::path::Path;

use anyhow::{anyhow, Result};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-field lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(anyhow!("Unknown log format: {}", other)),
        }
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the tracing subscriber with the specified log level.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
///
/// # Example
/// ```
/// xendevd_common::init_logging("info").unwrap();
/// ```
pub fn init_logging(level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
        );

    subscriber
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

/// Initialize logging with JSON output format.
/// Suitable for production environments with log aggregation.
pub fn init_logging_json(level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .json()
                .with_target(true)
        );

    subscriber
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

/// Initialize logging from daemon settings.
///
/// When `log_file` is set, records are additionally written as JSON to a
/// daily-rotated file next to it. A detached daemon has no terminal, so the
/// file is the only place its output survives. The returned guard must be
/// held until shutdown or buffered lines are lost.
pub fn init_logging_with(
    level: &str,
    format: LogFormat,
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let Some(log_path) = log_file else {
        let result = match format {
            LogFormat::Pretty => init_logging(level),
            LogFormat::Json => init_logging_json(level),
        };
        return result.map(|()| None);
    };

    let (subscriber, guard) = file_subscriber(level, format, log_path)?;
    subscriber
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;
    Ok(Some(guard))
}

type BoxedSubscriber = Box<dyn Subscriber + Send + Sync + 'static>;

/// Console layer in `format` plus a JSON layer writing to `log_path`.
fn file_subscriber(
    level: &str,
    format: LogFormat,
    log_path: &Path,
) -> Result<(BoxedSubscriber, WorkerGuard)> {
    let dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_path
        .file_name()
        .ok_or_else(|| anyhow!("Log file path has no file name: {}", log_path.display()))?;

    std::fs::create_dir_all(dir)
        .map_err(|e| anyhow!("Failed to create log directory {}: {}", dir.display(), e))?;

    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    // Each arm stacks its own file layer: the layer type depends on the
    // subscriber beneath it.
    let subscriber: BoxedSubscriber = match format {
        LogFormat::Json => Box::new(
            tracing_subscriber::registry()
                .with(env_filter(level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(writer).with_ansi(false)),
        ),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::registry()
                .with(env_filter(level))
                .with(fmt::layer().with_target(true))
                .with(fmt::layer().json().with_writer(writer).with_ansi(false)),
        ),
    };

    Ok((subscriber, guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    fn log_lines(dir: &Path, prefix: &str) -> String {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(prefix))
            })
            .map(|path| std::fs::read_to_string(path).unwrap())
            .collect()
    }

    #[test]
    fn test_file_logging_in_both_formats() {
        let dir = tempfile::tempdir().unwrap();

        for (format, name) in [(LogFormat::Pretty, "pretty.log"), (LogFormat::Json, "json.log")] {
            let (subscriber, guard) = file_subscriber("info", format, &dir.path().join(name)).unwrap();
            tracing::subscriber::with_default(subscriber, || {
                tracing::info!(device = "vif3.0", "attached to bridge");
            });
            drop(guard);

            let contents = log_lines(dir.path(), name);
            assert!(contents.contains("attached to bridge"), "{}: {}", name, contents);
            assert!(contents.trim_start().starts_with('{'), "{}: {}", name, contents);
        }
    }

    #[test]
    fn test_file_logging_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("var/log/xendevd.log");

        let (_subscriber, _guard) = file_subscriber("debug", LogFormat::Json, &nested).unwrap();

        assert!(dir.path().join("var/log").is_dir());
    }
}

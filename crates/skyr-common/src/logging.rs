//! ---
//! skyr_section: "01-core-functionality"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Tracing subscriber bootstrap shared by skyr binaries."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "SKYR_LOG";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Available log formats for stdout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "structured-json" | "json" => Ok(LogFormat::StructuredJson),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Pick the filter directive: `SKYR_LOG`, then `RUST_LOG`, then the configured level.
fn build_filter(config: &LoggingConfig) -> EnvFilter {
    if let Ok(directive) = std::env::var(LOG_ENV) {
        return EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!(
                "invalid {} directive ({}); falling back to {}",
                LOG_ENV, err, config.level
            );
            EnvFilter::new(&config.level)
        });
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Initialise the global tracing subscriber.
///
/// Stdout receives either structured JSON or a human readable format. When
/// `logging.directory` is configured a daily rolling JSON file is written as
/// well. Calling this more than once keeps the first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = STDOUT_GUARD.set(stdout_guard);

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let prefix = config
                .file_prefix
                .clone()
                .unwrap_or_else(|| service_name.to_owned());
            let appender = daily(directory, format!("{}.log", prefix));
            let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(file_guard);
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .json()
                    .with_writer(file_writer)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(build_filter(config))
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        log_dir = ?config.directory,
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_aliases() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::StructuredJson));
        assert_eq!("Pretty".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn init_tracing_writes_into_configured_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            directory: Some(dir.path().join("logs")),
            ..LoggingConfig::default()
        };
        init_tracing("skyr-test", &config).unwrap();
        assert!(dir.path().join("logs").is_dir());
        // second call is a no-op
        init_tracing("skyr-test", &config).unwrap();
    }
}

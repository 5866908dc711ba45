//! ---
//! hsp_section: "01-core-functionality"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Shared primitives and utilities for the bridge runtime."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Filter override read before `RUST_LOG`.
pub const LOG_ENV: &str = "HSP_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

/// Flush guards of the non-blocking writers, kept for the process lifetime.
static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Output format of the stdout layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    StructuredJson,
    /// Human readable lines.
    Pretty,
}

/// Install the global subscriber for `service_name`.
///
/// The filter comes from `HSP_LOG`, then `RUST_LOG`, then `info`. Stdout
/// gets the configured [`LogFormat`]; with `directory` set, JSON lines also
/// go to a daily rolling file. A second call leaves the first subscriber in
/// place.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let mut guards = Vec::with_capacity(2);
    let (stdout, guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(guard);

    let mut layers = vec![stdout_layer(config.format, stdout)];
    if let Some(directory) = &config.directory {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("creating log directory {}", directory.display()))?;
        let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
        let (writer, guard) = tracing_appender::non_blocking(daily(directory, format!("{}.log", prefix)));
        guards.push(guard);
        layers.push(
            fmt::layer()
                .json()
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_writer(writer)
                .boxed(),
        );
    }
    let _ = GUARDS.set(guards);

    let filter = filter_from(std::env::var(LOG_ENV).ok());
    if tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .is_err()
    {
        return Ok(());
    }

    info!(
        service = %service_name,
        format = ?config.format,
        log_dir = ?config.directory,
        "tracing initialised"
    );
    Ok(())
}

fn stdout_layer(format: LogFormat, writer: NonBlocking) -> BoxedLayer {
    let layer = fmt::layer().with_timer(fmt::time::UtcTime::rfc_3339());
    match format {
        LogFormat::StructuredJson => layer.json().with_target(false).with_writer(writer).boxed(),
        LogFormat::Pretty => layer.with_writer(writer).boxed(),
    }
}

/// Filter for an explicit `HSP_LOG` directive, falling back to `RUST_LOG`
/// and then `info`. An unparsable directive is reported on stderr.
fn filter_from(directive: Option<String>) -> EnvFilter {
    if let Some(directive) = directive {
        match EnvFilter::try_new(&directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!("ignoring invalid {} directive `{}`: {}", LOG_ENV, directive, err),
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

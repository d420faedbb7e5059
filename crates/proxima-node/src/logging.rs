//! Tracing setup for a node.
//!
//! Production nodes write JSON to a daily rolling file and compact lines to
//! stdout for the journal. Development runs print pretty, span-annotated
//! output to stdout only.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Selects production logging when set to `production`.
pub const ENV_VAR: &str = "PROXIMA_ENV";

/// Fallback filter directive when `RUST_LOG` is unset.
pub const LOG_LEVEL_VAR: &str = "PROXIMA_LOG_LEVEL";

/// Overrides the production log directory.
pub const LOG_DIR_VAR: &str = "PROXIMA_LOG_DIR";

const DEFAULT_DIRECTIVE: &str = "info";
const FILE_PREFIX: &str = "proxima";

// Dropping a guard stops its writer thread.
static GUARDS: OnceLock<(WorkerGuard, WorkerGuard)> = OnceLock::new();

/// Resolved logging options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// JSON file output plus compact stdout instead of pretty stdout.
    pub production: bool,
    /// Filter directive used when `RUST_LOG` is unset.
    pub directive: String,
    /// Where production log files are written.
    pub directory: PathBuf,
}

impl LogSettings {
    /// Read `PROXIMA_ENV`, `PROXIMA_LOG_LEVEL` and `PROXIMA_LOG_DIR`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var(ENV_VAR).ok().as_deref(),
            std::env::var(LOG_LEVEL_VAR).ok().as_deref(),
            std::env::var(LOG_DIR_VAR).ok().as_deref(),
        )
    }

    fn from_values(env: Option<&str>, level: Option<&str>, dir: Option<&str>) -> Self {
        Self {
            production: env.is_some_and(|env| env.eq_ignore_ascii_case("production")),
            directive: level
                .filter(|level| !level.trim().is_empty())
                .unwrap_or(DEFAULT_DIRECTIVE)
                .to_string(),
            directory: dir.map_or_else(default_log_directory, PathBuf::from),
        }
    }

    /// `RUST_LOG` wins over the configured directive.
    fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        Ok(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&self.directive))?)
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the filter directive cannot be parsed.
pub fn init(settings: &LogSettings) -> anyhow::Result<()> {
    let env_filter = settings.env_filter()?;
    if settings.production {
        init_production(env_filter, settings);
    } else {
        init_development(env_filter);
    }
    Ok(())
}

fn init_production(env_filter: EnvFilter, settings: &LogSettings) {
    if let Err(e) = std::fs::create_dir_all(&settings.directory) {
        eprintln!(
            "cannot create log directory {}: {e}",
            settings.directory.display()
        );
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &settings.directory, FILE_PREFIX);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // journald adds its own colors and timestamps
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = GUARDS.set((file_guard, stdout_guard));
}

fn init_development(env_filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE),
        )
        .init();
}

fn default_log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/proxima")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "proxima")
            .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_dir().join("logs"))
    }
}

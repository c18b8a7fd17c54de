//! Developer logging.
//!
//! Console output goes to stderr, below the progress line, and honours
//! `RUST_LOG`. A JSON log rotated daily is kept under the user's local data
//! directory; when that directory cannot be created the CLI keeps running
//! with console output only.

use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// How chatty the CLI is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Warnings on the console, debug in the file.
    #[default]
    Normal,
    /// Debug on the console, trace in the file, run spans with timings.
    Verbose,
}

impl Verbosity {
    /// Pick from the `--verbose` flag.
    pub const fn from_flag(verbose: bool) -> Self {
        if verbose { Self::Verbose } else { Self::Normal }
    }

    const fn console_level(self) -> Level {
        match self {
            Self::Normal => Level::WARN,
            Self::Verbose => Level::DEBUG,
        }
    }

    const fn file_level(self) -> Level {
        match self {
            Self::Normal => Level::DEBUG,
            Self::Verbose => Level::TRACE,
        }
    }

    fn span_events(self) -> FmtSpan {
        match self {
            Self::Normal => FmtSpan::NONE,
            Self::Verbose => FmtSpan::NEW | FmtSpan::CLOSE,
        }
    }
}

/// Where and how much to log.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory for the JSON log files.
    pub directory: PathBuf,
    /// File name prefix; files are named `<prefix>.<date>`.
    pub file_prefix: String,
    /// Verbosity preset.
    pub verbosity: Verbosity,
}

impl LoggingConfig {
    /// Configuration for the default log location.
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            directory: default_log_directory(),
            file_prefix: "mediadrop".to_string(),
            verbosity,
        }
    }
}

/// Flushes the file log when dropped.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// Also returns the reason file logging was disabled, if it was, so the
/// caller can report it once the console layer is live.
pub fn init(config: &LoggingConfig) -> (LoggingGuard, Option<String>) {
    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(crate_directives("warn", config.verbosity.console_level()))
    });
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_span_events(config.verbosity.span_events())
        .with_filter(console_filter);

    let (file, guard, disabled) = match ensure_directory(&config.directory) {
        Ok(()) => {
            let appender = rolling::daily(&config.directory, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(config.verbosity.span_events())
                .with_filter(EnvFilter::new(crate_directives(
                    "info",
                    config.verbosity.file_level(),
                )));
            (Some(layer), Some(guard), None)
        }
        Err(reason) => (None, None, Some(reason)),
    };

    tracing_subscriber::registry().with(console).with(file).init();

    (LoggingGuard { _file: guard }, disabled)
}

fn ensure_directory(directory: &Path) -> Result<(), String> {
    std::fs::create_dir_all(directory)
        .map_err(|e| format!("cannot create {}: {e}", directory.display()))
}

/// `<local data dir>/mediadrop/logs`.
pub fn default_log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mediadrop")
        .join("logs")
}

/// Filter string: `base` for dependencies, `level` for our crates.
fn crate_directives(base: &str, level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    format!("{base},mediadrop={level},mediadrop_core={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_from_flag() {
        assert_eq!(Verbosity::from_flag(false), Verbosity::Normal);
        assert_eq!(Verbosity::from_flag(true), Verbosity::Verbose);
        assert_eq!(Verbosity::default(), Verbosity::Normal);
    }

    #[test]
    fn test_levels() {
        assert_eq!(Verbosity::Normal.console_level(), Level::WARN);
        assert_eq!(Verbosity::Normal.file_level(), Level::DEBUG);
        assert_eq!(Verbosity::Verbose.console_level(), Level::DEBUG);
        assert_eq!(Verbosity::Verbose.file_level(), Level::TRACE);
    }

    #[test]
    fn test_crate_directives() {
        assert_eq!(
            crate_directives("warn", Level::DEBUG),
            "warn,mediadrop=debug,mediadrop_core=debug"
        );
    }

    #[test]
    fn test_ensure_directory_creates_nested() {
        let temp = tempfile::TempDir::new().unwrap_or_else(|e| panic!("{e}"));
        let nested = temp.path().join("a").join("b");
        assert!(ensure_directory(&nested).is_ok());
        assert!(nested.is_dir());
    }

    #[test]
    fn test_default_log_directory() {
        assert!(default_log_directory().ends_with("mediadrop/logs"));
    }
}

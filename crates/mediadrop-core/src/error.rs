//! Error types for Mediadrop core operations.
//!
//! Errors are grouped by domain:
//! - [`DownloadError`] - outcomes of one orchestration run (the user-facing taxonomy)
//! - [`FileSystemError`] - failures touching the working directory
//! - [`EngineError`] - failures launching or talking to the external engines
//!
//! Only some download errors are shown to the user as failures; see
//! [`Error::is_user_visible`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which part of post-processing was still running when its budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckStage {
    /// The container merge had started and not completed.
    Merge,
    /// Any other post-download work (fixups, metadata, thumbnail embedding).
    PostProcessing,
}

impl std::fmt::Display for StuckStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Merge => write!(f, "merge"),
            Self::PostProcessing => write!(f, "post-processing"),
        }
    }
}

/// Outcomes that end (or decorate) a single download run.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The source URL could not be parsed.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The extraction engine reported an error that is not known to be harmless.
    #[error("{message}")]
    EngineFatal {
        /// Raw engine message, control characters stripped.
        message: String,
    },

    /// The run was cancelled by the user or the system.
    #[error("Download cancelled")]
    Canceled,

    /// No output file could be located after the engine returned.
    #[error("Download finished but no output file was found in {}", directory.display())]
    NoOutputFile {
        /// Directory that was searched.
        directory: PathBuf,
    },

    /// Post-processing exceeded its size-derived budget.
    #[error("{}", processing_timeout_message(*stage, *budget_secs))]
    ProcessingTimedOut {
        /// What was still running at the deadline.
        stage: StuckStage,
        /// The budget that was exceeded, in seconds.
        budget_secs: u64,
    },

    /// The outer download budget was exceeded.
    #[error("Download timed out after {} minutes. Check your network connection and try again.", timeout_secs / 60)]
    DownloadTimedOut {
        /// The budget that was exceeded, in seconds.
        timeout_secs: u64,
    },

    /// The artwork fallback step failed. Never surfaced as a failure.
    #[error("Artwork embedding fallback failed: {reason}")]
    FallbackStepFailed {
        /// Why the step failed.
        reason: String,
    },

    /// The artwork fallback step does not handle this container.
    #[error("Container '{extension}' does not support embedded artwork")]
    UnsupportedContainer {
        /// File extension of the output.
        extension: String,
    },
}

fn processing_timeout_message(stage: StuckStage, budget_secs: u64) -> String {
    match stage {
        StuckStage::Merge => format!(
            "Merging the downloaded streams appears stuck (no completion within {budget_secs}s)"
        ),
        StuckStage::PostProcessing => {
            format!("Post-processing appears stuck (no completion within {budget_secs}s)")
        }
    }
}

/// File system failures in the working directory.
#[derive(Debug, Error)]
pub enum FileSystemError {
    /// Reading failed.
    #[error("Failed to read {}: {reason}", path.display())]
    ReadFailed {
        /// Path being read.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Writing failed.
    #[error("Failed to write {}: {reason}", path.display())]
    WriteFailed {
        /// Path being written.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Directory creation failed.
    #[error("Failed to create directory {}: {reason}", path.display())]
    CreateDirFailed {
        /// Directory path.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Rename / replace failed.
    #[error("Failed to move {} to {}: {reason}", from.display(), to.display())]
    RenameFailed {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
        /// Underlying reason.
        reason: String,
    },
}

/// Failures launching or talking to an external engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The executable could not be found.
    #[error("{tool} is not installed or not on PATH")]
    ToolMissing {
        /// Tool name.
        tool: String,
    },

    /// The executable exists but could not be started.
    #[error("Failed to start {tool}: {reason}")]
    SpawnFailed {
        /// Tool name.
        tool: String,
        /// Underlying reason.
        reason: String,
    },

    /// The tool exited unsuccessfully.
    #[error("{tool} failed (exit code {code:?}): {stderr}")]
    ToolFailed {
        /// Tool name.
        tool: String,
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// Captured stderr tail.
        stderr: String,
    },

    /// Probe output could not be interpreted.
    #[error("Failed to probe {}: {reason}", path.display())]
    ProbeFailed {
        /// File being probed.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },
}

/// Flat error category for presentation-layer handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid input URL.
    InvalidInput,
    /// Engine-reported fatal error.
    EngineFatal,
    /// Cancelled run.
    Canceled,
    /// Output file missing.
    NoOutputFile,
    /// Post-processing budget exceeded.
    ProcessingTimeout,
    /// Outer download budget exceeded.
    DownloadTimeout,
    /// Artwork fallback failed or was skipped.
    Fallback,
    /// Generic timeout from the timeout wrapper.
    Timeout,
    /// File system problem.
    FileSystem,
    /// External engine problem.
    Engine,
    /// Configuration problem.
    Configuration,
    /// Serialization problem.
    Serialization,
}

/// Errors that can occur in Mediadrop core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Download run outcome.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// File system failure.
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    /// External engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// An operation raced against a deadline and lost.
    #[error("Operation timed out after {:.1}s", after.as_secs_f64())]
    TimedOut {
        /// The deadline that elapsed.
        after: Duration,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for an engine-fatal download error.
    pub fn engine_fatal(message: impl Into<String>) -> Self {
        Self::Download(DownloadError::EngineFatal {
            message: message.into(),
        })
    }

    /// Shorthand for a non-fatal fallback failure.
    pub fn fallback_failed(reason: impl Into<String>) -> Self {
        Self::Download(DownloadError::FallbackStepFailed {
            reason: reason.into(),
        })
    }

    /// Category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Download(e) => match e {
                DownloadError::InvalidUrl { .. } => ErrorKind::InvalidInput,
                DownloadError::EngineFatal { .. } => ErrorKind::EngineFatal,
                DownloadError::Canceled => ErrorKind::Canceled,
                DownloadError::NoOutputFile { .. } => ErrorKind::NoOutputFile,
                DownloadError::ProcessingTimedOut { .. } => ErrorKind::ProcessingTimeout,
                DownloadError::DownloadTimedOut { .. } => ErrorKind::DownloadTimeout,
                DownloadError::FallbackStepFailed { .. }
                | DownloadError::UnsupportedContainer { .. } => ErrorKind::Fallback,
            },
            Self::FileSystem(_) | Self::Io(_) => ErrorKind::FileSystem,
            Self::Engine(_) => ErrorKind::Engine,
            Self::TimedOut { .. } => ErrorKind::Timeout,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Whether this run was cancelled rather than failed.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Download(DownloadError::Canceled))
    }

    /// Whether this error terminates a run as a user-visible failure.
    ///
    /// Fallback outcomes, cancellation and cleanup problems are only logged.
    #[must_use]
    pub const fn is_user_visible(&self) -> bool {
        match self {
            Self::Download(e) => matches!(
                e,
                DownloadError::InvalidUrl { .. }
                    | DownloadError::EngineFatal { .. }
                    | DownloadError::NoOutputFile { .. }
                    | DownloadError::ProcessingTimedOut { .. }
                    | DownloadError::DownloadTimedOut { .. }
            ),
            Self::Engine(_) | Self::Configuration(_) => true,
            Self::FileSystem(_) | Self::Io(_) | Self::TimedOut { .. } | Self::Serialization(_) => {
                false
            }
        }
    }

    /// Whether retrying the same download may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Download(DownloadError::DownloadTimedOut { .. }) | Self::TimedOut { .. } => true,
            Self::Download(DownloadError::EngineFatal { message }) => {
                let lower = message.to_lowercase();
                ["timed out", "timeout", "connection reset", "http error 5", "http error 429"]
                    .iter()
                    .any(|needle| lower.contains(needle))
            }
            _ => false,
        }
    }
}

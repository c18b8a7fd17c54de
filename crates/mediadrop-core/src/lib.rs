//! `Mediadrop` Core Library
//!
//! This crate drives an external media-extraction engine and a transcoding
//! engine to turn a source URL into one finished media file:
//! - Argument building for the extraction engine (SoundCloud and generic branches)
//! - Interpretation of the engine's progress events and log lines
//! - Layered download and post-processing timeouts
//! - Output file resolution and size-stability confirmation
//! - Best-effort artwork embedding when the engine did not embed it
//! - Temporary file cleanup between runs
//! - Persisted settings (download directory, auth token, timeouts)
//!
//! # Error Handling
//!
//! Errors are typed per domain and composed into one [`Error`]. Only some of
//! them end a run as a user-visible failure; see [`Error::is_user_visible`].
//!
//! ```rust,ignore
//! use mediadrop_core::{AppSettings, DownloadOrchestrator, DownloadRequest};
//!
//! async fn fetch(url: &str) -> mediadrop_core::Result<()> {
//!     let mut orchestrator = DownloadOrchestrator::with_process_engines(AppSettings::load()?);
//!     let path = orchestrator.start_download(DownloadRequest::new(url)).await?;
//!     println!("{}", path.display());
//!     Ok(())
//! }
//! ```

pub mod args;
pub mod cleanup;
pub mod config;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod ffmpeg;
pub mod finalize;
pub mod interpreter;
pub mod log_buffer;
pub mod orchestrator;
pub mod progress;
pub mod timeout;
pub mod ytdlp;

pub use args::{
    ArgsOptions, ArgsPlan, SourceClass, build_args, classify_source, output_template,
    parse_source_url,
};
pub use cleanup::{CleanupEntry, CleanupReport, TempFileSweeper, TempKind, classify_temp_file};
pub use config::{
    AppSettings, SettingsStore, TimeoutConfig, default_downloads_directory, normalize_token,
    validate_downloads_directory,
};
pub use engine::{
    EngineEvent, EngineFactory, EngineSeverity, EngineSignal, EngineSink, EventStatus,
    ExtractionEngine, LogLine, MediaProbe, ProbedStream, RunContext, TranscodingEngine,
};
pub use error::{
    DownloadError, EngineError, Error, ErrorKind, FileSystemError, Result, StuckStage,
};
pub use fallback::{ARTWORK_CONTAINERS, ArtworkFallback, FallbackOutcome};
pub use ffmpeg::FfmpegTranscoder;
pub use finalize::{
    ConfirmOptions, FinalizeUpdate, MergePoll, MergeSnapshot, ResolveRequest, ResolvedFrom,
    ResolvedOutput, StabilityCheck, check_post_processing, confirm_output, resolve_output,
};
pub use interpreter::{Interpreter, LogSignal, MergeTracking, classify_log_line, strip_ansi};
pub use log_buffer::{LOG_BUFFER_CAPACITY, LogBuffer, LogLevel, LogMessage};
pub use orchestrator::{
    CancelHandle, DownloadEvent, DownloadOrchestrator, DownloadRequest, InvokePhase, RunState,
};
pub use progress::{Phase, ProgressState, UNKNOWN_UNITS};
pub use timeout::{with_timeout, with_timeout_cancelling};
pub use ytdlp::YtDlpEngine;

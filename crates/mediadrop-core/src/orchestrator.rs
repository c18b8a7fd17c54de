//! Download orchestrator.
//!
//! Drives one download run from request to finished file:
//!
//! ```text
//! Idle -> Preparing -> Invoking(extracting | downloading | post-processing)
//!      -> Finalizing -> FallbackEmbedding? -> Complete
//! ```
//!
//! `Errored` is reachable from any state and `Canceled` from any state after
//! `Preparing`. All observable state (run state, progress, the user-facing
//! log) is written here and only read by the presentation layer through
//! [`DownloadEvent`]s, `watch` receivers and [`DownloadOrchestrator::recent_logs`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::args::{ArgsOptions, SourceClass, build_args, classify_source, parse_source_url};
use crate::cleanup::TempFileSweeper;
use crate::config::{AppSettings, TimeoutConfig};
use crate::engine::{
    EngineFactory, EngineSignal, EngineSink, ExtractionEngine, RunContext, TranscodingEngine,
};
use crate::error::{DownloadError, EngineError, Error, ErrorKind, FileSystemError, Result};
use crate::fallback::{ArtworkFallback, FallbackOutcome};
use crate::ffmpeg::FfmpegTranscoder;
use crate::finalize::{
    ConfirmOptions, FinalizeUpdate, ResolveRequest, check_post_processing, confirm_output,
    merge_temp_path, resolve_output,
};
use crate::interpreter::{Effects, Interpreter};
use crate::log_buffer::{LogBuffer, LogLevel, LogMessage};
use crate::progress::{Phase, ProgressState, format_bytes};
use crate::timeout::with_timeout_cancelling;
use crate::ytdlp::YtDlpEngine;

/// Slack applied to the run start when filtering scan candidates by mtime.
const MTIME_SLACK: Duration = Duration::from_secs(2);

// =============================================================================
// States and events
// =============================================================================

/// Sub-phase of the engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokePhase {
    /// Resolving formats, no bytes yet.
    Extracting,
    /// Transferring bytes.
    Downloading,
    /// Download finished; merge, fixups and embedding.
    PostProcessing,
}

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum RunState {
    /// No run in progress.
    #[default]
    Idle,
    /// Validating the request and building arguments.
    Preparing,
    /// The extraction engine is running.
    Invoking(InvokePhase),
    /// Locating and confirming the output file.
    Finalizing,
    /// Attaching artwork with the transcoding engine.
    FallbackEmbedding,
    /// The run produced a file.
    Complete,
    /// The run failed.
    Errored,
    /// The run was cancelled.
    Canceled,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Preparing => write!(f, "preparing"),
            Self::Invoking(InvokePhase::Extracting) => write!(f, "extracting"),
            Self::Invoking(InvokePhase::Downloading) => write!(f, "downloading"),
            Self::Invoking(InvokePhase::PostProcessing) => write!(f, "post-processing"),
            Self::Finalizing => write!(f, "finalizing"),
            Self::FallbackEmbedding => write!(f, "embedding artwork"),
            Self::Complete => write!(f, "complete"),
            Self::Errored => write!(f, "errored"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// A download request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Source page URL.
    pub source_url: String,
    /// Requested format; informational.
    pub format_hint: Option<String>,
    /// Output directory; the configured downloads directory when `None`.
    pub destination_dir: Option<PathBuf>,
}

impl DownloadRequest {
    /// Create a request for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            source_url: url.into(),
            format_hint: None,
            destination_dir: None,
        }
    }

    /// Set the format hint.
    #[must_use]
    pub fn with_format_hint(mut self, hint: impl Into<String>) -> Self {
        self.format_hint = Some(hint.into());
        self
    }

    /// Set the output directory.
    #[must_use]
    pub fn with_destination_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.destination_dir = Some(dir.into());
        self
    }
}

/// Events delivered to the presentation layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum DownloadEvent {
    /// The run moved to a new state.
    StateChanged(RunState),
    /// Progress snapshot.
    Progress(ProgressState),
    /// User-facing log message.
    Log(LogMessage),
    /// Primary extraction failed for a source with an alternate retrieval path.
    AlternateRetrievalSuggested {
        /// The source URL.
        url: String,
    },
    /// The run produced a file.
    Completed {
        /// Final output path.
        path: PathBuf,
    },
    /// The run failed.
    Failed {
        /// Error category.
        kind: ErrorKind,
        /// Message for the user.
        message: String,
    },
    /// The run was cancelled.
    Canceled,
}

/// Cancels the in-flight run, if any.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl CancelHandle {
    /// Cancel the in-flight run. Returns `false` when nothing is running.
    pub fn cancel(&self) -> bool {
        let token = self
            .current
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().cloned());
        match token {
            Some(token) => {
                info!("Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a run is currently cancellable.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.current.lock().is_ok_and(|guard| guard.is_some())
    }

    fn install(&self, token: CancellationToken) {
        if let Ok(mut guard) = self.current.lock() {
            *guard = Some(token);
        }
    }

    fn clear(&self) {
        if let Ok(mut guard) = self.current.lock() {
            *guard = None;
        }
    }
}

// =============================================================================
// Publisher
// =============================================================================

/// Single writer for everything the presentation layer observes.
struct Publisher {
    events: mpsc::UnboundedSender<DownloadEvent>,
    progress: watch::Sender<ProgressState>,
    state: watch::Sender<RunState>,
    logs: Arc<Mutex<LogBuffer>>,
}

impl Publisher {
    fn log(&self, level: LogLevel, text: impl Into<String>) {
        let message = LogMessage::new(level, text);
        message.trace();
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(message.clone());
        }
        let _ = self.events.send(DownloadEvent::Log(message));
    }

    fn progress(&self, progress: &ProgressState) {
        self.progress.send_replace(progress.clone());
        let _ = self.events.send(DownloadEvent::Progress(progress.clone()));
    }

    fn state(&self, next: RunState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(state = %next, "Run state changed");
            let _ = self.events.send(DownloadEvent::StateChanged(next));
        }
    }

    fn apply(&self, effects: Effects, progress: &ProgressState) {
        for (level, text) in effects.messages {
            self.log(level, text);
        }
        if effects.progress_changed {
            self.progress(progress);
        }
    }

    fn send(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs downloads one at a time.
pub struct DownloadOrchestrator {
    factory: Arc<dyn EngineFactory>,
    transcoder: Arc<dyn TranscodingEngine>,
    settings: AppSettings,
    publisher: Publisher,
    event_rx: Option<mpsc::UnboundedReceiver<DownloadEvent>>,
    cancel: CancelHandle,
}

impl std::fmt::Debug for DownloadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOrchestrator")
            .field("state", &self.state())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DownloadOrchestrator {
    /// Create an orchestrator over the given engines.
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        transcoder: Arc<dyn TranscodingEngine>,
        settings: AppSettings,
    ) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            transcoder,
            settings,
            publisher: Publisher {
                events,
                progress: watch::Sender::new(ProgressState::default()),
                state: watch::Sender::new(RunState::Idle),
                logs: Arc::new(Mutex::new(LogBuffer::new())),
            },
            event_rx: Some(event_rx),
            cancel: CancelHandle::default(),
        }
    }

    /// Create an orchestrator running the `yt-dlp` and `ffmpeg` executables
    /// named in `settings`.
    pub fn with_process_engines(settings: AppSettings) -> Self {
        let program = settings.yt_dlp_path.clone();
        let factory = move || -> Result<Box<dyn ExtractionEngine>> {
            Ok(Box::new(YtDlpEngine::new(program.clone())))
        };
        let transcoder = FfmpegTranscoder::new(&settings.ffmpeg_path, &settings.ffprobe_path);
        Self::new(Arc::new(factory), Arc::new(transcoder), settings)
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<DownloadEvent>> {
        self.event_rx.take()
    }

    /// Observe the latest progress snapshot.
    #[must_use]
    pub fn subscribe_progress(&self) -> watch::Receiver<ProgressState> {
        self.publisher.progress.subscribe()
    }

    /// Observe the run state.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.publisher.state.subscribe()
    }

    /// Current run state.
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.publisher.state.borrow()
    }

    /// Handle that cancels the in-flight run.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// The most recent user-facing log messages, oldest first.
    #[must_use]
    pub fn recent_logs(&self) -> Vec<LogMessage> {
        self.publisher
            .logs
            .lock()
            .map(|logs| logs.snapshot())
            .unwrap_or_default()
    }

    /// Effective settings.
    #[must_use]
    pub const fn settings(&self) -> &AppSettings {
        &self.settings
    }

    /// Download `request` and return the final file path.
    ///
    /// Takes `&mut self` so runs never overlap. Every run gets a fresh engine
    /// from the factory. Cancellation yields [`DownloadError::Canceled`] and a
    /// [`DownloadEvent::Canceled`] instead of a failure event.
    pub async fn start_download(&mut self, request: DownloadRequest) -> Result<PathBuf> {
        let directory = request
            .destination_dir
            .clone()
            .unwrap_or_else(|| self.settings.downloads_directory.clone());
        self.publisher.progress(&ProgressState::default());
        self.publisher.state(RunState::Preparing);

        let run = match RunContext::create(self.factory.as_ref()) {
            Ok(run) => run,
            Err(e) => {
                self.report_failure(&request, &e);
                return Err(e);
            }
        };
        let run_id = run.id;
        self.cancel.install(run.cancel.clone());

        let span = info_span!("download", run_id = %run_id);
        let outcome = self
            .drive(&request, &directory, run)
            .instrument(span.clone())
            .await;
        self.cancel.clear();

        let _guard = span.enter();
        match outcome {
            Ok(path) => {
                self.publisher.state(RunState::Complete);
                self.publisher.send(DownloadEvent::Completed { path: path.clone() });
                info!(path = %path.display(), "Download complete");
                Ok(path)
            }
            Err(e) => {
                // Partial files from this run must not survive into a retry.
                TempFileSweeper::new().sweep(&directory);
                if e.is_canceled() {
                    self.publisher.state(RunState::Canceled);
                    self.publisher.log(LogLevel::Info, "Download cancelled");
                    self.publisher.send(DownloadEvent::Canceled);
                } else {
                    self.report_failure(&request, &e);
                }
                Err(e)
            }
        }
    }

    fn report_failure(&self, request: &DownloadRequest, error: &Error) {
        warn!(error = %error, kind = ?error.kind(), "Download failed");
        self.publisher.state(RunState::Errored);
        self.publisher.log(LogLevel::Error, error.to_string());

        let soundcloud = parse_source_url(&request.source_url)
            .is_ok_and(|url| classify_source(&url) == SourceClass::SoundCloud);
        if soundcloud && error.kind() == ErrorKind::EngineFatal {
            self.publisher.log(
                LogLevel::Warning,
                "Primary extraction failed; an alternate retrieval method may work",
            );
            self.publisher.send(DownloadEvent::AlternateRetrievalSuggested {
                url: request.source_url.clone(),
            });
        }
        self.publisher.send(DownloadEvent::Failed {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    async fn drive(
        &self,
        request: &DownloadRequest,
        directory: &Path,
        run: RunContext,
    ) -> Result<PathBuf> {
        let publisher = &self.publisher;
        let timeouts = &self.settings.timeouts;

        // -- Preparing --------------------------------------------------------
        let url = parse_source_url(&request.source_url)?;
        prepare_directory(directory)?;
        TempFileSweeper::new().sweep(directory);

        let plan = build_args(
            &url,
            directory,
            &ArgsOptions {
                auth_token: self.settings.auth_token.as_deref(),
                skip_certificate_check: self.settings.skip_certificate_check,
                format_hint: request.format_hint.as_deref(),
            },
        );
        info!(source = %plan.source, url = %url, "Starting download");
        publisher.log(LogLevel::Info, format!("Starting download: {url}"));

        // -- Invoking ---------------------------------------------------------
        let RunContext {
            engine,
            cancel,
            started_wall,
            ..
        } = run;
        let mut interp = Interpreter::new(directory);
        publisher.state(RunState::Invoking(InvokePhase::Extracting));

        let (sink, mut signals) = EngineSink::channel();
        let engine_task = {
            let url = url.to_string();
            let args = plan.args.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || engine.extract(&url, &args, &sink, &cancel))
        };

        let budget = timeouts.download_budget();
        let invoked = with_timeout_cancelling(
            budget,
            &cancel,
            pump(publisher, &mut interp, &mut signals, engine_task, timeouts),
        )
        .await;
        while let Ok(signal) = signals.try_recv() {
            apply_signal(publisher, &mut interp, signal);
        }

        let engine_failure = match invoked {
            Ok(()) => None,
            Err(Error::TimedOut { .. }) => {
                return Err(Error::Download(DownloadError::DownloadTimedOut {
                    timeout_secs: budget.as_secs(),
                }));
            }
            Err(e @ Error::Download(DownloadError::ProcessingTimedOut { .. })) => {
                cancel.cancel();
                return Err(e);
            }
            Err(_) if cancel.is_cancelled() => {
                return Err(Error::Download(DownloadError::Canceled));
            }
            Err(Error::Engine(EngineError::ToolFailed { code, stderr, .. }))
                if interp.pending_error().is_none() =>
            {
                debug!(?code, "Engine exited unsuccessfully without a fatal log line");
                Some(if stderr.trim().is_empty() {
                    format!("Extraction engine exited with status {}", code.unwrap_or(-1))
                } else {
                    stderr
                })
            }
            Err(e) => match interp.pending_error() {
                Some(message) => return Err(Error::engine_fatal(message)),
                None => return Err(e),
            },
        };
        if let Some(message) = interp.pending_error() {
            return Err(Error::engine_fatal(message));
        }

        let keep: Vec<PathBuf> = interp
            .merge_filename()
            .filter(|_| interp.merge().in_progress)
            .map(merge_temp_path)
            .into_iter()
            .collect();
        TempFileSweeper::new().protect_all(keep).sweep(directory);

        // -- Finalizing -------------------------------------------------------
        publisher.state(RunState::Finalizing);
        let resolved = resolve_output(&ResolveRequest {
            directory,
            merge_filename: interp.merge_filename(),
            finished_filename: interp.finished_filename(),
            extensions: &plan.expected_extensions,
            modified_since: started_wall.checked_sub(MTIME_SLACK),
        });
        let resolved = match (resolved, engine_failure) {
            (Ok(resolved), failure) => {
                if let Some(message) = failure {
                    warn!(%message, "Engine reported failure but produced an output file");
                }
                resolved
            }
            (Err(Error::Download(DownloadError::NoOutputFile { .. })), Some(message)) => {
                return Err(Error::engine_fatal(message));
            }
            (Err(e), _) => return Err(e),
        };
        let output = resolved.path;
        debug!(path = %output.display(), source = ?resolved.source, "Output resolved");

        let size_hint = interp
            .downloaded_bytes()
            .max(std::fs::metadata(&output).map(|m| m.len()).unwrap_or(0));
        let pp_budget = timeouts.post_processing_budget(size_hint);
        let now = Instant::now();
        let remaining = interp
            .post_processing_elapsed(now)
            .map_or(pp_budget, |elapsed| pp_budget.saturating_sub(elapsed));
        let options = ConfirmOptions::from_config(timeouts, now + remaining, pp_budget);

        let mut progress = interp.progress().clone();
        let size = confirm_output(&output, interp.merge_mut(), &options, &cancel, |update| {
            match update {
                FinalizeUpdate::MergeProgress { temp_bytes } => {
                    progress.enter(
                        Phase::Merging,
                        format!("Merging formats... {}", format_bytes(temp_bytes as i64)),
                    );
                    publisher.progress(&progress);
                }
                FinalizeUpdate::MergeComplete => publisher.log(LogLevel::Success, "Merge complete"),
                FinalizeUpdate::Stuck { idle } => publisher.log(
                    LogLevel::Warning,
                    format!("No progress for {}s, still waiting", idle.as_secs()),
                ),
            }
        })
        .await?;
        info!(path = %output.display(), bytes = size, "Output confirmed");

        // -- FallbackEmbedding ------------------------------------------------
        if interp.thumbnail().embedded {
            debug!("Engine embedded the thumbnail, skipping fallback");
        } else {
            publisher.state(RunState::FallbackEmbedding);
            let outcome = self
                .embed_artwork(&output, interp.thumbnail().artifact.as_deref(), &mut progress)
                .await;
            match outcome {
                FallbackOutcome::Embedded => publisher.log(LogLevel::Success, "Artwork embedded"),
                FallbackOutcome::AlreadyEmbedded => {
                    publisher.log(LogLevel::Info, "Artwork already present");
                }
                FallbackOutcome::Unsupported { extension } => {
                    let skipped = Error::Download(DownloadError::UnsupportedContainer { extension });
                    publisher.log(LogLevel::Info, skipped.to_string());
                }
                FallbackOutcome::Failed(reason) => {
                    publisher.log(LogLevel::Warning, Error::fallback_failed(reason).to_string());
                }
            }
        }

        TempFileSweeper::new().protect(&output).sweep(directory);

        let total = if progress.total_units > 0 {
            progress.total_units
        } else {
            size as i64
        };
        progress.set_units(total, total);
        progress.throughput_bps = None;
        progress.eta_secs = Some(0.0);
        progress.enter(Phase::Finished, "Download complete");
        publisher.progress(&progress);
        publisher.log(LogLevel::Success, format!("Saved {}", output.display()));
        Ok(output)
    }

    async fn embed_artwork(
        &self,
        output: &Path,
        artifact: Option<&Path>,
        progress: &mut ProgressState,
    ) -> FallbackOutcome {
        let fallback = ArtworkFallback::new(
            Arc::clone(&self.transcoder),
            self.settings.timeouts.clone(),
        );
        let (sink, mut signals) = EngineSink::channel();
        let run = fallback.run(output, artifact, Some(sink));
        tokio::pin!(run);

        loop {
            tokio::select! {
                outcome = &mut run => return outcome,
                Some(signal) = signals.recv() => {
                    if let EngineSignal::TranscodeProgress(fraction) = signal {
                        progress.enter(
                            Phase::Transcoding,
                            format!("Embedding artwork... {:.0}%", fraction * 100.0),
                        );
                        self.publisher.progress(progress);
                    }
                }
            }
        }
    }
}

fn prepare_directory(directory: &Path) -> Result<()> {
    if directory.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(directory).map_err(|e| {
        Error::FileSystem(FileSystemError::CreateDirFailed {
            path: directory.to_path_buf(),
            reason: e.to_string(),
        })
    })
}

fn invoke_phase(interp: &Interpreter) -> InvokePhase {
    if interp.download_finished() {
        InvokePhase::PostProcessing
    } else if interp.progress().phase == Phase::Downloading {
        InvokePhase::Downloading
    } else {
        InvokePhase::Extracting
    }
}

fn apply_signal(publisher: &Publisher, interp: &mut Interpreter, signal: EngineSignal) {
    let now = Instant::now();
    let effects = match signal {
        EngineSignal::Event(event) => interp.on_event(&event, now),
        EngineSignal::Log(line) => interp.on_log(&line, now),
        EngineSignal::TranscodeProgress(fraction) => {
            interp.progress_mut().enter(
                Phase::Transcoding,
                format!("Transcoding... {:.0}%", fraction * 100.0),
            );
            Effects {
                progress_changed: true,
                ..Effects::default()
            }
        }
    };
    publisher.apply(effects, interp.progress());
    publisher.state(RunState::Invoking(invoke_phase(interp)));
}

/// Feed engine signals to the interpreter until the engine call returns.
///
/// Also enforces the post-processing budget once the download has finished;
/// on expiry the engine is told to stop and the run fails.
async fn pump(
    publisher: &Publisher,
    interp: &mut Interpreter,
    signals: &mut mpsc::UnboundedReceiver<EngineSignal>,
    mut engine_task: JoinHandle<Result<()>>,
    timeouts: &TimeoutConfig,
) -> Result<()> {
    let mut ticker = tokio::time::interval(timeouts.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            Some(signal) = signals.recv() => apply_signal(publisher, interp, signal),
            joined = &mut engine_task => {
                return joined.unwrap_or_else(|e| {
                    Err(Error::engine_fatal(format!("Extraction engine task failed: {e}")))
                });
            }
            _ = ticker.tick() => {
                if let Some(elapsed) = interp.post_processing_elapsed(Instant::now()) {
                    check_post_processing(
                        elapsed,
                        interp.downloaded_bytes(),
                        interp.merge().in_progress,
                        timeouts,
                    )?;
                }
            }
        }
    }
}

//! Event and log interpretation.
//!
//! The extraction engine reports through two channels whose relative order is
//! not guaranteed: loosely typed progress dictionaries and free-text log
//! lines. This module folds both into one coherent picture of the run:
//! phase, byte progress, the download-finished flag, merge tracking,
//! thumbnail outcome and the pending fatal error.
//!
//! Text classification is the pure function [`classify_log_line`]; the
//! stateful part is [`Interpreter`]. Neither touches the filesystem.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::engine::{EngineEvent, EngineSeverity, EventStatus, LogLine};
use crate::log_buffer::LogLevel;
use crate::progress::{Phase, ProgressState, UNKNOWN_UNITS};

// =============================================================================
// Text classification
// =============================================================================

static ANSI_ESCAPE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b[@-Z\\-_]").ok());

static PROGRESS_NOISE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\[download\]\s+\d+(?:\.\d+)?%").ok());

/// Image extensions the engine writes thumbnails with.
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// Error text fragments that only concern optional decoration (artwork,
/// metadata) and must not fail the run.
const NON_FATAL_ERROR_PATTERNS: [&str; 8] = [
    "thumbnail",
    "artwork",
    "cover art",
    "metadata",
    "mutagen",
    "atomicparsley",
    "attached_pic",
    "embedthumbnail",
];

/// Remove terminal color and control sequences.
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    let without_escapes = match ANSI_ESCAPE.as_ref() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    };
    without_escapes
        .chars()
        .filter(|c| !c.is_control() || *c == '\t')
        .collect()
}

/// A sub-event recognized in one (already stripped) log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSignal {
    /// `[Merger] Merging formats into "<path>"`.
    MergeStarted {
        /// Merge output, when quoted in the line.
        path: Option<PathBuf>,
    },
    /// `Deleting original file <path> (pass -k to keep)`.
    DeletingOriginal {
        /// File being deleted, when present.
        path: Option<PathBuf>,
    },
    /// `[EmbedThumbnail] ...: Adding thumbnail to "<path>"`.
    ThumbnailEmbedAttempt,
    /// Any line reporting that thumbnail embedding failed or was skipped.
    ThumbnailEmbedFailed,
    /// `[info] Writing video thumbnail N to: <path>`.
    ThumbnailWritten {
        /// Artifact path.
        path: PathBuf,
    },
    /// `[download] Destination: <path>`.
    Destination {
        /// Download target.
        path: PathBuf,
    },
    /// Metadata / fixup post-processor activity.
    MetadataStep,
    /// Textual progress bar lines, superseded by structured events.
    ProgressNoise,
    /// Nothing recognized.
    Plain,
}

fn quoted(text: &str) -> Option<&str> {
    let start = text.find('"')? + 1;
    let len = text[start..].find('"')?;
    let inner = &text[start..start + len];
    (!inner.is_empty()).then_some(inner)
}

fn non_empty_path(text: &str) -> Option<PathBuf> {
    let text = text.trim().trim_matches('"');
    (!text.is_empty()).then(|| PathBuf::from(text))
}

/// Whether `path` has an image extension.
#[must_use]
pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Classify one log line. Markers are matched case-sensitively, as the engine
/// prints them.
#[must_use]
pub fn classify_log_line(text: &str) -> LogSignal {
    let text = text.trim();

    if let Some(rest) = text.strip_prefix("[Merger] Merging formats into") {
        return LogSignal::MergeStarted {
            path: quoted(rest).map(PathBuf::from),
        };
    }

    if let Some(idx) = text.find("Deleting original file") {
        let rest = &text[idx + "Deleting original file".len()..];
        let rest = rest.split(" (pass -k").next().unwrap_or(rest);
        return LogSignal::DeletingOriginal {
            path: non_empty_path(rest),
        };
    }

    if text.starts_with("[EmbedThumbnail]") && text.contains("Adding thumbnail to") {
        return LogSignal::ThumbnailEmbedAttempt;
    }

    // Before the failure scan: titles may contain words like "error".
    if text.contains("Writing video thumbnail")
        && let Some((_, path)) = text.split_once(" to: ")
        && let Some(path) = non_empty_path(path)
    {
        return LogSignal::ThumbnailWritten { path };
    }

    let lower = text.to_lowercase();
    if lower.contains("thumbnail")
        && ["unable", "failed", "error", "skipping", "not supported", "cannot"]
            .iter()
            .any(|needle| lower.contains(needle))
    {
        return LogSignal::ThumbnailEmbedFailed;
    }

    if let Some(rest) = text.strip_prefix("[download] Destination:")
        && let Some(path) = non_empty_path(rest)
    {
        return LogSignal::Destination { path };
    }

    if text.starts_with("[Metadata]")
        || text.starts_with("[FixupM4a]")
        || text.starts_with("[FixupM3u8]")
        || text.starts_with("[FixupStretched]")
        || text.starts_with("[FixupDuplicateMoov]")
    {
        return LogSignal::MetadataStep;
    }

    if PROGRESS_NOISE
        .as_ref()
        .is_some_and(|re| re.is_match(text))
    {
        return LogSignal::ProgressNoise;
    }

    LogSignal::Plain
}

/// Whether error-severity text concerns only optional decoration.
#[must_use]
pub fn is_non_fatal_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    NON_FATAL_ERROR_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// Map engine severity to the application log level.
#[must_use]
pub const fn level_for(severity: EngineSeverity) -> LogLevel {
    match severity {
        EngineSeverity::Debug => LogLevel::Debug,
        EngineSeverity::Info => LogLevel::Info,
        EngineSeverity::Warning => LogLevel::Warning,
        EngineSeverity::Error => LogLevel::Error,
    }
}

// =============================================================================
// Merge tracking
// =============================================================================

/// Per-run merge state.
///
/// Started by the merge-start marker, completed by the deletion marker or by
/// the finalization poller once the temp companion is gone and the output is
/// stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeTracking {
    /// Whether a merge is running.
    pub in_progress: bool,
    /// When the merge-start marker was seen.
    pub started_at: Option<Instant>,
    /// Last size of the temp companion file.
    pub last_temp_size: Option<u64>,
    /// Last size of the final output while settling.
    pub last_final_size: Option<u64>,
    /// Consecutive polls with unchanged final size.
    pub stable_count: u32,
    /// When an observed size last changed.
    pub last_size_change: Option<Instant>,
    /// Whether the stuck warning has been emitted for the current stall.
    pub stuck_warned: bool,
    /// Whether a merge was ever started in this run.
    pub seen: bool,
}

impl MergeTracking {
    /// Enter the merge. Repeated markers do not reset timers.
    pub fn begin(&mut self, now: Instant) {
        if self.in_progress {
            return;
        }
        *self = Self {
            in_progress: true,
            started_at: Some(now),
            last_size_change: Some(now),
            seen: true,
            ..Self::default()
        };
    }

    /// Leave the merge.
    pub fn complete(&mut self) {
        self.in_progress = false;
        self.stuck_warned = false;
    }

    /// Time since any observed size last changed.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        self.last_size_change
            .map_or(Duration::ZERO, |t| now.saturating_duration_since(t))
    }
}

// =============================================================================
// Interpreter
// =============================================================================

/// Side effects of interpreting one signal, applied by the orchestrator.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Effects {
    /// Whether the progress snapshot changed.
    pub progress_changed: bool,
    /// User-facing messages to append.
    pub messages: Vec<(LogLevel, String)>,
}

impl Effects {
    fn say(&mut self, level: LogLevel, text: impl Into<String>) {
        self.messages.push((level, text.into()));
    }
}

/// Thumbnail outcome as seen in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThumbnailState {
    /// The engine started embedding.
    pub attempted: bool,
    /// The engine reported success.
    pub embedded: bool,
    /// The engine reported failure.
    pub failed: bool,
    /// Artifact path the engine wrote, if logged.
    pub artifact: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
struct StreamAccounting {
    carried_completed: i64,
    carried_total: i64,
    current_completed: i64,
    current_total: i64,
    open: bool,
}

/// Stateful interpreter for one run.
#[derive(Debug, Clone)]
pub struct Interpreter {
    working_dir: PathBuf,
    progress: ProgressState,
    finished_at: Option<Instant>,
    finished_filename: Option<PathBuf>,
    merge_filename: Option<PathBuf>,
    last_destination: Option<PathBuf>,
    merge: MergeTracking,
    thumbnail: ThumbnailState,
    pending_error: Option<String>,
    streams: StreamAccounting,
    last_download_activity: Option<Instant>,
}

impl Interpreter {
    /// Create an interpreter resolving relative engine paths against `working_dir`.
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            progress: ProgressState::default(),
            finished_at: None,
            finished_filename: None,
            merge_filename: None,
            last_destination: None,
            merge: MergeTracking::default(),
            thumbnail: ThumbnailState::default(),
            pending_error: None,
            streams: StreamAccounting::default(),
            last_download_activity: None,
        }
    }

    fn resolve(&self, raw: &Path) -> PathBuf {
        if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.working_dir.join(raw)
        }
    }

    /// Current progress snapshot.
    #[must_use]
    pub const fn progress(&self) -> &ProgressState {
        &self.progress
    }

    /// Mutable progress, for phase changes driven outside the engine channels.
    pub const fn progress_mut(&mut self) -> &mut ProgressState {
        &mut self.progress
    }

    /// Whether the download-finished flag is set.
    #[must_use]
    pub const fn download_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// First filename reported by a "finished" event.
    #[must_use]
    pub fn finished_filename(&self) -> Option<&Path> {
        self.finished_filename.as_deref()
    }

    /// Filename parsed from the merge-start marker.
    #[must_use]
    pub fn merge_filename(&self) -> Option<&Path> {
        self.merge_filename.as_deref()
    }

    /// Most recent download destination.
    #[must_use]
    pub fn last_destination(&self) -> Option<&Path> {
        self.last_destination.as_deref()
    }

    /// Merge state.
    #[must_use]
    pub const fn merge(&self) -> &MergeTracking {
        &self.merge
    }

    /// Mutable merge state, for the finalization poller.
    pub const fn merge_mut(&mut self) -> &mut MergeTracking {
        &mut self.merge
    }

    /// Thumbnail outcome.
    #[must_use]
    pub const fn thumbnail(&self) -> &ThumbnailState {
        &self.thumbnail
    }

    /// Pending fatal error text.
    #[must_use]
    pub fn pending_error(&self) -> Option<&str> {
        self.pending_error.as_deref()
    }

    /// Bytes downloaded so far across all streams.
    #[must_use]
    pub fn downloaded_bytes(&self) -> u64 {
        u64::try_from(self.progress.completed_units.max(0)).unwrap_or(0)
    }

    /// Time spent in post-processing, if the download has finished.
    ///
    /// Measured from the later of the finished flag and the last byte
    /// transfer, so streams downloaded after the first "finished" event do
    /// not eat into the budget.
    #[must_use]
    pub fn post_processing_elapsed(&self, now: Instant) -> Option<Duration> {
        let finished = self.finished_at?;
        let since = self
            .last_download_activity
            .map_or(finished, |activity| activity.max(finished));
        Some(now.saturating_duration_since(since))
    }

    fn mark_finished(&mut self, now: Instant, effects: &mut Effects) {
        if self.finished_at.is_none() {
            self.finished_at = Some(now);
            debug!("Download-finished flag set");
            effects.say(LogLevel::Success, "Download finished, post-processing");
        }
    }

    /// Interpret one progress dictionary.
    pub fn on_event(&mut self, event: &EngineEvent, now: Instant) -> Effects {
        let mut effects = Effects::default();
        match event.status() {
            EventStatus::Downloading => self.on_downloading(event, now, &mut effects),
            EventStatus::Finished => self.on_finished(event, now, &mut effects),
            EventStatus::Other(status) => {
                effects.say(LogLevel::Info, format!("Engine status: {status}"));
            }
            EventStatus::Missing => trace!("Ignoring event without status"),
        }
        effects
    }

    fn on_downloading(&mut self, event: &EngineEvent, now: Instant, effects: &mut Effects) {
        #[allow(clippy::cast_possible_truncation)]
        let as_units = |v: f64| v as i64;

        let downloaded = event.number("downloaded_bytes").map_or(UNKNOWN_UNITS, as_units);
        let total = event
            .number("total_bytes")
            .or_else(|| event.number("total_bytes_estimate"))
            .map_or(UNKNOWN_UNITS, as_units);

        self.last_download_activity = Some(now);
        self.streams.open = true;
        if downloaded >= 0 {
            self.streams.current_completed = self.streams.current_completed.max(downloaded);
        }
        if total > 0 {
            // Estimates can shrink below what has already arrived.
            self.streams.current_total = total.max(self.streams.current_completed);
        }

        let completed = if self.streams.current_completed > 0 || downloaded >= 0 {
            (self.streams.carried_completed + self.streams.current_completed)
                .max(self.progress.completed_units)
        } else {
            self.progress.completed_units
        };
        let run_total = if total > 0 {
            (self.streams.carried_total + self.streams.current_total).max(completed)
        } else {
            UNKNOWN_UNITS
        };

        self.progress.set_units(completed, run_total);
        self.progress.throughput_bps = event.number("speed");
        self.progress.eta_secs = event.number("eta");
        if self.progress.phase != Phase::Downloading {
            effects.say(LogLevel::Progress, "Downloading");
        }
        let description = match self.progress.percent() {
            Some(pct) => format!("Downloading... {pct:.1}%"),
            None => "Downloading...".to_string(),
        };
        self.progress.enter(Phase::Downloading, description);
        effects.progress_changed = true;
    }

    fn on_finished(&mut self, event: &EngineEvent, now: Instant, effects: &mut Effects) {
        if self.streams.open {
            let stream_bytes = if self.streams.current_total > 0 {
                self.streams.current_total
            } else {
                self.streams.current_completed
            };
            self.streams.carried_completed += stream_bytes.max(0);
            self.streams.carried_total += stream_bytes.max(0);
            self.streams.current_completed = 0;
            self.streams.current_total = 0;
            self.streams.open = false;

            let carried = self.streams.carried_completed;
            let total = if self.progress.total_units > 0 {
                self.progress.total_units.max(carried)
            } else {
                UNKNOWN_UNITS
            };
            self.progress
                .set_units(carried.max(self.progress.completed_units), total);
        }

        if self.finished_filename.is_none()
            && let Some(name) = event.string("filename")
        {
            let path = self.resolve(Path::new(name));
            debug!(path = %path.display(), "Captured finished filename");
            self.finished_filename = Some(path);
        }

        self.mark_finished(now, effects);
        self.progress.throughput_bps = None;
        self.progress.eta_secs = Some(0.0);
        self.progress.enter(Phase::Finalizing, "Processing download...");
        effects.progress_changed = true;
    }

    /// Interpret one log line.
    pub fn on_log(&mut self, line: &LogLine, now: Instant) -> Effects {
        let mut effects = Effects::default();
        let text = strip_ansi(&line.text);
        let text = text.trim();
        if text.is_empty() {
            return effects;
        }

        match classify_log_line(text) {
            LogSignal::MergeStarted { path } => {
                if let Some(path) = path {
                    self.merge_filename = Some(self.resolve(&path));
                }
                self.mark_finished(now, &mut effects);
                self.merge.begin(now);
                self.progress.enter(Phase::Merging, "Merging formats...");
                effects.progress_changed = true;
                effects.say(LogLevel::Progress, text);
                return effects;
            }
            LogSignal::DeletingOriginal { path } => {
                let is_image = path.as_deref().is_some_and(is_image_path);
                if is_image && self.thumbnail.attempted {
                    self.thumbnail.embedded = true;
                    effects.say(LogLevel::Success, "Thumbnail embedded");
                } else if self.merge.in_progress && !is_image {
                    self.merge.complete();
                    self.progress.enter(Phase::Finalizing, "Merge complete");
                    effects.progress_changed = true;
                    effects.say(LogLevel::Success, "Merge complete");
                } else {
                    effects.say(LogLevel::Info, text);
                }
                return effects;
            }
            LogSignal::ThumbnailEmbedAttempt => {
                self.thumbnail.attempted = true;
                self.progress.enter(Phase::Embedding, "Embedding thumbnail...");
                effects.progress_changed = true;
                effects.say(LogLevel::Progress, text);
                return effects;
            }
            LogSignal::ThumbnailEmbedFailed => {
                self.thumbnail.failed = true;
                effects.say(LogLevel::Warning, text);
                return effects;
            }
            LogSignal::ThumbnailWritten { path } => {
                self.thumbnail.artifact = Some(self.resolve(&path));
            }
            LogSignal::Destination { path } => {
                self.last_destination = Some(self.resolve(&path));
                self.last_download_activity = Some(now);
            }
            LogSignal::MetadataStep => {
                self.progress.enter(Phase::Finalizing, "Writing metadata...");
                effects.progress_changed = true;
            }
            LogSignal::ProgressNoise => {
                self.last_download_activity = Some(now);
                return effects;
            }
            LogSignal::Plain => {}
        }

        self.apply_severity(line.severity, text, &mut effects);
        effects
    }

    fn apply_severity(&mut self, severity: EngineSeverity, text: &str, effects: &mut Effects) {
        match severity {
            EngineSeverity::Debug => trace!(target: "mediadrop::engine", "{text}"),
            EngineSeverity::Error if is_non_fatal_error(text) => {
                debug!("Downgrading decoration error to warning");
                if text.to_lowercase().contains("thumbnail") {
                    self.thumbnail.failed = true;
                }
                effects.say(LogLevel::Warning, text);
            }
            EngineSeverity::Error => {
                if self.pending_error.is_none() {
                    self.pending_error = Some(text.to_string());
                }
                effects.say(LogLevel::Error, text);
            }
            other => effects.say(level_for(other), text),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn info(text: &str) -> LogLine {
        LogLine::new(EngineSeverity::Info, text)
    }

    fn downloading(done: u64, total: u64) -> EngineEvent {
        EngineEvent::new()
            .with("status", "downloading")
            .with("downloaded_bytes", done)
            .with("total_bytes", total)
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(
            strip_ansi("\u{1b}[0;31mERROR:\u{1b}[0m broken\r"),
            "ERROR: broken"
        );
        assert_eq!(strip_ansi("plain\ttext"), "plain\ttext");
    }

    #[test]
    fn test_classify_markers() {
        assert_eq!(
            classify_log_line("[Merger] Merging formats into \"video.mp4\""),
            LogSignal::MergeStarted {
                path: Some(PathBuf::from("video.mp4"))
            }
        );
        assert_eq!(
            classify_log_line("Deleting original file video.f137.mp4 (pass -k to keep)"),
            LogSignal::DeletingOriginal {
                path: Some(PathBuf::from("video.f137.mp4"))
            }
        );
        assert_eq!(
            classify_log_line("Deleting original file"),
            LogSignal::DeletingOriginal { path: None }
        );
        assert_eq!(
            classify_log_line("[EmbedThumbnail] ffmpeg: Adding thumbnail to \"video.mp4\""),
            LogSignal::ThumbnailEmbedAttempt
        );
        assert_eq!(
            classify_log_line("[info] Writing video thumbnail 41 to: video.webp"),
            LogSignal::ThumbnailWritten {
                path: PathBuf::from("video.webp")
            }
        );
        assert_eq!(
            classify_log_line("[download] Destination: /tmp/video.f137.mp4"),
            LogSignal::Destination {
                path: PathBuf::from("/tmp/video.f137.mp4")
            }
        );
        assert_eq!(
            classify_log_line("[Metadata] Adding metadata to \"video.mp4\""),
            LogSignal::MetadataStep
        );
        assert_eq!(
            classify_log_line("[download]  45.3% of   10.00MiB at    1.00MiB/s ETA 00:05"),
            LogSignal::ProgressNoise
        );
        assert_eq!(
            classify_log_line("WARNING: Skipping embedding the thumbnail because the file is missing."),
            LogSignal::ThumbnailEmbedFailed
        );
        assert_eq!(classify_log_line("[youtube] abc: Downloading webpage"), LogSignal::Plain);
    }

    #[test]
    fn test_markers_are_case_sensitive() {
        assert_eq!(
            classify_log_line("[merger] merging formats into \"video.mp4\""),
            LogSignal::Plain
        );
    }

    #[test]
    fn test_completed_never_exceeds_total() {
        let now = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        interp.on_event(&downloading(1_500, 1_000), now);
        assert!(interp.progress().completed_units <= interp.progress().total_units);
        assert_eq!(interp.progress().percent(), Some(100.0));
    }

    #[test]
    fn test_completed_is_monotonic() {
        let now = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        interp.on_event(&downloading(800, 1_000), now);
        interp.on_event(&downloading(300, 1_000), now);
        assert_eq!(interp.progress().completed_units, 800);
    }

    #[test]
    fn test_missing_numbers_become_unknown() {
        let now = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        let event = EngineEvent::new()
            .with("status", "downloading")
            .with("downloaded_bytes", "n/a");
        interp.on_event(&event, now);
        assert_eq!(interp.progress().completed_units, UNKNOWN_UNITS);
        assert_eq!(interp.progress().total_units, UNKNOWN_UNITS);
        assert_eq!(interp.progress().phase, Phase::Downloading);
    }

    #[test]
    fn test_estimated_total_is_used() {
        let now = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        let event = EngineEvent::new()
            .with("status", "downloading")
            .with("downloaded_bytes", 250)
            .with("total_bytes_estimate", 1_000.0);
        interp.on_event(&event, now);
        assert_eq!(interp.progress().percent(), Some(25.0));
    }

    #[test]
    fn test_shrinking_estimate_keeps_completed() {
        let now = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        let estimate = |done: u64, total: u64| {
            EngineEvent::new()
                .with("status", "downloading")
                .with("downloaded_bytes", done)
                .with("total_bytes_estimate", total)
        };
        interp.on_event(&estimate(1_500, 2_000), now);
        let first = interp.progress().completed_units;
        interp.on_event(&estimate(1_600, 1_200), now);

        let progress = interp.progress();
        assert!(progress.completed_units >= first);
        assert_eq!(progress.completed_units, 1_600);
        assert_eq!(progress.total_units, 1_600);
    }

    #[test]
    fn test_thumbnail_path_with_failure_words() {
        assert_eq!(
            classify_log_line("[info] Writing video thumbnail 1 to: Fatal Error - Unable to Stop.webp"),
            LogSignal::ThumbnailWritten {
                path: PathBuf::from("Fatal Error - Unable to Stop.webp")
            }
        );
        let mut interp = Interpreter::new("/downloads");
        interp.on_log(
            &info("[info] Writing video thumbnail 1 to: Cannot Fail.jpg"),
            Instant::now(),
        );
        assert!(!interp.thumbnail().failed);
        assert_eq!(
            interp.thumbnail().artifact.as_deref(),
            Some(Path::new("/downloads/Cannot Fail.jpg"))
        );
    }

    #[test]
    fn test_finished_is_idempotent() {
        let start = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        let finished = EngineEvent::new()
            .with("status", "finished")
            .with("filename", "first.m4a");
        interp.on_event(&finished, start);
        let later = start + Duration::from_secs(30);
        let again = EngineEvent::new()
            .with("status", "finished")
            .with("filename", "second.m4a");
        interp.on_event(&again, later);
        interp.on_log(&info("[Merger] Merging formats into \"x.mp4\""), later);

        assert_eq!(
            interp.post_processing_elapsed(later),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            interp.finished_filename(),
            Some(Path::new("/downloads/first.m4a"))
        );
    }

    #[test]
    fn test_merge_start_sets_finished_flag() {
        let now = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        assert!(!interp.download_finished());
        interp.on_log(&info("[Merger] Merging formats into \"video.mp4\""), now);
        assert!(interp.download_finished());
        assert!(interp.merge().in_progress);
        assert_eq!(
            interp.merge_filename(),
            Some(Path::new("/downloads/video.mp4"))
        );
    }

    #[test]
    fn test_merge_flag_spans_markers() {
        let now = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        interp.on_log(&info("[download] Destination: video.f137.mp4"), now);
        assert!(!interp.merge().in_progress);
        interp.on_log(&info("[Merger] Merging formats into \"video.mp4\""), now);
        assert!(interp.merge().in_progress);
        interp.on_log(&info("[ffmpeg] still muxing"), now);
        assert!(interp.merge().in_progress);
        interp.on_log(
            &info("Deleting original file video.f137.mp4 (pass -k to keep)"),
            now,
        );
        assert!(!interp.merge().in_progress);
        assert!(interp.merge().seen);
    }

    #[test]
    fn test_thumbnail_deletion_after_embed_is_success() {
        let now = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        interp.on_log(&info("[info] Writing video thumbnail 1 to: video.webp"), now);
        interp.on_log(
            &info("[EmbedThumbnail] ffmpeg: Adding thumbnail to \"video.mp4\""),
            now,
        );
        interp.on_log(&info("Deleting original file video.webp (pass -k to keep)"), now);
        assert!(interp.thumbnail().embedded);
        assert_eq!(
            interp.thumbnail().artifact.as_deref(),
            Some(Path::new("/downloads/video.webp"))
        );
    }

    #[test]
    fn test_thumbnail_errors_are_downgraded() {
        let now = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        let effects = interp.on_log(
            &LogLine::new(
                EngineSeverity::Error,
                "ERROR: Postprocessing: Unable to decode thumbnail",
            ),
            now,
        );
        assert_eq!(interp.pending_error(), None);
        assert!(interp.thumbnail().failed);
        assert_eq!(effects.messages[0].0, LogLevel::Warning);

        let effects = interp.on_log(
            &LogLine::new(EngineSeverity::Error, "ERROR: Unable to write metadata"),
            now,
        );
        assert_eq!(interp.pending_error(), None);
        assert_eq!(effects.messages[0].0, LogLevel::Warning);
    }

    #[test]
    fn test_fatal_error_is_pending() {
        let now = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        interp.on_log(
            &LogLine::new(
                EngineSeverity::Error,
                "\u{1b}[0;31mERROR:\u{1b}[0m [youtube] abc: Video unavailable",
            ),
            now,
        );
        interp.on_log(&LogLine::new(EngineSeverity::Error, "ERROR: second"), now);
        assert_eq!(
            interp.pending_error(),
            Some("ERROR: [youtube] abc: Video unavailable")
        );
    }

    #[test]
    fn test_debug_lines_produce_no_messages() {
        let now = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        let effects = interp.on_log(&LogLine::new(EngineSeverity::Debug, "[debug] hello"), now);
        assert!(effects.messages.is_empty());
    }

    #[test]
    fn test_multi_stream_bytes_carry_forward() {
        let now = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        interp.on_event(&downloading(1_000, 1_000), now);
        interp.on_event(
            &EngineEvent::new()
                .with("status", "finished")
                .with("filename", "video.f137.mp4"),
            now,
        );
        interp.on_event(&downloading(100, 400), now);
        assert_eq!(interp.progress().completed_units, 1_100);
        assert_eq!(interp.progress().total_units, 1_400);
        interp.on_event(&downloading(400, 400), now);
        assert_eq!(interp.progress().percent(), Some(100.0));
    }

    #[test]
    fn test_post_processing_clock_restarts_on_later_streams() {
        let start = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        interp.on_event(&EngineEvent::new().with("status", "finished"), start);
        interp.on_event(&downloading(10, 100), start + Duration::from_secs(40));
        let now = start + Duration::from_secs(45);
        assert_eq!(
            interp.post_processing_elapsed(now),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_other_status_is_informational() {
        let now = Instant::now();
        let mut interp = Interpreter::new("/downloads");
        let effects = interp.on_event(&EngineEvent::new().with("status", "error"), now);
        assert_eq!(effects.messages.len(), 1);
        assert_eq!(effects.messages[0].0, LogLevel::Info);
        assert!(!interp.download_finished());
    }
}

//! Output file resolution and stability confirmation.
//!
//! After the engine returns, the output is located by trying, in order, the
//! merge target parsed from the log, the first "finished" filename and a
//! directory scan. The chosen file is then polled until its size stops
//! changing. Merge confirmation and stability counting are plain state
//! machines fed with [`MergeSnapshot`]s and sizes, so they can be driven by
//! synthetic snapshots; [`confirm_output`] is the async driver that feeds
//! them from the filesystem on a cooperative tick.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cleanup::is_intermediate;
use crate::config::TimeoutConfig;
use crate::error::{DownloadError, Error, Result, StuckStage};
use crate::interpreter::MergeTracking;

// =============================================================================
// Resolution
// =============================================================================

/// Where the resolved output path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedFrom {
    /// Merge target parsed from the log.
    MergeLog,
    /// First "finished" event filename.
    FinishedEvent,
    /// Newest matching file in the directory.
    DirectoryScan,
}

/// A located output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOutput {
    /// Output path.
    pub path: PathBuf,
    /// Strategy that found it.
    pub source: ResolvedFrom,
}

/// Inputs to [`resolve_output`].
#[derive(Debug, Clone)]
pub struct ResolveRequest<'a> {
    /// Working directory.
    pub directory: &'a Path,
    /// Merge target from the log.
    pub merge_filename: Option<&'a Path>,
    /// First "finished" filename.
    pub finished_filename: Option<&'a Path>,
    /// Extensions the output may have, lowercase, without the dot.
    pub extensions: &'a [&'a str],
    /// Ignore scan candidates modified before this instant.
    pub modified_since: Option<SystemTime>,
}

/// Locate the output file.
///
/// # Errors
///
/// Returns [`DownloadError::NoOutputFile`] when no strategy yields an
/// existing file.
pub fn resolve_output(request: &ResolveRequest<'_>) -> Result<ResolvedOutput> {
    if let Some(path) = request.merge_filename {
        if path.is_file() {
            debug!(path = %path.display(), "Resolved output from merge log");
            return Ok(ResolvedOutput {
                path: path.to_path_buf(),
                source: ResolvedFrom::MergeLog,
            });
        }
        debug!(path = %path.display(), "Merge target does not exist");
    }

    if let Some(path) = request.finished_filename {
        if path.is_file() && !is_intermediate(path) {
            debug!(path = %path.display(), "Resolved output from finished event");
            return Ok(ResolvedOutput {
                path: path.to_path_buf(),
                source: ResolvedFrom::FinishedEvent,
            });
        }
        debug!(path = %path.display(), "Finished filename is missing or intermediate");
    }

    if let Some(path) = newest_matching_file(
        request.directory,
        request.extensions,
        request.modified_since,
    ) {
        debug!(path = %path.display(), "Resolved output from directory scan");
        return Ok(ResolvedOutput {
            path,
            source: ResolvedFrom::DirectoryScan,
        });
    }

    Err(Error::Download(DownloadError::NoOutputFile {
        directory: request.directory.to_path_buf(),
    }))
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Most recently modified non-intermediate file with one of `extensions`.
#[must_use]
pub fn newest_matching_file(
    directory: &Path,
    extensions: &[&str],
    modified_since: Option<SystemTime>,
) -> Option<PathBuf> {
    WalkDir::new(directory)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| has_extension(e.path(), extensions) && !is_intermediate(e.path()))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            let fresh = modified_since.is_none_or(|since| modified >= since);
            fresh.then(|| (modified, e.into_path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

/// The temp companion the muxer writes while merging: `<stem>.temp.<ext>`.
#[must_use]
pub fn merge_temp_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!("{stem}.temp.{}", ext.to_string_lossy()),
        None => format!("{stem}.temp"),
    };
    output.with_file_name(name)
}

// =============================================================================
// Polling state machines
// =============================================================================

/// Filesystem view of a merge at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeSnapshot {
    /// Size of the temp companion, if present.
    pub temp_size: Option<u64>,
    /// Size of the final output, if present.
    pub final_size: Option<u64>,
}

impl MergeSnapshot {
    /// Stat the temp companion and final path.
    #[must_use]
    pub fn capture(output: &Path) -> Self {
        Self {
            temp_size: file_size(&merge_temp_path(output)),
            final_size: file_size(output),
        }
    }
}

/// Result of observing one merge snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePoll {
    /// The temp companion exists.
    Merging {
        /// Its current size.
        temp_bytes: u64,
    },
    /// Temp companion gone, final output seen this many times at one size.
    Settling {
        /// Consecutive polls at the same size.
        stable: u32,
    },
    /// Final output stable for the required number of polls.
    Complete,
    /// Neither file exists yet.
    Waiting,
}

/// Advance merge tracking with one snapshot.
///
/// The merge is complete once the temp companion has disappeared and the
/// final output showed the same size on `required_stable` consecutive polls.
pub fn observe_merge(
    tracking: &mut MergeTracking,
    snapshot: MergeSnapshot,
    now: Instant,
    required_stable: u32,
) -> MergePoll {
    if let Some(temp) = snapshot.temp_size {
        tracking.last_final_size = None;
        tracking.stable_count = 0;
        if tracking.last_temp_size != Some(temp) {
            tracking.last_temp_size = Some(temp);
            tracking.last_size_change = Some(now);
            tracking.stuck_warned = false;
        }
        return MergePoll::Merging { temp_bytes: temp };
    }

    let Some(size) = snapshot.final_size else {
        tracking.last_final_size = None;
        tracking.stable_count = 0;
        return MergePoll::Waiting;
    };

    if tracking.last_final_size == Some(size) {
        tracking.stable_count += 1;
    } else {
        tracking.last_final_size = Some(size);
        tracking.stable_count = 1;
        tracking.last_size_change = Some(now);
        tracking.stuck_warned = false;
    }

    if tracking.stable_count >= required_stable.max(1) {
        tracking.complete();
        MergePoll::Complete
    } else {
        MergePoll::Settling {
            stable: tracking.stable_count,
        }
    }
}

/// Whether a stuck warning is due, marking it emitted.
pub fn take_stuck_warning(tracking: &mut MergeTracking, now: Instant, threshold: Duration) -> bool {
    if tracking.stuck_warned || tracking.idle_for(now) < threshold {
        return false;
    }
    tracking.stuck_warned = true;
    true
}

/// Counts consecutive polls at which a file had the same size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StabilityCheck {
    required: u32,
    last_size: Option<u64>,
    stable: u32,
}

impl StabilityCheck {
    /// Require `required` consecutive equal observations.
    #[must_use]
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            last_size: None,
            stable: 0,
        }
    }

    /// Feed one observation; `None` means the file is absent. Returns whether
    /// the file is now considered stable.
    pub fn observe(&mut self, size: Option<u64>) -> bool {
        match size {
            None => {
                self.last_size = None;
                self.stable = 0;
            }
            Some(size) if self.last_size == Some(size) => self.stable += 1,
            Some(size) => {
                self.last_size = Some(size);
                self.stable = 1;
            }
        }
        self.stable >= self.required
    }

    /// Last observed size.
    #[must_use]
    pub const fn last_size(&self) -> Option<u64> {
        self.last_size
    }
}

/// Fail when post-processing has run past its size-derived budget.
///
/// # Errors
///
/// Returns [`DownloadError::ProcessingTimedOut`], attributed to the merge when
/// one is in progress.
pub fn check_post_processing(
    elapsed: Duration,
    size_bytes: u64,
    merge_in_progress: bool,
    timeouts: &TimeoutConfig,
) -> Result<()> {
    let budget = timeouts.post_processing_budget(size_bytes);
    if elapsed <= budget {
        return Ok(());
    }
    let stage = if merge_in_progress {
        StuckStage::Merge
    } else {
        StuckStage::PostProcessing
    };
    Err(Error::Download(DownloadError::ProcessingTimedOut {
        stage,
        budget_secs: budget.as_secs(),
    }))
}

fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .ok()
        .filter(fs::Metadata::is_file)
        .map(|m| m.len())
}

// =============================================================================
// Async driver
// =============================================================================

/// Progress reported while confirming the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeUpdate {
    /// The merge temp file grew or is still present.
    MergeProgress {
        /// Temp file size.
        temp_bytes: u64,
    },
    /// Merge confirmed by the filesystem.
    MergeComplete,
    /// No size change for the stuck threshold.
    Stuck {
        /// Time without change.
        idle: Duration,
    },
}

/// Polling parameters for [`confirm_output`].
#[derive(Debug, Clone)]
pub struct ConfirmOptions {
    /// Poll interval.
    pub interval: Duration,
    /// Merge stability requirement.
    pub merge_stable_polls: u32,
    /// Final stability requirement.
    pub final_stable_polls: u32,
    /// Stuck warning threshold.
    pub stuck_threshold: Duration,
    /// Post-processing deadline.
    pub deadline: Instant,
    /// Budget the deadline was derived from, for error reporting.
    pub budget: Duration,
}

impl ConfirmOptions {
    /// Build options from the timing policy.
    #[must_use]
    pub fn from_config(timeouts: &TimeoutConfig, deadline: Instant, budget: Duration) -> Self {
        Self {
            interval: timeouts.poll_interval(),
            merge_stable_polls: timeouts.merge_stable_polls,
            final_stable_polls: timeouts.final_stable_polls,
            stuck_threshold: timeouts.stuck_threshold(),
            deadline,
            budget,
        }
    }
}

async fn tick(interval: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Download(DownloadError::Canceled)),
        () = tokio::time::sleep(interval) => Ok(()),
    }
}

fn timed_out(stage: StuckStage, budget: Duration) -> Error {
    Error::Download(DownloadError::ProcessingTimedOut {
        stage,
        budget_secs: budget.as_secs(),
    })
}

/// Wait until `output` is confirmed complete and return its size.
///
/// If a merge is in progress the temp companion is polled first; after that
/// (or immediately) the final path must show a stable size. Stalls longer
/// than the stuck threshold are reported once per stall and never fail the
/// run; only the deadline does.
///
/// # Errors
///
/// Returns [`DownloadError::ProcessingTimedOut`] at the deadline, or
/// [`DownloadError::Canceled`] when `cancel` fires.
pub async fn confirm_output<F>(
    output: &Path,
    merge: &mut MergeTracking,
    options: &ConfirmOptions,
    cancel: &CancellationToken,
    mut report: F,
) -> Result<u64>
where
    F: FnMut(FinalizeUpdate),
{
    if merge.in_progress {
        info!(path = %output.display(), "Waiting for merge to complete");
        loop {
            let now = Instant::now();
            match observe_merge(
                merge,
                MergeSnapshot::capture(output),
                now,
                options.merge_stable_polls,
            ) {
                MergePoll::Complete => {
                    report(FinalizeUpdate::MergeComplete);
                    break;
                }
                MergePoll::Merging { temp_bytes } => {
                    report(FinalizeUpdate::MergeProgress { temp_bytes });
                }
                MergePoll::Settling { .. } | MergePoll::Waiting => {}
            }
            if take_stuck_warning(merge, now, options.stuck_threshold) {
                let idle = merge.idle_for(now);
                warn!(idle_secs = idle.as_secs(), "Merge shows no progress");
                report(FinalizeUpdate::Stuck { idle });
            }
            if now >= options.deadline {
                return Err(timed_out(StuckStage::Merge, options.budget));
            }
            tick(options.interval, cancel).await?;
        }
    }

    let mut stability = StabilityCheck::new(options.final_stable_polls);
    let mut last_change = Instant::now();
    let mut warned = false;
    loop {
        let now = Instant::now();
        let previous = stability.last_size();
        let size = file_size(output);
        if stability.observe(size)
            && let Some(size) = size
        {
            debug!(path = %output.display(), bytes = size, "Output is stable");
            return Ok(size);
        }
        if size != previous {
            last_change = now;
            warned = false;
        } else if !warned && now.saturating_duration_since(last_change) >= options.stuck_threshold {
            warned = true;
            let idle = now.saturating_duration_since(last_change);
            warn!(idle_secs = idle.as_secs(), "Output file is not settling");
            report(FinalizeUpdate::Stuck { idle });
        }
        if now >= options.deadline {
            return Err(timed_out(StuckStage::PostProcessing, options.budget));
        }
        tick(options.interval, cancel).await?;
    }
}

//! Temporary file sweeping for the downloads directory.
//!
//! The extraction engine leaves partial downloads, fragment files, merge
//! intermediates and bookkeeping files behind when a run is interrupted. The
//! sweeper removes those from the top level of the working directory so that
//! repeated runs do not accumulate stale data or resume from it.
//!
//! Sweeping never fails a run: removal errors are collected in the
//! [`CleanupReport`] and logged as warnings.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Suffix the artwork fallback step gives its own temp output.
pub const ARTWORK_TEMP_MARKER: &str = ".artwork-tmp.";

static FORMAT_INTERMEDIATE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\.f\d+\.[A-Za-z0-9]+$").ok());

static FRAGMENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\.part-Frag\d+(?:\.part)?$").ok());

/// Kind of temporary artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TempKind {
    /// `*.part`: partial download.
    Partial,
    /// `*.part-FragN`: one fragment of a segmented download.
    Fragment,
    /// `*.ytdl`: engine bookkeeping for resumable downloads.
    EngineState,
    /// `*.temp.*`: merge output being written.
    MergeTemp,
    /// `*.tmp`: generic temp file.
    Temp,
    /// `*.fNNN.ext`: single-format stream awaiting merge.
    FormatIntermediate,
    /// `*.artwork-tmp.*`: fallback step output.
    ArtworkTemp,
}

/// Classify a file name as a temporary artifact.
#[must_use]
pub fn classify_temp_file(file_name: &str) -> Option<TempKind> {
    if FRAGMENT.as_ref().is_some_and(|re| re.is_match(file_name)) {
        return Some(TempKind::Fragment);
    }
    if file_name.ends_with(".part") {
        return Some(TempKind::Partial);
    }
    if file_name.ends_with(".ytdl") {
        return Some(TempKind::EngineState);
    }
    if file_name.contains(ARTWORK_TEMP_MARKER) {
        return Some(TempKind::ArtworkTemp);
    }
    if file_name.contains(".temp.") {
        return Some(TempKind::MergeTemp);
    }
    if file_name.ends_with(".tmp") {
        return Some(TempKind::Temp);
    }
    if FORMAT_INTERMEDIATE
        .as_ref()
        .is_some_and(|re| re.is_match(file_name))
    {
        return Some(TempKind::FormatIntermediate);
    }
    None
}

/// Whether a path names a temporary artifact rather than a finished output.
#[must_use]
pub fn is_intermediate(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(classify_temp_file)
        .is_some()
}

/// One file considered by a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupEntry {
    /// File path.
    pub path: PathBuf,
    /// Artifact kind.
    pub kind: TempKind,
    /// Size before removal.
    pub size_bytes: u64,
    /// Whether it was removed.
    pub removed: bool,
    /// Removal error, if any.
    pub error: Option<String>,
}

/// Result of a sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Directory that was swept.
    pub directory: PathBuf,
    /// Files removed.
    pub files_removed: usize,
    /// Bytes freed.
    pub bytes_freed: u64,
    /// Files that could not be removed.
    pub files_failed: usize,
    /// Files skipped because they were protected.
    pub files_protected: usize,
    /// Per-file detail.
    pub entries: Vec<CleanupEntry>,
}

impl CleanupReport {
    /// Whether every matched file was removed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.files_failed == 0
    }

    /// One-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Removed {} temp files, freed {} bytes ({} protected, {} failed)",
            self.files_removed, self.bytes_freed, self.files_protected, self.files_failed
        )
    }
}

/// Sweeps temporary artifacts from one directory.
#[derive(Debug, Clone, Default)]
pub struct TempFileSweeper {
    protected: HashSet<PathBuf>,
}

impl TempFileSweeper {
    /// Create a sweeper with nothing protected.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Never remove `path`.
    #[must_use]
    pub fn protect(mut self, path: impl Into<PathBuf>) -> Self {
        self.protected.insert(path.into());
        self
    }

    /// Never remove any of `paths`.
    #[must_use]
    pub fn protect_all<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.protected.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Whether `path` is protected.
    #[must_use]
    pub fn is_protected(&self, path: &Path) -> bool {
        self.protected.contains(path)
    }

    fn scan(&self, directory: &Path) -> (Vec<CleanupEntry>, usize) {
        let mut entries = Vec::new();
        let mut protected = 0;

        for entry in WalkDir::new(directory)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let Some(kind) = entry.file_name().to_str().and_then(classify_temp_file) else {
                continue;
            };
            let path = entry.path().to_path_buf();
            if self.is_protected(&path) {
                debug!("Skipping protected path: {}", path.display());
                protected += 1;
                continue;
            }
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push(CleanupEntry {
                path,
                kind,
                size_bytes,
                removed: false,
                error: None,
            });
        }

        (entries, protected)
    }

    /// Remove every unprotected temporary artifact in `directory`.
    ///
    /// A missing directory yields an empty report.
    pub fn sweep(&self, directory: &Path) -> CleanupReport {
        let (mut entries, files_protected) = self.scan(directory);
        let mut report = CleanupReport {
            directory: directory.to_path_buf(),
            files_protected,
            ..CleanupReport::default()
        };

        for entry in &mut entries {
            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    entry.removed = true;
                    report.files_removed += 1;
                    report.bytes_freed += entry.size_bytes;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    entry.removed = true;
                }
                Err(e) => {
                    warn!("Failed to delete {}: {}", entry.path.display(), e);
                    entry.error = Some(e.to_string());
                    report.files_failed += 1;
                }
            }
        }
        report.entries = entries;

        if report.files_removed > 0 || report.files_failed > 0 {
            info!("{}", report.summary());
        } else {
            debug!(directory = %directory.display(), "No temp files to sweep");
        }
        report
    }
}

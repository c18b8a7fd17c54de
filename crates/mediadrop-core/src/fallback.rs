//! Artwork embedding fallback.
//!
//! Runs after finalization when the extraction engine did not report a
//! successful thumbnail embed. The original file is never left corrupted:
//! the transcoder writes to a sibling temp file that only replaces the
//! original after a clean exit. Every outcome of this step is non-fatal.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cleanup::ARTWORK_TEMP_MARKER;
use crate::config::TimeoutConfig;
use crate::engine::{EngineSink, MediaProbe, TranscodingEngine};
use crate::error::{Error, FileSystemError, Result};
use crate::interpreter::{IMAGE_EXTENSIONS, is_image_path};
use crate::timeout::{is_timeout, with_timeout};

/// Containers the fallback knows how to attach artwork to.
pub const ARTWORK_CONTAINERS: [&str; 5] = ["mp3", "m4a", "mp4", "m4v", "mov"];

/// Result of the fallback step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackOutcome {
    /// Container not handled; nothing was done.
    Unsupported {
        /// Output extension.
        extension: String,
    },
    /// Artwork was already present; nothing was done.
    AlreadyEmbedded,
    /// Artwork was attached and the original replaced.
    Embedded,
    /// The step failed; the original file is untouched.
    Failed(String),
}

impl FallbackOutcome {
    /// Whether the file now carries artwork.
    #[must_use]
    pub const fn is_embedded(&self) -> bool {
        matches!(self, Self::AlreadyEmbedded | Self::Embedded)
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// Whether the container is handled.
#[must_use]
pub fn is_supported_container(path: &Path) -> bool {
    ARTWORK_CONTAINERS.contains(&extension_of(path).as_str())
}

/// Whether an MP3 carries an ID3 picture frame.
fn mp3_has_picture(path: &Path) -> bool {
    match id3::Tag::read_from_path(path) {
        Ok(tag) => tag.pictures().next().is_some(),
        Err(id3::Error {
            kind: id3::ErrorKind::NoTag,
            ..
        }) => false,
        Err(e) => {
            debug!("Failed to read ID3 tag from {}: {}", path.display(), e);
            false
        }
    }
}

/// The temp output path: `<stem>.artwork-tmp.<ext>`.
#[must_use]
pub fn temp_output_path(media: &Path) -> PathBuf {
    let stem = media
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    media.with_file_name(format!(
        "{stem}{ARTWORK_TEMP_MARKER}{}",
        extension_of(media)
    ))
}

/// Locate the artwork file for `media`.
///
/// Order: the path the engine logged, `<stem>.<ext>` for each image
/// extension in preference order, then any image whose stem contains, or is
/// contained in, the media stem.
#[must_use]
pub fn find_artifact(media: &Path, logged: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = logged
        && path.is_file()
        && is_image_path(path)
    {
        return Some(path.to_path_buf());
    }

    let dir = media.parent()?;
    let stem = media.file_stem()?.to_string_lossy().into_owned();
    if let Some(path) = IMAGE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{stem}.{ext}")))
        .find(|p| p.is_file())
    {
        return Some(path);
    }

    let stem_lower = stem.to_lowercase();
    let mut fuzzy: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file() && is_image_path(e.path()))
        .map(walkdir::DirEntry::into_path)
        .filter(|p| {
            p.file_stem()
                .map(|s| s.to_string_lossy().to_lowercase())
                .is_some_and(|candidate| {
                    !candidate.is_empty()
                        && (candidate.contains(&stem_lower) || stem_lower.contains(&candidate))
                })
        })
        .collect();
    fuzzy.sort();
    fuzzy.into_iter().next()
}

/// Transcoder arguments attaching `artwork` to `media`, written to `output`.
///
/// `video_streams` is the number of real video streams already in `media`;
/// the artwork becomes the video stream at that index.
#[must_use]
pub fn build_embed_args(
    media: &Path,
    artwork: &Path,
    output: &Path,
    video_streams: usize,
) -> Vec<String> {
    let lossy = |p: &Path| p.to_string_lossy().into_owned();
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-i".into(),
        lossy(media),
        "-i".into(),
        lossy(artwork),
        "-map".into(),
        "0".into(),
        "-map".into(),
        "1".into(),
        "-c".into(),
        "copy".into(),
    ];

    if extension_of(artwork) == "webp" {
        args.push(format!("-c:v:{video_streams}"));
        args.push("mjpeg".into());
    }
    args.push(format!("-disposition:v:{video_streams}"));
    args.push("attached_pic".into());

    match extension_of(media).as_str() {
        "mp3" => {
            args.extend([
                "-id3v2_version".to_string(),
                "3".to_string(),
                "-metadata:s:v".to_string(),
                "title=Album cover".to_string(),
                "-metadata:s:v".to_string(),
                "comment=Cover (front)".to_string(),
            ]);
        }
        "m4a" => args.extend(["-f".to_string(), "mp4".to_string()]),
        _ => {}
    }

    args.push(lossy(output));
    args
}

fn replace_original(produced: &Path, original: &Path) -> Result<()> {
    fs::rename(produced, original).map_err(|e| {
        FileSystemError::RenameFailed {
            from: produced.to_path_buf(),
            to: original.to_path_buf(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn remove_quietly(path: &Path, what: &str) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {} {}", what, path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {} {}: {}", what, path.display(), e),
    }
}

/// Artwork fallback runner.
#[derive(Clone)]
pub struct ArtworkFallback {
    transcoder: Arc<dyn TranscodingEngine>,
    timeouts: TimeoutConfig,
}

impl std::fmt::Debug for ArtworkFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtworkFallback")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl ArtworkFallback {
    /// Create a runner.
    pub fn new(transcoder: Arc<dyn TranscodingEngine>, timeouts: TimeoutConfig) -> Self {
        Self {
            transcoder,
            timeouts,
        }
    }

    async fn probe(&self, media: &Path) -> Option<MediaProbe> {
        let transcoder = Arc::clone(&self.transcoder);
        let path = media.to_path_buf();
        match tokio::task::spawn_blocking(move || transcoder.probe(&path)).await {
            Ok(Ok(probe)) => Some(probe),
            Ok(Err(e)) => {
                debug!("Probe failed: {}", e);
                None
            }
            Err(e) => {
                debug!("Probe task failed: {}", e);
                None
            }
        }
    }

    /// Ensure `media` carries embedded artwork.
    ///
    /// `logged_artifact` is the thumbnail path the engine reported, if any.
    pub async fn run(
        &self,
        media: &Path,
        logged_artifact: Option<&Path>,
        progress: Option<EngineSink>,
    ) -> FallbackOutcome {
        let extension = extension_of(media);
        if !is_supported_container(media) {
            info!(extension, "Container not handled by artwork fallback, skipping");
            return FallbackOutcome::Unsupported { extension };
        }

        let probe = if extension == "mp3" {
            let path = media.to_path_buf();
            let has_picture = tokio::task::spawn_blocking(move || mp3_has_picture(&path))
                .await
                .unwrap_or(false);
            if has_picture {
                info!("Artwork already embedded");
                return FallbackOutcome::AlreadyEmbedded;
            }
            None
        } else {
            let probe = self.probe(media).await;
            if probe.as_ref().is_some_and(MediaProbe::has_attached_picture) {
                info!("Artwork already embedded");
                return FallbackOutcome::AlreadyEmbedded;
            }
            probe
        };

        let Some(artifact) = find_artifact(media, logged_artifact) else {
            warn!(path = %media.display(), "No artwork file found for fallback");
            return FallbackOutcome::Failed("no artwork file found".to_string());
        };

        let video_streams = probe.as_ref().map_or_else(
            || usize::from(matches!(extension.as_str(), "mp4" | "m4v" | "mov")),
            MediaProbe::video_stream_count,
        );
        let output = temp_output_path(media);
        let args = build_embed_args(media, &artifact, &output, video_streams);

        let size = fs::metadata(media).map(|m| m.len()).unwrap_or(0);
        let budget = self.timeouts.fallback_budget(size);
        info!(
            artwork = %artifact.display(),
            budget_secs = budget.as_secs(),
            "Embedding artwork with transcoder"
        );

        let transcoder = Arc::clone(&self.transcoder);
        let result = with_timeout(budget, async move {
            tokio::task::spawn_blocking(move || transcoder.execute(&args, progress))
                .await
                .map_err(|e| Error::fallback_failed(format!("transcoder task failed: {e}")))?
        })
        .await;

        let outcome = match result {
            Ok(0) if output.is_file() => match replace_original(&output, media) {
                Ok(()) => FallbackOutcome::Embedded,
                Err(e) => FallbackOutcome::Failed(e.to_string()),
            },
            Ok(0) => FallbackOutcome::Failed("transcoder produced no output".to_string()),
            Ok(code) => FallbackOutcome::Failed(format!("transcoder exited with status {code}")),
            Err(e) if is_timeout(&e) => {
                FallbackOutcome::Failed(format!("timed out after {}s", budget.as_secs()))
            }
            Err(e) => FallbackOutcome::Failed(e.to_string()),
        };

        if outcome != FallbackOutcome::Embedded {
            remove_quietly(&output, "fallback temp output");
        }
        remove_quietly(&artifact, "artwork file");

        match &outcome {
            FallbackOutcome::Embedded => info!(path = %media.display(), "Artwork embedded"),
            FallbackOutcome::Failed(reason) => warn!("Artwork fallback failed: {}", reason),
            _ => {}
        }
        outcome
    }
}

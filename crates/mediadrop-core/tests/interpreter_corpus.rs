//! Replays captured engine output through the interpreter.
//!
//! Each corpus is a sequence of progress events and log lines as the
//! extraction engine emits them for one kind of download.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mediadrop_core::{EngineEvent, EngineSeverity, Interpreter, LogLevel, LogLine, Phase};
use tokio::time::Instant;

enum Entry {
    Event(EngineEvent),
    Line(EngineSeverity, &'static str),
}

use Entry::{Event, Line};

fn downloading(done: u64, total: u64) -> Entry {
    Event(
        EngineEvent::new()
            .with("status", "downloading")
            .with("downloaded_bytes", done)
            .with("total_bytes", total),
    )
}

fn finished(filename: &str) -> Entry {
    Event(
        EngineEvent::new()
            .with("status", "finished")
            .with("filename", filename),
    )
}

fn info(text: &'static str) -> Entry {
    Line(EngineSeverity::Info, text)
}

/// Replay `entries`, one second apart, collecting every user-facing message.
fn replay(interp: &mut Interpreter, entries: Vec<Entry>) -> Vec<(LogLevel, String)> {
    let start = Instant::from_std(std::time::Instant::now());
    let mut messages = Vec::new();
    for (i, entry) in entries.into_iter().enumerate() {
        let now = start + Duration::from_secs(i as u64);
        let effects = match entry {
            Event(event) => interp.on_event(&event, now),
            Line(severity, text) => interp.on_log(&LogLine::new(severity, text), now),
        };
        messages.extend(effects.messages);
    }
    messages
}

fn video_corpus() -> Vec<Entry> {
    vec![
        info("[youtube] Extracting URL: https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
        info("[youtube] dQw4w9WgXcQ: Downloading webpage"),
        info("[info] dQw4w9WgXcQ: Downloading 1 format(s): 137+140"),
        info("[info] Writing video thumbnail 41 to: Title [dQw4w9WgXcQ].webp"),
        info("[download] Destination: Title [dQw4w9WgXcQ].f137.mp4"),
        downloading(4_000_000, 8_000_000),
        info("[download]  50.0% of    7.63MiB at    2.00MiB/s ETA 00:02"),
        downloading(8_000_000, 8_000_000),
        finished("Title [dQw4w9WgXcQ].f137.mp4"),
        info("[download] Destination: Title [dQw4w9WgXcQ].f140.m4a"),
        downloading(1_000_000, 2_000_000),
        downloading(2_000_000, 2_000_000),
        finished("Title [dQw4w9WgXcQ].f140.m4a"),
        info("[Merger] Merging formats into \"Title [dQw4w9WgXcQ].mp4\""),
        info("Deleting original file Title [dQw4w9WgXcQ].f137.mp4 (pass -k to keep)"),
        info("Deleting original file Title [dQw4w9WgXcQ].f140.m4a (pass -k to keep)"),
        info("[EmbedThumbnail] ffmpeg: Adding thumbnail to \"Title [dQw4w9WgXcQ].mp4\""),
        info("Deleting original file Title [dQw4w9WgXcQ].webp (pass -k to keep)"),
    ]
}

#[test]
fn video_merge_with_engine_embedded_thumbnail() {
    let dir = Path::new("/downloads");
    let mut interp = Interpreter::new(dir);
    let messages = replay(&mut interp, video_corpus());

    assert_eq!(
        interp.merge_filename(),
        Some(dir.join("Title [dQw4w9WgXcQ].mp4").as_path())
    );
    // The first finished event wins even though a second stream followed.
    assert_eq!(
        interp.finished_filename(),
        Some(dir.join("Title [dQw4w9WgXcQ].f137.mp4").as_path())
    );
    assert!(interp.merge().seen);
    assert!(!interp.merge().in_progress);

    let thumbnail = interp.thumbnail();
    assert!(thumbnail.attempted);
    assert!(thumbnail.embedded);
    assert!(!thumbnail.failed);
    assert_eq!(
        thumbnail.artifact,
        Some(PathBuf::from("/downloads/Title [dQw4w9WgXcQ].webp"))
    );

    // Both streams count toward the run total.
    let progress = interp.progress();
    assert_eq!(progress.completed_units, 10_000_000);
    assert_eq!(progress.total_units, 10_000_000);
    assert_eq!(progress.phase, Phase::Embedding);
    assert!(interp.pending_error().is_none());

    assert_eq!(
        messages
            .iter()
            .filter(|(level, text)| *level == LogLevel::Success && text == "Merge complete")
            .count(),
        1
    );
    assert!(
        messages
            .iter()
            .any(|(level, text)| *level == LogLevel::Success && text == "Thumbnail embedded")
    );
    // Textual progress bars are superseded by structured events.
    assert!(!messages.iter().any(|(_, text)| text.contains("ETA 00:02")));
}

#[test]
fn merge_flag_is_set_by_the_first_marker() {
    let mut interp = Interpreter::new("/downloads");
    let corpus = video_corpus();
    let merge_at = corpus
        .iter()
        .position(|e| matches!(e, Line(_, text) if text.starts_with("[Merger]")))
        .expect("merge marker in corpus");

    let head: Vec<Entry> = corpus.into_iter().take(merge_at + 1).collect();
    replay(&mut interp, head);

    assert!(interp.merge().in_progress);
    assert!(interp.download_finished());
    assert_eq!(interp.progress().phase, Phase::Merging);
}

#[test]
fn audio_extraction_with_metadata_steps() {
    let dir = Path::new("/music");
    let mut interp = Interpreter::new(dir);
    let messages = replay(
        &mut interp,
        vec![
            info("[soundcloud] artist/track: Downloading info JSON"),
            info("[info] artist/track: Downloading 1 format(s): hls_opus_64"),
            info("[download] Destination: Track.opus"),
            downloading(120_000, 480_000),
            downloading(480_000, 480_000),
            finished("Track.opus"),
            finished("Track.opus"),
            info("[Metadata] Adding metadata to \"Track.opus\""),
        ],
    );

    assert_eq!(interp.finished_filename(), Some(dir.join("Track.opus").as_path()));
    assert_eq!(interp.last_destination(), Some(dir.join("Track.opus").as_path()));
    assert!(interp.merge_filename().is_none());
    assert!(!interp.merge().seen);
    assert_eq!(interp.progress().phase, Phase::Finalizing);
    // A repeated finished event neither double counts bytes nor repeats the notice.
    assert_eq!(interp.progress().completed_units, 480_000);
    assert_eq!(
        messages
            .iter()
            .filter(|(_, text)| text.starts_with("Download finished"))
            .count(),
        1
    );
}

#[test]
fn thumbnail_failure_is_downgraded() {
    let mut interp = Interpreter::new("/downloads");
    let messages = replay(
        &mut interp,
        vec![
            downloading(10, 10),
            finished("clip.mkv"),
            info("[EmbedThumbnail] ffmpeg: Adding thumbnail to \"clip.mkv\""),
            Line(
                EngineSeverity::Error,
                "ERROR: Postprocessing: Error while embedding thumbnail: Conversion failed!",
            ),
            Line(
                EngineSeverity::Error,
                "ERROR: Unable to write metadata: mutagen is not installed",
            ),
        ],
    );

    assert!(interp.pending_error().is_none());
    assert!(interp.thumbnail().attempted);
    assert!(interp.thumbnail().failed);
    assert!(!interp.thumbnail().embedded);
    assert!(!messages.iter().any(|(level, _)| *level == LogLevel::Error));
}

#[test]
fn first_fatal_error_is_kept() {
    let mut interp = Interpreter::new("/downloads");
    replay(
        &mut interp,
        vec![
            info("[youtube] abc: Downloading webpage"),
            Line(
                EngineSeverity::Error,
                "\u{1b}[0;31mERROR:\u{1b}[0m [youtube] abc: Video unavailable",
            ),
            Line(EngineSeverity::Error, "ERROR: Requested format is not available"),
        ],
    );

    assert_eq!(
        interp.pending_error(),
        Some("ERROR: [youtube] abc: Video unavailable")
    );
    assert!(!interp.download_finished());
}

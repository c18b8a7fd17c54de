//! Boundaries to the external engines.
//!
//! The extraction engine discovers and downloads media streams; the
//! transcoding engine performs container-level work (muxing, artwork
//! attachment). Both are blocking calls; the orchestrator runs them on the
//! blocking pool and receives engine telemetry through an [`EngineSink`].
//!
//! Process-backed implementations live in [`crate::ytdlp`] and
//! [`crate::ffmpeg`].

use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;

/// Severity attached by the extraction engine to a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineSeverity {
    /// Verbose diagnostics.
    Debug,
    /// Normal output.
    Info,
    /// Warnings.
    Warning,
    /// Errors.
    Error,
}

/// A free-text line from the extraction engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Engine-reported severity.
    pub severity: EngineSeverity,
    /// Raw text, possibly containing terminal control sequences.
    pub text: String,
}

impl LogLine {
    /// Create a log line.
    pub fn new(severity: EngineSeverity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
        }
    }
}

/// Recognized values of an event's `status` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    /// Bytes are being transferred.
    Downloading,
    /// One stream finished downloading.
    Finished,
    /// Any other status, passed through as information.
    Other(String),
    /// The event had no usable status.
    Missing,
}

/// A loosely-typed progress dictionary from the extraction engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineEvent {
    fields: Map<String, Value>,
}

impl EngineEvent {
    /// Create an empty event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an event from a JSON value; non-objects yield `None`.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// The event's status.
    #[must_use]
    pub fn status(&self) -> EventStatus {
        match self.fields.get("status").and_then(Value::as_str) {
            Some("downloading") => EventStatus::Downloading,
            Some("finished") => EventStatus::Finished,
            Some(other) => EventStatus::Other(other.to_string()),
            None => EventStatus::Missing,
        }
    }

    /// A numeric field, accepting JSON numbers and numeric strings.
    ///
    /// Non-finite and negative values are treated as absent.
    #[must_use]
    pub fn number(&self, key: &str) -> Option<f64> {
        let value = match self.fields.get(key)? {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        (value.is_finite() && value >= 0.0).then_some(value)
    }

    /// A non-empty string field.
    #[must_use]
    pub fn string(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Telemetry emitted by an engine while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineSignal {
    /// Structured progress dictionary.
    Event(EngineEvent),
    /// Free-text log line.
    Log(LogLine),
    /// Fractional transcode progress (0.0 - 1.0) from the engine's own muxer.
    TranscodeProgress(f64),
}

/// Sending half handed to engines for their telemetry.
///
/// Sending never blocks; signals sent after the run is over are dropped.
#[derive(Debug, Clone)]
pub struct EngineSink {
    tx: mpsc::UnboundedSender<EngineSignal>,
}

impl EngineSink {
    /// Create a sink and the receiver the orchestrator drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report a progress dictionary.
    pub fn event(&self, event: EngineEvent) {
        let _ = self.tx.send(EngineSignal::Event(event));
    }

    /// Report a log line.
    pub fn log(&self, severity: EngineSeverity, text: impl Into<String>) {
        let _ = self.tx.send(EngineSignal::Log(LogLine::new(severity, text)));
    }

    /// Report transcode progress.
    pub fn transcode_progress(&self, fraction: f64) {
        let _ = self
            .tx
            .send(EngineSignal::TranscodeProgress(fraction.clamp(0.0, 1.0)));
    }
}

/// The external media-extraction engine.
#[cfg_attr(test, mockall::automock)]
pub trait ExtractionEngine: Send + Sync {
    /// Download `url` according to `args`, blocking until the engine returns.
    ///
    /// Implementations must poll `cancel` and return
    /// [`crate::error::DownloadError::Canceled`] promptly once it fires.
    fn extract(
        &self,
        url: &str,
        args: &[String],
        sink: &EngineSink,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Creates a fresh extraction engine binding for every run.
pub trait EngineFactory: Send + Sync {
    /// Build a new engine instance.
    fn create(&self) -> Result<Box<dyn ExtractionEngine>>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Box<dyn ExtractionEngine>> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn ExtractionEngine>> {
        self()
    }
}

/// One stream reported by a media probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbedStream {
    /// Stream index within the container.
    pub index: u32,
    /// `audio`, `video`, ... if reported.
    pub codec_type: Option<String>,
    /// Codec short name, if reported.
    pub codec_name: Option<String>,
    /// Whether the stream is an attached picture (cover art).
    pub attached_pic: bool,
}

/// Stream layout of a media file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaProbe {
    /// All streams in container order.
    pub streams: Vec<ProbedStream>,
}

impl MediaProbe {
    /// Whether any stream is classified as embedded artwork.
    #[must_use]
    pub fn has_attached_picture(&self) -> bool {
        self.streams.iter().any(|s| s.attached_pic)
    }

    /// Number of real (non-artwork) video streams.
    #[must_use]
    pub fn video_stream_count(&self) -> usize {
        self.streams
            .iter()
            .filter(|s| s.codec_type.as_deref() == Some("video") && !s.attached_pic)
            .count()
    }
}

/// The external transcoding engine.
#[cfg_attr(test, mockall::automock)]
pub trait TranscodingEngine: Send + Sync {
    /// Run with a flat argument vector, returning the exit status (0 = success).
    ///
    /// When `progress` is given, fractional progress is reported through it.
    fn execute(&self, args: &[String], progress: Option<EngineSink>) -> Result<i32>;

    /// Report the stream layout of `path`.
    fn probe(&self, path: &Path) -> Result<MediaProbe>;
}

/// Per-run state that must never leak into the next run.
pub struct RunContext {
    /// Run identifier used in logs.
    pub id: Uuid,
    /// Freshly created engine binding.
    pub engine: Box<dyn ExtractionEngine>,
    /// Cancellation for this run only.
    pub cancel: CancellationToken,
    /// Monotonic start time.
    pub started_at: tokio::time::Instant,
    /// Wall-clock start time, for comparing file modification times.
    pub started_wall: SystemTime,
}

impl RunContext {
    /// Create a context with a new engine from `factory`.
    pub fn create(factory: &dyn EngineFactory) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            engine: factory.create()?,
            cancel: CancellationToken::new(),
            started_at: tokio::time::Instant::now(),
            started_wall: SystemTime::now(),
        })
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("id", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_status() {
        let ev = EngineEvent::new().with("status", "downloading");
        assert_eq!(ev.status(), EventStatus::Downloading);
        let ev = EngineEvent::new().with("status", "finished");
        assert_eq!(ev.status(), EventStatus::Finished);
        let ev = EngineEvent::new().with("status", "error");
        assert_eq!(ev.status(), EventStatus::Other("error".to_string()));
        assert_eq!(EngineEvent::new().status(), EventStatus::Missing);
    }

    #[test]
    fn test_event_numbers_are_loose() {
        let ev = EngineEvent::from_value(json!({
            "status": "downloading",
            "downloaded_bytes": 1024,
            "total_bytes": "2048",
            "speed": null,
            "eta": -3,
            "elapsed": "soon",
        }))
        .unwrap();
        assert_eq!(ev.number("downloaded_bytes"), Some(1024.0));
        assert_eq!(ev.number("total_bytes"), Some(2048.0));
        assert_eq!(ev.number("speed"), None);
        assert_eq!(ev.number("eta"), None);
        assert_eq!(ev.number("elapsed"), None);
        assert_eq!(ev.number("missing"), None);
    }

    #[test]
    fn test_non_object_is_not_an_event() {
        assert!(EngineEvent::from_value(json!([1, 2])).is_none());
        assert!(EngineEvent::from_value(json!("finished")).is_none());
    }

    #[test]
    fn test_blank_string_is_absent() {
        let ev = EngineEvent::new().with("filename", "   ");
        assert_eq!(ev.string("filename"), None);
    }

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (sink, mut rx) = EngineSink::channel();
        sink.log(EngineSeverity::Info, "one");
        sink.event(EngineEvent::new().with("status", "finished"));
        sink.transcode_progress(1.7);

        assert!(matches!(rx.recv().await, Some(EngineSignal::Log(l)) if l.text == "one"));
        assert!(matches!(rx.recv().await, Some(EngineSignal::Event(_))));
        assert_eq!(rx.recv().await, Some(EngineSignal::TranscodeProgress(1.0)));
    }

    #[test]
    fn test_probe_helpers() {
        let probe = MediaProbe {
            streams: vec![
                ProbedStream {
                    index: 0,
                    codec_type: Some("video".to_string()),
                    codec_name: Some("h264".to_string()),
                    attached_pic: false,
                },
                ProbedStream {
                    index: 1,
                    codec_type: Some("video".to_string()),
                    codec_name: Some("mjpeg".to_string()),
                    attached_pic: true,
                },
            ],
        };
        assert!(probe.has_attached_picture());
        assert_eq!(probe.video_stream_count(), 1);
    }

    #[test]
    fn test_run_context_uses_fresh_engine_each_time() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let created = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&created);
        let factory = move || -> Result<Box<dyn ExtractionEngine>> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockExtractionEngine::new()))
        };

        let first = RunContext::create(&factory).unwrap();
        let second = RunContext::create(&factory).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_ne!(first.id, second.id);
        first.cancel.cancel();
        assert!(!second.cancel.is_cancelled());
    }
}

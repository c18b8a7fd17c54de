//! Process-backed transcoding engine (`ffmpeg` / `ffprobe`).

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::engine::{EngineSink, MediaProbe, ProbedStream, TranscodingEngine};
use crate::error::{EngineError, Error, Result};

const STDERR_TAIL_BYTES: usize = 2_000;

/// Runs the `ffmpeg` and `ffprobe` executables.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl FfmpegTranscoder {
    /// Use the given executables.
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn spawn_error(tool: &str, e: &std::io::Error) -> Error {
        match e.kind() {
            std::io::ErrorKind::NotFound => Error::Engine(EngineError::ToolMissing {
                tool: tool.to_string(),
            }),
            _ => Error::Engine(EngineError::SpawnFailed {
                tool: tool.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn ffprobe_json(&self, input: &Path) -> Result<FfprobeOutput> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(input)
            .output()
            .map_err(|e| Self::spawn_error("ffprobe", &e))?;

        if !output.status.success() {
            return Err(Error::Engine(EngineError::ToolFailed {
                tool: "ffprobe".to_string(),
                code: output.status.code(),
                stderr: tail(&String::from_utf8_lossy(&output.stderr)),
            }));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            Error::Engine(EngineError::ProbeFailed {
                path: input.to_path_buf(),
                reason: e.to_string(),
            })
        })
    }

    fn duration_secs(&self, input: &Path) -> Option<f64> {
        let parsed = self.ffprobe_json(input).ok()?;
        let secs: f64 = parsed.format?.duration?.parse().ok()?;
        (secs.is_finite() && secs > 0.0).then_some(secs)
    }
}

impl TranscodingEngine for FfmpegTranscoder {
    fn execute(&self, args: &[String], progress: Option<EngineSink>) -> Result<i32> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-nostdin", "-hide_banner", "-loglevel", "error"]);

        let duration = progress
            .as_ref()
            .and_then(|_| first_input(args))
            .and_then(|p| self.duration_secs(&p));
        if duration.is_some() {
            cmd.args(["-progress", "pipe:1", "-nostats"]);
            cmd.stdout(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null());
        }
        cmd.args(args).stderr(Stdio::piped());

        debug!(args = ?args, "Running ffmpeg");
        let mut child = cmd.spawn().map_err(|e| Self::spawn_error("ffmpeg", &e))?;
        // Drained alongside stdout so neither pipe fills while the other is read.
        let stderr = child.stderr.take().map(spawn_stderr_collector);

        if let (Some(total), Some(sink), Some(stdout)) = (duration, progress.as_ref(), child.stdout.take()) {
            for line in BufReader::new(stdout).lines().map_while(std::result::Result::ok) {
                if let Some(fraction) = parse_progress_line(&line, total) {
                    sink.transcode_progress(fraction);
                }
            }
        }

        let status = child.wait()?;
        let stderr = stderr
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let code = status.code().unwrap_or(-1);
        if code != 0 {
            warn!(code, stderr = %tail(&stderr), "ffmpeg exited unsuccessfully");
        }
        Ok(code)
    }

    fn probe(&self, path: &Path) -> Result<MediaProbe> {
        let parsed = self.ffprobe_json(path)?;
        let streams = parsed
            .streams
            .unwrap_or_default()
            .into_iter()
            .map(|s| ProbedStream {
                index: s.index,
                codec_type: s.codec_type,
                codec_name: s.codec_name,
                attached_pic: s.disposition.is_some_and(|d| d.attached_pic != 0),
            })
            .collect();
        Ok(MediaProbe { streams })
    }
}

/// The path following the first `-i`.
fn first_input(args: &[String]) -> Option<PathBuf> {
    args.iter()
        .position(|a| a == "-i")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}

/// Parse one `-progress` key=value line into a fraction of `total_secs`.
fn parse_progress_line(line: &str, total_secs: f64) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // Both keys carry microseconds.
        "out_time_us" | "out_time_ms" => {
            let micros: f64 = value.parse().ok()?;
            Some((micros / 1_000_000.0 / total_secs).clamp(0.0, 1.0))
        }
        "progress" if value == "end" => Some(1.0),
        _ => None,
    }
}

fn spawn_stderr_collector<R: Read + Send + 'static>(pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = BufReader::new(pipe).read_to_end(&mut bytes);
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

fn tail(text: &str) -> String {
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    streams: Option<Vec<FfprobeStream>>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    disposition: Option<FfprobeDisposition>,
}

#[derive(Debug, Deserialize)]
struct FfprobeDisposition {
    #[serde(default)]
    attached_pic: u8,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

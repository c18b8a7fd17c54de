//! Process-backed extraction engine (`yt-dlp`).
//!
//! The executable's progress hook dictionaries are printed one per line with
//! a sentinel prefix through `--progress-template`; every other stdout line
//! is an info log line. Stderr lines are classified by their `ERROR:`,
//! `WARNING:` and `[debug]` prefixes.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{EngineEvent, EngineSeverity, EngineSink, ExtractionEngine};
use crate::error::{DownloadError, EngineError, Error, Result};

/// Prefix marking a progress dictionary on stdout.
pub const EVENT_SENTINEL: &str = "__MEDIADROP_EVENT__ ";

const WAIT_POLL: Duration = Duration::from_millis(100);
const STDERR_ERRORS_KEPT: usize = 5;

/// Runs the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpEngine {
    program: PathBuf,
}

impl Default for YtDlpEngine {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl YtDlpEngine {
    /// Use the given executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments the adapter adds in front of the caller's list.
    #[must_use]
    pub fn adapter_args() -> Vec<String> {
        vec![
            "--newline".to_string(),
            "--progress-template".to_string(),
            format!("download:{EVENT_SENTINEL}%(progress)j"),
        ]
    }
}

/// Classify one stderr line by its prefix.
#[must_use]
pub fn stderr_severity(line: &str) -> EngineSeverity {
    let trimmed = line.trim_start();
    if trimmed.starts_with("ERROR:") {
        EngineSeverity::Error
    } else if trimmed.starts_with("WARNING:") {
        EngineSeverity::Warning
    } else if trimmed.starts_with("[debug]") {
        EngineSeverity::Debug
    } else {
        EngineSeverity::Info
    }
}

/// Route one stdout line to the sink.
pub fn dispatch_stdout_line(line: &str, sink: &EngineSink) {
    if let Some(payload) = line.strip_prefix(EVENT_SENTINEL) {
        match serde_json::from_str(payload)
            .ok()
            .and_then(EngineEvent::from_value)
        {
            Some(event) => sink.event(event),
            None => debug!("Unparseable progress payload: {payload}"),
        }
        return;
    }
    sink.log(EngineSeverity::Info, line);
}

fn spawn_stdout_reader<R: Read + Send + 'static>(pipe: R, sink: EngineSink) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(pipe).lines().map_while(std::result::Result::ok) {
            dispatch_stdout_line(&line, &sink);
        }
    })
}

fn spawn_stderr_reader<R: Read + Send + 'static>(
    pipe: R,
    sink: EngineSink,
) -> JoinHandle<Vec<String>> {
    thread::spawn(move || {
        let mut errors = Vec::new();
        for line in BufReader::new(pipe).lines().map_while(std::result::Result::ok) {
            let severity = stderr_severity(&line);
            if severity == EngineSeverity::Error {
                if errors.len() == STDERR_ERRORS_KEPT {
                    errors.remove(0);
                }
                errors.push(line.clone());
            }
            sink.log(severity, line);
        }
        errors
    })
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill yt-dlp: {}", e);
    }
    let _ = child.wait();
}

impl ExtractionEngine for YtDlpEngine {
    fn extract(
        &self,
        url: &str,
        args: &[String],
        sink: &EngineSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(Self::adapter_args())
            .args(args)
            .arg("--")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(program = %self.program.display(), "Spawning yt-dlp");
        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::Engine(EngineError::ToolMissing {
                tool: "yt-dlp".to_string(),
            }),
            _ => Error::Engine(EngineError::SpawnFailed {
                tool: "yt-dlp".to_string(),
                reason: e.to_string(),
            }),
        })?;

        let stdout = child
            .stdout
            .take()
            .map(|pipe| spawn_stdout_reader(pipe, sink.clone()));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| spawn_stderr_reader(pipe, sink.clone()));

        let status = loop {
            if cancel.is_cancelled() {
                info!("Cancelling yt-dlp");
                kill(&mut child);
                if let Some(handle) = stdout {
                    let _ = handle.join();
                }
                if let Some(handle) = stderr {
                    let _ = handle.join();
                }
                return Err(Error::Download(DownloadError::Canceled));
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(WAIT_POLL),
                Err(e) => {
                    kill(&mut child);
                    return Err(Error::Io(e));
                }
            }
        };

        if let Some(handle) = stdout {
            let _ = handle.join();
        }
        let errors = stderr
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if status.success() {
            debug!("yt-dlp exited successfully");
            Ok(())
        } else {
            Err(Error::Engine(EngineError::ToolFailed {
                tool: "yt-dlp".to_string(),
                code: status.code(),
                stderr: errors.join("\n"),
            }))
        }
    }
}

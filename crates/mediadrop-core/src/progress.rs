//! Progress snapshots published to the presentation layer.

use serde::{Deserialize, Serialize};

/// Sentinel for a byte count the engine has not reported.
pub const UNKNOWN_UNITS: i64 = -1;

/// Named stage of one download run, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Resolving the URL into downloadable streams.
    #[default]
    Extracting,
    /// Transferring stream bytes.
    Downloading,
    /// Muxing separate streams into one container.
    Merging,
    /// Embedding thumbnail or metadata.
    Embedding,
    /// Locating and validating the output file.
    Finalizing,
    /// Running the transcoding engine (artwork fallback).
    Transcoding,
    /// Done.
    Finished,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Extracting => write!(f, "Extracting"),
            Self::Downloading => write!(f, "Downloading"),
            Self::Merging => write!(f, "Merging"),
            Self::Embedding => write!(f, "Embedding"),
            Self::Finalizing => write!(f, "Finalizing"),
            Self::Transcoding => write!(f, "Transcoding"),
            Self::Finished => write!(f, "Finished"),
        }
    }
}

/// Snapshot of run progress.
///
/// `completed_units` never exceeds `total_units` when the total is known and
/// positive. Either may be [`UNKNOWN_UNITS`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    /// Current phase.
    pub phase: Phase,
    /// Bytes completed, or [`UNKNOWN_UNITS`].
    pub completed_units: i64,
    /// Bytes expected, or [`UNKNOWN_UNITS`].
    pub total_units: i64,
    /// Transfer speed in bytes per second.
    pub throughput_bps: Option<f64>,
    /// Estimated seconds remaining.
    pub eta_secs: Option<f64>,
    /// Human-readable status line.
    pub description: String,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            phase: Phase::Extracting,
            completed_units: UNKNOWN_UNITS,
            total_units: UNKNOWN_UNITS,
            throughput_bps: None,
            eta_secs: None,
            description: "Preparing download...".to_string(),
        }
    }
}

impl ProgressState {
    /// Set byte counters, clamping completed to total when the total is known.
    pub fn set_units(&mut self, completed: i64, total: i64) {
        let total = if total > 0 { total } else { UNKNOWN_UNITS };
        let completed = if completed < 0 {
            UNKNOWN_UNITS
        } else if total > 0 {
            completed.min(total)
        } else {
            completed
        };
        self.completed_units = completed;
        self.total_units = total;
    }

    /// Move to a new phase with a description.
    pub fn enter(&mut self, phase: Phase, description: impl Into<String>) {
        self.phase = phase;
        self.description = description.into();
    }

    /// Fraction complete (0.0 - 1.0), if both counters are known.
    #[must_use]
    pub fn fraction(&self) -> Option<f64> {
        if self.total_units > 0 && self.completed_units >= 0 {
            Some(self.completed_units as f64 / self.total_units as f64)
        } else {
            None
        }
    }

    /// Percentage complete (0.0 - 100.0), if known.
    #[must_use]
    pub fn percent(&self) -> Option<f64> {
        self.fraction().map(|f| f * 100.0)
    }

    /// Format the throughput as a human-readable string.
    #[must_use]
    pub fn formatted_speed(&self) -> Option<String> {
        self.throughput_bps.map(format_bytes_per_second)
    }

    /// Format the estimated time remaining as a human-readable string.
    #[must_use]
    pub fn formatted_eta(&self) -> Option<String> {
        self.eta_secs.map(format_duration)
    }
}

/// Format bytes per second as a human-readable string.
#[must_use]
pub fn format_bytes_per_second(bps: f64) -> String {
    if bps < 1024.0 {
        format!("{bps:.0} B/s")
    } else if bps < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bps / 1024.0)
    } else {
        format!("{:.1} MB/s", bps / (1024.0 * 1024.0))
    }
}

/// Format a byte count as a human-readable string.
#[must_use]
pub fn format_bytes(bytes: i64) -> String {
    if bytes < 0 {
        return "?".to_string();
    }
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{bytes:.0} B")
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.1} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.1} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format duration in seconds as a human-readable string.
#[must_use]
pub fn format_duration(secs: f64) -> String {
    let total_secs = secs.max(0.0) as u64;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unknown() {
        let state = ProgressState::default();
        assert_eq!(state.completed_units, UNKNOWN_UNITS);
        assert_eq!(state.total_units, UNKNOWN_UNITS);
        assert_eq!(state.fraction(), None);
    }

    #[test]
    fn test_set_units_clamps_completed_to_total() {
        let mut state = ProgressState::default();
        state.set_units(1_500, 1_000);
        assert_eq!(state.completed_units, 1_000);
        assert_eq!(state.percent(), Some(100.0));
    }

    #[test]
    fn test_set_units_unknown_total_keeps_completed() {
        let mut state = ProgressState::default();
        state.set_units(4_096, 0);
        assert_eq!(state.completed_units, 4_096);
        assert_eq!(state.total_units, UNKNOWN_UNITS);
        assert_eq!(state.fraction(), None);
    }

    #[test]
    fn test_half_way() {
        let mut state = ProgressState::default();
        state.set_units(500_000, 1_000_000);
        assert_eq!(state.percent(), Some(50.0));
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes_per_second(512.0), "512 B/s");
        assert_eq!(format_bytes_per_second(2048.0), "2.0 KB/s");
        assert_eq!(format_bytes_per_second(3.0 * 1024.0 * 1024.0), "3.0 MB/s");
        assert_eq!(format_duration(65.0), "1:05");
        assert_eq!(format_duration(3725.0), "1:02:05");
        assert_eq!(format_bytes(UNKNOWN_UNITS), "?");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.0 MB");
    }
}

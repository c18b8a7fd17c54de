//! User-facing log messages.
//!
//! This is the log the presentation layer shows, distinct from the developer
//! log written through `tracing`. The buffer keeps the most recent
//! [`LOG_BUFFER_CAPACITY`] entries and evicts the oldest first.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Maximum number of messages retained.
pub const LOG_BUFFER_CAPACITY: usize = 100;

/// Application-level log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Informational.
    Info,
    /// Something looked wrong but the run continues.
    Warning,
    /// A failure.
    Error,
    /// Diagnostic detail.
    Debug,
    /// A phase transition or progress milestone.
    Progress,
    /// A step completed successfully.
    Success,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Debug => write!(f, "debug"),
            Self::Progress => write!(f, "progress"),
            Self::Success => write!(f, "success"),
        }
    }
}

/// One entry of the user-facing log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Unique id.
    pub id: Uuid,
    /// Message text.
    pub text: String,
    /// Level.
    pub level: LogLevel,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
}

impl LogMessage {
    /// Create a message stamped now.
    pub fn new(level: LogLevel, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            level,
            timestamp: Utc::now(),
        }
    }

    /// Mirror this message into the developer log.
    pub fn trace(&self) {
        match self.level {
            LogLevel::Error => error!(target: "mediadrop::user_log", "{}", self.text),
            LogLevel::Warning => warn!(target: "mediadrop::user_log", "{}", self.text),
            LogLevel::Debug => debug!(target: "mediadrop::user_log", "{}", self.text),
            LogLevel::Info | LogLevel::Progress | LogLevel::Success => {
                info!(target: "mediadrop::user_log", kind = %self.level, "{}", self.text);
            }
        }
    }
}

/// Bounded, append-only message buffer.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogMessage>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    /// Create a buffer with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(LOG_BUFFER_CAPACITY)
    }

    /// Create a buffer holding at most `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a message, evicting the oldest if full.
    pub fn push(&mut self, message: LogMessage) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    /// Number of retained messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Messages oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogMessage> {
        self.entries.iter()
    }

    /// Copy of all retained messages, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogMessage> {
        self.entries.iter().cloned().collect()
    }

    /// Drop every message.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

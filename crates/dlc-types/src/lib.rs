//! Shared types for DLC
//!
//! This crate contains the plain data exchanged between the download
//! engine and its callers: what was asked for, how far it got, and why
//! it stopped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Identity of a submitted task
pub type TaskId = Uuid;

// ============================================================================
// Request Types
// ============================================================================

/// Byte range of a remote resource. `-1` means "unknown, discover via probe".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub offset: i64,
    pub size: i64,
}

impl Range {
    /// Range whose extent is discovered with a size probe
    pub const UNKNOWN: Range = Range {
        offset: -1,
        size: -1,
    };

    pub fn new(offset: i64, size: i64) -> Self {
        Self { offset, size }
    }

    /// Both offset and size are known, so chunks can be generated without a probe
    pub fn is_known(&self) -> bool {
        self.offset >= 0 && self.size >= 0
    }

    /// A known offset requires a known size
    pub fn is_valid(&self) -> bool {
        !(self.offset >= 0 && self.size < 0)
    }
}

impl Default for Range {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// Kind of download a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Truncate the destination and fetch the whole range
    Full,
    /// Keep what the destination already holds and fetch the rest
    Resume,
    /// Only ask the server for the content length
    SizeProbe,
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    JustAdded,
    Downloading,
    Finished,
}

impl TaskState {
    pub fn as_u8(self) -> u8 {
        match self {
            TaskState::JustAdded => 0,
            TaskState::Downloading => 1,
            TaskState::Finished => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::JustAdded,
            1 => TaskState::Downloading,
            _ => TaskState::Finished,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::JustAdded => "just_added",
            TaskState::Downloading => "downloading",
            TaskState::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Immutable description of a task, plus the range it resolved to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub url: String,
    /// Destination file, `None` for size probes and caller-supplied sinks
    pub dst_path: Option<PathBuf>,
    pub task_type: TaskType,
    /// Requested range; rewritten to `{0, total}` once a probe learns the size
    pub range: Range,
    pub timeout_secs: u32,
    /// Bytes go to a sink the caller owns
    pub custom_sink: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Failure of a single transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    InvalidUrl,
    Connect,
    Timeout,
    Redirect,
    Request,
    Receive,
    /// Body ended before the requested range was delivered
    PartialFile,
    /// Size probe answered without a usable Content-Length
    MissingContentLength,
    /// Baseline handle options could not be applied
    Setup,
    Other,
}

impl TransportErrorKind {
    pub fn description(self) -> &'static str {
        match self {
            TransportErrorKind::InvalidUrl => "URL using bad/illegal format",
            TransportErrorKind::Connect => "couldn't connect to server",
            TransportErrorKind::Timeout => "timeout was reached",
            TransportErrorKind::Redirect => "number of redirects hit maximum amount",
            TransportErrorKind::Request => "failed sending request",
            TransportErrorKind::Receive => "failure when receiving data from the peer",
            TransportErrorKind::PartialFile => "transferred a partial file",
            TransportErrorKind::MissingContentLength => "server did not report content length",
            TransportErrorKind::Setup => "failed to apply handle options",
            TransportErrorKind::Other => "unknown transport error",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Failure of the multiplexer itself rather than one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiErrorKind {
    /// Handle is already attached to the multiplexer
    AlreadyAdded,
    /// Handle is unknown to the transport
    BadHandle,
    /// The I/O runtime is gone
    RuntimeUnavailable,
}

impl MultiErrorKind {
    pub fn description(self) -> &'static str {
        match self {
            MultiErrorKind::AlreadyAdded => "the easy handle is already added to a multi handle",
            MultiErrorKind::BadHandle => "invalid easy handle",
            MultiErrorKind::RuntimeUnavailable => "transport runtime unavailable",
        }
    }
}

impl fmt::Display for MultiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// One observed failure, before it is folded into a [`TaskError`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCause {
    Transport(TransportErrorKind),
    Multi(MultiErrorKind),
    Http(u16),
    /// Write or seek failure; `errno` is 0 when the OS reported none (short write)
    Os { errno: i32, message: String },
    /// The downloader shut down before the task finished
    Cancelled,
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCause::Transport(kind) => write!(f, "{}", kind),
            ErrorCause::Multi(kind) => write!(f, "{}", kind),
            ErrorCause::Http(_) => f.write_str("bad http result code"),
            ErrorCause::Os { message, .. } => f.write_str(message),
            ErrorCause::Cancelled => f.write_str("download cancelled"),
        }
    }
}

/// Accumulated error state of a task
///
/// Each category keeps the first value it saw. The message and source line
/// belong to the very first error recorded, whatever its category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub error_happened: bool,
    /// Last HTTP code seen, frozen once an HTTP error was recorded
    pub http_code: u16,
    pub transport: Option<TransportErrorKind>,
    pub multi: Option<MultiErrorKind>,
    pub os_errno: Option<i32>,
    pub message: String,
    pub source_line: u32,
}

impl TaskError {
    /// Fold `cause` in. Returns true if this was the first error of the task.
    pub fn record(&mut self, cause: ErrorCause, line: u32) -> bool {
        let first = !self.error_happened;
        self.error_happened = true;

        let message = cause.to_string();
        match cause {
            ErrorCause::Transport(kind) => {
                self.transport.get_or_insert(kind);
            }
            ErrorCause::Multi(kind) => {
                self.multi.get_or_insert(kind);
            }
            ErrorCause::Http(code) => {
                if !self.is_http_error() {
                    self.http_code = code;
                }
            }
            ErrorCause::Os { errno, .. } => {
                self.os_errno.get_or_insert(errno);
            }
            ErrorCause::Cancelled => {}
        }

        if first {
            self.message = message;
            self.source_line = line;
        }
        first
    }

    /// Remember the response code of a finished transfer
    pub fn observe_http_code(&mut self, code: u16) {
        if !self.is_http_error() {
            self.http_code = code;
        }
    }

    pub fn is_http_error(&self) -> bool {
        self.http_code >= 400
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "err_happened: {} http_code: {} transport_err: {} multi_err: {} errno: {} err_str: {} source_line: {}",
            self.error_happened,
            self.http_code,
            self.transport.map(|k| k.description()).unwrap_or("none"),
            self.multi.map(|k| k.description()).unwrap_or("none"),
            self.os_errno.unwrap_or(0),
            self.message,
            self.source_line
        )
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// Snapshot of a task's progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    pub error: TaskError,
    pub size_total: u64,
    pub size_downloaded: u64,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        self.state == TaskState::Finished
    }

    /// Finished without any recorded error
    pub fn is_success(&self) -> bool {
        self.is_finished() && !self.error.error_happened
    }

    pub fn progress(&self) -> f64 {
        if self.size_total > 0 {
            (self.size_downloaded as f64 / self.size_total as f64) * 100.0
        } else {
            0.0
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task status: {} downloaded: {} total_size: {} error: {}",
            self.state, self.size_downloaded, self.size_total, self.error
        )
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Tuning knobs of the downloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hints {
    /// Upper bound on concurrently open transport handles
    pub max_handles: usize,
    /// Size of one chunk request in bytes
    pub chunk_size: usize,
    /// Connect / response / idle timeout of a single request, 0 for no limit
    pub timeout_secs: u32,
}

impl Hints {
    pub const DEFAULT_MAX_HANDLES: usize = 8;
    pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;
    pub const DEFAULT_TIMEOUT_SECS: u32 = 30;

    /// Reason these hints cannot be used, if any
    pub fn invalid_reason(&self) -> Option<&'static str> {
        if self.max_handles == 0 {
            Some("max_handles must be greater than zero")
        } else if self.chunk_size == 0 {
            Some("chunk_size must be greater than zero")
        } else {
            None
        }
    }
}

impl Default for Hints {
    fn default() -> Self {
        Self {
            max_handles: Self::DEFAULT_MAX_HANDLES,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_validity() {
        assert!(Range::UNKNOWN.is_valid());
        assert!(!Range::UNKNOWN.is_known());
        assert!(Range::new(0, 100).is_known());
        assert!(!Range::new(10, -1).is_valid());
        assert!(Range::new(-1, 10).is_valid());
        assert!(!Range::new(-1, 10).is_known());
    }

    #[test]
    fn test_first_error_wins() {
        let mut error = TaskError::default();
        assert!(error.record(ErrorCause::Http(404), 10));
        assert!(!error.record(ErrorCause::Transport(TransportErrorKind::Timeout), 20));
        assert!(!error.record(ErrorCause::Transport(TransportErrorKind::Connect), 30));
        assert!(!error.record(ErrorCause::Http(500), 40));

        assert!(error.error_happened);
        assert_eq!(error.http_code, 404);
        assert_eq!(error.transport, Some(TransportErrorKind::Timeout));
        assert_eq!(error.message, "bad http result code");
        assert_eq!(error.source_line, 10);
    }

    #[test]
    fn test_http_code_frozen_after_error() {
        let mut error = TaskError::default();
        error.observe_http_code(206);
        assert_eq!(error.http_code, 206);
        error.record(ErrorCause::Http(404), 1);
        error.observe_http_code(206);
        assert_eq!(error.http_code, 404);
    }

    #[test]
    fn test_os_error_without_errno() {
        let mut error = TaskError::default();
        error.record(
            ErrorCause::Os {
                errno: 0,
                message: "short write".to_string(),
            },
            7,
        );
        assert_eq!(error.os_errno, Some(0));
        assert_eq!(error.message, "short write");
    }

    #[test]
    fn test_hints_validation() {
        assert_eq!(Hints::default().invalid_reason(), None);
        let hints = Hints {
            max_handles: 0,
            ..Hints::default()
        };
        assert!(hints.invalid_reason().is_some());
        let hints = Hints {
            chunk_size: 0,
            ..Hints::default()
        };
        assert!(hints.invalid_reason().is_some());
    }

    #[test]
    fn test_hints_serde_defaults() {
        let hints: Hints = serde_json::from_str(r#"{"max_handles": 2}"#).unwrap();
        assert_eq!(hints.max_handles, 2);
        assert_eq!(hints.chunk_size, Hints::DEFAULT_CHUNK_SIZE);
        assert_eq!(hints.timeout_secs, Hints::DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_state_round_trip_through_u8() {
        for state in [TaskState::JustAdded, TaskState::Downloading, TaskState::Finished] {
            assert_eq!(TaskState::from_u8(state.as_u8()), state);
        }
    }
}

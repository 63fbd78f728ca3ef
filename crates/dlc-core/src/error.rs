//! Error types for DLC core

use thiserror::Error;

/// Errors returned by the downloader facade
///
/// Failures of an individual download are not reported here; they are
/// recorded into the task's `TaskStatus::error`.
#[derive(Debug, Error)]
pub enum DlcError {
    #[error("Source URL is empty")]
    EmptyUrl,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("A destination path or sink is required")]
    MissingDestination,

    #[error("Invalid range: offset {offset} with size {size}")]
    InvalidRange { offset: i64, size: i64 },

    #[error("Invalid hints: {0}")]
    InvalidHints(&'static str),

    #[error("Hints can only change while no task is outstanding")]
    TasksOutstanding,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download scheduler is not running")]
    SchedulerStopped,
}

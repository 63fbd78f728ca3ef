//! DLC Core - Background chunked download engine
//!
//! This crate fetches large remote assets over HTTP. Transfers are split
//! into byte-range chunks that run in parallel over a bounded pool of
//! transport handles, and each task's chunks are written to its sink in
//! order. Full downloads, resumed downloads and content-length probes are
//! supported.
//!
//! ```no_run
//! use dlc_core::{Downloader, Range};
//!
//! let downloader = Downloader::new()?;
//! let task = downloader.start_task("https://example.com/big.bin", "/tmp/big.bin", Range::UNKNOWN)?;
//! downloader.wait_task(&task);
//! println!("{}", downloader.task_status(&task));
//! # Ok::<(), dlc_core::DlcError>(())
//! ```

mod downloader;
pub mod engine;
mod error;
pub mod sink;

pub use downloader::*;
pub use engine::{HandleOptions, Transport};
pub use error::*;
pub use sink::{shared, FileSink, MemorySink, SharedSink, Sink};

pub use dlc_types::{
    ErrorCause, Hints, MultiErrorKind, Range, TaskError, TaskId, TaskInfo, TaskState, TaskStatus,
    TaskType, TransportErrorKind,
};

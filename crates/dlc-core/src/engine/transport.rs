//! Transport seam - a multi-handle style HTTP client
//!
//! The scheduler drives transfers through this trait only. A transport
//! hands out handles, runs requests attached to them concurrently, and
//! reports each finished transfer as a [`Completion`] message.

use dlc_types::{MultiErrorKind, TransportErrorKind};
use std::fmt;
use std::time::Duration;

/// Opaque identity of one transport handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Options every handle gets before it is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleOptions {
    pub verify_tls: bool,
    pub follow_redirects: bool,
    pub tcp_keepalive: bool,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            verify_tls: false,
            follow_redirects: true,
            tcp_keepalive: true,
        }
    }
}

/// What a handle should fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// `GET` with `Range: bytes=offset-(offset+size-1)`
    Range { offset: u64, size: u64 },
    /// Headers only, to learn the content length
    Head,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: String,
    pub kind: RequestKind,
    /// Bounds the wait for the response and every idle gap in the body.
    /// Zero means no limit.
    pub timeout: Duration,
}

impl Request {
    /// Value of the `Range` header, if any
    pub fn range_header(&self) -> Option<String> {
        match self.kind {
            RequestKind::Range { offset, size } => {
                Some(format!("bytes={}-{}", offset, offset + size.saturating_sub(1)))
            }
            RequestKind::Head => None,
        }
    }
}

/// Outcome of a transfer that reached the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: Vec<u8>,
}

/// Message emitted when a transfer attached to `handle` is done
#[derive(Debug)]
pub struct Completion {
    pub handle: HandleId,
    pub result: Result<Response, TransportErrorKind>,
}

/// Multi-handle HTTP client driven from a single thread
pub trait Transport: Send {
    /// Create a fresh handle
    fn create_handle(&mut self) -> HandleId;

    /// Apply baseline options to a handle
    fn set_baseline(
        &mut self,
        handle: HandleId,
        options: &HandleOptions,
    ) -> Result<(), TransportErrorKind>;

    /// Forget everything configured on a handle so it can be reused
    fn reset_handle(&mut self, handle: HandleId);

    /// Start `request` on `handle`
    fn add(&mut self, handle: HandleId, request: Request) -> Result<(), MultiErrorKind>;

    /// Detach `handle`, aborting its transfer if it is still running
    fn remove(&mut self, handle: HandleId) -> Result<(), MultiErrorKind>;

    /// Drive I/O, waiting at most `timeout` for activity. Returns the
    /// number of transfers still running.
    fn perform(&mut self, timeout: Duration) -> Result<usize, MultiErrorKind>;

    /// Next completion message, if any
    fn next_message(&mut self) -> Option<Completion>;
}

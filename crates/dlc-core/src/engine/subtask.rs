//! Subtasks - one transport handle's worth of work for a task

use crate::engine::transport::{HandleId, Request, RequestKind, Response};
use crate::sink::{MemorySink, Sink};
use dlc_types::{ErrorCause, TransportErrorKind};
use std::time::Duration;

#[derive(Debug)]
pub enum SubTaskKind {
    /// Fetch `size` bytes starting at `offset` into a buffer of exactly that size
    Chunk {
        offset: u64,
        size: u64,
        buffer: MemorySink,
    },
    /// Ask for the content length only
    SizeProbe,
}

#[derive(Debug)]
pub struct SubTask {
    pub order: u64,
    pub handle: Option<HandleId>,
    pub kind: SubTaskKind,
}

/// What a finished transfer means for its task
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub http_code: Option<u16>,
    pub failure: Option<ErrorCause>,
    /// Reported total size, size probes only
    pub content_length: Option<u64>,
}

impl SubTask {
    pub fn chunk(order: u64, offset: u64, size: u64) -> Self {
        Self {
            order,
            handle: None,
            kind: SubTaskKind::Chunk {
                offset,
                size,
                buffer: MemorySink::bounded(size as usize),
            },
        }
    }

    pub fn size_probe(order: u64) -> Self {
        Self {
            order,
            handle: None,
            kind: SubTaskKind::SizeProbe,
        }
    }

    pub fn is_probe(&self) -> bool {
        matches!(self.kind, SubTaskKind::SizeProbe)
    }

    /// Range size of a chunk, 0 for a probe
    pub fn size(&self) -> u64 {
        match self.kind {
            SubTaskKind::Chunk { size, .. } => size,
            SubTaskKind::SizeProbe => 0,
        }
    }

    pub fn request(&self, url: &str, timeout: Duration) -> Request {
        let kind = match self.kind {
            SubTaskKind::Chunk { offset, size, .. } => RequestKind::Range { offset, size },
            SubTaskKind::SizeProbe => RequestKind::Head,
        };
        Request {
            url: url.to_string(),
            kind,
            timeout,
        }
    }

    /// Downloaded bytes of a finished chunk, empty for a probe
    pub fn bytes(&self) -> &[u8] {
        match &self.kind {
            SubTaskKind::Chunk { buffer, .. } => buffer.bytes(),
            SubTaskKind::SizeProbe => &[],
        }
    }

    /// Interpret the result of this subtask's transfer
    pub fn on_done(&mut self, result: Result<Response, TransportErrorKind>) -> Outcome {
        let response = match result {
            Ok(response) => response,
            Err(kind) => {
                return Outcome {
                    failure: Some(ErrorCause::Transport(kind)),
                    ..Outcome::default()
                }
            }
        };

        let mut outcome = Outcome {
            http_code: Some(response.status),
            ..Outcome::default()
        };
        if response.status >= 400 {
            outcome.failure = Some(ErrorCause::Http(response.status));
            return outcome;
        }

        match &mut self.kind {
            SubTaskKind::SizeProbe => match response.content_length {
                Some(length) => outcome.content_length = Some(length),
                None => {
                    outcome.failure = Some(ErrorCause::Transport(
                        TransportErrorKind::MissingContentLength,
                    ))
                }
            },
            SubTaskKind::Chunk { size, buffer, .. } => {
                let saved = match buffer.save(&response.body) {
                    Ok(saved) => saved,
                    Err(e) => {
                        outcome.failure = Some(ErrorCause::Os {
                            errno: e.raw_os_error().unwrap_or(0),
                            message: e.to_string(),
                        });
                        return outcome;
                    }
                };

                if saved < response.body.len() {
                    outcome.failure = Some(ErrorCause::Os {
                        errno: 0,
                        message: format!(
                            "chunk buffer overflow: received more than {} bytes",
                            size
                        ),
                    });
                } else if (buffer.len() as u64) < *size {
                    outcome.failure = Some(ErrorCause::Transport(TransportErrorKind::PartialFile));
                }
            }
        }

        outcome
    }
}

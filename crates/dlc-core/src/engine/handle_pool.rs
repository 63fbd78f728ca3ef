//! Handle pool - bounded, recycled transport handles
//!
//! The pool owns the transport. Every subtask in flight holds exactly one
//! handle, and the pool remembers which subtask a handle belongs to so a
//! completion message can be routed back to its task.

use crate::engine::transport::{Completion, HandleId, HandleOptions, Request, Transport};
use dlc_types::{ErrorCause, Hints, MultiErrorKind, TaskId};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Identifies the subtask a handle is working for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubTaskKey {
    pub task: TaskId,
    pub order: u64,
}

pub struct HandlePool {
    transport: Box<dyn Transport>,
    max_handles: usize,
    chunk_size: u64,
    options: HandleOptions,
    free: Vec<HandleId>,
    in_use: usize,
    mapping: HashMap<HandleId, SubTaskKey>,
    created: usize,
}

impl HandlePool {
    pub fn new(transport: Box<dyn Transport>, hints: &Hints) -> Self {
        Self::with_options(transport, hints, HandleOptions::default())
    }

    pub fn with_options(
        transport: Box<dyn Transport>,
        hints: &Hints,
        options: HandleOptions,
    ) -> Self {
        Self {
            transport,
            max_handles: hints.max_handles,
            chunk_size: hints.chunk_size as u64,
            options,
            free: Vec::new(),
            in_use: 0,
            mapping: HashMap::new(),
            created: 0,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn max_handles(&self) -> usize {
        self.max_handles
    }

    /// Handles that can still be handed out
    pub fn free_handle_count(&self) -> usize {
        if self.in_use > self.max_handles {
            error!(
                "Handle pool over capacity: in use {} max {}",
                self.in_use, self.max_handles
            );
            panic!("handle pool invariant violated: more handles in use than allowed");
        }
        self.max_handles - self.in_use
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Number of transport handles ever created by this pool
    pub fn created_handles(&self) -> usize {
        self.created
    }

    /// Take a handle for `key` and start `request` on it
    pub fn acquire(&mut self, key: SubTaskKey, request: Request) -> Result<HandleId, ErrorCause> {
        if self.free_handle_count() == 0 {
            error!("No free handle for task {} subtask {}", key.task, key.order);
            panic!("handle pool exhausted: caller must check free_handle_count first");
        }

        let handle = match self.free.pop() {
            Some(handle) => handle,
            None => {
                self.created += 1;
                self.transport.create_handle()
            }
        };

        if let Err(kind) = self.transport.set_baseline(handle, &self.options) {
            warn!("Failed to apply baseline options on {}: {}", handle, kind);
            self.transport.reset_handle(handle);
            self.free.push(handle);
            return Err(ErrorCause::Transport(kind));
        }

        self.in_use += 1;
        if let Some(previous) = self.mapping.insert(handle, key) {
            error!(
                "{} already mapped to task {} subtask {}",
                handle, previous.task, previous.order
            );
            panic!("handle pool invariant violated: handle mapped twice");
        }

        if let Err(kind) = self.transport.add(handle, request) {
            warn!("Failed to attach {} to the transport: {}", handle, kind);
            self.release(handle);
            return Err(ErrorCause::Multi(kind));
        }

        debug!(
            "Acquired {} for task {} subtask {} (free: {})",
            handle,
            key.task,
            key.order,
            self.max_handles - self.in_use
        );
        Ok(handle)
    }

    /// Detach and recycle `handle`, returning the subtask it served
    pub fn release(&mut self, handle: HandleId) -> Option<SubTaskKey> {
        let key = self.mapping.remove(&handle);

        if let Err(kind) = self.transport.remove(handle) {
            debug!("Removing {} from the transport failed: {}", handle, kind);
        }
        self.transport.reset_handle(handle);

        if self.in_use == 0 {
            error!("Released {} with no handles in use", handle);
            panic!("handle pool invariant violated: released more handles than acquired");
        }
        self.in_use -= 1;
        self.free.push(handle);
        key
    }

    /// Subtask served by `handle`; an unknown handle is a fatal error
    pub fn lookup(&self, handle: HandleId) -> SubTaskKey {
        match self.mapping.get(&handle) {
            Some(key) => *key,
            None => {
                error!("Completion for unmapped {}", handle);
                panic!("handle pool invariant violated: no subtask for handle");
            }
        }
    }

    /// Run one I/O step. Returns the number of transfers still running.
    pub fn perform(&mut self, timeout: Duration) -> Result<usize, MultiErrorKind> {
        self.transport.perform(timeout)
    }

    pub fn next_completion(&mut self) -> Option<Completion> {
        self.transport.next_message()
    }

    /// Handles currently attached to a subtask
    pub fn mapped_handles(&self) -> Vec<HandleId> {
        self.mapping.keys().copied().collect()
    }

    /// Release every attached handle
    pub fn release_all(&mut self) {
        for handle in self.mapped_handles() {
            self.release(handle);
        }
    }
}

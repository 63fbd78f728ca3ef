//! Task - one logical download and its subtasks
//!
//! A task is owned by the scheduler thread once it is queued. It splits
//! its remaining byte range into chunk subtasks as handles become free,
//! collects finished chunks and writes them to its sink strictly in
//! creation order. Other threads only ever see the [`TaskShared`]
//! snapshot the task publishes after each change.

use crate::engine::handle_pool::{HandlePool, SubTaskKey};
use crate::engine::subtask::SubTask;
use crate::engine::transport::Response;
use crate::sink::{FileSink, SharedSink, Sink};
use chrono::Utc;
use dlc_types::{
    ErrorCause, Range, TaskId, TaskInfo, TaskState, TaskStatus, TaskType, TransportErrorKind,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where a task's bytes go
pub enum Destination {
    Path(PathBuf),
    /// Caller-owned sink, borrowed for the task's lifetime
    Sink(SharedSink),
    /// Size probes have nowhere to write
    None,
}

enum TaskSink {
    Owned(Box<dyn Sink>),
    Shared(SharedSink),
}

impl TaskSink {
    fn with<R>(&mut self, f: impl FnOnce(&mut dyn Sink) -> R) -> R {
        match self {
            TaskSink::Owned(sink) => f(sink.as_mut()),
            TaskSink::Shared(sink) => {
                let mut guard = sink.lock();
                f(&mut *guard)
            }
        }
    }
}

/// Read side of a task, shared with caller threads
#[derive(Debug)]
pub struct TaskShared {
    id: TaskId,
    state: AtomicU8,
    info: Mutex<TaskInfo>,
    status: Mutex<TaskStatus>,
}

impl TaskShared {
    fn new(id: TaskId, info: TaskInfo) -> Self {
        Self {
            id,
            state: AtomicU8::new(TaskState::JustAdded.as_u8()),
            info: Mutex::new(info),
            status: Mutex::new(TaskStatus::default()),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    pub fn info(&self) -> TaskInfo {
        self.info.lock().clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.status.lock().clone()
    }

    fn publish(&self, info: &TaskInfo, status: &TaskStatus) {
        *self.info.lock() = info.clone();
        *self.status.lock() = status.clone();
        self.state.store(status.state.as_u8(), Ordering::Release);
    }
}

pub struct Task {
    id: TaskId,
    info: TaskInfo,
    status: TaskStatus,
    destination: Destination,
    sink: Option<TaskSink>,
    /// Bytes the sink already held when a resume started
    resume_pos: u64,
    rest_offset: u64,
    rest_size: u64,
    last_created: u64,
    last_written: u64,
    working: BTreeMap<u64, SubTask>,
    ready: BTreeMap<u64, SubTask>,
    shared: Arc<TaskShared>,
}

fn os_cause(error: &io::Error) -> ErrorCause {
    ErrorCause::Os {
        errno: error.raw_os_error().unwrap_or(0),
        message: error.to_string(),
    }
}

impl Task {
    pub fn new(id: TaskId, info: TaskInfo, destination: Destination) -> Self {
        let shared = Arc::new(TaskShared::new(id, info.clone()));
        Self {
            id,
            info,
            status: TaskStatus::default(),
            destination,
            sink: None,
            resume_pos: 0,
            rest_offset: 0,
            rest_size: 0,
            last_created: 0,
            last_written: 0,
            working: BTreeMap::new(),
            ready: BTreeMap::new(),
            shared,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    pub fn shared(&self) -> Arc<TaskShared> {
        Arc::clone(&self.shared)
    }

    pub fn is_finished(&self) -> bool {
        self.status.state == TaskState::Finished
    }

    /// No subtask is in flight or waiting to be written
    pub fn is_done(&self) -> bool {
        self.working.is_empty() && self.ready.is_empty()
    }

    /// Still has bytes to request
    pub fn needs_chunks(&self) -> bool {
        self.status.state == TaskState::Downloading
            && !self.status.error.error_happened
            && self.rest_size > 0
    }

    pub fn working_count(&self) -> usize {
        self.working.len()
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.info.timeout_secs))
    }

    fn next_order(&mut self) -> u64 {
        self.last_created += 1;
        self.last_created
    }

    /// Open the sink and create the first subtasks. Requires at least one
    /// free handle in `pool`.
    pub fn prepare(&mut self, pool: &mut HandlePool) {
        self.status.state = TaskState::Downloading;
        info!(
            "Task {} started: {:?} {} range {}+{}",
            self.id, self.info.task_type, self.info.url, self.info.range.offset, self.info.range.size
        );

        match self.info.task_type {
            TaskType::SizeProbe => self.start_probe(pool),
            TaskType::Full => self.prepare_full(pool),
            TaskType::Resume => self.prepare_resume(pool),
        }

        self.try_finish();
        self.publish();
    }

    fn prepare_full(&mut self, pool: &mut HandlePool) {
        if let Err(e) = self.open_sink(true) {
            self.fail(os_cause(&e), line!());
            return;
        }

        let range = self.info.range;
        if range.is_known() {
            self.status.size_total = range.size as u64;
            self.rest_offset = range.offset as u64;
            self.rest_size = range.size as u64;
            self.generate_chunks(pool);
        } else {
            self.start_probe(pool);
        }
    }

    fn prepare_resume(&mut self, pool: &mut HandlePool) {
        let pos = match self.open_sink(false) {
            Ok(pos) => pos,
            Err(e) => {
                self.fail(os_cause(&e), line!());
                return;
            }
        };
        self.resume_pos = pos;
        self.status.size_downloaded = pos;

        let range = self.info.range;
        if range.is_known() {
            self.resume_from(range.offset as u64, range.size as u64, pool);
        } else {
            self.start_probe(pool);
        }
    }

    fn resume_from(&mut self, offset: u64, size: u64, pool: &mut HandlePool) {
        self.status.size_total = size;

        match size.checked_sub(self.resume_pos) {
            Some(rest) if rest > 0 => {
                self.rest_offset = offset + self.resume_pos;
                self.rest_size = rest;
                info!(
                    "Task {} resuming at {} with {} bytes left",
                    self.id, self.resume_pos, rest
                );
                self.generate_chunks(pool);
            }
            remaining => {
                if remaining.is_none() {
                    warn!(
                        "Task {}: destination holds {} bytes, more than the {} byte range",
                        self.id, self.resume_pos, size
                    );
                }
                // Trusts the existing bytes without checking them
                self.status.size_downloaded = size;
                self.rest_size = 0;
            }
        }
    }

    /// Open the sink, truncating it for a full download. Returns its current size.
    fn open_sink(&mut self, truncate: bool) -> io::Result<u64> {
        let mut sink = match &self.destination {
            Destination::Path(path) => {
                let mut file = FileSink::create(path)?;
                if !truncate {
                    file.move_to_end()?;
                }
                TaskSink::Owned(Box::new(file))
            }
            Destination::Sink(shared) => TaskSink::Shared(Arc::clone(shared)),
            Destination::None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "task has no destination",
                ))
            }
        };

        let pos = sink.with(|s| {
            if truncate {
                s.truncate()?;
            }
            s.seek_pos()
        })?;
        self.sink = Some(sink);
        Ok(pos)
    }

    fn start_probe(&mut self, pool: &mut HandlePool) {
        let order = self.next_order();
        self.start_subtask(SubTask::size_probe(order), pool);
    }

    fn start_subtask(&mut self, mut subtask: SubTask, pool: &mut HandlePool) -> bool {
        let key = SubTaskKey {
            task: self.id,
            order: subtask.order,
        };
        let request = subtask.request(&self.info.url, self.timeout());

        match pool.acquire(key, request) {
            Ok(handle) => {
                debug!(
                    "Task {} subtask {} on {} ({} bytes)",
                    self.id,
                    subtask.order,
                    handle,
                    subtask.size()
                );
                subtask.handle = Some(handle);
                self.working.insert(subtask.order, subtask);
                true
            }
            Err(cause) => {
                self.fail(cause, line!());
                false
            }
        }
    }

    /// Cut chunks off the remaining range while handles are free
    pub fn generate_chunks(&mut self, pool: &mut HandlePool) {
        while self.needs_chunks() && pool.free_handle_count() > 0 {
            let size = self.rest_size.min(pool.chunk_size());
            let order = self.next_order();
            if !self.start_subtask(SubTask::chunk(order, self.rest_offset, size), pool) {
                break;
            }
            self.rest_offset += size;
            self.rest_size -= size;
        }
    }

    /// Handle the finished transfer of subtask `order`. Its handle must
    /// already be back in `pool`.
    pub fn on_subtask_done(
        &mut self,
        order: u64,
        result: Result<Response, TransportErrorKind>,
        pool: &mut HandlePool,
    ) {
        let Some(mut subtask) = self.working.remove(&order) else {
            error!("Task {} has no subtask {} in flight", self.id, order);
            panic!("task invariant violated: completion for unknown subtask");
        };
        subtask.handle = None;

        let outcome = subtask.on_done(result);
        debug!(
            "Task {} subtask {} done: http {:?} failure {:?}",
            self.id, order, outcome.http_code, outcome.failure
        );

        if let Some(code) = outcome.http_code {
            self.status.error.observe_http_code(code);
        }

        match outcome.failure {
            Some(ErrorCause::Transport(TransportErrorKind::PartialFile))
                if self.status.size_downloaded == self.status.size_total =>
            {
                debug!("Task {}: partial transfer after full range, ignored", self.id);
            }
            Some(cause) => self.fail(cause, line!()),
            None => {
                if let Some(total) = outcome.content_length {
                    self.apply_content_length(total, pool);
                }
            }
        }

        self.ready.insert(order, subtask);
        self.flush();
        self.try_finish();
        self.publish();
    }

    fn apply_content_length(&mut self, total: u64, pool: &mut HandlePool) {
        info!("Task {}: content length {}", self.id, total);
        self.status.size_total = total;

        match self.info.task_type {
            TaskType::SizeProbe => {}
            TaskType::Full => {
                self.info.range = Range::new(0, total as i64);
                self.rest_offset = 0;
                self.rest_size = total;
                self.generate_chunks(pool);
            }
            TaskType::Resume => {
                self.info.range = Range::new(0, total as i64);
                self.resume_from(0, total, pool);
            }
        }
    }

    /// Write the contiguous run of ready chunks that follows the last write
    fn flush(&mut self) {
        loop {
            if self.status.error.error_happened {
                self.discard_ready();
                return;
            }

            let Some(entry) = self.ready.first_entry() else {
                return;
            };
            if *entry.key() != self.last_written + 1 {
                return;
            }

            let subtask = entry.remove();
            self.last_written = subtask.order;
            if !subtask.is_probe() {
                self.write_chunk(&subtask);
            }
        }
    }

    fn discard_ready(&mut self) {
        if let Some(last) = self.ready.keys().next_back() {
            self.last_written = self.last_written.max(*last);
            debug!("Task {}: discarding {} unwritten chunks", self.id, self.ready.len());
        }
        self.ready.clear();
    }

    fn write_chunk(&mut self, subtask: &SubTask) {
        let data = subtask.bytes();
        let Some(sink) = self.sink.as_mut() else {
            self.fail(
                ErrorCause::Os {
                    errno: 0,
                    message: "sink is not open".to_string(),
                },
                line!(),
            );
            return;
        };

        let result = sink.with(|s| {
            if s.is_closed() {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink is closed"))
            } else {
                s.save(data)
            }
        });

        match result {
            Ok(written) if written == data.len() => {
                self.status.size_downloaded += written as u64;
            }
            Ok(written) => {
                // The accepted prefix is in the sink and counts as downloaded
                self.status.size_downloaded += written as u64;
                self.fail(
                    ErrorCause::Os {
                        errno: 0,
                        message: format!("short write: {} of {} bytes", written, data.len()),
                    },
                    line!(),
                );
            }
            Err(e) => self.fail(os_cause(&e), line!()),
        }
    }

    /// Record an error, close the sink and finish the task
    fn fail(&mut self, cause: ErrorCause, line: u32) {
        let message = cause.to_string();
        if self.status.error.record(cause, line) {
            warn!("Task {} failed: {} ({})", self.id, message, self.info.url);
        } else {
            warn!("Task {} additional error: {}", self.id, message);
        }

        if let Some(mut sink) = self.sink.take() {
            sink.with(|s| s.close());
        }

        if self.status.state != TaskState::Finished {
            self.status.state = TaskState::Finished;
            self.status.finished_at = Some(Utc::now());
        }
    }

    fn try_finish(&mut self) {
        if self.status.state != TaskState::Downloading || self.rest_size > 0 || !self.is_done() {
            return;
        }

        self.status.state = TaskState::Finished;
        self.status.finished_at = Some(Utc::now());
        // A shared sink stays open for its owner
        if let Some(TaskSink::Owned(mut sink)) = self.sink.take() {
            sink.close();
        }

        info!(
            "Task {} finished: {} of {} bytes",
            self.id, self.status.size_downloaded, self.status.size_total
        );
    }

    /// Fail the task from outside its own transfers and return its handles
    pub fn fail_with(&mut self, cause: ErrorCause, pool: &mut HandlePool) {
        self.fail(cause, line!());
        self.abort(pool);
        self.publish();
    }

    /// Finish the task as cancelled. Unlike a failure, a caller-owned sink
    /// is left open.
    pub fn cancel(&mut self, pool: &mut HandlePool) {
        if self.status.error.record(ErrorCause::Cancelled, line!()) {
            info!("Task {} cancelled", self.id);
        }
        if self.status.state != TaskState::Finished {
            self.status.state = TaskState::Finished;
            self.status.finished_at = Some(Utc::now());
        }
        self.abort(pool);
        self.publish();
    }

    /// Drop all subtasks, returning their handles, and let go of the sink
    pub fn abort(&mut self, pool: &mut HandlePool) {
        for subtask in self.working.values_mut() {
            if let Some(handle) = subtask.handle.take() {
                pool.release(handle);
            }
        }
        self.working.clear();
        self.ready.clear();

        if let Some(TaskSink::Owned(mut sink)) = self.sink.take() {
            sink.close();
        }
    }

    pub fn publish(&self) {
        self.shared.publish(&self.info, &self.status);
    }
}

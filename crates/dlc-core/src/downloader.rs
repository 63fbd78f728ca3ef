//! Downloader facade
//!
//! The thread-safe entry point. Every call validates its input, builds
//! or looks up a task and hands it to the scheduler thread through the
//! shared queues. Only [`Downloader::wait_task`] blocks.

use crate::engine::{
    Destination, HandleOptions, HandlePool, Queues, ReqwestTransport, Scheduler, Semaphore, Task,
    TaskShared, Transport, Waiter,
};
use crate::error::DlcError;
use crate::sink::SharedSink;
use chrono::Utc;
use dlc_types::{Hints, Range, TaskId, TaskInfo, TaskState, TaskStatus, TaskType};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

/// Builds the transport for a given set of hints
pub type TransportFactory =
    Arc<dyn Fn(&Hints) -> Result<Box<dyn Transport>, DlcError> + Send + Sync>;

/// Caller's reference to a submitted task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.shared.id()
    }

    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }
}

/// A running scheduler thread and the queues that feed it
struct Engine {
    hints: Hints,
    queues: Arc<Queues>,
    thread: Option<JoinHandle<IndexMap<TaskId, Task>>>,
}

impl Engine {
    fn start(hints: Hints, pool: HandlePool, tasks: IndexMap<TaskId, Task>) -> Result<Self, DlcError> {
        let queues = Arc::new(Queues::new());
        let thread = Scheduler::new(Arc::clone(&queues), pool)
            .with_tasks(tasks)
            .spawn()?;

        Ok(Self {
            hints,
            queues,
            thread: Some(thread),
        })
    }

    /// Stop the scheduler and collect the tasks it still held
    fn stop(&mut self) -> IndexMap<TaskId, Task> {
        self.queues.cancel();
        let Some(thread) = self.thread.take() else {
            return IndexMap::new();
        };

        match thread.join() {
            Ok(tasks) => tasks,
            Err(_) => {
                error!("Download scheduler thread panicked");
                IndexMap::new()
            }
        }
    }
}

/// Background chunked HTTP downloader
pub struct Downloader {
    engine: RwLock<Engine>,
    factory: TransportFactory,
    options: HandleOptions,
    /// Tasks handed out and not yet removed
    registry: Mutex<HashMap<TaskId, Arc<TaskShared>>>,
}

impl Downloader {
    /// Downloader with default hints over HTTP
    pub fn new() -> Result<Self, DlcError> {
        Self::with_hints(Hints::default())
    }

    pub fn with_hints(hints: Hints) -> Result<Self, DlcError> {
        Self::with_options(hints, HandleOptions::default())
    }

    /// Downloader over HTTP with explicit baseline handle options
    pub fn with_options(hints: Hints, options: HandleOptions) -> Result<Self, DlcError> {
        let factory: TransportFactory = Arc::new(|_hints: &Hints| {
            let transport: Box<dyn Transport> = Box::new(ReqwestTransport::new()?);
            Ok(transport)
        });
        Self::build(hints, options, factory)
    }

    /// Downloader over a caller-provided transport
    pub fn with_transport(hints: Hints, factory: TransportFactory) -> Result<Self, DlcError> {
        Self::build(hints, HandleOptions::default(), factory)
    }

    fn build(
        hints: Hints,
        options: HandleOptions,
        factory: TransportFactory,
    ) -> Result<Self, DlcError> {
        if let Some(reason) = hints.invalid_reason() {
            return Err(DlcError::InvalidHints(reason));
        }

        let transport = factory(&hints)?;
        let pool = HandlePool::with_options(transport, &hints, options);
        let engine = Engine::start(hints, pool, IndexMap::new())?;

        Ok(Self {
            engine: RwLock::new(engine),
            factory,
            options,
            registry: Mutex::new(HashMap::new()),
        })
    }

    // ========================================================================
    // Task submission
    // ========================================================================

    /// Download `range` of `url` into `dst_path`, replacing its contents
    pub fn start_task(
        &self,
        url: &str,
        dst_path: impl AsRef<Path>,
        range: Range,
    ) -> Result<TaskHandle, DlcError> {
        let path = destination_path(dst_path.as_ref())?;
        self.submit(url, TaskType::Full, range, Destination::Path(path))
    }

    /// Download `range` of `url` into a sink the caller keeps owning
    pub fn start_task_with_sink(
        &self,
        url: &str,
        sink: SharedSink,
        range: Range,
    ) -> Result<TaskHandle, DlcError> {
        self.submit(url, TaskType::Full, range, Destination::Sink(sink))
    }

    /// Continue a download into `dst_path`, keeping the bytes already there
    pub fn resume_task(
        &self,
        url: &str,
        dst_path: impl AsRef<Path>,
        range: Range,
    ) -> Result<TaskHandle, DlcError> {
        let path = destination_path(dst_path.as_ref())?;
        self.submit(url, TaskType::Resume, range, Destination::Path(path))
    }

    pub fn resume_task_with_sink(
        &self,
        url: &str,
        sink: SharedSink,
        range: Range,
    ) -> Result<TaskHandle, DlcError> {
        self.submit(url, TaskType::Resume, range, Destination::Sink(sink))
    }

    /// Ask the server for the content length of `url`
    pub fn start_get_content_size(&self, url: &str) -> Result<TaskHandle, DlcError> {
        self.submit(url, TaskType::SizeProbe, Range::UNKNOWN, Destination::None)
    }

    fn submit(
        &self,
        url: &str,
        task_type: TaskType,
        range: Range,
        destination: Destination,
    ) -> Result<TaskHandle, DlcError> {
        validate_url(url)?;
        if !range.is_valid() {
            return Err(DlcError::InvalidRange {
                offset: range.offset,
                size: range.size,
            });
        }

        let engine = self.engine.read();
        if engine.queues.is_cancelled() {
            return Err(DlcError::SchedulerStopped);
        }

        let info = TaskInfo {
            url: url.to_string(),
            dst_path: match &destination {
                Destination::Path(path) => Some(path.clone()),
                _ => None,
            },
            task_type,
            range,
            timeout_secs: engine.hints.timeout_secs,
            custom_sink: matches!(destination, Destination::Sink(_)),
            created_at: Utc::now(),
        };
        let task = Task::new(Uuid::new_v4(), info, destination);
        let shared = task.shared();
        let id = task.id();

        self.registry.lock().insert(id, Arc::clone(&shared));
        engine.queues.input.lock().push_back(task);
        engine.queues.wake();

        info!("Task {} queued: {:?} {}", id, task_type, url);
        Ok(TaskHandle { shared })
    }

    // ========================================================================
    // Task control
    // ========================================================================

    /// Forget a task. In-flight transfers are dropped on the scheduler thread.
    pub fn remove_task(&self, task: &TaskHandle) {
        let id = task.id();
        let engine = self.engine.read();

        if task.state() == TaskState::JustAdded {
            engine.queues.input.lock().retain(|queued| queued.id() != id);
        }
        engine.queues.removal.lock().push(id);
        engine.queues.wake();

        self.registry.lock().remove(&id);
        debug!("Task {} marked for removal", id);
    }

    /// Block until the task finishes or is removed
    pub fn wait_task(&self, task: &TaskHandle) {
        if task.is_finished() {
            return;
        }

        let signal = Arc::new(Semaphore::new());
        {
            let engine = self.engine.read();
            engine.queues.waiting.lock().push(Waiter {
                id: task.id(),
                signal: Arc::clone(&signal),
            });
            engine.queues.wake();
        }
        signal.wait();
    }

    pub fn task_info(&self, task: &TaskHandle) -> TaskInfo {
        task.shared.info()
    }

    pub fn task_status(&self, task: &TaskHandle) -> TaskStatus {
        task.shared.status()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn hints(&self) -> Hints {
        self.engine.read().hints
    }

    /// Apply new hints.
    ///
    /// A change to `timeout_secs` alone is accepted at any time, even with
    /// tasks queued or running. It applies to tasks submitted afterwards;
    /// tasks already submitted keep the timeout they were created with.
    ///
    /// Changing the handle count or chunk size rebuilds the transport, which
    /// is only allowed while every submitted task has finished or been
    /// removed. Otherwise [`DlcError::TasksOutstanding`] is returned.
    pub fn set_hints(&self, hints: Hints) -> Result<(), DlcError> {
        if let Some(reason) = hints.invalid_reason() {
            return Err(DlcError::InvalidHints(reason));
        }

        let mut engine = self.engine.write();
        if engine.hints == hints {
            return Ok(());
        }
        // The timeout is read per task at submission, nothing to rebuild
        if engine.hints.max_handles == hints.max_handles && engine.hints.chunk_size == hints.chunk_size {
            engine.hints.timeout_secs = hints.timeout_secs;
            return Ok(());
        }

        let outstanding = !engine.queues.input.lock().is_empty()
            || self
                .registry
                .lock()
                .values()
                .any(|shared| !shared.is_finished());
        if outstanding {
            return Err(DlcError::TasksOutstanding);
        }

        let transport = (self.factory)(&hints)?;
        let pool = HandlePool::with_options(transport, &hints, self.options);
        let tasks = engine.stop();
        *engine = Engine::start(hints, pool, tasks)?;

        info!(
            "Hints changed: {} handles, {} byte chunks, {}s timeout",
            hints.max_handles, hints.chunk_size, hints.timeout_secs
        );
        Ok(())
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        let tasks = self.engine.get_mut().stop();
        debug!("Downloader dropped with {} finished tasks", tasks.len());
    }
}

fn validate_url(url: &str) -> Result<(), DlcError> {
    if url.is_empty() {
        return Err(DlcError::EmptyUrl);
    }
    Url::parse(url).map_err(|e| DlcError::InvalidUrl(format!("{}: {}", url, e)))?;
    Ok(())
}

fn destination_path(path: &Path) -> Result<PathBuf, DlcError> {
    if path.as_os_str().is_empty() {
        return Err(DlcError::MissingDestination);
    }
    Ok(path.to_path_buf())
}

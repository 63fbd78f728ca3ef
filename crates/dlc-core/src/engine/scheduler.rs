//! Scheduler - the background download loop
//!
//! One thread owns the handle pool and every started task. Callers talk
//! to it only through [`Queues`]: new tasks, removals and waiters are
//! pushed under a lock and the wake semaphore is posted.

use crate::engine::handle_pool::HandlePool;
use crate::engine::semaphore::Semaphore;
use crate::engine::task::Task;
use dlc_types::{ErrorCause, TaskId};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Longest single wait inside the transport
const PERFORM_TIMEOUT: Duration = Duration::from_millis(1000);

/// A caller blocked until a task finishes
pub struct Waiter {
    pub id: TaskId,
    pub signal: Arc<Semaphore>,
}

/// Everything caller threads share with the scheduler thread
#[derive(Default)]
pub struct Queues {
    pub input: Mutex<VecDeque<Task>>,
    pub removal: Mutex<Vec<TaskId>>,
    pub waiting: Mutex<Vec<Waiter>>,
    pub wake: Semaphore,
    cancel: AtomicBool,
}

impl Queues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.wake.post(1);
    }

    /// Ask the loop to stop and make sure it is not left sleeping
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

pub struct Scheduler {
    queues: Arc<Queues>,
    pool: HandlePool,
    tasks: IndexMap<TaskId, Task>,
}

impl Scheduler {
    pub fn new(queues: Arc<Queues>, pool: HandlePool) -> Self {
        Self {
            queues,
            pool,
            tasks: IndexMap::new(),
        }
    }

    /// Carry over tasks from a previous scheduler
    pub fn with_tasks(mut self, tasks: IndexMap<TaskId, Task>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Run the loop on its own thread. The thread yields the finished
    /// tasks when it stops.
    pub fn spawn(self) -> io::Result<JoinHandle<IndexMap<TaskId, Task>>> {
        thread::Builder::new()
            .name("dlc-scheduler".to_string())
            .spawn(move || self.run())
    }

    pub fn run(mut self) -> IndexMap<TaskId, Task> {
        info!(
            "Download scheduler started (handles: {}, chunk size: {})",
            self.pool.max_handles(),
            self.pool.chunk_size()
        );

        while !self.queues.is_cancelled() {
            self.signal_waiters();
            self.process_removals();
            self.take_input();
            self.balance();

            if self.pool.in_use() == 0 {
                // Tasks taken this round may have finished without a transfer
                if self.has_ready_waiters() {
                    continue;
                }
                // Nothing in flight: sleep until a caller posts
                self.queues.wake.wait();
                continue;
            }

            self.perform_until_break();
        }

        self.teardown()
    }

    /// Drive transfers until the loop has other work to look at
    fn perform_until_break(&mut self) {
        loop {
            if self.queues.is_cancelled() {
                return;
            }

            if let Err(kind) = self.pool.perform(PERFORM_TIMEOUT) {
                error!("Transport step failed: {}", kind);
                self.fail_in_flight(ErrorCause::Multi(kind));
                return;
            }
            self.dispatch_completions();
            self.balance();

            if self.pool.in_use() == 0 {
                return;
            }
            if !self.queues.removal.lock().is_empty() || self.has_ready_waiters() {
                return;
            }
            if self.pool.free_handle_count() > 0 && !self.queues.input.lock().is_empty() {
                return;
            }
        }
    }

    fn dispatch_completions(&mut self) {
        while let Some(completion) = self.pool.next_completion() {
            let key = self.pool.lookup(completion.handle);
            self.pool.release(completion.handle);

            let Some(task) = self.tasks.get_mut(&key.task) else {
                error!(
                    "Completion on {} for unknown task {}",
                    completion.handle, key.task
                );
                panic!("scheduler invariant violated: completion for a task it does not own");
            };
            task.on_subtask_done(key.order, completion.result, &mut self.pool);
        }
    }

    /// Give free handles to tasks that still have bytes to fetch
    fn balance(&mut self) {
        for task in self.tasks.values_mut() {
            if self.pool.free_handle_count() == 0 {
                break;
            }
            if task.needs_chunks() {
                task.generate_chunks(&mut self.pool);
                task.publish();
            }
        }
    }

    fn take_input(&mut self) {
        while self.pool.free_handle_count() > 0 {
            let Some(mut task) = self.queues.input.lock().pop_front() else {
                break;
            };
            task.prepare(&mut self.pool);
            self.tasks.insert(task.id(), task);
        }
    }

    fn process_removals(&mut self) {
        let ids = std::mem::take(&mut *self.queues.removal.lock());
        for id in ids {
            self.queues.input.lock().retain(|task| task.id() != id);
            self.release_waiters(|waiter| waiter.id == id);

            match self.tasks.shift_remove(&id) {
                Some(mut task) => {
                    task.abort(&mut self.pool);
                    info!("Task {} removed", id);
                }
                None => debug!("Task {} removed before it started", id),
            }
        }
    }

    /// A waiter can go once its task finished or is gone altogether
    fn waiter_ready(&self, id: TaskId) -> bool {
        match self.tasks.get(&id) {
            Some(task) => task.is_finished(),
            None => !self.queues.input.lock().iter().any(|task| task.id() == id),
        }
    }

    fn has_ready_waiters(&self) -> bool {
        let waiting = self.queues.waiting.lock();
        waiting.iter().any(|waiter| self.waiter_ready(waiter.id))
    }

    fn signal_waiters(&self) {
        let mut waiting = self.queues.waiting.lock();
        let (ready, pending): (Vec<_>, Vec<_>) = waiting
            .drain(..)
            .partition(|waiter| self.waiter_ready(waiter.id));
        *waiting = pending;
        drop(waiting);

        for waiter in ready {
            debug!("Releasing waiter of task {}", waiter.id);
            waiter.signal.post(1);
        }
    }

    fn release_waiters(&self, matches: impl Fn(&Waiter) -> bool) {
        let mut waiting = self.queues.waiting.lock();
        let (hit, keep): (Vec<_>, Vec<_>) = waiting.drain(..).partition(|w| matches(w));
        *waiting = keep;
        drop(waiting);

        for waiter in hit {
            waiter.signal.post(1);
        }
    }

    fn fail_in_flight(&mut self, cause: ErrorCause) {
        for task in self.tasks.values_mut() {
            if task.working_count() > 0 {
                task.fail_with(cause.clone(), &mut self.pool);
            }
        }
        if self.pool.in_use() > 0 {
            warn!("{} handles still attached after transport failure", self.pool.in_use());
            self.pool.release_all();
        }
    }

    fn teardown(mut self) -> IndexMap<TaskId, Task> {
        let queued: Vec<Task> = self.queues.input.lock().drain(..).collect();
        for task in queued {
            self.tasks.insert(task.id(), task);
        }

        for task in self.tasks.values_mut() {
            if !task.is_finished() {
                task.cancel(&mut self.pool);
            } else if !task.is_done() {
                task.abort(&mut self.pool);
            }
        }
        self.pool.release_all();
        self.release_waiters(|_| true);

        // Cancelled tasks are finished too and are carried over
        self.tasks.retain(|_, task| task.is_finished());
        info!(
            "Download scheduler stopped ({} finished tasks kept)",
            self.tasks.len()
        );
        self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{payload, MockState, ScriptedTransport};
    use crate::engine::task::Destination;
    use crate::sink::{shared, MemorySink, Sink};
    use chrono::Utc;
    use dlc_types::{Hints, Range, TaskInfo, TaskType};
    use uuid::Uuid;

    fn start(body: Vec<u8>, hints: Hints) -> (Arc<Queues>, Arc<Mutex<MockState>>, JoinHandle<IndexMap<TaskId, Task>>) {
        let (transport, state) = ScriptedTransport::serving(body);
        let queues = Arc::new(Queues::new());
        let pool = HandlePool::new(Box::new(transport), &hints);
        let thread = Scheduler::new(Arc::clone(&queues), pool).spawn().unwrap();
        (queues, state, thread)
    }

    fn full_task(url: &str, size: i64, sink: Arc<Mutex<MemorySink>>) -> Task {
        let info = TaskInfo {
            url: url.to_string(),
            dst_path: None,
            task_type: TaskType::Full,
            range: Range::new(0, size),
            timeout_secs: 1,
            custom_sink: true,
            created_at: Utc::now(),
        };
        Task::new(Uuid::new_v4(), info, Destination::Sink(sink))
    }

    fn wait(queues: &Queues, id: TaskId) {
        let signal = Arc::new(Semaphore::new());
        queues.waiting.lock().push(Waiter {
            id,
            signal: Arc::clone(&signal),
        });
        queues.wake();
        assert!(signal.wait_timeout(Duration::from_secs(10)), "waiter never released");
    }

    fn hints(max_handles: usize, chunk_size: usize) -> Hints {
        Hints {
            max_handles,
            chunk_size,
            timeout_secs: 1,
        }
    }

    #[test]
    fn test_tasks_share_bounded_handles() {
        let body = payload(100);
        let (queues, state, thread) = start(body.clone(), hints(3, 7));

        let sinks: Vec<_> = (0..4).map(|_| shared(MemorySink::new())).collect();
        let mut states = Vec::new();
        for (i, sink) in sinks.iter().enumerate() {
            let task = full_task(&format!("http://host/{}", i), 100, sink.clone());
            states.push(task.shared());
            queues.input.lock().push_back(task);
        }
        queues.wake();

        for shared in &states {
            wait(&queues, shared.id());
            assert!(shared.status().is_success());
        }
        for sink in &sinks {
            assert_eq!(sink.lock().bytes(), body.as_slice());
        }
        assert!(state.lock().max_attached <= 3);

        queues.cancel();
        let finished = thread.join().unwrap();
        assert_eq!(finished.len(), 4);
    }

    #[test]
    fn test_failing_task_leaves_others_alone() {
        let body = payload(30);
        let (queues, state, thread) = start(body.clone(), hints(8, 10));
        {
            let mut state = state.lock();
            state.faulty_url = Some("http://host/broken".to_string());
            state.status_at.insert(10, 404);
        }

        let broken_sink = shared(MemorySink::new());
        let healthy_sink = shared(MemorySink::new());
        let broken = full_task("http://host/broken", 30, broken_sink.clone());
        let healthy = full_task("http://host/healthy", 30, healthy_sink.clone());
        let (broken_state, healthy_state) = (broken.shared(), healthy.shared());
        queues.input.lock().push_back(broken);
        queues.input.lock().push_back(healthy);
        queues.wake();

        wait(&queues, broken_state.id());
        wait(&queues, healthy_state.id());

        let status = broken_state.status();
        assert_eq!(status.error.http_code, 404);
        assert!(broken_sink.lock().is_closed());
        assert!(healthy_state.status().is_success());
        assert_eq!(healthy_sink.lock().bytes(), body.as_slice());

        queues.cancel();
        thread.join().unwrap();
    }

    #[test]
    fn test_removed_queued_task_creates_no_handles() {
        let (queues, state, thread) = start(payload(10), hints(1, 10));
        state.lock().hold = true;

        // Occupies the only handle
        let blocker = full_task("http://host/blocker", 10, shared(MemorySink::new()));
        let queued = full_task("http://host/queued", 10, shared(MemorySink::new()));
        let (blocker_id, queued_id) = (blocker.id(), queued.id());
        queues.input.lock().push_back(blocker);
        queues.wake();
        while state.lock().attached == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        queues.input.lock().push_back(queued);
        queues.removal.lock().push(queued_id);
        queues.wake();
        wait(&queues, queued_id);

        let urls: Vec<String> = state.lock().requests.iter().map(|r| r.url.clone()).collect();
        assert!(urls.iter().all(|url| url.ends_with("blocker")));
        assert!(queues.input.lock().is_empty());

        queues.removal.lock().push(blocker_id);
        queues.wake();
        wait(&queues, blocker_id);
        queues.cancel();
        let finished = thread.join().unwrap();
        assert!(finished.is_empty());
        assert_eq!(state.lock().attached, 0);
    }

    #[test]
    fn test_cancel_releases_waiters_and_handles() {
        let (queues, state, thread) = start(payload(40), hints(4, 10));
        state.lock().hold = true;

        let sink = shared(MemorySink::new());
        let task = full_task("http://host/slow", 40, sink.clone());
        let id = task.id();
        let shared_state = task.shared();
        queues.input.lock().push_back(task);
        queues.wake();
        while state.lock().attached < 4 {
            thread::sleep(Duration::from_millis(1));
        }

        let signal = Arc::new(Semaphore::new());
        queues.waiting.lock().push(Waiter {
            id,
            signal: Arc::clone(&signal),
        });
        queues.cancel();

        assert!(signal.wait_timeout(Duration::from_secs(10)));
        let status = shared_state.status();
        assert!(status.is_finished());
        assert_eq!(status.error.message, "download cancelled");

        let finished = thread.join().unwrap();
        assert_eq!(finished.len(), 1);
        assert!(finished.contains_key(&id));
        assert_eq!(state.lock().attached, 0);
        assert!(!sink.lock().is_closed());
    }

    #[test]
    fn test_cancel_finishes_queued_tasks() {
        let (queues, state, thread) = start(payload(10), hints(1, 10));
        state.lock().hold = true;

        let blocker = full_task("http://host/blocker", 10, shared(MemorySink::new()));
        let queued = full_task("http://host/queued", 10, shared(MemorySink::new()));
        let queued_state = queued.shared();
        queues.input.lock().push_back(blocker);
        queues.wake();
        while state.lock().attached == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        queues.input.lock().push_back(queued);

        queues.cancel();
        let finished = thread.join().unwrap();

        assert_eq!(finished.len(), 2);
        assert!(queued_state.is_finished());
        assert_eq!(queued_state.status().error.message, "download cancelled");
        assert!(queues.input.lock().is_empty());
    }

    #[test]
    fn test_waiter_for_unknown_task_is_released() {
        let (queues, _state, thread) = start(Vec::new(), hints(2, 10));
        wait(&queues, Uuid::new_v4());
        queues.cancel();
        thread.join().unwrap();
    }
}

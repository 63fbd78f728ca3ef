//! Counting semaphore used to wake the scheduler and release waiters

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` permits and wake as many sleepers
    pub fn post(&self, n: usize) {
        let mut count = self.count.lock();
        *count += n;
        if n == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }

    /// Block until a permit is available and take it
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`. Returns true if a permit was taken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        while *count == 0 {
            if self.available.wait_for(&mut count, timeout).timed_out() {
                break;
            }
        }
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_post_before_wait_does_not_block() {
        let sem = Semaphore::new();
        sem.post(2);
        sem.wait();
        sem.wait();
        assert!(!sem.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_released_by_other_thread() {
        let sem = Arc::new(Semaphore::new());
        let poster = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            poster.post(1);
        });
        assert!(sem.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}

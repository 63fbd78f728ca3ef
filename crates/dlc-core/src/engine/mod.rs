//! Download Engine - the scheduler and everything it drives
//!
//! - Chunked range requests over a bounded pool of transport handles
//! - Strictly ordered writes into each task's sink
//! - One background thread owning all transfer state
//! - First-error-wins failure bookkeeping per task

mod handle_pool;
mod http;
mod library;
mod scheduler;
mod semaphore;
mod subtask;
mod task;
mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use handle_pool::*;
pub use http::*;
pub use library::*;
pub use scheduler::*;
pub use semaphore::*;
pub use subtask::*;
pub use task::*;
pub use transport::*;

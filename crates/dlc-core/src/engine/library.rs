//! Process-wide transport library lifecycle
//!
//! All HTTP transports in the process share one I/O runtime. The first
//! [`TransportLibrary::acquire`] starts it, dropping the last
//! [`LibraryHandle`] shuts it down.

use crate::error::DlcError;
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info};

struct LibraryState {
    users: usize,
    runtime: Option<Runtime>,
}

static LIBRARY: Mutex<LibraryState> = parking_lot::const_mutex(LibraryState {
    users: 0,
    runtime: None,
});

/// Reference-counted access to the shared transport runtime
pub struct TransportLibrary;

impl TransportLibrary {
    /// Take a reference on the library, starting it if this is the first one
    pub fn acquire() -> Result<LibraryHandle, DlcError> {
        let mut state = LIBRARY.lock();

        if state.runtime.is_none() {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("dlc-transport")
                .enable_all()
                .build()
                .map_err(|e| DlcError::Transport(format!("runtime init failed: {}", e)))?;
            info!("Transport library initialized");
            state.runtime = Some(runtime);
        }

        state.users += 1;
        let handle = state
            .runtime
            .as_ref()
            .map(|rt| rt.handle().clone())
            .ok_or_else(|| DlcError::Transport("runtime init failed".to_string()))?;
        debug!("Transport library acquired (users: {})", state.users);

        Ok(LibraryHandle { handle })
    }

    /// Number of live handles
    pub fn users() -> usize {
        LIBRARY.lock().users
    }
}

/// Keeps the transport runtime alive; releases it on drop
pub struct LibraryHandle {
    handle: Handle,
}

impl LibraryHandle {
    pub fn runtime(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        let mut state = LIBRARY.lock();
        debug_assert!(state.users > 0, "transport library released more than acquired");
        state.users = state.users.saturating_sub(1);

        if state.users == 0 {
            if let Some(runtime) = state.runtime.take() {
                runtime.shutdown_background();
                info!("Transport library shut down");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_runs_futures_on_shared_runtime() {
        let first = TransportLibrary::acquire().unwrap();
        let second = TransportLibrary::acquire().unwrap();
        assert!(TransportLibrary::users() >= 2);

        let value = first.runtime().block_on(async { 40 + 2 });
        assert_eq!(value, 42);

        drop(first);
        let value = second.runtime().block_on(async { 7 });
        assert_eq!(value, 7);
    }
}

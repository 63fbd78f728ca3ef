//! Scripted in-memory transport for unit tests
//!
//! Serves byte ranges of a fixed body. Each `perform` completes every
//! attached transfer at once, newest first, so chunks always finish out
//! of order.

use crate::engine::transport::{
    Completion, HandleId, HandleOptions, Request, RequestKind, Response, Transport,
};
use dlc_types::{MultiErrorKind, TransportErrorKind};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Knobs and counters shared between a test and its transport
#[derive(Debug, Default)]
pub struct MockState {
    pub created: usize,
    pub attached: usize,
    pub max_attached: usize,
    pub requests: Vec<Request>,
    /// Fail every `add` with this error
    pub reject_add: Option<MultiErrorKind>,
    /// Keep transfers in flight instead of completing them
    pub hold: bool,
    /// Answer range requests at these offsets with an HTTP status
    pub status_at: HashMap<u64, u16>,
    /// Fail range requests at these offsets with a transport error
    pub error_at: HashMap<u64, TransportErrorKind>,
    /// Limit `status_at` and `error_at` to this URL
    pub faulty_url: Option<String>,
    /// Answer HEAD without a Content-Length
    pub omit_length: bool,
}

pub struct ScriptedTransport {
    body: Vec<u8>,
    state: Arc<Mutex<MockState>>,
    handles: HashSet<HandleId>,
    next_handle: u64,
    attached: Vec<(HandleId, Request)>,
    messages: VecDeque<Completion>,
}

impl ScriptedTransport {
    pub fn serving(body: Vec<u8>) -> (Self, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (Self::with_state(body, Arc::clone(&state)), state)
    }

    /// Transport reporting into an existing state, for factories that build several
    pub fn with_state(body: Vec<u8>, state: Arc<Mutex<MockState>>) -> Self {
        Self {
            body,
            state,
            handles: HashSet::new(),
            next_handle: 0,
            attached: Vec::new(),
            messages: VecDeque::new(),
        }
    }

    fn respond(&self, request: &Request, state: &MockState) -> Result<Response, TransportErrorKind> {
        let total = self.body.len() as u64;
        match request.kind {
            RequestKind::Head => Ok(Response {
                status: 200,
                content_length: (!state.omit_length).then_some(total),
                body: Vec::new(),
            }),
            RequestKind::Range { offset, size } => {
                let faulty = state
                    .faulty_url
                    .as_ref()
                    .map_or(true, |url| *url == request.url);
                if let Some(kind) = state.error_at.get(&offset).filter(|_| faulty) {
                    return Err(*kind);
                }
                if let Some(status) = state.status_at.get(&offset).filter(|_| faulty) {
                    return Ok(Response {
                        status: *status,
                        content_length: Some(9),
                        body: b"not found".to_vec(),
                    });
                }
                let start = offset.min(total) as usize;
                let end = (offset + size).min(total) as usize;
                Ok(Response {
                    status: 206,
                    content_length: Some((end - start) as u64),
                    body: self.body[start..end].to_vec(),
                })
            }
        }
    }
}

impl Transport for ScriptedTransport {
    fn create_handle(&mut self) -> HandleId {
        self.next_handle += 1;
        let handle = HandleId(self.next_handle);
        self.handles.insert(handle);
        self.state.lock().created += 1;
        handle
    }

    fn set_baseline(
        &mut self,
        _handle: HandleId,
        _options: &HandleOptions,
    ) -> Result<(), TransportErrorKind> {
        Ok(())
    }

    fn reset_handle(&mut self, _handle: HandleId) {}

    fn add(&mut self, handle: HandleId, request: Request) -> Result<(), MultiErrorKind> {
        if !self.handles.contains(&handle) {
            return Err(MultiErrorKind::BadHandle);
        }
        if self.attached.iter().any(|(h, _)| *h == handle) {
            return Err(MultiErrorKind::AlreadyAdded);
        }

        let mut state = self.state.lock();
        if let Some(kind) = state.reject_add {
            return Err(kind);
        }
        state.requests.push(request.clone());
        state.attached += 1;
        state.max_attached = state.max_attached.max(state.attached);
        drop(state);

        self.attached.push((handle, request));
        Ok(())
    }

    fn remove(&mut self, handle: HandleId) -> Result<(), MultiErrorKind> {
        let before = self.attached.len();
        self.attached.retain(|(h, _)| *h != handle);
        if self.attached.len() != before {
            self.state.lock().attached -= 1;
        }
        Ok(())
    }

    fn perform(&mut self, timeout: Duration) -> Result<usize, MultiErrorKind> {
        if self.state.lock().hold {
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            return Ok(self.attached.len());
        }

        let attached = std::mem::take(&mut self.attached);
        let mut state = self.state.lock();
        state.attached = 0;
        for (handle, request) in attached.into_iter().rev() {
            let result = self.respond(&request, &state);
            self.messages.push_back(Completion { handle, result });
        }
        Ok(0)
    }

    fn next_message(&mut self) -> Option<Completion> {
        self.messages.pop_front()
    }
}

/// Deterministic test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

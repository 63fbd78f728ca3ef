//! reqwest-backed transport
//!
//! Every attached handle runs its request as a task on the shared
//! transport runtime. Finished transfers are funneled through a channel
//! and surface as completion messages from [`Transport::perform`].

use crate::engine::library::{LibraryHandle, TransportLibrary};
use crate::engine::transport::{
    Completion, HandleId, HandleOptions, Request, RequestKind, Response, Transport,
};
use crate::error::DlcError;
use dlc_types::{MultiErrorKind, TransportErrorKind};
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::redirect::Policy;
use reqwest::Client;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Redirect hops followed when `follow_redirects` is on
const MAX_REDIRECTS: usize = 10;

/// Keep-alive probe interval when `tcp_keepalive` is on
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

struct Finished {
    handle: HandleId,
    serial: u64,
    result: Result<Response, TransportErrorKind>,
}

struct Running {
    serial: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct HandleSlot {
    options: Option<HandleOptions>,
    running: Option<Running>,
}

/// HTTP transport built on a shared tokio runtime and reqwest clients
pub struct ReqwestTransport {
    library: LibraryHandle,
    handles: HashMap<HandleId, HandleSlot>,
    /// One client per distinct option set, reused across handles
    clients: HashMap<HandleOptions, Client>,
    next_handle: u64,
    next_serial: u64,
    done_tx: mpsc::UnboundedSender<Finished>,
    done_rx: mpsc::UnboundedReceiver<Finished>,
    messages: VecDeque<Completion>,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, DlcError> {
        let library = TransportLibrary::acquire()?;
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        Ok(Self {
            library,
            handles: HashMap::new(),
            clients: HashMap::new(),
            next_handle: 0,
            next_serial: 0,
            done_tx,
            done_rx,
            messages: VecDeque::new(),
        })
    }

    fn client_for(&mut self, options: HandleOptions) -> Result<Client, TransportErrorKind> {
        if let Some(client) = self.clients.get(&options) {
            return Ok(client.clone());
        }

        let redirect = if options.follow_redirects {
            Policy::limited(MAX_REDIRECTS)
        } else {
            Policy::none()
        };
        let keepalive = options.tcp_keepalive.then_some(KEEPALIVE_INTERVAL);

        let client = Client::builder()
            .user_agent(concat!("dlc/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!options.verify_tls)
            .redirect(redirect)
            .tcp_keepalive(keepalive)
            .build()
            .map_err(|e| {
                warn!("Failed to build HTTP client: {}", e);
                TransportErrorKind::Setup
            })?;

        self.clients.insert(options, client.clone());
        Ok(client)
    }

    fn running_count(&self) -> usize {
        self.handles.values().filter(|slot| slot.running.is_some()).count()
    }

    /// Turn a finished transfer into a message unless its handle moved on
    fn accept(&mut self, finished: Finished) {
        let Some(slot) = self.handles.get_mut(&finished.handle) else {
            debug!("Dropping completion for unknown {}", finished.handle);
            return;
        };

        match slot.running.as_ref() {
            Some(running) if running.serial == finished.serial => {
                slot.running = None;
                self.messages.push_back(Completion {
                    handle: finished.handle,
                    result: finished.result,
                });
            }
            _ => debug!("Dropping stale completion for {}", finished.handle),
        }
    }
}

impl Transport for ReqwestTransport {
    fn create_handle(&mut self) -> HandleId {
        self.next_handle += 1;
        let handle = HandleId(self.next_handle);
        self.handles.insert(handle, HandleSlot::default());
        handle
    }

    fn set_baseline(
        &mut self,
        handle: HandleId,
        options: &HandleOptions,
    ) -> Result<(), TransportErrorKind> {
        self.client_for(*options)?;
        let slot = self
            .handles
            .get_mut(&handle)
            .ok_or(TransportErrorKind::Setup)?;
        slot.options = Some(*options);
        Ok(())
    }

    fn reset_handle(&mut self, handle: HandleId) {
        if let Some(slot) = self.handles.get_mut(&handle) {
            if let Some(running) = slot.running.take() {
                running.task.abort();
            }
            slot.options = None;
        }
    }

    fn add(&mut self, handle: HandleId, request: Request) -> Result<(), MultiErrorKind> {
        let options = match self.handles.get(&handle) {
            None => return Err(MultiErrorKind::BadHandle),
            Some(slot) if slot.running.is_some() => return Err(MultiErrorKind::AlreadyAdded),
            Some(slot) => slot.options.unwrap_or_default(),
        };
        let client = self
            .client_for(options)
            .map_err(|_| MultiErrorKind::BadHandle)?;

        self.next_serial += 1;
        let serial = self.next_serial;
        let done_tx = self.done_tx.clone();

        debug!("Starting {:?} for {} on {}", request.kind, request.url, handle);
        let task = self.library.runtime().spawn(async move {
            let result = execute(client, request).await;
            let _ = done_tx.send(Finished {
                handle,
                serial,
                result,
            });
        });

        if let Some(slot) = self.handles.get_mut(&handle) {
            slot.running = Some(Running { serial, task });
        }
        Ok(())
    }

    fn remove(&mut self, handle: HandleId) -> Result<(), MultiErrorKind> {
        let slot = self
            .handles
            .get_mut(&handle)
            .ok_or(MultiErrorKind::BadHandle)?;
        if let Some(running) = slot.running.take() {
            running.task.abort();
        }
        self.messages.retain(|message| message.handle != handle);
        Ok(())
    }

    fn perform(&mut self, timeout: Duration) -> Result<usize, MultiErrorKind> {
        if self.messages.is_empty() && self.running_count() > 0 {
            let runtime = self.library.runtime().clone();
            let done_rx = &mut self.done_rx;
            let received =
                runtime.block_on(async { tokio::time::timeout(timeout, done_rx.recv()).await });

            match received {
                Ok(Some(finished)) => self.accept(finished),
                Ok(None) => return Err(MultiErrorKind::RuntimeUnavailable),
                Err(_) => {}
            }
        }

        while let Ok(finished) = self.done_rx.try_recv() {
            self.accept(finished);
        }

        Ok(self.running_count())
    }

    fn next_message(&mut self) -> Option<Completion> {
        self.messages.pop_front()
    }
}

impl Drop for ReqwestTransport {
    fn drop(&mut self) {
        for slot in self.handles.values_mut() {
            if let Some(running) = slot.running.take() {
                running.task.abort();
            }
        }
    }
}

async fn execute(client: Client, request: Request) -> Result<Response, TransportErrorKind> {
    let builder = match request.kind {
        RequestKind::Range { .. } => {
            let mut builder = client.get(&request.url);
            if let Some(range) = request.range_header() {
                builder = builder.header(RANGE, range);
            }
            builder
        }
        RequestKind::Head => client.head(&request.url),
    };

    let response = bounded(request.timeout, builder.send())
        .await?
        .map_err(classify)?;

    let status = response.status().as_u16();
    // HEAD bodies are empty, so read the header rather than the body size hint
    let content_length = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let mut body = Vec::new();
    if let RequestKind::Range { size, .. } = request.kind {
        // One byte past the range is enough to detect over-delivery
        let limit = usize::try_from(size.saturating_add(1)).unwrap_or(usize::MAX);
        body.reserve(limit.min(content_length.unwrap_or(0) as usize));

        let mut stream = response.bytes_stream();
        loop {
            let next = bounded(request.timeout, stream.next()).await?;
            match next {
                Some(Ok(bytes)) => {
                    let take = (limit - body.len()).min(bytes.len());
                    body.extend_from_slice(&bytes[..take]);
                    if body.len() >= limit {
                        break;
                    }
                }
                Some(Err(e)) => return Err(classify(e)),
                None => break,
            }
        }
    }

    Ok(Response {
        status,
        content_length,
        body,
    })
}

/// Await `future` for at most `limit`. A zero limit waits forever.
async fn bounded<F: Future>(limit: Duration, future: F) -> Result<F::Output, TransportErrorKind> {
    if limit.is_zero() {
        return Ok(future.await);
    }
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| TransportErrorKind::Timeout)
}

fn classify(error: reqwest::Error) -> TransportErrorKind {
    if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if error.is_connect() {
        TransportErrorKind::Connect
    } else if error.is_redirect() {
        TransportErrorKind::Redirect
    } else if error.is_builder() {
        TransportErrorKind::InvalidUrl
    } else if error.is_body() || error.is_decode() {
        TransportErrorKind::Receive
    } else if error.is_request() {
        TransportErrorKind::Request
    } else {
        TransportErrorKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> Request {
        Request {
            url: url.to_string(),
            kind: RequestKind::Head,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_add_rejects_unknown_handle() {
        let mut transport = ReqwestTransport::new().unwrap();
        let result = transport.add(HandleId(999), request("http://127.0.0.1:9/"));
        assert_eq!(result, Err(MultiErrorKind::BadHandle));
    }

    #[test]
    fn test_add_rejects_running_handle() {
        let mut transport = ReqwestTransport::new().unwrap();
        let handle = transport.create_handle();
        transport
            .set_baseline(handle, &HandleOptions::default())
            .unwrap();
        transport.add(handle, request("http://127.0.0.1:9/")).unwrap();

        let again = transport.add(handle, request("http://127.0.0.1:9/"));
        assert_eq!(again, Err(MultiErrorKind::AlreadyAdded));
        transport.remove(handle).unwrap();
    }

    #[test]
    fn test_clients_shared_per_option_set() {
        let mut transport = ReqwestTransport::new().unwrap();
        let options = HandleOptions::default();
        for _ in 0..4 {
            let handle = transport.create_handle();
            transport.set_baseline(handle, &options).unwrap();
        }
        assert_eq!(transport.clients.len(), 1);
    }

    #[test]
    fn test_stale_completion_is_dropped() {
        let mut transport = ReqwestTransport::new().unwrap();
        let handle = transport.create_handle();
        transport.accept(Finished {
            handle,
            serial: 41,
            result: Err(TransportErrorKind::Other),
        });
        assert!(transport.next_message().is_none());
    }

    #[test]
    fn test_perform_with_nothing_running_returns_immediately() {
        let mut transport = ReqwestTransport::new().unwrap();
        let start = std::time::Instant::now();
        assert_eq!(transport.perform(Duration::from_secs(5)).unwrap(), 0);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_connection_refused_reports_completion() {
        let mut transport = ReqwestTransport::new().unwrap();
        let handle = transport.create_handle();
        transport
            .set_baseline(handle, &HandleOptions::default())
            .unwrap();
        transport.add(handle, request("http://127.0.0.1:9/")).unwrap();

        let mut completion = None;
        for _ in 0..50 {
            transport.perform(Duration::from_millis(200)).unwrap();
            if let Some(message) = transport.next_message() {
                completion = Some(message);
                break;
            }
        }

        let completion = completion.expect("no completion for refused connection");
        assert_eq!(completion.handle, handle);
        assert!(completion.result.is_err());
    }
}

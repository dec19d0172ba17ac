//! Per-call shared state: the cancellation token and the status slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use crossfire::{mpmc, MAsyncRx, MTx};
use http::HeaderMap;
use triple_rpc_core::{Code, Status};

/// An idempotent cancellation signal, observable from caller threads
/// (polling or blocking) and from event-loop tasks (async).
///
/// The async side is the drop-a-sender idiom: firing drops the guard sender,
/// which wakes every watcher at once and forever.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    fired: AtomicBool,
    guard: Mutex<Option<MTx<()>>>,
    cond: Condvar,
    rx: MAsyncRx<()>,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpmc::unbounded_async::<()>();
        Self {
            inner: Arc::new(CancelInner {
                fired: AtomicBool::new(false),
                guard: Mutex::new(Some(tx)),
                cond: Condvar::new(),
                rx,
            }),
        }
    }

    /// Fire the signal. A second call is a no-op.
    pub fn cancel(&self) {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut guard = self.inner.guard.lock().unwrap();
        guard.take();
        self.inner.cond.notify_all();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Block the calling thread until cancellation fires.
    pub fn wait_cancelled(&self) {
        let mut guard = self.inner.guard.lock().unwrap();
        while guard.is_some() {
            guard = self.inner.cond.wait(guard).unwrap();
        }
    }

    /// Like [CancelToken::wait_cancelled] with a bound. Returns whether the
    /// token fired.
    pub fn wait_cancelled_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.inner.guard.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while guard.is_some() {
            let left = match deadline.checked_duration_since(std::time::Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return false,
            };
            let (g, res) = self.inner.cond.wait_timeout(guard, left).unwrap();
            guard = g;
            if res.timed_out() && guard.is_some() {
                return false;
            }
        }
        true
    }

    /// Async observer handle for event-loop tasks. `recv()` errors once the
    /// token fires.
    pub(crate) fn watch(&self) -> MAsyncRx<()> {
        self.inner.rx.clone()
    }
}

/// The write-once terminal state of a call plus received metadata.
///
/// Exactly one status wins; observers that need to react to completion watch
/// the done channel, which closes when the slot is filled.
pub(crate) struct CallState {
    status: OnceLock<Status>,
    response_metadata: Mutex<Option<HeaderMap>>,
    trailers: Mutex<Option<HeaderMap>>,
    done_guard: Mutex<Option<MTx<()>>>,
    done_rx: MAsyncRx<()>,
}

impl CallState {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpmc::unbounded_async::<()>();
        Arc::new(Self {
            status: OnceLock::new(),
            response_metadata: Mutex::new(None),
            trailers: Mutex::new(None),
            done_guard: Mutex::new(Some(tx)),
            done_rx: rx,
        })
    }

    /// Record the terminal status. Returns true for the first caller; later
    /// statuses are dropped, keeping the slot monotonic.
    pub fn finish(&self, status: Status) -> bool {
        let first = self.status.set(status).is_ok();
        if first {
            self.done_guard.lock().unwrap().take();
        }
        first
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.status.get().is_some()
    }

    /// The terminal status. Readable only after the inbound queue closed, so
    /// an empty slot here means the engine died without finishing the call.
    pub fn status(&self) -> Status {
        self.status
            .get()
            .cloned()
            .unwrap_or_else(|| Status::new(Code::Unknown, "call did not complete"))
    }

    pub fn done_watch(&self) -> MAsyncRx<()> {
        self.done_rx.clone()
    }

    pub fn set_response_metadata(&self, headers: HeaderMap) {
        *self.response_metadata.lock().unwrap() = Some(headers);
    }

    pub fn set_trailers(&self, trailers: HeaderMap) {
        *self.trailers.lock().unwrap() = Some(trailers);
    }

    pub fn response_metadata(&self) -> Vec<(String, String)> {
        header_pairs(self.response_metadata.lock().unwrap().as_ref())
    }

    pub fn trailers(&self) -> Vec<(String, String)> {
        header_pairs(self.trailers.lock().unwrap().as_ref())
    }
}

fn header_pairs(headers: Option<&HeaderMap>) -> Vec<(String, String)> {
    let Some(headers) = headers else {
        return Vec::new();
    };
    headers
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

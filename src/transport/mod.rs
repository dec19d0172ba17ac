//! The HTTP/2 transport layer.
//!
//! All network I/O runs on one [Driver]: a current-thread tokio runtime
//! pinned to a dedicated OS thread. Caller threads never perform I/O; they
//! hand futures to the driver and meet them through bounded queues.

mod conn;
pub(crate) use conn::{Channel, Connector};

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::{io, thread};

use bytes::Bytes;
use crossfire::{mpmc, MTx};
use h2::{Reason, SendStream};
use tokio::runtime::Handle;
use triple_rpc_core::{Code, Status, TripleError};

/// The cooperative event loop.
///
/// Tasks are spawned from any thread; they execute on the loop thread only.
/// Dropping the driver (from a non-loop thread) stops the loop and drops any
/// task still pending.
pub struct Driver {
    handle: Handle,
    shutdown: Mutex<Option<MTx<()>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Driver {
    pub fn new(name: &str) -> io::Result<Arc<Self>> {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let handle = rt.handle().clone();
        let (tx, rx) = mpmc::unbounded_async::<()>();
        let thread_name = format!("triple-loop-{}", name);
        let thread = thread::Builder::new().name(thread_name.clone()).spawn(move || {
            trace!("{} running", thread_name);
            // recv() errors once the shutdown sender drops; spawned tasks
            // keep running until then
            rt.block_on(async move {
                let _ = rx.recv().await;
            });
            trace!("{} exit", thread_name);
        })?;
        Ok(Arc::new(Self {
            handle,
            shutdown: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// The process-wide loop used by clients. Never shut down.
    pub fn shared() -> Arc<Driver> {
        static SHARED: OnceLock<Arc<Driver>> = OnceLock::new();
        SHARED.get_or_init(|| Driver::new("main").expect("spawn event loop")).clone()
    }

    #[inline]
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }

    /// Stop the loop and join its thread. Must not be called from a loop
    /// task.
    pub fn shutdown(&self) {
        self.shutdown.lock().unwrap().take();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Write a DATA frame honoring HTTP/2 flow control: reserve, suspend until
/// the window opens, send what was granted.
pub(crate) async fn send_data(
    stream: &mut SendStream<Bytes>, mut data: Bytes, end_stream: bool,
) -> Result<(), TripleError> {
    if data.is_empty() {
        return stream.send_data(data, end_stream).map_err(|e| h2_error(&e));
    }
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        match std::future::poll_fn(|cx| stream.poll_capacity(cx)).await {
            None => {
                return Err(TripleError::Transport("stream closed while sending".to_string()));
            }
            Some(Err(e)) => {
                return Err(h2_error(&e));
            }
            Some(Ok(0)) => continue,
            Some(Ok(granted)) => {
                let chunk = data.split_to(granted.min(data.len()));
                let eos = end_stream && data.is_empty();
                stream.send_data(chunk, eos).map_err(|e| h2_error(&e))?;
            }
        }
    }
    Ok(())
}

/// Map a transport-level failure onto the status a call surfaces.
///
/// A peer reset keeps the HTTP/2 error code in the message for diagnostics;
/// CANCEL means the peer cancelled, protocol-level codes mean someone
/// violated the protocol, everything else is the connection dying.
pub(crate) fn h2_error_status(e: &h2::Error) -> Status {
    if e.is_reset() {
        match e.reason() {
            Some(Reason::CANCEL) => Status::new(Code::Cancelled, "stream reset by peer: CANCEL"),
            Some(Reason::PROTOCOL_ERROR) | Some(Reason::INTERNAL_ERROR) => {
                Status::new(Code::Internal, format!("stream reset by peer: {:?}", e.reason()))
            }
            Some(reason) => {
                Status::new(Code::Unavailable, format!("stream reset by peer: {:?}", reason))
            }
            None => Status::new(Code::Unavailable, "stream reset by peer"),
        }
    } else if e.is_go_away() {
        Status::new(Code::Unavailable, format!("connection going away: {}", e))
    } else {
        Status::new(Code::Unavailable, format!("transport: {}", e))
    }
}

#[inline]
pub(crate) fn h2_error(e: &h2::Error) -> TripleError {
    TripleError::from_status(h2_error_status(e))
        .unwrap_or_else(|| TripleError::Transport(e.to_string()))
}

/// Sleep until the optional deadline; pends forever without one.
pub(crate) async fn sleep_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_driver_runs_tasks() {
        let driver = Driver::new("test").expect("driver");
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        driver.spawn(async move {
            flag.store(true, Ordering::SeqCst);
        });
        let start = std::time::Instant::now();
        while !ran.load(Ordering::SeqCst) {
            assert!(start.elapsed() < std::time::Duration::from_secs(5));
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        driver.shutdown();
        // a second shutdown is a no-op
        driver.shutdown();
    }
}

//! Client-side connection management.
//!
//! One [Channel] per remote `host:port`, created lazily on first use and
//! shared by every call to that endpoint. The h2 connection future and the
//! keepalive timer both run on the event loop; callers only ever touch the
//! cloneable stream-opening handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use bytes::Bytes;
use futures::future::{AbortHandle, Abortable};
use h2::client::SendRequest;
use h2::Ping;
use tokio::net::TcpStream;
use triple_rpc_core::{ClientConfig, TripleError};

#[derive(Clone)]
pub(crate) struct Connector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    config: ClientConfig,
    started: Instant,
    conns: Mutex<HashMap<String, Channel>>,
}

/// A live HTTP/2 connection to one endpoint.
#[derive(Clone)]
pub(crate) struct Channel {
    authority: String,
    handle: SendRequest<Bytes>,
    closed: Arc<AtomicBool>,
    last_used_ms: Arc<AtomicU64>,
    abort: AbortHandle,
}

impl Channel {
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn handle(&self) -> SendRequest<Bytes> {
        self.handle.clone()
    }

    #[inline]
    pub fn authority(&self) -> &str {
        &self.authority
    }
}

impl Connector {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                config,
                started: Instant::now(),
                conns: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The channel for an authority, dialing if none is alive. Must run on
    /// the event loop.
    pub async fn channel(&self, authority: &str) -> Result<Channel, TripleError> {
        if let Some(channel) = self.lookup(authority) {
            self.touch(&channel);
            return Ok(channel);
        }
        let channel = self.connect(authority).await?;
        self.touch(&channel);
        Ok(channel)
    }

    fn lookup(&self, authority: &str) -> Option<Channel> {
        let mut conns = self.inner.conns.lock().unwrap();
        match conns.get(authority) {
            Some(channel) if !channel.is_closed() => Some(channel.clone()),
            Some(_) => {
                conns.remove(authority);
                None
            }
            None => None,
        }
    }

    #[inline]
    fn now_ms(&self) -> u64 {
        self.inner.started.elapsed().as_millis() as u64
    }

    #[inline]
    fn touch(&self, channel: &Channel) {
        channel.last_used_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    async fn connect(&self, authority: &str) -> Result<Channel, TripleError> {
        let config = &self.inner.config;
        debug!("dialing {}", authority);
        let tcp = tokio::time::timeout(
            config.timeout.connect_timeout,
            TcpStream::connect(authority),
        )
        .await
        .map_err(|_| TripleError::Transport(format!("connect timeout to {}", authority)))?
        .map_err(|e| TripleError::Transport(format!("connect to {}: {}", authority, e)))?;
        let _ = tcp.set_nodelay(true);

        let (handle, mut conn) = h2::client::handshake(tcp)
            .await
            .map_err(|e| TripleError::Transport(format!("handshake with {}: {}", authority, e)))?;
        let ping_pong = conn.ping_pong();

        let closed = Arc::new(AtomicBool::new(false));
        let last_used_ms = Arc::new(AtomicU64::new(self.now_ms()));
        let (abort, abort_reg) = AbortHandle::new_pair();

        // drive the connection until GOAWAY, error, or idle abort
        {
            let closed = closed.clone();
            let authority = authority.to_string();
            tokio::spawn(async move {
                match Abortable::new(conn, abort_reg).await {
                    Ok(Ok(())) => debug!("connection to {} closed", authority),
                    Ok(Err(e)) => warn!("connection to {} failed: {}", authority, e),
                    Err(_) => debug!("connection to {} aborted as idle", authority),
                }
                closed.store(true, Ordering::Relaxed);
            });
        }

        let channel = Channel {
            authority: authority.to_string(),
            handle,
            closed: closed.clone(),
            last_used_ms: last_used_ms.clone(),
            abort: abort.clone(),
        };

        // keepalive: PING at ping_interval, close after idle_timeout
        if let Some(mut ping_pong) = ping_pong {
            let weak = Arc::downgrade(&self.inner);
            let interval = config.ping_interval;
            let idle = config.timeout.idle_timeout;
            let authority = authority.to_string();
            let started = self.inner.started;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if closed.load(Ordering::Relaxed) {
                        break;
                    }
                    let idle_for = (started.elapsed().as_millis() as u64)
                        .saturating_sub(last_used_ms.load(Ordering::Relaxed));
                    if idle_for >= idle.as_millis() as u64 {
                        debug!("closing idle connection to {}", authority);
                        abort.abort();
                        break;
                    }
                    if let Err(e) = ping_pong.ping(Ping::opaque()).await {
                        warn!("keepalive ping to {} failed: {}", authority, e);
                        break;
                    }
                    trace!("keepalive pong from {}", authority);
                }
                if let Some(inner) = weak.upgrade() {
                    let mut conns = inner.conns.lock().unwrap();
                    if let Some(current) = conns.get(&authority) {
                        if current.is_closed() {
                            conns.remove(&authority);
                        }
                    }
                }
            });
        }

        // a racing dial may land here first; the replaced connection drains
        // its in-flight streams and is reaped by its keepalive timer
        self.inner.conns.lock().unwrap().insert(authority.to_string(), channel.clone());
        Ok(channel)
    }
}

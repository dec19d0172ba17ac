//! The server façade: typed registration, listeners, graceful close.

mod call;
mod pool;
mod router;

pub use router::{RequestReader, ResponseSink, ServerContext};

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{AbortHandle, Abortable};
use triple_rpc_core::{Endpoint, ServerConfig, ServiceKey, ServiceMethod, Status, TripleError};

use crate::registry::{Lease, Registry};
use crate::server::pool::WorkerPool;
use crate::server::router::{Route, Router};
use crate::transport::Driver;

/// A Triple server.
///
/// Register handlers, then listen; handlers run on the worker pool while the
/// event loop owns every connection. [TripleServer::close] stops accepting,
/// withdraws registry leases and waits for live connections with a bounded
/// wait.
pub struct TripleServer {
    config: Arc<ServerConfig>,
    driver: Arc<Driver>,
    pool: WorkerPool,
    router: Option<Router>,
    shared_router: Option<Arc<Router>>,
    listeners: Vec<(AbortHandle, String)>,
    conn_ref_count: Arc<()>,
    bound_addr: Option<String>,
    leases: Vec<(Arc<dyn Registry>, Lease)>,
}

impl TripleServer {
    pub fn new(config: ServerConfig) -> io::Result<Self> {
        let driver = Driver::new("server")?;
        let pool = WorkerPool::new(config.handler_threads, 1024);
        Ok(Self {
            config: Arc::new(config),
            driver,
            pool,
            router: Some(Router::new()),
            shared_router: None,
            listeners: Vec::new(),
            conn_ref_count: Arc::new(()),
            bound_addr: None,
            leases: Vec::new(),
        })
    }

    /// Register a unary handler: `(ctx, request) -> Result<response, Status>`.
    pub fn register_unary<Req, Resp, H>(
        &mut self, method: ServiceMethod<Req, Resp>, handler: H,
    ) -> Result<(), TripleError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        H: Fn(&ServerContext, Req) -> Result<Resp, Status> + Send + Sync + 'static,
    {
        self.add_route(method.path(), router::unary_route(method, handler))
    }

    /// Register a client-streaming handler:
    /// `(ctx, reader) -> Result<response, Status>`.
    pub fn register_client_stream<Req, Resp, H>(
        &mut self, method: ServiceMethod<Req, Resp>, handler: H,
    ) -> Result<(), TripleError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        H: Fn(&ServerContext, &mut RequestReader<Req>) -> Result<Resp, Status>
            + Send
            + Sync
            + 'static,
    {
        self.add_route(method.path(), router::client_stream_route(method, handler))
    }

    /// Register a server-streaming handler:
    /// `(ctx, request, sink) -> Result<(), Status>`.
    pub fn register_server_stream<Req, Resp, H>(
        &mut self, method: ServiceMethod<Req, Resp>, handler: H,
    ) -> Result<(), TripleError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        H: Fn(&ServerContext, Req, &ResponseSink<Resp>) -> Result<(), Status>
            + Send
            + Sync
            + 'static,
    {
        self.add_route(method.path(), router::server_stream_route(method, handler))
    }

    /// Register a bidi handler: `(ctx, reader, sink) -> Result<(), Status>`.
    pub fn register_bidi<Req, Resp, H>(
        &mut self, method: ServiceMethod<Req, Resp>, handler: H,
    ) -> Result<(), TripleError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        H: Fn(&ServerContext, &mut RequestReader<Req>, &ResponseSink<Resp>) -> Result<(), Status>
            + Send
            + Sync
            + 'static,
    {
        self.add_route(method.path(), router::bidi_route(method, handler))
    }

    fn add_route(&mut self, path: String, route: Route) -> Result<(), TripleError> {
        let Some(router) = self.router.as_mut() else {
            return Err(TripleError::IllegalState("registration after listen"));
        };
        router.add(path, route)
    }

    /// Bind and start accepting. Returns the bound address, useful with port
    /// 0.
    pub fn listen(&mut self, addr: &str) -> io::Result<String> {
        let router = match &self.shared_router {
            Some(router) => router.clone(),
            None => {
                let router = Arc::new(self.router.take().unwrap_or_default());
                self.shared_router = Some(router.clone());
                router
            }
        };
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?.to_string();
        let pool_tx = self
            .pool
            .handle()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker pool closed"))?;

        let (abort_handle, abort_reg) = AbortHandle::new_pair();
        let accept = accept_loop(
            listener,
            router,
            pool_tx,
            self.config.clone(),
            self.conn_ref_count.clone(),
        );
        self.driver.spawn(async move {
            let _ = Abortable::new(accept, abort_reg).await;
        });
        info!("listening on {}", local_addr);
        self.listeners.push((abort_handle, format!("listener {}", local_addr)));
        self.bound_addr = Some(local_addr.clone());
        Ok(local_addr)
    }

    /// The first bound address.
    pub fn bound_addr(&self) -> Option<&str> {
        self.bound_addr.as_deref()
    }

    /// Publish this server into a registry; the lease is withdrawn on
    /// [TripleServer::close].
    pub fn register_provider(
        &mut self, registry: Arc<dyn Registry>, key: &ServiceKey, endpoint: &Endpoint,
    ) -> Result<(), TripleError> {
        let lease = registry.register(key, endpoint)?;
        self.leases.push((registry, lease));
        Ok(())
    }

    #[inline]
    fn alive_conns(&self) -> usize {
        Arc::strong_count(&self.conn_ref_count) - 1
    }

    /// Gracefully close the server.
    ///
    /// Steps: stop the listeners, withdraw registry leases, wait for live
    /// connections up to `server_close_wait`, then stop the event loop and
    /// the worker pool.
    pub fn close(&mut self) {
        for (handle, name) in self.listeners.drain(..) {
            handle.abort();
            info!("{} closed", name);
        }
        for (registry, lease) in self.leases.drain(..) {
            let _ = registry.unregister(lease);
        }
        let started = Instant::now();
        let mut remaining = self.alive_conns();
        while remaining > 0 {
            if started.elapsed() > self.config.server_close_wait {
                warn!("closing with {} connections still alive", remaining);
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
            remaining = self.alive_conns();
        }
        // loop first: dropping its tasks releases the pool's submit handles,
        // letting the workers drain and join
        self.driver.shutdown();
        self.pool.shutdown();
        info!("server closed with {} connections alive", self.alive_conns());
    }
}

impl Drop for TripleServer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    listener: std::net::TcpListener, router: Arc<Router>, pool_tx: crossfire::MAsyncTx<pool::Job>,
    config: Arc<ServerConfig>, conn_ref_count: Arc<()>,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            error!("listener registration failed: {}", e);
            return;
        }
    };
    loop {
        match listener.accept().await {
            Err(e) => {
                warn!("accept error: {}", e);
                return;
            }
            Ok((stream, remote_addr)) => {
                let _ = stream.set_nodelay(true);
                tokio::spawn(serve_conn(
                    stream,
                    remote_addr,
                    router.clone(),
                    pool_tx.clone(),
                    config.clone(),
                    conn_ref_count.clone(),
                ));
            }
        }
    }
}

async fn serve_conn(
    stream: tokio::net::TcpStream, remote_addr: SocketAddr, router: Arc<Router>,
    pool_tx: crossfire::MAsyncTx<pool::Job>, config: Arc<ServerConfig>, conn_guard: Arc<()>,
) {
    let mut conn = match h2::server::handshake(stream).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!("handshake with {} failed: {}", remote_addr, e);
            return;
        }
    };
    debug!("connection from {}", remote_addr);
    while let Some(accepted) = conn.accept().await {
        match accepted {
            Ok((request, respond)) => {
                trace!("{} {} from {}", request.method(), request.uri().path(), remote_addr);
                tokio::spawn(call::serve_stream(
                    request,
                    respond,
                    router.clone(),
                    pool_tx.clone(),
                    config.clone(),
                    remote_addr,
                ));
            }
            Err(e) => {
                debug!("connection from {} failed: {}", remote_addr, e);
                break;
            }
        }
    }
    debug!("connection from {} closed", remote_addr);
    drop(conn_guard);
}

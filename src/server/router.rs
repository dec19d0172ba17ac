//! Server-side dispatch: `:path` to handler, and the typed bridges handed to
//! user handlers.
//!
//! Registration erases the request/response types at the boundary: each
//! pattern-specific constructor wraps the typed handler into a closure over
//! a bytes-level [ServerCall]. The router itself only maps paths.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossfire::{MTx, Rx};
use triple_rpc_core::frame::encode_frame;
use triple_rpc_core::{
    Code, DeserializeFn, RpcPattern, SerializeFn, ServiceMethod, Status, TripleError,
};

use crate::context::CancelToken;

/// What the handler-side of a stream pushes back to the event loop.
pub(crate) enum ServerReply {
    /// A response message; already framed except in JSON mode.
    Message(Bytes),
    /// Terminal status; trailers (or the mapped HTTP status in JSON mode).
    Complete(Status),
    /// Local protocol violation; reset the stream instead of trailers.
    Abort(Status),
}

/// Per-invocation context visible to handlers.
pub struct ServerContext {
    metadata: Vec<(String, String)>,
    deadline: Option<Instant>,
    cancel: CancelToken,
    remote_addr: SocketAddr,
}

impl ServerContext {
    pub(crate) fn new(
        metadata: Vec<(String, String)>, deadline: Option<Instant>, cancel: CancelToken,
        remote_addr: SocketAddr,
    ) -> Self {
        Self { metadata, deadline, cancel, remote_addr }
    }

    /// Request metadata (headers), pseudo-headers excluded.
    #[inline]
    pub fn metadata(&self) -> &[(String, String)] {
        &self.metadata
    }

    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Absolute deadline negotiated via `grpc-timeout`, if any.
    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Polling flag for cooperative early-out.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Block until the invocation is cancelled (deadline, peer reset or
    /// client cancel). Returns whether it fired within the bound.
    pub fn wait_cancelled(&self, timeout: Duration) -> bool {
        self.cancel.wait_cancelled_timeout(timeout)
    }
}

/// Bytes-level view of one inbound stream, owned by the worker running the
/// handler.
pub(crate) struct ServerCall {
    ctx: ServerContext,
    in_rx: Option<Rx<Bytes>>,
    out_tx: Option<MTx<ServerReply>>,
    json: bool,
    max_message_size: usize,
}

impl ServerCall {
    pub fn new(
        ctx: ServerContext, in_rx: Rx<Bytes>, out_tx: MTx<ServerReply>, json: bool,
        max_message_size: usize,
    ) -> Self {
        Self { ctx, in_rx: Some(in_rx), out_tx: Some(out_tx), json, max_message_size }
    }

    fn recv_payload(&mut self) -> Option<Bytes> {
        self.in_rx.as_ref().and_then(|rx| rx.recv().ok())
    }

    fn send_payload(&mut self, payload: &[u8]) -> Result<(), TripleError> {
        let Some(tx) = self.out_tx.as_ref() else {
            return Err(TripleError::IllegalState("send after completion"));
        };
        let bytes = if self.json {
            Bytes::copy_from_slice(payload)
        } else {
            encode_frame(payload, false, self.max_message_size)?
        };
        tx.send(ServerReply::Message(bytes)).map_err(|_| TripleError::Cancelled)
    }

    fn complete(&mut self, status: Status) {
        if let Some(tx) = self.out_tx.take() {
            let _ = tx.send(ServerReply::Complete(status));
        }
    }

    fn abort(&mut self, status: Status) {
        if let Some(tx) = self.out_tx.take() {
            let _ = tx.send(ServerReply::Abort(status));
        }
    }

    fn reader<Req>(&mut self, deserializer: DeserializeFn<Req>) -> RequestReader<Req> {
        RequestReader {
            rx: self.in_rx.take(),
            deserializer,
            cancel: self.ctx.cancel.clone(),
            finished: false,
        }
    }

    fn sink<Resp>(&self, serializer: SerializeFn<Resp>) -> ResponseSink<Resp> {
        ResponseSink {
            tx: self.out_tx.clone(),
            serializer,
            cancel: self.ctx.cancel.clone(),
            max_message_size: self.max_message_size,
        }
    }
}

impl Drop for ServerCall {
    fn drop(&mut self) {
        // a handler that fell over without completing still terminates the
        // stream for the client
        if let Some(tx) = self.out_tx.take() {
            let _ = tx
                .send(ServerReply::Complete(Status::new(Code::Unknown, "handler did not complete")));
        }
    }
}

/// Pull-style reader over the inbound request messages of a streaming
/// handler.
pub struct RequestReader<Req> {
    rx: Option<Rx<Bytes>>,
    deserializer: DeserializeFn<Req>,
    cancel: CancelToken,
    finished: bool,
}

impl<Req> RequestReader<Req> {
    /// The next request, `Ok(None)` once the client half-closed, or an error
    /// after cancellation / a decode failure.
    pub fn next_message(&mut self) -> Result<Option<Req>, TripleError> {
        if self.finished {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            self.finished = true;
            return Err(TripleError::Cancelled);
        }
        let Some(rx) = self.rx.as_ref() else {
            return Ok(None);
        };
        match rx.recv() {
            Ok(payload) => match (self.deserializer)(&payload) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    self.finished = true;
                    Err(e.into())
                }
            },
            Err(_) => {
                self.finished = true;
                if self.cancel.is_cancelled() {
                    Err(TripleError::Cancelled)
                } else {
                    Ok(None)
                }
            }
        }
    }
}

impl<Req> Iterator for RequestReader<Req> {
    type Item = Result<Req, TripleError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_message() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Push-style writer for the response messages of a streaming handler.
pub struct ResponseSink<Resp> {
    tx: Option<MTx<ServerReply>>,
    serializer: SerializeFn<Resp>,
    cancel: CancelToken,
    max_message_size: usize,
}

impl<Resp> ResponseSink<Resp> {
    /// Serialize, frame and enqueue one response message. Blocks while the
    /// outbound queue is full; fails once the invocation is cancelled.
    pub fn send(&self, value: &Resp) -> Result<(), TripleError> {
        if self.cancel.is_cancelled() {
            return Err(TripleError::Cancelled);
        }
        let Some(tx) = self.tx.as_ref() else {
            return Err(TripleError::IllegalState("send after completion"));
        };
        let payload = (self.serializer)(value)?;
        let frame = encode_frame(&payload, false, self.max_message_size)?;
        tx.send(ServerReply::Message(frame)).map_err(|_| TripleError::Cancelled)
    }
}

pub(crate) type ErasedHandler = std::sync::Arc<dyn Fn(ServerCall) + Send + Sync>;

pub(crate) struct Route {
    pub pattern: RpcPattern,
    pub handler: ErasedHandler,
}

#[derive(Default)]
pub(crate) struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: String, route: Route) -> Result<(), TripleError> {
        if self.routes.contains_key(&path) {
            return Err(TripleError::IllegalState("path already registered"));
        }
        debug!("route {} ({})", path, route.pattern);
        self.routes.insert(path, route);
        Ok(())
    }

    #[inline]
    pub fn get(&self, path: &str) -> Option<&Route> {
        self.routes.get(path)
    }
}

/// Unary: one request, the half-close, then the handler.
pub(crate) fn unary_route<Req, Resp, H>(method: ServiceMethod<Req, Resp>, handler: H) -> Route
where
    Req: Send + 'static,
    Resp: Send + 'static,
    H: Fn(&ServerContext, Req) -> Result<Resp, Status> + Send + Sync + 'static,
{
    let deserializer = method.arg_deserializer();
    let serializer = method.return_serializer();
    Route {
        pattern: RpcPattern::Unary,
        handler: std::sync::Arc::new(move |mut call: ServerCall| {
            let Some(first) = call.recv_payload() else {
                call.complete(Status::new(Code::Internal, "request ended without a message"));
                return;
            };
            if call.recv_payload().is_some() {
                // a second DATA frame on a unary method
                call.abort(Status::new(
                    Code::Internal,
                    "more than one request message on a unary method",
                ));
                return;
            }
            let request = match deserializer(&first) {
                Ok(v) => v,
                Err(e) => {
                    call.complete(Status::new(Code::Internal, format!("decode request: {}", e)));
                    return;
                }
            };
            match handler(&call.ctx, request) {
                Ok(response) => respond_once(&mut call, &serializer, &response),
                Err(status) => call.complete(status),
            }
        }),
    }
}

/// Client-stream: the handler consumes the reader, then answers once.
pub(crate) fn client_stream_route<Req, Resp, H>(
    method: ServiceMethod<Req, Resp>, handler: H,
) -> Route
where
    Req: Send + 'static,
    Resp: Send + 'static,
    H: Fn(&ServerContext, &mut RequestReader<Req>) -> Result<Resp, Status> + Send + Sync + 'static,
{
    let deserializer = method.arg_deserializer();
    let serializer = method.return_serializer();
    Route {
        pattern: RpcPattern::ClientStream,
        handler: std::sync::Arc::new(move |mut call: ServerCall| {
            let mut reader = call.reader(deserializer.clone());
            match handler(&call.ctx, &mut reader) {
                Ok(response) => respond_once(&mut call, &serializer, &response),
                Err(status) => call.complete(status),
            }
        }),
    }
}

/// Server-stream: one request, the half-close, then the handler drives the
/// sink.
pub(crate) fn server_stream_route<Req, Resp, H>(
    method: ServiceMethod<Req, Resp>, handler: H,
) -> Route
where
    Req: Send + 'static,
    Resp: Send + 'static,
    H: Fn(&ServerContext, Req, &ResponseSink<Resp>) -> Result<(), Status> + Send + Sync + 'static,
{
    let deserializer = method.arg_deserializer();
    let serializer = method.return_serializer();
    Route {
        pattern: RpcPattern::ServerStream,
        handler: std::sync::Arc::new(move |mut call: ServerCall| {
            let Some(first) = call.recv_payload() else {
                call.complete(Status::new(Code::Internal, "request ended without a message"));
                return;
            };
            if call.recv_payload().is_some() {
                call.abort(Status::new(
                    Code::Internal,
                    "more than one request message on a server-streaming method",
                ));
                return;
            }
            let request = match deserializer(&first) {
                Ok(v) => v,
                Err(e) => {
                    call.complete(Status::new(Code::Internal, format!("decode request: {}", e)));
                    return;
                }
            };
            let sink = call.sink(serializer.clone());
            match handler(&call.ctx, request, &sink) {
                Ok(()) => call.complete(Status::ok()),
                Err(status) => call.complete(status),
            }
        }),
    }
}

/// Bidi: reader and sink run under the handler; either side may finish
/// first.
pub(crate) fn bidi_route<Req, Resp, H>(method: ServiceMethod<Req, Resp>, handler: H) -> Route
where
    Req: Send + 'static,
    Resp: Send + 'static,
    H: Fn(&ServerContext, &mut RequestReader<Req>, &ResponseSink<Resp>) -> Result<(), Status>
        + Send
        + Sync
        + 'static,
{
    let deserializer = method.arg_deserializer();
    let serializer = method.return_serializer();
    Route {
        pattern: RpcPattern::BiStream,
        handler: std::sync::Arc::new(move |mut call: ServerCall| {
            let mut reader = call.reader(deserializer.clone());
            let sink = call.sink(serializer.clone());
            match handler(&call.ctx, &mut reader, &sink) {
                Ok(()) => call.complete(Status::ok()),
                Err(status) => call.complete(status),
            }
        }),
    }
}

fn respond_once<Resp>(call: &mut ServerCall, serializer: &SerializeFn<Resp>, response: &Resp) {
    match serializer(response) {
        Ok(payload) => {
            if call.send_payload(&payload).is_ok() {
                call.complete(Status::ok());
            }
        }
        Err(e) => {
            call.complete(Status::new(Code::Internal, format!("encode response: {}", e)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn raw_method() -> ServiceMethod<String, String> {
        ServiceMethod::new(
            "demo.Echo",
            "Say",
            Arc::new(|b: &[u8]| {
                String::from_utf8(b.to_vec())
                    .map_err(|e| triple_rpc_core::CodecError::new(e.to_string()))
            }),
            Arc::new(|v: &String| Ok(v.clone().into_bytes())),
        )
    }

    #[test]
    fn test_route_registration() {
        let mut router = Router::new();
        router
            .add("/demo.Echo/Say".to_string(), unary_route(raw_method(), |_ctx, v| Ok(v)))
            .expect("add");
        assert!(router.get("/demo.Echo/Say").is_some());
        assert!(router.get("/demo.Echo/Other").is_none());
        // duplicate registration is refused
        assert!(router
            .add("/demo.Echo/Say".to_string(), unary_route(raw_method(), |_ctx, v| Ok(v)))
            .is_err());
    }

    #[test]
    fn test_route_pattern_recorded() {
        let route = client_stream_route(raw_method(), |_ctx, reader| {
            let mut n = 0;
            while let Some(r) = reader.next() {
                if r.is_err() {
                    return Err(Status::new(Code::Internal, "decode failed"));
                }
                n += 1;
            }
            Ok(n.to_string())
        });
        assert_eq!(route.pattern, RpcPattern::ClientStream);
    }
}

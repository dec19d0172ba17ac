//! The server half of the call engine: one accepted HTTP/2 stream in, a
//! handler invocation on the worker pool, framed responses and trailers out.
//!
//! The read half decodes inbound frames into the handler's bounded queue;
//! the write half forwards handler output and owns the deadline timer.
//! Deadline, peer reset and protocol violations all fire the invocation's
//! cancel token, which is the handler's early-out signal.

use std::net::SocketAddr;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use crossfire::{mpsc, spsc, AsyncRx, AsyncTx, MAsyncRx, MAsyncTx};
use h2::server::SendResponse;
use h2::{Reason, RecvStream, SendStream};
use http::{HeaderMap, Request, Response};
use triple_rpc_core::frame::FrameDecoder;
use triple_rpc_core::status::{decode_timeout, GRPC_ENCODING, GRPC_TIMEOUT};
use triple_rpc_core::{Code, RpcPattern, ServerConfig, Status, TripleError};

use crate::context::CancelToken;
use crate::server::pool::Job;
use crate::server::router::{Router, ServerCall, ServerContext, ServerReply};
use crate::transport::{send_data, sleep_opt};

const CONTENT_TYPE_GRPC: &str = "application/grpc";
const CONTENT_TYPE_JSON: &str = "application/json";

/// Serve one accepted stream to completion.
pub(crate) async fn serve_stream(
    request: Request<RecvStream>, mut respond: SendResponse<Bytes>, router: Arc<Router>,
    pool: MAsyncTx<Job>, config: Arc<ServerConfig>, remote_addr: SocketAddr,
) {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    let content_type = parts
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let json = content_type == CONTENT_TYPE_JSON;
    let grpc = content_type.starts_with(CONTENT_TYPE_GRPC);

    if parts.method != http::Method::POST || (!json && !grpc) {
        let status = Status::new(Code::Unimplemented, format!("unsupported request for {}", path));
        fail_fast(&mut respond, status, json);
        return;
    }
    if grpc {
        if let Some(encoding) = parts.headers.get(GRPC_ENCODING) {
            if encoding.as_bytes() != b"identity" {
                reply_trailers_only(
                    &mut respond,
                    Status::new(
                        Code::Unimplemented,
                        format!("unsupported grpc-encoding {:?}", encoding),
                    ),
                );
                return;
            }
        }
    }
    let Some(route) = router.get(&path) else {
        debug!("no handler for {}", path);
        let status = Status::new(Code::Unimplemented, format!("unimplemented: {}", path));
        fail_fast(&mut respond, status, json);
        return;
    };
    if json && route.pattern != RpcPattern::Unary {
        let status = Status::new(Code::Unimplemented, "plain HTTP invocation is unary only");
        fail_fast(&mut respond, status, json);
        return;
    }
    let timeout = match parse_timeout_header(&parts.headers) {
        Ok(t) => t,
        Err(e) => {
            fail_fast(&mut respond, e.into_status(), json);
            return;
        }
    };

    let cancel = CancelToken::new();
    let ctx = ServerContext::new(
        metadata_pairs(&parts.headers),
        timeout.map(|d| Instant::now() + d),
        cancel.clone(),
        remote_addr,
    );

    let (in_tx, in_rx) = spsc::bounded_tx_async_rx_blocking::<Bytes>(config.thresholds);
    let (out_tx, out_rx) = mpsc::bounded_tx_blocking_rx_async::<ServerReply>(config.thresholds);
    let call = ServerCall::new(ctx, in_rx, out_tx, json, config.max_message_size);

    let handler = route.handler.clone();
    let job: Job = Box::new(move || handler(call));
    if pool.send(job).await.is_err() {
        fail_fast(&mut respond, Status::new(Code::Unavailable, "server closing"), json);
        return;
    }

    // read-side protocol violations surface through here so the write half
    // can answer with a status when headers were not sent yet
    let abort_status: Arc<Mutex<Option<Status>>> = Arc::new(Mutex::new(None));
    let deadline = timeout.map(|d| tokio::time::Instant::now() + d);

    let reader = ReadHalf {
        cancel: cancel.clone(),
        cancel_rx: cancel.watch(),
        abort_status: abort_status.clone(),
        json,
        max_message_size: config.max_message_size,
    };
    let writer = WriteHalf {
        cancel: cancel.clone(),
        cancel_rx: cancel.watch(),
        abort_status,
        deadline,
        json,
        content_type,
    };
    tokio::join!(reader.run(body, in_tx), writer.run(respond, out_rx));
}

struct ReadHalf {
    cancel: CancelToken,
    cancel_rx: MAsyncRx<()>,
    abort_status: Arc<Mutex<Option<Status>>>,
    json: bool,
    max_message_size: usize,
}

impl ReadHalf {
    async fn run(self, mut body: RecvStream, in_tx: AsyncTx<Bytes>) {
        let mut flow = body.flow_control().clone();
        let mut decoder = FrameDecoder::new(self.max_message_size);
        let mut json_body = BytesMut::new();
        loop {
            let chunk = tokio::select! {
                c = body.data() => c,
                _ = self.cancel_rx.recv() => return,
            };
            match chunk {
                None => break,
                Some(Err(e)) => {
                    // peer reset or connection failure; wake the handler
                    debug!("request stream failed: {}", e);
                    self.cancel.cancel();
                    return;
                }
                Some(Ok(data)) => {
                    let _ = flow.release_capacity(data.len());
                    if self.json {
                        if json_body.len() + data.len() > self.max_message_size {
                            self.abort(Status::new(Code::ResourceExhausted, "request too large"));
                            return;
                        }
                        json_body.extend_from_slice(&data);
                        continue;
                    }
                    decoder.feed(&data);
                    loop {
                        match decoder.next() {
                            Ok(Some((compressed, payload))) => {
                                if compressed {
                                    self.abort(Status::new(
                                        Code::Unimplemented,
                                        "compressed request without a configured codec",
                                    ));
                                    return;
                                }
                                let sent = tokio::select! {
                                    r = in_tx.send(payload) => r,
                                    _ = self.cancel_rx.recv() => return,
                                };
                                if sent.is_err() {
                                    // handler finished early; drain silently
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                self.abort(e.into_status());
                                return;
                            }
                        }
                    }
                }
            }
        }
        if self.json {
            let _ = in_tx.send(json_body.freeze()).await;
        } else if !decoder.is_clean() {
            self.abort(Status::new(Code::Internal, "request stream truncated"));
        }
        // dropping in_tx is the half-close the handler observes
    }

    fn abort(&self, status: Status) {
        *self.abort_status.lock().unwrap() = Some(status);
        self.cancel.cancel();
    }
}

struct WriteHalf {
    cancel: CancelToken,
    cancel_rx: MAsyncRx<()>,
    abort_status: Arc<Mutex<Option<Status>>>,
    deadline: Option<tokio::time::Instant>,
    json: bool,
    content_type: String,
}

impl WriteHalf {
    async fn run(self, mut respond: SendResponse<Bytes>, out_rx: AsyncRx<ServerReply>) {
        let mut expired = pin!(sleep_opt(self.deadline));
        let mut stream: Option<SendStream<Bytes>> = None;
        let mut json_payload: Option<Bytes> = None;
        loop {
            let item = tokio::select! {
                item = out_rx.recv() => item,
                _ = self.cancel_rx.recv() => {
                    self.on_cancelled(&mut respond, stream);
                    return;
                }
                _ = &mut expired => {
                    // same semantics as the client side: cancel the handler,
                    // reset the stream, write nothing further
                    debug!("handler deadline fired");
                    self.cancel.cancel();
                    match stream.take() {
                        Some(mut s) => s.send_reset(Reason::CANCEL),
                        None => respond.send_reset(Reason::CANCEL),
                    }
                    return;
                }
            };
            match item {
                Ok(ServerReply::Message(bytes)) => {
                    if self.json {
                        json_payload = Some(bytes);
                        continue;
                    }
                    if stream.is_none() {
                        match send_grpc_headers(&mut respond, &self.content_type) {
                            Some(s) => stream = Some(s),
                            None => {
                                self.cancel.cancel();
                                return;
                            }
                        }
                    }
                    if let Err(e) = send_data(stream.as_mut().unwrap(), bytes, false).await {
                        debug!("response write failed: {}", e);
                        self.cancel.cancel();
                        return;
                    }
                }
                Ok(ServerReply::Complete(status)) => {
                    if self.json {
                        self.reply_json(&mut respond, status, json_payload).await;
                    } else {
                        match stream {
                            Some(mut s) => {
                                let _ = s.send_trailers(status.to_trailers());
                            }
                            None => reply_trailers_only(&mut respond, status),
                        }
                    }
                    return;
                }
                Ok(ServerReply::Abort(status)) => {
                    warn!("aborting stream: {}", status);
                    self.cancel.cancel();
                    match stream.take() {
                        Some(mut s) => s.send_reset(Reason::PROTOCOL_ERROR),
                        None => respond.send_reset(Reason::PROTOCOL_ERROR),
                    }
                    return;
                }
                Err(_) => {
                    // handler side dropped every sender without completing
                    match stream.take() {
                        Some(mut s) => {
                            let _ = s.send_trailers(
                                Status::new(Code::Unknown, "handler aborted").to_trailers(),
                            );
                        }
                        None => respond.send_reset(Reason::INTERNAL_ERROR),
                    }
                    return;
                }
            }
        }
    }

    fn on_cancelled(&self, respond: &mut SendResponse<Bytes>, stream: Option<SendStream<Bytes>>) {
        let aborted = self.abort_status.lock().unwrap().take();
        match (aborted, stream) {
            // a read-side violation with headers unsent still gets a status
            (Some(status), None) => reply_trailers_only(respond, status),
            (Some(_), Some(mut s)) => s.send_reset(Reason::PROTOCOL_ERROR),
            (None, Some(mut s)) => s.send_reset(Reason::CANCEL),
            (None, None) => respond.send_reset(Reason::CANCEL),
        }
    }

    async fn reply_json(
        &self, respond: &mut SendResponse<Bytes>, status: Status, payload: Option<Bytes>,
    ) {
        let http_status = status.to_http_code();
        let body = if status.is_ok() {
            payload.unwrap_or_default()
        } else {
            Bytes::copy_from_slice(status.message().unwrap_or("").as_bytes())
        };
        let response = match Response::builder()
            .status(http_status)
            .header(http::header::CONTENT_TYPE, CONTENT_TYPE_JSON)
            .body(())
        {
            Ok(r) => r,
            Err(_) => {
                respond.send_reset(Reason::INTERNAL_ERROR);
                return;
            }
        };
        match respond.send_response(response, body.is_empty()) {
            Ok(mut stream) => {
                if !body.is_empty() {
                    let _ = send_data(&mut stream, body, true).await;
                }
            }
            Err(e) => debug!("json response failed: {}", e),
        }
    }
}

fn send_grpc_headers(
    respond: &mut SendResponse<Bytes>, content_type: &str,
) -> Option<SendStream<Bytes>> {
    let response = Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, content_type)
        .body(())
        .ok()?;
    match respond.send_response(response, false) {
        Ok(stream) => Some(stream),
        Err(e) => {
            debug!("response headers failed: {}", e);
            None
        }
    }
}

/// Fail-fast reply before any handler ran: trailers-only for gRPC callers,
/// a mapped HTTP status for plain JSON callers.
fn fail_fast(respond: &mut SendResponse<Bytes>, status: Status, json: bool) {
    if !json {
        reply_trailers_only(respond, status);
        return;
    }
    let response = Response::builder()
        .status(status.to_http_code())
        .header(http::header::CONTENT_TYPE, CONTENT_TYPE_JSON)
        .body(());
    match response {
        Ok(response) => {
            let _ = respond.send_response(response, true);
        }
        Err(_) => respond.send_reset(Reason::INTERNAL_ERROR),
    }
}

/// Trailers-only response: the header block carries the status and ends the
/// stream.
fn reply_trailers_only(respond: &mut SendResponse<Bytes>, status: Status) {
    let mut builder = Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, CONTENT_TYPE_GRPC);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(status.to_trailers());
    }
    match builder.body(()) {
        Ok(response) => {
            let _ = respond.send_response(response, true);
        }
        Err(_) => respond.send_reset(Reason::INTERNAL_ERROR),
    }
}

/// The server side of the timeout negotiation.
fn parse_timeout_header(headers: &HeaderMap) -> Result<Option<Duration>, TripleError> {
    match headers.get(GRPC_TIMEOUT) {
        None => Ok(None),
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| TripleError::MalformedHeaders("grpc-timeout not ascii".to_string()))?;
            decode_timeout(raw).map(Some)
        }
    }
}

/// Request metadata: everything except pseudo-headers and hop-level fields.
fn metadata_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            name != "te" && name != "content-type" && name != "user-agent"
        })
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

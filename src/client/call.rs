//! The client half of the call engine.
//!
//! One loop task per call drives both directions of the HTTP/2 stream. The
//! sender half pulls framed messages off the outbound queue and writes DATA
//! under flow control; the receiver half decodes inbound frames into the
//! inbound queue and finally parses trailers. Cancellation, the deadline and
//! transport failures all converge on [CallState::finish]: exactly one
//! terminal status wins, the done channel closes, and both queues unblock.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossfire::{spsc, AsyncRx, AsyncTx, MAsyncRx, Rx, Tx};
use h2::client::ResponseFuture;
use h2::{Reason, SendStream};
use triple_rpc_core::frame::FrameDecoder;
use triple_rpc_core::status::{
    encode_timeout, GRPC_ENCODING, GRPC_TIMEOUT, SERVICE_GROUP, SERVICE_VERSION,
};
use triple_rpc_core::{ClientConfig, Code, Endpoint, Status, TripleError};

use crate::context::{CallState, CancelToken};
use crate::transport::{h2_error_status, send_data, sleep_opt, Connector, Driver};

/// Everything needed to open one stream.
pub(crate) struct RequestMetadata {
    pub path: String,
    pub content_type: String,
    pub timeout: Option<Duration>,
    pub attachments: Vec<(String, String)>,
    pub group: Option<String>,
    pub version: Option<String>,
}

/// The caller-thread ends of a running call.
pub(crate) struct ClientCall {
    pub out_tx: Tx<Bytes>,
    pub in_rx: Rx<Bytes>,
    pub state: Arc<CallState>,
    pub cancel: CancelToken,
}

pub(crate) fn start_call(
    driver: &Arc<Driver>, connector: Connector, endpoint: Endpoint, meta: RequestMetadata,
    config: &ClientConfig,
) -> ClientCall {
    let (out_tx, out_rx) = spsc::bounded_tx_blocking_rx_async::<Bytes>(config.thresholds);
    let (in_tx, in_rx) = spsc::bounded_tx_async_rx_blocking::<Bytes>(config.thresholds);
    let state = CallState::new();
    let cancel = CancelToken::new();

    let timeout = meta.timeout.or(config.timeout.call_timeout);
    let max_message_size = config.max_message_size;
    let task = RunningCall {
        connector,
        endpoint,
        meta,
        timeout,
        state: state.clone(),
        cancel_rx: cancel.watch(),
        max_message_size,
    };
    driver.spawn(task.run(out_rx, in_tx));

    ClientCall { out_tx, in_rx, state, cancel }
}

struct RunningCall {
    connector: Connector,
    endpoint: Endpoint,
    meta: RequestMetadata,
    timeout: Option<Duration>,
    state: Arc<CallState>,
    cancel_rx: MAsyncRx<()>,
    max_message_size: usize,
}

impl RunningCall {
    async fn run(self, out_rx: AsyncRx<Bytes>, in_tx: AsyncTx<Bytes>) {
        let deadline = self.timeout.map(|d| tokio::time::Instant::now() + d);
        let stream = match self.open_stream(deadline).await {
            Some(pair) => pair,
            None => return,
        };
        let (response, send_stream) = stream;
        let sender = SendHalf {
            state: self.state.clone(),
            cancel_rx: self.cancel_rx.clone(),
            stream: send_stream,
        };
        let receiver = RecvHalf {
            state: self.state.clone(),
            cancel_rx: self.cancel_rx.clone(),
            deadline,
            max_message_size: self.max_message_size,
        };
        tokio::join!(sender.run(out_rx), receiver.run(response, in_tx));
    }

    /// Resolve the connection and open the stream, guarded by the deadline
    /// and cancellation. None means the call already finished.
    async fn open_stream(
        &self, deadline: Option<tokio::time::Instant>,
    ) -> Option<(ResponseFuture, SendStream<Bytes>)> {
        let mut expired = pin!(sleep_opt(deadline));
        let authority = self.endpoint.authority();

        let setup = async {
            let channel = self.connector.channel(&authority).await?;
            let handle = channel.handle();
            let handle = handle.ready().await.map_err(|e| crate::transport::h2_error(&e))?;
            Ok::<_, TripleError>(handle)
        };
        let handle = tokio::select! {
            r = setup => match r {
                Ok(h) => h,
                Err(e) => {
                    warn!("{} open {} failed: {}", authority, self.meta.path, e);
                    self.state.finish(e.into_status());
                    return None;
                }
            },
            _ = self.cancel_rx.recv() => {
                self.state.finish(Status::new(Code::Cancelled, "cancelled by caller"));
                return None;
            }
            _ = &mut expired => {
                self.state.finish(Status::with_code(Code::DeadlineExceeded));
                return None;
            }
        };

        let request = match self.build_request() {
            Ok(r) => r,
            Err(e) => {
                self.state.finish(e.into_status());
                return None;
            }
        };
        let mut handle = handle;
        match handle.send_request(request, false) {
            Ok(pair) => Some(pair),
            Err(e) => {
                self.state.finish(h2_error_status(&e));
                None
            }
        }
    }

    fn build_request(&self) -> Result<http::Request<()>, TripleError> {
        let uri = format!("http://{}{}", self.endpoint.authority(), self.meta.path);
        let mut builder = http::Request::builder()
            .method(http::Method::POST)
            .uri(&uri)
            .version(http::Version::HTTP_2)
            .header(http::header::CONTENT_TYPE, &self.meta.content_type)
            .header("te", "trailers")
            .header(
                http::header::USER_AGENT,
                concat!("triple-rpc/", env!("CARGO_PKG_VERSION")),
            );
        if let Some(timeout) = self.timeout {
            builder = builder.header(GRPC_TIMEOUT, encode_timeout(timeout));
        }
        if let Some(group) = self.meta.group.as_deref() {
            builder = builder.header(SERVICE_GROUP, group);
        }
        if let Some(version) = self.meta.version.as_deref() {
            builder = builder.header(SERVICE_VERSION, version);
        }
        for (name, value) in self.meta.attachments.iter() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder.body(()).map_err(|e| TripleError::MalformedHeaders(e.to_string()))
    }
}

struct SendHalf {
    state: Arc<CallState>,
    cancel_rx: MAsyncRx<()>,
    stream: SendStream<Bytes>,
}

impl SendHalf {
    /// Forward outbound frames until the producer half-closes, then stay
    /// around to reset the stream if the call ends abnormally.
    async fn run(mut self, out_rx: AsyncRx<Bytes>) {
        let done_rx = self.state.done_watch();
        let mut open = true;
        loop {
            if open {
                tokio::select! {
                    item = out_rx.recv() => match item {
                        Ok(frame) => {
                            if let Err(e) = send_data(&mut self.stream, frame, false).await {
                                self.state.finish(e.into_status());
                                self.stream.send_reset(Reason::CANCEL);
                                return;
                            }
                        }
                        Err(_) => {
                            // producer closed the outbound half
                            if let Err(e) = send_data(&mut self.stream, Bytes::new(), true).await {
                                self.state.finish(e.into_status());
                                return;
                            }
                            open = false;
                        }
                    },
                    _ = done_rx.recv() => break,
                    _ = self.cancel_rx.recv() => break,
                }
            } else {
                tokio::select! {
                    _ = done_rx.recv() => break,
                    _ = self.cancel_rx.recv() => break,
                }
            }
        }
        if self.state.finish(Status::new(Code::Cancelled, "cancelled by caller")) {
            // cancellation observed before any terminal status
            self.stream.send_reset(Reason::CANCEL);
            return;
        }
        let status = self.state.status();
        if status.is_ok() {
            if open {
                // server finished first with the outbound half still open
                let _ = self.stream.send_data(Bytes::new(), true);
            }
        } else {
            self.stream.send_reset(Reason::CANCEL);
        }
    }
}

struct RecvHalf {
    state: Arc<CallState>,
    cancel_rx: MAsyncRx<()>,
    deadline: Option<tokio::time::Instant>,
    max_message_size: usize,
}

impl RecvHalf {
    async fn run(self, response: ResponseFuture, in_tx: AsyncTx<Bytes>) {
        let done_rx = self.state.done_watch();
        let mut expired = pin!(sleep_opt(self.deadline));

        macro_rules! guarded {
            ($fut:expr) => {
                tokio::select! {
                    r = $fut => Some(r),
                    _ = done_rx.recv() => None,
                    _ = self.cancel_rx.recv() => {
                        self.state.finish(Status::new(Code::Cancelled, "cancelled by caller"));
                        None
                    }
                    _ = &mut expired => {
                        self.state.finish(Status::with_code(Code::DeadlineExceeded));
                        None
                    }
                }
            };
        }

        let Some(response) = guarded!(response) else { return };
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.state.finish(h2_error_status(&e));
                return;
            }
        };
        let (parts, mut body) = response.into_parts();
        self.state.set_response_metadata(parts.headers.clone());
        if parts.status != http::StatusCode::OK {
            self.state.finish(Status::from_http_code(parts.status.as_u16()));
            return;
        }
        // a trailers-only response carries the status in the header block
        if let Some(status) = Status::from_trailers(&parts.headers) {
            self.state.set_trailers(parts.headers);
            self.state.finish(status);
            return;
        }
        if let Some(encoding) = parts.headers.get(GRPC_ENCODING) {
            if encoding.as_bytes() != b"identity" {
                self.state.finish(Status::new(
                    Code::Unimplemented,
                    format!("unsupported grpc-encoding {:?}", encoding),
                ));
                return;
            }
        }

        let mut decoder = FrameDecoder::new(self.max_message_size);
        let mut flow = body.flow_control().clone();
        loop {
            let Some(chunk) = guarded!(body.data()) else { return };
            match chunk {
                None => break,
                Some(Err(e)) => {
                    self.state.finish(h2_error_status(&e));
                    return;
                }
                Some(Ok(data)) => {
                    let _ = flow.release_capacity(data.len());
                    decoder.feed(&data);
                    loop {
                        match decoder.next() {
                            Ok(Some((compressed, payload))) => {
                                if compressed {
                                    self.state.finish(Status::new(
                                        Code::Unimplemented,
                                        "compressed message received without a configured codec",
                                    ));
                                    return;
                                }
                                let Some(sent) = guarded!(in_tx.send(payload)) else { return };
                                if sent.is_err() {
                                    // consumer dropped the reader
                                    self.state
                                        .finish(Status::new(Code::Cancelled, "consumer gone"));
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                self.state.finish(e.into_status());
                                return;
                            }
                        }
                    }
                }
            }
        }
        if !decoder.is_clean() {
            self.state.finish(Status::new(Code::Internal, "message stream truncated"));
            return;
        }

        let Some(trailers) = guarded!(body.trailers()) else { return };
        match trailers {
            Ok(Some(trailers)) => {
                let status = Status::from_trailers(&trailers).unwrap_or_else(|| {
                    Status::new(Code::Unknown, "missing grpc-status in trailers")
                });
                self.state.set_trailers(trailers);
                self.state.finish(status);
            }
            Ok(None) => {
                self.state.finish(Status::new(Code::Unknown, "stream ended without trailers"));
            }
            Err(e) => {
                self.state.finish(h2_error_status(&e));
            }
        }
    }
}

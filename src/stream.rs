//! Caller-facing stream halves.
//!
//! The producer side is a push-style writer: [RequestSink::send] serializes
//! and frames on the caller thread, then blocking-sends into the call's
//! bounded outbound queue (the backpressure point). The consumer side is a
//! pull-style reader: [ResponseReader::next_message] blocks until a message,
//! the end of the stream, or a failure is observable.

use std::sync::Arc;

use bytes::Bytes;
use crossfire::{Rx, Tx};
use triple_rpc_core::frame::encode_frame;
use triple_rpc_core::{Code, DeserializeFn, SerializeFn, Status, TripleError};

use crate::context::{CallState, CancelToken};

/// Outbound half of a client call.
pub struct RequestSink<Req> {
    tx: Option<Tx<Bytes>>,
    serializer: SerializeFn<Req>,
    state: Arc<CallState>,
    cancel: CancelToken,
    max_message_size: usize,
}

impl<Req> RequestSink<Req> {
    pub(crate) fn new(
        tx: Tx<Bytes>, serializer: SerializeFn<Req>, state: Arc<CallState>, cancel: CancelToken,
        max_message_size: usize,
    ) -> Self {
        Self { tx: Some(tx), serializer, state, cancel, max_message_size }
    }

    /// Serialize, frame and enqueue one message. Blocks while the outbound
    /// queue is full.
    pub fn send(&self, value: &Req) -> Result<(), TripleError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(TripleError::IllegalState("send on a closed outbound half"));
        };
        let payload = (self.serializer)(value)?;
        let frame = encode_frame(&payload, false, self.max_message_size)?;
        tx.send(frame).map_err(|_| self.terminal_error())
    }

    /// Half-close the outbound direction. Idempotent; the inbound half stays
    /// usable.
    pub fn close(&mut self) {
        self.tx.take();
    }

    /// Cancel the whole call.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn terminal_error(&self) -> TripleError {
        match TripleError::from_status(self.state.status()) {
            Some(e) => e,
            // the call completed OK while we were still producing
            None => TripleError::IllegalState("call already completed"),
        }
    }
}

/// Inbound half of a client call: a lazy, finite sequence of messages.
pub struct ResponseReader<Resp> {
    rx: Rx<Bytes>,
    deserializer: DeserializeFn<Resp>,
    state: Arc<CallState>,
    cancel: CancelToken,
    finished: bool,
}

impl<Resp> ResponseReader<Resp> {
    pub(crate) fn new(
        rx: Rx<Bytes>, deserializer: DeserializeFn<Resp>, state: Arc<CallState>,
        cancel: CancelToken,
    ) -> Self {
        Self { rx, deserializer, state, cancel, finished: false }
    }

    /// The next message, `Ok(None)` at a clean end of stream, or the call's
    /// terminal error. After cancellation no further message is delivered,
    /// even if some were already queued.
    pub fn next_message(&mut self) -> Result<Option<Resp>, TripleError> {
        if self.finished {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            self.finished = true;
            // the loop task may not have recorded the terminal status yet
            if !self.state.is_finished() {
                return Err(TripleError::Cancelled);
            }
            return Err(self.terminal_error());
        }
        match self.rx.recv() {
            Ok(payload) => match (self.deserializer)(&payload) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    self.finished = true;
                    self.abort(Status::new(Code::Internal, format!("decode response: {}", e)));
                    Err(e.into())
                }
            },
            Err(_) => {
                self.finished = true;
                match TripleError::from_status(self.state.status()) {
                    None => Ok(None),
                    Some(e) => Err(e),
                }
            }
        }
    }

    /// Cancel the whole call.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Response headers, available once the first message (or the end of the
    /// stream) was observed.
    pub fn metadata(&self) -> Vec<(String, String)> {
        self.state.response_metadata()
    }

    /// Trailers, available after the end of the stream.
    pub fn trailers(&self) -> Vec<(String, String)> {
        self.state.trailers()
    }

    pub(crate) fn abort(&self, status: Status) {
        self.state.finish(status);
        self.cancel.cancel();
    }

    fn terminal_error(&self) -> TripleError {
        TripleError::from_status(self.state.status()).unwrap_or(TripleError::Cancelled)
    }
}

impl<Resp> Iterator for ResponseReader<Resp> {
    type Item = Result<Resp, TripleError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_message() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// The single-response contract of unary and client-streaming calls.
pub struct UnaryResponse<Resp> {
    reader: ResponseReader<Resp>,
}

impl<Resp> UnaryResponse<Resp> {
    pub(crate) fn new(reader: ResponseReader<Resp>) -> Self {
        Self { reader }
    }

    /// Block until the single response arrives. Zero or more than one
    /// message from the peer is a contract violation surfaced as `Internal`,
    /// and the extra-message case resets the stream.
    pub fn wait(mut self) -> Result<Resp, TripleError> {
        let Some(value) = self.reader.next_message()? else {
            return Err(TripleError::Status(Status::new(
                Code::Internal,
                "stream ended without a response message",
            )));
        };
        match self.reader.next_message() {
            Ok(None) => Ok(value),
            Err(e) => Err(e),
            Ok(Some(_)) => {
                let status =
                    Status::new(Code::Internal, "more than one response message on a unary call");
                self.reader.abort(status.clone());
                Err(TripleError::Status(status))
            }
        }
    }

    pub fn metadata(&self) -> Vec<(String, String)> {
        self.reader.metadata()
    }
}

//! Domain-level error kinds, distinct from wire status codes.
//!
//! Local resets only happen for protocol violations and cancellation; every
//! other failure flows through the call's status slot, so a call always ends
//! either with a value or with a populated [Status].

use std::fmt;

use crate::status::{Code, Status};

/// Raised by a user serializer or deserializer.
#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct CodecError(pub String);

impl CodecError {
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(thiserror::Error)]
pub enum TripleError {
    /// Frame prefix violated (reserved bits, oversized length).
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("malformed headers: {0}")]
    MalformedHeaders(String),
    #[error("malformed trailers: {0}")]
    MalformedTrailers(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// Connection reset, unreachable peer, handshake failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The call deadline fired locally.
    #[error("deadline exceeded")]
    Timeout,
    /// Cancelled by the caller or by the peer.
    #[error("cancelled")]
    Cancelled,
    /// The directory is empty past the staleness grace window.
    #[error("no available provider for {0}")]
    NoAvailableProvider(String),
    /// API misuse, raised locally and never sent on the wire.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// A non-OK status received from the peer.
    #[error("{0}")]
    Status(Status),
}

impl fmt::Debug for TripleError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl TripleError {
    /// The status code this failure surfaces as.
    pub fn code(&self) -> Code {
        match self {
            Self::MalformedFrame(_) | Self::MalformedHeaders(_) | Self::MalformedTrailers(_) => {
                Code::Internal
            }
            Self::Codec(_) => Code::Internal,
            Self::Transport(_) => Code::Unavailable,
            Self::Timeout => Code::DeadlineExceeded,
            Self::Cancelled => Code::Cancelled,
            Self::NoAvailableProvider(_) => Code::Unavailable,
            Self::IllegalState(_) => Code::Internal,
            Self::InvalidUrl(_) => Code::InvalidArgument,
            Self::Status(s) => s.code(),
        }
    }

    pub fn into_status(self) -> Status {
        match self {
            Self::Status(s) => s,
            other => Status::new(other.code(), other.to_string()),
        }
    }

    /// The inverse direction: a received terminal status becomes the error
    /// the caller observes. Cancel and deadline keep their dedicated kinds so
    /// callers can match on them without digging into the code.
    pub fn from_status(status: Status) -> Option<TripleError> {
        match status.code() {
            Code::Ok => None,
            Code::Cancelled => Some(TripleError::Cancelled),
            Code::DeadlineExceeded => Some(TripleError::Timeout),
            _ => Some(TripleError::Status(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(TripleError::Timeout.code(), Code::DeadlineExceeded);
        assert_eq!(TripleError::Cancelled.code(), Code::Cancelled);
        assert_eq!(TripleError::Transport("reset".into()).code(), Code::Unavailable);
        assert_eq!(TripleError::MalformedFrame("len".into()).code(), Code::Internal);
        assert_eq!(TripleError::NoAvailableProvider("svc".into()).code(), Code::Unavailable);
    }

    #[test]
    fn test_status_round_trip() {
        let st = Status::new(Code::NotFound, "no such thing");
        let e = TripleError::from_status(st.clone()).expect("err");
        assert_eq!(e.into_status(), st);
        assert!(TripleError::from_status(Status::ok()).is_none());
        assert!(matches!(
            TripleError::from_status(Status::with_code(Code::DeadlineExceeded)),
            Some(TripleError::Timeout)
        ));
    }
}

//! Call status and the wire headers that carry it.
//!
//! A status is what every call terminates with: a numeric code aligned with
//! gRPC plus an optional message. On the wire it travels in the
//! `grpc-status` / `grpc-message` trailers; the deadline travels in the
//! `grpc-timeout` request header.

use std::fmt;
use std::time::Duration;

use http::{HeaderMap, HeaderValue};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::error::TripleError;

pub const GRPC_STATUS: &str = "grpc-status";
pub const GRPC_MESSAGE: &str = "grpc-message";
pub const GRPC_TIMEOUT: &str = "grpc-timeout";
pub const GRPC_ENCODING: &str = "grpc-encoding";
pub const SERVICE_GROUP: &str = "tri-service-group";
pub const SERVICE_VERSION: &str = "tri-service-version";

/// `grpc-message` keeps printable ASCII except `%`; everything else is
/// percent-encoded as UTF-8.
const MESSAGE_ESCAPES: &AsciiSet = &CONTROLS.add(b'%').add(b'\x7f');

/// Status codes, numerically aligned with gRPC.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Hash,
)]
#[repr(u8)]
pub enum Code {
    #[strum(serialize = "OK")]
    Ok = 0,
    #[strum(serialize = "CANCELLED")]
    Cancelled = 1,
    #[strum(serialize = "UNKNOWN")]
    Unknown = 2,
    #[strum(serialize = "INVALID_ARGUMENT")]
    InvalidArgument = 3,
    #[strum(serialize = "DEADLINE_EXCEEDED")]
    DeadlineExceeded = 4,
    #[strum(serialize = "NOT_FOUND")]
    NotFound = 5,
    #[strum(serialize = "ALREADY_EXISTS")]
    AlreadyExists = 6,
    #[strum(serialize = "PERMISSION_DENIED")]
    PermissionDenied = 7,
    #[strum(serialize = "RESOURCE_EXHAUSTED")]
    ResourceExhausted = 8,
    #[strum(serialize = "FAILED_PRECONDITION")]
    FailedPrecondition = 9,
    #[strum(serialize = "ABORTED")]
    Aborted = 10,
    #[strum(serialize = "OUT_OF_RANGE")]
    OutOfRange = 11,
    #[strum(serialize = "UNIMPLEMENTED")]
    Unimplemented = 12,
    #[strum(serialize = "INTERNAL")]
    Internal = 13,
    #[strum(serialize = "UNAVAILABLE")]
    Unavailable = 14,
    #[strum(serialize = "DATA_LOSS")]
    DataLoss = 15,
    #[strum(serialize = "UNAUTHENTICATED")]
    Unauthenticated = 16,
}

// strum only customizes Display, keep Debug consistent with it
impl fmt::Debug for Code {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Code {
    /// Numeric wire form carried in `grpc-status`.
    #[inline]
    pub fn value(&self) -> i32 {
        *self as i32
    }

    /// An unrecognized numeric code decodes as `Unknown`.
    pub fn from_value(v: i32) -> Code {
        match v {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }
}

/// The terminal status of a call.
#[derive(Clone, PartialEq)]
pub struct Status {
    code: Code,
    message: Option<String>,
}

impl Status {
    #[inline]
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self { code, message: Some(message.into()) }
    }

    #[inline]
    pub fn with_code(code: Code) -> Self {
        Self { code, message: None }
    }

    #[inline]
    pub fn ok() -> Self {
        Self::with_code(Code::Ok)
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    #[inline]
    pub fn code(&self) -> Code {
        self.code
    }

    #[inline]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Render into the `grpc-status` / `grpc-message` trailer pair.
    pub fn to_trailers(&self) -> HeaderMap {
        let mut trailers = HeaderMap::with_capacity(2);
        trailers.insert(GRPC_STATUS, HeaderValue::from(self.code.value()));
        if let Some(msg) = self.message.as_deref() {
            if !msg.is_empty() {
                let encoded = utf8_percent_encode(msg, MESSAGE_ESCAPES).to_string();
                // encoded form is printable ASCII, from_str cannot fail here
                if let Ok(v) = HeaderValue::from_str(&encoded) {
                    trailers.insert(GRPC_MESSAGE, v);
                }
            }
        }
        trailers
    }

    /// Extract a status from received trailers (or a trailers-only header
    /// block). Returns None when `grpc-status` is absent.
    pub fn from_trailers(trailers: &HeaderMap) -> Option<Status> {
        let raw = trailers.get(GRPC_STATUS)?.to_str().ok()?;
        let code = Code::from_value(raw.parse::<i32>().ok()?);
        let message = trailers
            .get(GRPC_MESSAGE)
            .and_then(|v| v.to_str().ok())
            .map(|v| percent_decode_str(v).decode_utf8_lossy().into_owned());
        Some(Status { code, message })
    }

    /// Synthesize a status from a non-200 HTTP response (or any response
    /// without `grpc-status`).
    pub fn from_http_code(http_status: u16) -> Status {
        let code = match http_status {
            100..=199 | 400 | 431 => Code::Internal,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::NotFound,
            429 | 502 | 503 | 504 => Code::Unavailable,
            _ => Code::Unknown,
        };
        Status::new(code, format!("http status {}", http_status))
    }

    /// HTTP status used by the plain HTTP/JSON surface.
    pub fn to_http_code(&self) -> u16 {
        match self.code {
            Code::Ok => 200,
            Code::InvalidArgument => 400,
            Code::Unauthenticated => 401,
            Code::PermissionDenied => 403,
            Code::NotFound => 404,
            Code::Unavailable => 503,
            Code::DeadlineExceeded => 504,
            _ => 500,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.message.as_deref() {
            Some(m) => write!(f, "{}: {}", self.code, m),
            None => write!(f, "{}", self.code),
        }
    }
}

impl fmt::Debug for Status {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<Code> for Status {
    #[inline]
    fn from(code: Code) -> Self {
        Status::with_code(code)
    }
}

/// `grpc-timeout` value limit: at most 8 ASCII digits.
const TIMEOUT_MAX_VALUE: u128 = 99_999_999;

/// Encode a deadline as `<value><unit>`, choosing the smallest unit whose
/// value still fits in 8 digits.
pub fn encode_timeout(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos <= TIMEOUT_MAX_VALUE {
        return format!("{}n", nanos);
    }
    let micros = nanos / 1_000;
    if micros <= TIMEOUT_MAX_VALUE {
        return format!("{}u", micros);
    }
    let millis = micros / 1_000;
    if millis <= TIMEOUT_MAX_VALUE {
        return format!("{}m", millis);
    }
    let secs = millis / 1_000;
    if secs <= TIMEOUT_MAX_VALUE {
        return format!("{}S", secs);
    }
    let mins = secs / 60;
    if mins <= TIMEOUT_MAX_VALUE {
        return format!("{}M", mins);
    }
    let hours = mins / 60;
    format!("{}H", hours.min(TIMEOUT_MAX_VALUE))
}

pub fn decode_timeout(s: &str) -> Result<Duration, TripleError> {
    if s.len() < 2 || s.len() > 9 {
        return Err(TripleError::MalformedHeaders(format!("bad grpc-timeout {:?}", s)));
    }
    let (digits, unit) = s.split_at(s.len() - 1);
    let value: u64 = digits
        .parse()
        .map_err(|_| TripleError::MalformedHeaders(format!("bad grpc-timeout {:?}", s)))?;
    let d = match unit {
        "n" => Duration::from_nanos(value),
        "u" => Duration::from_micros(value),
        "m" => Duration::from_millis(value),
        "S" => Duration::from_secs(value),
        "M" => Duration::from_secs(value * 60),
        "H" => Duration::from_secs(value * 3600),
        _ => {
            return Err(TripleError::MalformedHeaders(format!("bad grpc-timeout unit {:?}", unit)));
        }
    };
    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_numeric() {
        assert_eq!(Code::Ok.value(), 0);
        assert_eq!(Code::Unauthenticated.value(), 16);
        assert_eq!(Code::from_value(14), Code::Unavailable);
        // out of range collapses to Unknown
        assert_eq!(Code::from_value(99), Code::Unknown);
        assert_eq!(Code::from_value(-1), Code::Unknown);
    }

    #[test]
    fn test_trailers_round_trip() {
        let st = Status::new(Code::ResourceExhausted, "too many requests");
        let t = st.to_trailers();
        let back = Status::from_trailers(&t).expect("status");
        assert_eq!(back, st);

        let st = Status::ok();
        let back = Status::from_trailers(&st.to_trailers()).expect("status");
        assert!(back.is_ok());
        assert_eq!(back.message(), None);
    }

    #[test]
    fn test_message_percent_encoding() {
        let st = Status::new(Code::Internal, "bad % value\nnächste zeile");
        let t = st.to_trailers();
        let raw = t.get(GRPC_MESSAGE).unwrap().to_str().unwrap();
        assert!(!raw.contains('\n'));
        assert!(raw.contains("%25"));
        let back = Status::from_trailers(&t).unwrap();
        assert_eq!(back.message(), st.message());
    }

    #[test]
    fn test_missing_status_header() {
        let t = HeaderMap::new();
        assert!(Status::from_trailers(&t).is_none());
    }

    #[test]
    fn test_timeout_round_trip() {
        for (d, s) in [
            (Duration::from_nanos(0), "0n"),
            (Duration::from_nanos(99_999_999), "99999999n"),
            (Duration::from_micros(100_000), "100000u"),
            (Duration::from_millis(50), "50000u"),
            (Duration::from_secs(20), "20000000u"),
            (Duration::from_secs(100_000), "100000S"),
        ] {
            assert_eq!(encode_timeout(d), s);
            assert_eq!(decode_timeout(s).expect("decode"), d);
        }
        // unit boundary: just over 8 digits of nanos moves to micros
        assert_eq!(encode_timeout(Duration::from_nanos(100_000_000)), "100000u");
    }

    #[test]
    fn test_timeout_decode_rejects() {
        assert!(decode_timeout("").is_err());
        assert!(decode_timeout("m").is_err());
        assert!(decode_timeout("123456789S").is_err());
        assert!(decode_timeout("12x").is_err());
        assert!(decode_timeout("-5m").is_err());
    }

    #[test]
    fn test_http_mapping() {
        assert_eq!(Status::from_http_code(401).code(), Code::Unauthenticated);
        assert_eq!(Status::from_http_code(503).code(), Code::Unavailable);
        assert_eq!(Status::from_http_code(418).code(), Code::Unknown);
        assert_eq!(Status::with_code(Code::DeadlineExceeded).to_http_code(), 504);
        assert_eq!(Status::ok().to_http_code(), 200);
        assert_eq!(Status::with_code(Code::Aborted).to_http_code(), 500);
    }
}

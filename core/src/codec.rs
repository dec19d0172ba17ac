//! The codec boundary: user-supplied (serialize, deserialize) function pairs
//! held per method.
//!
//! The call engine is parametric over these holders and never inspects the
//! value type. Multi-argument calls are a codec concern: the request type is
//! an opaque bundle (typically a tuple) and the serializer owns packing.

use std::fmt;
use std::sync::Arc;

use crate::error::CodecError;

pub type SerializeFn<T> = Arc<dyn Fn(&T) -> Result<Vec<u8>, CodecError> + Send + Sync>;
pub type DeserializeFn<T> = Arc<dyn Fn(&[u8]) -> Result<T, CodecError> + Send + Sync>;

/// The four call shapes. Each variant pins the exact handler signature the
/// server router expects.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RpcPattern {
    Unary,
    ClientStream,
    ServerStream,
    BiStream,
}

impl RpcPattern {
    #[inline]
    pub fn client_streaming(&self) -> bool {
        matches!(self, Self::ClientStream | Self::BiStream)
    }

    #[inline]
    pub fn server_streaming(&self) -> bool {
        matches!(self, Self::ServerStream | Self::BiStream)
    }
}

impl fmt::Display for RpcPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Unary => "Unary",
            Self::ClientStream => "ClientStream",
            Self::ServerStream => "ServerStream",
            Self::BiStream => "BiStream",
        };
        write!(f, "{}", name)
    }
}

/// Client-side view of a remote operation: how to reach it and how to encode
/// the argument / decode the return value.
pub struct MethodDescriptor<Req, Resp> {
    service: String,
    method: String,
    pattern: RpcPattern,
    codec_name: String,
    arg_serializer: SerializeFn<Req>,
    return_deserializer: DeserializeFn<Resp>,
}

impl<Req, Resp> MethodDescriptor<Req, Resp> {
    pub fn new(
        service: impl Into<String>, method: impl Into<String>, pattern: RpcPattern,
        codec_name: impl Into<String>, arg_serializer: SerializeFn<Req>,
        return_deserializer: DeserializeFn<Resp>,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            pattern,
            codec_name: codec_name.into(),
            arg_serializer,
            return_deserializer,
        }
    }

    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[inline]
    pub fn pattern(&self) -> RpcPattern {
        self.pattern
    }

    #[inline]
    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    #[inline]
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }

    #[inline]
    pub fn content_type(&self) -> String {
        format!("application/grpc+{}", self.codec_name)
    }

    #[inline]
    pub fn serialize_arg(&self, value: &Req) -> Result<Vec<u8>, CodecError> {
        (self.arg_serializer)(value)
    }

    #[inline]
    pub fn deserialize_return(&self, buf: &[u8]) -> Result<Resp, CodecError> {
        (self.return_deserializer)(buf)
    }

    #[inline]
    pub fn arg_serializer(&self) -> SerializeFn<Req> {
        self.arg_serializer.clone()
    }

    #[inline]
    pub fn return_deserializer(&self) -> DeserializeFn<Resp> {
        self.return_deserializer.clone()
    }
}

impl<Req, Resp> Clone for MethodDescriptor<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            method: self.method.clone(),
            pattern: self.pattern,
            codec_name: self.codec_name.clone(),
            arg_serializer: self.arg_serializer.clone(),
            return_deserializer: self.return_deserializer.clone(),
        }
    }
}

impl<Req, Resp> fmt::Debug for MethodDescriptor<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} /{}/{}", self.pattern, self.service, self.method)
    }
}

/// Server-side inverse of [MethodDescriptor]: decode the argument, encode the
/// return value. The pattern is pinned by the registration call on the
/// server, not stored here.
pub struct ServiceMethod<Req, Resp> {
    service: String,
    method: String,
    arg_deserializer: DeserializeFn<Req>,
    return_serializer: SerializeFn<Resp>,
}

impl<Req, Resp> ServiceMethod<Req, Resp> {
    pub fn new(
        service: impl Into<String>, method: impl Into<String>,
        arg_deserializer: DeserializeFn<Req>, return_serializer: SerializeFn<Resp>,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            arg_deserializer,
            return_serializer,
        }
    }

    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[inline]
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }

    #[inline]
    pub fn deserialize_arg(&self, buf: &[u8]) -> Result<Req, CodecError> {
        (self.arg_deserializer)(buf)
    }

    #[inline]
    pub fn serialize_return(&self, value: &Resp) -> Result<Vec<u8>, CodecError> {
        (self.return_serializer)(value)
    }

    #[inline]
    pub fn arg_deserializer(&self) -> DeserializeFn<Req> {
        self.arg_deserializer.clone()
    }

    #[inline]
    pub fn return_serializer(&self) -> SerializeFn<Resp> {
        self.return_serializer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_method() -> MethodDescriptor<String, String> {
        MethodDescriptor::new(
            "org.apache.dubbo.samples.HelloWorld",
            "SayHello",
            RpcPattern::Unary,
            "raw",
            Arc::new(|v: &String| Ok(v.clone().into_bytes())),
            Arc::new(|b: &[u8]| {
                String::from_utf8(b.to_vec()).map_err(|e| CodecError::new(e.to_string()))
            }),
        )
    }

    #[test]
    fn test_descriptor_path() {
        let m = string_method();
        assert_eq!(m.path(), "/org.apache.dubbo.samples.HelloWorld/SayHello");
        assert_eq!(m.content_type(), "application/grpc+raw");
        assert_eq!(m.pattern(), RpcPattern::Unary);
    }

    #[test]
    fn test_descriptor_codec() {
        let m = string_method();
        let buf = m.serialize_arg(&"world".to_string()).expect("ser");
        assert_eq!(m.deserialize_return(&buf).expect("de"), "world");
        assert!(m.deserialize_return(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_pattern_shape() {
        assert!(!RpcPattern::Unary.client_streaming());
        assert!(!RpcPattern::Unary.server_streaming());
        assert!(RpcPattern::ClientStream.client_streaming());
        assert!(!RpcPattern::ClientStream.server_streaming());
        assert!(RpcPattern::BiStream.client_streaming());
        assert!(RpcPattern::BiStream.server_streaming());
    }
}

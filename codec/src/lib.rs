//! Ready-made codec function pairs for `triple-rpc` method descriptors.
//!
//! The core treats serializers as opaque capabilities; this crate builds the
//! common ones. JSON maps to the `application/grpc+json` content type and to
//! the plain HTTP/JSON surface. Multi-argument methods serialize a tuple.

mod json;
pub use json::{json_deserializer, json_method, json_serializer, json_service_method};

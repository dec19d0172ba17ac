use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use triple_rpc_core::{
    CodecError, DeserializeFn, MethodDescriptor, RpcPattern, SerializeFn, ServiceMethod,
};

pub const JSON_CODEC_NAME: &str = "json";

pub fn json_serializer<T: Serialize>() -> SerializeFn<T> {
    Arc::new(|value: &T| {
        serde_json::to_vec(value).map_err(|e| {
            log::warn!("json encode error: {}", e);
            CodecError::new(e.to_string())
        })
    })
}

pub fn json_deserializer<T: DeserializeOwned>() -> DeserializeFn<T> {
    Arc::new(|buf: &[u8]| {
        serde_json::from_slice::<T>(buf).map_err(|e| {
            log::warn!("json decode error: {}", e);
            CodecError::new(e.to_string())
        })
    })
}

/// Client-side descriptor for a JSON method.
pub fn json_method<Req, Resp>(
    service: impl Into<String>, method: impl Into<String>, pattern: RpcPattern,
) -> MethodDescriptor<Req, Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    MethodDescriptor::new(
        service,
        method,
        pattern,
        JSON_CODEC_NAME,
        json_serializer::<Req>(),
        json_deserializer::<Resp>(),
    )
}

/// Server-side inverse for a JSON method.
pub fn json_service_method<Req, Resp>(
    service: impl Into<String>, method: impl Into<String>,
) -> ServiceMethod<Req, Resp>
where
    Req: DeserializeOwned,
    Resp: Serialize,
{
    ServiceMethod::new(service, method, json_deserializer::<Req>(), json_serializer::<Resp>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Greet {
        name: String,
    }

    #[test]
    fn test_json_round_trip() {
        let m: MethodDescriptor<Greet, Greet> =
            json_method("com.example.Hello", "Say", RpcPattern::Unary);
        let buf = m.serialize_arg(&Greet { name: "world".into() }).expect("encode");
        let back = m.deserialize_return(&buf).expect("decode");
        assert_eq!(back, Greet { name: "world".into() });
    }

    #[test]
    fn test_json_multi_arg_tuple() {
        let s = json_serializer::<(i32, String)>();
        let d = json_deserializer::<(i32, String)>();
        let buf = s(&(7, "x".to_string())).expect("encode");
        assert_eq!(d(&buf).expect("decode"), (7, "x".to_string()));
    }

    #[test]
    fn test_json_decode_error() {
        let d = json_deserializer::<Greet>();
        assert!(d(b"{not json").is_err());
    }
}

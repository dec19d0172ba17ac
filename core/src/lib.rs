mod codec;
pub use codec::{DeserializeFn, MethodDescriptor, RpcPattern, SerializeFn, ServiceMethod};
mod config;
pub use config::{ClientConfig, LoadBalance, ServerConfig, TimeoutSetting};
pub mod error;
pub use error::{CodecError, TripleError};
pub mod frame;
pub use frame::{encode_frame, FrameDecoder, DEFAULT_MAX_MESSAGE_SIZE};
pub mod status;
pub use status::{Code, Status};
pub mod url;
pub use url::{Endpoint, RpcUrl, ServiceKey};

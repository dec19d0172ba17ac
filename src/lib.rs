//! # triple-rpc
//!
//! An RPC runtime speaking the *Triple* protocol: length-prefixed messages
//! over HTTP/2, wire-compatible with gRPC and friendly to plain HTTP/JSON for
//! unary methods.
//!
//! User-visible call APIs are synchronous and run on caller threads. All
//! network I/O is driven by a single cooperative event loop per process; the
//! two sides meet through bounded queues, which are also the backpressure
//! points for producers and consumers.
//!
//! ## Components
//!
//! - [`triple-rpc-core`](https://docs.rs/triple-rpc-core): status codes,
//!   frame codec, method descriptors, URLs, configuration.
//! - [`triple-rpc-codec`](https://docs.rs/triple-rpc-codec): serde-backed
//!   codec builders (JSON).
//! - [client::TripleClient]: the four call shapes (unary, client-stream,
//!   server-stream, bidi) against a fixed address or a registry-backed
//!   [directory::Directory].
//! - [server::TripleServer]: typed handler registration per call pattern,
//!   routed by `:path`, run on a worker pool so a slow handler never blocks
//!   the event loop.
//! - [registry::Registry]: pluggable service discovery. An in-memory
//!   implementation ships here; a Zookeeper backend lives in
//!   `triple-rpc-zookeeper`.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use triple_rpc::client::{CallOptions, TripleClient};
//! use triple_rpc::server::TripleServer;
//! use triple_rpc::{CodecError, RpcPattern, ServerConfig};
//! use triple_rpc_core::{MethodDescriptor, ServiceMethod};
//!
//! let raw = |v: &String| -> Result<Vec<u8>, CodecError> { Ok(v.clone().into_bytes()) };
//! let parse = |b: &[u8]| -> Result<String, CodecError> {
//!     String::from_utf8(b.to_vec()).map_err(|e| CodecError::new(e.to_string()))
//! };
//!
//! let mut server = TripleServer::new(ServerConfig::default()).unwrap();
//! server
//!     .register_unary(
//!         ServiceMethod::new("demo.Greeter", "Greet", Arc::new(parse), Arc::new(raw)),
//!         |_ctx, name: String| Ok(format!("Hello, {}", name)),
//!     )
//!     .unwrap();
//! let addr = server.listen("127.0.0.1:0").unwrap();
//!
//! let method: MethodDescriptor<String, String> = MethodDescriptor::new(
//!     "demo.Greeter",
//!     "Greet",
//!     RpcPattern::Unary,
//!     "raw",
//!     Arc::new(raw),
//!     Arc::new(parse),
//! );
//! let client = TripleClient::direct(&format!("tri://{}", addr)).unwrap();
//! let reply = client.unary(&method, &"world".to_string(), CallOptions::default()).unwrap();
//! assert_eq!(reply, "Hello, world");
//! ```

#[macro_use]
extern crate log;

pub mod client;
pub mod context;
pub mod directory;
pub mod registry;
pub mod server;
pub mod stream;
pub mod transport;

pub use triple_rpc_core::{
    ClientConfig, Code, CodecError, Endpoint, LoadBalance, MethodDescriptor, RpcPattern, RpcUrl,
    ServerConfig, ServiceKey, ServiceMethod, Status, TripleError,
};

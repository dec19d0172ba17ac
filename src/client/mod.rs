//! The client façade: the four call shapes over a fixed address or a
//! registry-backed directory.

pub(crate) mod call;

use std::sync::Arc;
use std::time::Duration;

use triple_rpc_core::url::{PARAM_GROUP, PARAM_VERSION};
use triple_rpc_core::{
    ClientConfig, Endpoint, MethodDescriptor, RpcPattern, RpcUrl, ServiceKey, TripleError,
};

use crate::directory::Directory;
use crate::registry::Registry;
use crate::stream::{RequestSink, ResponseReader, UnaryResponse};
use crate::transport::{Connector, Driver};

/// Per-call options.
#[derive(Default, Clone)]
pub struct CallOptions {
    /// Deadline override for this call; falls back to the client's
    /// configured call timeout.
    pub timeout: Option<Duration>,
    /// Extra request metadata, sent as custom HTTP/2 headers.
    pub metadata: Vec<(String, String)>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

enum Target {
    Direct(Endpoint),
    Directory(Directory),
}

/// A Triple client. Cheap to clone; all clones share the connection map.
#[derive(Clone)]
pub struct TripleClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    driver: Arc<Driver>,
    connector: Connector,
    target: Target,
    group: Option<String>,
    version: Option<String>,
}

impl TripleClient {
    /// Client for a fixed provider, from a `tri://host:port[/service]?..`
    /// reference.
    pub fn direct(url: &str) -> Result<Self, TripleError> {
        Self::direct_with_config(url, ClientConfig::default())
    }

    pub fn direct_with_config(url: &str, mut config: ClientConfig) -> Result<Self, TripleError> {
        let parsed = RpcUrl::parse(url)?;
        if parsed.scheme != "tri" {
            return Err(TripleError::InvalidUrl(format!(
                "expected a tri:// reference, got {:?}",
                parsed.scheme
            )));
        }
        config.apply_url(&parsed);
        let endpoint = parsed.single_endpoint()?;
        let group = parsed.get(PARAM_GROUP).map(|s| s.to_string());
        let version = parsed.get(PARAM_VERSION).map(|s| s.to_string());
        Ok(Self::build(config, Target::Direct(endpoint), group, version))
    }

    /// Client that resolves providers of `key` through a registry
    /// subscription, balancing per the configured policy.
    pub fn with_registry(
        registry: Arc<dyn Registry>, key: ServiceKey, config: ClientConfig,
    ) -> Result<Self, TripleError> {
        let group = key.group.clone();
        let version = key.version.clone();
        let directory =
            Directory::new(registry, key, config.loadbalance, config.stale_grace)?;
        Ok(Self::build(config, Target::Directory(directory), group, version))
    }

    fn build(
        config: ClientConfig, target: Target, group: Option<String>, version: Option<String>,
    ) -> Self {
        let driver = Driver::shared();
        let connector = Connector::new(config.clone());
        Self { inner: Arc::new(ClientInner { config, driver, connector, target, group, version }) }
    }

    /// Invoke a unary method: exactly one request, exactly one response.
    pub fn unary<Req, Resp>(
        &self, method: &MethodDescriptor<Req, Resp>, request: &Req, options: CallOptions,
    ) -> Result<Resp, TripleError> {
        self.check_pattern(method, RpcPattern::Unary)?;
        let (mut sink, reader) = self.open(method, options)?;
        sink.send(request)?;
        sink.close();
        drop(sink);
        UnaryResponse::new(reader).wait()
    }

    /// Open a client-streaming call: a finite producer of requests and a
    /// single response once the producer closes.
    pub fn client_stream<Req, Resp>(
        &self, method: &MethodDescriptor<Req, Resp>, options: CallOptions,
    ) -> Result<(RequestSink<Req>, UnaryResponse<Resp>), TripleError> {
        self.check_pattern(method, RpcPattern::ClientStream)?;
        let (sink, reader) = self.open(method, options)?;
        Ok((sink, UnaryResponse::new(reader)))
    }

    /// Invoke a server-streaming method: one request, a lazy finite sequence
    /// of responses.
    pub fn server_stream<Req, Resp>(
        &self, method: &MethodDescriptor<Req, Resp>, request: &Req, options: CallOptions,
    ) -> Result<ResponseReader<Resp>, TripleError> {
        self.check_pattern(method, RpcPattern::ServerStream)?;
        let (mut sink, reader) = self.open(method, options)?;
        sink.send(request)?;
        sink.close();
        drop(sink);
        Ok(reader)
    }

    /// Open a bidirectional stream; both halves close independently.
    pub fn bidi_stream<Req, Resp>(
        &self, method: &MethodDescriptor<Req, Resp>, options: CallOptions,
    ) -> Result<(RequestSink<Req>, ResponseReader<Resp>), TripleError> {
        self.check_pattern(method, RpcPattern::BiStream)?;
        self.open(method, options)
    }

    fn check_pattern<Req, Resp>(
        &self, method: &MethodDescriptor<Req, Resp>, expected: RpcPattern,
    ) -> Result<(), TripleError> {
        if method.pattern() != expected {
            return Err(TripleError::IllegalState("method pattern does not match the call shape"));
        }
        Ok(())
    }

    fn open<Req, Resp>(
        &self, method: &MethodDescriptor<Req, Resp>, options: CallOptions,
    ) -> Result<(RequestSink<Req>, ResponseReader<Resp>), TripleError> {
        let inner = &self.inner;
        let endpoint = match &inner.target {
            Target::Direct(endpoint) => endpoint.clone(),
            Target::Directory(directory) => directory.select()?,
        };
        trace!("{:?} -> {}", method, endpoint);
        let meta = call::RequestMetadata {
            path: method.path(),
            content_type: method.content_type(),
            timeout: options.timeout,
            attachments: options.metadata,
            group: inner.group.clone(),
            version: inner.version.clone(),
        };
        let running =
            call::start_call(&inner.driver, inner.connector.clone(), endpoint, meta, &inner.config);
        let sink = RequestSink::new(
            running.out_tx,
            method.arg_serializer(),
            running.state.clone(),
            running.cancel.clone(),
            inner.config.max_message_size,
        );
        let reader = ResponseReader::new(
            running.in_rx,
            method.return_deserializer(),
            running.state,
            running.cancel,
        );
        Ok((sink, reader))
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

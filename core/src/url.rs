//! The URL model shared by references, providers and registries.
//!
//! References use `tri://<host>:<port>/<service>?group=..&version=..`.
//! Registry references use `zookeeper://<host-list>/?..` where the host list
//! may name several peers (`h1:2181,h2:2181`), so the authority is kept as an
//! opaque string and forwarded verbatim to the registry client.

use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::percent_decode_str;

use crate::error::TripleError;

pub const PARAM_GROUP: &str = "group";
pub const PARAM_VERSION: &str = "version";
pub const PARAM_CPU: &str = "cpu";
pub const PARAM_LOADBALANCE: &str = "loadbalance";
pub const PARAM_TIMEOUT_MS: &str = "timeout_ms";
pub const PARAM_MAX_MESSAGE_SIZE: &str = "max_message_size";
pub const PARAM_SERIALIZATION: &str = "serialization";

/// A provider address plus the metadata used for routing and balancing.
///
/// Instances are value-typed; the directory keys them by `host:port`.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub metadata: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, metadata: BTreeMap::new() }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[inline]
    pub fn group(&self) -> Option<&str> {
        self.metadata.get(PARAM_GROUP).map(|s| s.as_str())
    }

    #[inline]
    pub fn version(&self) -> Option<&str> {
        self.metadata.get(PARAM_VERSION).map(|s| s.as_str())
    }

    /// Published CPU usage in `[0, 100]`, if any. Values above 100 clamp.
    pub fn cpu(&self) -> Option<u8> {
        let raw = self.metadata.get(PARAM_CPU)?;
        raw.parse::<u8>().ok().map(|v| v.min(100))
    }

    /// Load-balancing weight: `max(1, 100 - cpu)`. An endpoint without CPU
    /// metadata weighs the full 100.
    #[inline]
    pub fn weight(&self) -> u64 {
        let cpu = self.cpu().unwrap_or(0) as u64;
        (100 - cpu).max(1)
    }

    /// Provider URL form, as published into the registry.
    pub fn to_url(&self) -> String {
        let mut out = format!("tri://{}:{}", self.host, self.port);
        let mut sep = '?';
        for (k, v) in self.metadata.iter() {
            out.push(sep);
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            sep = '&';
        }
        out
    }

    pub fn from_url(s: &str) -> Result<Self, TripleError> {
        let url = RpcUrl::parse(s)?;
        url.single_endpoint()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_url())
    }
}

/// `{interface, group?, version?}`, the unit of registration and
/// subscription.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ServiceKey {
    pub interface: String,
    pub group: Option<String>,
    pub version: Option<String>,
}

impl ServiceKey {
    pub fn new(interface: impl Into<String>) -> Self {
        Self { interface: interface.into(), group: None, version: None }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Canonical form `<group>/<interface>:<version>`; absent parts are
    /// omitted together with their separator.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        if let Some(g) = self.group.as_deref() {
            out.push_str(g);
            out.push('/');
        }
        out.push_str(&self.interface);
        if let Some(v) = self.version.as_deref() {
            out.push(':');
            out.push_str(v);
        }
        out
    }

    /// Group/version filter applied by the directory before selection. An
    /// unset part on the reference side accepts any provider.
    pub fn matches(&self, endpoint: &Endpoint) -> bool {
        if let Some(g) = self.group.as_deref() {
            if endpoint.group() != Some(g) {
                return false;
            }
        }
        if let Some(v) = self.version.as_deref() {
            if endpoint.version() != Some(v) {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// A parsed `scheme://host-list/path?query` reference.
///
/// Parsing is done by hand because a registry authority may contain commas,
/// which strict URL parsers reject.
#[derive(Clone, Debug)]
pub struct RpcUrl {
    pub scheme: String,
    pub host_list: String,
    pub path: String,
    pub params: BTreeMap<String, String>,
}

impl RpcUrl {
    pub fn parse(s: &str) -> Result<Self, TripleError> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| TripleError::InvalidUrl(format!("missing scheme in {:?}", s)))?;
        if scheme.is_empty() {
            return Err(TripleError::InvalidUrl(format!("missing scheme in {:?}", s)));
        }
        let (location, query) = match rest.split_once('?') {
            Some((l, q)) => (l, q),
            None => (rest, ""),
        };
        let (host_list, path) = match location.split_once('/') {
            Some((h, p)) => (h, p.trim_end_matches('/')),
            None => (location, ""),
        };
        if host_list.is_empty() {
            return Err(TripleError::InvalidUrl(format!("missing host in {:?}", s)));
        }
        let mut params = BTreeMap::new();
        for pair in query.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let k = percent_decode_str(k).decode_utf8_lossy().into_owned();
            let v = percent_decode_str(v).decode_utf8_lossy().into_owned();
            params.insert(k, v);
        }
        Ok(Self {
            scheme: scheme.to_string(),
            host_list: host_list.to_string(),
            path: path.to_string(),
            params,
        })
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    /// The service name named by the path, if any.
    #[inline]
    pub fn service(&self) -> Option<&str> {
        if self.path.is_empty() {
            None
        } else {
            Some(self.path.as_str())
        }
    }

    /// Service key for this reference: path interface plus group/version
    /// parameters.
    pub fn service_key(&self) -> Result<ServiceKey, TripleError> {
        let interface = self
            .service()
            .ok_or_else(|| TripleError::InvalidUrl("reference names no service".into()))?;
        let mut key = ServiceKey::new(interface);
        if let Some(g) = self.get(PARAM_GROUP) {
            key = key.with_group(g);
        }
        if let Some(v) = self.get(PARAM_VERSION) {
            key = key.with_version(v);
        }
        Ok(key)
    }

    /// Interpret the authority as a single `host:port` endpoint, carrying the
    /// query parameters over as metadata.
    pub fn single_endpoint(&self) -> Result<Endpoint, TripleError> {
        if self.host_list.contains(',') {
            return Err(TripleError::InvalidUrl(format!(
                "expected a single address, got {:?}",
                self.host_list
            )));
        }
        let (host, port) = self
            .host_list
            .rsplit_once(':')
            .ok_or_else(|| TripleError::InvalidUrl(format!("missing port in {:?}", self.host_list)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| TripleError::InvalidUrl(format!("bad port in {:?}", self.host_list)))?;
        let mut endpoint = Endpoint::new(host, port);
        endpoint.metadata = self.params.clone();
        Ok(endpoint)
    }
}

impl fmt::Display for RpcUrl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.host_list, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        let url =
            RpcUrl::parse("tri://127.0.0.1:50051/org.apache.dubbo.samples.HelloWorld").unwrap();
        assert_eq!(url.scheme, "tri");
        assert_eq!(url.host_list, "127.0.0.1:50051");
        assert_eq!(url.service(), Some("org.apache.dubbo.samples.HelloWorld"));
        let ep = url.single_endpoint().unwrap();
        assert_eq!(ep.authority(), "127.0.0.1:50051");
    }

    #[test]
    fn test_parse_registry_hosts() {
        let url = RpcUrl::parse(
            "zookeeper://h1:2181,h2:2181,h3:2181/?group=g1&loadbalance=cpu&timeout_ms=500",
        )
        .unwrap();
        assert_eq!(url.scheme, "zookeeper");
        assert_eq!(url.host_list, "h1:2181,h2:2181,h3:2181");
        assert_eq!(url.get(PARAM_GROUP), Some("g1"));
        assert_eq!(url.get(PARAM_LOADBALANCE), Some("cpu"));
        assert_eq!(url.get(PARAM_TIMEOUT_MS), Some("500"));
        assert!(url.single_endpoint().is_err());
    }

    #[test]
    fn test_parse_rejects() {
        assert!(RpcUrl::parse("no-scheme-here").is_err());
        assert!(RpcUrl::parse("://host").is_err());
        assert!(RpcUrl::parse("tri://").is_err());
        assert!(Endpoint::from_url("tri://hostonly").is_err());
        assert!(Endpoint::from_url("tri://host:notaport").is_err());
    }

    #[test]
    fn test_endpoint_url_round_trip() {
        let ep = Endpoint::new("10.0.0.3", 20880)
            .with_meta(PARAM_GROUP, "g1")
            .with_meta(PARAM_VERSION, "1.0")
            .with_meta(PARAM_CPU, "17");
        let url = ep.to_url();
        assert_eq!(url, "tri://10.0.0.3:20880?cpu=17&group=g1&version=1.0");
        let back = Endpoint::from_url(&url).unwrap();
        assert_eq!(back, ep);
    }

    #[test]
    fn test_endpoint_weight() {
        let ep = Endpoint::new("h", 1);
        assert_eq!(ep.weight(), 100);
        let ep = ep.with_meta(PARAM_CPU, "17");
        assert_eq!(ep.weight(), 83);
        let ep = ep.with_meta(PARAM_CPU, "100");
        assert_eq!(ep.weight(), 1);
        let ep = ep.with_meta(PARAM_CPU, "250");
        // clamped
        assert_eq!(ep.weight(), 1);
    }

    #[test]
    fn test_service_key() {
        let key = ServiceKey::new("com.example.Echo").with_group("blue").with_version("2.1");
        assert_eq!(key.canonical(), "blue/com.example.Echo:2.1");
        assert_eq!(ServiceKey::new("com.example.Echo").canonical(), "com.example.Echo");

        let ep = Endpoint::new("h", 1).with_meta(PARAM_GROUP, "blue").with_meta(PARAM_VERSION, "2.1");
        assert!(key.matches(&ep));
        let other = Endpoint::new("h", 1).with_meta(PARAM_GROUP, "green");
        assert!(!key.matches(&other));
        // unset parts accept anything
        assert!(ServiceKey::new("com.example.Echo").matches(&other));
    }
}

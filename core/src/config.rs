use std::str::FromStr;
use std::time::Duration;

use crate::frame::DEFAULT_MAX_MESSAGE_SIZE;
use crate::url::{self, RpcUrl};

/// Endpoint selection policy of the directory.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum LoadBalance {
    /// Uniform pick over the live address list.
    #[default]
    Random,
    /// Weighted by published CPU usage, weight `max(1, 100 - cpu)`.
    Cpu,
}

impl FromStr for LoadBalance {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "random" => Ok(Self::Random),
            "cpu" => Ok(Self::Cpu),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy)]
pub struct TimeoutSetting {
    /// Deadline applied to every call unless overridden per call. None means
    /// calls run without a deadline.
    pub call_timeout: Option<Duration>,
    /// connect timeout
    pub connect_timeout: Duration,
    /// Connection idle time before it is closed.
    pub idle_timeout: Duration,
}

impl Default for TimeoutSetting {
    fn default() -> Self {
        Self {
            call_timeout: None,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub timeout: TimeoutSetting,
    /// Per-call message queue capacity, the backpressure point for producers
    /// and consumers.
    pub thresholds: usize,
    pub max_message_size: usize,
    /// HTTP/2 keepalive PING interval.
    pub ping_interval: Duration,
    pub loadbalance: LoadBalance,
    /// How long the last non-empty address list keeps serving after the
    /// registry reports empty. Zero disables stale serving.
    pub stale_grace: Duration,
    /// Advisory default codec name for stubs built from a reference URL.
    pub serialization: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: TimeoutSetting::default(),
            thresholds: 32,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            ping_interval: Duration::from_secs(10),
            loadbalance: LoadBalance::default(),
            stale_grace: Duration::from_secs(30),
            serialization: "proto".to_string(),
        }
    }
}

impl ClientConfig {
    /// Apply the options a reference URL is allowed to carry.
    pub fn apply_url(&mut self, url: &RpcUrl) {
        if let Some(raw) = url.get(url::PARAM_TIMEOUT_MS) {
            if let Ok(ms) = raw.parse::<u64>() {
                self.timeout.call_timeout = Some(Duration::from_millis(ms));
            }
        }
        if let Some(raw) = url.get(url::PARAM_MAX_MESSAGE_SIZE) {
            if let Ok(size) = raw.parse::<usize>() {
                self.max_message_size = size;
            }
        }
        if let Some(raw) = url.get(url::PARAM_LOADBALANCE) {
            if let Ok(lb) = raw.parse::<LoadBalance>() {
                self.loadbalance = lb;
            }
        }
        if let Some(name) = url.get(url::PARAM_SERIALIZATION) {
            self.serialization = name.to_string();
        }
    }
}

#[derive(Clone)]
pub struct ServerConfig {
    /// Per-stream message queue capacity.
    pub thresholds: usize,
    pub max_message_size: usize,
    /// Handler pool size; 0 means the machine's available parallelism.
    pub handler_threads: usize,
    /// How long close() waits for live connections to drain.
    pub server_close_wait: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            thresholds: 32,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            handler_threads: 0,
            server_close_wait: Duration::from_secs(15),
        }
    }
}

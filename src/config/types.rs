//! Configuration Types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::proxy::{
    AddressFamily, Protocol, ProxyOptions, DEFAULT_BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_UDP_DATAGRAM_SIZE,
};
use crate::relay::DEFAULT_UDP_IDLE_TIMEOUT;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub logging: LoggingConfig,
}

/// Forwarding configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub protocol: Protocol,
    pub frontend_host: String,
    pub frontend_port: u16,
    pub backend_host: String,
    pub backend_port: u16,
    /// Restrict name resolution to one family.
    pub address_family: Option<AddressFamily>,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub udp_idle_timeout: Duration,
    pub buffer_size: usize,
    pub udp_datagram_size: usize,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub ansi: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            frontend_host: "127.0.0.1".to_string(),
            frontend_port: 0,
            backend_host: "127.0.0.1".to_string(),
            backend_port: 0,
            address_family: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            udp_datagram_size: DEFAULT_UDP_DATAGRAM_SIZE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl ProxyConfig {
    /// Engine options derived from this configuration
    pub fn proxy_options(&self) -> ProxyOptions {
        ProxyOptions {
            connect_timeout: self.connect_timeout,
            udp_idle_timeout: self.udp_idle_timeout,
            buffer_size: self.buffer_size,
            udp_datagram_size: self.udp_datagram_size,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

//! Configuration Manager

use super::Config;
use crate::proxy::{AddressFamily, Endpoint, Protocol};
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            tracing::info!("Configuration loaded from file");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }
}

impl Config {
    /// Override fields from `NETPROXY_*` variables looked up through `var`.
    pub fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(protocol) = var("NETPROXY_PROTOCOL") {
            self.proxy.protocol = protocol
                .parse::<Protocol>()
                .with_context(|| format!("Invalid NETPROXY_PROTOCOL: {}", protocol))?;
        }

        if let Some(host) = var("NETPROXY_FRONTEND_HOST") {
            self.proxy.frontend_host = host;
        }

        if let Some(port) = var("NETPROXY_FRONTEND_PORT") {
            self.proxy.frontend_port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid NETPROXY_FRONTEND_PORT: {}", port))?;
        }

        if let Some(host) = var("NETPROXY_BACKEND_HOST") {
            self.proxy.backend_host = host;
        }

        if let Some(port) = var("NETPROXY_BACKEND_PORT") {
            self.proxy.backend_port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid NETPROXY_BACKEND_PORT: {}", port))?;
        }

        if let Some(timeout) = var("NETPROXY_CONNECT_TIMEOUT") {
            self.proxy.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid NETPROXY_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Some(timeout) = var("NETPROXY_UDP_IDLE_TIMEOUT") {
            self.proxy.udp_idle_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid NETPROXY_UDP_IDLE_TIMEOUT: {}", timeout))?;
        }

        if let Some(buffer_size) = var("NETPROXY_BUFFER_SIZE") {
            self.proxy.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid NETPROXY_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Some(size) = var("NETPROXY_UDP_DATAGRAM_SIZE") {
            self.proxy.udp_datagram_size = size
                .parse::<usize>()
                .with_context(|| format!("Invalid NETPROXY_UDP_DATAGRAM_SIZE: {}", size))?;
        }

        if let Some(timeout) = var("NETPROXY_SHUTDOWN_TIMEOUT") {
            self.proxy.shutdown_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid NETPROXY_SHUTDOWN_TIMEOUT: {}", timeout))?;
        }

        if let Some(log_level) = var("NETPROXY_LOG_LEVEL") {
            self.logging.level = log_level;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_proxy_config()
            .with_context(|| "Proxy configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_proxy_config(&self) -> Result<()> {
        let proxy = &self.proxy;

        if proxy.frontend_host.is_empty() {
            bail!("frontend_host must not be empty");
        }

        if proxy.backend_host.is_empty() {
            bail!("backend_host must not be empty");
        }

        if proxy.backend_port == 0 {
            bail!("backend_port must be set to a non-zero port");
        }

        if proxy.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if proxy.udp_idle_timeout.is_zero() {
            bail!("udp_idle_timeout must be greater than 0");
        }

        if proxy.buffer_size < 1024 {
            bail!("buffer_size must be at least 1024 bytes");
        }

        if proxy.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if proxy.udp_datagram_size == 0 || proxy.udp_datagram_size > 65535 {
            bail!("udp_datagram_size must be between 1 and 65535");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    #[allow(clippy::too_many_arguments)]
    pub fn merge_with_cli_args(
        &mut self,
        protocol: Option<Protocol>,
        frontend_host: Option<&str>,
        frontend_port: Option<u16>,
        backend_host: Option<&str>,
        backend_port: Option<u16>,
        address_family: Option<AddressFamily>,
        udp_idle_timeout: Option<std::time::Duration>,
    ) {
        if let Some(protocol) = protocol {
            self.proxy.protocol = protocol;
            tracing::info!("CLI override: protocol set to {}", protocol);
        }

        if let Some(host) = frontend_host {
            self.proxy.frontend_host = host.to_string();
            tracing::info!("CLI override: frontend host set to {}", host);
        }

        if let Some(port) = frontend_port {
            self.proxy.frontend_port = port;
            tracing::info!("CLI override: frontend port set to {}", port);
        }

        if let Some(host) = backend_host {
            self.proxy.backend_host = host.to_string();
            tracing::info!("CLI override: backend host set to {}", host);
        }

        if let Some(port) = backend_port {
            self.proxy.backend_port = port;
            tracing::info!("CLI override: backend port set to {}", port);
        }

        if let Some(family) = address_family {
            self.proxy.address_family = Some(family);
            tracing::info!("CLI override: address family set to IP{}", family);
        }

        if let Some(timeout) = udp_idle_timeout {
            self.proxy.udp_idle_timeout = timeout;
            tracing::info!("CLI override: UDP idle timeout set to {:?}", timeout);
        }
    }

    /// Resolve the configured hosts into the frontend and backend endpoints
    pub async fn resolve_endpoints(&self) -> Result<(Endpoint, Endpoint)> {
        let proxy = &self.proxy;

        let frontend = Endpoint::resolve(
            proxy.protocol,
            &proxy.frontend_host,
            proxy.frontend_port,
            proxy.address_family,
            proxy.connect_timeout,
        )
        .await
        .context("Failed to resolve frontend address")?;

        let backend = Endpoint::resolve(
            proxy.protocol,
            &proxy.backend_host,
            proxy.backend_port,
            proxy.address_family,
            proxy.connect_timeout,
        )
        .await
        .context("Failed to resolve backend address")?;

        Ok((frontend, backend))
    }
}

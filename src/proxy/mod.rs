//! Proxy facade
//!
//! [`Proxy`] is the single entry point: it validates an endpoint pair,
//! binds the frontend and hands the work to the TCP or UDP engine chosen
//! by the frontend protocol.

pub mod endpoint;
pub mod error;
pub(crate) mod lifecycle;

use std::time::Duration;

use tracing::info;

pub use endpoint::{AddressFamily, Endpoint, Protocol};
pub use error::ProxyError;

use crate::relay::{ProxyStats, TcpProxy, UdpProxy, DEFAULT_UDP_IDLE_TIMEOUT};

/// Default backend dial timeout for TCP sessions.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-direction copy buffer for TCP sessions.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Largest payload of a UDP datagram over IPv4.
pub const DEFAULT_UDP_DATAGRAM_SIZE: usize = 65507;

/// Default time `close` waits for the background loop before aborting it.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOptions {
    pub connect_timeout: Duration,
    pub udp_idle_timeout: Duration,
    pub buffer_size: usize,
    pub udp_datagram_size: usize,
    pub shutdown_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            udp_datagram_size: DEFAULT_UDP_DATAGRAM_SIZE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// A running or runnable forwarder from one frontend to one backend.
///
/// Lifecycle: [`Proxy::new`] binds the frontend, [`Proxy::run`] starts
/// relaying in the background, [`Proxy::close`] stops everything. A
/// closed proxy cannot be restarted.
#[derive(Debug)]
pub enum Proxy {
    Tcp(TcpProxy),
    Udp(UdpProxy),
}

impl Proxy {
    /// Create a proxy with default options.
    pub async fn new(frontend: Endpoint, backend: Endpoint) -> Result<Self, ProxyError> {
        Self::with_options(frontend, backend, ProxyOptions::default()).await
    }

    /// Validate the pair and bind the frontend. The backend is not
    /// contacted, so it does not need to be up yet.
    pub async fn with_options(
        frontend: Endpoint,
        backend: Endpoint,
        options: ProxyOptions,
    ) -> Result<Self, ProxyError> {
        validate_pair(&frontend, &backend, &options)?;

        let proxy = match frontend.protocol() {
            Protocol::Tcp => Proxy::Tcp(TcpProxy::bind(frontend, backend, &options).await?),
            Protocol::Udp => Proxy::Udp(UdpProxy::bind(frontend, backend, &options).await?),
        };

        info!(
            "Proxy ready: {} -> {}",
            proxy.frontend_addr(),
            proxy.backend_addr()
        );
        Ok(proxy)
    }

    /// Start relaying in the background and return immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run(&self) -> Result<(), ProxyError> {
        match self {
            Proxy::Tcp(proxy) => proxy.run(),
            Proxy::Udp(proxy) => proxy.run(),
        }
    }

    /// Stop accepting, close the frontend and terminate every session.
    /// Closing an already closed proxy does nothing.
    pub async fn close(&self) -> Result<(), ProxyError> {
        match self {
            Proxy::Tcp(proxy) => proxy.close().await,
            Proxy::Udp(proxy) => proxy.close().await,
        }
        info!("Proxy {} closed", self.frontend_addr());
        Ok(())
    }

    /// The bound frontend, with the real port if port 0 was requested.
    pub fn frontend_addr(&self) -> Endpoint {
        match self {
            Proxy::Tcp(proxy) => proxy.frontend_addr(),
            Proxy::Udp(proxy) => proxy.frontend_addr(),
        }
    }

    pub fn backend_addr(&self) -> Endpoint {
        match self {
            Proxy::Tcp(proxy) => proxy.backend_addr(),
            Proxy::Udp(proxy) => proxy.backend_addr(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.frontend_addr().protocol()
    }

    pub fn stats(&self) -> &ProxyStats {
        match self {
            Proxy::Tcp(proxy) => proxy.stats(),
            Proxy::Udp(proxy) => proxy.stats(),
        }
    }

    /// Open TCP sessions, or tracked UDP clients.
    pub fn active_sessions(&self) -> usize {
        match self {
            Proxy::Tcp(proxy) => proxy.active_sessions(),
            Proxy::Udp(proxy) => proxy.active_sessions(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Proxy::Tcp(proxy) => proxy.is_closed(),
            Proxy::Udp(proxy) => proxy.is_closed(),
        }
    }
}

fn validate_pair(
    frontend: &Endpoint,
    backend: &Endpoint,
    options: &ProxyOptions,
) -> Result<(), ProxyError> {
    if frontend.protocol() != backend.protocol() {
        return Err(ProxyError::invalid(format!(
            "cannot proxy a {} frontend to a {} backend",
            frontend.protocol(),
            backend.protocol()
        )));
    }

    if backend.port() == 0 {
        return Err(ProxyError::invalid(format!(
            "backend {} must have a non-zero port",
            backend
        )));
    }

    if backend.addr().ip().is_unspecified() {
        return Err(ProxyError::invalid(format!(
            "backend {} must have a concrete address",
            backend
        )));
    }

    if options.buffer_size == 0 || options.udp_datagram_size == 0 {
        return Err(ProxyError::invalid("buffer sizes must be greater than 0"));
    }

    if options.udp_idle_timeout.is_zero() {
        return Err(ProxyError::invalid("udp_idle_timeout must be greater than 0"));
    }

    Ok(())
}

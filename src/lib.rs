//! netproxy library
//!
//! Transport-level forwarding proxy. A [`Proxy`] listens on a frontend
//! endpoint and relays TCP streams or UDP datagrams to a fixed backend
//! endpoint, over IPv4 or IPv6, without looking at the payload.
//!
//! ```no_run
//! # async fn demo() -> Result<(), netproxy::ProxyError> {
//! use netproxy::{Endpoint, Proxy};
//!
//! let proxy = Proxy::new(
//!     Endpoint::tcp("127.0.0.1:0".parse().unwrap()),
//!     Endpoint::tcp("127.0.0.1:8080".parse().unwrap()),
//! )
//! .await?;
//! proxy.run()?;
//! println!("listening on {}", proxy.frontend_addr());
//! proxy.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod proxy;
pub mod relay;
pub mod shutdown;

pub use config::Config;
pub use proxy::{AddressFamily, Endpoint, Protocol, Proxy, ProxyError, ProxyOptions};
pub use relay::{ProxyStats, StatsSnapshot};
pub use shutdown::ShutdownCoordinator;

/// Common error type for configuration and process plumbing
pub type Result<T> = anyhow::Result<T>;

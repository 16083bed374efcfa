//! Data Relay Module
//!
//! The two forwarding engines and the bookkeeping they share.

pub mod conntrack;
pub mod session;
pub mod stats;
pub mod tcp;
pub mod udp;

pub use conntrack::{ConnTrackTable, IdleCheck, DEFAULT_UDP_IDLE_TIMEOUT};
pub use session::{RelaySession, SessionGuard, SessionStats};
pub use stats::{ProxyStats, StatsSnapshot};
pub use tcp::TcpProxy;
pub use udp::UdpProxy;

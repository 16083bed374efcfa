//! netproxy - TCP/UDP forwarding proxy
//!
//! Listens on a frontend address and relays every connection or datagram
//! to a fixed backend address until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netproxy::{
    config::ConfigManager, AddressFamily, Config, Protocol, Proxy, ShutdownCoordinator,
};

/// CLI arguments for netproxy
#[derive(Parser, Debug)]
#[command(name = "netproxy")]
#[command(about = "Transport-level TCP/UDP forwarding proxy")]
#[command(version)]
#[command(long_about = "
Transport-level TCP/UDP forwarding proxy.

Relays TCP streams or UDP datagrams from a frontend address to a fixed
backend address, over IPv4 or IPv6, without inspecting the payload.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  NETPROXY_PROTOCOL          - tcp or udp
  NETPROXY_FRONTEND_HOST     - Frontend host to listen on
  NETPROXY_FRONTEND_PORT     - Frontend port (0 picks a free port)
  NETPROXY_BACKEND_HOST      - Backend host to forward to
  NETPROXY_BACKEND_PORT      - Backend port
  NETPROXY_CONNECT_TIMEOUT   - Backend dial timeout (e.g., 10s)
  NETPROXY_UDP_IDLE_TIMEOUT  - Idle time before a UDP session is dropped (e.g., 90s)
  NETPROXY_BUFFER_SIZE       - TCP copy buffer size in bytes
  NETPROXY_UDP_DATAGRAM_SIZE - Largest UDP datagram relayed, in bytes
  NETPROXY_SHUTDOWN_TIMEOUT  - Time allowed for a graceful close (e.g., 5s)
  NETPROXY_LOG_LEVEL         - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "netproxy.toml")]
    pub config: PathBuf,

    /// Protocol to proxy (tcp or udp)
    #[arg(long = "proto")]
    pub protocol: Option<Protocol>,

    /// Host or IP to listen on
    #[arg(long)]
    pub frontend_host: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(long)]
    pub frontend_port: Option<u16>,

    /// Host or IP to forward to
    #[arg(long)]
    pub backend_host: Option<String>,

    /// Port to forward to
    #[arg(long)]
    pub backend_port: Option<u16>,

    /// Only resolve IPv4 addresses
    #[arg(long, conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Only resolve IPv6 addresses
    #[arg(long)]
    pub ipv6: bool,

    /// Idle time before a UDP session is dropped (e.g., 90s, 5m)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub udp_idle_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,
}

impl CliArgs {
    fn address_family(&self) -> Option<AddressFamily> {
        if self.ipv4 {
            Some(AddressFamily::V4)
        } else if self.ipv6 {
            Some(AddressFamily::V6)
        } else {
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.protocol,
        args.frontend_host.as_deref(),
        args.frontend_port,
        args.backend_host.as_deref(),
        args.backend_port,
        args.address_family(),
        args.udp_idle_timeout,
    );
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.verbose {
        config.logging.level = "debug".to_string();
    }

    init_tracing(&config)?;

    info!("Starting netproxy v{}", env!("CARGO_PKG_VERSION"));

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Protocol: {}", config.proxy.protocol);
        info!(
            "  Frontend: {}:{}",
            config.proxy.frontend_host, config.proxy.frontend_port
        );
        info!(
            "  Backend: {}:{}",
            config.proxy.backend_host, config.proxy.backend_port
        );
        info!("  UDP idle timeout: {:?}", config.proxy.udp_idle_timeout);
        return Ok(());
    }

    let (frontend, backend) = config.resolve_endpoints().await?;
    let proxy = Proxy::with_options(frontend, backend, config.proxy.proxy_options())
        .await
        .context("Failed to start proxy")?;
    proxy.run().context("Failed to start proxy")?;

    info!(
        "Forwarding {} -> {}",
        proxy.frontend_addr(),
        proxy.backend_addr()
    );
    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    // Close gets its own timeout plus the time to abort a stuck loop.
    let shutdown_coordinator =
        ShutdownCoordinator::new(config.proxy.shutdown_timeout + Duration::from_secs(1));

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    shutdown_coordinator.shutdown_proxy(&proxy).await?;

    let stats = proxy.stats().snapshot();
    info!(
        sessions = stats.sessions_created,
        bytes_up = stats.bytes_up,
        bytes_down = stats.bytes_down,
        dial_failures = stats.dial_failures,
        send_failures = stats.send_failures,
        "Shutdown complete"
    );

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(config: &Config) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(config.logging.ansi),
        )
        .with(env_filter)
        .init();

    Ok(())
}

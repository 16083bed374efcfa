//! Shared backends for the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

pub const TEST_PAYLOAD: &[u8] = b"Buffalo buffalo Buffalo buffalo buffalo buffalo Buffalo buffalo";

pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP backend that echoes every connection back to itself.
pub struct TcpEchoServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TcpEchoServer {
    pub async fn start(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.into_split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                    let _ = writer.shutdown().await;
                });
            }
        });

        Ok(Self { addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for TcpEchoServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// TCP backend that reads until end-of-stream and only then answers with
/// everything it received followed by `suffix`.
pub struct TcpCollectServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TcpCollectServer {
    pub async fn start(addr: &str, suffix: &'static [u8]) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut received = Vec::new();
                    if stream.read_to_end(&mut received).await.is_ok() {
                        received.extend_from_slice(suffix);
                        let _ = stream.write_all(&received).await;
                        let _ = stream.shutdown().await;
                    }
                });
            }
        });

        Ok(Self { addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for TcpCollectServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// UDP backend that sends every datagram back to its sender.
pub struct UdpEchoServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl UdpEchoServer {
    pub async fn start(addr: &str) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let addr = socket.local_addr()?;

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        let _ = socket.send_to(&buf[..n], from).await;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
                    Err(_) => break,
                }
            }
        });

        Ok(Self { addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for UdpEchoServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Whether the host has a usable IPv6 loopback.
pub fn ipv6_available() -> bool {
    std::net::TcpListener::bind("[::1]:0").is_ok()
}

/// A local UDP port with nothing bound to it right now.
pub fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

/// A local TCP port with nothing listening on it right now.
pub fn free_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

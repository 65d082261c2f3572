//! Socket options for the listener and accepted connections.
//!
//! Listeners are built through `socket2` so `SO_REUSEADDR` and the backlog
//! can be set before binding. Accepted streams get `TCP_NODELAY` and TCP
//! keepalive probes so dead peers are eventually noticed by the kernel
//! even when the application-level idle sweep is configured generously.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm. Default: true.
    pub nodelay: bool,
    /// Idle time before the first TCP keepalive probe; `None` disables probes.
    /// Default: 60s.
    pub keepalive: Option<Duration>,
    /// Interval between keepalive probes. Default: 10s.
    pub keepalive_interval: Duration,
    /// Set `SO_REUSEADDR` on the listener. Default: true except on Windows.
    pub reuse_addr: bool,
    /// Listen backlog. Default: 1024.
    pub backlog: i32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(Duration::from_secs(60)),
            keepalive_interval: Duration::from_secs(10),
            reuse_addr: !cfg!(target_os = "windows"),
            backlog: 1024,
        }
    }
}

/// Bind a listener on `addr`. Must be called from within a tokio runtime.
pub fn bind_listener(addr: SocketAddr, options: &SocketOptions) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if options.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        // Accept IPv4-mapped peers on `[::]`.
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(options.backlog)?;
    TcpListener::from_std(socket.into())
}

/// Apply per-connection options to an accepted stream.
pub fn tune_stream(stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
    stream.set_nodelay(options.nodelay)?;
    if let Some(idle) = options.keepalive {
        let keepalive = TcpKeepalive::new()
            .with_time(idle)
            .with_interval(options.keepalive_interval);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

/// Resolve `host:port` to the first matching socket address.
pub async fn resolve_bind_addr(host: &str, port: u16) -> io::Result<SocketAddr> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address found for host '{host}'"))
        })
}

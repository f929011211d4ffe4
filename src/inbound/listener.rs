//! Endpoint binding
//!
//! Sockets are built with `socket2` so options can be applied before
//! `bind`/`listen`, then handed to tokio. The UDP bind records the local
//! address for later use as the origin destination of received flows.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tracing::info;

use crate::config::InboundOptions;
use crate::error::ListenError;
use crate::platform;

/// TCP accept backlog
const TCP_BACKLOG: i32 = 1024;

/// Bind the TCP side of an inbound.
///
/// Fast open is applied before `listen` when requested; a platform
/// without support fails the bind (fast open was asked for explicitly).
pub fn bind_tcp(options: &InboundOptions) -> Result<TcpListener, ListenError> {
    let addr = options.listen_addr();
    let socket = new_socket(addr, Type::STREAM, Protocol::TCP)?;

    socket
        .set_reuse_address(true)
        .map_err(|e| ListenError::socket_option("SO_REUSEADDR", e))?;

    if options.tcp_fast_open {
        platform::enable_tcp_fast_open(&socket)?;
    }

    socket.bind(&addr.into()).map_err(|e| ListenError::Bind {
        addr,
        reason: e.to_string(),
    })?;
    socket
        .listen(TCP_BACKLOG)
        .map_err(|e| ListenError::socket_option("listen", e))?;

    let listener = TcpListener::from_std(socket.into())
        .map_err(|e| ListenError::SocketCreation(e.to_string()))?;

    let local = listener
        .local_addr()
        .map_err(|e| ListenError::SocketCreation(e.to_string()))?;
    info!("tcp server started at {local}");

    Ok(listener)
}

/// Bind the UDP side of an inbound.
///
/// Returns the socket and its actual local address (the bind port may
/// have been 0).
pub fn bind_udp(options: &InboundOptions) -> Result<(UdpSocket, SocketAddr), ListenError> {
    let addr = options.listen_addr();
    let socket = new_socket(addr, Type::DGRAM, Protocol::UDP)?;

    socket.bind(&addr.into()).map_err(|e| ListenError::Bind {
        addr,
        reason: e.to_string(),
    })?;

    let socket = UdpSocket::from_std(socket.into())
        .map_err(|e| ListenError::SocketCreation(e.to_string()))?;

    let local = socket
        .local_addr()
        .map_err(|e| ListenError::SocketCreation(e.to_string()))?;
    info!("udp server started at {local}");

    Ok((socket, local))
}

fn new_socket(addr: SocketAddr, kind: Type, protocol: Protocol) -> Result<Socket, ListenError> {
    let socket = Socket::new(Domain::for_address(addr), kind, Some(protocol))
        .map_err(|e| ListenError::SocketCreation(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ListenError::socket_option("O_NONBLOCK", e))?;
    Ok(socket)
}

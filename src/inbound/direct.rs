//! Direct inbound handler
//!
//! Forwards every flow to a fixed override destination. TCP connections
//! go through the router; UDP packets are relayed through a per-source
//! session table whose reply tasks feed the inbound's write-back path.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use super::PacketAdapter;
use crate::adapter::{ConnectionHandler, PacketHandler, Router};
use crate::buf::{Buffer, UDP_BUFFER_SIZE};
use crate::common::{Address, FlowContext, FlowMetadata};
use crate::config::InboundOptions;
use crate::error::{Error, Result, UdpError};

/// Idle time after which a UDP session is dropped
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Resolve the configured override destination of a direct inbound
pub fn override_destination(options: &InboundOptions) -> std::result::Result<Address, String> {
    let Some(host) = options.override_address.as_deref() else {
        return Err("missing override_address".into());
    };
    let Some(port) = options.override_port else {
        return Err("missing override_port".into());
    };
    if let Ok(ip) = host.parse::<IpAddr>() {
        Ok(Address::Socket(SocketAddr::new(ip, port)))
    } else {
        Ok(Address::Domain(host.to_string(), port))
    }
}

/// Per-source upstream sockets, shared with the reply tasks
type SessionMap = Arc<parking_lot::Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>>;

/// Handler forwarding all traffic to one destination
pub struct DirectHandler {
    router: Arc<dyn Router>,
    destination: Address,
    sessions: SessionMap,
}

impl DirectHandler {
    /// Create a handler targeting `destination`
    pub fn new(router: Arc<dyn Router>, destination: Address) -> Self {
        Self {
            router,
            destination,
            sessions: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    async fn session(
        &self,
        peer: SocketAddr,
        conn: &Arc<PacketAdapter>,
        ctx: &FlowContext,
        metadata: &FlowMetadata,
    ) -> Result<Arc<UdpSocket>> {
        if let Some(existing) = self.sessions.lock().get(&peer) {
            return Ok(Arc::clone(existing));
        }

        let target = self
            .destination
            .resolve(metadata.domain_strategy)
            .await
            .map_err(Error::Udp)?;
        let bind: SocketAddr = if target.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let upstream = UdpSocket::bind(bind).await?;
        upstream.connect(target).await?;
        let upstream = Arc::new(upstream);

        let installed = {
            let mut sessions = self.sessions.lock();
            match sessions.get(&peer) {
                // Lost the setup race, reuse the winner (its reply
                // task is already running)
                Some(existing) => return Ok(Arc::clone(existing)),
                None => {
                    sessions.insert(peer, Arc::clone(&upstream));
                    upstream
                }
            }
        };

        debug!(flow = ctx.flow_id, %peer, %target, "udp session opened");
        spawn_reply_task(
            peer,
            Arc::clone(&installed),
            Arc::clone(conn),
            Arc::clone(&self.sessions),
        );
        Ok(installed)
    }
}

fn spawn_reply_task(
    peer: SocketAddr,
    upstream: Arc<UdpSocket>,
    conn: Arc<PacketAdapter>,
    sessions: SessionMap,
) {
    tokio::spawn(async move {
        loop {
            let mut buffer = Buffer::with_capacity(UDP_BUFFER_SIZE);
            let n = match timeout(SESSION_IDLE_TIMEOUT, upstream.recv(buffer.free_mut())).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!(%peer, "udp session recv error: {e}");
                    break;
                }
                Err(_idle) => break,
            };
            buffer.truncate(n);
            if let Err(e) = conn.write_packet(buffer, Address::from(peer)).await {
                if e.is_closed() {
                    break;
                }
                debug!(%peer, "udp session reply error: {e}");
            }
        }
        sessions.lock().remove(&peer);
        debug!(%peer, "udp session closed");
    });
}

#[async_trait]
impl ConnectionHandler for DirectHandler {
    async fn new_connection(
        &self,
        ctx: FlowContext,
        stream: TcpStream,
        mut metadata: FlowMetadata,
    ) -> Result<()> {
        metadata.destination = self.destination.clone();
        self.router
            .route_connection(ctx, Box::new(stream), metadata)
            .await
    }
}

#[async_trait]
impl PacketHandler for DirectHandler {
    async fn new_packet(
        &self,
        ctx: &FlowContext,
        conn: &Arc<PacketAdapter>,
        buffer: &mut Buffer,
        metadata: FlowMetadata,
    ) -> Result<()> {
        let peer = metadata
            .source
            .as_socket()
            .ok_or_else(|| Error::Udp(UdpError::Recv("packet source is not a socket".into())))?;
        let upstream = self.session(peer, conn, ctx, &metadata).await?;
        upstream.send(buffer).await?;
        Ok(())
    }
}

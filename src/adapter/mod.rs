//! Contracts between the inbound engine and its collaborators
//!
//! The engine consumes a [`Router`] and one or more handler
//! implementations; protocol layers implement the handler traits and
//! receive flows from the engine. All traits are object-safe so
//! collaborators can be swapped (and stubbed in tests).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::buf::Buffer;
use crate::common::{Address, FlowContext, FlowMetadata, Stream};
use crate::config::DomainStrategy;
use crate::error::Result;
use crate::inbound::PacketAdapter;

/// A configured local listener that accepts client traffic
#[async_trait]
pub trait Inbound: Send + Sync {
    /// Protocol type of this inbound
    fn inbound_type(&self) -> &str;

    /// Instance tag of this inbound
    fn tag(&self) -> &str;

    /// Bind sockets and launch the accept/receive loops
    async fn start(&self) -> Result<()>;

    /// Stop all loops and release sockets. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Stream handler invoked once per accepted TCP connection.
///
/// On error the engine drops the connection and reports the error with
/// the flow context.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn new_connection(
        &self,
        ctx: FlowContext,
        stream: TcpStream,
        metadata: FlowMetadata,
    ) -> Result<()>;
}

/// Datagram handler invoked once per received packet.
///
/// The buffer is borrowed: in the pooled regime the receive loop reuses
/// it on the next iteration, so the handler must consume it before
/// returning. A handler that retains buffers past return must declare
/// [`PacketHandler::is_thread_unsafe_writer`] (selecting the per-packet
/// regime) and assume ownership via [`Buffer::take`].
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn new_packet(
        &self,
        ctx: &FlowContext,
        conn: &Arc<PacketAdapter>,
        buffer: &mut Buffer,
        metadata: FlowMetadata,
    ) -> Result<()>;

    /// Capability flag: the handler may retain buffers past the next
    /// receive, so each packet needs its own allocation.
    fn is_thread_unsafe_writer(&self) -> bool {
        false
    }
}

/// Datagram handler that also receives the packet's out-of-band control
/// data (e.g. pktinfo). When an inbound carries one of these, the
/// write-back serializer is not started: the handler owns its own
/// return path.
#[async_trait]
pub trait OobPacketHandler: Send + Sync {
    async fn new_packet(
        &self,
        ctx: &FlowContext,
        conn: &Arc<PacketAdapter>,
        buffer: &mut Buffer,
        oob: &[u8],
        metadata: FlowMetadata,
    ) -> Result<()>;

    /// See [`PacketHandler::is_thread_unsafe_writer`]
    fn is_thread_unsafe_writer(&self) -> bool {
        false
    }
}

/// The classifier/dispatcher mapping flows to outbounds
#[async_trait]
pub trait Router: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Replace the outbound set the router selects from
    fn update_outbounds(&self, outbounds: Vec<Arc<dyn Outbound>>);

    /// Route one stream connection
    async fn route_connection(
        &self,
        ctx: FlowContext,
        stream: Stream,
        metadata: FlowMetadata,
    ) -> Result<()>;

    /// Route one packet connection
    async fn route_packet_connection(
        &self,
        ctx: FlowContext,
        conn: Arc<PacketAdapter>,
        metadata: FlowMetadata,
    ) -> Result<()>;
}

/// An upstream transport selected by the router
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Tag referenced by routing rules
    fn tag(&self) -> &str;

    /// Outbound type name
    fn outbound_type(&self) -> &str;

    /// Open a stream to the destination
    async fn dial_tcp(&self, destination: &Address, strategy: DomainStrategy) -> Result<Stream>;

    /// Open an unconnected datagram socket for relaying
    async fn dial_udp(&self) -> Result<tokio::net::UdpSocket>;

    /// Release any held resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("tag", &self.tag())
            .field("outbound_type", &self.outbound_type())
            .finish()
    }
}

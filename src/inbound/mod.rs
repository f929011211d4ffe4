//! The inbound listener engine
//!
//! An [`InboundAdapter`] owns the sockets of one configured inbound and
//! drives its accept/receive loops. Protocol behavior is injected as
//! handler implementations; the engine only binds, receives, builds
//! flow metadata and manages buffer ownership and teardown.
//!
//! Lifecycle: `new → start (bind + launch loops) → close`. Close is
//! idempotent and never restarts.

pub mod direct;
pub mod listener;
pub mod mixed;
pub mod proxy_protocol;
mod tcp;
mod udp;

pub use udp::PacketAdapter;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::adapter::{
    ConnectionHandler, Inbound, OobPacketHandler, PacketHandler, Router,
};
use crate::buf::BufferPool;
use crate::common::{Address, FlowContext, FlowMetadata, Network, ShutdownHandle};
use crate::config::InboundOptions;
use crate::error::{join_close_errors, ConfigError, Error, Result, ServiceError};
use crate::platform::{self, SystemProxyGuard};

/// Bound on how long close waits for each loop to unwind
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Handlers a protocol layer plugs into the engine
#[derive(Default, Clone)]
pub struct InboundHandlers {
    /// Invoked per accepted TCP connection
    pub connection: Option<Arc<dyn ConnectionHandler>>,
    /// Invoked per received datagram
    pub packet: Option<Arc<dyn PacketHandler>>,
    /// Invoked per received datagram with its control data; when set it
    /// takes precedence over `packet` and disables the write-back
    /// serializer
    pub oob_packet: Option<Arc<dyn OobPacketHandler>>,
}

/// Per-inbound counters
#[derive(Debug, Default)]
pub struct InboundStats {
    connections_accepted: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    write_back_packets: AtomicU64,
    write_back_bytes: AtomicU64,
}

impl InboundStats {
    fn record_connection(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_packet(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_write_back(&self, bytes: usize) {
        self.write_back_packets.fetch_add(1, Ordering::Relaxed);
        self.write_back_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> InboundStatsSnapshot {
        InboundStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            write_back_packets: self.write_back_packets.load(Ordering::Relaxed),
            write_back_bytes: self.write_back_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`InboundStats`]
#[derive(Debug, Clone, Copy)]
pub struct InboundStatsSnapshot {
    pub connections_accepted: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub write_back_packets: u64,
    pub write_back_bytes: u64,
}

/// Identity, options and counters shared by an inbound's loops
pub(crate) struct Shared {
    pub(crate) inbound_type: String,
    pub(crate) tag: String,
    pub(crate) options: InboundOptions,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) stats: InboundStats,
}

impl Shared {
    /// Fill the engine-owned metadata fields, leaving already-valid
    /// values in place
    pub(crate) fn fill_metadata(
        &self,
        mut metadata: FlowMetadata,
        network: Network,
        remote: Address,
        local: Option<SocketAddr>,
    ) -> FlowMetadata {
        metadata.inbound_tag = self.tag.clone();
        metadata.inbound_type = self.inbound_type.clone();
        metadata.network = network;
        metadata.sniff_enabled = self.options.sniff;
        metadata.sniff_override_destination = self.options.sniff_override_destination;
        metadata.domain_strategy = self.options.domain_strategy;
        if !metadata.source.is_valid() {
            metadata.source = remote;
        }
        if network == Network::Tcp && !metadata.destination.is_valid() {
            if let Some(local) = local {
                metadata.destination = local.into();
            }
        }
        if metadata.origin_destination.is_none() {
            metadata.origin_destination = local;
        }
        metadata
    }

    /// Metadata for one received datagram
    pub(crate) fn packet_metadata(&self, peer: SocketAddr, bind_addr: SocketAddr) -> FlowMetadata {
        self.fill_metadata(
            FlowMetadata::empty(),
            Network::Udp,
            peer.into(),
            Some(bind_addr),
        )
    }
}

/// Report a flow error through the inbound's sink: closed-or-cancelled
/// conditions are demoted to debug, everything else is an error tagged
/// with the flow id.
pub(crate) fn report_error(ctx: &FlowContext, err: &Error) {
    if err.is_closed() {
        debug!(flow = ctx.flow_id, "connection closed: {err}");
    } else {
        error!(flow = ctx.flow_id, "{err}");
    }
}

#[derive(Default)]
struct State {
    started: bool,
    closed: bool,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    packet_adapter: Option<Arc<PacketAdapter>>,
    tcp_local: Option<SocketAddr>,
    udp_local: Option<SocketAddr>,
    system_proxy: Option<SystemProxyGuard>,
}

/// One configured inbound listener
pub struct InboundAdapter {
    shared: Arc<Shared>,
    handlers: InboundHandlers,
    shutdown: Arc<ShutdownHandle>,
    state: parking_lot::Mutex<State>,
}

impl InboundAdapter {
    /// Create an inbound from its options and injected handlers
    #[must_use]
    pub fn new(
        inbound_type: impl Into<String>,
        options: InboundOptions,
        handlers: InboundHandlers,
        pool: Arc<BufferPool>,
    ) -> Self {
        let (shutdown, _) = ShutdownHandle::new();
        Self {
            shared: Arc::new(Shared {
                inbound_type: inbound_type.into(),
                tag: options.tag.clone(),
                options,
                pool,
                stats: InboundStats::default(),
            }),
            handlers,
            shutdown: Arc::new(shutdown),
            state: parking_lot::Mutex::new(State::default()),
        }
    }

    /// The actual TCP listen address once started
    #[must_use]
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().tcp_local
    }

    /// The actual UDP bind address once started
    #[must_use]
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().udp_local
    }

    /// The packet adapter of a started UDP-enabled inbound
    #[must_use]
    pub fn packet_adapter(&self) -> Option<Arc<PacketAdapter>> {
        self.state.lock().packet_adapter.clone()
    }

    /// Per-inbound counters
    #[must_use]
    pub fn stats(&self) -> InboundStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

#[async_trait]
impl Inbound for InboundAdapter {
    fn inbound_type(&self) -> &str {
        &self.shared.inbound_type
    }

    fn tag(&self) -> &str {
        &self.shared.tag
    }

    async fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.started {
            return Ok(());
        }
        state.started = true;

        let options = &self.shared.options;

        if options.network.has(Network::Tcp) {
            let Some(handler) = self.handlers.connection.clone() else {
                return Err(ServiceError::start(
                    &self.shared.tag,
                    "tcp enabled without a connection handler",
                )
                .into());
            };
            let tcp_listener = listener::bind_tcp(options)?;
            state.tcp_local = tcp_listener.local_addr().ok();
            state.tasks.push(tokio::spawn(tcp::accept_loop(
                tcp_listener,
                Arc::clone(&self.shared),
                handler,
                Arc::clone(&self.shutdown),
            )));
        }

        if options.network.has(Network::Udp) {
            let handler = if let Some(handler) = self.handlers.oob_packet.clone() {
                udp::UdpHandler::Oob(handler)
            } else if let Some(handler) = self.handlers.packet.clone() {
                udp::UdpHandler::Plain(handler)
            } else {
                return Err(ServiceError::start(
                    &self.shared.tag,
                    "udp enabled without a packet handler",
                )
                .into());
            };
            let (socket, bind_addr) = listener::bind_udp(options)?;
            let (adapter, tasks) = udp::start(
                Arc::clone(&self.shared),
                socket,
                bind_addr,
                Arc::clone(&self.shutdown),
                handler,
            );
            state.udp_local = Some(bind_addr);
            state.packet_adapter = Some(adapter);
            state.tasks.extend(tasks);
        }

        if options.set_system_proxy {
            let listen = state.tcp_local.ok_or_else(|| {
                Error::Listen(crate::error::ListenError::SystemProxy(
                    "requires a tcp listener".into(),
                ))
            })?;
            let guard = platform::set_system_proxy(listen, self.shared.inbound_type == "mixed")?;
            state.system_proxy = Some(guard);
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let (tasks, system_proxy) = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            self.shutdown.shutdown();
            (std::mem::take(&mut state.tasks), state.system_proxy.take())
        };

        let mut errors = Vec::new();

        if let Some(guard) = system_proxy {
            if let Err(e) = guard.clear() {
                errors.push(Error::Listen(e));
            }
        }

        for task in tasks {
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                warn!(tag = %self.shared.tag, "inbound loop did not stop in time");
            }
        }

        match join_close_errors(errors) {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Build the inbound for a config entry, wiring the built-in protocol
/// handlers for its type.
pub fn create(
    index: usize,
    options: InboundOptions,
    router: Arc<dyn Router>,
    pool: Arc<BufferPool>,
) -> Result<InboundAdapter> {
    let section = format!("inbound[{index}]");
    let handlers = match options.inbound_type.as_str() {
        "mixed" => {
            if options.network.has(Network::Udp) {
                return Err(ConfigError::validation(
                    section,
                    "inbound type mixed does not support udp",
                )
                .into());
            }
            InboundHandlers {
                connection: Some(Arc::new(mixed::MixedHandler::new(router))),
                ..Default::default()
            }
        }
        "direct" => {
            let destination = direct::override_destination(&options)
                .map_err(|cause| ConfigError::validation(&section, cause))?;
            let handler = Arc::new(direct::DirectHandler::new(router, destination));
            InboundHandlers {
                connection: Some(Arc::clone(&handler) as Arc<dyn ConnectionHandler>),
                packet: Some(handler),
                ..Default::default()
            }
        }
        other => {
            return Err(
                ConfigError::validation(section, format!("unknown inbound type: {other}")).into(),
            );
        }
    };

    let inbound_type = options.inbound_type.clone();
    Ok(InboundAdapter::new(inbound_type, options, handlers, pool))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(options_json: &str) -> Shared {
        let options: InboundOptions = serde_json::from_str(options_json).unwrap();
        Shared {
            inbound_type: "mixed".into(),
            tag: options.tag.clone(),
            options,
            pool: Arc::new(BufferPool::with_defaults()),
            stats: InboundStats::default(),
        }
    }

    #[test]
    fn test_fill_metadata_stamps_identity_and_flags() {
        let shared = shared(
            r#"{
                "type": "mixed", "tag": "in", "listen_port": 1080,
                "sniff": true, "sniff_override_destination": true,
                "domain_strategy": "prefer_ipv6"
            }"#,
        );
        let remote: SocketAddr = "192.0.2.5:40000".parse().unwrap();
        let local: SocketAddr = "127.0.0.1:1080".parse().unwrap();

        let metadata = shared.fill_metadata(
            FlowMetadata::empty(),
            Network::Tcp,
            remote.into(),
            Some(local),
        );

        assert_eq!(metadata.inbound_tag, "in");
        assert_eq!(metadata.inbound_type, "mixed");
        assert_eq!(metadata.source, Address::Socket(remote));
        assert_eq!(metadata.destination, Address::Socket(local));
        assert_eq!(metadata.origin_destination, Some(local));
        assert!(metadata.sniff_enabled);
        assert!(metadata.sniff_override_destination);
        assert_eq!(
            metadata.domain_strategy,
            crate::config::DomainStrategy::PreferIpv6
        );
    }

    #[test]
    fn test_fill_metadata_keeps_valid_source() {
        let shared = shared(r#"{ "type": "mixed", "tag": "in", "listen_port": 1080 }"#);
        let declared = Address::Socket("203.0.113.9:777".parse().unwrap());
        let mut seed = FlowMetadata::empty();
        seed.source = declared.clone();

        let metadata = shared.fill_metadata(
            seed,
            Network::Tcp,
            Address::Socket("192.0.2.5:40000".parse().unwrap()),
            None,
        );

        assert_eq!(metadata.source, declared);
    }

    #[test]
    fn test_packet_metadata_leaves_destination_unset() {
        let shared = shared(r#"{ "type": "mixed", "tag": "in", "listen_port": 1080 }"#);
        let peer: SocketAddr = "192.0.2.5:50000".parse().unwrap();
        let bind: SocketAddr = "127.0.0.1:1080".parse().unwrap();

        let metadata = shared.packet_metadata(peer, bind);

        assert_eq!(metadata.network, Network::Udp);
        assert_eq!(metadata.source, Address::Socket(peer));
        assert!(!metadata.destination.is_valid());
        assert_eq!(metadata.origin_destination, Some(bind));
        assert!(metadata.source.is_valid());
    }
}

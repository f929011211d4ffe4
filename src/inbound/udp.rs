//! UDP receive loops, the write-back serializer and the packet adapter
//!
//! One of four receive-loop variants runs per UDP-enabled inbound,
//! selected once at start: plain or OOB receive, crossed with the
//! pooled or per-packet buffer regime. The hot loops carry no
//! capability branches.
//!
//! The return path is a capacity-1 channel into a single writer task,
//! so producers get natural backpressure and the socket sees one send
//! at a time. When the receive loop exits it flips the closed flag; the
//! writer then refuses new envelopes, drains the channel by releasing
//! the remaining buffers, and returns. A producer parked in
//! `write_packet` at that moment gets its envelope back from the
//! channel, releases it, and observes the closed error. An envelope is
//! never sent after the close signal and never leaked.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use tokio::io::Interest;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{report_error, Shared};
use crate::adapter::{OobPacketHandler, PacketHandler};
use crate::buf::Buffer;
use crate::common::{Address, FlowContext, ShutdownHandle, ShutdownSignal};
use crate::config::DomainStrategy;
use crate::error::{is_closed_io, Error, UdpError};

/// Control-message buffer size for the OOB variants
const OOB_BUFFER_SIZE: usize = 1024;

/// Handler carried by a UDP-enabled inbound
#[derive(Clone)]
pub(super) enum UdpHandler {
    Plain(Arc<dyn PacketHandler>),
    Oob(Arc<dyn OobPacketHandler>),
}

impl UdpHandler {
    fn is_thread_unsafe_writer(&self) -> bool {
        match self {
            UdpHandler::Plain(h) => h.is_thread_unsafe_writer(),
            UdpHandler::Oob(h) => h.is_thread_unsafe_writer(),
        }
    }
}

/// One queued return datagram
struct PacketEnvelope {
    buffer: Buffer,
    destination: Address,
}

/// Bind the receive-loop variant and (for the non-OOB path) the writer
/// task for one inbound. Returns the packet adapter handed to handlers
/// and the spawned task handles.
pub(super) fn start(
    shared: Arc<Shared>,
    socket: UdpSocket,
    bind_addr: SocketAddr,
    shutdown: Arc<ShutdownHandle>,
    handler: UdpHandler,
) -> (Arc<PacketAdapter>, Vec<tokio::task::JoinHandle<()>>) {
    let socket = Arc::new(socket);
    let (outbound_tx, outbound_rx) = mpsc::channel(1);
    let (closed_tx, closed_rx) = watch::channel(false);

    let writer_enabled = matches!(handler, UdpHandler::Plain(_));
    let adapter = Arc::new(PacketAdapter {
        socket: Arc::clone(&socket),
        bind_addr,
        outbound_tx,
        closed_rx: closed_rx.clone(),
        writer_enabled,
        shutdown: Arc::clone(&shutdown),
        read_deadline: parking_lot::Mutex::new(None),
        write_deadline: parking_lot::Mutex::new(None),
    });

    let per_packet = handler.is_thread_unsafe_writer();
    let recv = RecvLoop {
        ctx: FlowContext::new(&shared.tag, shutdown.signal()),
        shared: Arc::clone(&shared),
        socket: Arc::clone(&socket),
        bind_addr,
        adapter: Arc::clone(&adapter),
        shutdown: shutdown.signal(),
        closed_tx,
    };

    let mut tasks = Vec::new();
    match handler {
        UdpHandler::Plain(handler) => {
            if per_packet {
                tasks.push(tokio::spawn(recv.run_per_packet(handler)));
            } else {
                tasks.push(tokio::spawn(recv.run_pooled(handler)));
            }
            tasks.push(tokio::spawn(write_back_loop(
                socket,
                outbound_rx,
                closed_rx,
                shared.options.domain_strategy,
                shared,
            )));
        }
        UdpHandler::Oob(handler) => {
            // The handler owns its own return path; no writer task
            if per_packet {
                tasks.push(tokio::spawn(recv.run_oob_per_packet(handler)));
            } else {
                tasks.push(tokio::spawn(recv.run_oob_pooled(handler)));
            }
        }
    }

    (adapter, tasks)
}

/// State shared by the four receive-loop variants
struct RecvLoop {
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    bind_addr: SocketAddr,
    adapter: Arc<PacketAdapter>,
    ctx: FlowContext,
    shutdown: ShutdownSignal,
    closed_tx: watch::Sender<bool>,
}

impl RecvLoop {
    async fn run_pooled(mut self, handler: Arc<dyn PacketHandler>) {
        let mut buffer = self.shared.pool.get();
        loop {
            buffer.reset();
            let (n, peer) = tokio::select! {
                r = self.socket.recv_from(buffer.free_mut()) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("udp receive loop exiting: {e}");
                        break;
                    }
                },
                _ = self.shutdown.recv() => break,
            };
            buffer.truncate(n);
            self.shared.stats.record_packet(n);
            let metadata = self.shared.packet_metadata(peer, self.bind_addr);
            if let Err(e) = handler
                .new_packet(&self.ctx, &self.adapter, &mut buffer, metadata)
                .await
            {
                report_error(&self.ctx, &e);
            }
        }
        drop(buffer);
        let _ = self.closed_tx.send(true);
    }

    async fn run_per_packet(mut self, handler: Arc<dyn PacketHandler>) {
        loop {
            let mut buffer = self.shared.pool.get();
            let (n, peer) = tokio::select! {
                r = self.socket.recv_from(buffer.free_mut()) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("udp receive loop exiting: {e}");
                        break;
                    }
                },
                _ = self.shutdown.recv() => break,
            };
            buffer.truncate(n);
            self.shared.stats.record_packet(n);
            let metadata = self.shared.packet_metadata(peer, self.bind_addr);
            if let Err(e) = handler
                .new_packet(&self.ctx, &self.adapter, &mut buffer, metadata)
                .await
            {
                report_error(&self.ctx, &e);
            }
            // Ownership passed to the handler via take(); whatever it
            // left behind is released here.
        }
        let _ = self.closed_tx.send(true);
    }

    async fn run_oob_pooled(mut self, handler: Arc<dyn OobPacketHandler>) {
        let mut buffer = self.shared.pool.get();
        let mut oob = vec![0u8; OOB_BUFFER_SIZE];
        loop {
            buffer.reset();
            let (n, oob_n, peer) = tokio::select! {
                r = recv_msg(&self.socket, buffer.free_mut(), &mut oob) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("udp receive loop exiting: {e}");
                        break;
                    }
                },
                _ = self.shutdown.recv() => break,
            };
            buffer.truncate(n);
            self.shared.stats.record_packet(n);
            let metadata = self.shared.packet_metadata(peer, self.bind_addr);
            if let Err(e) = handler
                .new_packet(&self.ctx, &self.adapter, &mut buffer, &oob[..oob_n], metadata)
                .await
            {
                report_error(&self.ctx, &e);
            }
        }
        drop(buffer);
        let _ = self.closed_tx.send(true);
    }

    async fn run_oob_per_packet(mut self, handler: Arc<dyn OobPacketHandler>) {
        let mut oob = vec![0u8; OOB_BUFFER_SIZE];
        loop {
            let mut buffer = self.shared.pool.get();
            let (n, oob_n, peer) = tokio::select! {
                r = recv_msg(&self.socket, buffer.free_mut(), &mut oob) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("udp receive loop exiting: {e}");
                        break;
                    }
                },
                _ = self.shutdown.recv() => break,
            };
            buffer.truncate(n);
            self.shared.stats.record_packet(n);
            let metadata = self.shared.packet_metadata(peer, self.bind_addr);
            if let Err(e) = handler
                .new_packet(&self.ctx, &self.adapter, &mut buffer, &oob[..oob_n], metadata)
                .await
            {
                report_error(&self.ctx, &e);
            }
        }
        let _ = self.closed_tx.send(true);
    }
}

/// Single consumer of the return channel
async fn write_back_loop(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<PacketEnvelope>,
    mut closed: watch::Receiver<bool>,
    strategy: DomainStrategy,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(envelope) => {
                    if let Err(e) = send_envelope(&socket, envelope, strategy, &shared).await {
                        let e = Error::Udp(e);
                        if e.is_closed() {
                            debug!("write back udp: {e}");
                        } else {
                            warn!("write back udp: {e}");
                        }
                    }
                }
                None => return,
            },
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
            }
        }
    }
    // Close signal observed: no further sends. Refuse new envelopes,
    // then release everything still queued. Producers parked in send()
    // get their envelope back and release it themselves.
    rx.close();
    while let Ok(envelope) = rx.try_recv() {
        envelope.buffer.release();
    }
}

async fn send_envelope(
    socket: &UdpSocket,
    envelope: PacketEnvelope,
    strategy: DomainStrategy,
    shared: &Shared,
) -> Result<(), UdpError> {
    let PacketEnvelope {
        buffer,
        destination,
    } = envelope;
    let target = destination.resolve(strategy).await?;
    socket.send_to(&buffer, target).await.map_err(|e| {
        if is_closed_io(&e) {
            UdpError::Closed
        } else {
            UdpError::send(&destination, e)
        }
    })?;
    shared.stats.record_write_back(buffer.len());
    Ok(())
}

/// The duplex packet capability exposed to handlers.
///
/// Reads come straight off the inbound socket; writes are funneled
/// through the write-back serializer.
pub struct PacketAdapter {
    socket: Arc<UdpSocket>,
    bind_addr: SocketAddr,
    outbound_tx: mpsc::Sender<PacketEnvelope>,
    closed_rx: watch::Receiver<bool>,
    writer_enabled: bool,
    shutdown: Arc<ShutdownHandle>,
    read_deadline: parking_lot::Mutex<Option<Instant>>,
    write_deadline: parking_lot::Mutex<Option<Instant>>,
}

impl PacketAdapter {
    /// Receive one datagram into the buffer, returning its source
    pub async fn read_packet(&self, buffer: &mut Buffer) -> Result<Address, UdpError> {
        buffer.reset();
        let deadline = *self.read_deadline.lock();
        let recv = self.socket.recv_from(buffer.free_mut());
        let (n, peer) = match deadline {
            Some(at) => tokio::time::timeout_at(at, recv)
                .await
                .map_err(|_| UdpError::Recv("read deadline exceeded".into()))?,
            None => recv.await,
        }
        .map_err(|e| UdpError::Recv(e.to_string()))?;
        buffer.truncate(n);
        Ok(Address::from(peer))
    }

    /// Queue one datagram for the write-back serializer.
    ///
    /// Ownership of the buffer transfers here; on any error the buffer
    /// has already been released. Returns [`UdpError::Closed`] once the
    /// close signal is observed, and also for inbounds whose handler
    /// declared the OOB capability, which have no writer task at all.
    pub async fn write_packet(&self, buffer: Buffer, destination: Address) -> Result<(), UdpError> {
        if !self.writer_enabled || *self.closed_rx.borrow() {
            buffer.release();
            return Err(UdpError::Closed);
        }

        let deadline = *self.write_deadline.lock();
        let envelope = PacketEnvelope {
            buffer,
            destination,
        };
        let send = self.outbound_tx.send(envelope);
        let result = match deadline {
            Some(at) => match tokio::time::timeout_at(at, send).await {
                Ok(r) => r,
                // The cancelled send future drops the envelope,
                // releasing the buffer.
                Err(_) => {
                    return Err(UdpError::send(
                        "write back channel",
                        "write deadline exceeded",
                    ))
                }
            },
            None => send.await,
        };
        result.map_err(|rejected| {
            rejected.0.buffer.release();
            UdpError::Closed
        })
    }

    /// The local address this inbound's UDP socket is bound to
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Deadline for subsequent `read_packet` and `write_packet` calls
    pub fn set_deadline(&self, at: Option<Instant>) {
        *self.read_deadline.lock() = at;
        *self.write_deadline.lock() = at;
    }

    /// Deadline for subsequent `read_packet` calls
    pub fn set_read_deadline(&self, at: Option<Instant>) {
        *self.read_deadline.lock() = at;
    }

    /// Deadline for subsequent `write_packet` calls
    pub fn set_write_deadline(&self, at: Option<Instant>) {
        *self.write_deadline.lock() = at;
    }

    /// Stop the owning inbound's loops
    pub fn close(&self) {
        self.shutdown.shutdown();
    }

    /// The underlying socket
    #[must_use]
    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }
}

/// Receive one datagram together with its ancillary control data
async fn recv_msg(
    socket: &UdpSocket,
    buf: &mut [u8],
    oob: &mut [u8],
) -> io::Result<(usize, usize, SocketAddr)> {
    let fd = socket.as_raw_fd();
    loop {
        socket.readable().await?;
        match socket.try_io(Interest::READABLE, || recvmsg_once(fd, &mut *buf, &mut *oob)) {
            Ok(result) => return Ok(result),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

#[allow(clippy::cast_possible_truncation)] // lengths bounded by buffer sizes
fn recvmsg_once(fd: RawFd, buf: &mut [u8], oob: &mut [u8]) -> io::Result<(usize, usize, SocketAddr)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };
    let mut src: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(src).cast::<libc::c_void>();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = std::ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;
    msg.msg_control = oob.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = oob.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let oob_n = msg.msg_controllen as usize;
    let source = sockaddr_to_std(&src)?;
    Ok((n as usize, oob_n, source))
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match i32::from(storage.ss_family) {
        libc::AF_INET => {
            let addr = unsafe { &*std::ptr::from_ref(storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let addr = unsafe { &*std::ptr::from_ref(storage).cast::<libc::sockaddr_in6>() };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected source address family: {family}"),
        )),
    }
}

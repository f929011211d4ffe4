//! Integration tests for the TCP accept path: SOCKS5/HTTP decoding via
//! the mixed handler, PROXY protocol source rewriting and teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use sing_box::adapter::{ConnectionHandler, Inbound, Outbound, Router};
use sing_box::buf::BufferPool;
use sing_box::common::{FlowContext, FlowMetadata, Stream};
use sing_box::config::InboundOptions;
use sing_box::error::Result;
use sing_box::inbound::mixed::MixedHandler;
use sing_box::inbound::{InboundAdapter, InboundHandlers, PacketAdapter};
use sing_box::Address;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn tcp_options(proxy_protocol: bool) -> InboundOptions {
    serde_json::from_str(&format!(
        r#"{{
            "type": "mixed", "tag": "in",
            "listen": "127.0.0.1", "listen_port": 0,
            "network": "tcp",
            "proxy_protocol": {proxy_protocol}
        }}"#
    ))
    .unwrap()
}

/// Router stub that ignores the declared destination and relays every
/// connection to a fixed upstream address.
struct StubRouter {
    upstream: SocketAddr,
    destinations: mpsc::UnboundedSender<Address>,
}

#[async_trait]
impl Router for StubRouter {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn update_outbounds(&self, _outbounds: Vec<Arc<dyn Outbound>>) {}

    async fn route_connection(
        &self,
        _ctx: FlowContext,
        mut stream: Stream,
        metadata: FlowMetadata,
    ) -> Result<()> {
        assert!(metadata.source.is_valid());
        let _ = self.destinations.send(metadata.destination.clone());
        let mut upstream = TcpStream::connect(self.upstream).await?;
        tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
        Ok(())
    }

    async fn route_packet_connection(
        &self,
        _ctx: FlowContext,
        _conn: Arc<PacketAdapter>,
        _metadata: FlowMetadata,
    ) -> Result<()> {
        Ok(())
    }
}

/// Echo server returning whatever it receives
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Records flow metadata without consuming the stream
struct MetadataRecorder {
    events: mpsc::UnboundedSender<FlowMetadata>,
}

#[async_trait]
impl ConnectionHandler for MetadataRecorder {
    async fn new_connection(
        &self,
        _ctx: FlowContext,
        _stream: TcpStream,
        metadata: FlowMetadata,
    ) -> Result<()> {
        let _ = self.events.send(metadata);
        Ok(())
    }
}

#[tokio::test]
async fn test_socks5_connect_echo() {
    let echo = spawn_echo_server().await;
    let (destinations_tx, mut destinations) = mpsc::unbounded_channel();
    let router = Arc::new(StubRouter {
        upstream: echo,
        destinations: destinations_tx,
    });

    let inbound = InboundAdapter::new(
        "mixed",
        tcp_options(false),
        InboundHandlers {
            connection: Some(Arc::new(MixedHandler::new(router))),
            ..Default::default()
        },
        Arc::new(BufferPool::with_defaults()),
    );
    inbound.start().await.unwrap();
    let target = inbound.tcp_local_addr().unwrap();

    let mut client = TcpStream::connect(target).await.unwrap();

    // SOCKS5: greeting, no-auth, CONNECT example.test:80
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, 12];
    request.extend_from_slice(b"example.test");
    request.extend_from_slice(&80u16.to_be_bytes());
    client.write_all(&request).await.unwrap();
    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply[1], 0x00);

    client.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    timeout(TEST_TIMEOUT, client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"hello");

    let destination = timeout(TEST_TIMEOUT, destinations.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(destination, Address::Domain("example.test".into(), 80));

    inbound.close().await.unwrap();
}

#[tokio::test]
async fn test_http_connect_echo() {
    let echo = spawn_echo_server().await;
    let (destinations_tx, mut destinations) = mpsc::unbounded_channel();
    let router = Arc::new(StubRouter {
        upstream: echo,
        destinations: destinations_tx,
    });

    let inbound = InboundAdapter::new(
        "mixed",
        tcp_options(false),
        InboundHandlers {
            connection: Some(Arc::new(MixedHandler::new(router))),
            ..Default::default()
        },
        Arc::new(BufferPool::with_defaults()),
    );
    inbound.start().await.unwrap();
    let target = inbound.tcp_local_addr().unwrap();

    let mut client = TcpStream::connect(target).await.unwrap();
    client
        .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).await.unwrap();
        head.extend_from_slice(&byte);
    }
    assert!(head.starts_with(b"HTTP/1.1 200"));

    client.write_all(b"tunnel data").await.unwrap();
    let mut echoed = [0u8; 11];
    timeout(TEST_TIMEOUT, client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"tunnel data");

    let destination = timeout(TEST_TIMEOUT, destinations.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(destination, Address::Domain("example.test".into(), 443));

    inbound.close().await.unwrap();
}

#[tokio::test]
async fn test_proxy_protocol_rewrites_source() {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let inbound = InboundAdapter::new(
        "mixed",
        tcp_options(true),
        InboundHandlers {
            connection: Some(Arc::new(MetadataRecorder { events: events_tx })),
            ..Default::default()
        },
        Arc::new(BufferPool::with_defaults()),
    );
    inbound.start().await.unwrap();
    let target = inbound.tcp_local_addr().unwrap();

    let mut client = TcpStream::connect(target).await.unwrap();
    client
        .write_all(b"PROXY TCP4 192.0.2.7 10.0.0.1 1234 443\r\n")
        .await
        .unwrap();

    let metadata = timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap();
    assert_eq!(
        metadata.source,
        Address::Socket("192.0.2.7:1234".parse().unwrap())
    );

    inbound.close().await.unwrap();
}

#[tokio::test]
async fn test_accept_loop_stops_on_close() {
    let (events_tx, _events) = mpsc::unbounded_channel();
    let inbound = InboundAdapter::new(
        "mixed",
        tcp_options(false),
        InboundHandlers {
            connection: Some(Arc::new(MetadataRecorder { events: events_tx })),
            ..Default::default()
        },
        Arc::new(BufferPool::with_defaults()),
    );
    inbound.start().await.unwrap();
    let target = inbound.tcp_local_addr().unwrap();

    timeout(Duration::from_secs(2), inbound.close())
        .await
        .expect("close within bounded time")
        .unwrap();

    // The listener is gone after close
    let connect = TcpStream::connect(target).await;
    assert!(connect.is_err());
}

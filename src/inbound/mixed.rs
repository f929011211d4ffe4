//! Mixed SOCKS5/HTTP inbound handler
//!
//! Auto-detects the protocol from the first byte of each connection:
//! `0x05` starts a SOCKS5 handshake, anything else is treated as HTTP.
//! Only CONNECT is supported on both; the parsed destination lands in
//! the flow metadata and the connection is handed to the router.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::adapter::{ConnectionHandler, Router};
use crate::common::{Address, FlowContext, FlowMetadata};
use crate::error::{Error, Result};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;
const SOCKS5_REPLY_SUCCESS: u8 = 0x00;
const SOCKS5_REPLY_CMD_UNSUPPORTED: u8 = 0x07;

/// Upper bound on an HTTP request head
const HTTP_MAX_HEADER: usize = 8192;

/// Connection handler decoding SOCKS5 or HTTP CONNECT
pub struct MixedHandler {
    router: Arc<dyn Router>,
}

impl MixedHandler {
    /// Create a handler that routes decoded flows through `router`
    pub fn new(router: Arc<dyn Router>) -> Self {
        Self { router }
    }

    async fn handle_socks5(
        &self,
        ctx: FlowContext,
        mut stream: TcpStream,
        mut metadata: FlowMetadata,
    ) -> Result<()> {
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await?;
        if greeting[0] != SOCKS5_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported socks version: {}",
                greeting[0]
            )));
        }
        let mut methods = vec![0u8; usize::from(greeting[1])];
        stream.read_exact(&mut methods).await?;
        stream
            .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_NONE])
            .await?;

        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await?;
        if request[0] != SOCKS5_VERSION {
            return Err(Error::Protocol("malformed socks request".into()));
        }
        if request[1] != SOCKS5_CMD_CONNECT {
            let reply = [
                SOCKS5_VERSION,
                SOCKS5_REPLY_CMD_UNSUPPORTED,
                0,
                SOCKS5_ATYP_IPV4,
                0,
                0,
                0,
                0,
                0,
                0,
            ];
            stream.write_all(&reply).await?;
            return Err(Error::Protocol(format!(
                "unsupported socks command: {}",
                request[1]
            )));
        }

        let destination = read_socks5_address(&mut stream, request[3]).await?;

        let reply = [
            SOCKS5_VERSION,
            SOCKS5_REPLY_SUCCESS,
            0,
            SOCKS5_ATYP_IPV4,
            0,
            0,
            0,
            0,
            0,
            0,
        ];
        stream.write_all(&reply).await?;

        debug!(flow = ctx.flow_id, %destination, "socks5 connect");
        metadata.destination = destination;
        self.router
            .route_connection(ctx, Box::new(stream), metadata)
            .await
    }

    async fn handle_http(
        &self,
        ctx: FlowContext,
        mut stream: TcpStream,
        mut metadata: FlowMetadata,
    ) -> Result<()> {
        let (head, leftover) = read_http_head(&mut stream).await?;
        let destination = match parse_connect_line(&head) {
            Ok(destination) => destination,
            Err(e) => {
                let _ = stream
                    .write_all(b"HTTP/1.1 405 Method Not Allowed\r\ncontent-length: 0\r\n\r\n")
                    .await;
                return Err(e);
            }
        };

        stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;

        debug!(flow = ctx.flow_id, %destination, "http connect");
        metadata.destination = destination;
        let stream: crate::common::Stream = if leftover.is_empty() {
            Box::new(stream)
        } else {
            // Early bytes the client pipelined after its request head
            Box::new(PrefixedStream::new(leftover, stream))
        };
        self.router.route_connection(ctx, stream, metadata).await
    }
}

#[async_trait]
impl ConnectionHandler for MixedHandler {
    async fn new_connection(
        &self,
        ctx: FlowContext,
        stream: TcpStream,
        metadata: FlowMetadata,
    ) -> Result<()> {
        let mut first = [0u8; 1];
        let n = stream.peek(&mut first).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before handshake",
            )));
        }
        if first[0] == SOCKS5_VERSION {
            self.handle_socks5(ctx, stream, metadata).await
        } else {
            self.handle_http(ctx, stream, metadata).await
        }
    }
}

async fn read_socks5_address(stream: &mut TcpStream, atyp: u8) -> Result<Address> {
    match atyp {
        SOCKS5_ATYP_IPV4 => {
            let mut raw = [0u8; 4];
            stream.read_exact(&mut raw).await?;
            let port = stream.read_u16().await?;
            Ok(Address::Socket(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(raw)),
                port,
            )))
        }
        SOCKS5_ATYP_DOMAIN => {
            let len = usize::from(stream.read_u8().await?);
            let mut raw = vec![0u8; len];
            stream.read_exact(&mut raw).await?;
            let port = stream.read_u16().await?;
            let domain = String::from_utf8(raw)
                .map_err(|_| Error::Protocol("socks domain is not utf-8".into()))?;
            Ok(Address::Domain(domain, port))
        }
        SOCKS5_ATYP_IPV6 => {
            let mut raw = [0u8; 16];
            stream.read_exact(&mut raw).await?;
            let port = stream.read_u16().await?;
            Ok(Address::Socket(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(raw)),
                port,
            )))
        }
        other => Err(Error::Protocol(format!(
            "unsupported socks address type: {other}"
        ))),
    }
}

/// Read until the end of the HTTP request head. Returns the head and
/// any payload bytes read past it.
async fn read_http_head(stream: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut data = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Protocol("eof inside http request head".into()));
        }
        data.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&data) {
            let leftover = data.split_off(end);
            return Ok((data, leftover));
        }
        if data.len() > HTTP_MAX_HEADER {
            return Err(Error::Protocol("http request head too large".into()));
        }
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_connect_line(head: &[u8]) -> Result<Address> {
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::Protocol("http request head is not utf-8".into()))?;
    let line = text
        .lines()
        .next()
        .ok_or_else(|| Error::Protocol("empty http request".into()))?;

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Protocol("malformed http request line".into()));
    };
    if !method.eq_ignore_ascii_case("CONNECT") {
        return Err(Error::Protocol(format!(
            "unsupported http method: {method}"
        )));
    }

    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| Error::Protocol(format!("connect target without port: {target}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Protocol(format!("bad connect port: {port}")))?;

    // Bracketed IPv6 literals and plain IPs become socket addresses
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        Ok(Address::Socket(SocketAddr::new(ip, port)))
    } else {
        Ok(Address::Domain(host.to_string(), port))
    }
}

/// Stream that replays buffered bytes before reading the inner stream
struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_line() {
        let head = b"CONNECT example.test:80 HTTP/1.1\r\nHost: example.test:80\r\n\r\n";
        let destination = parse_connect_line(head).unwrap();
        assert_eq!(destination, Address::Domain("example.test".into(), 80));
    }

    #[test]
    fn test_parse_connect_ip_literal() {
        let destination = parse_connect_line(b"CONNECT 192.0.2.1:443 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(
            destination,
            Address::Socket("192.0.2.1:443".parse().unwrap())
        );

        let destination =
            parse_connect_line(b"CONNECT [2001:db8::1]:443 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(
            destination,
            Address::Socket("[2001:db8::1]:443".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_connect_rejects_other_methods() {
        assert!(parse_connect_line(b"GET / HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_connect_line(b"CONNECT no-port HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"a\r\n\r\nrest"), Some(5));
        assert_eq!(find_head_end(b"partial\r\n"), None);
    }

    #[tokio::test]
    async fn test_prefixed_stream_replays_prefix() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut stream = PrefixedStream::new(b"early".to_vec(), server);

        let mut out = [0u8; 5];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"early");
    }
}

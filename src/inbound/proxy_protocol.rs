//! PROXY protocol header consumption
//!
//! When an inbound sits behind a load balancer that prepends a PROXY
//! protocol header (v1 text or v2 binary), the header is consumed from
//! each accepted connection before any payload byte is exposed, and the
//! declared client address replaces the kernel-visible peer as the flow
//! source.
//!
//! v2 carries explicit lengths and is read exactly; the v1 line is read
//! byte-wise up to its CRLF so no payload byte is ever consumed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::common::Address;
use crate::error::{Error, Result};

/// v2 binary signature
const V2_SIGNATURE: [u8; 12] = *b"\r\n\r\n\x00\r\nQUIT\n";

/// Longest possible v1 line ("PROXY TCP6 ... \r\n")
const V1_MAX_LEN: usize = 107;

/// Consume a PROXY protocol header from the stream.
///
/// Returns the declared source address, or `None` for headers that do
/// not carry one (v1 `UNKNOWN`, v2 `LOCAL`); the caller keeps the
/// kernel-visible peer in that case.
pub async fn read_proxy_header<S>(stream: &mut S) -> Result<Option<Address>>
where
    S: AsyncRead + Unpin,
{
    // Both versions are distinguishable after 12 bytes, and no valid
    // header is shorter than that.
    let mut head = [0u8; 12];
    stream.read_exact(&mut head).await?;

    let source = if head == V2_SIGNATURE {
        let mut rest = [0u8; 4];
        stream.read_exact(&mut rest).await?;
        let len = usize::from(u16::from_be_bytes([rest[2], rest[3]]));
        let mut addrs = vec![0u8; len];
        stream.read_exact(&mut addrs).await?;
        parse_v2(rest[0], rest[1], &addrs)?
    } else if head.starts_with(b"PROXY ") {
        let mut line = Vec::with_capacity(V1_MAX_LEN);
        line.extend_from_slice(&head);
        loop {
            if line.len() >= V1_MAX_LEN {
                return Err(Error::Protocol("proxy protocol v1: header too long".into()));
            }
            let byte = stream.read_u8().await?;
            line.push(byte);
            if line.ends_with(b"\r\n") {
                break;
            }
        }
        parse_v1(&line)?
    } else {
        return Err(Error::Protocol("missing PROXY protocol header".into()));
    };

    Ok(source.map(Address::from))
}

/// Parse a complete v1 text line (including the trailing CRLF)
pub(crate) fn parse_v1(line: &[u8]) -> Result<Option<SocketAddr>> {
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::Protocol("proxy protocol v1: not ascii".into()))?;
    let text = text
        .strip_suffix("\r\n")
        .ok_or_else(|| Error::Protocol("proxy protocol v1: unterminated header".into()))?;

    let mut fields = text.split(' ');
    let (Some("PROXY"), Some(family)) = (fields.next(), fields.next()) else {
        return Err(Error::Protocol("proxy protocol v1: malformed header".into()));
    };

    match family {
        "UNKNOWN" => Ok(None),
        "TCP4" | "TCP6" => {
            let (Some(src_ip), Some(_dst_ip), Some(src_port), Some(_dst_port)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                return Err(Error::Protocol(
                    "proxy protocol v1: missing address fields".into(),
                ));
            };
            let ip: IpAddr = src_ip
                .parse()
                .map_err(|_| Error::Protocol(format!("proxy protocol v1: bad ip: {src_ip}")))?;
            let port: u16 = src_port
                .parse()
                .map_err(|_| Error::Protocol(format!("proxy protocol v1: bad port: {src_port}")))?;
            Ok(Some(SocketAddr::new(ip, port)))
        }
        other => Err(Error::Protocol(format!(
            "proxy protocol v1: unknown family: {other}"
        ))),
    }
}

/// Parse the v2 fields following the signature: version/command byte,
/// family/protocol byte and the address block
pub(crate) fn parse_v2(ver_cmd: u8, family_proto: u8, addrs: &[u8]) -> Result<Option<SocketAddr>> {
    if ver_cmd >> 4 != 2 {
        return Err(Error::Protocol(format!(
            "proxy protocol v2: unknown version: {}",
            ver_cmd >> 4
        )));
    }

    // LOCAL command: health checks etc., no address block to honor
    if ver_cmd & 0x0f == 0 {
        return Ok(None);
    }

    match family_proto >> 4 {
        // AF_INET: src4 dst4 sport dport
        1 => {
            if addrs.len() < 12 {
                return Err(Error::Protocol(
                    "proxy protocol v2: short inet address block".into(),
                ));
            }
            let ip = Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]);
            let port = u16::from_be_bytes([addrs[8], addrs[9]]);
            Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        // AF_INET6: src16 dst16 sport dport
        2 => {
            if addrs.len() < 36 {
                return Err(Error::Protocol(
                    "proxy protocol v2: short inet6 address block".into(),
                ));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addrs[..16]);
            let port = u16::from_be_bytes([addrs[32], addrs[33]]);
            Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
        }
        // AF_UNSPEC / AF_UNIX: nothing usable as a source
        _ => Ok(None),
    }
}

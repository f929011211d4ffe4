//! Outbound transports
//!
//! Thin upstream dialers selected by the router. `direct` opens plain
//! sockets to the destination; `block` refuses everything.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::adapter::Outbound;
use crate::common::{Address, Stream};
use crate::config::{DomainStrategy, OutboundOptions};
use crate::error::{ConfigError, Error, Result};

/// Build the outbound for a config entry
pub fn create(index: usize, options: &OutboundOptions) -> Result<Arc<dyn Outbound>> {
    let tag = options.effective_tag().to_string();
    match options.outbound_type.as_str() {
        "direct" => Ok(Arc::new(DirectOutbound { tag })),
        "block" => Ok(Arc::new(BlockOutbound { tag })),
        other => Err(ConfigError::validation(
            format!("outbound[{index}]"),
            format!("unknown outbound type: {other}"),
        )
        .into()),
    }
}

/// Plain connection to the destination
pub struct DirectOutbound {
    tag: String,
}

impl DirectOutbound {
    /// Direct outbound with the given tag
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

#[async_trait]
impl Outbound for DirectOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> &str {
        "direct"
    }

    async fn dial_tcp(&self, destination: &Address, strategy: DomainStrategy) -> Result<Stream> {
        let target = destination.resolve(strategy).await?;
        let stream = TcpStream::connect(target).await?;
        debug!(%destination, "outbound connection opened");
        Ok(Box::new(stream))
    }

    async fn dial_udp(&self) -> Result<UdpSocket> {
        let bind: SocketAddr = "0.0.0.0:0".parse().unwrap();
        Ok(UdpSocket::bind(bind).await?)
    }
}

/// Refuses every flow
pub struct BlockOutbound {
    tag: String,
}

impl BlockOutbound {
    /// Block outbound with the given tag
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

#[async_trait]
impl Outbound for BlockOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> &str {
        "block"
    }

    async fn dial_tcp(&self, destination: &Address, _strategy: DomainStrategy) -> Result<Stream> {
        Err(Error::Route(format!("connection to {destination} blocked")))
    }

    async fn dial_udp(&self) -> Result<UdpSocket> {
        Err(Error::Route("udp blocked".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_types() {
        let direct: OutboundOptions =
            serde_json::from_str(r#"{ "type": "direct" }"#).unwrap();
        assert_eq!(create(0, &direct).unwrap().outbound_type(), "direct");

        let block: OutboundOptions =
            serde_json::from_str(r#"{ "type": "block", "tag": "deny" }"#).unwrap();
        let block = create(1, &block).unwrap();
        assert_eq!(block.outbound_type(), "block");
        assert_eq!(block.tag(), "deny");
    }

    #[test]
    fn test_create_unknown_type() {
        let options: OutboundOptions =
            serde_json::from_str(r#"{ "type": "wormhole" }"#).unwrap();
        let err = create(3, &options).unwrap_err();
        assert!(err.to_string().contains("outbound[3]"));
    }

    #[tokio::test]
    async fn test_block_refuses() {
        let block = BlockOutbound::new("block");
        let result = block
            .dial_tcp(
                &Address::Socket("127.0.0.1:80".parse().unwrap()),
                DomainStrategy::AsIs,
            )
            .await;
        assert!(matches!(result, Err(Error::Route(_))));
    }

    #[tokio::test]
    async fn test_direct_dial_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let direct = DirectOutbound::new("direct");
        let destination = Address::Socket(addr);
        let dial = direct.dial_tcp(&destination, DomainStrategy::AsIs);
        let (stream, accepted) = tokio::join!(dial, listener.accept());
        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }
}

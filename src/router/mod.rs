//! Rule-based router
//!
//! Matches flows on producing inbound tag and network, first match
//! wins, with a configurable final outbound. Stream flows are relayed
//! bidirectionally; packet flows are pumped between the inbound's
//! packet adapter and an upstream socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::adapter::{Outbound, Router};
use crate::buf::{Buffer, UDP_BUFFER_SIZE};
use crate::common::{FlowContext, FlowMetadata, Stream};
use crate::config::{RouteOptions, RouteRule};
use crate::error::{Error, Result};
use crate::inbound::PacketAdapter;

/// Idle time after which a routed packet connection is torn down
const PACKET_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

struct OutboundSet {
    by_tag: HashMap<String, Arc<dyn Outbound>>,
    first_tag: Option<String>,
}

/// First-match-wins router over the configured rule list
pub struct RuleRouter {
    rules: Vec<RouteRule>,
    final_outbound: Option<String>,
    outbounds: parking_lot::RwLock<OutboundSet>,
}

impl RuleRouter {
    /// Build a router from the `route` config section
    #[must_use]
    pub fn new(options: RouteOptions) -> Self {
        Self {
            rules: options.rules,
            final_outbound: options.final_outbound,
            outbounds: parking_lot::RwLock::new(OutboundSet {
                by_tag: HashMap::new(),
                first_tag: None,
            }),
        }
    }

    /// Select the outbound for a flow
    fn select(&self, metadata: &FlowMetadata) -> Result<Arc<dyn Outbound>> {
        let tag = self
            .rules
            .iter()
            .find(|rule| rule_matches(rule, metadata))
            .map(|rule| rule.outbound.clone())
            .or_else(|| self.final_outbound.clone());

        let set = self.outbounds.read();
        let tag = match tag {
            Some(tag) => tag,
            None => set
                .first_tag
                .clone()
                .ok_or_else(|| Error::Route("no outbound available".into()))?,
        };
        set.by_tag
            .get(&tag)
            .cloned()
            .ok_or_else(|| Error::Route(format!("outbound not found: {tag}")))
    }
}

fn rule_matches(rule: &RouteRule, metadata: &FlowMetadata) -> bool {
    if !rule.inbound.is_empty() && !rule.inbound.contains(&metadata.inbound_tag) {
        return false;
    }
    if let Some(network) = rule.network {
        if network != metadata.network {
            return false;
        }
    }
    true
}

#[async_trait]
impl Router for RuleRouter {
    async fn start(&self) -> Result<()> {
        info!(rules = self.rules.len(), "router started");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn update_outbounds(&self, outbounds: Vec<Arc<dyn Outbound>>) {
        let mut set = self.outbounds.write();
        set.first_tag = outbounds.first().map(|o| o.tag().to_string());
        set.by_tag = outbounds
            .into_iter()
            .map(|o| (o.tag().to_string(), o))
            .collect();
    }

    async fn route_connection(
        &self,
        ctx: FlowContext,
        mut stream: Stream,
        metadata: FlowMetadata,
    ) -> Result<()> {
        if !metadata.destination.is_valid() {
            return Err(Error::Route("connection without destination".into()));
        }
        let outbound = self.select(&metadata)?;
        info!(
            flow = ctx.flow_id,
            destination = %metadata.destination,
            outbound = outbound.tag(),
            "routing connection"
        );

        let mut upstream = outbound
            .dial_tcp(&metadata.destination, metadata.domain_strategy)
            .await?;

        let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
        debug!(flow = ctx.flow_id, up, down, "connection finished");
        Ok(())
    }

    async fn route_packet_connection(
        &self,
        ctx: FlowContext,
        conn: Arc<PacketAdapter>,
        metadata: FlowMetadata,
    ) -> Result<()> {
        if !metadata.destination.is_valid() {
            return Err(Error::Route("packet connection without destination".into()));
        }
        let outbound = self.select(&metadata)?;
        info!(
            flow = ctx.flow_id,
            destination = %metadata.destination,
            outbound = outbound.tag(),
            "routing packet connection"
        );

        let upstream = outbound.dial_udp().await?;
        let target = metadata
            .destination
            .resolve(metadata.domain_strategy)
            .await?;
        upstream.connect(target).await?;

        let mut inbound_buf = Buffer::with_capacity(UDP_BUFFER_SIZE);
        let mut reply_raw = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            tokio::select! {
                read = conn.read_packet(&mut inbound_buf) => {
                    read.map_err(Error::Udp)?;
                    upstream.send(&inbound_buf).await?;
                }
                received = upstream.recv(&mut reply_raw) => {
                    let n = received?;
                    conn.write_packet(
                        Buffer::from_slice(&reply_raw[..n]),
                        metadata.source.clone(),
                    )
                    .await
                    .map_err(Error::Udp)?;
                }
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(PACKET_IDLE_TIMEOUT) => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, Network};
    use crate::outbound::{BlockOutbound, DirectOutbound};

    fn metadata(tag: &str, network: Network) -> FlowMetadata {
        let mut metadata = FlowMetadata::empty();
        metadata.inbound_tag = tag.into();
        metadata.network = network;
        metadata.destination = Address::Socket("192.0.2.1:80".parse().unwrap());
        metadata
    }

    fn router_with(rules: Vec<RouteRule>, final_outbound: Option<String>) -> RuleRouter {
        let router = RuleRouter::new(RouteOptions {
            rules,
            final_outbound,
        });
        router.update_outbounds(vec![
            Arc::new(DirectOutbound::new("direct")),
            Arc::new(BlockOutbound::new("deny")),
        ]);
        router
    }

    #[test]
    fn test_first_match_wins() {
        let router = router_with(
            vec![
                RouteRule {
                    inbound: vec!["socks".into()],
                    network: None,
                    outbound: "deny".into(),
                },
                RouteRule {
                    inbound: vec![],
                    network: None,
                    outbound: "direct".into(),
                },
            ],
            None,
        );

        let selected = router.select(&metadata("socks", Network::Tcp)).unwrap();
        assert_eq!(selected.tag(), "deny");

        let selected = router.select(&metadata("other", Network::Tcp)).unwrap();
        assert_eq!(selected.tag(), "direct");
    }

    #[test]
    fn test_network_match() {
        let router = router_with(
            vec![RouteRule {
                inbound: vec![],
                network: Some(Network::Udp),
                outbound: "deny".into(),
            }],
            Some("direct".into()),
        );

        assert_eq!(
            router.select(&metadata("in", Network::Udp)).unwrap().tag(),
            "deny"
        );
        assert_eq!(
            router.select(&metadata("in", Network::Tcp)).unwrap().tag(),
            "direct"
        );
    }

    #[test]
    fn test_fallback_to_first_outbound() {
        let router = router_with(vec![], None);
        assert_eq!(
            router.select(&metadata("in", Network::Tcp)).unwrap().tag(),
            "direct"
        );
    }

    #[test]
    fn test_unknown_final_outbound_errors() {
        let router = router_with(vec![], Some("missing".into()));
        assert!(router.select(&metadata("in", Network::Tcp)).is_err());
    }

    #[tokio::test]
    async fn test_route_connection_requires_destination() {
        let router = router_with(vec![], None);
        let (client, _server) = tokio::io::duplex(64);
        let (_handle, signal) = crate::common::ShutdownHandle::new();
        let ctx = FlowContext::new("in", signal);

        let mut metadata = FlowMetadata::empty();
        metadata.inbound_tag = "in".into();

        let result = router
            .route_connection(ctx, Box::new(client), metadata)
            .await;
        assert!(matches!(result, Err(Error::Route(_))));
    }
}

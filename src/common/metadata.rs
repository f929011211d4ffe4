//! Per-flow metadata
//!
//! Built by the inbound engine for every accepted connection and every
//! received datagram, then carried through handlers to the router. The
//! router depends only on metadata, never on sockets.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::Address;
use crate::config::DomainStrategy;

/// Transport network of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Metadata describing one flow (a stream connection or a datagram)
#[derive(Debug, Clone)]
pub struct FlowMetadata {
    /// Tag of the producing inbound
    pub inbound_tag: String,
    /// Protocol type of the producing inbound
    pub inbound_type: String,
    /// Transport network
    pub network: Network,
    /// Remote peer address. Always valid once metadata leaves the engine.
    pub source: Address,
    /// Destination declared by the protocol layer. May be unspecified
    /// at this stage; populated downstream.
    pub destination: Address,
    /// Local address the flow arrived on (transparent-proxy modes need
    /// this to differ from `destination`)
    pub origin_destination: Option<SocketAddr>,
    /// Whether protocol sniffing is enabled for this flow
    pub sniff_enabled: bool,
    /// Whether a sniffed name overrides the declared destination
    pub sniff_override_destination: bool,
    /// Resolution strategy for FQDN destinations
    pub domain_strategy: DomainStrategy,
}

impl Default for FlowMetadata {
    fn default() -> Self {
        Self::empty()
    }
}

impl FlowMetadata {
    /// Metadata with no flow-specific fields filled in yet
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inbound_tag: String::new(),
            inbound_type: String::new(),
            network: Network::Tcp,
            source: Address::unspecified(),
            destination: Address::unspecified(),
            origin_destination: None,
            sniff_enabled: false,
            sniff_override_destination: false,
            domain_strategy: DomainStrategy::AsIs,
        }
    }
}

//! Configuration types
//!
//! The configuration is a JSON document with four sections: `log`,
//! `route`, `inbounds` and `outbounds`. Types here carry serde defaults
//! so a minimal document stays minimal, and reserialize to a document
//! semantically equal to the input (the `--format` mode relies on this).

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::common::Network;
use crate::error::ConfigError;

/// Root configuration document
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Options {
    /// Logging configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogOptions>,

    /// Routing configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteOptions>,

    /// Inbound listeners
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inbounds: Vec<InboundOptions>,

    /// Outbound transports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbounds: Vec<OutboundOptions>,
}

impl Options {
    /// Validate the document as a whole.
    ///
    /// Per-section errors carry the `parse <section>[<index>]` path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut inbound_tags: HashSet<&str> = HashSet::new();
        for (index, inbound) in self.inbounds.iter().enumerate() {
            inbound
                .validate()
                .map_err(|e| ConfigError::validation(format!("inbound[{index}]"), e))?;
            if !inbound.tag.is_empty() && !inbound_tags.insert(&inbound.tag) {
                return Err(ConfigError::validation(
                    format!("inbound[{index}]"),
                    format!("duplicate tag: {}", inbound.tag),
                ));
            }
        }

        let mut outbound_tags: HashSet<&str> = HashSet::new();
        for (index, outbound) in self.outbounds.iter().enumerate() {
            // Untagged outbounds answer to their type name at runtime,
            // so collisions are checked on the effective tag
            let tag = outbound.effective_tag();
            if !outbound_tags.insert(tag) {
                return Err(ConfigError::validation(
                    format!("outbound[{index}]"),
                    format!("duplicate tag: {tag}"),
                ));
            }
        }

        if let Some(route) = &self.route {
            route.validate(&outbound_tags)?;
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogOptions {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include the module path on each line
    #[serde(default)]
    pub target: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

/// Routing configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouteOptions {
    /// Rules evaluated in order; first match wins
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RouteRule>,

    /// Outbound used when no rule matches. Defaults to the first
    /// outbound.
    #[serde(
        rename = "final",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub final_outbound: Option<String>,
}

impl RouteOptions {
    fn validate(&self, outbound_tags: &HashSet<&str>) -> Result<(), ConfigError> {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.outbound.is_empty() {
                return Err(ConfigError::validation(
                    format!("route.rules[{index}]"),
                    "missing outbound",
                ));
            }
            if !outbound_tags.is_empty() && !outbound_tags.contains(rule.outbound.as_str()) {
                return Err(ConfigError::validation(
                    format!("route.rules[{index}]"),
                    format!("unknown outbound: {}", rule.outbound),
                ));
            }
        }
        if let Some(tag) = &self.final_outbound {
            if !outbound_tags.is_empty() && !outbound_tags.contains(tag.as_str()) {
                return Err(ConfigError::validation(
                    "route",
                    format!("unknown final outbound: {tag}"),
                ));
            }
        }
        Ok(())
    }
}

/// One routing rule
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouteRule {
    /// Match on producing inbound tags (empty matches all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inbound: Vec<String>,

    /// Match on transport network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,

    /// Outbound to route matching flows to
    pub outbound: String,
}

/// One inbound listener
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InboundOptions {
    /// Inbound protocol type (e.g. "mixed", "direct")
    #[serde(rename = "type")]
    pub inbound_type: String,

    /// Tag attached to every flow this inbound emits
    #[serde(default)]
    pub tag: String,

    /// Bind address
    #[serde(default = "default_listen")]
    pub listen: IpAddr,

    /// Bind port
    pub listen_port: u16,

    /// Enabled networks: "tcp", "udp" or both
    #[serde(default)]
    pub network: NetworkList,

    /// Enable TCP fast open. Fatal at bind time on platforms without
    /// support.
    #[serde(default)]
    pub tcp_fast_open: bool,

    /// Consume a PROXY-protocol header on each accepted connection and
    /// adopt the declared client address as the flow source
    #[serde(default)]
    pub proxy_protocol: bool,

    /// Enable protocol sniffing for flows of this inbound
    #[serde(default)]
    pub sniff: bool,

    /// Let a sniffed name override the declared destination
    #[serde(default)]
    pub sniff_override_destination: bool,

    /// Resolution strategy for FQDN destinations
    #[serde(default)]
    pub domain_strategy: DomainStrategy,

    /// Install this inbound as the system proxy while it runs
    #[serde(default)]
    pub set_system_proxy: bool,

    /// Fixed destination for "direct" inbounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_address: Option<String>,

    /// Fixed destination port for "direct" inbounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_port: Option<u16>,
}

impl InboundOptions {
    /// The socket address this inbound binds
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.listen_port)
    }

    fn validate(&self) -> Result<(), String> {
        if self.inbound_type.is_empty() {
            return Err("missing type".into());
        }
        if self.network.networks().is_empty() {
            return Err("no network enabled".into());
        }
        Ok(())
    }
}

/// One outbound transport
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboundOptions {
    /// Outbound type: "direct" or "block"
    #[serde(rename = "type")]
    pub outbound_type: String,

    /// Tag referenced by routing rules. Defaults to the type name.
    #[serde(default)]
    pub tag: String,
}

impl OutboundOptions {
    /// Built-in direct outbound
    #[must_use]
    pub fn direct() -> Self {
        Self {
            outbound_type: "direct".into(),
            tag: "direct".into(),
        }
    }

    /// The effective tag (falls back to the type name)
    #[must_use]
    pub fn effective_tag(&self) -> &str {
        if self.tag.is_empty() {
            &self.outbound_type
        } else {
            &self.tag
        }
    }
}

/// Networks an inbound listens on. Accepts a bare string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NetworkList {
    One(Network),
    Many(Vec<Network>),
}

impl NetworkList {
    /// The enabled networks, in declaration order
    #[must_use]
    pub fn networks(&self) -> Vec<Network> {
        match self {
            NetworkList::One(n) => vec![*n],
            NetworkList::Many(list) => list.clone(),
        }
    }

    /// Whether the given network is enabled
    #[must_use]
    pub fn has(&self, network: Network) -> bool {
        match self {
            NetworkList::One(n) => *n == network,
            NetworkList::Many(list) => list.contains(&network),
        }
    }
}

impl Default for NetworkList {
    fn default() -> Self {
        NetworkList::Many(vec![Network::Tcp, Network::Udp])
    }
}

/// Resolution strategy applied to FQDN destinations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStrategy {
    /// Use the resolver's first answer
    #[default]
    AsIs,
    PreferIpv4,
    PreferIpv6,
    Ipv4Only,
    Ipv6Only,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

const fn default_listen() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_inbound() -> InboundOptions {
        serde_json::from_str(
            r#"{ "type": "mixed", "tag": "in", "listen": "127.0.0.1", "listen_port": 1080 }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_inbound_defaults() {
        let inbound = minimal_inbound();
        assert_eq!(inbound.listen_addr().to_string(), "127.0.0.1:1080");
        assert!(inbound.network.has(Network::Tcp));
        assert!(inbound.network.has(Network::Udp));
        assert!(!inbound.tcp_fast_open);
        assert!(!inbound.proxy_protocol);
        assert_eq!(inbound.domain_strategy, DomainStrategy::AsIs);
    }

    #[test]
    fn test_network_list_forms() {
        let one: NetworkList = serde_json::from_str(r#""tcp""#).unwrap();
        assert!(one.has(Network::Tcp));
        assert!(!one.has(Network::Udp));

        let many: NetworkList = serde_json::from_str(r#"["tcp", "udp"]"#).unwrap();
        assert!(many.has(Network::Tcp));
        assert!(many.has(Network::Udp));
    }

    #[test]
    fn test_duplicate_inbound_tag_rejected() {
        let options = Options {
            inbounds: vec![minimal_inbound(), minimal_inbound()],
            ..Default::default()
        };
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("inbound[1]"));
        assert!(err.to_string().contains("duplicate tag"));
    }

    #[test]
    fn test_untagged_outbounds_collide_on_type_name() {
        let options = Options {
            outbounds: vec![
                serde_json::from_str(r#"{ "type": "direct" }"#).unwrap(),
                serde_json::from_str(r#"{ "type": "direct" }"#).unwrap(),
            ],
            ..Default::default()
        };
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("outbound[1]"));
        assert!(err.to_string().contains("duplicate tag: direct"));
    }

    #[test]
    fn test_rule_may_reference_untagged_outbound_by_type() {
        let options = Options {
            route: Some(RouteOptions {
                rules: vec![RouteRule {
                    inbound: vec![],
                    network: None,
                    outbound: "direct".into(),
                }],
                final_outbound: None,
            }),
            outbounds: vec![serde_json::from_str(r#"{ "type": "direct" }"#).unwrap()],
            ..Default::default()
        };
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_route_rule_unknown_outbound() {
        let options = Options {
            route: Some(RouteOptions {
                rules: vec![RouteRule {
                    inbound: vec![],
                    network: None,
                    outbound: "missing".into(),
                }],
                final_outbound: None,
            }),
            outbounds: vec![OutboundOptions::direct()],
            ..Default::default()
        };
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("route.rules[0]"));
    }

    #[test]
    fn test_domain_strategy_names() {
        let s: DomainStrategy = serde_json::from_str(r#""prefer_ipv4""#).unwrap();
        assert_eq!(s, DomainStrategy::PreferIpv4);
        assert_eq!(
            serde_json::to_string(&DomainStrategy::Ipv6Only).unwrap(),
            r#""ipv6_only""#
        );
    }

    #[test]
    fn test_roundtrip_preserves_consumed_fields() {
        let json = r#"{
            "log": { "level": "debug" },
            "inbounds": [{
                "type": "mixed",
                "tag": "in",
                "listen": "127.0.0.1",
                "listen_port": 11080,
                "network": "tcp",
                "tcp_fast_open": false,
                "sniff": true,
                "domain_strategy": "prefer_ipv4"
            }],
            "outbounds": [{ "type": "direct" }]
        }"#;
        let options: Options = serde_json::from_str(json).unwrap();
        let reemitted = serde_json::to_string(&options).unwrap();
        let reparsed: Options = serde_json::from_str(&reemitted).unwrap();

        assert_eq!(reparsed.log.as_ref().unwrap().level, "debug");
        let inbound = &reparsed.inbounds[0];
        assert_eq!(inbound.tag, "in");
        assert_eq!(inbound.listen_port, 11080);
        assert_eq!(inbound.network, NetworkList::One(Network::Tcp));
        assert!(inbound.sniff);
        assert_eq!(inbound.domain_strategy, DomainStrategy::PreferIpv4);
        assert_eq!(reparsed.outbounds[0].effective_tag(), "direct");
    }
}

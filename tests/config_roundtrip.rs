//! Configuration round-trip and error-path tests.

use std::io::Write;

use sing_box::config::{load_options, load_options_str, Options};

const FULL_CONFIG: &str = r#"{
    "log": { "level": "debug", "format": "text" },
    "route": {
        "rules": [
            { "inbound": ["socks-in"], "network": "tcp", "outbound": "direct" }
        ],
        "final": "direct"
    },
    "inbounds": [
        {
            "type": "mixed",
            "tag": "socks-in",
            "listen": "127.0.0.1",
            "listen_port": 11080,
            "network": "tcp",
            "tcp_fast_open": false,
            "proxy_protocol": false,
            "sniff": true,
            "sniff_override_destination": true,
            "domain_strategy": "prefer_ipv4",
            "set_system_proxy": false
        }
    ],
    "outbounds": [
        { "type": "direct", "tag": "direct" },
        { "type": "block", "tag": "block" }
    ]
}"#;

#[test]
fn test_format_mode_roundtrip_is_semantically_equal() {
    let options = load_options_str(FULL_CONFIG).unwrap();

    // The --format mode reserializes and must preserve every consumed
    // field
    let canonical = serde_json::to_string_pretty(&options).unwrap();
    let reparsed: Options = serde_json::from_str(&canonical).unwrap();

    let original: serde_json::Value = serde_json::to_value(&options).unwrap();
    let roundtripped: serde_json::Value = serde_json::to_value(&reparsed).unwrap();
    assert_eq!(original, roundtripped);

    let inbound = &reparsed.inbounds[0];
    assert_eq!(inbound.tag, "socks-in");
    assert_eq!(inbound.listen_port, 11080);
    assert!(inbound.sniff);
    assert!(inbound.sniff_override_destination);
    assert_eq!(
        reparsed.route.as_ref().unwrap().final_outbound.as_deref(),
        Some("direct")
    );
    assert_eq!(reparsed.outbounds.len(), 2);
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FULL_CONFIG.as_bytes()).unwrap();

    let options = load_options(file.path()).unwrap();
    assert_eq!(options.inbounds[0].inbound_type, "mixed");
}

#[test]
fn test_parse_error_paths() {
    // Duplicate inbound tags
    let err = load_options_str(
        r#"{
            "inbounds": [
                { "type": "mixed", "tag": "a", "listen_port": 1 },
                { "type": "mixed", "tag": "a", "listen_port": 2 }
            ]
        }"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("parse inbound[1]"));

    // Rule referencing an unknown outbound
    let err = load_options_str(
        r#"{
            "route": { "rules": [ { "outbound": "nope" } ] },
            "outbounds": [ { "type": "direct" } ]
        }"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("parse route.rules[0]"));
}

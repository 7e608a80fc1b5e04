//! Scenario file types

use serde::Deserialize;
use std::net::Ipv4Addr;

/// A complete simulation scenario (scenario.toml)
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub defaults: StackDefaults,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub segments: Vec<SegmentConfig>,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub flows: Vec<FlowConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

/// Stack tunables applied to every node
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StackDefaults {
    #[serde(default = "default_ttl")]
    pub ttl: u8,
    #[serde(default)]
    pub checksums: bool,
}

fn default_ttl() -> u8 {
    64
}

impl Default for StackDefaults {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            checksums: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    /// CIDR address, e.g. "10.0.0.1/24".
    pub address: String,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default)]
    pub metric: Option<u16>,
    /// Link address; auto-assigned when omitted.
    #[serde(default)]
    pub link_addr: Option<String>,
}

fn default_mtu() -> u16 {
    1500
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    /// "default", a host address, or a CIDR network.
    pub destination: String,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    pub interface: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentConfig {
    #[serde(default = "default_delay_us")]
    pub delay_us: u64,
    pub taps: Vec<TapConfig>,
}

fn default_delay_us() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct TapConfig {
    pub node: String,
    pub interface: usize,
}

/// A UDP endpoint bound on a node, logging what it receives
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub node: String,
    pub port: u16,
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
}

/// One scheduled application datagram
#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    pub from: String,
    pub to: Ipv4Addr,
    pub port: u16,
    #[serde(default)]
    pub at_us: u64,
    #[serde(default = "default_payload")]
    pub payload: String,
}

fn default_payload() -> String {
    "ping".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_scenario_parses() {
        let scenario: Scenario = toml::from_str(
            r#"
            [[nodes]]
            name = "a"
            interfaces = [{ address = "10.0.0.1/24" }]

            [[nodes]]
            name = "b"
            interfaces = [{ address = "10.0.0.2/24" }]

            [[segments]]
            taps = [{ node = "a", interface = 0 }, { node = "b", interface = 0 }]

            [[listeners]]
            node = "b"
            port = 2000

            [[flows]]
            from = "a"
            to = "10.0.0.2"
            port = 2000
            at_us = 1000
            payload = "hello"
            "#,
        )
        .unwrap();

        assert_eq!(scenario.nodes.len(), 2);
        assert_eq!(scenario.nodes[0].interfaces[0].mtu, 1500);
        assert_eq!(scenario.segments[0].delay_us, 5);
        assert_eq!(scenario.flows[0].payload, "hello");
        assert_eq!(scenario.defaults.ttl, 64);
        assert!(!scenario.defaults.checksums);
    }

    #[test]
    fn test_defaults_and_routes() {
        let scenario: Scenario = toml::from_str(
            r#"
            [defaults]
            ttl = 32
            checksums = true

            [[nodes]]
            name = "r"
            interfaces = [
                { address = "10.0.0.254/24", mtu = 9000, link_addr = "02:00:00:00:00:aa" },
            ]
            routes = [
                { destination = "default", gateway = "10.0.0.1", interface = 0 },
                { destination = "192.168.1.0/24", interface = 0 },
                { destination = "192.168.2.9", gateway = "10.0.0.2", interface = 0 },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(scenario.defaults.ttl, 32);
        assert!(scenario.defaults.checksums);
        assert_eq!(scenario.nodes[0].interfaces[0].mtu, 9000);
        assert_eq!(scenario.nodes[0].routes.len(), 3);
        assert_eq!(scenario.nodes[0].routes[0].gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
    }
}

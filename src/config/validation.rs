//! Scenario validation

use super::{parse_cidr, Scenario};
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

/// Validate a scenario and return warnings/errors
pub fn validate(scenario: &Scenario) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_nodes(scenario, &mut result);
    validate_segments(scenario, &mut result);
    validate_endpoints(scenario, &mut result);

    result
}

fn iface_count(scenario: &Scenario, node: &str) -> Option<usize> {
    scenario
        .nodes
        .iter()
        .find(|n| n.name == node)
        .map(|n| n.interfaces.len())
}

fn validate_nodes(scenario: &Scenario, result: &mut ValidationResult) {
    if scenario.nodes.is_empty() {
        result.error("no nodes defined");
    }

    let mut names = HashSet::new();
    for node in &scenario.nodes {
        if !names.insert(node.name.as_str()) {
            result.error(format!("nodes: duplicate node name {}", node.name));
        }
        if node.interfaces.is_empty() {
            result.warn(format!("nodes.{}: no interfaces", node.name));
        }

        for (index, iface) in node.interfaces.iter().enumerate() {
            if parse_cidr(&iface.address).is_err() {
                result.error(format!(
                    "nodes.{}.interfaces[{}]: invalid CIDR {}",
                    node.name, index, iface.address
                ));
            }
            if let Some(ref link_addr) = iface.link_addr {
                if link_addr.parse::<crate::protocol::LinkAddr>().is_err() {
                    result.error(format!(
                        "nodes.{}.interfaces[{}]: invalid link address {}",
                        node.name, index, link_addr
                    ));
                }
            }
        }

        for (index, route) in node.routes.iter().enumerate() {
            if route.interface >= node.interfaces.len() {
                result.error(format!(
                    "nodes.{}.routes[{}]: interface {} out of range",
                    node.name, index, route.interface
                ));
            }
            if route.destination != "default" {
                let dest = route.destination.as_str();
                let ok = if dest.contains('/') {
                    parse_cidr(dest).is_ok()
                } else {
                    dest.parse::<std::net::Ipv4Addr>().is_ok()
                };
                if !ok {
                    result.error(format!(
                        "nodes.{}.routes[{}]: invalid destination {}",
                        node.name, index, dest
                    ));
                }
            } else if route.gateway.is_none() {
                result.error(format!(
                    "nodes.{}.routes[{}]: default route requires a gateway",
                    node.name, index
                ));
            }
        }
    }
}

fn validate_segments(scenario: &Scenario, result: &mut ValidationResult) {
    for (index, segment) in scenario.segments.iter().enumerate() {
        if segment.taps.len() < 2 {
            result.warn(format!("segments[{}]: fewer than two taps", index));
        }
        for tap in &segment.taps {
            match iface_count(scenario, &tap.node) {
                None => result.error(format!(
                    "segments[{}]: unknown node {}",
                    index, tap.node
                )),
                Some(count) if tap.interface >= count => result.error(format!(
                    "segments[{}]: {} has no interface {}",
                    index, tap.node, tap.interface
                )),
                Some(_) => {}
            }
        }
    }
}

fn validate_endpoints(scenario: &Scenario, result: &mut ValidationResult) {
    for (index, listener) in scenario.listeners.iter().enumerate() {
        if iface_count(scenario, &listener.node).is_none() {
            result.error(format!(
                "listeners[{}]: unknown node {}",
                index, listener.node
            ));
        }
        if listener.port == 0 {
            result.error(format!("listeners[{}]: port must be nonzero", index));
        }
    }

    for (index, flow) in scenario.flows.iter().enumerate() {
        if iface_count(scenario, &flow.from).is_none() {
            result.error(format!("flows[{}]: unknown node {}", index, flow.from));
        }
        if flow.port == 0 {
            result.error(format!("flows[{}]: port must be nonzero", index));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(toml: &str) -> Scenario {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn test_valid_scenario() {
        let s = scenario(
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
            "#,
        );
        let result = validate(&s);
        assert!(!result.has_errors(), "{:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_duplicate_node_name() {
        let s = scenario(
            r#"
            [[nodes]]
            name = "a"
            interfaces = [{ address = "10.0.0.1/24" }]
            [[nodes]]
            name = "a"
            interfaces = [{ address = "10.0.0.2/24" }]
            "#,
        );
        assert!(validate(&s).has_errors());
    }

    #[test]
    fn test_bad_cidr() {
        let s = scenario(
            r#"
            [[nodes]]
            name = "a"
            interfaces = [{ address = "10.0.0.1" }]
            "#,
        );
        assert!(validate(&s).has_errors());
    }

    #[test]
    fn test_unknown_tap_node() {
        let s = scenario(
            r#"
            [[nodes]]
            name = "a"
            interfaces = [{ address = "10.0.0.1/24" }]
            [[segments]]
            taps = [{ node = "a", interface = 0 }, { node = "ghost", interface = 0 }]
            "#,
        );
        assert!(validate(&s).has_errors());
    }

    #[test]
    fn test_route_interface_out_of_range() {
        let s = scenario(
            r#"
            [[nodes]]
            name = "a"
            interfaces = [{ address = "10.0.0.1/24" }]
            routes = [{ destination = "default", gateway = "10.0.0.254", interface = 3 }]
            "#,
        );
        assert!(validate(&s).has_errors());
    }

    #[test]
    fn test_default_route_needs_gateway() {
        let s = scenario(
            r#"
            [[nodes]]
            name = "a"
            interfaces = [{ address = "10.0.0.1/24" }]
            routes = [{ destination = "default", interface = 0 }]
            "#,
        );
        assert!(validate(&s).has_errors());
    }
}

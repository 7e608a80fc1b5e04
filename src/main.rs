use clap::{Parser, Subcommand};
use simnet::config::{self, Scenario};
use simnet::protocol::LinkAddr;
use simnet::sim::{EtherDevice, Simulator};
use simnet::stack::StackConfig;
use simnet::telemetry::{init_logging, LogSettings};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "simnet")]
#[command(about = "A discrete-event IPv4 stack simulator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario
    Run {
        /// Path to scenario.toml
        #[arg(short, long, default_value = "scenario.toml")]
        scenario: PathBuf,

        /// Stop the simulation at this virtual time (microseconds)
        #[arg(long)]
        until_us: Option<u64>,
    },
    /// Validate a scenario without running it
    Validate {
        /// Path to scenario.toml
        #[arg(short, long, default_value = "scenario.toml")]
        scenario: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { scenario, until_us } => cmd_run(&scenario, until_us),
        Commands::Validate { scenario } => cmd_validate(&scenario),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_validate(path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", path.display());

    let scenario = config::load(path).map_err(|e| e.to_string())?;
    let validation = config::validate(&scenario);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("validation failed".to_string())
    } else {
        println!("[INFO] Scenario is valid");
        Ok(())
    }
}

fn cmd_run(path: &PathBuf, until_us: Option<u64>) -> Result<(), String> {
    let scenario = config::load(path).map_err(|e| e.to_string())?;

    let log_settings = scenario.log.as_ref().map(|log| LogSettings {
        level: log.level.clone().unwrap_or_else(|| "info".to_string()),
        format: log.format.clone().unwrap_or_else(|| "pretty".to_string()),
    });
    init_logging(log_settings.as_ref());

    let validation = config::validate(&scenario);
    validation.print_diagnostics();
    if validation.has_errors() {
        return Err("validation failed".to_string());
    }

    let mut sim = build_simulator(&scenario).map_err(|e| e.to_string())?;

    info!(
        nodes = scenario.nodes.len(),
        segments = scenario.segments.len(),
        flows = scenario.flows.len(),
        "simulation starting"
    );

    match until_us {
        Some(us) => sim.run_until(Duration::from_micros(us)),
        None => sim.run(),
    }

    info!(elapsed_us = sim.now().as_micros() as u64, "simulation finished");

    for index in 0..sim.node_count() {
        let node = sim.node(index);
        let metrics = node.metrics();
        println!("--- {} ---", node.name());
        for (name, value) in metrics.snapshot() {
            println!("  {:<20} {}", name, value);
        }
    }

    Ok(())
}

/// Instantiate nodes, devices, segments, listeners and flows.
fn build_simulator(scenario: &Scenario) -> simnet::Result<Simulator> {
    let mut sim = Simulator::new();
    let stack_config = StackConfig {
        default_ttl: scenario.defaults.ttl,
        compute_checksums: scenario.defaults.checksums,
    };

    let mut next_mac: u16 = 1;
    for node_config in &scenario.nodes {
        let node = sim.add_node_with_config(node_config.name.clone(), stack_config);

        for iface_config in &node_config.interfaces {
            let (address, mask) = config::parse_cidr(&iface_config.address)?;
            let link_addr = match &iface_config.link_addr {
                Some(s) => s
                    .parse::<LinkAddr>()
                    .map_err(|e| simnet::Error::Scenario(e.to_string()))?,
                None => {
                    let [hi, lo] = next_mac.to_be_bytes();
                    next_mac += 1;
                    LinkAddr([0x02, 0, 0, 0, hi, lo])
                }
            };

            let stack = sim.node_mut(node);
            let iface = stack.add_interface(Box::new(EtherDevice::new(link_addr, iface_config.mtu)));
            stack.set_address(iface, address);
            stack.set_mask(iface, mask);
            if let Some(metric) = iface_config.metric {
                stack.set_metric(iface, metric);
            }
            stack.set_up(iface);
        }

        for route in &node_config.routes {
            let stack = sim.node_mut(node);
            if route.destination == "default" {
                let gateway = route.gateway.ok_or_else(|| {
                    simnet::Error::Scenario("default route requires a gateway".to_string())
                })?;
                stack.set_default_route(gateway, route.interface);
            } else if route.destination.contains('/') {
                let (dest, mask) = config::parse_cidr(&route.destination)?;
                match route.gateway {
                    Some(gw) => stack.add_network_route_via(dest, mask, gw, route.interface),
                    None => stack.add_network_route(dest, mask, route.interface),
                }
            } else {
                let dest = route.destination.parse().map_err(|_| {
                    simnet::Error::Scenario(format!("invalid destination {}", route.destination))
                })?;
                match route.gateway {
                    Some(gw) => stack.add_host_route_via(dest, gw, route.interface),
                    None => stack.add_host_route(dest, route.interface),
                }
            }
        }
    }

    for segment_config in &scenario.segments {
        let segment = sim.add_segment(Duration::from_micros(segment_config.delay_us));
        for tap in &segment_config.taps {
            let node = sim.node_index(&tap.node).ok_or_else(|| {
                simnet::Error::NodeNotFound {
                    name: tap.node.clone(),
                }
            })?;
            sim.attach(segment, node, tap.interface);
        }
    }

    for listener in &scenario.listeners {
        let node = sim
            .node_index(&listener.node)
            .ok_or_else(|| simnet::Error::NodeNotFound {
                name: listener.node.clone(),
            })?;
        let stack = sim.node_mut(node);
        let id = match listener.address {
            Some(addr) => stack.udp_allocate_with_address_port(addr, listener.port),
            None => stack.udp_allocate_with_port(listener.port),
        }
        .ok_or_else(|| {
            simnet::Error::Scenario(format!(
                "listeners: port {} on {} already taken",
                listener.port, listener.node
            ))
        })?;

        let name = listener.node.clone();
        let port = listener.port;
        if let Some(endpoint) = stack.udp_endpoint_mut(id) {
            endpoint.set_receive_callback(Box::new(move |payload, src, src_port| {
                info!(
                    node = %name,
                    port,
                    %src,
                    src_port,
                    payload = %String::from_utf8_lossy(payload),
                    "datagram received"
                );
            }));
        }
    }

    for flow in &scenario.flows {
        let node = sim
            .node_index(&flow.from)
            .ok_or_else(|| simnet::Error::NodeNotFound {
                name: flow.from.clone(),
            })?;
        let stack = sim.node_mut(node);
        let id = stack.udp_allocate().ok_or_else(|| {
            simnet::Error::Scenario("ephemeral port space exhausted".to_string())
        })?;
        let src_port = stack
            .udp_endpoint_mut(id)
            .map(|ep| ep.local_port())
            .unwrap_or_default();

        sim.schedule_udp_send(
            Duration::from_micros(flow.at_us),
            node,
            src_port,
            flow.to,
            flow.port,
            flow.payload.clone().into_bytes(),
        );
    }

    Ok(sim)
}

//! The simulated IPv4 stack
//!
//! Stateful datapath logic: resolution caches, routing, the per-node
//! forwarding engine, endpoint demultiplexing and the UDP adapter.

mod arp_cache;
mod arp_engine;
mod endpoint;
mod interface;
mod node;
mod routing;
mod udp;

pub use arp_cache::{ArpCache, ArpCacheConfig, ArpEntry, ArpState};
pub use arp_engine::{ArpEngine, ResolveResult};
pub use endpoint::{
    EndPoint, EndPointDemux, EndPointId, EPHEMERAL_PORT_MAX, EPHEMERAL_PORT_MIN,
};
pub use interface::Interface;
pub use node::{Node, StackConfig};
pub use routing::{
    MulticastRoute, Route, RouteReply, RoutingProvider, RoutingSystem, RoutingTable,
};
pub use udp::UdpProtocol;

//! One simulated host: interfaces, routing, resolution and transports
//!
//! `Node` is the IPv4 forwarding engine plus everything it owns. Outbound
//! traffic enters at `send`, inbound frames at `receive`; both run to
//! completion against the node's own state. Packets that could not be
//! resolved yet sit in the resolution caches and re-enter the interface
//! send path when the matching reply arrives.

use crate::protocol::arp::{ArpOp, ArpPacket};
use crate::protocol::ipv4::{Ipv4Builder, Ipv4Header, Ipv4Packet};
use crate::protocol::{EtherType, Ipv4Mask, LinkAddr};
use crate::sim::{Clock, Device, Frame};
use crate::stack::arp_cache::ArpCacheConfig;
use crate::stack::arp_engine::{ArpEngine, ResolveResult};
use crate::stack::endpoint::{EndPoint, EndPointId};
use crate::stack::interface::Interface;
use crate::stack::routing::{RouteReply, RoutingProvider, RoutingSystem, RoutingTable};
use crate::stack::udp::UdpProtocol;
use crate::telemetry::StackMetrics;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Stack-wide tunables
#[derive(Debug, Clone, Copy)]
pub struct StackConfig {
    /// TTL set on locally originated packets.
    pub default_ttl: u8,
    /// Seed and verify transport checksums.
    pub compute_checksums: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            default_ttl: 64,
            compute_checksums: false,
        }
    }
}

/// A simulated host stack
pub struct Node {
    name: String,
    clock: Clock,
    config: StackConfig,
    interfaces: Vec<Interface>,
    arp: ArpEngine,
    routing: RoutingSystem,
    udp: UdpProtocol,
    /// Joined (origin, group) multicast memberships.
    multicast_groups: Vec<(Ipv4Addr, Ipv4Addr)>,
    identification: u16,
    metrics: Arc<StackMetrics>,
}

impl Node {
    pub fn new(name: impl Into<String>, clock: Clock) -> Self {
        Self::with_config(name, clock, StackConfig::default())
    }

    pub fn with_config(name: impl Into<String>, clock: Clock, config: StackConfig) -> Self {
        Self {
            name: name.into(),
            clock,
            config,
            interfaces: Vec::new(),
            arp: ArpEngine::new(),
            routing: RoutingSystem::new(),
            udp: UdpProtocol::new(config.compute_checksums),
            multicast_groups: Vec::new(),
            identification: 0,
            metrics: Arc::new(StackMetrics::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> Arc<StackMetrics> {
        Arc::clone(&self.metrics)
    }

    // ---- interfaces ----

    /// Attach a device. The returned index is the interface id used by
    /// every other API; the interface starts down.
    pub fn add_interface(&mut self, device: Box<dyn Device>) -> usize {
        let index = self.interfaces.len();
        self.interfaces.push(Interface::new(device));
        self.arp.add_interface(ArpCacheConfig::default());
        debug!(node = %self.name, index, "interface added");
        index
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    pub fn set_address(&mut self, iface: usize, address: Ipv4Addr) {
        self.interfaces[iface].set_address(address);
    }

    pub fn address(&self, iface: usize) -> Ipv4Addr {
        self.interfaces[iface].address()
    }

    pub fn set_mask(&mut self, iface: usize, mask: Ipv4Mask) {
        self.interfaces[iface].set_mask(mask);
    }

    pub fn set_metric(&mut self, iface: usize, metric: u16) {
        self.interfaces[iface].set_metric(metric);
    }

    pub fn metric(&self, iface: usize) -> u16 {
        self.interfaces[iface].metric()
    }

    pub fn mtu(&self, iface: usize) -> u16 {
        self.interfaces[iface].mtu()
    }

    pub fn is_up(&self, iface: usize) -> bool {
        self.interfaces[iface].is_up()
    }

    pub fn link_addr(&self, iface: usize) -> LinkAddr {
        self.interfaces[iface].device().link_addr()
    }

    /// Bring an interface up. A configured interface gets the covering
    /// network route installed automatically.
    pub fn set_up(&mut self, iface: usize) {
        self.interfaces[iface].set_up();
        let interface = &self.interfaces[iface];
        if interface.is_configured() {
            let mask = interface.mask();
            let network = mask.combine(interface.address());
            self.routing.table_mut().add_network_route(network, mask, iface);
            debug!(node = %self.name, iface, %network, %mask, "interface up, network route added");
        }
    }

    /// Take an interface down and drop every unicast route through it.
    pub fn set_down(&mut self, iface: usize) {
        self.interfaces[iface].set_down();
        loop {
            let table = self.routing.table();
            let position = (0..table.route_count()).find(|&i| table.route(i).iface() == iface);
            match position {
                Some(i) => self.routing.table_mut().remove_route(i),
                None => break,
            }
        }
        debug!(node = %self.name, iface, "interface down");
    }

    /// Interface whose address equals `addr`.
    pub fn find_interface_for_address(&self, addr: Ipv4Addr) -> Option<usize> {
        self.interfaces.iter().position(|i| i.address() == addr)
    }

    /// Interface on the same masked network as `addr`.
    pub fn find_interface_for_network(&self, addr: Ipv4Addr, mask: Ipv4Mask) -> Option<usize> {
        self.interfaces
            .iter()
            .position(|i| mask.matches(addr, i.address()))
    }

    /// Drain frames an interface's device queued for transmission;
    /// called by the simulation driver.
    pub fn take_outgoing(&mut self, iface: usize) -> Vec<Frame> {
        self.interfaces[iface].device_mut().take_outgoing()
    }

    // ---- routing ----

    pub fn routing_table(&self) -> &RoutingTable {
        self.routing.table()
    }

    pub fn add_host_route(&mut self, dest: Ipv4Addr, iface: usize) {
        self.routing.table_mut().add_host_route(dest, iface);
    }

    pub fn add_host_route_via(&mut self, dest: Ipv4Addr, gateway: Ipv4Addr, iface: usize) {
        self.routing.table_mut().add_host_route_via(dest, gateway, iface);
    }

    pub fn add_network_route(&mut self, dest: Ipv4Addr, mask: Ipv4Mask, iface: usize) {
        self.routing.table_mut().add_network_route(dest, mask, iface);
    }

    pub fn add_network_route_via(
        &mut self,
        dest: Ipv4Addr,
        mask: Ipv4Mask,
        gateway: Ipv4Addr,
        iface: usize,
    ) {
        self.routing
            .table_mut()
            .add_network_route_via(dest, mask, gateway, iface);
    }

    pub fn set_default_route(&mut self, gateway: Ipv4Addr, iface: usize) {
        self.routing.table_mut().set_default_route(gateway, iface);
    }

    pub fn remove_route(&mut self, index: usize) {
        self.routing.table_mut().remove_route(index);
    }

    pub fn route_count(&self) -> usize {
        self.routing.table().route_count()
    }

    pub fn add_multicast_route(
        &mut self,
        origin: Ipv4Addr,
        group: Ipv4Addr,
        input_iface: Option<usize>,
        output_ifaces: Vec<usize>,
    ) {
        self.routing
            .table_mut()
            .add_multicast_route(origin, group, input_iface, output_ifaces);
    }

    pub fn remove_multicast_route(
        &mut self,
        origin: Ipv4Addr,
        group: Ipv4Addr,
        input_iface: Option<usize>,
    ) -> bool {
        self.routing
            .table_mut()
            .remove_multicast_route(origin, group, input_iface)
    }

    pub fn add_routing_provider(&mut self, provider: Box<dyn RoutingProvider>, priority: i16) {
        self.routing.add_provider(provider, priority);
    }

    pub fn join_multicast_group(&mut self, origin: Ipv4Addr, group: Ipv4Addr) {
        self.multicast_groups.push((origin, group));
    }

    pub fn leave_multicast_group(&mut self, origin: Ipv4Addr, group: Ipv4Addr) {
        if let Some(pos) = self
            .multicast_groups
            .iter()
            .position(|(o, g)| *o == origin && *g == group)
        {
            self.multicast_groups.remove(pos);
        }
    }

    /// Flush one interface's resolution cache.
    pub fn flush_arp_cache(&mut self, iface: usize) {
        self.arp.flush(iface, &self.metrics);
    }

    /// Source address a locally originated packet to `dest` would use:
    /// the address of the interface the route points out of.
    pub fn source_address_for(&self, dest: Ipv4Addr) -> Option<Ipv4Addr> {
        let iface = match self.routing.resolve(Ipv4Addr::UNSPECIFIED, dest, None)? {
            RouteReply::Unicast { iface, .. } => iface,
            RouteReply::Multicast { output_ifaces } => {
                if output_ifaces.len() == 1 {
                    output_ifaces[0]
                } else {
                    // Several outputs cannot pin one source; fall back to
                    // the default route's interface.
                    self.routing.table().default_route()?.iface()
                }
            }
        };
        let addr = self.interfaces.get(iface)?.address();
        if addr.is_unspecified() {
            None
        } else {
            Some(addr)
        }
    }

    // ---- UDP endpoints ----

    pub fn udp_allocate(&mut self) -> Option<EndPointId> {
        self.udp.demux_mut().allocate()
    }

    pub fn udp_allocate_with_address(&mut self, addr: Ipv4Addr) -> Option<EndPointId> {
        self.udp.demux_mut().allocate_with_address(addr)
    }

    pub fn udp_allocate_with_port(&mut self, port: u16) -> Option<EndPointId> {
        self.udp.demux_mut().allocate_with_port(port)
    }

    pub fn udp_allocate_with_address_port(
        &mut self,
        addr: Ipv4Addr,
        port: u16,
    ) -> Option<EndPointId> {
        self.udp.demux_mut().allocate_with_address_port(addr, port)
    }

    pub fn udp_allocate_connected(
        &mut self,
        local_addr: Ipv4Addr,
        local_port: u16,
        peer_addr: Ipv4Addr,
        peer_port: u16,
    ) -> Option<EndPointId> {
        self.udp
            .demux_mut()
            .allocate_connected(local_addr, local_port, peer_addr, peer_port)
    }

    pub fn udp_deallocate(&mut self, id: EndPointId) -> bool {
        self.udp.demux_mut().deallocate(id)
    }

    pub fn udp_endpoint_mut(&mut self, id: EndPointId) -> Option<&mut EndPoint> {
        self.udp.demux_mut().get_mut(id)
    }

    /// Serialize and send one UDP datagram.
    pub fn udp_send(
        &mut self,
        payload: &[u8],
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    ) {
        let datagram = self.udp.build_datagram(payload, src, dst, src_port, dst_port);
        self.send(datagram, src, dst, UdpProtocol::PROTOCOL_NUMBER);
    }

    // ---- IPv4 send path ----

    /// Send a transport payload. Broadcast destinations fan out over
    /// every interface; everything else goes through route resolution.
    pub fn send(&mut self, payload: Vec<u8>, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8) {
        let identification = self.identification;
        self.identification = self.identification.wrapping_add(1);

        // Broadcasts of any kind never leave the subnet.
        let ttl = if dst == Ipv4Addr::BROADCAST || self.is_local_subnet_broadcast(dst) {
            1
        } else {
            self.config.default_ttl
        };

        let packet = Ipv4Builder::new()
            .src_addr(src)
            .dst_addr(dst)
            .ttl(ttl)
            .protocol(protocol)
            .identification(identification)
            .payload(&payload)
            .build();

        trace!(node = %self.name, %src, %dst, protocol, identification, "send");

        if dst == Ipv4Addr::BROADCAST {
            for iface in 0..self.interfaces.len() {
                self.send_resolved(iface, None, packet.clone(), dst);
            }
        } else {
            match self.routing.resolve(src, dst, None) {
                None => {
                    debug!(node = %self.name, %dst, "no route to host, drop");
                    self.metrics.drop_no_route.inc();
                }
                Some(RouteReply::Unicast { iface, gateway }) => {
                    self.send_resolved(iface, gateway, packet, dst);
                }
                Some(RouteReply::Multicast { output_ifaces }) => {
                    for iface in output_ifaces {
                        self.send_resolved(iface, None, packet.clone(), dst);
                    }
                }
            }
        }
    }

    /// Frame entry point, called by the device/driver on arrival.
    pub fn receive(&mut self, iface: usize, frame: Frame) {
        if !self.interfaces[iface].device().accepts(frame.dst) {
            return;
        }
        match EtherType::from_u16(frame.protocol) {
            Some(EtherType::Arp) => self.arp_receive(iface, &frame.payload),
            Some(EtherType::Ipv4) => self.ipv4_receive(iface, frame.payload),
            None => trace!(node = %self.name, protocol = frame.protocol, "unknown frame protocol"),
        }
    }

    fn is_local_subnet_broadcast(&self, dst: Ipv4Addr) -> bool {
        self.interfaces
            .iter()
            .any(|i| i.subnet_broadcast() == Some(dst))
    }

    /// Attach the packet to its resolved interface: MTU and admin-state
    /// checks, then the gateway (or the destination itself) as next hop.
    fn send_resolved(&mut self, iface: usize, gateway: Option<Ipv4Addr>, packet: Vec<u8>, dst: Ipv4Addr) {
        let interface = &self.interfaces[iface];
        if packet.len() > usize::from(interface.mtu()) {
            debug!(node = %self.name, iface, size = packet.len(), mtu = interface.mtu(), "over MTU, drop");
            self.metrics.drop_mtu_exceeded.inc();
            return;
        }
        if !interface.is_up() {
            debug!(node = %self.name, iface, "interface down, drop");
            self.metrics.drop_iface_down.inc();
            return;
        }
        let next_hop = gateway.unwrap_or(dst);
        self.metrics.tx_packets.inc();
        self.send_on_interface(iface, packet, next_hop);
    }

    /// Hand a packet to the interface, resolving the next hop first on
    /// devices that need it.
    fn send_on_interface(&mut self, iface: usize, packet: Vec<u8>, next_hop: Ipv4Addr) {
        let interface = &mut self.interfaces[iface];
        if !interface.is_up() {
            self.metrics.drop_iface_down.inc();
            return;
        }

        if !interface.device().needs_arp() {
            let dst = interface.device().broadcast();
            interface.device_mut().send(packet, dst, EtherType::Ipv4 as u16);
            return;
        }

        let subnet_broadcast = interface.subnet_broadcast();
        if next_hop == Ipv4Addr::BROADCAST || Some(next_hop) == subnet_broadcast {
            assert!(
                interface.device().is_broadcast_capable(),
                "broadcast send on non-broadcast device"
            );
            let dst = interface.device().broadcast();
            interface.device_mut().send(packet, dst, EtherType::Ipv4 as u16);
            return;
        }
        if next_hop.is_multicast() {
            let dst = interface.device().make_multicast(next_hop);
            interface.device_mut().send(packet, dst, EtherType::Ipv4 as u16);
            return;
        }

        let now = self.clock.now();
        match self.arp.resolve(iface, next_hop, packet, now, &self.metrics) {
            ResolveResult::Resolved { link_addr, packet } => {
                self.interfaces[iface]
                    .device_mut()
                    .send(packet, link_addr, EtherType::Ipv4 as u16);
            }
            ResolveResult::RequestNeeded => {
                let interface = &mut self.interfaces[iface];
                let request = ArpPacket::request(
                    interface.device().link_addr(),
                    interface.address(),
                    next_hop,
                );
                let dst = interface.device().broadcast();
                interface
                    .device_mut()
                    .send(request.to_bytes().to_vec(), dst, EtherType::Arp as u16);
                self.metrics.arp_requests_sent.inc();
            }
            ResolveResult::Queued | ResolveResult::Dropped => {}
        }
    }

    // ---- IPv4 receive path ----

    fn ipv4_receive(&mut self, iface: usize, packet: Vec<u8>) {
        self.metrics.rx_packets.inc();
        if !self.interfaces[iface].is_up() {
            debug!(node = %self.name, iface, "received on downed interface, drop");
            self.metrics.drop_iface_down.inc();
            return;
        }

        let (src, dst, protocol, header_len, total_len, checksum_ok) =
            match Ipv4Header::parse(&packet) {
                Ok(header) => (
                    header.src_addr(),
                    header.dst_addr(),
                    header.protocol(),
                    header.header_len(),
                    header.total_length() as usize,
                    header.checksum_ok(),
                ),
                Err(_) => {
                    debug!(node = %self.name, iface, "malformed IPv4 header, drop");
                    self.metrics.drop_bad_header.inc();
                    return;
                }
            };

        if self.config.compute_checksums && !checksum_ok {
            self.metrics.drop_bad_checksum.inc();
            return;
        }

        if self.forwarding(iface, &packet, src, dst) {
            return;
        }

        self.deliver_local(iface, &packet[header_len..total_len], src, dst, protocol);
    }

    /// Forwarding decision. Returns false when the packet is for this
    /// host and must be delivered locally; a joined multicast group
    /// forwards a copy first, then still delivers.
    fn forwarding(&mut self, in_iface: usize, packet: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        if self.interfaces.iter().any(|i| i.address() == dst) {
            trace!(node = %self.name, %dst, "for me (address match)");
            return false;
        }
        if self.is_local_subnet_broadcast(dst) {
            trace!(node = %self.name, %dst, "for me (subnet broadcast)");
            return false;
        }
        if dst == Ipv4Addr::BROADCAST {
            trace!(node = %self.name, "for me (broadcast)");
            return false;
        }
        if dst.is_unspecified() {
            trace!(node = %self.name, "for me (unspecified)");
            return false;
        }
        let joined = self
            .multicast_groups
            .iter()
            .any(|(origin, group)| *origin == src && *group == dst);
        if joined {
            // Forward a copy; the original continues to local delivery.
            trace!(node = %self.name, %dst, "joined group, forward and deliver");
            self.do_forward(in_iface, packet.to_vec());
            return false;
        }

        self.do_forward(in_iface, packet.to_vec());
        true
    }

    fn do_forward(&mut self, in_iface: usize, packet: Vec<u8>) {
        let mut packet = match Ipv4Packet::from_bytes(packet) {
            Ok(packet) => packet,
            Err(_) => {
                self.metrics.drop_bad_header.inc();
                return;
            }
        };

        if !packet.decrement_ttl() {
            // No ICMP Time Exceeded in this stack.
            debug!(node = %self.name, "TTL exceeded, drop");
            self.metrics.drop_ttl_expired.inc();
            return;
        }

        let src = packet.src_addr();
        let dst = packet.dst_addr();
        match self.routing.resolve(src, dst, Some(in_iface)) {
            None => {
                debug!(node = %self.name, %dst, "no route for forwarded packet, drop");
                self.metrics.drop_no_route.inc();
            }
            Some(RouteReply::Unicast { iface, gateway }) => {
                self.metrics.packets_forwarded.inc();
                self.send_resolved(iface, gateway, packet.into_bytes(), dst);
            }
            Some(RouteReply::Multicast { output_ifaces }) => {
                self.metrics.packets_forwarded.inc();
                let bytes = packet.into_bytes();
                for iface in output_ifaces {
                    self.send_resolved(iface, None, bytes.clone(), dst);
                }
            }
        }
    }

    /// Dispatch to the transport registered for the protocol number.
    fn deliver_local(&mut self, iface: usize, body: &[u8], src: Ipv4Addr, dst: Ipv4Addr, protocol: u8) {
        match protocol {
            UdpProtocol::PROTOCOL_NUMBER => {
                self.metrics.packets_delivered.inc();
                let delivered = self.udp.receive(body, src, dst, Some(iface), &self.metrics);
                if delivered == 0 {
                    trace!(node = %self.name, %dst, "no endpoint for datagram");
                    self.metrics.drop_no_endpoint.inc();
                }
            }
            other => {
                debug!(node = %self.name, protocol = other, "no transport for protocol, drop");
                self.metrics.drop_no_protocol.inc();
            }
        }
    }

    // ---- ARP receive path ----

    fn arp_receive(&mut self, iface: usize, payload: &[u8]) {
        let arp = match ArpPacket::parse(payload) {
            Ok(arp) => arp,
            Err(_) => {
                debug!(node = %self.name, iface, "malformed ARP packet, drop");
                self.metrics.drop_bad_header.inc();
                return;
            }
        };

        let interface = &mut self.interfaces[iface];
        if !interface.is_up() {
            self.metrics.drop_iface_down.inc();
            return;
        }
        let our_addr = interface.address();

        match arp.operation {
            ArpOp::Request => {
                if arp.target_ip == our_addr {
                    trace!(node = %self.name, iface, requester = %arp.sender_ip, "answering request");
                    let reply = ArpPacket::reply(
                        interface.device().link_addr(),
                        our_addr,
                        arp.sender_link,
                        arp.sender_ip,
                    );
                    interface.device_mut().send(
                        reply.to_bytes().to_vec(),
                        arp.sender_link,
                        EtherType::Arp as u16,
                    );
                    self.metrics.arp_replies_sent.inc();
                }
            }
            ArpOp::Reply => {
                if arp.target_ip != our_addr {
                    trace!(node = %self.name, iface, "reply not for us");
                    return;
                }
                let now = self.clock.now();
                if let Some(packet) =
                    self.arp
                        .handle_reply(iface, arp.sender_ip, arp.sender_link, now, &self.metrics)
                {
                    // The held packet re-enters the interface send path
                    // now that the next hop resolved.
                    self.send_on_interface(iface, packet, arp.sender_ip);
                }
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("interfaces", &self.interfaces.len())
            .field("routes", &self.routing.table().route_count())
            .finish()
    }
}

//! Simulation driver
//!
//! Owns the nodes, the segments connecting their devices, and the event
//! queue. After every dispatched event the driver drains each device's
//! tx ring and schedules frame deliveries onto the other stations of the
//! segment after its propagation delay.

use crate::sim::{Clock, Frame, Scheduler};
use crate::stack::{Node, StackConfig};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Events the driver dispatches
#[derive(Debug)]
pub enum SimEvent {
    /// A frame reaches a station.
    FrameDelivery {
        node: usize,
        iface: usize,
        frame: Frame,
    },
    /// Application-level datagram send on a node.
    UdpSend {
        node: usize,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        payload: Vec<u8>,
    },
}

/// A broadcast domain with one propagation delay
#[derive(Debug)]
struct Segment {
    delay: Duration,
    taps: Vec<(usize, usize)>,
}

/// The simulation: nodes, segments and the clock/event queue
pub struct Simulator {
    clock: Clock,
    scheduler: Scheduler<SimEvent>,
    nodes: Vec<Node>,
    segments: Vec<Segment>,
    attachments: HashMap<(usize, usize), usize>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        let clock = Clock::new();
        Self {
            scheduler: Scheduler::new(clock.clone()),
            clock,
            nodes: Vec::new(),
            segments: Vec::new(),
            attachments: HashMap::new(),
        }
    }

    /// Handle onto the simulation clock.
    pub fn clock(&self) -> Clock {
        self.clock.clone()
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn add_node(&mut self, name: impl Into<String>) -> usize {
        self.add_node_with_config(name, StackConfig::default())
    }

    pub fn add_node_with_config(&mut self, name: impl Into<String>, config: StackConfig) -> usize {
        let index = self.nodes.len();
        self.nodes
            .push(Node::with_config(name, self.clock.clone(), config));
        index
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut Node {
        &mut self.nodes[index]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name() == name)
    }

    /// Create a broadcast segment with the given propagation delay.
    pub fn add_segment(&mut self, delay: Duration) -> usize {
        self.segments.push(Segment {
            delay,
            taps: Vec::new(),
        });
        self.segments.len() - 1
    }

    /// Attach a node interface to a segment.
    pub fn attach(&mut self, segment: usize, node: usize, iface: usize) {
        self.segments[segment].taps.push((node, iface));
        self.attachments.insert((node, iface), segment);
    }

    /// Schedule an application datagram send `delay` from now.
    pub fn schedule_udp_send(
        &mut self,
        delay: Duration,
        node: usize,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        payload: Vec<u8>,
    ) {
        self.scheduler.schedule(
            delay,
            SimEvent::UdpSend {
                node,
                src_port,
                dst,
                dst_port,
                payload,
            },
        );
    }

    /// Run until no events remain.
    pub fn run(&mut self) {
        loop {
            self.collect_frames();
            match self.scheduler.pop() {
                Some((_, event)) => self.dispatch(event),
                None => break,
            }
        }
    }

    /// Run until the queue drains or the next event lies past `horizon`.
    pub fn run_until(&mut self, horizon: Duration) {
        loop {
            self.collect_frames();
            match self.scheduler.peek_time() {
                Some(at) if at <= horizon => {
                    if let Some((_, event)) = self.scheduler.pop() {
                        self.dispatch(event);
                    }
                }
                _ => break,
            }
        }
    }

    fn dispatch(&mut self, event: SimEvent) {
        match event {
            SimEvent::FrameDelivery { node, iface, frame } => {
                trace!(node, iface, "frame delivery");
                self.nodes[node].receive(iface, frame);
            }
            SimEvent::UdpSend {
                node,
                src_port,
                dst,
                dst_port,
                payload,
            } => {
                let stack = &mut self.nodes[node];
                // Broadcasts have no route; source from the first
                // configured interface.
                let src = stack.source_address_for(dst).or_else(|| {
                    if dst == Ipv4Addr::BROADCAST {
                        (0..stack.interface_count())
                            .map(|i| stack.address(i))
                            .find(|a| !a.is_unspecified())
                    } else {
                        None
                    }
                });
                match src {
                    Some(src) => {
                        debug!(node = %stack.name(), %dst, dst_port, "application send");
                        stack.udp_send(&payload, src, dst, src_port, dst_port);
                    }
                    None => {
                        warn!(node = %stack.name(), %dst, "no source address for destination, send skipped");
                    }
                }
            }
        }
    }

    /// Drain every device tx ring and schedule segment deliveries.
    fn collect_frames(&mut self) {
        let mut deliveries = Vec::new();
        for node_idx in 0..self.nodes.len() {
            for iface in 0..self.nodes[node_idx].interface_count() {
                let frames = self.nodes[node_idx].take_outgoing(iface);
                if frames.is_empty() {
                    continue;
                }
                let Some(&segment_idx) = self.attachments.get(&(node_idx, iface)) else {
                    debug!(node = node_idx, iface, "frames on unattached interface discarded");
                    continue;
                };
                let segment = &self.segments[segment_idx];
                for frame in frames {
                    for &(peer_node, peer_iface) in &segment.taps {
                        if (peer_node, peer_iface) == (node_idx, iface) {
                            continue;
                        }
                        deliveries.push((
                            segment.delay,
                            SimEvent::FrameDelivery {
                                node: peer_node,
                                iface: peer_iface,
                                frame: frame.clone(),
                            },
                        ));
                    }
                }
            }
        }
        for (delay, event) in deliveries {
            self.scheduler.schedule(delay, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Ipv4Mask, LinkAddr};
    use crate::sim::EtherDevice;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn addr(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    fn add_host(sim: &mut Simulator, name: &str, mac_last: u8, address: Ipv4Addr) -> usize {
        let node = sim.add_node(name);
        let iface = sim
            .node_mut(node)
            .add_interface(Box::new(EtherDevice::new(LinkAddr([2, 0, 0, 0, 0, mac_last]), 1500)));
        sim.node_mut(node).set_address(iface, address);
        sim.node_mut(node).set_mask(iface, Ipv4Mask::from_prefix(24));
        sim.node_mut(node).set_up(iface);
        node
    }

    #[test]
    fn test_two_node_udp_roundtrip() {
        let mut sim = Simulator::new();
        let a = add_host(&mut sim, "a", 1, addr(10, 0, 0, 1));
        let b = add_host(&mut sim, "b", 2, addr(10, 0, 0, 2));
        let segment = sim.add_segment(Duration::from_micros(5));
        sim.attach(segment, a, 0);
        sim.attach(segment, b, 0);

        let id = sim.node_mut(b).udp_allocate_with_port(2000).unwrap();
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        sim.node_mut(b)
            .udp_endpoint_mut(id)
            .unwrap()
            .set_receive_callback(Box::new(move |payload, src, port| {
                sink.borrow_mut().push((payload.to_vec(), src, port));
            }));

        sim.schedule_udp_send(
            Duration::from_millis(1),
            a,
            1000,
            addr(10, 0, 0, 2),
            2000,
            b"ping".to_vec(),
        );
        sim.run();

        assert_eq!(
            &*received.borrow(),
            &[(b"ping".to_vec(), addr(10, 0, 0, 1), 1000)]
        );
        // Request, reply, then the released data packet: two frames from
        // a's device, one from b's.
        assert_eq!(sim.node(a).metrics().arp_requests_sent.get(), 1);
        assert_eq!(sim.node(b).metrics().arp_replies_sent.get(), 1);
        // Propagation: 1ms send + request + reply + data = 1ms + 15us.
        assert_eq!(sim.now(), Duration::from_micros(1015));
    }

    #[test]
    fn test_resolved_cache_skips_second_request() {
        let mut sim = Simulator::new();
        let a = add_host(&mut sim, "a", 1, addr(10, 0, 0, 1));
        let b = add_host(&mut sim, "b", 2, addr(10, 0, 0, 2));
        let segment = sim.add_segment(Duration::from_micros(5));
        sim.attach(segment, a, 0);
        sim.attach(segment, b, 0);
        sim.node_mut(b).udp_allocate_with_port(2000).unwrap();

        for ms in [1, 2] {
            sim.schedule_udp_send(
                Duration::from_millis(ms),
                a,
                1000,
                addr(10, 0, 0, 2),
                2000,
                b"x".to_vec(),
            );
        }
        sim.run();

        assert_eq!(sim.node(a).metrics().arp_requests_sent.get(), 1);
        assert_eq!(sim.node(b).metrics().rx_packets.get(), 2);
    }

    #[test]
    fn test_udp_send_without_route_is_skipped() {
        let mut sim = Simulator::new();
        let a = sim.add_node("a");
        sim.schedule_udp_send(
            Duration::from_millis(1),
            a,
            1000,
            addr(10, 0, 0, 2),
            2000,
            b"x".to_vec(),
        );
        sim.run();
        assert_eq!(sim.node(a).metrics().tx_packets.get(), 0);
    }

    #[test]
    fn test_run_until_horizon() {
        let mut sim = Simulator::new();
        let a = add_host(&mut sim, "a", 1, addr(10, 0, 0, 1));
        sim.schedule_udp_send(
            Duration::from_millis(10),
            a,
            1000,
            addr(10, 0, 0, 2),
            2000,
            b"x".to_vec(),
        );

        sim.run_until(Duration::from_millis(5));
        assert_eq!(sim.node(a).metrics().arp_requests_sent.get(), 0);

        sim.run_until(Duration::from_millis(20));
        assert_eq!(sim.node(a).metrics().arp_requests_sent.get(), 1);
    }

    #[test]
    fn test_three_taps_broadcast_reaches_both_peers() {
        let mut sim = Simulator::new();
        let a = add_host(&mut sim, "a", 1, addr(10, 0, 0, 1));
        let b = add_host(&mut sim, "b", 2, addr(10, 0, 0, 2));
        let c = add_host(&mut sim, "c", 3, addr(10, 0, 0, 3));
        let segment = sim.add_segment(Duration::from_micros(5));
        for (node, iface) in [(a, 0), (b, 0), (c, 0)] {
            sim.attach(segment, node, iface);
        }

        sim.schedule_udp_send(
            Duration::from_millis(1),
            a,
            1000,
            Ipv4Addr::BROADCAST,
            2000,
            b"all".to_vec(),
        );
        sim.run();

        assert_eq!(sim.node(b).metrics().rx_packets.get(), 1);
        assert_eq!(sim.node(c).metrics().rx_packets.get(), 1);
    }
}

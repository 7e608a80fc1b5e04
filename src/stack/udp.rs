//! UDP transport adapter
//!
//! Thin layer between the forwarding engine and the endpoint demux:
//! serialize on send, demultiplex on receive. Every matching endpoint
//! gets its own copy of the payload.

use crate::protocol::udp::{self, UdpBuilder, UdpHeader};
use crate::stack::endpoint::EndPointDemux;
use crate::telemetry::StackMetrics;
use std::net::Ipv4Addr;
use tracing::{debug, trace};

pub struct UdpProtocol {
    demux: EndPointDemux,
    compute_checksums: bool,
}

impl UdpProtocol {
    /// IP protocol number this transport registers under.
    pub const PROTOCOL_NUMBER: u8 = udp::PROTOCOL_NUMBER;

    pub fn new(compute_checksums: bool) -> Self {
        Self {
            demux: EndPointDemux::new(),
            compute_checksums,
        }
    }

    pub fn demux(&self) -> &EndPointDemux {
        &self.demux
    }

    pub fn demux_mut(&mut self) -> &mut EndPointDemux {
        &mut self.demux
    }

    /// Serialize a datagram for the forwarding engine.
    pub fn build_datagram(
        &self,
        payload: &[u8],
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    ) -> Vec<u8> {
        UdpBuilder::new()
            .src_port(src_port)
            .dst_port(dst_port)
            .payload(payload)
            .build(src, dst, self.compute_checksums)
    }

    /// Demultiplex an inbound datagram. Returns how many endpoints
    /// received a copy of the payload.
    pub fn receive(
        &mut self,
        datagram: &[u8],
        src: Ipv4Addr,
        dst: Ipv4Addr,
        incoming_iface: Option<usize>,
        metrics: &StackMetrics,
    ) -> usize {
        let (src_port, dst_port, payload) = match UdpHeader::parse(datagram) {
            Ok(header) => {
                if self.compute_checksums && !header.validate_checksum(src, dst) {
                    debug!(%src, %dst, "UDP checksum failed");
                    metrics.drop_bad_checksum.inc();
                    return 0;
                }
                (header.src_port(), header.dst_port(), header.payload().to_vec())
            }
            Err(_) => {
                metrics.drop_bad_header.inc();
                return 0;
            }
        };

        let matches = self.demux.lookup(dst, dst_port, src, src_port, incoming_iface);
        trace!(%dst, dst_port, %src, src_port, count = matches.len(), "demux");

        let mut delivered = 0;
        for id in matches {
            if let Some(endpoint) = self.demux.get_mut(id) {
                endpoint.forward_up(&payload, src, src_port);
                metrics.udp_delivered.inc();
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn capture(
        udp: &mut UdpProtocol,
        id: crate::stack::EndPointId,
    ) -> Rc<RefCell<Vec<(Vec<u8>, Ipv4Addr, u16)>>> {
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        udp.demux_mut()
            .get_mut(id)
            .unwrap()
            .set_receive_callback(Box::new(move |payload, addr, port| {
                sink.borrow_mut().push((payload.to_vec(), addr, port));
            }));
        received
    }

    #[test]
    fn test_send_receive_roundtrip() {
        let mut udp = UdpProtocol::new(false);
        let metrics = StackMetrics::new();
        let id = udp.demux_mut().allocate_with_port(2000).unwrap();
        let received = capture(&mut udp, id);

        let dgram = udp.build_datagram(b"ping", SRC, DST, 1000, 2000);
        let delivered = udp.receive(&dgram, SRC, DST, None, &metrics);

        assert_eq!(delivered, 1);
        assert_eq!(&*received.borrow(), &[(b"ping".to_vec(), SRC, 1000)]);
        assert_eq!(metrics.udp_delivered.get(), 1);
    }

    #[test]
    fn test_no_endpoint() {
        let mut udp = UdpProtocol::new(false);
        let metrics = StackMetrics::new();
        let dgram = udp.build_datagram(b"ping", SRC, DST, 1000, 2000);
        assert_eq!(udp.receive(&dgram, SRC, DST, None, &metrics), 0);
    }

    #[test]
    fn test_checksum_enforced_when_enabled() {
        let mut udp = UdpProtocol::new(true);
        let metrics = StackMetrics::new();
        let id = udp.demux_mut().allocate_with_port(2000).unwrap();
        let received = capture(&mut udp, id);

        let mut dgram = udp.build_datagram(b"ping", SRC, DST, 1000, 2000);
        dgram[10] ^= 0xff;

        assert_eq!(udp.receive(&dgram, SRC, DST, None, &metrics), 0);
        assert!(received.borrow().is_empty());
        assert_eq!(metrics.drop_bad_checksum.get(), 1);
    }

    #[test]
    fn test_corruption_ignored_when_disabled() {
        let mut udp = UdpProtocol::new(false);
        let metrics = StackMetrics::new();
        let id = udp.demux_mut().allocate_with_port(2000).unwrap();
        let received = capture(&mut udp, id);

        let mut dgram = udp.build_datagram(b"ping", SRC, DST, 1000, 2000);
        dgram[10] ^= 0xff;

        assert_eq!(udp.receive(&dgram, SRC, DST, None, &metrics), 1);
        assert_eq!(received.borrow().len(), 1);
    }

    #[test]
    fn test_malformed_datagram() {
        let mut udp = UdpProtocol::new(false);
        let metrics = StackMetrics::new();
        assert_eq!(udp.receive(&[0u8; 4], SRC, DST, None, &metrics), 0);
        assert_eq!(metrics.drop_bad_header.get(), 1);
    }

    #[test]
    fn test_connected_endpoint_shadows_listener() {
        let mut udp = UdpProtocol::new(false);
        let metrics = StackMetrics::new();
        let listener = udp.demux_mut().allocate_with_port(2000).unwrap();
        let connected = udp
            .demux_mut()
            .allocate_connected(DST, 2000, SRC, 1000)
            .unwrap();
        let listener_rx = capture(&mut udp, listener);
        let connected_rx = capture(&mut udp, connected);

        let dgram = udp.build_datagram(b"ping", SRC, DST, 1000, 2000);
        assert_eq!(udp.receive(&dgram, SRC, DST, None, &metrics), 1);
        assert!(listener_rx.borrow().is_empty());
        assert_eq!(connected_rx.borrow().len(), 1);

        // Another source lands on the listener instead.
        let dgram = udp.build_datagram(b"pong", SRC, DST, 1001, 2000);
        assert_eq!(udp.receive(&dgram, SRC, DST, None, &metrics), 1);
        assert_eq!(listener_rx.borrow().len(), 1);
        assert_eq!(connected_rx.borrow().len(), 1);
    }
}

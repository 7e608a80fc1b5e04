//! Transport endpoint demultiplexer
//!
//! Maps inbound (dst addr, dst port, src addr, src port) tuples onto
//! registered endpoints. Fully specified endpoints win over wildcard
//! listeners via a genericity score; ephemeral ports come from the
//! dynamic range with a wrapping cursor.

use std::fmt;
use std::net::Ipv4Addr;
use tracing::trace;

/// Bottom of the dynamic port range
pub const EPHEMERAL_PORT_MIN: u16 = 49152;
/// Top of the dynamic port range
pub const EPHEMERAL_PORT_MAX: u16 = 65535;

/// Invoked with (payload, peer address, peer port) on delivery
pub type ReceiveCallback = Box<dyn FnMut(&[u8], Ipv4Addr, u16)>;
/// Invoked once when the endpoint is deallocated
pub type DestroyCallback = Box<dyn FnOnce()>;

/// Stable handle onto an allocated endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndPointId(usize);

/// One registered transport endpoint
pub struct EndPoint {
    local_addr: Ipv4Addr,
    local_port: u16,
    peer: Option<(Ipv4Addr, u16)>,
    bound_iface: Option<usize>,
    on_receive: Option<ReceiveCallback>,
    on_destroy: Option<DestroyCallback>,
}

impl EndPoint {
    fn new(local_addr: Ipv4Addr, local_port: u16) -> Self {
        Self {
            local_addr,
            local_port,
            peer: None,
            bound_iface: None,
            on_receive: None,
            on_destroy: None,
        }
    }

    pub fn local_addr(&self) -> Ipv4Addr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn peer(&self) -> Option<(Ipv4Addr, u16)> {
        self.peer
    }

    pub fn bound_iface(&self) -> Option<usize> {
        self.bound_iface
    }

    /// Connect to a peer; only exactly matching sources reach this
    /// endpoint afterwards.
    pub fn set_peer(&mut self, addr: Ipv4Addr, port: u16) {
        self.peer = Some((addr, port));
    }

    /// Restrict delivery to datagrams arriving on one interface.
    pub fn bind_to_interface(&mut self, iface: Option<usize>) {
        self.bound_iface = iface;
    }

    pub fn set_receive_callback(&mut self, callback: ReceiveCallback) {
        self.on_receive = Some(callback);
    }

    pub fn set_destroy_callback(&mut self, callback: DestroyCallback) {
        self.on_destroy = Some(callback);
    }

    /// Hand a received payload to the application callback.
    pub fn forward_up(&mut self, payload: &[u8], src_addr: Ipv4Addr, src_port: u16) {
        if let Some(callback) = self.on_receive.as_mut() {
            callback(payload, src_addr, src_port);
        }
    }
}

impl fmt::Debug for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndPoint")
            .field("local_addr", &self.local_addr)
            .field("local_port", &self.local_port)
            .field("peer", &self.peer)
            .field("bound_iface", &self.bound_iface)
            .finish()
    }
}

/// Owner of every endpoint of one transport protocol
#[derive(Debug)]
pub struct EndPointDemux {
    endpoints: Vec<(EndPointId, EndPoint)>,
    next_id: usize,
    /// Last issued ephemeral port.
    ephemeral_cursor: u16,
}

impl Default for EndPointDemux {
    fn default() -> Self {
        Self::new()
    }
}

impl EndPointDemux {
    pub fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            next_id: 0,
            ephemeral_cursor: EPHEMERAL_PORT_MIN,
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, id: EndPointId) -> Option<&EndPoint> {
        self.endpoints
            .iter()
            .find(|(eid, _)| *eid == id)
            .map(|(_, ep)| ep)
    }

    pub fn get_mut(&mut self, id: EndPointId) -> Option<&mut EndPoint> {
        self.endpoints
            .iter_mut()
            .find(|(eid, _)| *eid == id)
            .map(|(_, ep)| ep)
    }

    /// Unbound endpoint on an ephemeral port.
    pub fn allocate(&mut self) -> Option<EndPointId> {
        let port = self.allocate_ephemeral_port()?;
        Some(self.insert(EndPoint::new(Ipv4Addr::UNSPECIFIED, port)))
    }

    /// Endpoint bound to a local address, on an ephemeral port.
    pub fn allocate_with_address(&mut self, addr: Ipv4Addr) -> Option<EndPointId> {
        let port = self.allocate_ephemeral_port()?;
        Some(self.insert(EndPoint::new(addr, port)))
    }

    /// Endpoint bound to a local port; fails on an exact local
    /// address+port collision.
    pub fn allocate_with_port(&mut self, port: u16) -> Option<EndPointId> {
        self.allocate_with_address_port(Ipv4Addr::UNSPECIFIED, port)
    }

    /// Endpoint bound to local address and port.
    pub fn allocate_with_address_port(&mut self, addr: Ipv4Addr, port: u16) -> Option<EndPointId> {
        if self.lookup_local(addr, port) {
            trace!(%addr, port, "local binding already taken");
            return None;
        }
        Some(self.insert(EndPoint::new(addr, port)))
    }

    /// Fully connected endpoint; fails when the exact 4-tuple exists.
    pub fn allocate_connected(
        &mut self,
        local_addr: Ipv4Addr,
        local_port: u16,
        peer_addr: Ipv4Addr,
        peer_port: u16,
    ) -> Option<EndPointId> {
        let taken = self.endpoints.iter().any(|(_, ep)| {
            ep.local_addr == local_addr
                && ep.local_port == local_port
                && ep.peer == Some((peer_addr, peer_port))
        });
        if taken {
            trace!(%local_addr, local_port, %peer_addr, peer_port, "4-tuple already taken");
            return None;
        }
        let mut endpoint = EndPoint::new(local_addr, local_port);
        endpoint.set_peer(peer_addr, peer_port);
        Some(self.insert(endpoint))
    }

    /// Release an endpoint, running its destroy callback first.
    pub fn deallocate(&mut self, id: EndPointId) -> bool {
        if let Some(pos) = self.endpoints.iter().position(|(eid, _)| *eid == id) {
            let (_, mut endpoint) = self.endpoints.remove(pos);
            if let Some(callback) = endpoint.on_destroy.take() {
                callback();
            }
            true
        } else {
            false
        }
    }

    /// Next free port from the dynamic range, scanning forward from the
    /// last issued port and wrapping at the top. None when a full cycle
    /// finds nothing free.
    pub fn allocate_ephemeral_port(&mut self) -> Option<u16> {
        let start = self.ephemeral_cursor;
        let mut port = start;
        loop {
            port = if port >= EPHEMERAL_PORT_MAX {
                EPHEMERAL_PORT_MIN
            } else {
                port + 1
            };
            if !self.port_in_use(port) {
                self.ephemeral_cursor = port;
                return Some(port);
            }
            if port == start {
                return None;
            }
        }
    }

    /// Endpoints matching an inbound 4-tuple. All fully specified
    /// matches are returned; with none, the single most specific
    /// wildcard candidate (first-inserted breaking ties).
    pub fn lookup(
        &self,
        dst_addr: Ipv4Addr,
        dst_port: u16,
        src_addr: Ipv4Addr,
        src_port: u16,
        incoming_iface: Option<usize>,
    ) -> Vec<EndPointId> {
        let mut exact = Vec::new();
        let mut generic: Option<(EndPointId, u32)> = None;

        for (id, ep) in &self.endpoints {
            if ep.local_port != dst_port {
                continue;
            }
            if let (Some(bound), Some(incoming)) = (ep.bound_iface, incoming_iface) {
                if bound != incoming {
                    continue;
                }
            }
            let local_ok = ep.local_addr.is_unspecified()
                || ep.local_addr == dst_addr
                || dst_addr.is_broadcast();
            if !local_ok {
                continue;
            }
            let peer_ok = match ep.peer {
                None => true,
                Some((addr, port)) => addr == src_addr && port == src_port,
            };
            if !peer_ok {
                continue;
            }

            if ep.local_addr == dst_addr && ep.peer == Some((src_addr, src_port)) {
                exact.push(*id);
                continue;
            }
            let genericity =
                u32::from(ep.local_addr.is_unspecified()) + u32::from(ep.peer.is_none());
            let better = generic.map_or(true, |(_, g)| genericity < g);
            if better {
                generic = Some((*id, genericity));
            }
        }

        if exact.is_empty() {
            generic.into_iter().map(|(id, _)| id).collect()
        } else {
            exact
        }
    }

    fn insert(&mut self, endpoint: EndPoint) -> EndPointId {
        let id = EndPointId(self.next_id);
        self.next_id += 1;
        self.endpoints.push((id, endpoint));
        id
    }

    /// Exact local address+port collision check.
    fn lookup_local(&self, addr: Ipv4Addr, port: u16) -> bool {
        self.endpoints
            .iter()
            .any(|(_, ep)| ep.local_addr == addr && ep.local_port == port)
    }

    /// Whether any endpoint occupies `port`, under any local address.
    fn port_in_use(&self, port: u16) -> bool {
        self.endpoints.iter().any(|(_, ep)| ep.local_port == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    #[test]
    fn test_ephemeral_ports_distinct() {
        let mut demux = EndPointDemux::new();
        let mut ports = Vec::new();
        for _ in 0..50 {
            let id = demux.allocate().unwrap();
            ports.push(demux.get(id).unwrap().local_port());
        }
        let mut sorted = ports.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ports.len());
        assert!(ports.iter().all(|p| (EPHEMERAL_PORT_MIN..=EPHEMERAL_PORT_MAX).contains(p)));
    }

    #[test]
    fn test_ephemeral_skips_taken_port() {
        let mut demux = EndPointDemux::new();
        demux.allocate_with_port(49153).unwrap();
        let port = demux.allocate_ephemeral_port().unwrap();
        assert_eq!(port, 49154);
    }

    #[test]
    fn test_ephemeral_wraps_at_top() {
        let mut demux = EndPointDemux::new();
        demux.ephemeral_cursor = EPHEMERAL_PORT_MAX;
        assert_eq!(demux.allocate_ephemeral_port(), Some(EPHEMERAL_PORT_MIN));
    }

    #[test]
    fn test_ephemeral_reuse_after_deallocate() {
        let mut demux = EndPointDemux::new();
        let id = demux.allocate().unwrap();
        let port = demux.get(id).unwrap().local_port();
        demux.deallocate(id);
        demux.ephemeral_cursor = port.checked_sub(1).unwrap();
        assert_eq!(demux.allocate_ephemeral_port(), Some(port));
    }

    #[test]
    fn test_port_conflict() {
        let mut demux = EndPointDemux::new();
        assert!(demux.allocate_with_port(5000).is_some());
        assert!(demux.allocate_with_port(5000).is_none());
        // A specific local address is a different binding.
        assert!(demux.allocate_with_address_port(LOCAL, 5000).is_some());
        assert!(demux.allocate_with_address_port(LOCAL, 5000).is_none());
    }

    #[test]
    fn test_connected_conflict() {
        let mut demux = EndPointDemux::new();
        assert!(demux.allocate_connected(LOCAL, 5000, PEER, 6000).is_some());
        assert!(demux.allocate_connected(LOCAL, 5000, PEER, 6000).is_none());
        // Different peer port: no conflict.
        assert!(demux.allocate_connected(LOCAL, 5000, PEER, 6001).is_some());
    }

    #[test]
    fn test_lookup_bound_endpoint() {
        let mut demux = EndPointDemux::new();
        let id = demux.allocate_with_address_port(LOCAL, 2000).unwrap();

        let found = demux.lookup(LOCAL, 2000, PEER, 1000, None);
        assert_eq!(found, vec![id]);

        assert!(demux.lookup(LOCAL, 2001, PEER, 1000, None).is_empty());
        assert!(demux
            .lookup(Ipv4Addr::new(10, 0, 0, 9), 2000, PEER, 1000, None)
            .is_empty());
    }

    #[test]
    fn test_lookup_specificity() {
        let mut demux = EndPointDemux::new();
        let wildcard = demux.allocate_with_port(2000).unwrap();
        let connected = demux.allocate_connected(LOCAL, 2000, PEER, 1000).unwrap();

        // The exact 4-tuple reaches only the connected endpoint.
        let found = demux.lookup(LOCAL, 2000, PEER, 1000, None);
        assert_eq!(found, vec![connected]);

        // A different source falls back to the wildcard listener.
        let found = demux.lookup(LOCAL, 2000, PEER, 1001, None);
        assert_eq!(found, vec![wildcard]);
    }

    #[test]
    fn test_lookup_prefers_less_generic_candidate() {
        let mut demux = EndPointDemux::new();
        let any = demux.allocate_with_port(2000).unwrap();
        let bound = demux.allocate_with_address_port(LOCAL, 2000).unwrap();

        let found = demux.lookup(LOCAL, 2000, PEER, 1000, None);
        assert_eq!(found, vec![bound]);

        // For other destinations only the wildcard qualifies.
        let found = demux.lookup(Ipv4Addr::new(10, 0, 0, 9), 2000, PEER, 1000, None);
        assert_eq!(found, vec![any]);
    }

    #[test]
    fn test_lookup_first_inserted_breaks_ties() {
        let mut demux = EndPointDemux::new();
        let first = demux.allocate_with_address_port(LOCAL, 2000).unwrap();
        let _second = demux
            .allocate_with_address_port(Ipv4Addr::new(10, 0, 0, 9), 2000)
            .unwrap();

        // Broadcast makes both candidates with equal genericity.
        let found = demux.lookup(Ipv4Addr::BROADCAST, 2000, PEER, 1000, None);
        assert_eq!(found, vec![first]);
    }

    #[test]
    fn test_lookup_broadcast_reaches_bound_endpoint() {
        let mut demux = EndPointDemux::new();
        let id = demux.allocate_with_address_port(LOCAL, 2000).unwrap();
        let found = demux.lookup(Ipv4Addr::BROADCAST, 2000, PEER, 1000, None);
        assert_eq!(found, vec![id]);
    }

    #[test]
    fn test_lookup_connected_rejects_other_peer() {
        let mut demux = EndPointDemux::new();
        demux.allocate_connected(LOCAL, 2000, PEER, 1000).unwrap();

        assert!(demux.lookup(LOCAL, 2000, PEER, 1001, None).is_empty());
        assert!(demux
            .lookup(LOCAL, 2000, Ipv4Addr::new(10, 0, 0, 9), 1000, None)
            .is_empty());
    }

    #[test]
    fn test_lookup_bound_interface_filter() {
        let mut demux = EndPointDemux::new();
        let id = demux.allocate_with_port(2000).unwrap();
        demux.get_mut(id).unwrap().bind_to_interface(Some(1));

        assert_eq!(demux.lookup(LOCAL, 2000, PEER, 1000, Some(1)), vec![id]);
        assert!(demux.lookup(LOCAL, 2000, PEER, 1000, Some(0)).is_empty());
        // Unknown incoming interface does not filter.
        assert_eq!(demux.lookup(LOCAL, 2000, PEER, 1000, None), vec![id]);
    }

    #[test]
    fn test_forward_up_invokes_callback() {
        let mut demux = EndPointDemux::new();
        let id = demux.allocate_with_port(2000).unwrap();

        let received: Rc<RefCell<Vec<(Vec<u8>, Ipv4Addr, u16)>>> = Rc::default();
        let sink = received.clone();
        demux
            .get_mut(id)
            .unwrap()
            .set_receive_callback(Box::new(move |payload, addr, port| {
                sink.borrow_mut().push((payload.to_vec(), addr, port));
            }));

        demux.get_mut(id).unwrap().forward_up(b"hi", PEER, 1000);
        assert_eq!(&*received.borrow(), &[(b"hi".to_vec(), PEER, 1000)]);
    }

    #[test]
    fn test_deallocate_runs_destroy_callback() {
        let mut demux = EndPointDemux::new();
        let id = demux.allocate_with_port(2000).unwrap();

        let destroyed = Rc::new(RefCell::new(false));
        let flag = destroyed.clone();
        demux
            .get_mut(id)
            .unwrap()
            .set_destroy_callback(Box::new(move || *flag.borrow_mut() = true));

        assert!(demux.deallocate(id));
        assert!(*destroyed.borrow());
        assert!(demux.get(id).is_none());
        assert!(!demux.deallocate(id));
    }
}

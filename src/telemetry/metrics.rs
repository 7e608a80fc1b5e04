//! Packet statistics for one simulated stack.
//!
//! Policy drops (no route, TTL expired, MTU exceeded, dead ARP entries and
//! the like) are never surfaced as errors on the datapath; these counters
//! are the observer side-channel that records them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter with relaxed increment semantics.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-node stack statistics.
#[derive(Debug, Default)]
pub struct StackMetrics {
    /// IPv4 packets handed to an interface for transmission.
    pub tx_packets: Counter,
    /// IPv4 packets received from a device.
    pub rx_packets: Counter,
    /// Packets forwarded on behalf of other hosts.
    pub packets_forwarded: Counter,
    /// Packets delivered to a local transport protocol.
    pub packets_delivered: Counter,
    /// UDP payload copies handed to endpoints.
    pub udp_delivered: Counter,

    // Address resolution
    /// Resolution requests sent.
    pub arp_requests_sent: Counter,
    /// Resolution replies sent.
    pub arp_replies_sent: Counter,
    /// Replies ignored because no entry was waiting (anti-spoofing).
    pub arp_replies_ignored: Counter,

    // Drops, by reason
    /// No route to the destination.
    pub drop_no_route: Counter,
    /// TTL expired during forwarding.
    pub drop_ttl_expired: Counter,
    /// Packet larger than the outgoing interface MTU.
    pub drop_mtu_exceeded: Counter,
    /// Interface was administratively down.
    pub drop_iface_down: Counter,
    /// Send attempt hit a dead resolution entry.
    pub drop_arp_dead: Counter,
    /// Pending packet displaced by a newer one while waiting for a reply.
    pub drop_arp_displaced: Counter,
    /// Outstanding resolution request expired with a packet still held.
    pub drop_arp_wait_expired: Counter,
    /// Pending packets discarded by a cache flush.
    pub drop_arp_flushed: Counter,
    /// Malformed header at any layer.
    pub drop_bad_header: Counter,
    /// Transport checksum validation failed.
    pub drop_bad_checksum: Counter,
    /// No endpoint matched an inbound datagram.
    pub drop_no_endpoint: Counter,
    /// No transport registered for the IP protocol number.
    pub drop_no_protocol: Counter,
}

impl StackMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total packets dropped for policy reasons.
    pub fn drops_total(&self) -> u64 {
        self.drop_no_route.get()
            + self.drop_ttl_expired.get()
            + self.drop_mtu_exceeded.get()
            + self.drop_iface_down.get()
            + self.drop_arp_dead.get()
            + self.drop_arp_displaced.get()
            + self.drop_arp_wait_expired.get()
            + self.drop_arp_flushed.get()
            + self.drop_bad_header.get()
            + self.drop_bad_checksum.get()
            + self.drop_no_endpoint.get()
            + self.drop_no_protocol.get()
    }

    /// Name/value pairs for summary output.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("tx_packets", self.tx_packets.get()),
            ("rx_packets", self.rx_packets.get()),
            ("packets_forwarded", self.packets_forwarded.get()),
            ("packets_delivered", self.packets_delivered.get()),
            ("udp_delivered", self.udp_delivered.get()),
            ("arp_requests_sent", self.arp_requests_sent.get()),
            ("arp_replies_sent", self.arp_replies_sent.get()),
            ("drops_total", self.drops_total()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_drops_total() {
        let metrics = StackMetrics::new();
        metrics.drop_no_route.inc();
        metrics.drop_ttl_expired.add(2);
        metrics.tx_packets.add(10);
        assert_eq!(metrics.drops_total(), 3);
    }

    #[test]
    fn test_snapshot_names_unique() {
        let metrics = StackMetrics::new();
        let snapshot = metrics.snapshot();
        let mut names: Vec<_> = snapshot.iter().map(|(n, _)| *n).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), snapshot.len());
    }
}

//! Resolution engine
//!
//! Owns one cache per interface and runs the per-send state machine:
//! resolve an IP next hop to a link address, queue at most one packet
//! behind an outstanding request, and hand back packets released by a
//! matching reply. Frame construction and transmission stay with the
//! caller, which knows the interface and device.

use crate::stack::arp_cache::{ArpCache, ArpCacheConfig, ArpState};
use crate::protocol::LinkAddr;
use crate::telemetry::StackMetrics;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, trace};

/// Outcome of one resolution attempt
#[derive(Debug, PartialEq, Eq)]
pub enum ResolveResult {
    /// The destination is resolved; send `packet` to `link_addr` now.
    Resolved { link_addr: LinkAddr, packet: Vec<u8> },
    /// Packet queued; the caller must transmit a resolution request.
    RequestNeeded,
    /// Packet queued behind the already-outstanding request.
    Queued,
    /// Dropped (dead entry, or the outstanding request expired).
    Dropped,
}

/// Per-node resolution state, one cache per interface
#[derive(Debug, Default)]
pub struct ArpEngine {
    caches: Vec<ArpCache>,
}

impl ArpEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cache for a newly added interface.
    pub fn add_interface(&mut self, config: ArpCacheConfig) {
        self.caches.push(ArpCache::with_config(config));
    }

    pub fn cache(&self, iface: usize) -> &ArpCache {
        &self.caches[iface]
    }

    pub fn cache_mut(&mut self, iface: usize) -> &mut ArpCache {
        &mut self.caches[iface]
    }

    /// Drop every entry of an interface's cache; held packets are
    /// discarded, never delivered.
    pub fn flush(&mut self, iface: usize, metrics: &StackMetrics) {
        let held = self.caches[iface].flush();
        metrics.drop_arp_flushed.add(held as u64);
        if held > 0 {
            debug!(iface, held, "resolution cache flushed with packets pending");
        }
    }

    /// Try to resolve `dest` on `iface` for `packet`.
    pub fn resolve(
        &mut self,
        iface: usize,
        dest: Ipv4Addr,
        packet: Vec<u8>,
        now: Duration,
        metrics: &StackMetrics,
    ) -> ResolveResult {
        let cache = &mut self.caches[iface];
        let config = *cache.config();

        if cache.lookup(&dest).is_none() {
            trace!(iface, %dest, "no entry, requesting resolution");
            cache.add(dest, now).hold(packet);
            return ResolveResult::RequestNeeded;
        }
        let entry = cache.lookup_mut(&dest).unwrap();

        if entry.is_expired(now, &config) {
            match entry.state() {
                // Stale entries re-request whether the last attempt
                // succeeded or not.
                ArpState::Dead | ArpState::Alive => {
                    trace!(iface, %dest, state = ?entry.state(), "entry expired, re-requesting");
                    entry.mark_wait_reply(now);
                    entry.hold(packet);
                    ResolveResult::RequestNeeded
                }
                ArpState::WaitReply => {
                    debug!(iface, %dest, "request expired unanswered, giving up");
                    if entry.mark_dead(now).is_some() {
                        metrics.drop_arp_wait_expired.inc();
                    }
                    metrics.drop_arp_wait_expired.inc();
                    ResolveResult::Dropped
                }
            }
        } else {
            match entry.state() {
                ArpState::Alive => ResolveResult::Resolved {
                    link_addr: entry.link_addr().expect("alive entry has link address"),
                    packet,
                },
                ArpState::WaitReply => {
                    if entry.hold(packet).is_some() {
                        trace!(iface, %dest, "displaced packet already waiting on resolution");
                        metrics.drop_arp_displaced.inc();
                    }
                    ResolveResult::Queued
                }
                ArpState::Dead => {
                    trace!(iface, %dest, "entry dead, dropping");
                    metrics.drop_arp_dead.inc();
                    ResolveResult::Dropped
                }
            }
        }
    }

    /// Process a resolution reply for `sender_ip`/`sender_link` received
    /// on `iface`. Returns the packet released for transmission when the
    /// reply matched a waiting entry. Replies for entries not waiting, or
    /// for unknown destinations, are ignored.
    pub fn handle_reply(
        &mut self,
        iface: usize,
        sender_ip: Ipv4Addr,
        sender_link: LinkAddr,
        now: Duration,
        metrics: &StackMetrics,
    ) -> Option<Vec<u8>> {
        let cache = &mut self.caches[iface];
        match cache.lookup_mut(&sender_ip) {
            Some(entry) if entry.is_wait_reply() => {
                trace!(iface, %sender_ip, %sender_link, "entry resolved");
                entry.mark_alive(sender_link, now)
            }
            Some(_) => {
                debug!(iface, %sender_ip, "reply for entry not waiting, ignored");
                metrics.arp_replies_ignored.inc();
                None
            }
            None => {
                debug!(iface, %sender_ip, "reply for unknown destination, ignored");
                metrics.arp_replies_ignored.inc();
                None
            }
        }
    }
}

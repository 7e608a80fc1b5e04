//! Static routing
//!
//! Host, network and default routes live in separate ordered lists.
//! Network lookup returns the first inserted match, not the longest
//! prefix; insertion order is part of the contract. Multicast routes get
//! progressively less strict matching only for locally originated
//! packets.

use crate::protocol::Ipv4Mask;
use std::net::Ipv4Addr;
use tracing::trace;

/// Unicast route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Host {
        dest: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
        iface: usize,
    },
    Network {
        dest: Ipv4Addr,
        mask: Ipv4Mask,
        gateway: Option<Ipv4Addr>,
        iface: usize,
    },
    Default {
        gateway: Ipv4Addr,
        iface: usize,
    },
}

impl Route {
    pub fn gateway(&self) -> Option<Ipv4Addr> {
        match *self {
            Route::Host { gateway, .. } | Route::Network { gateway, .. } => gateway,
            Route::Default { gateway, .. } => Some(gateway),
        }
    }

    pub fn iface(&self) -> usize {
        match *self {
            Route::Host { iface, .. }
            | Route::Network { iface, .. }
            | Route::Default { iface, .. } => iface,
        }
    }
}

/// Multicast route; an unspecified origin and a missing input interface
/// act as wildcards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastRoute {
    pub origin: Ipv4Addr,
    pub group: Ipv4Addr,
    pub input_iface: Option<usize>,
    pub output_ifaces: Vec<usize>,
}

/// Route storage with tiered lookup
#[derive(Debug, Default)]
pub struct RoutingTable {
    host_routes: Vec<Route>,
    network_routes: Vec<Route>,
    default_route: Option<Route>,
    multicast_routes: Vec<MulticastRoute>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host_route(&mut self, dest: Ipv4Addr, iface: usize) {
        self.host_routes.push(Route::Host {
            dest,
            gateway: None,
            iface,
        });
    }

    pub fn add_host_route_via(&mut self, dest: Ipv4Addr, gateway: Ipv4Addr, iface: usize) {
        self.host_routes.push(Route::Host {
            dest,
            gateway: Some(gateway),
            iface,
        });
    }

    pub fn add_network_route(&mut self, dest: Ipv4Addr, mask: Ipv4Mask, iface: usize) {
        self.network_routes.push(Route::Network {
            dest,
            mask,
            gateway: None,
            iface,
        });
    }

    pub fn add_network_route_via(
        &mut self,
        dest: Ipv4Addr,
        mask: Ipv4Mask,
        gateway: Ipv4Addr,
        iface: usize,
    ) {
        self.network_routes.push(Route::Network {
            dest,
            mask,
            gateway: Some(gateway),
            iface,
        });
    }

    /// Install the default route, replacing any existing one.
    pub fn set_default_route(&mut self, gateway: Ipv4Addr, iface: usize) {
        self.default_route = Some(Route::Default { gateway, iface });
    }

    pub fn default_route(&self) -> Option<&Route> {
        self.default_route.as_ref()
    }

    /// Host routes by exact match, then network routes in insertion
    /// order, then the default route.
    pub fn lookup_unicast(&self, dest: Ipv4Addr) -> Option<&Route> {
        for route in &self.host_routes {
            if let Route::Host { dest: d, .. } = route {
                if *d == dest {
                    return Some(route);
                }
            }
        }
        for route in &self.network_routes {
            if let Route::Network { dest: d, mask, .. } = route {
                if mask.matches(dest, *d) {
                    return Some(route);
                }
            }
        }
        self.default_route.as_ref()
    }

    /// Multicast lookup. The strict pass matches origin (or wildcard
    /// lookup origin) plus group plus input interface. Looser passes
    /// (wildcard-origin routes, then fully wildcard routes) apply only to
    /// locally originated packets; forwarded packets never guess.
    pub fn lookup_multicast(
        &self,
        origin: Ipv4Addr,
        group: Ipv4Addr,
        input_iface: Option<usize>,
    ) -> Option<&MulticastRoute> {
        for route in &self.multicast_routes {
            if (origin == route.origin || origin.is_unspecified()) && group == route.group {
                if input_iface.is_none() || input_iface == route.input_iface {
                    return Some(route);
                }
            }
        }

        if input_iface.is_some() {
            return None;
        }

        for route in &self.multicast_routes {
            if route.origin.is_unspecified() && group == route.group {
                return Some(route);
            }
        }

        for route in &self.multicast_routes {
            if route.origin.is_unspecified() && route.group.is_unspecified() {
                return Some(route);
            }
        }

        None
    }

    pub fn add_multicast_route(
        &mut self,
        origin: Ipv4Addr,
        group: Ipv4Addr,
        input_iface: Option<usize>,
        output_ifaces: Vec<usize>,
    ) {
        self.multicast_routes.push(MulticastRoute {
            origin,
            group,
            input_iface,
            output_ifaces,
        });
    }

    /// Remove the first multicast route matching the triple exactly.
    pub fn remove_multicast_route(
        &mut self,
        origin: Ipv4Addr,
        group: Ipv4Addr,
        input_iface: Option<usize>,
    ) -> bool {
        if let Some(pos) = self.multicast_routes.iter().position(|route| {
            route.origin == origin && route.group == group && route.input_iface == input_iface
        }) {
            self.multicast_routes.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn remove_multicast_route_at(&mut self, index: usize) {
        self.multicast_routes.remove(index);
    }

    pub fn multicast_route_count(&self) -> usize {
        self.multicast_routes.len()
    }

    /// Number of unicast routes under the flattened indexing.
    pub fn route_count(&self) -> usize {
        self.host_routes.len()
            + self.network_routes.len()
            + usize::from(self.default_route.is_some())
    }

    /// Unicast route by flattened index: default (when set) at 0, then
    /// host routes, then network routes. Panics out of range.
    pub fn route(&self, index: usize) -> &Route {
        let mut index = index;
        if let Some(default) = &self.default_route {
            if index == 0 {
                return default;
            }
            index -= 1;
        }
        if index < self.host_routes.len() {
            return &self.host_routes[index];
        }
        index -= self.host_routes.len();
        &self.network_routes[index]
    }

    /// Remove a unicast route by flattened index. Panics out of range.
    pub fn remove_route(&mut self, index: usize) {
        let mut index = index;
        if self.default_route.is_some() {
            if index == 0 {
                self.default_route = None;
                return;
            }
            index -= 1;
        }
        if index < self.host_routes.len() {
            self.host_routes.remove(index);
            return;
        }
        index -= self.host_routes.len();
        self.network_routes.remove(index);
    }
}

/// Resolved output decision handed to the forwarding engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteReply {
    Unicast {
        iface: usize,
        gateway: Option<Ipv4Addr>,
    },
    Multicast {
        output_ifaces: Vec<usize>,
    },
}

impl RouteReply {
    fn from_route(route: &Route) -> Self {
        RouteReply::Unicast {
            iface: route.iface(),
            gateway: route.gateway(),
        }
    }
}

/// A pluggable source of routes consulted before the static table
pub trait RoutingProvider {
    /// Answer a route request, or None to let lower-priority providers
    /// (and finally the static table) try.
    fn route_output(
        &self,
        src: Ipv4Addr,
        dest: Ipv4Addr,
        input_iface: Option<usize>,
    ) -> Option<RouteReply>;
}

/// Providers in descending priority order, backed by the static table
pub struct RoutingSystem {
    providers: Vec<(i16, Box<dyn RoutingProvider>)>,
    table: RoutingTable,
}

impl Default for RoutingSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingSystem {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            table: RoutingTable::new(),
        }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut RoutingTable {
        &mut self.table
    }

    /// Register a provider. Higher priority is consulted first;
    /// registration order breaks ties.
    pub fn add_provider(&mut self, provider: Box<dyn RoutingProvider>, priority: i16) {
        self.providers.push((priority, provider));
        self.providers.sort_by(|a, b| b.0.cmp(&a.0));
    }

    /// Resolve the output for a packet: providers first, then the static
    /// table. Locally originated multicast without a multicast route
    /// falls back to the default unicast route.
    pub fn resolve(
        &self,
        src: Ipv4Addr,
        dest: Ipv4Addr,
        input_iface: Option<usize>,
    ) -> Option<RouteReply> {
        for (priority, provider) in &self.providers {
            if let Some(reply) = provider.route_output(src, dest, input_iface) {
                trace!(%dest, priority, "route from provider");
                return Some(reply);
            }
        }

        if dest.is_multicast() {
            if let Some(route) = self.table.lookup_multicast(src, dest, input_iface) {
                return Some(RouteReply::Multicast {
                    output_ifaces: route.output_ifaces.clone(),
                });
            }
            if input_iface.is_none() {
                if let Some(route) = self.table.default_route() {
                    trace!(%dest, "local multicast using default unicast route");
                    return Some(RouteReply::from_route(route));
                }
            }
            return None;
        }

        self.table.lookup_unicast(dest).map(RouteReply::from_route)
    }
}

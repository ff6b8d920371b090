//! The IPv4 routing table.

use crate::NetStack;
use crate::addr::{Ipv4Addr, network};
use crate::intf::IntfId;
use alloc::vec::Vec;
use core::fmt;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Route {
    pub dst: Ipv4Addr,
    pub mask: Ipv4Addr,
    /// `0.0.0.0` for on-link destinations.
    pub gateway: Ipv4Addr,
    pub intf: IntfId,
}

impl Route {
    #[must_use]
    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        network(addr, self.mask) == self.dst
    }

    /// Where to send a packet for `dst`: the gateway, or `dst` itself when
    /// the route is on-link.
    #[must_use]
    pub const fn next_addr(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if self.gateway.is_unspecified() {
            dst
        } else {
            self.gateway
        }
    }
}

/// Routes ordered from the most to the least specific mask, so the first
/// match is the longest prefix.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    #[must_use]
    pub const fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Insert behind every route whose mask is at least as specific.
    pub fn add(&mut self, route: Route) {
        let mask = u32::from(route.mask);
        let at = self
            .routes
            .iter()
            .position(|r| u32::from(r.mask) < mask)
            .unwrap_or(self.routes.len());
        self.routes.insert(at, route);
    }

    #[must_use]
    pub fn find(&self, dst: Ipv4Addr) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(dst))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The routing table as a fixed-column listing.
pub struct RouteDump<'a> {
    stack: &'a NetStack,
}

impl fmt::Display for RouteDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Destination     Netmask         Gateway         Interface")?;
        for route in self.stack.routes.iter() {
            write!(f, "{:<16}{:<16}", route.dst, route.mask)?;
            if route.gateway.is_unspecified() {
                write!(f, "{:<16}", "On-link")?;
            } else {
                write!(f, "{:<16}", route.gateway)?;
            }
            writeln!(f, "{}", self.stack.intf(route.intf).name)?;
        }
        Ok(())
    }
}

impl NetStack {
    #[must_use]
    pub const fn route_dump(&self) -> RouteDump<'_> {
        RouteDump { stack: self }
    }
}

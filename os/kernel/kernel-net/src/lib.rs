//! # Network stack
//!
//! A small IPv4 stack: Ethernet with ARP, IPv4 without fragmentation,
//! ICMP echo, UDP for the DHCP, DNS and NTP clients, and a TCP state
//! machine that resequences out-of-order data but never retransmits.
//!
//! All state (interfaces, routes, ARP cache, TCP connections, pending DNS
//! queries) lives in one [`NetStack`]. Each protocol module adds its own
//! `impl NetStack` block; a received frame travels down by plain method
//! calls, each layer moving the [`NetBuf`] window past its header:
//!
//! ```text
//!  NetDevice::receive ─► eth_recv ─┬─► arp_recv
//!                                  └─► ipv4_recv ─┬─► icmp_recv
//!                                                 ├─► udp_recv ─► dhcp / dns / ntp
//!                                                 └─► tcp_recv
//! ```
//!
//! Nothing here blocks. The kernel calls [`NetStack::poll`] from its idle
//! loop to drain receive queues and expire `TIME_WAIT` connections.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod addr;
mod arp;
pub mod buf;
pub mod checksum;
pub mod dhcp;
pub mod dns;
pub mod eth;
pub mod icmp;
pub mod intf;
pub mod ipv4;
mod loopback;
pub mod ntp;
pub mod port;
pub mod route;
pub mod tcp;
mod udp;

#[cfg(test)]
mod testing;

pub use crate::addr::{EthAddr, Ipv4Addr, SocketAddrV4};
pub use crate::arp::ARP_CACHE_SIZE;
pub use crate::buf::{NET_BUFS, NetBuf, NetBufPool};
pub use crate::dhcp::DhcpState;
pub use crate::dns::DnsCallback;
pub use crate::intf::{IntfId, Interface, NetDevice};
pub use crate::route::{Route, RouteTable};
pub use crate::tcp::{ConnId, TcpConn, TcpError, TcpHandler, TcpState};

use crate::arp::ArpCache;
use crate::dns::DnsClient;
use crate::intf::Link;
use crate::port::PortAllocator;
use crate::tcp::TcpTable;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use thiserror::Error;

/// Time sources the stack depends on.
pub trait Clock: Send {
    /// Milliseconds since boot; one timer tick each.
    fn ticks(&self) -> u32;

    /// Wall-clock seconds since the Unix epoch.
    fn unix_time(&self) -> u64;

    /// Set the wall clock (from an NTP reply).
    fn set_unix_time(&mut self, secs: u64);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum NetError {
    #[error("no route to {0}")]
    NoRoute(Ipv4Addr),
    #[error("packet does not fit into a buffer")]
    BufferFull,
    #[error("out of packet buffers")]
    NoBuffers,
    #[error("no DNS server configured")]
    NoDnsServer,
    #[error("host name is not encodable")]
    BadHostName,
    #[error("no such connection")]
    NoSuchConnection,
    #[error("connection is not established")]
    NotConnected,
}

pub struct NetStack {
    interfaces: Vec<Interface>,
    routes: RouteTable,
    arp: ArpCache,
    tcp: TcpTable,
    dns: DnsClient,
    ports: PortAllocator,
    clock: Box<dyn Clock>,
}

impl NetStack {
    #[must_use]
    pub fn new(clock: Box<dyn Clock>) -> Self {
        Self {
            interfaces: Vec::new(),
            routes: RouteTable::new(),
            arp: ArpCache::new(),
            tcp: TcpTable::new(),
            dns: DnsClient::new(),
            ports: PortAllocator::new(),
            clock,
        }
    }

    /// Register a driver's interface. `ip_addr` may be `0.0.0.0`, in which
    /// case [`init`](Self::init) configures it over DHCP.
    pub fn add_interface(
        &mut self,
        name: impl Into<String>,
        eth_addr: EthAddr,
        ip_addr: Ipv4Addr,
        device: Box<dyn NetDevice>,
    ) -> IntfId {
        self.push_interface(Interface::new(
            name.into(),
            eth_addr,
            ip_addr,
            Link::Device(device),
        ))
    }

    pub(crate) fn push_interface(&mut self, intf: Interface) -> IntfId {
        let id = IntfId(self.interfaces.len());
        log::debug!("net: interface {} ({}) registered", intf.name, intf.eth_addr);
        self.interfaces.push(intf);
        id
    }

    /// Bring the stack up: loopback, an empty ARP cache, the TCP sequence
    /// base, and DHCP discovery on every interface without an address.
    pub fn init(&mut self) {
        self.loopback_init();
        self.arp.clear();
        self.tcp_init();

        for index in 0..self.interfaces.len() {
            let id = IntfId(index);
            if self.intf(id).ip_addr.is_unspecified()
                && let Err(e) = self.dhcp_discover(id)
            {
                log::warn!("net: DHCP discovery on {} failed: {e}", self.intf(id).name);
            }
        }
    }

    /// Drain every interface's receive queue, then expire TCP connections.
    pub fn poll(&mut self) {
        for index in 0..self.interfaces.len() {
            let id = IntfId(index);
            loop {
                let frame = match &mut self.interfaces[index].link {
                    Link::Device(device) => device.receive(),
                    Link::Loopback => None,
                };
                let Some(frame) = frame else { break };
                self.eth_recv(id, frame);
            }
        }

        self.tcp_poll();
    }

    #[must_use]
    pub fn interface(&self, id: IntfId) -> Option<&Interface> {
        self.interfaces.get(id.0)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = (IntfId, &Interface)> {
        self.interfaces
            .iter()
            .enumerate()
            .map(|(i, intf)| (IntfId(i), intf))
    }

    #[must_use]
    pub const fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn add_route(&mut self, route: Route) {
        self.routes.add(route);
    }

    /// Current tick count of the stack's clock.
    #[must_use]
    pub fn ticks(&self) -> u32 {
        self.clock.ticks()
    }

    /// Interface by id. Ids only come from this stack, so the index is
    /// always in range.
    pub(crate) fn intf(&self, id: IntfId) -> &Interface {
        &self.interfaces[id.0]
    }

    pub(crate) fn intf_mut(&mut self, id: IntfId) -> &mut Interface {
        &mut self.interfaces[id.0]
    }
}

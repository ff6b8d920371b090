//! Network interfaces and the driver boundary.

use crate::addr::{EthAddr, Ipv4Addr};
use crate::buf::NetBuf;
use crate::dhcp::DhcpClient;
use alloc::boxed::Box;
use alloc::string::String;

/// What a network card driver provides.
///
/// The stack owns the device once it is registered with
/// [`NetStack::add_interface`](crate::NetStack::add_interface) and drives it
/// from [`NetStack::poll`](crate::NetStack::poll).
pub trait NetDevice: Send {
    /// The next received Ethernet frame, if one is waiting.
    fn receive(&mut self) -> Option<NetBuf>;

    /// Queue a complete Ethernet frame for transmission.
    fn transmit(&mut self, frame: NetBuf);
}

/// Index of an interface inside its [`NetStack`](crate::NetStack).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IntfId(pub(crate) usize);

impl IntfId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

pub(crate) enum Link {
    /// Frames sent here are received again right away.
    Loopback,
    Device(Box<dyn NetDevice>),
}

pub struct Interface {
    pub name: String,
    pub eth_addr: EthAddr,
    pub ip_addr: Ipv4Addr,
    pub broadcast_addr: Ipv4Addr,
    pub(crate) link: Link,
    pub(crate) dhcp: DhcpClient,
}

impl Interface {
    pub(crate) fn new(name: String, eth_addr: EthAddr, ip_addr: Ipv4Addr, link: Link) -> Self {
        Self {
            name,
            eth_addr,
            ip_addr,
            broadcast_addr: Ipv4Addr::UNSPECIFIED,
            link,
            dhcp: DhcpClient::new(eth_addr),
        }
    }

    #[must_use]
    pub const fn is_loopback(&self) -> bool {
        matches!(self.link, Link::Loopback)
    }
}

impl core::fmt::Debug for Interface {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("eth_addr", &self.eth_addr)
            .field("ip_addr", &self.ip_addr)
            .field("broadcast_addr", &self.broadcast_addr)
            .finish_non_exhaustive()
    }
}

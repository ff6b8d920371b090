//! Link and network addresses.
//!
//! IPv4 addresses and `address:port` pairs are the `core::net` types, which
//! already print as dotted decimal (`10.0.2.15`, `10.0.2.15:80`) and parse
//! from the same text. This module adds the Ethernet address and the
//! helpers the wire code needs.

use core::fmt;
pub use core::net::{Ipv4Addr, SocketAddrV4};

/// A 48-bit Ethernet MAC address.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct EthAddr(pub [u8; 6]);

impl EthAddr {
    pub const NULL: Self = Self([0; 6]);
    pub const BROADCAST: Self = Self([0xFF; 6]);

    /// Read an address from the first six bytes of `bytes`.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Some(Self(bytes.get(..6)?.try_into().ok()?))
    }

    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for EthAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for EthAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Read an IPv4 address from the first four bytes of `bytes`.
#[must_use]
pub fn ipv4_from(bytes: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

/// `addr & mask`.
#[must_use]
pub fn network(addr: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) & u32::from(mask))
}

/// The directed broadcast address of `addr`'s subnet.
#[must_use]
pub fn directed_broadcast(addr: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) | !u32::from(mask))
}

//! IPv4: header checks, protocol dispatch and the send path.
//!
//! Fragments are dropped; there is no reassembly.

use crate::addr::{Ipv4Addr, ipv4_from};
use crate::buf::NetBuf;
use crate::checksum::checksum;
use crate::eth::{ET_IPV4, LinkDst};
use crate::intf::IntfId;
use crate::{NetError, NetStack};
use bitfield_struct::bitfield;

pub const IP_PROTOCOL_ICMP: u8 = 1;
pub const IP_PROTOCOL_TCP: u8 = 6;
pub const IP_PROTOCOL_UDP: u8 = 17;

pub const IPV4_HEADER_LEN: usize = 20;
const DEFAULT_TTL: u8 = 64;

/// First header byte.
#[bitfield(u8)]
pub struct VersionIhl {
    /// Header length in 32-bit words.
    #[bits(4)]
    pub ihl: u8,
    #[bits(4)]
    pub version: u8,
}

/// Flags and fragment offset (header bytes 6 and 7, big-endian).
#[bitfield(u16)]
pub struct Fragment {
    #[bits(13)]
    pub offset: u16,
    pub more_fragments: bool,
    pub dont_fragment: bool,
    #[bits(1)]
    __: u8,
}

/// The fields of a received header the upper layers look at.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    /// Total length including the header.
    pub len: u16,
}

/// Validate the header at the front of `packet`.
///
/// Returns the header and its length in bytes.
fn parse(packet: &[u8]) -> Option<(Ipv4Header, usize)> {
    if packet.len() < IPV4_HEADER_LEN {
        return None;
    }
    let vi = VersionIhl::from_bits(packet[0]);
    if vi.version() != 4 {
        return None;
    }
    let frag = Fragment::from_bits(u16::from_be_bytes([packet[6], packet[7]]));
    if frag.offset() != 0 || frag.more_fragments() {
        log::trace!("ipv4: fragment dropped");
        return None;
    }

    let header_len = usize::from(vi.ihl()) * 4;
    let len = u16::from_be_bytes([packet[2], packet[3]]);
    if header_len < IPV4_HEADER_LEN || usize::from(len) < header_len {
        return None;
    }
    if usize::from(len) > packet.len() {
        log::debug!("ipv4: packet too long");
        return None;
    }
    if checksum(&packet[..header_len]) != 0 {
        log::debug!("ipv4: bad header checksum");
        return None;
    }

    Some((
        Ipv4Header {
            src: ipv4_from(&packet[12..16])?,
            dst: ipv4_from(&packet[16..20])?,
            protocol: packet[9],
            ttl: packet[8],
            len,
        },
        header_len,
    ))
}

fn dump(packet: &[u8]) {
    if let Some((ip, header_len)) = parse(packet) {
        log::trace!(
            "   IPv4: ihl={header_len} len={} ttl={} protocol={} dst={} src={}",
            ip.len,
            ip.ttl,
            ip.protocol,
            ip.dst,
            ip.src
        );
    }
}

impl NetStack {
    pub(crate) fn ipv4_recv(&mut self, intf: IntfId, mut buf: NetBuf) {
        dump(buf.payload());
        let Some((header, header_len)) = parse(buf.payload()) else {
            return;
        };
        buf.truncate(usize::from(header.len));
        buf.pull(header_len);

        match header.protocol {
            IP_PROTOCOL_ICMP => self.icmp_recv(intf, &header, buf),
            IP_PROTOCOL_TCP => self.tcp_recv(intf, &header, buf),
            IP_PROTOCOL_UDP => self.udp_recv(intf, &header, buf),
            other => log::trace!("ipv4: protocol {other} not handled"),
        }
    }

    /// Route `buf` to `dst`.
    ///
    /// # Errors
    /// [`NetError::NoRoute`] if no route matches.
    pub fn ipv4_send(&mut self, dst: Ipv4Addr, protocol: u8, buf: NetBuf) -> Result<(), NetError> {
        let route = *self.routes.find(dst).ok_or(NetError::NoRoute(dst))?;
        self.ipv4_intf_send(route.intf, route.next_addr(dst), dst, protocol, buf)
    }

    /// Prepend an IPv4 header and send through `intf` towards `next_addr`.
    ///
    /// # Errors
    /// [`NetError::BufferFull`] if the packet does not fit.
    pub fn ipv4_intf_send(
        &mut self,
        intf: IntfId,
        next_addr: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        mut buf: NetBuf,
    ) -> Result<(), NetError> {
        let total = u16::try_from(buf.len() + IPV4_HEADER_LEN).map_err(|_| NetError::BufferFull)?;
        let src = self.intf(intf).ip_addr;

        let h = buf.push_header(IPV4_HEADER_LEN)?;
        h[0] = VersionIhl::new().with_version(4).with_ihl(5).into_bits();
        h[2..4].copy_from_slice(&total.to_be_bytes());
        h[8] = DEFAULT_TTL;
        h[9] = protocol;
        h[12..16].copy_from_slice(&src.octets());
        h[16..20].copy_from_slice(&dst.octets());
        let sum = checksum(h);
        h[10..12].copy_from_slice(&sum.to_be_bytes());

        dump(buf.payload());
        self.intf_send(intf, LinkDst::Ip(next_addr), ET_IPV4, buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ipv4_packet;

    #[test]
    fn parses_valid_header() {
        let packet = ipv4_packet([10, 0, 0, 2], [10, 0, 0, 1], IP_PROTOCOL_UDP, b"payload");
        let (ip, header_len) = parse(&packet).unwrap();
        assert_eq!(header_len, 20);
        assert_eq!(ip.src, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ip.protocol, IP_PROTOCOL_UDP);
        assert_eq!(ip.len, 27);
    }

    #[test]
    fn drops_fragments() {
        let mut packet = ipv4_packet([10, 0, 0, 2], [10, 0, 0, 1], IP_PROTOCOL_UDP, b"x");
        let flags = Fragment::new().with_more_fragments(true).into_bits();
        packet[6..8].copy_from_slice(&flags.to_be_bytes());
        packet[10..12].fill(0);
        let sum = checksum(&packet[..20]);
        packet[10..12].copy_from_slice(&sum.to_be_bytes());
        assert!(parse(&packet).is_none());

        let flags = Fragment::new().with_offset(8).into_bits();
        packet[6..8].copy_from_slice(&flags.to_be_bytes());
        assert!(parse(&packet).is_none());
    }

    #[test]
    fn drops_bad_lengths_and_checksums() {
        let packet = ipv4_packet([10, 0, 0, 2], [10, 0, 0, 1], IP_PROTOCOL_UDP, b"abcd");
        assert!(parse(&packet[..22]).is_none());

        let mut bad = packet.clone();
        bad[10] ^= 0xFF;
        assert!(parse(&bad).is_none());

        let mut v6 = packet;
        v6[0] = 0x65;
        assert!(parse(&v6).is_none());
    }

    #[test]
    fn dont_fragment_is_accepted() {
        let mut packet = ipv4_packet([10, 0, 0, 2], [10, 0, 0, 1], IP_PROTOCOL_UDP, b"x");
        packet[6] = 0x40;
        packet[10..12].fill(0);
        let sum = checksum(&packet[..20]);
        packet[10..12].copy_from_slice(&sum.to_be_bytes());
        assert!(parse(&packet).is_some());
    }
}

//! Ethernet II framing, with the 802.3 LLC/SNAP encapsulation accepted on
//! receive.

use crate::NetStack;
use crate::addr::{EthAddr, Ipv4Addr};
use crate::buf::NetBuf;
use crate::intf::{IntfId, Link};

pub const ET_IPV4: u16 = 0x0800;
pub const ET_ARP: u16 = 0x0806;
pub const ET_IPV6: u16 = 0x86DD;

pub const ETH_HEADER_LEN: usize = 14;
const SNAP_HEADER_LEN: usize = 22;
const MAX_802_3_LEN: u16 = 1500;

/// Link-layer destination handed to the interface send path.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum LinkDst {
    Eth(EthAddr),
    /// Resolve through ARP (or broadcast) first.
    Ip(Ipv4Addr),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EthHeader {
    pub dst: EthAddr,
    pub src: EthAddr,
    pub ethertype: u16,
    pub header_len: usize,
}

/// Decode a frame header. Returns `None` for runts and for 802.3 frames
/// that do not carry a SNAP header.
#[must_use]
pub fn decode(frame: &[u8]) -> Option<EthHeader> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }

    let dst = EthAddr::from_slice(&frame[0..6])?;
    let src = EthAddr::from_slice(&frame[6..12])?;
    let n = u16::from_be_bytes([frame[12], frame[13]]);
    if n > MAX_802_3_LEN {
        return Some(EthHeader {
            dst,
            src,
            ethertype: n,
            header_len: ETH_HEADER_LEN,
        });
    }

    // 802.3 length field: DSAP, SSAP, control, OUI, then the ethertype.
    if frame.len() < SNAP_HEADER_LEN || frame[14] != 0xAA || frame[15] != 0xAA {
        return None;
    }
    Some(EthHeader {
        dst,
        src,
        ethertype: u16::from_be_bytes([frame[20], frame[21]]),
        header_len: SNAP_HEADER_LEN,
    })
}

fn dump(frame: &[u8]) {
    if let Some(eth) = decode(frame) {
        log::trace!(
            "   ETH: dst={} src={} ethertype=0x{:04x} len={}",
            eth.dst,
            eth.src,
            eth.ethertype,
            frame.len() - eth.header_len
        );
    }
}

impl NetStack {
    /// Entry point for frames received on `intf`.
    pub fn eth_recv(&mut self, intf: IntfId, mut buf: NetBuf) {
        dump(buf.payload());
        let Some(eth) = decode(buf.payload()) else {
            log::trace!("eth: dropped undecodable frame");
            return;
        };
        buf.pull(eth.header_len);

        match eth.ethertype {
            ET_ARP => self.arp_recv(intf, buf),
            ET_IPV4 => self.ipv4_recv(intf, buf),
            ET_IPV6 => log::trace!("eth: IPv6 frame ignored"),
            other => log::trace!("eth: unknown ethertype 0x{other:04x}"),
        }
    }

    /// Hand a packet to `intf`'s link.
    pub(crate) fn intf_send(&mut self, intf: IntfId, dst: LinkDst, ethertype: u16, buf: NetBuf) {
        if self.intf(intf).is_loopback() {
            self.loop_send(intf, ethertype, buf);
        } else {
            self.eth_intf_send(intf, dst, ethertype, buf);
        }
    }

    /// Frame `buf` and transmit it, parking it behind an ARP request when
    /// the destination's hardware address is still unknown.
    pub(crate) fn eth_intf_send(
        &mut self,
        intf: IntfId,
        dst: LinkDst,
        ethertype: u16,
        mut buf: NetBuf,
    ) {
        let dst_eth = match dst {
            LinkDst::Eth(addr) => addr,
            LinkDst::Ip(ip) => {
                let i = self.intf(intf);
                if ip == Ipv4Addr::BROADCAST || ip == i.broadcast_addr {
                    EthAddr::BROADCAST
                } else if let Some(addr) = self.arp_lookup(ip) {
                    addr
                } else {
                    self.arp_request(intf, ip, ethertype, buf);
                    return;
                }
            }
        };

        let src = self.intf(intf).eth_addr;
        let Ok(header) = buf.push_header(ETH_HEADER_LEN) else {
            log::debug!("eth: no headroom, packet dropped");
            return;
        };
        header[0..6].copy_from_slice(&dst_eth.octets());
        header[6..12].copy_from_slice(&src.octets());
        header[12..14].copy_from_slice(&ethertype.to_be_bytes());

        dump(buf.payload());
        if let Link::Device(device) = &mut self.intf_mut(intf).link {
            device.transmit(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ethernet_ii() {
        let mut frame = [0u8; 20];
        frame[0..6].fill(0xFF);
        frame[6..12].copy_from_slice(&[2, 0, 0, 0, 0, 1]);
        frame[12..14].copy_from_slice(&ET_ARP.to_be_bytes());
        let eth = decode(&frame).unwrap();
        assert_eq!(eth.dst, EthAddr::BROADCAST);
        assert_eq!(eth.src, EthAddr([2, 0, 0, 0, 0, 1]));
        assert_eq!((eth.ethertype, eth.header_len), (ET_ARP, 14));
        assert!(decode(&frame[..13]).is_none());
    }

    #[test]
    fn llc_snap() {
        let mut frame = [0u8; 30];
        frame[12..14].copy_from_slice(&16u16.to_be_bytes());
        frame[14] = 0xAA;
        frame[15] = 0xAA;
        frame[16] = 0x03;
        frame[20..22].copy_from_slice(&ET_IPV4.to_be_bytes());
        let eth = decode(&frame).unwrap();
        assert_eq!((eth.ethertype, eth.header_len), (ET_IPV4, 22));

        frame[15] = 0x42;
        assert!(decode(&frame).is_none());
        assert!(decode(&frame[..21]).is_none());
    }
}

//! ARP for IPv4 over Ethernet.

use crate::NetStack;
use crate::addr::{EthAddr, Ipv4Addr, ipv4_from};
use crate::buf::NetBuf;
use crate::eth::{ET_ARP, ET_IPV4, LinkDst};
use crate::intf::IntfId;
use alloc::vec::Vec;

pub const ARP_CACHE_SIZE: usize = 16;

const ARP_HTYPE_ETH: u16 = 1;
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;
const ARP_LEN: usize = 28;

/// A packet waiting for its destination's hardware address.
struct Pending {
    intf: IntfId,
    ethertype: u16,
    buf: NetBuf,
}

struct ArpEntry {
    ha: EthAddr,
    pa: Ipv4Addr,
    pending: Option<Pending>,
}

/// Protocol-to-hardware address cache. Entries are kept oldest first and a
/// full cache evicts the oldest one.
pub(crate) struct ArpCache {
    entries: Vec<ArpEntry>,
}

impl ArpCache {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    fn entry_mut(&mut self, pa: Ipv4Addr) -> Option<&mut ArpEntry> {
        self.entries.iter_mut().find(|e| e.pa == pa)
    }

    pub(crate) fn add(&mut self, ha: EthAddr, pa: Ipv4Addr) {
        if self.entries.len() == ARP_CACHE_SIZE {
            self.entries.remove(0);
        }
        self.entries.push(ArpEntry {
            ha,
            pa,
            pending: None,
        });
    }

    /// The resolved hardware address for `pa`. Entries still waiting for a
    /// reply hold the null address and do not count.
    fn lookup(&self, pa: Ipv4Addr) -> Option<EthAddr> {
        self.entries
            .iter()
            .find(|e| e.pa == pa && e.ha != EthAddr::NULL)
            .map(|e| e.ha)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn dump(packet: &[u8]) {
    if packet.len() < ARP_LEN {
        return;
    }
    let op = u16::from_be_bytes([packet[6], packet[7]]);
    log::trace!(
        "   ARP: op={op} [sha={} spa={}] [tha={} tpa={}]",
        EthAddr::from_slice(&packet[8..]).unwrap_or_default(),
        ipv4_from(&packet[14..]).unwrap_or(Ipv4Addr::UNSPECIFIED),
        EthAddr::from_slice(&packet[18..]).unwrap_or_default(),
        ipv4_from(&packet[24..]).unwrap_or(Ipv4Addr::UNSPECIFIED),
    );
}

impl NetStack {
    /// The cached hardware address for `pa`.
    #[must_use]
    pub fn arp_lookup(&self, pa: Ipv4Addr) -> Option<EthAddr> {
        self.arp.lookup(pa)
    }

    fn arp_send(&mut self, intf: IntfId, op: u16, tha: EthAddr, tpa: Ipv4Addr) {
        let (sha, spa) = {
            let i = self.intf(intf);
            (i.eth_addr, i.ip_addr)
        };

        let Ok(mut buf) = NetBuf::alloc() else {
            log::warn!("arp: no buffer for {tpa}");
            return;
        };
        let Ok(p) = buf.append_zeroed(ARP_LEN) else {
            return;
        };
        p[0..2].copy_from_slice(&ARP_HTYPE_ETH.to_be_bytes());
        p[2..4].copy_from_slice(&ET_IPV4.to_be_bytes());
        p[4] = 6;
        p[5] = 4;
        p[6..8].copy_from_slice(&op.to_be_bytes());
        p[8..14].copy_from_slice(&sha.octets());
        p[14..18].copy_from_slice(&spa.octets());
        let target_ha = if op == ARP_OP_REQUEST { EthAddr::NULL } else { tha };
        p[18..24].copy_from_slice(&target_ha.octets());
        p[24..28].copy_from_slice(&tpa.octets());

        dump(buf.payload());
        self.intf_send(intf, LinkDst::Eth(tha), ET_ARP, buf);
    }

    /// Ask who has `tpa`, keeping `buf` to send once the reply arrives.
    /// A packet already waiting for the same address is dropped.
    pub(crate) fn arp_request(&mut self, intf: IntfId, tpa: Ipv4Addr, ethertype: u16, buf: NetBuf) {
        if self.arp.entry_mut(tpa).is_none() {
            self.arp.add(EthAddr::NULL, tpa);
        }
        let Some(entry) = self.arp.entry_mut(tpa) else {
            return;
        };
        if entry.pending.is_some() {
            log::trace!("arp: replacing packet pending for {tpa}");
        }
        entry.pending = Some(Pending {
            intf,
            ethertype,
            buf,
        });
        self.arp_send(intf, ARP_OP_REQUEST, EthAddr::BROADCAST, tpa);
    }

    pub(crate) fn arp_recv(&mut self, intf: IntfId, buf: NetBuf) {
        let p = buf.payload();
        dump(p);
        if p.len() < ARP_LEN {
            return;
        }

        let htype = u16::from_be_bytes([p[0], p[1]]);
        let ptype = u16::from_be_bytes([p[2], p[3]]);
        let op = u16::from_be_bytes([p[6], p[7]]);
        if htype != ARP_HTYPE_ETH || ptype != ET_IPV4 {
            return;
        }
        let (Some(sha), Some(spa), Some(tpa)) = (
            EthAddr::from_slice(&p[8..14]),
            ipv4_from(&p[14..18]),
            ipv4_from(&p[24..28]),
        ) else {
            return;
        };

        let mut merged = false;
        let mut resend = None;
        if let Some(entry) = self.arp.entry_mut(spa) {
            entry.ha = sha;
            merged = true;
            resend = entry.pending.take();
        }
        if let Some(pending) = resend {
            log::debug!("arp: {spa} is at {sha}, resending packet");
            self.eth_intf_send(pending.intf, LinkDst::Ip(spa), pending.ethertype, pending.buf);
        }

        if tpa == self.intf(intf).ip_addr {
            if !merged {
                self.arp.add(sha, spa);
            }
            if op == ARP_OP_REQUEST {
                self.arp_send(intf, ARP_OP_REPLY, sha, spa);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PEER_MAC, arp_frame, stack_with_wire};

    #[test]
    fn full_cache_evicts_oldest() {
        let mut cache = ArpCache::new();
        for i in 0..=ARP_CACHE_SIZE {
            let i = u8::try_from(i).unwrap();
            cache.add(EthAddr([2, 0, 0, 0, 0, i]), Ipv4Addr::new(10, 0, 0, i));
        }
        assert_eq!(cache.len(), ARP_CACHE_SIZE);
        assert_eq!(cache.lookup(Ipv4Addr::new(10, 0, 0, 0)), None);
        assert_eq!(
            cache.lookup(Ipv4Addr::new(10, 0, 0, 16)),
            Some(EthAddr([2, 0, 0, 0, 0, 16]))
        );
    }

    #[test]
    fn unresolved_entry_is_not_a_hit() {
        let mut cache = ArpCache::new();
        cache.add(EthAddr::NULL, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(cache.lookup(Ipv4Addr::new(10, 0, 0, 2)), None);
    }

    #[test]
    fn answers_requests_for_own_address() {
        let (mut stack, wire) = stack_with_wire([10, 0, 0, 1]);
        let peer = Ipv4Addr::new(10, 0, 0, 2);
        wire.inject(arp_frame(ARP_OP_REQUEST, PEER_MAC, peer, EthAddr::NULL, Ipv4Addr::new(10, 0, 0, 1)));
        stack.poll();

        assert_eq!(stack.arp_lookup(peer), Some(PEER_MAC));
        let sent = wire.sent();
        assert_eq!(sent.len(), 1);
        let reply = &sent[0];
        assert_eq!(&reply[0..6], &PEER_MAC.octets());
        assert_eq!(u16::from_be_bytes([reply[20], reply[21]]), ARP_OP_REPLY);
        assert_eq!(&reply[38..42], &peer.octets());
    }

    #[test]
    fn requests_for_other_hosts_are_ignored() {
        let (mut stack, wire) = stack_with_wire([10, 0, 0, 1]);
        wire.inject(arp_frame(
            ARP_OP_REQUEST,
            PEER_MAC,
            Ipv4Addr::new(10, 0, 0, 2),
            EthAddr::NULL,
            Ipv4Addr::new(10, 0, 0, 9),
        ));
        stack.poll();
        assert!(wire.sent().is_empty());
        assert_eq!(stack.arp_lookup(Ipv4Addr::new(10, 0, 0, 2)), None);
    }
}

use crate::addr::Ipv4Addr;
use crate::buf::NetBuf;
use crate::checksum::checksum;
use crate::intf::IntfId;
use crate::ipv4::{IP_PROTOCOL_ICMP, Ipv4Header};
use crate::{NetError, NetStack};

pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;
pub const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;

const ICMP_HEADER_LEN: usize = 8;

fn dump(packet: &[u8]) {
    if packet.len() < ICMP_HEADER_LEN {
        return;
    }
    log::trace!(
        "   ICMP: type={} code={} id={} sequence={} len={}{}",
        packet[0],
        packet[1],
        u16::from_be_bytes([packet[4], packet[5]]),
        u16::from_be_bytes([packet[6], packet[7]]),
        packet.len(),
        if checksum(packet) == 0 { "" } else { " checksum!" }
    );
}

impl NetStack {
    pub(crate) fn icmp_recv(&mut self, _intf: IntfId, ip: &Ipv4Header, buf: NetBuf) {
        let p = buf.payload();
        dump(p);
        if p.len() < ICMP_HEADER_LEN || checksum(p) != 0 {
            return;
        }

        let id = u16::from_be_bytes([p[4], p[5]]);
        let seq = u16::from_be_bytes([p[6], p[7]]);
        match p[0] {
            ICMP_TYPE_ECHO_REQUEST => {
                log::info!("ICMP: Echo request from {}", ip.src);
                if let Err(e) = self.icmp_echo(ICMP_TYPE_ECHO_REPLY, ip.src, id, seq, &p[ICMP_HEADER_LEN..]) {
                    log::debug!("icmp: echo reply to {} not sent: {e}", ip.src);
                }
            }
            ICMP_TYPE_ECHO_REPLY => log::info!("ICMP: Echo reply from {}", ip.src),
            other => log::trace!("icmp: type {other} ignored"),
        }
    }

    /// Send an echo request (ping).
    ///
    /// # Errors
    /// [`NetError::NoRoute`] or [`NetError::BufferFull`].
    pub fn icmp_echo_request(&mut self, dst: Ipv4Addr, id: u16, seq: u16, data: &[u8]) -> Result<(), NetError> {
        self.icmp_echo(ICMP_TYPE_ECHO_REQUEST, dst, id, seq, data)
    }

    fn icmp_echo(&mut self, kind: u8, dst: Ipv4Addr, id: u16, seq: u16, data: &[u8]) -> Result<(), NetError> {
        let mut buf = NetBuf::alloc()?;
        let h = buf.append_zeroed(ICMP_HEADER_LEN)?;
        h[0] = kind;
        h[4..6].copy_from_slice(&id.to_be_bytes());
        h[6..8].copy_from_slice(&seq.to_be_bytes());
        buf.append(data)?;

        let sum = checksum(buf.payload());
        buf.payload_mut()[2..4].copy_from_slice(&sum.to_be_bytes());

        dump(buf.payload());
        self.ipv4_send(dst, IP_PROTOCOL_ICMP, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PEER_MAC, icmp_echo, ipv4_frame, stack_with_wire};

    #[test]
    fn echo_request_is_answered() {
        let (mut stack, wire) = stack_with_wire([10, 0, 0, 1]);
        stack.seed_arp(Ipv4Addr::new(10, 0, 0, 2), PEER_MAC);
        let ping = icmp_echo(ICMP_TYPE_ECHO_REQUEST, 7, 3, b"abc");
        wire.inject(ipv4_frame([10, 0, 0, 2], [10, 0, 0, 1], IP_PROTOCOL_ICMP, &ping));
        stack.poll();

        let sent = wire.sent();
        assert_eq!(sent.len(), 1);
        let icmp = &sent[0][34..];
        assert_eq!(icmp[0], ICMP_TYPE_ECHO_REPLY);
        assert_eq!(&icmp[4..8], &[0, 7, 0, 3]);
        assert_eq!(&icmp[8..], b"abc");
        assert_eq!(checksum(icmp), 0);
    }

    #[test]
    fn corrupt_request_is_ignored() {
        let (mut stack, wire) = stack_with_wire([10, 0, 0, 1]);
        stack.seed_arp(Ipv4Addr::new(10, 0, 0, 2), PEER_MAC);
        let mut ping = icmp_echo(ICMP_TYPE_ECHO_REQUEST, 7, 3, b"abc");
        ping[9] ^= 1;
        wire.inject(ipv4_frame([10, 0, 0, 2], [10, 0, 0, 1], IP_PROTOCOL_ICMP, &ping));
        stack.poll();
        assert!(wire.sent().is_empty());
    }

    #[test]
    fn echo_request_without_route_fails() {
        let (mut stack, _wire) = stack_with_wire([10, 0, 0, 1]);
        assert_eq!(
            stack.icmp_echo_request(Ipv4Addr::new(8, 8, 8, 8), 1, 1, b""),
            Err(NetError::NoRoute(Ipv4Addr::new(8, 8, 8, 8)))
        );
    }
}

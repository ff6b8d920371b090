//! UDP.
//!
//! Incoming datagrams are handed to a client by their *source* port (53,
//! 67 or 123): the stack only talks to well-known services and keeps no
//! socket table. Anything else is dropped.

use crate::addr::Ipv4Addr;
use crate::buf::NetBuf;
use crate::intf::IntfId;
use crate::ipv4::{IP_PROTOCOL_UDP, Ipv4Header};
use crate::port::{PORT_BOOTP_SERVER, PORT_DNS, PORT_NTP};
use crate::{NetError, NetStack};

pub const UDP_HEADER_LEN: usize = 8;

fn push_header(buf: &mut NetBuf, dst_port: u16, src_port: u16) -> Result<(), NetError> {
    let len = u16::try_from(buf.len() + UDP_HEADER_LEN).map_err(|_| NetError::BufferFull)?;
    let h = buf.push_header(UDP_HEADER_LEN)?;
    h[0..2].copy_from_slice(&src_port.to_be_bytes());
    h[2..4].copy_from_slice(&dst_port.to_be_bytes());
    h[4..6].copy_from_slice(&len.to_be_bytes());
    // Checksum 0: not computed.
    dump(buf.payload());
    Ok(())
}

fn dump(datagram: &[u8]) {
    if datagram.len() < UDP_HEADER_LEN {
        return;
    }
    let word = |i: usize| u16::from_be_bytes([datagram[i], datagram[i + 1]]);
    log::trace!(
        "   UDP: src={} dst={} len={} checksum={}",
        word(0),
        word(2),
        word(4),
        word(6)
    );
}

impl NetStack {
    pub(crate) fn udp_recv(&mut self, intf: IntfId, _ip: &Ipv4Header, mut buf: NetBuf) {
        let p = buf.payload();
        dump(p);
        if p.len() < UDP_HEADER_LEN {
            return;
        }
        let src_port = u16::from_be_bytes([p[0], p[1]]);
        let len = usize::from(u16::from_be_bytes([p[4], p[5]]));
        if len >= UDP_HEADER_LEN {
            buf.truncate(len);
        }
        buf.pull(UDP_HEADER_LEN);

        match src_port {
            PORT_DNS => self.dns_recv(intf, &buf),
            PORT_BOOTP_SERVER => self.dhcp_recv(intf, &buf),
            PORT_NTP => self.ntp_recv(intf, &buf),
            other => log::trace!("udp: no client for source port {other}"),
        }
    }

    /// Send a datagram along the routing table.
    ///
    /// # Errors
    /// [`NetError::NoRoute`] or [`NetError::BufferFull`].
    pub fn udp_send(&mut self, dst: Ipv4Addr, dst_port: u16, src_port: u16, mut buf: NetBuf) -> Result<(), NetError> {
        push_header(&mut buf, dst_port, src_port)?;
        self.ipv4_send(dst, IP_PROTOCOL_UDP, buf)
    }

    /// Send a datagram straight out of `intf`, bypassing the routing table
    /// (used before the interface has an address).
    ///
    /// # Errors
    /// [`NetError::BufferFull`].
    pub fn udp_intf_send(
        &mut self,
        intf: IntfId,
        dst: Ipv4Addr,
        dst_port: u16,
        src_port: u16,
        mut buf: NetBuf,
    ) -> Result<(), NetError> {
        push_header(&mut buf, dst_port, src_port)?;
        self.ipv4_intf_send(intf, dst, dst, IP_PROTOCOL_UDP, buf)
    }
}

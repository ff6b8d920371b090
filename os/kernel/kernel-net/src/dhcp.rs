//! DHCP client (RFC 2131).
//!
//! ```text
//!  Idle ──discover──► Selecting ──OFFER/request──► Requesting ──ACK──► Bound
//!                          ▲                             │
//!                          └──────────── NAK ────────────┘
//! ```
//!
//! The ACK configures the interface address and broadcast address, installs
//! a default route (via the first router), a subnet route and a host route,
//! and adopts the first DNS server.

use crate::addr::{EthAddr, Ipv4Addr, directed_broadcast, ipv4_from, network};
use crate::buf::NetBuf;
use crate::intf::IntfId;
use crate::port::{PORT_BOOTP_CLIENT, PORT_BOOTP_SERVER};
use crate::route::Route;
use crate::{NetError, NetStack};

const OP_REQUEST: u8 = 1;
const OP_REPLY: u8 = 2;
const HTYPE_ETH: u8 = 1;

pub const MAGIC_COOKIE: u32 = 0x6382_5363;

/// Fixed BOOTP header up to (not including) the magic cookie.
pub const DHCP_HEADER_LEN: usize = 236;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_REQUESTED_IP_ADDR: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_DHCP_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAMETER_REQUEST: u8 = 55;
const OPT_END: u8 = 255;

pub const DHCP_DISCOVER: u8 = 1;
pub const DHCP_OFFER: u8 = 2;
pub const DHCP_REQUEST: u8 = 3;
pub const DHCP_ACK: u8 = 5;
pub const DHCP_NAK: u8 = 6;

const PARAMETERS: [u8; 3] = [OPT_SUBNET_MASK, OPT_ROUTER, OPT_DNS];

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum DhcpState {
    #[default]
    Idle,
    Selecting,
    Requesting,
    Bound,
}

/// Per-interface client state.
#[derive(Debug)]
pub(crate) struct DhcpClient {
    pub(crate) state: DhcpState,
    pub(crate) xid: u32,
}

impl DhcpClient {
    /// The transaction id is taken from the low four bytes of the hardware
    /// address so every interface uses its own.
    pub(crate) fn new(eth_addr: EthAddr) -> Self {
        let [_, _, a, b, c, d] = eth_addr.octets();
        Self {
            state: DhcpState::Idle,
            xid: u32::from_be_bytes([a, b, c, d]),
        }
    }
}

/// Options of a received message. Address lists are raw option bytes.
#[derive(Debug, Default)]
struct DhcpOptions<'a> {
    message_type: u8,
    subnet_mask: Option<Ipv4Addr>,
    routers: &'a [u8],
    dns: &'a [u8],
    requested_ip_addr: Option<Ipv4Addr>,
    lease_time: Option<u32>,
    server_id: Option<Ipv4Addr>,
    parameters: &'a [u8],
}

/// Parse the options that follow the fixed header. `None` if the cookie is
/// missing or an option runs past the end.
fn parse_options(message: &[u8]) -> Option<DhcpOptions<'_>> {
    let cookie = message.get(DHCP_HEADER_LEN..DHCP_HEADER_LEN + 4)?;
    if u32::from_be_bytes(cookie.try_into().ok()?) != MAGIC_COOKIE {
        return None;
    }

    let mut opt = DhcpOptions::default();
    let mut rest = &message[DHCP_HEADER_LEN + 4..];
    while let Some((&kind, tail)) = rest.split_first() {
        match kind {
            OPT_PAD => {
                rest = tail;
                continue;
            }
            OPT_END => break,
            _ => {}
        }

        let (&len, tail) = tail.split_first()?;
        let body = tail.get(..usize::from(len))?;
        rest = &tail[usize::from(len)..];

        match kind {
            OPT_SUBNET_MASK => opt.subnet_mask = ipv4_from(body),
            OPT_ROUTER => opt.routers = body,
            OPT_DNS => opt.dns = body,
            OPT_REQUESTED_IP_ADDR => opt.requested_ip_addr = ipv4_from(body),
            OPT_LEASE_TIME => {
                opt.lease_time = body.get(..4).and_then(|b| b.try_into().ok()).map(u32::from_be_bytes);
            }
            OPT_DHCP_MESSAGE_TYPE => opt.message_type = body.first().copied().unwrap_or(0),
            OPT_SERVER_ID => opt.server_id = ipv4_from(body),
            OPT_PARAMETER_REQUEST => opt.parameters = body,
            other => log::debug!("[DHCP] unknown option ({other})"),
        }
    }
    Some(opt)
}

/// Start a client message: fixed header, cookie and the message type
/// option.
fn build_header(buf: &mut NetBuf, xid: u32, chaddr: EthAddr, message_type: u8) -> Result<(), NetError> {
    let h = buf.append_zeroed(DHCP_HEADER_LEN)?;
    h[0] = OP_REQUEST;
    h[1] = HTYPE_ETH;
    h[2] = 6;
    h[4..8].copy_from_slice(&xid.to_be_bytes());
    h[28..34].copy_from_slice(&chaddr.octets());
    buf.append(&MAGIC_COOKIE.to_be_bytes())?;
    buf.append(&[OPT_DHCP_MESSAGE_TYPE, 1, message_type])
}

fn dump(message: &[u8]) {
    if message.len() < DHCP_HEADER_LEN {
        return;
    }
    log::trace!(
        "   DHCP: opcode={} xid={:#x} your={} server={} eth={}",
        message[0],
        u32::from_be_bytes([message[4], message[5], message[6], message[7]]),
        ipv4_from(&message[16..20]).unwrap_or(Ipv4Addr::UNSPECIFIED),
        ipv4_from(&message[20..24]).unwrap_or(Ipv4Addr::UNSPECIFIED),
        EthAddr::from_slice(&message[28..34]).unwrap_or_default(),
    );
    if let Some(opt) = parse_options(message) {
        log::trace!(
            "   DHCP: type={} mask={:?} routers={} dns={} requested={:?} server={:?} lease={:?} params={:?}",
            opt.message_type,
            opt.subnet_mask,
            opt.routers.len() / 4,
            opt.dns.len() / 4,
            opt.requested_ip_addr,
            opt.server_id,
            opt.lease_time,
            opt.parameters
        );
    }
}

impl NetStack {
    #[must_use]
    pub fn dhcp_state(&self, intf: IntfId) -> DhcpState {
        self.intf(intf).dhcp.state
    }

    /// Broadcast a DHCPDISCOVER on `intf`.
    ///
    /// # Errors
    /// [`NetError::BufferFull`] if the message cannot be built.
    pub fn dhcp_discover(&mut self, intf: IntfId) -> Result<(), NetError> {
        let (eth_addr, xid) = {
            let i = self.intf(intf);
            log::info!("DHCP discovery for {}", i.name);
            (i.eth_addr, i.dhcp.xid)
        };

        let mut buf = NetBuf::alloc()?;
        build_header(&mut buf, xid, eth_addr, DHCP_DISCOVER)?;
        buf.append(&[OPT_PARAMETER_REQUEST, 3])?;
        buf.append(&PARAMETERS)?;
        buf.append(&[OPT_END])?;

        dump(buf.payload());
        self.intf_mut(intf).dhcp.state = DhcpState::Selecting;
        self.udp_intf_send(intf, Ipv4Addr::BROADCAST, PORT_BOOTP_SERVER, PORT_BOOTP_CLIENT, buf)
    }

    fn dhcp_request(&mut self, intf: IntfId, requested: Ipv4Addr, server_id: Ipv4Addr) -> Result<(), NetError> {
        log::info!("DHCP requested lease for {requested}");
        let (eth_addr, xid) = {
            let i = self.intf(intf);
            (i.eth_addr, i.dhcp.xid)
        };

        let mut buf = NetBuf::alloc()?;
        build_header(&mut buf, xid, eth_addr, DHCP_REQUEST)?;
        buf.append(&[OPT_SERVER_ID, 4])?;
        buf.append(&server_id.octets())?;
        buf.append(&[OPT_REQUESTED_IP_ADDR, 4])?;
        buf.append(&requested.octets())?;
        buf.append(&[OPT_PARAMETER_REQUEST, 3])?;
        buf.append(&PARAMETERS)?;
        buf.append(&[OPT_END])?;

        dump(buf.payload());
        self.intf_mut(intf).dhcp.state = DhcpState::Requesting;
        self.udp_intf_send(intf, Ipv4Addr::BROADCAST, PORT_BOOTP_SERVER, PORT_BOOTP_CLIENT, buf)
    }

    fn dhcp_ack(&mut self, intf: IntfId, your_ip: Ipv4Addr, opt: &DhcpOptions<'_>) {
        self.intf_mut(intf).ip_addr = your_ip;
        self.intf_mut(intf).dhcp.state = DhcpState::Bound;

        if let Some(router) = ipv4_from(opt.routers) {
            self.routes.add(Route {
                dst: Ipv4Addr::UNSPECIFIED,
                mask: Ipv4Addr::UNSPECIFIED,
                gateway: router,
                intf,
            });
        }

        if let Some(mask) = opt.subnet_mask {
            self.routes.add(Route {
                dst: network(your_ip, mask),
                mask,
                gateway: Ipv4Addr::UNSPECIFIED,
                intf,
            });
        }

        self.routes.add(Route {
            dst: your_ip,
            mask: Ipv4Addr::BROADCAST,
            gateway: Ipv4Addr::UNSPECIFIED,
            intf,
        });

        if let Some(mask) = opt.subnet_mask {
            self.intf_mut(intf).broadcast_addr = directed_broadcast(your_ip, mask);
        }

        if let Some(server) = ipv4_from(opt.dns) {
            self.dns.server = server;
        }

        log::info!("routing table:\n{}", self.route_dump());
    }

    pub(crate) fn dhcp_recv(&mut self, intf: IntfId, buf: &NetBuf) {
        let m = buf.payload();
        dump(m);
        if m.len() < DHCP_HEADER_LEN {
            return;
        }
        if m[0] != OP_REPLY || m[1] != HTYPE_ETH || m[2] != 6 {
            return;
        }

        let (eth_addr, xid, state) = {
            let i = self.intf(intf);
            (i.eth_addr, i.dhcp.xid, i.dhcp.state)
        };
        if m[28..34] != eth_addr.octets() || m[4..8] != xid.to_be_bytes() {
            return;
        }
        let Some(opt) = parse_options(m) else {
            return;
        };
        let Some(your_ip) = ipv4_from(&m[16..20]) else {
            return;
        };

        match opt.message_type {
            DHCP_OFFER => {
                log::info!("DHCP offer received for {your_ip}");
                let Some(server_id) = opt.server_id else {
                    log::debug!("dhcp: offer without server id ignored");
                    return;
                };
                if state != DhcpState::Selecting {
                    log::debug!("dhcp: offer ignored in state {state:?}");
                    return;
                }
                if let Err(e) = self.dhcp_request(intf, your_ip, server_id) {
                    log::warn!("dhcp: request not sent: {e}");
                }
            }
            DHCP_ACK => {
                log::info!("DHCP ack received for {your_ip}");
                if state == DhcpState::Requesting {
                    self.dhcp_ack(intf, your_ip, &opt);
                } else {
                    log::debug!("dhcp: ack ignored in state {state:?}");
                }
            }
            DHCP_NAK => {
                log::info!("DHCP nak received for {your_ip}");
                if state == DhcpState::Requesting
                    && let Err(e) = self.dhcp_discover(intf)
                {
                    log::warn!("dhcp: rediscovery failed: {e}");
                }
            }
            _ => log::debug!("DHCP message unhandled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dhcp_reply, stack_with_wire, udp_payload};

    const OFFERED: [u8; 4] = [192, 168, 1, 50];
    const MASK: [u8; 4] = [255, 255, 255, 0];
    const GATEWAY: [u8; 4] = [192, 168, 1, 1];
    const DNS: [u8; 4] = [192, 168, 1, 53];

    fn sent_message_type(frame: &[u8]) -> (u32, Option<u8>) {
        let dhcp = udp_payload(frame);
        let xid = u32::from_be_bytes(dhcp[4..8].try_into().unwrap());
        (xid, parse_options(dhcp).map(|o| o.message_type))
    }

    #[test]
    fn discover_offer_request_ack() {
        let (mut stack, wire) = stack_with_wire([0; 4]);
        stack.init();
        let eth = IntfId(0);
        assert_eq!(stack.dhcp_state(eth), DhcpState::Selecting);

        let sent = wire.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][0..6], &EthAddr::BROADCAST.octets());
        let (xid, kind) = sent_message_type(&sent[0]);
        assert_eq!(kind, Some(DHCP_DISCOVER));

        wire.inject(dhcp_reply(xid, DHCP_OFFER, OFFERED, MASK, GATEWAY, DNS));
        stack.poll();
        assert_eq!(stack.dhcp_state(eth), DhcpState::Requesting);
        let sent = wire.take_sent();
        assert_eq!(sent.len(), 1);
        let (_, kind) = sent_message_type(&sent[0]);
        assert_eq!(kind, Some(DHCP_REQUEST));
        let opt = parse_options(udp_payload(&sent[0])).map(|o| (o.requested_ip_addr, o.server_id));
        assert_eq!(opt, Some((Some(OFFERED.into()), Some(GATEWAY.into()))));

        wire.inject(dhcp_reply(xid, DHCP_ACK, OFFERED, MASK, GATEWAY, DNS));
        stack.poll();
        assert_eq!(stack.dhcp_state(eth), DhcpState::Bound);

        let intf = stack.interface(eth).unwrap();
        assert_eq!(intf.ip_addr, Ipv4Addr::from(OFFERED));
        assert_eq!(intf.broadcast_addr, Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(stack.dns_server(), Ipv4Addr::from(DNS));

        let routes: alloc::vec::Vec<_> = stack.routes().iter().filter(|r| r.intf == eth).collect();
        assert_eq!(routes.len(), 3);
        let default = stack.routes().find(Ipv4Addr::new(8, 8, 8, 8)).unwrap();
        assert_eq!(default.gateway, Ipv4Addr::from(GATEWAY));
        let subnet = stack.routes().find(Ipv4Addr::new(192, 168, 1, 7)).unwrap();
        assert_eq!((subnet.dst, subnet.gateway), (Ipv4Addr::new(192, 168, 1, 0), Ipv4Addr::UNSPECIFIED));
        let host = stack.routes().find(Ipv4Addr::from(OFFERED)).unwrap();
        assert_eq!(host.mask, Ipv4Addr::BROADCAST);
    }

    #[test]
    fn replies_for_other_clients_are_ignored() {
        let (mut stack, wire) = stack_with_wire([0; 4]);
        stack.init();
        let (xid, _) = sent_message_type(&wire.take_sent()[0]);

        let mut foreign = dhcp_reply(xid, DHCP_OFFER, OFFERED, MASK, GATEWAY, DNS);
        foreign[14 + 20 + 8 + 28] ^= 0x01;
        wire.inject(foreign);
        wire.inject(dhcp_reply(xid ^ 1, DHCP_OFFER, OFFERED, MASK, GATEWAY, DNS));
        stack.poll();

        assert!(wire.sent().is_empty());
        assert_eq!(stack.dhcp_state(IntfId(0)), DhcpState::Selecting);
    }

    #[test]
    fn unsolicited_ack_is_ignored() {
        let (mut stack, wire) = stack_with_wire([0; 4]);
        stack.init();
        let (xid, _) = sent_message_type(&wire.take_sent()[0]);
        wire.inject(dhcp_reply(xid, DHCP_ACK, OFFERED, MASK, GATEWAY, DNS));
        stack.poll();
        assert!(stack.interface(IntfId(0)).unwrap().ip_addr.is_unspecified());
        assert_eq!(stack.dhcp_state(IntfId(0)), DhcpState::Selecting);
    }

    #[test]
    fn options_must_fit() {
        let mut message = alloc::vec![0u8; DHCP_HEADER_LEN];
        message.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        message.extend_from_slice(&[OPT_DHCP_MESSAGE_TYPE, 1, DHCP_OFFER, OPT_ROUTER, 8, 1, 2]);
        assert!(parse_options(&message).is_none());

        message.truncate(DHCP_HEADER_LEN + 4);
        message.extend_from_slice(&[OPT_PAD, OPT_DHCP_MESSAGE_TYPE, 1, DHCP_ACK, OPT_END, 99]);
        assert_eq!(parse_options(&message).map(|o| o.message_type), Some(DHCP_ACK));
    }
}

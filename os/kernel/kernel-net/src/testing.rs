//! Test rig: a fake clock, a wire device that records what the stack
//! transmits, and frame builders.

use crate::addr::{EthAddr, Ipv4Addr};
use crate::buf::NetBuf;
use crate::checksum::{checksum, checksum_final, checksum_update};
use crate::eth::{ET_ARP, ET_IPV4};
use crate::intf::{IntfId, NetDevice};
use crate::route::Route;
use crate::tcp::{ConnId, TcpError, TcpHandler, TcpState};
use crate::{Clock, NetStack};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

pub const OUR_MAC: EthAddr = EthAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
pub const PEER_MAC: EthAddr = EthAddr([0x52, 0x54, 0x00, 0xAB, 0xCD, 0xEF]);

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const ACK: u8 = 0x10;

struct FakeClock {
    ticks: Arc<AtomicU32>,
    unix: AtomicU64,
}

impl Clock for FakeClock {
    fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn unix_time(&self) -> u64 {
        self.unix.load(Ordering::Relaxed)
    }

    fn set_unix_time(&mut self, secs: u64) {
        self.unix.store(secs, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct Queues {
    rx: VecDeque<Vec<u8>>,
    tx: Vec<Vec<u8>>,
}

struct WireDevice(Arc<Mutex<Queues>>);

impl NetDevice for WireDevice {
    fn receive(&mut self) -> Option<NetBuf> {
        let frame = self.0.lock().unwrap().rx.pop_front()?;
        Some(NetBuf::from_frame(&frame).unwrap())
    }

    fn transmit(&mut self, frame: NetBuf) {
        self.0.lock().unwrap().tx.push(frame.payload().to_vec());
    }
}

/// The far end of the `eth0` device, plus the clock that drives the stack.
pub struct Wire {
    queues: Arc<Mutex<Queues>>,
    ticks: Arc<AtomicU32>,
}

impl Wire {
    /// Queue a frame for the next [`NetStack::poll`].
    pub fn inject(&self, frame: Vec<u8>) {
        self.queues.lock().unwrap().rx.push_back(frame);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.queues.lock().unwrap().tx.clone()
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        core::mem::take(&mut self.queues.lock().unwrap().tx)
    }

    /// Advance the clock by `ms` ticks.
    pub fn tick(&self, ms: u32) {
        self.ticks.fetch_add(ms, Ordering::Relaxed);
    }
}

/// A stack with one Ethernet interface, `eth0`, at `ip`. A non-zero `ip`
/// gets an on-link /24 route. The stack is not initialized.
pub fn stack_with_wire(ip: [u8; 4]) -> (NetStack, Wire) {
    let ticks = Arc::new(AtomicU32::new(0));
    let clock = FakeClock {
        ticks: Arc::clone(&ticks),
        unix: AtomicU64::new(1_600_000_000),
    };
    let queues = Arc::new(Mutex::new(Queues::default()));

    let mut stack = NetStack::new(Box::new(clock));
    let ip = Ipv4Addr::from(ip);
    let id = stack.add_interface("eth0", OUR_MAC, ip, Box::new(WireDevice(Arc::clone(&queues))));
    if !ip.is_unspecified() {
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        stack.add_route(Route {
            dst: crate::addr::network(ip, mask),
            mask,
            gateway: Ipv4Addr::UNSPECIFIED,
            intf: id,
        });
    }
    (stack, Wire { queues, ticks })
}

impl NetStack {
    pub(crate) fn seed_arp(&mut self, ip: Ipv4Addr, mac: EthAddr) {
        self.arp.add(mac, ip);
    }
}

fn eth_frame(dst: EthAddr, src: EthAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&dst.octets());
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn arp_frame(op: u16, sha: EthAddr, spa: Ipv4Addr, tha: EthAddr, tpa: Ipv4Addr) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&[0, 1, 0x08, 0x00, 6, 4]);
    p.extend_from_slice(&op.to_be_bytes());
    p.extend_from_slice(&sha.octets());
    p.extend_from_slice(&spa.octets());
    p.extend_from_slice(&tha.octets());
    p.extend_from_slice(&tpa.octets());
    let dst = if op == 1 { EthAddr::BROADCAST } else { OUR_MAC };
    eth_frame(dst, sha, ET_ARP, &p)
}

/// A checksummed IPv4 packet.
pub fn ipv4_packet(src: [u8; 4], dst: [u8; 4], protocol: u8, payload: &[u8]) -> Vec<u8> {
    let total = u16::try_from(20 + payload.len()).unwrap();
    let mut p = alloc::vec![0u8; 20];
    p[0] = 0x45;
    p[2..4].copy_from_slice(&total.to_be_bytes());
    p[8] = 64;
    p[9] = protocol;
    p[12..16].copy_from_slice(&src);
    p[16..20].copy_from_slice(&dst);
    let sum = checksum(&p);
    p[10..12].copy_from_slice(&sum.to_be_bytes());
    p.extend_from_slice(payload);
    p
}

/// An IPv4 packet from the peer, framed for `eth0`.
pub fn ipv4_frame(src: [u8; 4], dst: [u8; 4], protocol: u8, payload: &[u8]) -> Vec<u8> {
    eth_frame(OUR_MAC, PEER_MAC, ET_IPV4, &ipv4_packet(src, dst, protocol, payload))
}

pub fn icmp_echo(kind: u8, id: u16, seq: u16, data: &[u8]) -> Vec<u8> {
    let mut p = alloc::vec![kind, 0, 0, 0];
    p.extend_from_slice(&id.to_be_bytes());
    p.extend_from_slice(&seq.to_be_bytes());
    p.extend_from_slice(data);
    let sum = checksum(&p);
    p[2..4].copy_from_slice(&sum.to_be_bytes());
    p
}

pub fn udp_frame(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut d = Vec::new();
    d.extend_from_slice(&src_port.to_be_bytes());
    d.extend_from_slice(&dst_port.to_be_bytes());
    d.extend_from_slice(&u16::try_from(8 + payload.len()).unwrap().to_be_bytes());
    d.extend_from_slice(&[0, 0]);
    d.extend_from_slice(payload);
    ipv4_frame(src, dst, 17, &d)
}

/// The UDP payload of a transmitted frame.
pub fn udp_payload(frame: &[u8]) -> &[u8] {
    let udp = &frame[14 + usize::from(frame[14] & 0x0F) * 4..];
    let len = usize::from(u16::from_be_bytes([udp[4], udp[5]]));
    &udp[8..len]
}

/// A DHCP reply from the server at `router`, which also serves as the
/// server identifier.
pub fn dhcp_reply(xid: u32, kind: u8, yiaddr: [u8; 4], mask: [u8; 4], router: [u8; 4], dns: [u8; 4]) -> Vec<u8> {
    let mut m = alloc::vec![0u8; 236];
    m[0] = 2;
    m[1] = 1;
    m[2] = 6;
    m[4..8].copy_from_slice(&xid.to_be_bytes());
    m[16..20].copy_from_slice(&yiaddr);
    m[20..24].copy_from_slice(&router);
    m[28..34].copy_from_slice(&OUR_MAC.octets());
    m.extend_from_slice(&0x6382_5363u32.to_be_bytes());
    m.extend_from_slice(&[53, 1, kind]);
    m.extend_from_slice(&[54, 4]);
    m.extend_from_slice(&router);
    m.extend_from_slice(&[51, 4, 0, 0, 0x0E, 0x10]);
    m.extend_from_slice(&[1, 4]);
    m.extend_from_slice(&mask);
    m.extend_from_slice(&[3, 4]);
    m.extend_from_slice(&router);
    m.extend_from_slice(&[6, 4]);
    m.extend_from_slice(&dns);
    m.push(255);
    udp_frame(router, [255; 4], 67, 68, &m)
}

/// A TCP segment to build with [`tcp_frame`].
#[derive(Clone, Copy)]
pub struct Seg<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub mss: Option<u16>,
    pub data: &'a [u8],
}

fn tcp_sum(src: [u8; 4], dst: [u8; 4], segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src);
    pseudo[4..8].copy_from_slice(&dst);
    pseudo[9] = 6;
    pseudo[10..12].copy_from_slice(&u16::try_from(segment.len()).unwrap().to_be_bytes());
    checksum_final(checksum_update(segment, checksum_update(&pseudo, 0)))
}

pub fn tcp_frame(src: [u8; 4], dst: [u8; 4], seg: &Seg<'_>) -> Vec<u8> {
    let header_len = if seg.mss.is_some() { 24 } else { 20 };
    let mut t = alloc::vec![0u8; header_len];
    t[0..2].copy_from_slice(&seg.src_port.to_be_bytes());
    t[2..4].copy_from_slice(&seg.dst_port.to_be_bytes());
    t[4..8].copy_from_slice(&seg.seq.to_be_bytes());
    t[8..12].copy_from_slice(&seg.ack.to_be_bytes());
    t[12] = u8::try_from(header_len / 4).unwrap() << 4;
    t[13] = seg.flags;
    t[14..16].copy_from_slice(&8192u16.to_be_bytes());
    if let Some(mss) = seg.mss {
        t[20..22].copy_from_slice(&[2, 4]);
        t[22..24].copy_from_slice(&mss.to_be_bytes());
    }
    t.extend_from_slice(seg.data);
    let sum = tcp_sum(src, dst, &t);
    t[16..18].copy_from_slice(&sum.to_be_bytes());
    ipv4_frame(src, dst, 6, &t)
}

/// A transmitted TCP segment.
#[derive(Debug)]
pub struct SentSeg {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub mss: Option<u16>,
    pub data: Vec<u8>,
}

/// Decode a transmitted frame, checking both checksums.
pub fn parse_tcp(frame: &[u8]) -> SentSeg {
    let ip = &frame[14..];
    let ihl = usize::from(ip[0] & 0x0F) * 4;
    assert_eq!(checksum(&ip[..ihl]), 0);
    assert_eq!(ip[9], 6);
    let total = usize::from(u16::from_be_bytes([ip[2], ip[3]]));
    let t = &ip[ihl..total];
    let src: [u8; 4] = ip[12..16].try_into().unwrap();
    let dst: [u8; 4] = ip[16..20].try_into().unwrap();
    assert_eq!(tcp_sum(src, dst, t), 0);

    let header_len = usize::from(t[12] >> 4) * 4;
    let mss = (header_len >= 24 && t[20] == 2).then(|| u16::from_be_bytes([t[22], t[23]]));
    SentSeg {
        src_port: u16::from_be_bytes([t[0], t[1]]),
        dst_port: u16::from_be_bytes([t[2], t[3]]),
        seq: u32::from_be_bytes(t[4..8].try_into().unwrap()),
        ack: u32::from_be_bytes(t[8..12].try_into().unwrap()),
        flags: t[13],
        mss,
        data: t[header_len..].to_vec(),
    }
}

/// Everything a [`Recorder`] saw.
#[derive(Debug, Default)]
pub struct Events {
    pub connects: usize,
    pub errors: Vec<TcpError>,
    pub states: Vec<(TcpState, TcpState)>,
    pub data: Vec<Vec<u8>>,
}

pub struct Recorder(Arc<Mutex<Events>>);

impl Recorder {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Box<dyn TcpHandler>, Arc<Mutex<Events>>) {
        let events = Arc::new(Mutex::new(Events::default()));
        (Box::new(Self(Arc::clone(&events))), events)
    }
}

impl TcpHandler for Recorder {
    fn on_connect(&mut self, _conn: ConnId) {
        self.0.lock().unwrap().connects += 1;
    }

    fn on_error(&mut self, _conn: ConnId, error: TcpError) {
        self.0.lock().unwrap().errors.push(error);
    }

    fn on_state(&mut self, _conn: ConnId, old: TcpState, new: TcpState) {
        self.0.lock().unwrap().states.push((old, new));
    }

    fn on_data(&mut self, _conn: ConnId, data: &[u8]) {
        self.0.lock().unwrap().data.push(data.to_vec());
    }
}

#[test]
fn rig_records_transmissions() {
    let (mut stack, wire) = stack_with_wire([10, 0, 0, 1]);
    assert_eq!(stack.interface(IntfId(0)).map(|i| i.name.as_str()), Some("eth0"));
    stack.seed_arp(Ipv4Addr::new(10, 0, 0, 2), PEER_MAC);
    stack.icmp_echo_request(Ipv4Addr::new(10, 0, 0, 2), 1, 1, b"").unwrap();
    assert_eq!(wire.sent().len(), 1);
    assert_eq!(wire.take_sent().len(), 1);
    assert!(wire.sent().is_empty());
}

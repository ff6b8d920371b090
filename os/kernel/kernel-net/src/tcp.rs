//! TCP (RFC 793), active open only.
//!
//! Segments are sent once and never retransmitted; there is no congestion
//! control. What is implemented is the receive side a client needs: the
//! acceptability test, RST/SYN/ACK/FIN processing per state, MSS exchange,
//! and an out-of-order queue that hands data to the owner strictly in
//! sequence.
//!
//! ```text
//!  Closed ─connect/SYN─► SynSent ─SYN+ACK/ACK─► Established ─close/FIN─► FinWait1
//!                           │                        │                      │ ACK
//!                       SYN/SYN+ACK              FIN/ACK                 FinWait2
//!                           ▼                        ▼                      │ FIN/ACK
//!                      SynReceived               CloseWait ─close/FIN─►     ▼
//!                                                              LastAck   TimeWait ─2 MSL─► Closed
//! ```

use crate::addr::Ipv4Addr;
use crate::buf::NetBuf;
use crate::checksum::{checksum_final, checksum_update};
use crate::intf::IntfId;
use crate::ipv4::{IP_PROTOCOL_TCP, Ipv4Header};
use crate::{NetError, NetStack};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use core::fmt;
use thiserror::Error;

/// Receive window advertised in every segment.
pub const TCP_WINDOW_SIZE: u16 = 8192;

/// Maximum segment lifetime in ticks (milliseconds).
pub const TCP_MSL: u32 = 120_000;

/// MSS announced in our SYN.
pub const TCP_MSS: u16 = 1460;

/// MSS assumed when the peer does not announce one (RFC 879).
pub const TCP_DEFAULT_MSS: u16 = 536;

pub const TCP_HEADER_LEN: usize = 20;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;

const PSEUDO_HEADER_LEN: usize = 12;

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    #[bits(2)]
    __: u8,
}

impl TcpFlags {
    const SYN: Self = Self::new().with_syn(true);
    const RST: Self = Self::new().with_rst(true);
    const ACK: Self = Self::new().with_ack(true);
    const SYN_ACK: Self = Self::SYN.with_ack(true);
    const RST_ACK: Self = Self::RST.with_ack(true);
    const FIN_ACK: Self = Self::ACK.with_fin(true);
}

/// Signed distance from `y` to `x` in sequence space.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub const fn seq_cmp(x: u32, y: u32) -> i32 {
    x.wrapping_sub(y) as i32
}

#[must_use]
pub const fn seq_lt(x: u32, y: u32) -> bool {
    seq_cmp(x, y) < 0
}

#[must_use]
pub const fn seq_le(x: u32, y: u32) -> bool {
    seq_cmp(x, y) <= 0
}

#[must_use]
pub const fn seq_gt(x: u32, y: u32) -> bool {
    seq_cmp(x, y) > 0
}

#[must_use]
pub const fn seq_ge(x: u32, y: u32) -> bool {
    seq_cmp(x, y) >= 0
}

/// Length of a payload in sequence space. Buffers never exceed
/// [`NET_BUF_SIZE`](crate::buf::NET_BUF_SIZE).
#[allow(clippy::cast_possible_truncation)]
const fn seg_len(buf: &NetBuf) -> u32 {
    buf.len() as u32
}

/// Bytes between two sequence numbers.
const fn span(from: u32, to: u32) -> usize {
    to.wrapping_sub(from) as usize
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TcpState {
    #[default]
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum TcpError {
    /// The peer reset an established connection.
    #[error("connection reset")]
    Reset,
    /// The peer refused the connection attempt.
    #[error("connection refused")]
    Refused,
    /// `close` was called on a connection that is already closing.
    #[error("connection closing")]
    Closing,
}

/// Events of one connection. Every method defaults to doing nothing.
///
/// Handlers run inside the stack and cannot call back into it.
pub trait TcpHandler: Send {
    fn on_connect(&mut self, _conn: ConnId) {}

    /// The connection is gone after this, except for
    /// [`TcpError::Closing`].
    fn on_error(&mut self, _conn: ConnId, _error: TcpError) {}

    fn on_state(&mut self, _conn: ConnId, _old: TcpState, _new: TcpState) {}

    /// In-order payload bytes.
    fn on_data(&mut self, _conn: ConnId, _data: &[u8]) {}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnId(u32);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Send sequence space.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SendState {
    pub una: u32,
    pub nxt: u32,
    pub wnd: u16,
    pub urp: u16,
    pub wl1: u32,
    pub wl2: u32,
    pub iss: u32,
}

/// Receive sequence space.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RecvState {
    pub nxt: u32,
    pub wnd: u16,
    pub urp: u16,
    pub irs: u32,
}

#[derive(Copy, Clone, Debug)]
struct Endpoints {
    intf: IntfId,
    local_addr: Ipv4Addr,
    local_port: u16,
    remote_addr: Ipv4Addr,
    remote_port: u16,
    /// First hop towards `remote_addr`.
    next_addr: Ipv4Addr,
}

pub struct TcpConn {
    state: TcpState,
    ends: Endpoints,
    snd: SendState,
    rcv: RecvState,
    /// Received segments not yet delivered, ordered by sequence number and
    /// without overlap.
    resequence: Vec<NetBuf>,
    msl_wait: u32,
    peer_mss: u16,
    handler: Option<Box<dyn TcpHandler>>,
}

impl TcpConn {
    fn new(ends: Endpoints, isn: u32, handler: Option<Box<dyn TcpHandler>>) -> Self {
        Self {
            state: TcpState::Closed,
            ends,
            snd: SendState {
                una: isn,
                nxt: isn,
                wnd: TCP_WINDOW_SIZE,
                iss: isn,
                ..SendState::default()
            },
            rcv: RecvState {
                wnd: TCP_WINDOW_SIZE,
                ..RecvState::default()
            },
            resequence: Vec::new(),
            msl_wait: 0,
            peer_mss: TCP_DEFAULT_MSS,
            handler,
        }
    }

    #[must_use]
    pub const fn state(&self) -> TcpState {
        self.state
    }

    #[must_use]
    pub const fn local(&self) -> (Ipv4Addr, u16) {
        (self.ends.local_addr, self.ends.local_port)
    }

    #[must_use]
    pub const fn remote(&self) -> (Ipv4Addr, u16) {
        (self.ends.remote_addr, self.ends.remote_port)
    }

    #[must_use]
    pub const fn snd(&self) -> &SendState {
        &self.snd
    }

    #[must_use]
    pub const fn rcv(&self) -> &RecvState {
        &self.rcv
    }

    #[must_use]
    pub const fn peer_mss(&self) -> u16 {
        self.peer_mss
    }
}

impl fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConn")
            .field("state", &self.state)
            .field("ends", &self.ends)
            .field("snd", &self.snd)
            .field("rcv", &self.rcv)
            .field("queued", &self.resequence.len())
            .finish_non_exhaustive()
    }
}

pub(crate) struct TcpTable {
    conns: BTreeMap<ConnId, TcpConn>,
    next_id: u32,
    base_isn: u32,
}

impl TcpTable {
    pub(crate) const fn new() -> Self {
        Self {
            conns: BTreeMap::new(),
            next_id: 1,
            base_isn: 0,
        }
    }
}

/// A received header, host byte order.
#[derive(Copy, Clone, Debug)]
struct Segment {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    header_len: usize,
    flags: TcpFlags,
    window: u16,
    mss: Option<u16>,
}

/// Options after the fixed header. `None` if they are malformed.
fn parse_options(mut rest: &[u8]) -> Option<Option<u16>> {
    let mut mss = None;
    while let Some((&kind, tail)) = rest.split_first() {
        match kind {
            OPT_END => break,
            OPT_NOP => {
                rest = tail;
                continue;
            }
            _ => {}
        }
        let len = usize::from(*tail.first()?);
        if len < 2 {
            return None;
        }
        let body = rest.get(2..len)?;
        if let (OPT_MSS, &[hi, lo]) = (kind, body) {
            mss = Some(u16::from_be_bytes([hi, lo]));
        }
        rest = &rest[len..];
    }
    Some(mss)
}

fn parse(segment: &[u8]) -> Option<Segment> {
    if segment.len() < TCP_HEADER_LEN {
        return None;
    }
    let word = |i: usize| u16::from_be_bytes([segment[i], segment[i + 1]]);
    let long = |i: usize| u32::from_be_bytes([segment[i], segment[i + 1], segment[i + 2], segment[i + 3]]);

    let header_len = usize::from(segment[12] >> 4) * 4;
    if header_len < TCP_HEADER_LEN || header_len > segment.len() {
        return None;
    }
    Some(Segment {
        src_port: word(0),
        dst_port: word(2),
        seq: long(4),
        ack: long(8),
        header_len,
        flags: TcpFlags::from_bits(segment[13]),
        window: word(14),
        mss: parse_options(&segment[TCP_HEADER_LEN..header_len])?,
    })
}

/// Sum of the pseudo header (RFC 793, section 3.1).
fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, len: usize) -> u32 {
    let mut pseudo = [0u8; PSEUDO_HEADER_LEN];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = IP_PROTOCOL_TCP;
    pseudo[10..12].copy_from_slice(&u16::try_from(len).unwrap_or(u16::MAX).to_be_bytes());
    checksum_update(&pseudo, 0)
}

fn dump(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) {
    let Some(seg) = parse(segment) else {
        return;
    };
    log::trace!(
        "   TCP: src={src}:{} dst={dst}:{} seq={} ack={}",
        seg.src_port,
        seg.dst_port,
        seg.seq,
        seg.ack
    );
    log::trace!(
        "   TCP: dataLen={} flags={:#x} window={}{}",
        segment.len() - seg.header_len,
        seg.flags.into_bits(),
        seg.window,
        if checksum_final(checksum_update(segment, pseudo_header_sum(src, dst, segment.len()))) == 0 {
            ""
        } else {
            " checksum!"
        }
    );
    if let Some(mss) = seg.mss {
        log::trace!("   TCP: mss={mss}");
    }
}

impl NetStack {
    /// Derive the initial sequence number base from the wall clock.
    pub(crate) fn tcp_init(&mut self) {
        #[allow(clippy::cast_possible_truncation)]
        let millis = self.clock.unix_time().wrapping_mul(1000) as u32;
        self.tcp.base_isn = millis.wrapping_sub(self.clock.ticks()).wrapping_mul(250);
    }

    #[must_use]
    pub fn tcp_conn(&self, id: ConnId) -> Option<&TcpConn> {
        self.tcp.conns.get(&id)
    }

    /// Open a connection to `addr:port`. The handler hears about the
    /// outcome; the connection is usable once `on_connect` fired.
    ///
    /// # Errors
    /// [`NetError::NoRoute`] if `addr` is unreachable, or the send error of
    /// the SYN.
    pub fn tcp_connect(
        &mut self,
        addr: Ipv4Addr,
        port: u16,
        handler: Option<Box<dyn TcpHandler>>,
    ) -> Result<ConnId, NetError> {
        let route = *self.routes.find(addr).ok_or(NetError::NoRoute(addr))?;
        let ends = Endpoints {
            intf: route.intf,
            local_addr: self.intf(route.intf).ip_addr,
            local_port: self.ports.ephemeral(),
            remote_addr: addr,
            remote_port: port,
            next_addr: route.next_addr(addr),
        };
        let isn = self.tcp.base_isn.wrapping_add(self.clock.ticks().wrapping_mul(250));

        let id = ConnId(self.tcp.next_id);
        self.tcp.next_id = self.tcp.next_id.wrapping_add(1);
        self.tcp.conns.insert(id, TcpConn::new(ends, isn, handler));
        log::debug!(
            "tcp: {id} connecting {}:{} -> {addr}:{port}",
            ends.local_addr,
            ends.local_port
        );

        self.set_state(id, TcpState::SynSent);
        if let Err(e) = self.send_packet(id, isn, TcpFlags::SYN, &[]) {
            self.free(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Queue `data` for the peer, split into segments of the peer's MSS.
    ///
    /// # Errors
    /// [`NetError::NoSuchConnection`], or [`NetError::NotConnected`] unless
    /// the connection is established (or only the peer has closed).
    pub fn tcp_send(&mut self, id: ConnId, data: &[u8]) -> Result<(), NetError> {
        let conn = self.tcp.conns.get(&id).ok_or(NetError::NoSuchConnection)?;
        if !matches!(conn.state, TcpState::Established | TcpState::CloseWait) {
            return Err(NetError::NotConnected);
        }
        let mss = usize::from(conn.peer_mss);

        for chunk in data.chunks(mss) {
            let nxt = self.tcp.conns.get(&id).ok_or(NetError::NoSuchConnection)?.snd.nxt;
            self.send_packet(id, nxt, TcpFlags::ACK, chunk)?;
        }
        Ok(())
    }

    /// Begin an orderly close.
    ///
    /// # Errors
    /// [`NetError::NoSuchConnection`] if `id` is gone.
    pub fn tcp_close(&mut self, id: ConnId) -> Result<(), NetError> {
        let conn = self.tcp.conns.get(&id).ok_or(NetError::NoSuchConnection)?;
        let (state, nxt) = (conn.state, conn.snd.nxt);

        match state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => self.free(id),
            TcpState::SynReceived | TcpState::Established => {
                self.set_state(id, TcpState::FinWait1);
                self.send_packet(id, nxt, TcpFlags::FIN_ACK, &[])?;
            }
            TcpState::CloseWait => {
                self.set_state(id, TcpState::LastAck);
                self.send_packet(id, nxt, TcpFlags::FIN_ACK, &[])?;
            }
            TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::LastAck
            | TcpState::TimeWait => self.notify(id, |h| h.on_error(id, TcpError::Closing)),
        }
        Ok(())
    }

    /// Release connections whose `TIME_WAIT` has run out.
    pub fn tcp_poll(&mut self) {
        let now = self.clock.ticks();
        let expired: Vec<ConnId> = self
            .tcp
            .conns
            .iter()
            .filter(|(_, c)| c.state == TcpState::TimeWait && seq_ge(now, c.msl_wait))
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            log::debug!("tcp: {id} left TIME_WAIT");
            self.free(id);
        }
    }

    pub(crate) fn tcp_recv(&mut self, _intf: IntfId, ip: &Ipv4Header, mut buf: NetBuf) {
        let segment = buf.payload();
        dump(ip.src, ip.dst, segment);
        if checksum_final(checksum_update(segment, pseudo_header_sum(ip.src, ip.dst, segment.len()))) != 0 {
            log::debug!("tcp: bad checksum from {}", ip.src);
            return;
        }
        let Some(seg) = parse(segment) else {
            return;
        };

        let found = self.tcp.conns.iter().find_map(|(&id, c)| {
            let e = &c.ends;
            (e.remote_addr == ip.src
                && e.remote_port == seg.src_port
                && e.local_addr == ip.dst
                && e.local_port == seg.dst_port)
                .then_some((id, c.state))
        });

        buf.pull(seg.header_len);
        match found {
            None | Some((_, TcpState::Closed)) => self.recv_closed(ip, &seg, seg_len(&buf)),
            Some((id, TcpState::SynSent)) => self.recv_syn_sent(id, &seg),
            Some((_, TcpState::Listen)) => {}
            Some((id, _)) => {
                buf.seq = seg.seq;
                buf.fin = seg.flags.fin();
                self.recv_general(id, &seg, buf);
            }
        }
    }

    fn set_state(&mut self, id: ConnId, state: TcpState) {
        let Some(conn) = self.tcp.conns.get_mut(&id) else {
            return;
        };
        let old = conn.state;
        conn.state = state;
        log::trace!("tcp: {id} {old:?} -> {state:?}");
        if let Some(handler) = conn.handler.as_mut() {
            handler.on_state(id, old, state);
        }
    }

    fn notify(&mut self, id: ConnId, f: impl FnOnce(&mut dyn TcpHandler)) {
        if let Some(handler) = self.tcp.conns.get_mut(&id).and_then(|c| c.handler.as_mut()) {
            f(handler.as_mut());
        }
    }

    /// Drop the connection, reporting the final transition to `Closed`.
    fn free(&mut self, id: ConnId) {
        if self.tcp.conns.get(&id).is_some_and(|c| c.state != TcpState::Closed) {
            self.set_state(id, TcpState::Closed);
        }
        self.tcp.conns.remove(&id);
    }

    fn error(&mut self, id: ConnId, error: TcpError) {
        log::debug!("tcp: {id} {error}");
        self.notify(id, |h| h.on_error(id, error));
        self.free(id);
    }

    fn enter_time_wait(&mut self, id: ConnId) {
        let until = self.clock.ticks().wrapping_add(2 * TCP_MSL);
        let Some(conn) = self.tcp.conns.get_mut(&id) else {
            return;
        };
        conn.msl_wait = until;
        if conn.state != TcpState::TimeWait {
            self.set_state(id, TcpState::TimeWait);
        }
    }

    /// Send a segment on `id` and advance `snd.nxt` past it.
    ///
    /// `snd.nxt` moves before the segment leaves: on loopback the reply is
    /// processed, and may free the connection, inside the send.
    fn send_packet(&mut self, id: ConnId, seq: u32, flags: TcpFlags, data: &[u8]) -> Result<(), NetError> {
        let conn = self.tcp.conns.get_mut(&id).ok_or(NetError::NoSuchConnection)?;
        let mut advance = u32::try_from(data.len()).map_err(|_| NetError::BufferFull)?;
        if flags.syn() || flags.fin() {
            advance += 1;
        }
        conn.snd.nxt = conn.snd.nxt.wrapping_add(advance);
        let (ends, ack) = (conn.ends, conn.rcv.nxt);
        self.send_segment(&ends, ack, seq, flags, data)
    }

    fn send_segment(
        &mut self,
        ends: &Endpoints,
        ack: u32,
        seq: u32,
        flags: TcpFlags,
        data: &[u8],
    ) -> Result<(), NetError> {
        let options = if flags.syn() { 4 } else { 0 };
        let header_len = TCP_HEADER_LEN + options;

        let mut buf = NetBuf::alloc()?;
        let h = buf.append_zeroed(header_len)?;
        h[0..2].copy_from_slice(&ends.local_port.to_be_bytes());
        h[2..4].copy_from_slice(&ends.remote_port.to_be_bytes());
        h[4..8].copy_from_slice(&seq.to_be_bytes());
        if flags.ack() {
            h[8..12].copy_from_slice(&ack.to_be_bytes());
        }
        #[allow(clippy::cast_possible_truncation)]
        let offset = (header_len / 4) as u8;
        h[12] = offset << 4;
        h[13] = flags.into_bits();
        h[14..16].copy_from_slice(&TCP_WINDOW_SIZE.to_be_bytes());
        if flags.syn() {
            h[20] = OPT_MSS;
            h[21] = 4;
            h[22..24].copy_from_slice(&TCP_MSS.to_be_bytes());
        }
        buf.append(data)?;

        let segment = buf.payload();
        let sum = checksum_final(checksum_update(
            segment,
            pseudo_header_sum(ends.local_addr, ends.remote_addr, segment.len()),
        ));
        buf.payload_mut()[16..18].copy_from_slice(&sum.to_be_bytes());

        dump(ends.local_addr, ends.remote_addr, buf.payload());
        self.ipv4_intf_send(ends.intf, ends.next_addr, ends.remote_addr, IP_PROTOCOL_TCP, buf)
    }

    fn send_ack(&mut self, id: ConnId) {
        let Some(nxt) = self.tcp.conns.get(&id).map(|c| c.snd.nxt) else {
            return;
        };
        if let Err(e) = self.send_packet(id, nxt, TcpFlags::ACK, &[]) {
            log::debug!("tcp: {id} ACK not sent: {e}");
        }
    }

    /// Answer a segment for which no connection exists with a reset.
    fn recv_closed(&mut self, ip: &Ipv4Header, seg: &Segment, data_len: u32) {
        if seg.flags.rst() {
            return;
        }
        let Some(route) = self.routes.find(ip.src).copied() else {
            return;
        };
        let ends = Endpoints {
            intf: route.intf,
            local_addr: ip.dst,
            local_port: seg.dst_port,
            remote_addr: ip.src,
            remote_port: seg.src_port,
            next_addr: route.next_addr(ip.src),
        };

        let result = if seg.flags.ack() {
            self.send_segment(&ends, 0, seg.ack, TcpFlags::RST, &[])
        } else {
            let mut ack = seg.seq.wrapping_add(data_len);
            if seg.flags.syn() {
                ack = ack.wrapping_add(1);
            }
            if seg.flags.fin() {
                ack = ack.wrapping_add(1);
            }
            self.send_segment(&ends, ack, 0, TcpFlags::RST_ACK, &[])
        };
        if let Err(e) = result {
            log::debug!("tcp: reset to {} not sent: {e}", ip.src);
        }
    }

    fn recv_syn_sent(&mut self, id: ConnId, seg: &Segment) {
        let Some(conn) = self.tcp.conns.get_mut(&id) else {
            return;
        };
        let flags = seg.flags;

        if flags.ack() && (seq_le(seg.ack, conn.snd.iss) || seq_gt(seg.ack, conn.snd.nxt)) {
            if !flags.rst() {
                let ends = conn.ends;
                if let Err(e) = self.send_segment(&ends, 0, seg.ack, TcpFlags::RST, &[]) {
                    log::debug!("tcp: {id} reset not sent: {e}");
                }
            }
            return;
        }

        if flags.rst() {
            if flags.ack() {
                self.error(id, TcpError::Refused);
            }
            return;
        }

        if !flags.syn() {
            return;
        }

        conn.rcv.irs = seg.seq;
        conn.rcv.nxt = seg.seq.wrapping_add(1);
        conn.peer_mss = seg.mss.filter(|&m| m > 0).map_or(TCP_DEFAULT_MSS, |m| m.min(TCP_MSS));

        if flags.ack() {
            conn.snd.una = seg.ack;
            conn.snd.wnd = seg.window;
            conn.snd.wl1 = seg.seq;
            conn.snd.wl2 = seg.ack;

            self.set_state(id, TcpState::Established);
            self.send_ack(id);
            self.notify(id, |h| h.on_connect(id));
        } else {
            // Simultaneous open: answer with our SYN again, now acking theirs.
            conn.snd.nxt = conn.snd.nxt.wrapping_sub(1);
            let nxt = conn.snd.nxt;
            self.set_state(id, TcpState::SynReceived);
            if let Err(e) = self.send_packet(id, nxt, TcpFlags::SYN_ACK, &[]) {
                log::debug!("tcp: {id} SYN+ACK not sent: {e}");
            }
        }
    }

    fn recv_general(&mut self, id: ConnId, seg: &Segment, buf: NetBuf) {
        let Some(conn) = self.tcp.conns.get(&id) else {
            return;
        };
        let flags = seg.flags;
        let data_len = seg_len(&buf);

        let window_end = conn.rcv.nxt.wrapping_add(u32::from(conn.rcv.wnd));
        let acceptable =
            seq_le(conn.rcv.nxt, seg.seq) && seq_le(seg.seq.wrapping_add(data_len), window_end);
        if !acceptable {
            if !flags.rst() {
                // The peer lost our ACK of its FIN and sent it again.
                let fin_again =
                    flags.fin() && seg.seq.wrapping_add(data_len).wrapping_add(1) == conn.rcv.nxt;
                log::trace!("tcp: {id} unacceptable segment seq={}", seg.seq);
                self.send_ack(id);
                if fin_again {
                    self.recv_fin(id);
                }
            }
            return;
        }

        if flags.rst() {
            self.recv_rst(id);
            return;
        }

        if flags.syn() {
            self.recv_syn(id);
            return;
        }

        if !flags.ack() || !self.recv_ack(id, seg) {
            return;
        }

        if data_len > 0 || flags.fin() {
            self.recv_data(id, buf);
        }
    }

    fn recv_rst(&mut self, id: ConnId) {
        let Some(state) = self.tcp.conns.get(&id).map(|c| c.state) else {
            return;
        };
        match state {
            TcpState::SynReceived => self.error(id, TcpError::Refused),
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 | TcpState::CloseWait => {
                self.error(id, TcpError::Reset);
            }
            TcpState::Closing | TcpState::LastAck | TcpState::TimeWait => self.free(id),
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => {}
        }
    }

    /// A SYN inside the window: the peer lost the connection. Reset it.
    fn recv_syn(&mut self, id: ConnId) {
        let Some(nxt) = self.tcp.conns.get(&id).map(|c| c.snd.nxt) else {
            return;
        };
        if let Err(e) = self.send_packet(id, nxt, TcpFlags::RST, &[]) {
            log::debug!("tcp: {id} reset not sent: {e}");
        }
        self.error(id, TcpError::Reset);
    }

    /// Process the acknowledgment field. Returns `false` when the rest of
    /// the segment must be ignored.
    fn recv_ack(&mut self, id: ConnId, seg: &Segment) -> bool {
        let Some(conn) = self.tcp.conns.get_mut(&id) else {
            return false;
        };

        let state = conn.state;
        match state {
            TcpState::SynReceived => {
                if seq_le(conn.snd.una, seg.ack) && seq_le(seg.ack, conn.snd.nxt) {
                    conn.snd.una = seg.ack;
                    conn.snd.wnd = seg.window;
                    conn.snd.wl1 = seg.seq;
                    conn.snd.wl2 = seg.ack;
                    self.set_state(id, TcpState::Established);
                    self.notify(id, |h| h.on_connect(id));
                } else {
                    let ends = conn.ends;
                    if let Err(e) = self.send_segment(&ends, 0, seg.ack, TcpFlags::RST, &[]) {
                        log::debug!("tcp: {id} reset not sent: {e}");
                    }
                    return false;
                }
            }
            TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait
            | TcpState::Closing => {
                if seq_gt(seg.ack, conn.snd.nxt) {
                    self.send_ack(id);
                    return false;
                }

                if seq_le(conn.snd.una, seg.ack) {
                    conn.snd.una = seg.ack;
                    if seq_lt(conn.snd.wl1, seg.seq)
                        || (conn.snd.wl1 == seg.seq && seq_le(conn.snd.wl2, seg.ack))
                    {
                        conn.snd.wnd = seg.window;
                        conn.snd.wl1 = seg.seq;
                        conn.snd.wl2 = seg.ack;
                    }
                }

                if seg.ack == conn.snd.nxt {
                    match state {
                        TcpState::FinWait1 => self.set_state(id, TcpState::FinWait2),
                        TcpState::Closing => self.enter_time_wait(id),
                        _ => {}
                    }
                }
            }
            TcpState::LastAck => {
                if seq_ge(seg.ack, conn.snd.nxt) {
                    self.free(id);
                    return false;
                }
            }
            TcpState::TimeWait | TcpState::Closed | TcpState::Listen | TcpState::SynSent => {}
        }
        true
    }

    fn recv_data(&mut self, id: ConnId, buf: NetBuf) {
        let Some(state) = self.tcp.conns.get(&id).map(|c| c.state) else {
            return;
        };
        if !matches!(
            state,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        ) {
            return;
        }

        self.insert(id, buf);
        let fin = self.process(id);
        self.send_ack(id);
        if fin {
            self.recv_fin(id);
        }
    }

    /// Queue `buf`, trimming it and its neighbours so no byte is queued
    /// twice. Nothing after a FIN is kept.
    fn insert(&mut self, id: ConnId, mut buf: NetBuf) {
        let Some(conn) = self.tcp.conns.get_mut(&id) else {
            return;
        };
        let queue = &mut conn.resequence;

        let pos = queue
            .iter()
            .position(|b| seq_le(buf.seq, b.seq))
            .unwrap_or(queue.len());
        let end = buf.seq.wrapping_add(seg_len(&buf));

        if let Some(prev) = pos.checked_sub(1).map(|i| &mut queue[i]) {
            let prev_end = prev.seq.wrapping_add(seg_len(prev));
            if seq_gt(prev_end, end) || (prev_end == end && !buf.fin) {
                return;
            }
            if seq_gt(prev_end, buf.seq) {
                prev.trim_end(span(buf.seq, prev_end));
            }
        }

        if buf.fin {
            queue.truncate(pos);
        }

        while let Some(cur) = queue.get(pos) {
            let end = buf.seq.wrapping_add(seg_len(&buf));
            let cur_end = cur.seq.wrapping_add(seg_len(cur));
            if seq_lt(end, cur.seq) {
                break;
            }
            if seq_lt(end, cur_end) {
                buf.trim_end(span(cur.seq, end));
                break;
            }
            if cur.fin {
                buf.trim_end(span(cur_end, end));
                buf.fin = true;
                queue.truncate(pos);
                break;
            }
            queue.remove(pos);
        }

        if buf.is_empty() && !buf.fin {
            return;
        }
        queue.insert(pos, buf);
    }

    /// Deliver the queued segments that continue `rcv.nxt`. Returns `true`
    /// once the FIN has been reached.
    fn process(&mut self, id: ConnId) -> bool {
        let Some(conn) = self.tcp.conns.get_mut(&id) else {
            return false;
        };
        while conn.resequence.first().is_some_and(|b| b.seq == conn.rcv.nxt) {
            let buf = conn.resequence.remove(0);
            conn.rcv.nxt = conn.rcv.nxt.wrapping_add(seg_len(&buf));
            if !buf.is_empty()
                && let Some(handler) = conn.handler.as_mut()
            {
                handler.on_data(id, buf.payload());
            }
            if buf.fin {
                conn.rcv.nxt = conn.rcv.nxt.wrapping_add(1);
                conn.resequence.clear();
                return true;
            }
        }
        false
    }

    /// The peer's FIN is next in sequence, or is a retransmission of the
    /// one already taken. Either way it has been acknowledged.
    fn recv_fin(&mut self, id: ConnId) {
        let Some(state) = self.tcp.conns.get(&id).map(|c| c.state) else {
            return;
        };
        match state {
            TcpState::SynReceived | TcpState::Established => self.set_state(id, TcpState::CloseWait),
            TcpState::FinWait1 => self.set_state(id, TcpState::Closing),
            TcpState::FinWait2 | TcpState::TimeWait => self.enter_time_wait(id),
            TcpState::Closed
            | TcpState::Listen
            | TcpState::SynSent
            | TcpState::CloseWait
            | TcpState::Closing
            | TcpState::LastAck => {}
        }
    }
}

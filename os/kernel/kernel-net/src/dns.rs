//! DNS resolver (RFC 1035).
//!
//! Queries carry a caller-chosen 16-bit id; a reply is matched to its
//! pending callback by that id alone. The callback gets the queried host
//! name and the raw reply, from which [`get_ip4_a`] extracts an address.

use crate::addr::{Ipv4Addr, ipv4_from};
use crate::buf::NetBuf;
use crate::intf::IntfId;
use crate::port::PORT_DNS;
use crate::{NetError, NetStack};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

pub const DNS_HEADER_LEN: usize = 12;

const QTYPE_A: u16 = 1;
const QTYPE_NS: u16 = 2;
const QCLASS_IN: u16 = 1;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;

/// Upper bound on compression pointers followed while reading one name.
const MAX_POINTER_HOPS: usize = 16;

/// Called with the queried host and the reply packet.
pub type DnsCallback = Box<dyn FnOnce(&str, &[u8]) + Send>;

struct PendingQuery {
    id: u16,
    host: String,
    callback: DnsCallback,
}

pub(crate) struct DnsClient {
    pub(crate) server: Ipv4Addr,
    pending: Vec<PendingQuery>,
}

impl DnsClient {
    pub(crate) const fn new() -> Self {
        Self {
            server: Ipv4Addr::UNSPECIFIED,
            pending: Vec::new(),
        }
    }
}

fn word(packet: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes(packet.get(at..at + 2)?.try_into().ok()?))
}

/// Position after the name starting at `pos`. A compression pointer ends
/// the name.
fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *packet.get(pos)?;
        match len {
            0 => return Some(pos + 1),
            1..=0x3F => pos += 1 + usize::from(len),
            _ => return Some(pos + 2),
        }
    }
}

/// Decode the name at `pos`, following compression pointers.
///
/// Returns the dotted name and the position after it in the original
/// stream.
fn read_name(packet: &[u8], pos: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut at = pos;
    let mut end = None;
    let mut hops = 0;

    loop {
        let len = *packet.get(at)?;
        match len {
            0 => break,
            1..=0x3F => {
                let label = packet.get(at + 1..at + 1 + usize::from(len))?;
                if !name.is_empty() {
                    name.push('.');
                }
                name.extend(label.iter().map(|&c| char::from(c)));
                at += 1 + usize::from(len);
            }
            _ => {
                let lo = *packet.get(at + 1)?;
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return None;
                }
                end.get_or_insert(at + 2);
                at = (usize::from(len & 0x3F) << 8) | usize::from(lo);
            }
        }
    }

    Some((name, end.unwrap_or(at + 1)))
}

/// The first A record in the answer section of `reply`.
#[must_use]
pub fn get_ip4_a(reply: &[u8]) -> Option<Ipv4Addr> {
    let questions = word(reply, 4)?;
    let answers = word(reply, 6)?;

    let mut pos = DNS_HEADER_LEN;
    for _ in 0..questions {
        pos = skip_name(reply, pos)? + 4;
    }

    for _ in 0..answers {
        pos = skip_name(reply, pos)?;
        let kind = word(reply, pos)?;
        let data_len = usize::from(word(reply, pos + 8)?);
        pos += 10;
        if kind == QTYPE_A && data_len == 4 {
            return ipv4_from(reply.get(pos..pos + 4)?);
        }
        pos += data_len;
    }
    None
}

/// Append `host` in label encoding.
fn encode_name(buf: &mut NetBuf, host: &str) -> Result<(), NetError> {
    if host.len() > MAX_NAME_LEN {
        return Err(NetError::BadHostName);
    }
    for label in host.split('.').filter(|l| !l.is_empty()) {
        let len = u8::try_from(label.len())
            .ok()
            .filter(|&n| usize::from(n) <= MAX_LABEL_LEN)
            .ok_or(NetError::BadHostName)?;
        buf.append(&[len])?;
        buf.append(label.as_bytes())?;
    }
    buf.append(&[0])
}

fn dump_rr(section: &str, packet: &[u8], pos: usize) -> Option<usize> {
    let (name, pos) = read_name(packet, pos)?;
    let kind = word(packet, pos)?;
    let class = word(packet, pos + 2)?;
    let ttl = u32::from_be_bytes(packet.get(pos + 4..pos + 8)?.try_into().ok()?);
    let data_len = usize::from(word(packet, pos + 8)?);
    let data = pos + 10;

    match kind {
        QTYPE_A if data_len == 4 => log::trace!(
            "    {section}: {name} type={kind} class={class} ttl={ttl} {}",
            ipv4_from(packet.get(data..)?)?
        ),
        QTYPE_NS => log::trace!(
            "    {section}: {name} type={kind} class={class} ttl={ttl} {}",
            read_name(packet, data)?.0
        ),
        _ => log::trace!("    {section}: {name} type={kind} class={class} ttl={ttl} dataLen={data_len}"),
    }
    Some(data + data_len)
}

fn dump(packet: &[u8]) {
    if !log::log_enabled!(log::Level::Trace) || packet.len() < DNS_HEADER_LEN {
        return;
    }
    let count = |i| word(packet, i).unwrap_or(0);
    let (questions, answers, authorities, additional) = (count(4), count(6), count(8), count(10));
    log::trace!(
        "   DNS: id={} flags={:#x} questions={questions} answers={answers} authorities={authorities} additional={additional}",
        count(0),
        count(2)
    );

    let mut pos = DNS_HEADER_LEN;
    for _ in 0..questions {
        let Some((name, at)) = read_name(packet, pos) else {
            return;
        };
        log::trace!(
            "    Query: {name} type={} class={}",
            word(packet, at).unwrap_or(0),
            word(packet, at + 2).unwrap_or(0)
        );
        pos = at + 4;
    }

    let sections = [("Ans", answers), ("Auth", authorities), ("Add", additional)];
    for (section, n) in sections {
        for _ in 0..n {
            let Some(next) = dump_rr(section, packet, pos) else {
                return;
            };
            pos = next;
        }
    }
}

impl NetStack {
    #[must_use]
    pub const fn dns_server(&self) -> Ipv4Addr {
        self.dns.server
    }

    pub const fn set_dns_server(&mut self, server: Ipv4Addr) {
        self.dns.server = server;
    }

    /// Ask the configured server for `host`'s A record. With a callback,
    /// the reply carrying `id` is delivered to it.
    ///
    /// # Errors
    /// [`NetError::NoDnsServer`] before DHCP supplied a server,
    /// [`NetError::BadHostName`] for names that cannot be encoded, and the
    /// UDP send errors.
    pub fn dns_query_host(&mut self, host: &str, id: u16, callback: Option<DnsCallback>) -> Result<(), NetError> {
        let server = self.dns.server;
        if server.is_unspecified() {
            log::warn!("dns: no server configured, query for {host} dropped");
            return Err(NetError::NoDnsServer);
        }

        let mut buf = NetBuf::alloc()?;
        let h = buf.append_zeroed(DNS_HEADER_LEN)?;
        h[0..2].copy_from_slice(&id.to_be_bytes());
        h[2..4].copy_from_slice(&FLAG_RECURSION_DESIRED.to_be_bytes());
        h[4..6].copy_from_slice(&1u16.to_be_bytes());
        encode_name(&mut buf, host)?;
        buf.append(&QTYPE_A.to_be_bytes())?;
        buf.append(&QCLASS_IN.to_be_bytes())?;

        dump(buf.payload());
        if let Some(callback) = callback {
            self.dns.pending.push(PendingQuery {
                id,
                host: String::from(host),
                callback,
            });
        }

        let src_port = self.ports.ephemeral();
        self.udp_send(server, PORT_DNS, src_port, buf)
    }

    pub(crate) fn dns_recv(&mut self, _intf: IntfId, buf: &NetBuf) {
        let packet = buf.payload();
        dump(packet);
        let Some(id) = word(packet, 0) else {
            return;
        };

        let Some(index) = self.dns.pending.iter().position(|q| q.id == id) else {
            log::info!("DNS callback entry not found.");
            return;
        };
        let query = self.dns.pending.remove(index);
        (query.callback)(&query.host, packet);
    }
}

//! SNTP client: one request, and the reply's transmit timestamp sets the
//! wall clock.

use crate::addr::Ipv4Addr;
use crate::buf::NetBuf;
use crate::intf::IntfId;
use crate::port::PORT_NTP;
use crate::{NetError, NetStack};
use core::fmt;

pub const NTP_HEADER_LEN: usize = 48;

const NTP_VERSION: u8 = 4;
const MODE_CLIENT: u8 = 3;

/// Seconds from 1900-01-01 (NTP era 0) to 1970-01-01.
pub const UNIX_EPOCH_OFFSET: u64 = 2_208_988_800;

const TRANSMIT_TIMESTAMP: usize = 40;

/// Convert NTP seconds to Unix seconds. Timestamps below the Unix epoch's
/// NTP value belong to era 1 (after 2036-02-07).
#[must_use]
pub fn ntp_to_unix(secs: u32) -> u64 {
    let secs = u64::from(secs);
    if secs >= UNIX_EPOCH_OFFSET {
        secs - UNIX_EPOCH_OFFSET
    } else {
        secs + (1 << 32) - UNIX_EPOCH_OFFSET
    }
}

/// UTC calendar time of a Unix timestamp, printed as
/// `YYYY-MM-DD hh:mm:ss`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DateTime {
    pub year: u64,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTime {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_unix(secs: u64) -> Self {
        let days = secs / 86_400;
        let rem = secs % 86_400;

        // Civil from days, with March as the first month of the year.
        let z = days + 719_468;
        let era = z / 146_097;
        let doe = z - era * 146_097;
        let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = doy - (153 * mp + 2) / 5 + 1;
        let month = if mp < 10 { mp + 3 } else { mp - 9 };
        let year = yoe + era * 400 + u64::from(month <= 2);

        Self {
            year,
            month: month as u8,
            day: day as u8,
            hour: (rem / 3600) as u8,
            minute: (rem / 60 % 60) as u8,
            second: (rem % 60) as u8,
        }
    }

    /// Seconds since the Unix epoch; the inverse of
    /// [`from_unix`](Self::from_unix). Dates before 1970 clamp to 0.
    #[must_use]
    pub fn to_unix(&self) -> u64 {
        let month = u64::from(self.month.clamp(1, 12));
        let year = self.year.saturating_sub(u64::from(month <= 2));
        let era = year / 400;
        let yoe = year - era * 400;
        let mp = if month > 2 { month - 3 } else { month + 9 };
        let doy = (153 * mp + 2) / 5 + u64::from(self.day.max(1)) - 1;
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
        let days = (era * 146_097 + doe).saturating_sub(719_468);
        days * 86_400
            + u64::from(self.hour) * 3600
            + u64::from(self.minute) * 60
            + u64::from(self.second)
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

fn transmit_seconds(packet: &[u8]) -> Option<u32> {
    let bytes = packet.get(TRANSMIT_TIMESTAMP..TRANSMIT_TIMESTAMP + 4)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

fn dump(packet: &[u8]) {
    if packet.len() < NTP_HEADER_LEN {
        return;
    }
    let word = |i: usize| u32::from_be_bytes([packet[i], packet[i + 1], packet[i + 2], packet[i + 3]]);
    log::trace!(
        "   NTP: mode={:#x} stratum={} poll={} precision={} rootDelay={:#x} rootDispersion={:#x} refId={:#x} transmit={}",
        packet[0],
        packet[1],
        packet[2],
        packet[3].cast_signed(),
        word(4),
        word(8),
        word(12),
        word(TRANSMIT_TIMESTAMP)
    );
}

impl NetStack {
    /// Ask `dst` for the time.
    ///
    /// # Errors
    /// [`NetError::NoRoute`] or [`NetError::BufferFull`].
    pub fn ntp_send(&mut self, dst: Ipv4Addr) -> Result<(), NetError> {
        let mut buf = NetBuf::alloc()?;
        let h = buf.append_zeroed(NTP_HEADER_LEN)?;
        h[0] = (NTP_VERSION << 3) | MODE_CLIENT;
        h[2] = 4;
        h[3] = (-6i8).cast_unsigned();
        h[4..8].copy_from_slice(&(1u32 << 16).to_be_bytes());
        h[8..12].copy_from_slice(&(1u32 << 16).to_be_bytes());

        dump(buf.payload());
        let src_port = self.ports.ephemeral();
        self.udp_send(dst, PORT_NTP, src_port, buf)
    }

    pub(crate) fn ntp_recv(&mut self, _intf: IntfId, buf: &NetBuf) {
        let packet = buf.payload();
        dump(packet);
        if packet.len() < NTP_HEADER_LEN {
            return;
        }
        let Some(secs) = transmit_seconds(packet) else {
            return;
        };

        let unix = ntp_to_unix(secs);
        log::info!("Setting time to {}", DateTime::from_unix(unix));
        self.clock.set_unix_time(unix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PEER_MAC, stack_with_wire, udp_frame, udp_payload};
    use alloc::string::ToString;

    #[test]
    fn conversion_handles_eras() {
        assert_eq!(ntp_to_unix(0x83AA_7E80), 0);
        assert_eq!(ntp_to_unix(0xE7A6_8E00), 0xE7A6_8E00 - 2_208_988_800);
        // 2036-02-07 06:28:16 UTC is NTP era 1, second 0.
        assert_eq!(ntp_to_unix(0), 2_085_978_496);
    }

    #[test]
    fn calendar() {
        assert_eq!(DateTime::from_unix(0).to_string(), "1970-01-01 00:00:00");
        assert_eq!(DateTime::from_unix(951_782_400).to_string(), "2000-02-29 00:00:00");
        assert_eq!(DateTime::from_unix(1_700_000_000).to_string(), "2023-11-14 22:13:20");
    }

    #[test]
    fn calendar_back_to_seconds() {
        for secs in [0, 951_782_400, 1_700_000_000, 4_102_444_799] {
            assert_eq!(DateTime::from_unix(secs).to_unix(), secs);
        }
        let before_epoch = DateTime {
            year: 1969,
            month: 12,
            day: 31,
            hour: 0,
            minute: 0,
            second: 0,
        };
        assert_eq!(before_epoch.to_unix(), 0);
    }

    #[test]
    fn request_and_reply_set_the_clock() {
        let (mut stack, wire) = stack_with_wire([10, 0, 0, 1]);
        let server = Ipv4Addr::new(10, 0, 0, 123);
        stack.seed_arp(server, PEER_MAC);
        stack.ntp_send(server).unwrap();

        let sent = wire.take_sent();
        assert_eq!(sent.len(), 1);
        let request = udp_payload(&sent[0]);
        assert_eq!(request.len(), NTP_HEADER_LEN);
        assert_eq!(request[0], 0x23);
        assert_eq!(u16::from_be_bytes([sent[0][36], sent[0][37]]), PORT_NTP);
        let src_port = u16::from_be_bytes([sent[0][34], sent[0][35]]);

        let mut reply = [0u8; NTP_HEADER_LEN];
        reply[0] = 0x24;
        let ntp_secs = u32::try_from(1_700_000_000 + UNIX_EPOCH_OFFSET).unwrap();
        reply[40..44].copy_from_slice(&ntp_secs.to_be_bytes());
        wire.inject(udp_frame([10, 0, 0, 123], [10, 0, 0, 1], PORT_NTP, src_port, &reply));
        stack.poll();

        assert_eq!(stack.clock.unix_time(), 1_700_000_000);
    }
}

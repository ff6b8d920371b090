//! # CMOS real-time clock
//!
//! Read once at boot to seed the wall clock; NTP replies correct it later.

use crate::ports::{inb, outb};
use kernel_net::ntp::DateTime;

const INDEX: u16 = 0x70;
const DATA: u16 = 0x71;

const REG_SECONDS: u8 = 0x00;
const REG_MINUTES: u8 = 0x02;
const REG_HOURS: u8 = 0x04;
const REG_DAY: u8 = 0x07;
const REG_MONTH: u8 = 0x08;
const REG_YEAR: u8 = 0x09;
const REG_A: u8 = 0x0A;
const REG_B: u8 = 0x0B;

/// Register A: an update cycle is in progress.
const A_UPDATE_IN_PROGRESS: u8 = 1 << 7;
/// Register B: 24-hour format.
const B_24_HOUR: u8 = 1 << 1;
/// Register B: binary instead of BCD.
const B_BINARY: u8 = 1 << 2;
/// Hours register, 12-hour mode: PM.
const HOUR_PM: u8 = 1 << 7;

fn read(reg: u8) -> u8 {
    // SAFETY: CMOS index/data ports; NMI stays enabled (bit 7 clear).
    unsafe {
        outb(INDEX, reg);
        inb(DATA)
    }
}

const fn bcd_to_bin(v: u8) -> u8 {
    (v & 0x0F) + (v >> 4) * 10
}

#[derive(Copy, Clone, Eq, PartialEq)]
struct Raw([u8; 6]);

fn read_raw() -> Raw {
    while read(REG_A) & A_UPDATE_IN_PROGRESS != 0 {
        core::hint::spin_loop();
    }
    Raw([
        read(REG_SECONDS),
        read(REG_MINUTES),
        read(REG_HOURS),
        read(REG_DAY),
        read(REG_MONTH),
        read(REG_YEAR),
    ])
}

/// Current UTC time from the CMOS clock.
pub fn now() -> DateTime {
    // Two equal reads in a row rule out a torn update.
    let mut raw = read_raw();
    loop {
        let again = read_raw();
        if again == raw {
            break;
        }
        raw = again;
    }

    let b = read(REG_B);
    let [mut sec, mut min, hour_raw, mut day, mut month, mut year] = raw.0;
    let pm = hour_raw & HOUR_PM != 0;
    let mut hour = hour_raw & !HOUR_PM;
    if b & B_BINARY == 0 {
        sec = bcd_to_bin(sec);
        min = bcd_to_bin(min);
        hour = bcd_to_bin(hour);
        day = bcd_to_bin(day);
        month = bcd_to_bin(month);
        year = bcd_to_bin(year);
    }
    if b & B_24_HOUR == 0 {
        hour = match (hour % 12, pm) {
            (h, true) => h + 12,
            (h, false) => h,
        };
    }

    DateTime {
        year: 2000 + u64::from(year),
        month,
        day,
        hour,
        minute: min,
        second: sec,
    }
}

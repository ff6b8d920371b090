//! # Network stack glue
//!
//! The stack itself lives in `kernel-net`; the kernel supplies its clock and
//! drives it from the idle loop. No NIC driver is built in, so after
//! [`init`] only the loopback interface exists. A driver registers through
//! [`NetStack::add_interface`] before [`init`] runs DHCP on it.

use crate::memory::{Frames, MAPPER};
use crate::{pit, rtc};
use alloc::boxed::Box;
use core::ptr::NonNull;
use kernel_net::buf::{NetBlock, frame_block};
use kernel_net::{Clock, Ipv4Addr, NET_BUFS, NetStack};
use kernel_sync::IrqCell;
use log::{info, warn};

static NET: IrqCell<Option<NetStack>> = IrqCell::new(None);

/// Packet buffers put on the free list before the first frame arrives.
const NET_BUF_PREALLOC: usize = 16;

fn net_block() -> Option<NonNull<NetBlock>> {
    frame_block(&mut Frames, &MAPPER)
}

/// PIT ticks plus a wall clock seeded from the CMOS clock.
struct KernelClock {
    /// Unix time at tick 0.
    base: u64,
}

impl Clock for KernelClock {
    fn ticks(&self) -> u32 {
        pit::ticks()
    }

    fn unix_time(&self) -> u64 {
        self.base + u64::from(pit::ticks() / pit::TICK_HZ)
    }

    fn set_unix_time(&mut self, secs: u64) {
        self.base = secs.saturating_sub(u64::from(pit::ticks() / pit::TICK_HZ));
    }
}

/// Bring the stack up and ping the loopback address once.
pub fn init() {
    let now = rtc::now();
    info!(
        "RTC: {:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
        now.year, now.month, now.day, now.hour, now.minute, now.second
    );

    NET_BUFS.set_source(net_block);
    let got = NET_BUFS.grow(&mut Frames, &MAPPER, NET_BUF_PREALLOC);
    if got < NET_BUF_PREALLOC {
        warn!("net: only {got} of {NET_BUF_PREALLOC} packet buffers");
    }

    let mut stack = NetStack::new(Box::new(KernelClock { base: now.to_unix() }));
    stack.init();
    info!("routes:\n{}", stack.route_dump());
    if let Err(e) = stack.icmp_echo_request(Ipv4Addr::LOCALHOST, 1, 1, b"ping") {
        warn!("net: loopback ping failed: {e}");
    }
    NET.with(|net| *net = Some(stack));
}

/// Process pending frames and expire TCP connections.
pub fn poll() {
    NET.with(|net| {
        if let Some(stack) = net {
            stack.poll();
        }
    });
}

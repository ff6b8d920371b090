//! # Kernel Entry Point
//!
//! A Multiboot 1 loader jumps to [`_start`] in protected mode with paging
//! off, `eax` holding the loader magic and `ebx` the physical address of the
//! boot information. From there [`kernel_main`] brings the machine up:
//!
//! ```text
//! logger ─► multiboot info ─► frames ─► paging ─► heap ─► GDT/TSS ─► IDT
//!        ─► PIC ─► PIT ─► initrd ─► init (PID 0) ─► network ─► sti
//!        ─► /bin/init ─► idle loop
//! ```

#![no_std]
#![no_main]
#![allow(unsafe_code)]

extern crate alloc;

mod cpu;
mod gdt;
mod idt;
mod interrupts;
mod memory;
mod net;
mod panic;
mod pic;
mod pit;
mod ports;
mod rtc;
mod tasks;
mod tss;

use kernel_info::boot::{
    FLAG_VBE, INFO_SIZE, MemoryMap, MultibootInfo, VbeModeInfo, modules,
};
use kernel_info::memory::BOOT_STACK_SIZE;
use kernel_qemu::QemuLogger;
use kernel_sync::irq::{interrupts_enabled, sti_enable_interrupts};
use log::{LevelFilter, info, warn};
use stdlib::syscall_abi::Sysno;

const MULTIBOOT_HEADER_MAGIC: u32 = 0x1BAD_B002;
/// Page-align modules and provide the memory map.
const MULTIBOOT_HEADER_FLAGS: u32 = (1 << 0) | (1 << 1);

#[repr(C, align(4))]
struct MultibootHeader {
    magic: u32,
    flags: u32,
    checksum: u32,
}

#[used]
#[unsafe(link_section = ".multiboot")]
static MULTIBOOT_HEADER: MultibootHeader = MultibootHeader {
    magic: MULTIBOOT_HEADER_MAGIC,
    flags: MULTIBOOT_HEADER_FLAGS,
    checksum: 0u32
        .wrapping_sub(MULTIBOOT_HEADER_MAGIC)
        .wrapping_sub(MULTIBOOT_HEADER_FLAGS),
};

/// 16-byte aligned stack
#[repr(align(16))]
struct Aligned<const N: usize>([u8; N]);

#[unsafe(link_section = ".bss.boot")]
#[unsafe(no_mangle)]
static mut BOOT_STACK: Aligned<BOOT_STACK_SIZE> = Aligned([0; BOOT_STACK_SIZE]);

/// The kernel entry point.
///
/// Naked so that nothing touches the stack before it exists. `ebp` is
/// zeroed so stack walks end here.
#[unsafe(no_mangle)]
#[unsafe(naked)]
#[unsafe(link_section = ".text.boot")]
pub extern "C" fn _start() -> ! {
    core::arch::naked_asm!(
        "cli",
        "lea esp, [{stack} + {stack_size}]",
        "xor ebp, ebp",
        "push ebx",
        "push eax",
        "call {main}",
        "2:",
        "hlt",
        "jmp 2b",
        stack = sym BOOT_STACK,
        stack_size = const BOOT_STACK_SIZE,
        main = sym kernel_main,
    );
}

#[allow(clippy::cast_possible_truncation)]
fn boot_stack_top() -> u32 {
    (&raw const BOOT_STACK) as u32 + BOOT_STACK_SIZE as u32
}

/// Borrow `len` bytes of identity-mapped physical memory.
///
/// # Safety
/// The range must be mapped (or paging off) and stay untouched for `'static`.
unsafe fn phys_bytes(addr: u32, len: u32) -> &'static [u8] {
    unsafe { core::slice::from_raw_parts(addr as *const u8, len as usize) }
}

#[allow(clippy::cast_possible_truncation)]
extern "C" fn kernel_main(magic: u32, info_addr: u32) -> ! {
    let _ = QemuLogger::new(LevelFilter::Debug).init();
    info!("Kernel reporting to QEMU!");

    // SAFETY: the loader placed the info block at `info_addr`.
    let boot = MultibootInfo::parse(magic, unsafe { phys_bytes(info_addr, INFO_SIZE as u32) })
        .unwrap_or_else(|e| panic!("Invalid multiboot header: {e}"));
    let Ok((mmap_addr, mmap_len)) = boot.memory_map_region() else {
        panic!("Invalid memory map");
    };
    let Some(initrd) = boot
        .modules_region()
        .ok()
        // SAFETY: the module table is loader memory below the kernel's frames.
        .and_then(|(addr, len)| modules(unsafe { phys_bytes(addr, len) }).next())
        .filter(|m| !m.is_empty())
    else {
        panic!("Initial ramdisk not found");
    };
    info!("initrd at {:#010x}..{:#010x}", initrd.start, initrd.end);

    if boot.has(FLAG_VBE)
        // SAFETY: the loader's VBE mode block, read once.
        && let Some(vbe) = VbeModeInfo::parse(unsafe { phys_bytes(boot.vbe_mode_info, VbeModeInfo::SIZE as u32) })
    {
        info!(
            "framebuffer {}x{}x{} at {:#010x}",
            vbe.width, vbe.height, vbe.bpp, vbe.framebuffer
        );
    }

    // SAFETY: the memory map is loader memory; frames are not handed out yet.
    let map = MemoryMap::new(unsafe { phys_bytes(mmap_addr, mmap_len) });
    if let Err(e) = unsafe { memory::init_frames(map, initrd.start..initrd.end) } {
        panic!("Cannot set up the frame allocator: {e}");
    }
    let directory = match unsafe { memory::init_paging() } {
        Ok(directory) => directory,
        Err(e) => panic!("Cannot set up paging: {e}"),
    };
    if let Err(e) = memory::init_heap() {
        panic!("Cannot set up the kernel heap: {e}");
    }

    unsafe {
        gdt::init();
        idt::init_idt_once(interrupts::build());
        pic::remap(pic::MASTER_OFFSET, pic::SLAVE_OFFSET);
        pit::set_phase(pit::TICK_HZ);
    }

    // SAFETY: the initrd frames are locked in the frame allocator.
    let image = unsafe { phys_bytes(initrd.start, initrd.len()) };
    if let Err(e) = tasks::mount_initrd(image) {
        panic!("Initial ramdisk is unreadable: {e}");
    }
    match tasks::spawn_init(boot_stack_top(), BOOT_STACK_SIZE as u32, directory) {
        Ok(pid) => info!("kernel thread is {pid}"),
        Err(e) => panic!("Cannot start init: {e}"),
    }
    kernel_sync::set_relax_hook(relax);

    net::init();

    sti_enable_interrupts();
    syscall_self_test();

    match tasks::system("/bin/init", &[]) {
        Ok(child) => info!("/bin/init started as {child}"),
        Err(e) => warn!("cannot start /bin/init: {e}"),
    }

    loop {
        net::poll();
        tasks::yield_now();
        // SAFETY: interrupts are enabled, the next tick wakes us.
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}

/// Contended spin locks give the CPU away, unless they spin with
/// interrupts off (no switch is possible then).
fn relax() {
    if interrupts_enabled() {
        tasks::yield_now();
    }
}

/// Raise `int 0x80` from ring 0 to check the gate before user code needs it.
fn syscall_self_test() {
    let text = c"syscall: int 0x80 gate works\n";
    let ret: u32;
    // SAFETY: the gate is installed; `print` only reads the string.
    unsafe {
        core::arch::asm!(
            "int 0x80",
            inlateout("eax") Sysno::Print as u32 => ret,
            in("ebx") text.as_ptr(),
            options(nostack)
        );
    }
    if ret != 0 {
        warn!("syscall self test returned {ret:#x}");
    }
}

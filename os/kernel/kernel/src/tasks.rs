//! # The process table and the initial ramdisk
//!
//! [`SCHEDULER`] is borrowed through an [`IrqCell`]: every entry point here
//! runs with interrupts off, and a borrow that switches to another process
//! stays open until that process switches back.

use crate::cpu::Cpu;
use crate::memory::{Frames, MAPPER};
use kernel_alloc::IdentityPhysMapper;
use kernel_memory_addresses::PhysicalAddress;
use kernel_proc::panic::FuncTable;
use kernel_proc::{Pid, ProcError, Scheduler, SystemOutcome};
use kernel_sync::{IrqCell, SyncOnceCell};
use log::{info, warn};
use packer_abi::VfsError;
use packer_abi::reader::Filesystem;

static SCHEDULER: IrqCell<Scheduler<'static, IdentityPhysMapper>> =
    IrqCell::new(Scheduler::new(&MAPPER));

static INITRD: SyncOnceCell<Filesystem<'static>> = SyncOnceCell::new();

static FUNCS: SyncOnceCell<FuncTable<'static>> = SyncOnceCell::new();

/// Mount the initial ramdisk and pick up the `.funcs` symbol table, if any.
pub fn mount_initrd(image: &'static [u8]) -> Result<&'static Filesystem<'static>, VfsError> {
    let fs = Filesystem::parse(image)?;
    let label = fs.header().label();
    info!(
        "initrd \"{}\": {} bytes",
        core::str::from_utf8(label).unwrap_or("?"),
        image.len()
    );
    if let Some(data) = fs
        .find_entry(b".funcs")
        .and_then(|entry| fs.file_content(entry, true))
    {
        if FUNCS.set(FuncTable::new(data)).is_ok() {
            info!("kernel symbols loaded ({} bytes)", data.len());
        } else {
            warn!("kernel symbols already loaded, ignoring the new table");
        }
    }
    Ok(INITRD.get_or_init(|| fs))
}

pub fn initrd() -> Option<&'static Filesystem<'static>> {
    INITRD.get()
}

pub fn symbols() -> Option<&'static FuncTable<'static>> {
    FUNCS.get()
}

/// Adopt the boot thread as PID 0.
pub fn spawn_init(stack_top: u32, stack_size: u32, directory: PhysicalAddress) -> Result<Pid, VfsError> {
    let root = initrd().map_or(Ok(0), |fs| fs.root().map(|e| e.offset))?;
    Ok(SCHEDULER.with(|s| s.spawn_init(stack_top, stack_size, directory, root)))
}

/// Put the current process at the back of the ready queue and run the next.
pub fn yield_now() {
    SCHEDULER.with(|s| s.switch_task(&mut Cpu, &mut Frames, true));
}

/// Timer preemption; identical to a yield, issued from IRQ 0.
pub fn preempt() {
    yield_now();
}

/// Terminate the current process. Returns only for `init`.
pub fn exit(code: i32) {
    SCHEDULER.with(|s| s.task_exit(&mut Cpu, code));
}

pub fn set_syscall_frame(addr: u32) {
    SCHEDULER.with(|s| {
        if let Some(p) = s.current_mut() {
            p.syscall_frame = addr;
        }
    });
}

/// Run `path` from the initrd in a new process.
///
/// In the parent this returns the child's PID once the child has had the
/// CPU; the child never returns from here.
pub fn system(path: &str, argv: &[&str]) -> Result<Pid, ProcError> {
    let fs = initrd().ok_or(ProcError::NotFound)?;
    let outcome = SCHEDULER.with(|s| s.system(&mut Cpu, &mut Frames, fs, path, argv))?;
    match outcome {
        SystemOutcome::Parent(child) => Ok(child),
        SystemOutcome::Child(entry) => {
            // `enter_userspace` does not return on hardware.
            warn!("{path}: returned from user entry {:#010x}", entry.entry);
            exit(-1);
            Ok(Pid::INIT)
        }
    }
}

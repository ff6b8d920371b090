//! The first user program. The kernel `exec`s it from `init` after boot.

#![no_std]
#![no_main]
#![allow(unsafe_code)]

use core::ffi::{CStr, c_char};
use stdlib::{println, syscall};

/// Entry from the kernel: `argc` at `[esp]`, `argv` at `[esp + 4]`, no
/// return address.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub extern "C" fn _start() -> ! {
    core::arch::naked_asm!(
        "xor ebp, ebp",
        "mov eax, [esp]",
        "mov ecx, [esp + 4]",
        "push ecx",
        "push eax",
        "call {main}",
        "ud2",
        main = sym main,
    );
}

extern "C" fn main(argc: u32, argv: *const *const c_char) -> ! {
    let name = (argc > 0 && !argv.is_null())
        .then(|| unsafe { *argv })
        .filter(|p| !p.is_null())
        .map_or(c"init", |p| unsafe { CStr::from_ptr(p) });

    println!("Hello from {}!", name.to_str().unwrap_or("init"));
    syscall::print(c"init: yielding to the kernel\n");

    let mut rounds = 0u32;
    loop {
        syscall::sched_yield();
        rounds = rounds.wrapping_add(1);
        if rounds % 1000 == 0 {
            println!("init: still alive after {rounds} yields");
        }
    }
}

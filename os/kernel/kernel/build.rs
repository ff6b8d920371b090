use kernel_info::memory;
use std::{env, path::PathBuf};

fn main() {
    // Point to the linker script
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let ld = manifest_dir.join("kernel.ld");

    // Sanity checks (fail fast during build)
    let phys_load = memory::PHYS_LOAD;
    assert_eq!(
        phys_load & (memory::PAGE_SIZE - 1),
        0,
        "PHYS_LOAD must be page aligned (got {phys_load:#x})"
    );
    assert!(
        phys_load < memory::IDENTITY_MAP_END,
        "the kernel image must lie inside the identity map"
    );

    // Rebuild when inputs change
    println!("cargo:rerun-if-changed={}", ld.display());
    println!("cargo:rerun-if-changed=i686-kernel.json");

    // Linker script
    println!("cargo:rustc-link-arg-bins=-T{}", ld.display());

    // Provide symbols to the linker script
    // (cargo:rustc-link-arg-bins passes args directly to the linker)
    println!("cargo:rustc-link-arg-bins=--defsym=PHYS_LOAD={phys_load:#x}");
}

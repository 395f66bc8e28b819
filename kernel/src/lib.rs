//! Ferrite memory management core
//!
//! Physical frame allocator, 32-bit paging engine, address-space lifecycle,
//! page-fault dispatcher, and the bootstrap sequence that brings them up
//! from bootloader state. Everything outside this core (entry glue, the
//! rest of the IDT/GDT, the scheduler, the region allocator, and the
//! general-purpose heap) is an external collaborator this crate only
//! exposes a trait or extern-fn surface for.

#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

// Hosted builds (`cargo test` on a non-bare-metal target) link std purely
// so the bitmap/PTE/classification logic can be exercised with plain
// `#[test]`s; the assembly-gated paths stay behind `cfg(target_arch = "x86")`
// and are simply not reachable there.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(all(not(target_os = "none"), feature = "alloc"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod serial;

pub mod arch;
pub mod error;
pub mod logging;
pub mod mm;
pub mod raii;

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("{}", info);
    arch::x86::halt()
}

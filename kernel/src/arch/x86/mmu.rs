//! 32-bit protected-mode paging control: CR2/CR3/CR4 access and `invlpg`.
//!
//! Mirrors the teacher's `arch::x86_64::mmu` asm-wrapper style, narrowed to
//! 32-bit registers (no PAE, no long mode) since spec.md's page directory
//! is a flat 1024-entry table addressed by a 32-bit physical frame base.

/// Read CR2 (the faulting address left by the last page fault).
#[cfg(target_arch = "x86")]
pub fn read_cr2() -> u32 {
    let cr2: u32;
    // SAFETY: reading CR2 is a privileged, side-effect-free operation.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
    }
    cr2
}

#[cfg(not(target_arch = "x86"))]
pub fn read_cr2() -> u32 {
    0
}

/// Read CR3 (the physical address of the active page directory).
#[cfg(target_arch = "x86")]
pub fn read_cr3() -> u32 {
    let cr3: u32;
    // SAFETY: reading CR3 is a privileged, side-effect-free operation.
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
    }
    cr3
}

#[cfg(not(target_arch = "x86"))]
pub fn read_cr3() -> u32 {
    0
}

/// Write CR3, switching the active page directory and flushing the TLB
/// (CR3 writes always flush all non-global entries).
///
/// # Safety
///
/// `pd_phys_addr` must be the physical address of a page directory that
/// satisfies invariants P1-P4 (self-mirrored, no 4 MiB PDEs); otherwise
/// the next memory access may fault or read/write the wrong physical
/// memory entirely.
#[cfg(target_arch = "x86")]
pub unsafe fn write_cr3(pd_phys_addr: u32) {
    // SAFETY: forwarded from the caller's safety contract.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) pd_phys_addr, options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "x86"))]
pub unsafe fn write_cr3(_pd_phys_addr: u32) {}

/// Clear CR4.PSE (bit 4), globally disabling 4 MiB pages (spec.md P4,
/// bootstrap step 7).
#[cfg(target_arch = "x86")]
pub fn clear_cr4_pse() {
    // SAFETY: CR4 is read back and written with only bit 4 cleared; no
    // other control bits are disturbed.
    unsafe {
        let mut cr4: u32;
        core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        cr4 &= !(1 << 4);
        core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "x86"))]
pub fn clear_cr4_pse() {}

/// Invalidate the TLB entry covering `vaddr`.
#[cfg(target_arch = "x86")]
pub fn invlpg(vaddr: u32) {
    // SAFETY: invlpg only invalidates a cached translation; it never
    // reads or writes the target memory.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "x86"))]
pub fn invlpg(_vaddr: u32) {}

bitflags::bitflags! {
    /// Error code the CPU pushes for a vector-14 page fault, decoded per
    /// the Intel SDM's layout (low nibble; bits above 4 are reserved).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u32 {
        /// Set if the fault was a protection violation; clear if it was
        /// caused by a not-present page.
        const PROTECTION_VIOLATION = 1 << 0;
        /// Set if the faulting access was a write.
        const CAUSED_BY_WRITE = 1 << 1;
        /// Set if the faulting access happened in user mode.
        const USER_MODE = 1 << 2;
        /// Set if a reserved PDE/PTE bit was set to 1.
        const MALFORMED_TABLE = 1 << 3;
        /// Set if the fault was caused by an instruction fetch (requires NX).
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

//! Memory management core.
//!
//! Owns physical frame accounting, the 32-bit page-table format, address
//! space lifecycle, and the page-fault dispatcher. Everything here
//! assumes a flat 4 GiB address space split at [`K_HIGHHALF_ADDR`], a
//! single statically-known kernel half, and no PAE.

#![allow(dead_code)]

#[cfg(feature = "alloc")]
pub mod address_space;
pub mod bootstrap;
pub mod frame_allocator;
pub mod page_fault;
pub mod page_table;

/// Serializes tests that touch this crate's global statics (`FRAME_ALLOCATOR`,
/// `CURRENT`, `KERNEL_PD`/`KERNEL_PT0`, the simulated mirror window in
/// `page_table`). Cargo runs `#[test]`s on multiple threads in one process
/// by default, and none of those statics are otherwise synchronized across
/// independent test bodies.
#[cfg(test)]
pub(crate) static GLOBAL_TEST_LOCK: spin::Mutex<()> = spin::Mutex::new(());

/// Bytes per page (and per page-table-mapped unit).
pub const PAGE_SIZE: u32 = 4096;
/// log2(PAGE_SIZE); shifting a virtual address right by this yields a
/// frame/page index.
pub const PAGE_SHIFT: u32 = 12;
/// Entries in one page table or the page directory.
pub const N_PAGES_IN_PT: u32 = 1024;
/// log2(N_PAGES_IN_PT); shifting a virtual address right by
/// `PAGE_SHIFT + PT_SHIFT` yields its page-directory index.
pub const PT_SHIFT: u32 = 10;
/// Start of the higher half: the kernel lives at and above this address
/// in every address space.
pub const K_HIGHHALF_ADDR: u32 = 0xC000_0000;
/// Page-directory index of the first kernel-half entry
/// (`K_HIGHHALF_ADDR >> 22`).
pub const FIRST_KERNEL_PT: u32 = 768;
/// Virtual address of the self-referential mirror window: PDE 1023 points
/// back at the active page directory's own frame, so the active PD/PTs
/// are reachable at this address without a temporary mapping.
pub const PD_MIRROR_ADDR: u32 = 0xFFC0_0000;

/// A physical frame number (address / [`PAGE_SIZE`]), not a byte address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl FrameId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_phys_addr(self) -> u32 {
        self.0 * PAGE_SIZE
    }
}

/// A physical byte address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u32);

impl PhysicalAddress {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn frame_id(self) -> FrameId {
        FrameId(self.0 / PAGE_SIZE)
    }
}

/// A virtual byte address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u32);

impl VirtualAddress {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Index into the active page directory (top 10 bits).
    pub const fn pd_index(self) -> usize {
        (self.0 >> (PAGE_SHIFT + PT_SHIFT)) as usize
    }

    /// Index into the page table this address falls in (middle 10 bits).
    pub const fn pt_index(self) -> usize {
        ((self.0 >> PAGE_SHIFT) % N_PAGES_IN_PT) as usize
    }

    pub const fn is_kernel_half(self) -> bool {
        self.0 >= K_HIGHHALF_ADDR
    }

    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn page_align_up(self) -> Self {
        Self((self.0 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1))
    }
}

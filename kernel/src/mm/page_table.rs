//! 32-bit page directory / page table format and the mirror-mapped
//! editing protocol.
//!
//! A page directory entry (PDE) and a page table entry (PTE) share the
//! same 32-bit layout: bits 12-31 are a frame number, bits 0-11 are
//! flags. The active page directory is always reachable through the
//! self-referential mirror at [`super::PD_MIRROR_ADDR`] (PDE 1023 points
//! at the PD's own frame), so editing the *active* address space never
//! needs a temporary mapping; editing an inactive one does (see
//! `address_space`).

#![allow(dead_code)]

use super::{FrameId, VirtualAddress, N_PAGES_IN_PT, PAGE_SHIFT, PD_MIRROR_ADDR};
use crate::arch::x86::mmu::invlpg;
use crate::error::MmResult;
use crate::mm::frame_allocator;

/// Guards the "PDE absent -> allocate a page table frame -> install it"
/// sequence in [`ActivePageDirectory::map_page`]. At most one page
/// directory is ever reachable through the mirror at a time (whichever
/// one CR3 names), so a single lock here has the same effect as a lock
/// per [`super::address_space::AddressSpace`] would: it serializes two
/// threads racing to fill in the same absent PDE, which would otherwise
/// both allocate a page table frame and have one install silently lost.
static STRUCTURE_LOCK: spin::Mutex<()> = spin::Mutex::new(());

bitflags::bitflags! {
    /// Flag bits shared by PDEs and PTEs; `DIRTY` and `SIZE_4M` only make
    /// sense on one or the other but there's no harm in defining them
    /// together.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageTableFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const DISABLE_CACHE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const SIZE_4M       = 1 << 7;
        const GLOBAL        = 1 << 8;
    }
}

const FRAME_SHIFT: u32 = PAGE_SHIFT;

fn encode(frame: FrameId, flags: PageTableFlags) -> u32 {
    (frame.0 << FRAME_SHIFT) | flags.bits()
}

fn decode_frame(entry: u32) -> FrameId {
    FrameId::new(entry >> FRAME_SHIFT)
}

fn is_present(entry: u32) -> bool {
    entry & PageTableFlags::PRESENT.bits() != 0
}

/// A handle onto the *currently active* page directory, reached through
/// the mirror window. There is exactly one of these meaningfully alive
/// at a time (whichever address space is loaded in CR3); it carries no
/// state of its own.
pub struct ActivePageDirectory;

/// Backing store for the mirror window in hosted test builds. The real
/// mirror at [`PD_MIRROR_ADDR`] only exists once paging hardware is live;
/// a hosted `cargo test` process has no such mapping, so tests that
/// exercise `ActivePageDirectory` read and write this static instead,
/// laid out exactly like the real window (the PD's own 1024 words at
/// `pt_index == N_PAGES_IN_PT - 1`, each page table's 1024 words at its
/// own `pt_index`).
#[cfg(test)]
static mut TEST_MIRROR: [u32; (N_PAGES_IN_PT * N_PAGES_IN_PT) as usize] =
    [0; (N_PAGES_IN_PT * N_PAGES_IN_PT) as usize];

impl ActivePageDirectory {
    #[cfg(not(test))]
    fn pd_ptr() -> *mut u32 {
        (PD_MIRROR_ADDR + (N_PAGES_IN_PT - 1) * super::PAGE_SIZE) as *mut u32
    }

    #[cfg(not(test))]
    fn pt_ptr(pt_index: usize) -> *mut u32 {
        (PD_MIRROR_ADDR + (pt_index as u32) * super::PAGE_SIZE) as *mut u32
    }

    #[cfg(test)]
    fn pd_ptr() -> *mut u32 {
        Self::pt_ptr(N_PAGES_IN_PT as usize - 1)
    }

    #[cfg(test)]
    fn pt_ptr(pt_index: usize) -> *mut u32 {
        // SAFETY: `pt_index` is always an index into a page directory
        // (`< N_PAGES_IN_PT`), so `pt_index * N_PAGES_IN_PT` stays within
        // `TEST_MIRROR`'s bounds; callers serialize access to this static
        // through `super::super::GLOBAL_TEST_LOCK`.
        unsafe {
            core::ptr::addr_of_mut!(TEST_MIRROR)
                .cast::<u32>()
                .add(pt_index * N_PAGES_IN_PT as usize)
        }
    }

    fn pde(pd_index: usize) -> u32 {
        // SAFETY: the mirror window is always valid while a page
        // directory is active; reading a PDE has no side effects.
        unsafe { Self::pd_ptr().add(pd_index).read_volatile() }
    }

    fn set_pde(pd_index: usize, value: u32) {
        // SAFETY: writing through the mirror window is exactly how this
        // address space's own page directory is meant to be edited.
        unsafe { Self::pd_ptr().add(pd_index).write_volatile(value) };
    }

    fn pte(pd_index: usize, pt_index: usize) -> u32 {
        // SAFETY: only called once `pde(pd_index)` is known present, so
        // the corresponding page table is mapped at this mirror slot.
        unsafe { Self::pt_ptr(pd_index).add(pt_index).read_volatile() }
    }

    fn set_pte(pd_index: usize, pt_index: usize, value: u32) {
        // SAFETY: see `pte`.
        unsafe { Self::pt_ptr(pd_index).add(pt_index).write_volatile(value) };
    }

    /// Look up the frame mapped at `vaddr`, if any.
    pub fn get_frame(vaddr: VirtualAddress) -> Option<FrameId> {
        let pd_index = vaddr.pd_index();
        if !is_present(Self::pde(pd_index)) {
            return None;
        }
        let entry = Self::pte(pd_index, vaddr.pt_index());
        is_present(entry).then(|| decode_frame(entry))
    }

    /// Map `vaddr` to `frame`, allocating a new page table frame if the
    /// covering PDE is absent. `vaddr` must not fall in the mirror
    /// window itself (mapping over PDE 1023 would break the mirror
    /// invariant for the rest of the address space's lifetime).
    pub fn map_page(
        vaddr: VirtualAddress,
        frame: FrameId,
        writable: bool,
    ) -> MmResult<()> {
        assert!(
            vaddr.as_u32() < PD_MIRROR_ADDR,
            "refusing to map into the mirror window"
        );

        let pd_index = vaddr.pd_index();
        let pt_index = vaddr.pt_index();

        {
            let _structure_lock = STRUCTURE_LOCK.lock();
            if !is_present(Self::pde(pd_index)) {
                let pt_frame = frame_allocator::alloc_frames(1)?;
                Self::set_pde(
                    pd_index,
                    encode(pt_frame, PageTableFlags::PRESENT | PageTableFlags::WRITABLE),
                );
                invlpg(Self::pt_ptr(pd_index) as u32);
            }
        }

        let mut flags = PageTableFlags::PRESENT;
        flags |= if vaddr.is_kernel_half() {
            PageTableFlags::GLOBAL
        } else {
            PageTableFlags::USER
        };
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        Self::set_pte(pd_index, pt_index, encode(frame, flags));
        invlpg(vaddr.as_u32());
        Ok(())
    }

    /// Clear the mapping at `vaddr`. The underlying page table frame is
    /// never reclaimed here: checking whether it's fully empty would
    /// cost a full scan for a case that's rare in practice.
    pub fn unmap_page(vaddr: VirtualAddress) {
        let pd_index = vaddr.pd_index();
        if !is_present(Self::pde(pd_index)) {
            return;
        }
        let pt_index = vaddr.pt_index();
        if !is_present(Self::pte(pd_index, pt_index)) {
            return;
        }
        Self::set_pte(pd_index, pt_index, 0);
        invlpg(vaddr.as_u32());
    }

    /// Raw PDE accessor used by address-space creation/teardown to copy
    /// or snapshot kernel-half entries wholesale.
    pub fn raw_pde(pd_index: usize) -> u32 {
        Self::pde(pd_index)
    }

    pub fn set_raw_pde(pd_index: usize, value: u32) {
        Self::set_pde(pd_index, value);
    }
}

/// Switch the active page directory. `phys_addr` must be the physical
/// address of a page directory satisfying the mirror invariant.
pub fn switch_pagedir(phys_addr: u32) {
    // SAFETY: forwarded from the caller's contract that `phys_addr`
    // names a well-formed, self-mirrored page directory.
    unsafe { crate::arch::x86::mmu::write_cr3(phys_addr) };
}

pub fn build_pte(frame: FrameId, flags: PageTableFlags) -> u32 {
    encode(frame, flags)
}

pub fn pte_frame(entry: u32) -> FrameId {
    decode_frame(entry)
}

pub fn pte_present(entry: u32) -> bool {
    is_present(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let frame = FrameId::new(0x1234);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER;
        let entry = build_pte(frame, flags);
        assert!(pte_present(entry));
        assert_eq!(pte_frame(entry), frame);
        assert_eq!(entry & 0xFFF, flags.bits());
    }

    #[test]
    fn absent_entry_is_not_present() {
        assert!(!pte_present(0));
    }

    #[test]
    fn virtual_address_index_math() {
        // FIRST_KERNEL_PT * 4MiB is the first byte of the kernel half.
        let vaddr = VirtualAddress::new(super::super::K_HIGHHALF_ADDR);
        assert_eq!(vaddr.pd_index(), super::super::FIRST_KERNEL_PT as usize);
        assert_eq!(vaddr.pt_index(), 0);
        assert!(vaddr.is_kernel_half());
    }

    #[test]
    fn mirror_window_index_is_last_pde() {
        let vaddr = VirtualAddress::new(PD_MIRROR_ADDR);
        assert_eq!(vaddr.pd_index(), (N_PAGES_IN_PT - 1) as usize);
    }

    #[test]
    fn map_then_get_then_unmap_round_trips() {
        let _guard = super::super::GLOBAL_TEST_LOCK.lock();
        frame_allocator::install(frame_allocator::test_allocator(64));

        // pd_index 5: distinct from every other test's index so this test
        // is safe to run in any order relative to the others sharing
        // `TEST_MIRROR`.
        let vaddr = VirtualAddress::new(5 * 0x0040_0000 + 0x3000);
        let frame = FrameId::new(9);

        ActivePageDirectory::map_page(vaddr, frame, true).unwrap();
        assert_eq!(ActivePageDirectory::get_frame(vaddr), Some(frame));

        ActivePageDirectory::unmap_page(vaddr);
        assert_eq!(ActivePageDirectory::get_frame(vaddr), None);
    }

    #[test]
    fn two_pages_sharing_a_pde_allocate_exactly_one_page_table() {
        let _guard = super::super::GLOBAL_TEST_LOCK.lock();
        frame_allocator::install(frame_allocator::test_allocator(64));

        // pd_index 6, two different pt_indexes within it.
        let first = VirtualAddress::new(6 * 0x0040_0000 + 0x1000);
        let second = VirtualAddress::new(6 * 0x0040_0000 + 0x2000);

        let before = frame_allocator::stats().unwrap().used_frames;
        ActivePageDirectory::map_page(first, FrameId::new(1), true).unwrap();
        let after_first = frame_allocator::stats().unwrap().used_frames;
        assert_eq!(after_first, before + 1, "first map allocates the page table");

        ActivePageDirectory::map_page(second, FrameId::new(2), true).unwrap();
        let after_second = frame_allocator::stats().unwrap().used_frames;
        assert_eq!(
            after_second, after_first,
            "second map reuses the already-present PDE's page table"
        );
    }
}

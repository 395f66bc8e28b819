//! Bootstrap sequence: turn bootloader-provided memory info and the
//! minimal paging the entry glue set up into a working frame allocator,
//! a proper kernel page table (replacing the large-page identity map the
//! glue used to get here), and an installed page-fault dispatcher.
//!
//! This module owns the canonical kernel page directory and its first
//! page table as plain statics. The contract with whatever thin entry
//! glue calls into this crate: before calling [`init`], CR3 must already
//! point at [`KERNEL_PD`]'s physical frame, with PDE 768 mapping the
//! kernel's first 4 MiB as a single large page and PDE 1023 set up as
//! the self-mirror. [`init`] replaces the large-page PDE with one built
//! from [`KERNEL_PT0`], after which large pages are disabled entirely.

#![allow(dead_code)]

use super::frame_allocator::FrameAllocator;
use super::page_table::PageTableFlags;
use super::{
    FrameId, VirtualAddress, FIRST_KERNEL_PT, K_HIGHHALF_ADDR, N_PAGES_IN_PT, PAGE_SIZE,
};
use crate::arch::x86::idt;
use crate::arch::x86::mmu::{clear_cr4_pse, invlpg};
use crate::error::MmResult;
use crate::mm::{frame_allocator, page_fault};

/// Bootloader-provided memory map and layout facts, gathered by the
/// entry glue from the multiboot info structure before calling [`init`].
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    pub mem_upper_kib: u32,
    pub mem_lower_kib: u32,
    /// First virtual address past the kernel image and any bump-allocated
    /// data the entry glue reserved ahead of time. Must fall within the
    /// already-mapped first 4 MiB and be 4-byte aligned.
    pub kernel_data_end: u32,
    /// Address of the unmapped guard page directly below the boot stack.
    pub kernel_stack_guard: VirtualAddress,
}

#[repr(C, align(4096))]
struct PageDirStorage([u32; N_PAGES_IN_PT as usize]);

#[repr(C, align(4096))]
struct PageTableStorage([u32; N_PAGES_IN_PT as usize]);

/// The canonical kernel page directory. Entries 768..1022 are shared
/// (copied, not re-derived) into every user address space at creation
/// time; entry 1023 is the self-mirror.
static mut KERNEL_PD: PageDirStorage = PageDirStorage([0; N_PAGES_IN_PT as usize]);

/// Backing page table for the kernel's first 4 MiB (PDE 768).
static mut KERNEL_PT0: PageTableStorage = PageTableStorage([0; N_PAGES_IN_PT as usize]);

/// Read one entry of the canonical kernel page directory. Used by the
/// page-fault dispatcher to compare a stale user-half copy against the
/// source of truth, and by address-space creation to seed new PDs.
pub fn kernel_pde(pd_index: usize) -> u32 {
    // SAFETY: reads are racy only with `init`'s one-time setup, which
    // happens-before any fault or address-space creation can occur.
    unsafe { KERNEL_PD.0[pd_index] }
}

pub(crate) fn set_kernel_pde(pd_index: usize, value: u32) {
    // SAFETY: see `kernel_pde`; `init` is the only writer, and it is
    // documented as single-shot.
    unsafe { KERNEL_PD.0[pd_index] = value };
}

fn kernel_pd_phys() -> u32 {
    // SAFETY: taking the address of a static does not read its contents.
    let vaddr = unsafe { core::ptr::addr_of!(KERNEL_PD) } as u32;
    vaddr - K_HIGHHALF_ADDR
}

fn kernel_pt0_phys() -> u32 {
    // SAFETY: taking the address of a static does not read its contents.
    let vaddr = unsafe { core::ptr::addr_of!(KERNEL_PT0) } as u32;
    vaddr - K_HIGHHALF_ADDR
}

/// RAM size in KiB, rounded down to a frame-bitmap word boundary (see
/// `frame_allocator`'s note on the trailing partial word never being
/// scanned), expressed as a frame count.
fn total_frames_for(mem_upper_kib: u32, mem_lower_kib: u32) -> u32 {
    let total_ram_bytes = (mem_upper_kib + mem_lower_kib) * 1024;
    let total_frames = total_ram_bytes / PAGE_SIZE;
    total_frames - (total_frames % 32)
}

/// Bring the memory management core up from bootloader state. Must run
/// exactly once, before any other function in this crate is called.
///
/// 1. Derive total RAM from the multiboot upper/lower memory fields.
/// 2. Bump-allocate the frame bitmap right after the kernel image and
///    mark every frame up to and including it used.
/// 3. Rebuild PDE 768 from a proper page table instead of the glue's
///    temporary large page, carving out the stack guard page.
/// 4. Reinforce the self-mirror at PDE 1023.
/// 5. Flush the stale large-page TLB entry and disable large pages.
/// 6. Install the page-fault dispatcher and record the stack guard.
///
/// Returns the new bump pointer for whatever sets up the heap next.
pub fn init(boot_info: BootInfo) -> MmResult<u32> {
    crate::logging::init(log::LevelFilter::Info);

    log::info!(
        "RAM: {} KiB upper, {} KiB lower",
        boot_info.mem_upper_kib, boot_info.mem_lower_kib
    );
    let total_frames = total_frames_for(boot_info.mem_upper_kib, boot_info.mem_lower_kib);
    let bitmap_words = (total_frames / 32) as usize;

    let bitmap_ptr = boot_info.kernel_data_end as *mut u32;
    // SAFETY: the entry glue's contract guarantees `kernel_data_end` is
    // mapped, writable, and has room for `bitmap_words` more words ahead
    // of it within the identity-mapped first 4 MiB.
    let bitmap: &'static mut [u32] = unsafe {
        let slice = core::slice::from_raw_parts_mut(bitmap_ptr, bitmap_words);
        slice.fill(0);
        slice
    };

    init_with_bitmap(boot_info, total_frames, bitmap)
}

/// The testable core of [`init`]: everything past bump-allocating the
/// bitmap itself, which on real hardware requires conjuring a
/// `&'static mut` out of a bootloader-supplied address and so can't be
/// exercised on a hosted test target.
fn init_with_bitmap(
    boot_info: BootInfo,
    total_frames: u32,
    bitmap: &'static mut [u32],
) -> MmResult<u32> {
    log::debug!(
        "kernel_data_end = {:#x}, frame bitmap: {} frames, {} words",
        boot_info.kernel_data_end, total_frames, bitmap.len()
    );
    let bitmap_end = boot_info.kernel_data_end + (bitmap.len() as u32) * 4;

    let mut allocator = FrameAllocator::new(bitmap, total_frames);

    let kernel_data_end = VirtualAddress::new(bitmap_end);
    let n_kernel_pages = (kernel_data_end.page_align_up().as_u32() - K_HIGHHALF_ADDR) / PAGE_SIZE;
    assert!(
        n_kernel_pages <= N_PAGES_IN_PT,
        "kernel image plus frame bitmap exceeds 4 MiB"
    );

    for frame in 0..n_kernel_pages {
        allocator.mark_used(frame);
    }
    allocator.set_search_cursor(n_kernel_pages);

    let guard_frame = if boot_info.kernel_stack_guard.as_u32() >= K_HIGHHALF_ADDR
        && boot_info.kernel_stack_guard.as_u32() < K_HIGHHALF_ADDR + n_kernel_pages * PAGE_SIZE
    {
        Some((boot_info.kernel_stack_guard.as_u32() - K_HIGHHALF_ADDR) / PAGE_SIZE)
    } else {
        None
    };

    if let Some(frame) = guard_frame {
        allocator.free(FrameId::new(frame), 1);
    }

    frame_allocator::install(allocator);

    // SAFETY: KERNEL_PT0 is this crate's own static, already mapped by
    // the entry glue's identity map; no concurrent access is possible
    // this early.
    unsafe {
        for i in 0..n_kernel_pages {
            if Some(i) == guard_frame {
                KERNEL_PT0.0[i as usize] = 0;
            } else {
                KERNEL_PT0.0[i as usize] =
                    (i << 12) | (PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL).bits();
            }
        }
        for i in n_kernel_pages..N_PAGES_IN_PT {
            KERNEL_PT0.0[i as usize] = 0;
        }
    }

    set_kernel_pde(
        FIRST_KERNEL_PT as usize,
        kernel_pt0_phys() | (PageTableFlags::PRESENT | PageTableFlags::WRITABLE).bits(),
    );
    set_kernel_pde(
        (N_PAGES_IN_PT - 1) as usize,
        kernel_pd_phys() | (PageTableFlags::PRESENT | PageTableFlags::WRITABLE).bits(),
    );

    invlpg(K_HIGHHALF_ADDR);
    clear_cr4_pse();

    page_fault::set_kernel_stack_guard(boot_info.kernel_stack_guard);
    idt::install_page_fault_handler();

    log::info!(
        "paging reinitialized: {} kernel pages reserved, large pages disabled",
        n_kernel_pages
    );

    Ok(bitmap_end)
}

/// Physical address of the canonical kernel page directory, for
/// `address_space` to compare against and switch back to.
pub fn kernel_pd_phys_addr() -> u32 {
    kernel_pd_phys()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_frames_rounds_down_to_word_boundary() {
        // 1 MiB of RAM = 256 frames, already a multiple of 32.
        let total_ram_bytes: u32 = 1024 * 1024;
        let frames = total_ram_bytes / PAGE_SIZE;
        assert_eq!(frames % 32, 0);

        // A size that leaves a partial trailing word.
        let odd_frames: u32 = 257;
        assert_eq!(odd_frames - (odd_frames % 32), 256);
    }

    #[test]
    fn kernel_pt0_entry_layout_matches_frame_number() {
        let frame = 5u32;
        let entry = (frame << 12) | PageTableFlags::PRESENT.bits();
        assert_eq!(entry >> 12, frame);
    }

    #[test]
    fn init_reserves_kernel_frames_and_frame_zero() {
        let _guard = crate::mm::GLOBAL_TEST_LOCK.lock();

        // 8 MiB of RAM, kernel_data_end 8 KiB into the kernel half: rounds
        // to 3 reserved pages, comfortably under N_PAGES_IN_PT. The stack
        // guard sits 16 MiB in, well past those 3 pages, so it never
        // collides with the carve-out this test isn't checking.
        let boot_info = BootInfo {
            mem_upper_kib: 8192,
            mem_lower_kib: 0,
            kernel_data_end: K_HIGHHALF_ADDR + 0x2000,
            kernel_stack_guard: VirtualAddress::new(K_HIGHHALF_ADDR + 0x0100_0000),
        };

        let total_frames = total_frames_for(boot_info.mem_upper_kib, boot_info.mem_lower_kib);
        assert_eq!(total_frames, 2048);

        let words = (total_frames / 32) as usize;
        let bitmap: &'static mut [u32] =
            alloc::boxed::Box::leak(alloc::vec![0u32; words].into_boxed_slice());

        let bitmap_end = init_with_bitmap(boot_info, total_frames, bitmap).unwrap();
        assert_eq!(bitmap_end, boot_info.kernel_data_end + (words as u32) * 4);

        let stats = frame_allocator::stats().unwrap();
        assert_eq!(
            stats.used_frames, 3,
            "frame 0 and the rest of the kernel image's pages are reserved"
        );

        let pde = kernel_pde(FIRST_KERNEL_PT as usize);
        assert_eq!(pde & PageTableFlags::PRESENT.bits(), PageTableFlags::PRESENT.bits());
        assert_eq!(pde & !0xFFF, kernel_pt0_phys());
    }
}

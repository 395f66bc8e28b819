//! Page-fault classification and dispatch.
//!
//! The architecture trap handler ([`crate::arch::x86::idt`]) only ever
//! builds a [`PageFaultInfo`] and calls [`handle_page_fault`]; everything
//! about what the fault *means* lives here so it can be unit tested
//! without a real CPU trap.
//!
//! Classification is a fixed five-step ladder, each step either handling
//! the fault and returning or falling through to the next:
//!
//! 1. Lazy kernel page-table propagation: a non-kernel address space's
//!    PDE for the faulting kernel page table is stale relative to the
//!    canonical kernel page directory; copy it over and retry.
//! 2. Kernel stack guard: the fault landed on the unmapped guard page
//!    below the running kernel stack. Unrecoverable.
//! 3. Mirror window: the fault landed at or above
//!    [`super::PD_MIRROR_ADDR`] with no region backing it. Unrecoverable.
//! 4. Region lookup: ask the registered [`RegionAllocator`] for the
//!    region covering the address and let its handler resolve the fault,
//!    or panic if there is no region or no handler.
//! 5. User half: anything below [`super::K_HIGHHALF_ADDR`] reaches here
//!    only because user-space fault handling is out of scope; panic.

#![allow(dead_code)]

use spin::Once;

use super::page_table::ActivePageDirectory;
use super::{VirtualAddress, FIRST_KERNEL_PT, N_PAGES_IN_PT, PAGE_SIZE, PD_MIRROR_ADDR};
use crate::arch::x86::mmu::{invlpg, PageFaultErrorCode};

/// Everything the classification ladder needs about one fault.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    pub faulting_addr: u32,
    pub error_code: PageFaultErrorCode,
    /// Whether interrupts were enabled at the instant of the fault; step
    /// 2 onward re-enables them so the rest of the kernel stays
    /// preemptible while resolving the fault.
    pub interrupts_were_enabled: bool,
}

/// A region's own fault handler: given the faulting address and whether
/// the access was a write, resolve it (typically by mapping a frame in)
/// or report it can't be.
pub type RegionFaultHandler =
    fn(region: &RegionInfo, addr: VirtualAddress, write: bool) -> Result<(), crate::error::MmError>;

/// Description of one mapped virtual memory region, as tracked by
/// whatever allocator owns virtual address space layout above this
/// crate (out of scope here; see spec's region allocator).
#[derive(Debug, Clone, Copy)]
pub struct RegionInfo {
    pub start: VirtualAddress,
    pub size: u32,
    pub fault_handler: Option<RegionFaultHandler>,
}

/// Collaborator this crate calls into but does not implement: whatever
/// owns virtual memory region bookkeeping above the raw page tables.
pub trait RegionAllocator: Sync {
    fn find_region(&self, addr: VirtualAddress) -> Option<RegionInfo>;
}

static REGION_ALLOCATOR: Once<&'static dyn RegionAllocator> = Once::new();

/// Register the region allocator. Bootstrap calls this once; calling it
/// twice is a logic error and panics.
pub fn set_region_allocator(allocator: &'static dyn RegionAllocator) {
    let already_set = REGION_ALLOCATOR.is_completed();
    assert!(!already_set, "region allocator already registered");
    REGION_ALLOCATOR.call_once(|| allocator);
}

/// The page below the running kernel stack, left unmapped as a guard.
/// Bootstrap records it; `None` means the guard isn't installed yet
/// (only true very early, before any fault can legitimately occur here).
static KERNEL_STACK_GUARD: Once<VirtualAddress> = Once::new();

pub fn set_kernel_stack_guard(page: VirtualAddress) {
    KERNEL_STACK_GUARD.call_once(|| page);
}

fn in_kernel_stack_guard(addr: VirtualAddress) -> bool {
    match KERNEL_STACK_GUARD.get() {
        Some(&guard) => addr.as_u32() >= guard.as_u32() && addr.as_u32() < guard.as_u32() + PAGE_SIZE,
        None => false,
    }
}

/// Classify and resolve a page fault. Never returns for the panicking
/// branches; returns normally once the fault is resolved (lazy kernel
/// copy) or handed off to a region handler.
pub fn handle_page_fault(info: PageFaultInfo) {
    let addr = VirtualAddress::new(info.faulting_addr);

    // Step 1: lazy kernel half propagation. Runs with interrupts still
    // disabled, since it never blocks and must finish before anything
    // else observes the stale PDE.
    if addr.is_kernel_half() {
        let pd_index = addr.pd_index();
        let current = ActivePageDirectory::raw_pde(pd_index);
        let canonical = kernel_canonical_pde(pd_index);
        if current != canonical {
            ActivePageDirectory::set_raw_pde(pd_index, canonical);
            invlpg(mirror_pt_addr(pd_index));
            return;
        }
    }

    if info.interrupts_were_enabled {
        crate::arch::x86::enable_interrupts();
    }

    if addr.is_kernel_half() {
        if in_kernel_stack_guard(addr) {
            log::error!("kernel stack overflow at {:#x}", addr.as_u32());
            panic!("Kernel stack overflow.");
        }

        if addr.as_u32() >= PD_MIRROR_ADDR {
            log::error!("fault on access to mirrored PD at {:#x}", addr.as_u32());
            panic!("unhandled kernel space page fault: mirror window");
        }

        let region = REGION_ALLOCATOR
            .get()
            .and_then(|allocator| allocator.find_region(addr));
        match region {
            None => {
                log::error!("kernel pagefault in non-existing region at {:#x}", addr.as_u32());
                panic!("unhandled kernel space page fault");
            }
            Some(region) if region.fault_handler.is_none() => {
                log::error!("kernel pagefault in region with no handler at {:#x}", addr.as_u32());
                panic!("unhandled kernel space page fault");
            }
            Some(region) => {
                let write = info.error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
                let handler = region.fault_handler.expect("checked above");
                if handler(&region, addr, write).is_err() {
                    log::error!("region fault handler failed at {:#x}", addr.as_u32());
                    panic!("unhandled kernel space page fault");
                }
            }
        }
    } else {
        log::error!("userspace page fault at {:#x}", addr.as_u32());
        panic!("unhandled userspace page fault");
    }
}

/// Read the canonical kernel PDE for `pd_index` directly out of the
/// kernel page directory's own frame, bypassing the active mirror
/// (which, if we got here, may be a different, non-kernel, address
/// space).
fn kernel_canonical_pde(pd_index: usize) -> u32 {
    super::bootstrap::kernel_pde(pd_index)
}

fn mirror_pt_addr(pd_index: usize) -> u32 {
    PD_MIRROR_ADDR + (pd_index as u32) * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubRegionAllocator {
        region: Option<RegionInfo>,
    }

    impl RegionAllocator for StubRegionAllocator {
        fn find_region(&self, _addr: VirtualAddress) -> Option<RegionInfo> {
            self.region
        }
    }

    #[test]
    fn guard_page_range_is_exactly_one_page() {
        let guard = VirtualAddress::new(0xC010_0000);
        KERNEL_STACK_GUARD.call_once(|| guard);
        assert!(in_kernel_stack_guard(VirtualAddress::new(guard.as_u32())));
        assert!(in_kernel_stack_guard(VirtualAddress::new(
            guard.as_u32() + PAGE_SIZE - 1
        )));
        assert!(!in_kernel_stack_guard(VirtualAddress::new(
            guard.as_u32() + PAGE_SIZE
        )));
    }

    #[test]
    fn mirror_pt_addr_matches_pd_layout() {
        assert_eq!(mirror_pt_addr(0), PD_MIRROR_ADDR);
        assert_eq!(
            mirror_pt_addr(FIRST_KERNEL_PT as usize),
            PD_MIRROR_ADDR + FIRST_KERNEL_PT * PAGE_SIZE
        );
    }

    #[test]
    fn region_allocator_reports_missing_handler() {
        let allocator = StubRegionAllocator {
            region: Some(RegionInfo {
                start: VirtualAddress::new(0xD000_0000),
                size: PAGE_SIZE,
                fault_handler: None,
            }),
        };
        let region = allocator.find_region(VirtualAddress::new(0xD000_0000)).unwrap();
        assert!(region.fault_handler.is_none());
    }

    #[test]
    fn region_allocator_dispatches_to_registered_handler() {
        fn handler(_region: &RegionInfo, _addr: VirtualAddress, _write: bool) -> Result<(), crate::error::MmError> {
            Ok(())
        }
        let allocator = StubRegionAllocator {
            region: Some(RegionInfo {
                start: VirtualAddress::new(0xD000_0000),
                size: PAGE_SIZE,
                fault_handler: Some(handler),
            }),
        };
        let region = allocator.find_region(VirtualAddress::new(0xD000_0000)).unwrap();
        let f = region.fault_handler.unwrap();
        assert!(f(&region, VirtualAddress::new(0xD000_0000), false).is_ok());
    }

    #[test]
    fn last_pde_index_is_mirror_slot() {
        assert_eq!(N_PAGES_IN_PT - 1, 1023);
    }

    #[test]
    fn lazy_kernel_pde_propagates_on_fault() {
        let _guard = crate::mm::GLOBAL_TEST_LOCK.lock();

        // pd_index 800: inside the kernel half, distinct from every other
        // test sharing TEST_MIRROR, and far from FIRST_KERNEL_PT (768) so
        // it can't collide with any bootstrap-reserved entry.
        let pd_index = 800usize;
        let canonical = crate::mm::bootstrap::kernel_pde(pd_index);
        // Move the canonical entry somewhere the mirror (still whatever it
        // was left at, default zero) can't already agree with.
        crate::mm::bootstrap::set_kernel_pde(
            pd_index,
            canonical | crate::mm::page_table::PageTableFlags::PRESENT.bits(),
        );
        assert_ne!(
            ActivePageDirectory::raw_pde(pd_index),
            crate::mm::bootstrap::kernel_pde(pd_index)
        );

        let fault_addr = (pd_index as u32) * 0x0040_0000 + 0x10;
        handle_page_fault(PageFaultInfo {
            faulting_addr: fault_addr,
            error_code: PageFaultErrorCode::empty(),
            interrupts_were_enabled: false,
        });

        assert_eq!(
            ActivePageDirectory::raw_pde(pd_index),
            crate::mm::bootstrap::kernel_pde(pd_index),
            "fault should have copied the canonical PDE into the mirror"
        );
    }

    #[test]
    #[should_panic(expected = "Kernel stack overflow.")]
    fn kernel_stack_guard_panics() {
        let _guard = crate::mm::GLOBAL_TEST_LOCK.lock();

        // Reuses the exact guard address `guard_page_range_is_exactly_one_page`
        // installs: KERNEL_STACK_GUARD is a process-wide `Once`, so every
        // test that might run first must agree on the same value.
        let guard = VirtualAddress::new(0xC010_0000);
        KERNEL_STACK_GUARD.call_once(|| guard);

        // Make sure the mirror's PDE for the guard's page agrees with the
        // canonical kernel one, so step 1 of the ladder falls through
        // instead of looping back here.
        let pd_index = guard.pd_index();
        let canonical = kernel_canonical_pde(pd_index);
        ActivePageDirectory::set_raw_pde(pd_index, canonical);

        handle_page_fault(PageFaultInfo {
            faulting_addr: guard.as_u32(),
            error_code: PageFaultErrorCode::empty(),
            interrupts_were_enabled: false,
        });
    }
}

//! 32-bit protected-mode Interrupt Descriptor Table.
//!
//! Only vector 14 (page fault) is wired up here; the rest of the IDT
//! (timer, syscall gate, double fault) belongs to the outer kernel that
//! owns the scheduler and is out of scope for this crate. The gate format
//! is the legacy 8-byte descriptor, not the teacher's 16-byte long-mode
//! one, since there's no IST here.

use lazy_static::lazy_static;

use crate::mm::page_fault::{handle_page_fault, PageFaultInfo};

const GATE_COUNT: usize = 256;
const PAGE_FAULT_VECTOR: usize = 14;

/// Present, ring 0, 32-bit interrupt gate.
const INTERRUPT_GATE_32: u8 = 0x8E;
/// Code selector for ring 0 in the outer kernel's GDT. This crate does not
/// own the GDT; it assumes the conventional flat layout where the second
/// entry is the kernel code segment.
const KERNEL_CODE_SELECTOR: u16 = 0x08;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn new(handler: u32, selector: u16, type_attr: u8) -> Self {
        IdtEntry {
            offset_low: (handler & 0xFFFF) as u16,
            selector,
            zero: 0,
            type_attr,
            offset_high: (handler >> 16) as u16,
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

struct Idt([IdtEntry; GATE_COUNT]);

// SAFETY: the table is read-only after construction; `lidt` only ever
// reads it, it is never mutated concurrently.
unsafe impl Sync for Idt {}

lazy_static! {
    static ref IDT: Idt = {
        let mut entries = [IdtEntry::missing(); GATE_COUNT];
        entries[PAGE_FAULT_VECTOR] = IdtEntry::new(
            page_fault_stub as usize as u32,
            KERNEL_CODE_SELECTOR,
            INTERRUPT_GATE_32,
        );
        Idt(entries)
    };
}

/// Load the IDT and make vector 14 live. Idempotent; called once during
/// bootstrap (spec.md bootstrap step 8).
pub fn install_page_fault_handler() {
    let ptr = IdtPointer {
        limit: (core::mem::size_of::<[IdtEntry; GATE_COUNT]>() - 1) as u16,
        base: IDT.0.as_ptr() as u32,
    };
    #[cfg(target_arch = "x86")]
    // SAFETY: `ptr` describes the table built above, which lives for the
    // remainder of the program (`lazy_static` leaks it).
    unsafe {
        core::arch::asm!("lidt [{}]", in(reg) &ptr, options(readonly, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "x86"))]
    let _ = ptr;
}

/// Raw body invoked by the naked trampoline below, after general-purpose
/// registers are saved and the CPU-pushed error code is forwarded as an
/// argument. `extern "C"` so the naked stub's calling convention is fixed
/// and portable across codegen changes.
extern "C" fn page_fault_body(error_code: u32, eflags: u32) {
    const EFLAGS_IF: u32 = 1 << 9;
    let info = PageFaultInfo {
        faulting_addr: super::mmu::read_cr2(),
        error_code: super::mmu::PageFaultErrorCode::from_bits_truncate(error_code),
        interrupts_were_enabled: eflags & EFLAGS_IF != 0,
    };
    handle_page_fault(info);
}

/// Vector-14 entry point. The CPU pushes an error code for this vector
/// before transferring control, which ordinary `extern "C"` functions
/// don't expect, hence the naked trampoline: save registers, forward the
/// error code to Rust, restore, discard the error code, and `iret`.
#[cfg(target_arch = "x86")]
#[unsafe(naked)]
extern "C" fn page_fault_stub() {
    core::arch::naked_asm!(
        "pusha",
        "mov eax, [esp + 32]",
        "mov ecx, [esp + 44]",
        "push ecx",
        "push eax",
        "call {body}",
        "add esp, 8",
        "popa",
        "add esp, 4",
        "iretd",
        body = sym page_fault_body,
    );
}

#[cfg(not(target_arch = "x86"))]
extern "C" fn page_fault_stub() {}

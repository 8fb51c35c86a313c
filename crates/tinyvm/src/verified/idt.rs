//! Pure functions for IDT gate encoding and CPU exception metadata.
//!
//! # Gate layout (16 bytes)
//!
//! ```text
//!   0      2          4     5          6          8          12         16
//!   ┌──────┬──────────┬─────┬──────────┬──────────┬──────────┬──────────┐
//!   │off_1 │ selector │ ist │type_attr │  off_2   │  off_3   │   zero   │
//!   │[15:0]│          │     │          │ [31:16]  │ [63:32]  │          │
//!   └──────┴──────────┴─────┴──────────┴──────────┴──────────┴──────────┘
//! ```

use super::gdt::SEL_KERNEL_CODE;

/// Size of one IDT gate in bytes.
pub const IDT_GATE_SIZE: u64 = 16;

/// Gates in the table: 32 exception vectors plus the timer vector.
pub const IDT_ENTRIES: usize = 33;

/// Vector the execution timer is delivered on.
pub const TIMER_VECTOR: u8 = 32;

/// Page-fault vector.
pub const PAGE_FAULT_VECTOR: u8 = 14;

/// Debug vector.
pub const DEBUG_VECTOR: u8 = 1;

/// General protection fault vector.
pub const GPF_VECTOR: u8 = 13;

/// Highest hardware exception vector with a trampoline stub.
pub const LAST_HANDLED_VECTOR: u8 = 20;

/// Present, DPL 0, 64-bit interrupt gate.
pub const IDT_INTERRUPT_GATE: u8 = 0x8E;

/// Interrupt-stack-table slot every gate uses.
pub const IDT_IST_SLOT: u8 = 1;

/// Number of trampoline exception stubs: vectors 0..=20 (minus 15) plus
/// one trailing stub for the timer.
pub const EXCEPTION_STUBS: u64 = LAST_HANDLED_VECTOR as u64 + 2;

const _: () = assert!(IDT_ENTRIES as u64 * IDT_GATE_SIZE <= 4096);
const _: () = assert!((TIMER_VECTOR as usize) < IDT_ENTRIES);
const _: () = assert!(EXCEPTION_STUBS == 22);

/// One 64-bit interrupt gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdtGate {
    pub offset_1: u16,
    pub selector: u16,
    pub ist: u8,
    pub type_attr: u8,
    pub offset_2: u16,
    pub offset_3: u32,
    pub zero: u32,
}

impl IdtGate {
    /// Kernel interrupt gate for `handler` on IST slot 1.
    pub fn interrupt(handler: u64) -> Self {
        let gate = Self {
            offset_1: handler as u16,
            selector: SEL_KERNEL_CODE,
            ist: IDT_IST_SLOT,
            type_attr: IDT_INTERRUPT_GATE,
            offset_2: (handler >> 16) as u16,
            offset_3: (handler >> 32) as u32,
            zero: 0,
        };
        debug_assert_eq!(gate.handler(), handler, "IdtGate: handler must round-trip");
        gate
    }

    /// Reassemble the handler address from its three fields.
    pub fn handler(&self) -> u64 {
        u64::from(self.offset_1) | (u64::from(self.offset_2) << 16) | (u64::from(self.offset_3) << 32)
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..2].copy_from_slice(&self.offset_1.to_le_bytes());
        out[2..4].copy_from_slice(&self.selector.to_le_bytes());
        out[4] = self.ist;
        out[5] = self.type_attr;
        out[6..8].copy_from_slice(&self.offset_2.to_le_bytes());
        out[8..12].copy_from_slice(&self.offset_3.to_le_bytes());
        out[12..16].copy_from_slice(&self.zero.to_le_bytes());
        out
    }
}

/// Vectors that get a trampoline stub, in stub order.
///
/// Vector 15 is reserved by the architecture and has no stub.
pub fn handled_vectors() -> impl Iterator<Item = u8> {
    (0..=LAST_HANDLED_VECTOR).filter(|&v| v != 15)
}

// ═══════════════════════════════════════════════════════════════════════
//  Exception metadata
// ═══════════════════════════════════════════════════════════════════════

/// Name and error-code behaviour of one vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub name: &'static str,
    pub has_code: bool,
}

const fn exc(name: &'static str, has_code: bool) -> ExceptionInfo {
    ExceptionInfo { name, has_code }
}

/// Metadata for vectors 0..=33.  Vector 33 is the host-side execution
/// timeout pseudo-exception.
pub const EXCEPTIONS: [ExceptionInfo; 34] = [
    exc("Divide-by-zero Error", false),
    exc("Debug", false),
    exc("Non-Maskable Interrupt", false),
    exc("Breakpoint", false),
    exc("Overflow", false),
    exc("Bound Range Exceeded", false),
    exc("Invalid Opcode", false),
    exc("Device Not Available", false),
    exc("Double Fault", true),
    exc("Reserved", false),
    exc("Invalid TSS", true),
    exc("Segment Not Present", true),
    exc("Stack-Segment Fault", true),
    exc("General Protection Fault", true),
    exc("Page Fault", true),
    exc("Reserved", false),
    exc("x87 Floating-point Exception", false),
    exc("Alignment Check", true),
    exc("Machine Check", false),
    exc("SIMD Floating-point Exception", false),
    exc("Virtualization Exception", false),
    exc("Reserved", false),
    exc("Reserved", false),
    exc("Reserved", false),
    exc("Reserved", false),
    exc("Reserved", false),
    exc("Reserved", false),
    exc("Reserved", false),
    exc("Reserved", false),
    exc("Reserved", false),
    exc("Security Exception", false),
    exc("Reserved", false),
    exc("Reserved", false),
    exc("Execution Timeout", false),
];

/// Metadata for `vector`.
///
/// # Panics
///
/// Panics if `vector` is outside the table; callers only pass vectors
/// decoded from the trampoline's port range.
pub fn exception_info(vector: u8) -> ExceptionInfo {
    assert!(
        (vector as usize) < EXCEPTIONS.len(),
        "exception vector {vector} out of range"
    );
    EXCEPTIONS[vector as usize]
}

pub fn exception_name(vector: u8) -> &'static str {
    exception_info(vector).name
}

pub fn exception_has_code(vector: u8) -> bool {
    exception_info(vector).has_code
}

// ═══════════════════════════════════════════════════════════════════════
//  Exception frame and page-fault decoding
// ═══════════════════════════════════════════════════════════════════════
//
// The trampoline enters the host with the hardware frame still on the
// interrupt stack.  For page faults it has pushed two extra words (the
// saved rdi and rax) on top of the error code.
//
//   page fault:        rsp+0  saved rax
//                      rsp+8  saved rdi
//                      rsp+16 error code
//                      rsp+24 RIP, +32 CS, +40 RFLAGS, +48 RSP, +56 SS
//   with error code:   rsp+0  error code, rsp+8 RIP ...
//   without:           rsp+0  RIP ...

/// Offset from `rsp` to the interrupted RIP of the hardware frame.
pub fn exception_frame_offset(vector: u8) -> u64 {
    let code = if exception_has_code(vector) { 8 } else { 0 };
    let extra = if vector == PAGE_FAULT_VECTOR { 16 } else { 0 };
    code + extra
}

/// Offset from `rsp` to the error code, if the vector pushes one.
pub fn error_code_offset(vector: u8) -> Option<u64> {
    match vector {
        PAGE_FAULT_VECTOR => Some(16),
        v if exception_has_code(v) => Some(0),
        _ => None,
    }
}

pub const PF_PRESENT: u64 = 0x1;
pub const PF_WRITE: u64 = 0x2;
pub const PF_USER: u64 = 0x4;
pub const PF_RESERVED: u64 = 0x8;
pub const PF_INSTRUCTION: u64 = 0x10;

/// Human-readable breakdown of a page-fault error code, one line each.
pub fn page_fault_reasons(code: u64) -> Vec<&'static str> {
    let mut out = Vec::with_capacity(5);
    if code & PF_PRESENT != 0 {
        out.push("* Protection violation");
    } else {
        out.push("* Page not present");
    }
    if code & PF_WRITE != 0 {
        out.push("* Invalid write on page");
    }
    if code & PF_USER != 0 {
        out.push("* CPL=3 Page fault");
    }
    if code & PF_RESERVED != 0 {
        out.push("* Page contains invalid bits");
    }
    if code & PF_INSTRUCTION != 0 {
        out.push("* Instruction fetch failed (NX-bit was set)");
    }
    out
}

/// Reason line for a general protection fault with error code `code`
/// raised while `cs` was loaded.
pub fn gpf_reason(code: u64, cs: u64) -> String {
    if code != 0 {
        format!("Reason: Failing segment 0x{code:X}")
    } else if cs & 3 != 0 {
        "Reason: Executing a privileged instruction".to_string()
    } else {
        "Reason: Protection fault in kernel mode".to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

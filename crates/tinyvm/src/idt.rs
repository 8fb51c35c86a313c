//! The guest's interrupt descriptor table and exception reports.
//!
//! Every gate points into the trampoline's exception stub array.  Stubs
//! are laid out back to back in [`handled_vectors`] order; one slot is
//! left empty after vector 20 and the timer stub follows it:
//!
//! ```text
//!   stub 0..=14   vectors 0..=14
//!   stub 15..=19  vectors 16..=20
//!   stub 20       (unused)
//!   stub 21       timer, vector 32
//! ```
//!
//! The stubs report the vector to the host by writing to port
//! `0x80 + vector`; [`describe_exception`] turns the state left behind
//! into the text shown to the embedder.

use kvm_bindings::{kvm_regs, kvm_sregs};

use crate::memory::{AddressSpace, MemoryError, IDT_ADDR};
use crate::verified::idt::{
    error_code_offset, exception_frame_offset, exception_info, gpf_reason, handled_vectors,
    page_fault_reasons, IdtGate, EXCEPTION_STUBS, GPF_VECTOR, IDT_ENTRIES, IDT_GATE_SIZE,
    PAGE_FAULT_VECTOR, PF_WRITE, TIMER_VECTOR,
};

/// Stub slot of the timer handler.
pub const TIMER_STUB: u64 = EXCEPTION_STUBS - 1;

/// Stub slot that handles `vector`, if it has one.
pub fn stub_index(vector: u8) -> Option<u64> {
    if vector == TIMER_VECTOR {
        return Some(TIMER_STUB);
    }
    handled_vectors().position(|v| v == vector).map(|k| k as u64)
}

/// The 33-gate table for one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionTable {
    gates: [IdtGate; IDT_ENTRIES],
}

impl ExceptionTable {
    /// Gates for stubs starting at `stubs` (guest address) spaced `stride`
    /// bytes apart.
    pub fn new(stubs: u64, stride: u64) -> Self {
        let mut gates = [IdtGate::default(); IDT_ENTRIES];
        for vector in handled_vectors().chain(std::iter::once(TIMER_VECTOR)) {
            if let Some(k) = stub_index(vector) {
                gates[vector as usize] = IdtGate::interrupt(stubs + k * stride);
            }
        }
        Self { gates }
    }

    pub fn gate(&self, vector: u8) -> Option<&IdtGate> {
        self.gates.get(vector as usize)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IDT_ENTRIES * IDT_GATE_SIZE as usize);
        for gate in &self.gates {
            out.extend_from_slice(&gate.to_bytes());
        }
        out
    }

    /// Store the table at the fixed IDT address of `memory`.
    pub fn write(&self, memory: &AddressSpace) -> Result<(), MemoryError> {
        memory.kernel_copy_to_guest(memory.physbase() + IDT_ADDR, &self.to_bytes())
    }
}

/// Human-readable report for exception `vector`.
///
/// The hardware frame is read from the interrupt stack at `regs.rsp`;
/// when it cannot be read, the frame lines are left out.
pub fn describe_exception(vector: u8, regs: &kvm_regs, sregs: &kvm_sregs, memory: &AddressSpace) -> Vec<String> {
    let info = exception_info(vector);
    let mut lines = Vec::new();

    let code = error_code_offset(vector).and_then(|off| memory.kernel_read_u64(regs.rsp + off).ok());

    if vector == PAGE_FAULT_VECTOR {
        lines.push(format!("*** {} on address 0x{:X}", info.name, sregs.cr2));
        if let Some(code) = code {
            let kind = if code & PF_WRITE != 0 { "memory write" } else { "memory read" };
            lines.push(format!("Error code: 0x{code:X} ({kind})"));
            lines.extend(page_fault_reasons(code).into_iter().map(str::to_string));
        }
    } else {
        lines.push(format!("*** CPU EXCEPTION: {} (code: {})", info.name, info.has_code));
    }

    let frame = regs.rsp + exception_frame_offset(vector);
    let read = |off: u64| memory.kernel_read_u64(frame + off);
    if let (Ok(rip), Ok(cs), Ok(rflags), Ok(rsp), Ok(ss)) = (read(0), read(8), read(16), read(24), read(32)) {
        lines.push(format!("Failing RIP: 0x{rip:X}"));
        lines.push(format!("Fail RFLAGS: 0x{rflags:X}"));
        lines.push(format!("Failing CS:  0x{cs:X}"));
        lines.push(format!("Failing RSP: 0x{rsp:X}"));
        lines.push(format!("Failing SS:  0x{ss:X}"));
        if vector == GPF_VECTOR {
            lines.push(gpf_reason(code.unwrap_or(0), cs));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{detached, IST_ADDR, PAGE_SIZE};
    use crate::verified::idt::{PF_PRESENT, PF_USER};

    #[test]
    fn stub_slots_skip_vector_15_and_gap_before_timer() {
        assert_eq!(stub_index(0), Some(0));
        assert_eq!(stub_index(14), Some(14));
        assert_eq!(stub_index(15), None);
        assert_eq!(stub_index(16), Some(15));
        assert_eq!(stub_index(20), Some(19));
        assert_eq!(stub_index(21), None);
        assert_eq!(stub_index(TIMER_VECTOR), Some(21));
    }

    #[test]
    fn table_points_gates_at_stubs() {
        let table = ExceptionTable::new(0x2100, 32);
        assert_eq!(table.gate(0).unwrap().handler(), 0x2100);
        assert_eq!(table.gate(16).unwrap().handler(), 0x2100 + 15 * 32);
        assert_eq!(table.gate(32).unwrap().handler(), 0x2100 + 21 * 32);
        assert_eq!(*table.gate(15).unwrap(), IdtGate::default());
        assert_eq!(table.to_bytes().len(), 33 * 16);
    }

    #[test]
    fn table_written_at_idt_address() {
        let mem = detached(4 << 20);
        ExceptionTable::new(0x2100, 32).write(&mem).unwrap();
        let first = mem.kernel_read_u64(IDT_ADDR).unwrap();
        assert_eq!(first & 0xFFFF, 0x2100);
        assert_eq!((first >> 16) & 0xFFFF, 0x8);
    }

    #[test]
    fn page_fault_report_reads_frame_from_interrupt_stack() {
        let mem = detached(4 << 20);
        let rsp = IST_ADDR + PAGE_SIZE - 64;
        let frame = [0u64, 0, PF_PRESENT | PF_WRITE | PF_USER, 0x20_1234, 0x2B, 0x3202, 0x1F_FF00, 0x23];
        for (i, word) in frame.iter().enumerate() {
            mem.kernel_copy_to_guest(rsp + i as u64 * 8, &word.to_le_bytes()).unwrap();
        }
        let regs = kvm_regs { rsp, ..Default::default() };
        let sregs = kvm_sregs { cr2: 0x40_0000, ..Default::default() };

        let lines = describe_exception(PAGE_FAULT_VECTOR, &regs, &sregs, &mem);
        assert_eq!(lines[0], "*** Page Fault on address 0x400000");
        assert_eq!(lines[1], "Error code: 0x7 (memory write)");
        assert!(lines.iter().any(|l| l == "* Invalid write on page"));
        assert!(lines.iter().any(|l| l == "* CPL=3 Page fault"));
        assert!(!lines.iter().any(|l| l == "* Page not present"));
        assert!(lines.iter().any(|l| l == "Failing RIP: 0x201234"));
        assert!(lines.iter().any(|l| l == "Failing SS:  0x23"));
    }

    #[test]
    fn gpf_report_includes_reason() {
        let mem = detached(4 << 20);
        let rsp = IST_ADDR + 0x800;
        for (i, word) in [0u64, 0x20_0000, 0x2B, 0x202, 0x1F_0000, 0x23].iter().enumerate() {
            mem.kernel_copy_to_guest(rsp + i as u64 * 8, &word.to_le_bytes()).unwrap();
        }
        let regs = kvm_regs { rsp, ..Default::default() };
        let lines = describe_exception(GPF_VECTOR, &regs, &kvm_sregs::default(), &mem);
        assert_eq!(lines[0], "*** CPU EXCEPTION: General Protection Fault (code: true)");
        assert_eq!(lines.last().unwrap(), "Reason: Executing a privileged instruction");
    }

    #[test]
    fn unreadable_frame_is_skipped() {
        let mem = detached(4 << 20);
        let regs = kvm_regs { rsp: 1 << 40, ..Default::default() };
        let lines = describe_exception(6, &regs, &kvm_sregs::default(), &mem);
        assert_eq!(lines, vec!["*** CPU EXCEPTION: Invalid Opcode (code: false)".to_string()]);
    }
}

//! One virtual CPU and its run loop.
//!
//! # Exit handling
//!
//! ```text
//!   KVM_RUN ──▶ ExitReason
//!     Halt            fatal (halt in kernel space)
//!     Debug           returned to the caller as RunOutcome::Debug
//!     FailEntry       fatal
//!     Shutdown        fatal (triple fault)
//!     IoOut port 0    system call / exit / remote disconnect
//!     IoOut 0x80..    exception from the trampoline (vector = port - 0x80)
//!                       14  page fault: copy-on-write or remote activation
//!                       1   breakpoint callback
//!                       *   report + fatal
//!     IoOut other     output callback
//!     IoIn            input callback (answered before leaving the exit)
//!     Mmio            fatal (outside guest memory)
//!     InternalError   fatal
//!   EINTR             timeout if the execution timer fired, else retry
//! ```
//!
//! Page faults that copy-on-write can resolve never leave the loop.

use std::sync::Arc;

use kvm_bindings::{
    kvm_guest_debug, kvm_regs, kvm_sregs, KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP, KVM_GUESTDBG_USE_HW_BP,
};
use kvm_ioctls::{VcpuExit, VcpuFd};
use log::{debug, trace};

use crate::cpu::GUEST_RFLAGS;
use crate::idt::describe_exception;
use crate::machine::{MachineError, Runtime};
use crate::memory::{AddressSpace, INTR_ASM_ADDR, PAGE_SIZE};
use crate::syscalls::InputContext;
use crate::timer::{self, ExecutionTimer};
use crate::trampoline::{Trampoline, EXCEPTION_PORT_BASE, EXCEPTION_PORT_END, EXIT_SYSCALL, REMOTE_DISCONNECT_SYSCALL};
use crate::verified::idt::{exception_name, DEBUG_VECTOR, EXCEPTIONS, PAGE_FAULT_VECTOR, PF_INSTRUCTION, PF_PRESENT};
use crate::verified::paging::{fault_page, PDE64_RW, PDE64_USER};

/// Integer argument registers of the SysV calling convention.
pub const MAX_CALL_ARGS: usize = 6;

/// How a single `KVM_RUN` ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The guest issued the exit system call (or a handler stopped it).
    Stopped,
    /// The exit was handled; the guest can be resumed.
    Resumable,
    /// Single-step or breakpoint trap.
    Debug,
}

/// Owned form of a KVM exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Halt,
    Debug,
    FailEntry { reason: u64 },
    Shutdown,
    IoOut { port: u16, value: u32 },
    IoIn { port: u16 },
    Mmio { addr: u64 },
    InternalError,
    Other(String),
}

impl ExitReason {
    fn from_exit(exit: VcpuExit<'_>) -> Self {
        match exit {
            VcpuExit::Hlt => Self::Halt,
            VcpuExit::Debug(_) => Self::Debug,
            VcpuExit::FailEntry(reason, _) => Self::FailEntry { reason },
            VcpuExit::Shutdown => Self::Shutdown,
            VcpuExit::IoOut(port, data) => Self::IoOut { port, value: port_value(data) },
            VcpuExit::IoIn(port, _) => Self::IoIn { port },
            VcpuExit::MmioRead(addr, _) | VcpuExit::MmioWrite(addr, _) => Self::Mmio { addr },
            VcpuExit::InternalError => Self::InternalError,
            other => Self::Other(format!("{other:?}")),
        }
    }
}

/// Little-endian value of an I/O exit's data (1, 2 or 4 bytes).
fn port_value(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let n = data.len().min(4);
    bytes[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(bytes)
}

/// A KVM vCPU bound to one machine's address space.
pub struct VirtualCpu {
    fd: VcpuFd,
    cpu_id: u32,
    memory: Arc<AddressSpace>,
    runtime: Arc<Runtime>,
    stopped: bool,
    /// Milliseconds of the active execution timer, 0 when none.
    timer_ticks: u32,
    /// Address-space TLB generation last loaded into the vCPU.
    tlb_generation: u64,
    current_exception: Option<u8>,
    /// Where a remote call returns once the remote is disconnected.
    pub(crate) remote_return_address: u64,
    /// FS base to restore when the remote is disconnected.
    pub(crate) saved_fs_base: Option<u64>,
}

impl std::fmt::Debug for VirtualCpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualCpu")
            .field("cpu_id", &self.cpu_id)
            .field("stopped", &self.stopped)
            .field("current_exception", &self.current_exception)
            .finish_non_exhaustive()
    }
}

impl VirtualCpu {
    pub(crate) fn new(fd: VcpuFd, cpu_id: u32, memory: Arc<AddressSpace>, runtime: Arc<Runtime>) -> Self {
        let tlb_generation = memory.tlb_generation();
        Self {
            fd,
            cpu_id,
            memory,
            runtime,
            stopped: false,
            timer_ticks: 0,
            tlb_generation,
            current_exception: None,
            remote_return_address: 0,
            saved_fs_base: None,
        }
    }

    pub fn cpu_id(&self) -> u32 {
        self.cpu_id
    }

    pub fn memory(&self) -> &Arc<AddressSpace> {
        &self.memory
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Ask the run loop to return after the current exit.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Vector of the last exception reported by the trampoline.
    pub fn current_exception(&self) -> Option<u8> {
        self.current_exception
    }

    // ─── registers ───────────────────────────────────────────────

    pub fn registers(&self) -> Result<kvm_regs, MachineError> {
        self.fd.get_regs().map_err(MachineError::GetRegisters)
    }

    pub fn set_registers(&self, regs: &kvm_regs) -> Result<(), MachineError> {
        self.fd.set_regs(regs).map_err(MachineError::SetRegisters)
    }

    pub fn special_registers(&self) -> Result<kvm_sregs, MachineError> {
        self.fd.get_sregs().map_err(MachineError::GetSregs)
    }

    pub fn set_special_registers(&self, sregs: &kvm_sregs) -> Result<(), MachineError> {
        self.fd.set_sregs(sregs).map_err(MachineError::SetSregs)
    }

    /// Prepare a SysV call of `addr` on stack `rsp`.  The callee returns
    /// into the exit stub, which stops the guest with the result in rdi.
    pub fn setup_call(&mut self, addr: u64, rsp: u64, args: &[u64]) -> Result<(), MachineError> {
        if args.len() > MAX_CALL_ARGS {
            return Err(MachineError::TooManyArguments { count: args.len() });
        }
        let exit = Trampoline::exit_address(self.memory.physbase());
        let sp = (rsp & !0xF) - 8;
        self.memory.write_u64(sp, exit)?;

        let mut regs = kvm_regs {
            rip: addr,
            rsp: sp,
            rflags: GUEST_RFLAGS,
            ..Default::default()
        };
        let slots = [&mut regs.rdi, &mut regs.rsi, &mut regs.rdx, &mut regs.rcx, &mut regs.r8, &mut regs.r9];
        for (slot, value) in slots.into_iter().zip(args) {
            *slot = *value;
        }
        self.set_registers(&regs)?;
        self.stopped = false;
        Ok(())
    }

    /// Guest-virtual to guest-physical through the vCPU's current tables.
    pub fn translate(&self, vaddr: u64) -> Result<u64, MachineError> {
        let tr = self.fd.translate_gva(vaddr).map_err(MachineError::Translate)?;
        if tr.valid == 0 {
            return Err(crate::memory::MemoryError::NotMapped { addr: vaddr }.into());
        }
        Ok(tr.physical_address)
    }

    // ─── diagnostics ─────────────────────────────────────────────

    pub fn print(&self, text: &str) {
        self.runtime.syscalls.print(text);
    }

    pub fn print_registers(&self) -> Result<(), MachineError> {
        let r = self.registers()?;
        let s = self.special_registers()?;
        let text = format!(
            "CPU {}\n\
             RIP: 0x{:X}  RSP: 0x{:X}  RBP: 0x{:X}  RFLAGS: 0x{:X}\n\
             RAX: 0x{:X}  RBX: 0x{:X}  RCX: 0x{:X}  RDX: 0x{:X}\n\
             RSI: 0x{:X}  RDI: 0x{:X}  R8: 0x{:X}  R9: 0x{:X}\n\
             R10: 0x{:X}  R11: 0x{:X}  R12: 0x{:X}  R13: 0x{:X}\n\
             R14: 0x{:X}  R15: 0x{:X}\n\
             CR0: 0x{:X}  CR2: 0x{:X}  CR3: 0x{:X}  CR4: 0x{:X}  EFER: 0x{:X}\n\
             CS: 0x{:X}  SS: 0x{:X}  FS base: 0x{:X}  GS base: 0x{:X}",
            self.cpu_id, r.rip, r.rsp, r.rbp, r.rflags, r.rax, r.rbx, r.rcx, r.rdx, r.rsi, r.rdi, r.r8, r.r9,
            r.r10, r.r11, r.r12, r.r13, r.r14, r.r15, s.cr0, s.cr2, s.cr3, s.cr4, s.efer, s.cs.selector,
            s.ss.selector, s.fs.base, s.gs.base,
        );
        self.print(&text);
        Ok(())
    }

    fn report_exception(&self, vector: u8) -> Result<(), MachineError> {
        let regs = self.registers()?;
        let sregs = self.special_registers()?;
        let lines = describe_exception(vector, &regs, &sregs, &self.memory);
        self.print(&lines.join("\n"));
        Ok(())
    }

    // ─── run loop ────────────────────────────────────────────────

    /// Run until the guest stops.  `ticks` is the timeout in
    /// milliseconds, 0 for none.  Debug exits are resumed.
    pub fn run(&mut self, ticks: u32) -> Result<(), MachineError> {
        self.stopped = false;
        let timer = ExecutionTimer::arm(ticks).map_err(MachineError::Timer)?;
        self.timer_ticks = ticks;

        let result = loop {
            match self.run_once() {
                Ok(RunOutcome::Stopped) => break Ok(()),
                Ok(RunOutcome::Resumable | RunOutcome::Debug) => {
                    if self.timed_out() {
                        break Err(MachineError::Timeout { ticks });
                    }
                }
                Err(e) => break Err(e),
            }
        };

        self.timer_ticks = 0;
        drop(timer);
        result
    }

    fn timed_out(&self) -> bool {
        self.timer_ticks != 0 && timer::timer_fired()
    }

    /// Enter the guest once and handle the resulting exit.
    pub fn run_once(&mut self) -> Result<RunOutcome, MachineError> {
        self.reload_stale_tables()?;
        let exit = self.next_exit()?;
        trace!("CPU {}: {exit:?}", self.cpu_id);
        self.handle_exit(exit)
    }

    /// Reload CR3 (and with it the TLB) when the host rewrote live
    /// page-table entries since the last entry.
    fn reload_stale_tables(&mut self) -> Result<(), MachineError> {
        let generation = self.memory.tlb_generation();
        if generation == self.tlb_generation {
            return Ok(());
        }
        let mut sregs = self.special_registers()?;
        sregs.cr3 = self.memory.root();
        self.set_special_registers(&sregs)?;
        self.tlb_generation = generation;
        Ok(())
    }

    pub(crate) fn mark_tables_current(&mut self) {
        self.tlb_generation = self.memory.tlb_generation();
    }

    fn next_exit(&mut self) -> Result<ExitReason, MachineError> {
        loop {
            match self.fd.run() {
                Ok(VcpuExit::IoIn(port, data)) => {
                    let ctx = InputContext { cpu_id: self.cpu_id, memory: &self.memory };
                    let value = self.runtime.syscalls.input(&ctx, port).to_le_bytes();
                    let n = data.len().min(4);
                    data[..n].copy_from_slice(&value[..n]);
                    return Ok(ExitReason::IoIn { port });
                }
                Ok(exit) => return Ok(ExitReason::from_exit(exit)),
                Err(e) if e.errno() == libc::EINTR => {
                    if self.timer_ticks != 0 && timer::timer_fired() {
                        return Err(MachineError::Timeout { ticks: self.timer_ticks });
                    }
                    debug!("CPU {}: KVM_RUN interrupted, resuming", self.cpu_id);
                }
                Err(e) if e.errno() == libc::EFAULT => return Err(MachineError::GuestMemoryFault(e)),
                Err(e) => return Err(MachineError::VcpuRun(e)),
            }
        }
    }

    fn handle_exit(&mut self, exit: ExitReason) -> Result<RunOutcome, MachineError> {
        match exit {
            ExitReason::Halt => Err(MachineError::Halted),
            ExitReason::Debug => Ok(RunOutcome::Debug),
            ExitReason::FailEntry { reason } => Err(MachineError::FailedEntry { reason }),
            ExitReason::Shutdown => Err(MachineError::Shutdown),
            ExitReason::IoOut { port: 0, value } => self.handle_syscall(value),
            ExitReason::IoOut { port, .. } if (EXCEPTION_PORT_BASE..EXCEPTION_PORT_END).contains(&port) => {
                self.handle_exception_port(port)
            }
            ExitReason::IoOut { port, value } => {
                let runtime = Arc::clone(&self.runtime);
                runtime.syscalls.output(self, port, value)?;
                Ok(self.after_io())
            }
            ExitReason::IoIn { .. } => Ok(self.after_io()),
            ExitReason::Mmio { addr } => {
                self.print(&format!("Write outside of physical memory at 0x{addr:X}"));
                Err(MachineError::Mmio { addr })
            }
            ExitReason::InternalError => Err(MachineError::Internal),
            ExitReason::Other(reason) => Err(MachineError::UnexpectedExit { reason }),
        }
    }

    fn after_io(&self) -> RunOutcome {
        if self.stopped {
            RunOutcome::Stopped
        } else {
            RunOutcome::Resumable
        }
    }

    fn handle_syscall(&mut self, nr: u32) -> Result<RunOutcome, MachineError> {
        match nr {
            EXIT_SYSCALL => {
                self.stopped = true;
                Ok(RunOutcome::Stopped)
            }
            REMOTE_DISCONNECT_SYSCALL => {
                let result = self.remote_disconnect()?;
                let mut regs = self.registers()?;
                self.memory.write_u64(regs.rsp + 24, self.remote_return_address)?;
                self.remote_return_address = 0;
                regs.rax = result as u64;
                self.set_registers(&regs)?;
                Ok(RunOutcome::Resumable)
            }
            nr => {
                let runtime = Arc::clone(&self.runtime);
                runtime.syscalls.dispatch(self, nr)?;
                if self.stopped {
                    return Ok(RunOutcome::Stopped);
                }
                if self.timed_out() {
                    return Err(MachineError::Timeout { ticks: self.timer_ticks });
                }
                Ok(RunOutcome::Resumable)
            }
        }
    }

    fn handle_exception_port(&mut self, port: u16) -> Result<RunOutcome, MachineError> {
        let vector = (port - EXCEPTION_PORT_BASE) as u8;
        if vector as usize >= EXCEPTIONS.len() {
            return Err(MachineError::UnexpectedExit {
                reason: format!("exception port {port:#x}"),
            });
        }
        self.current_exception = Some(vector);

        match vector {
            PAGE_FAULT_VECTOR => self.handle_page_fault(),
            DEBUG_VECTOR => {
                let runtime = Arc::clone(&self.runtime);
                runtime.syscalls.breakpoint(self)?;
                Ok(self.after_io())
            }
            _ => {
                self.report_exception(vector)?;
                Err(MachineError::Exception {
                    name: exception_name(vector),
                    vector,
                })
            }
        }
    }

    /// The trampoline leaves the fault address in rdi and the error code
    /// in rax, and expects 0 (local) or 1 (remote activated) back in rax.
    fn handle_page_fault(&mut self) -> Result<RunOutcome, MachineError> {
        let vector = PAGE_FAULT_VECTOR;
        let mut regs = self.registers()?;
        let addr = fault_page(regs.rdi);
        let code = regs.rax;
        let physbase = self.memory.physbase();

        if regs.rip >= physbase + INTR_ASM_ADDR + PAGE_SIZE {
            return Err(MachineError::SecurityViolation { vector, rip: regs.rip });
        }

        if self.memory.is_foreign_address(addr) {
            if self.memory.remote_connected() {
                self.report_exception(vector)?;
                return Err(MachineError::RemoteFault {
                    addr,
                    reason: "fault in remote memory while connected",
                });
            }
            if code & PF_INSTRUCTION == 0 {
                self.report_exception(vector)?;
                return Err(MachineError::RemoteFault {
                    addr,
                    reason: "remote memory touched before a call into it",
                });
            }
            // Interrupted RSP in the hardware frame; it holds the return
            // address of the call into remote code.
            let retstack = self.memory.kernel_read_u64(regs.rsp + 48)?;
            self.remote_return_address = self.memory.read_u64(retstack)?;
            debug!(
                "CPU {}: call into remote {addr:#x}, returns to {:#x}",
                self.cpu_id, self.remote_return_address
            );
            regs.rax = self.remote_activate_now()?;
            self.set_registers(&regs)?;
            return Ok(RunOutcome::Resumable);
        }

        if !self.memory.safely_within(addr, 1) {
            self.report_exception(vector)?;
            self.remote_disconnect()?;
            return Err(MachineError::KernelFault { vector, addr });
        }

        if code & (PF_INSTRUCTION | PF_PRESENT) == (PF_INSTRUCTION | PF_PRESENT) {
            self.report_exception(vector)?;
            return Err(MachineError::Exception {
                name: exception_name(vector),
                vector,
            });
        }

        regs.rax = 0;
        self.set_registers(&regs)?;
        self.memory.allocate_page_for_write(addr, PDE64_USER | PDE64_RW, false)?;
        Ok(RunOutcome::Resumable)
    }

    // ─── debugging ───────────────────────────────────────────────

    fn set_guest_debug(&self, control: u32, breakpoints: &[u64; 4]) -> Result<(), MachineError> {
        let mut debug = kvm_guest_debug { control, ..Default::default() };
        if control & KVM_GUESTDBG_USE_HW_BP != 0 {
            let mut dr7 = 0u64;
            for (i, bp) in breakpoints.iter().enumerate() {
                debug.arch.debugreg[i] = *bp;
                if *bp != 0 {
                    dr7 |= 3 << (2 * i);
                }
            }
            debug.arch.debugreg[7] = dr7;
        }
        self.fd.set_guest_debug(&debug).map_err(MachineError::GuestDebug)
    }

    /// Execute one guest instruction.
    pub fn step_one(&mut self) -> Result<RunOutcome, MachineError> {
        self.set_guest_debug(KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP, &[0; 4])?;
        let outcome = self.run_once();
        self.set_guest_debug(0, &[0; 4])?;
        outcome
    }

    /// Run until a hardware breakpoint hits or the guest stops.  Zero
    /// entries are unused slots.
    pub fn run_with_breakpoints(&mut self, breakpoints: [u64; 4], ticks: u32) -> Result<RunOutcome, MachineError> {
        self.set_guest_debug(KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_USE_HW_BP, &breakpoints)?;
        self.stopped = false;
        let timer = ExecutionTimer::arm(ticks).map_err(MachineError::Timer)?;
        self.timer_ticks = ticks;

        let result = loop {
            match self.run_once() {
                Ok(RunOutcome::Resumable) if self.timed_out() => break Err(MachineError::Timeout { ticks }),
                Ok(RunOutcome::Resumable) => {}
                other => break other,
            }
        };

        self.timer_ticks = 0;
        drop(timer);
        self.set_guest_debug(0, &[0; 4])?;
        result
    }
}

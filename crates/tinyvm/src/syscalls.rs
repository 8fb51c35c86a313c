//! Guest system calls and embedder callbacks.
//!
//! A [`SyscallRegistry`] is built once, wrapped in the process-wide
//! [`Runtime`](crate::Runtime) and shared by every machine.  It is never
//! mutated after that, so no locking is needed on the dispatch path.
//!
//! ```text
//!   guest: out 0, eax(nr)
//!     │
//!     ▼
//!   VirtualCpu::run ──▶ registry.dispatch(cpu, nr)
//!                          ├─ handlers[nr]      registered handler
//!                          └─ unhandled(cpu,nr) fallback (-ENOSYS)
//! ```

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::machine::MachineError;
use crate::memory::AddressSpace;
use crate::trampoline::{EXIT_SYSCALL, REMOTE_DISCONNECT_SYSCALL};
use crate::vcpu::VirtualCpu;

/// Highest syscall number + 1 that may have a handler.
pub const MAX_SYSCALLS: u32 = 512;

pub type SyscallHandler = Arc<dyn Fn(&mut VirtualCpu) -> Result<(), MachineError> + Send + Sync>;
pub type UnhandledHandler = Arc<dyn Fn(&mut VirtualCpu, u32) -> Result<(), MachineError> + Send + Sync>;
pub type OutputHandler = Arc<dyn Fn(&mut VirtualCpu, u16, u32) -> Result<(), MachineError> + Send + Sync>;
pub type InputHandler = Arc<dyn Fn(&InputContext<'_>, u16) -> u32 + Send + Sync>;
pub type BreakpointHandler = Arc<dyn Fn(&mut VirtualCpu) -> Result<(), MachineError> + Send + Sync>;
pub type Printer = Arc<dyn Fn(&str) + Send + Sync>;

/// What an input handler may look at while the vCPU's exit buffer is
/// borrowed for the reply.
pub struct InputContext<'a> {
    pub cpu_id: u32,
    pub memory: &'a AddressSpace,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("System call {nr} already has a handler")]
    Duplicate { nr: u32 },

    #[error("System call {nr} is out of range (max {MAX_SYSCALLS})")]
    OutOfRange { nr: u32 },

    #[error("System call {nr} is reserved for the trampoline protocol")]
    Reserved { nr: u32 },
}

/// System-call table plus the I/O, breakpoint and printer callbacks.
#[derive(Clone)]
pub struct SyscallRegistry {
    handlers: Vec<Option<SyscallHandler>>,
    unhandled: UnhandledHandler,
    output: OutputHandler,
    input: InputHandler,
    breakpoint: BreakpointHandler,
    printer: Printer,
}

impl fmt::Debug for SyscallRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyscallRegistry")
            .field("handlers", &self.handlers.iter().filter(|h| h.is_some()).count())
            .finish_non_exhaustive()
    }
}

impl Default for SyscallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallRegistry {
    /// Empty table with the default callbacks.
    pub fn new() -> Self {
        Self {
            handlers: vec![None; MAX_SYSCALLS as usize],
            unhandled: Arc::new(default_unhandled),
            output: Arc::new(|cpu: &mut VirtualCpu, port: u16, value: u32| {
                debug!("CPU {}: unhandled output {value:#x} on port {port:#x}", cpu.cpu_id());
                Ok(())
            }),
            input: Arc::new(|ctx: &InputContext<'_>, port: u16| {
                debug!("CPU {}: unhandled input on port {port:#x}", ctx.cpu_id);
                0
            }),
            breakpoint: Arc::new(|cpu: &mut VirtualCpu| cpu.print_registers()),
            printer: Arc::new(|text: &str| info!(target: "tinyvm::guest", "{}", text.trim_end())),
        }
    }

    /// Register the handler for system call `nr`.
    pub fn on_syscall<F>(mut self, nr: u32, handler: F) -> Result<Self, RegistryError>
    where
        F: Fn(&mut VirtualCpu) -> Result<(), MachineError> + Send + Sync + 'static,
    {
        if nr == EXIT_SYSCALL || nr == REMOTE_DISCONNECT_SYSCALL {
            return Err(RegistryError::Reserved { nr });
        }
        let slot = self
            .handlers
            .get_mut(nr as usize)
            .ok_or(RegistryError::OutOfRange { nr })?;
        if slot.is_some() {
            return Err(RegistryError::Duplicate { nr });
        }
        *slot = Some(Arc::new(handler));
        Ok(self)
    }

    pub fn on_unhandled<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut VirtualCpu, u32) -> Result<(), MachineError> + Send + Sync + 'static,
    {
        self.unhandled = Arc::new(handler);
        self
    }

    pub fn on_output<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut VirtualCpu, u16, u32) -> Result<(), MachineError> + Send + Sync + 'static,
    {
        self.output = Arc::new(handler);
        self
    }

    pub fn on_input<F>(mut self, handler: F) -> Self
    where
        F: Fn(&InputContext<'_>, u16) -> u32 + Send + Sync + 'static,
    {
        self.input = Arc::new(handler);
        self
    }

    pub fn on_breakpoint<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut VirtualCpu) -> Result<(), MachineError> + Send + Sync + 'static,
    {
        self.breakpoint = Arc::new(handler);
        self
    }

    /// Replace the diagnostics sink.
    pub fn with_printer<F>(mut self, printer: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.printer = Arc::new(printer);
        self
    }

    pub fn has_handler(&self, nr: u32) -> bool {
        self.handlers.get(nr as usize).is_some_and(Option::is_some)
    }

    // ─── dispatch ────────────────────────────────────────────────

    pub fn dispatch(&self, cpu: &mut VirtualCpu, nr: u32) -> Result<(), MachineError> {
        match self.handlers.get(nr as usize) {
            Some(Some(handler)) => handler(cpu),
            _ => (self.unhandled)(cpu, nr),
        }
    }

    pub fn output(&self, cpu: &mut VirtualCpu, port: u16, value: u32) -> Result<(), MachineError> {
        (self.output)(cpu, port, value)
    }

    pub fn input(&self, ctx: &InputContext<'_>, port: u16) -> u32 {
        (self.input)(ctx, port)
    }

    pub fn breakpoint(&self, cpu: &mut VirtualCpu) -> Result<(), MachineError> {
        (self.breakpoint)(cpu)
    }

    pub fn print(&self, text: &str) {
        (self.printer)(text);
    }
}

fn default_unhandled(cpu: &mut VirtualCpu, nr: u32) -> Result<(), MachineError> {
    warn!("CPU {}: unhandled system call {nr}", cpu.cpu_id());
    let mut regs = cpu.registers()?;
    regs.rax = (-(libc::ENOSYS as i64)) as u64;
    cpu.set_registers(&regs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn noop(_: &mut VirtualCpu) -> Result<(), MachineError> {
        Ok(())
    }

    #[test]
    fn handlers_are_registered_once() {
        let registry = SyscallRegistry::new().on_syscall(1, noop).unwrap();
        assert!(registry.has_handler(1));
        assert!(!registry.has_handler(2));
        assert_eq!(
            registry.on_syscall(1, noop).unwrap_err(),
            RegistryError::Duplicate { nr: 1 }
        );
    }

    #[test]
    fn out_of_range_and_reserved_numbers_are_rejected() {
        assert_eq!(
            SyscallRegistry::new().on_syscall(MAX_SYSCALLS, noop).unwrap_err(),
            RegistryError::OutOfRange { nr: MAX_SYSCALLS }
        );
        assert_eq!(
            SyscallRegistry::new().on_syscall(EXIT_SYSCALL, noop).unwrap_err(),
            RegistryError::Reserved { nr: EXIT_SYSCALL }
        );
        assert!(!SyscallRegistry::new().has_handler(u32::MAX));
    }

    #[test]
    fn printer_can_be_replaced() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let registry = SyscallRegistry::new().with_printer(move |text| sink.lock().unwrap().push(text.to_string()));
        registry.print("hello");
        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[test]
    fn input_handler_sees_context() {
        let memory = crate::memory::detached(4 << 20);
        let registry = SyscallRegistry::new().on_input(|ctx, port| ctx.cpu_id * 1000 + u32::from(port));
        let ctx = InputContext { cpu_id: 2, memory: &memory };
        assert_eq!(registry.input(&ctx, 0x60), 2096);
        assert_eq!(SyscallRegistry::new().input(&ctx, 0x60), 0);
    }
}

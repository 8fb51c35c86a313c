//! The machine: one VM, its memory, its vCPUs.
//!
//! # Construction
//!
//! ```text
//!   Machine::new(image, options, runtime)
//!     ├─ KVM handle (opened once per process)
//!     ├─ KVM_CREATE_VM, TSS + identity-map addresses
//!     ├─ AddressSpace: base region → slot 0, identity page tables
//!     ├─ GDT, TSS (all CPUs), IDT, trampoline, vsyscall page
//!     ├─ image.load → entry / stack / heap / kernel end
//!     ├─ heap marked non-executable (unless options say otherwise)
//!     └─ vCPU 0: CPUID, long mode, SYSCALL MSRs, XCR0, FPU, registers
//! ```
//!
//! # Forking
//!
//! ```text
//!   master.prepare_copy_on_write(work)     tables → CoW form, root template,
//!                                          register snapshot
//!   Machine::fork(&master, options)        new VM, same base region,
//!                                          empty banks, private root + IST
//!   fork.reset_to(&master)                 banks rewound, root re-cloned,
//!                                          registers restored
//! ```
//!
//! A fork never writes the master's base region: every user page and
//! every table it touches is duplicated into its own banks first.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use kvm_bindings::{kvm_regs, kvm_sregs, CpuId};
use kvm_ioctls::{Kvm, VmFd};
use log::{debug, info};
use thiserror::Error;
use vmm_sys_util::errno;

use crate::cpu::{
    self, supported_cpuid, write_gdt, write_tss, CpuError, CpuFeatures, GUEST_RFLAGS,
};
use crate::idt::ExceptionTable;
use crate::image::{GuestImage, ImageError, ImageLayout};
use crate::memory::{
    align_up, AddressSpace, MappingOptions, MemoryError, MemoryInstaller, IST_ADDR, KVM_IDENTITY_MAP_ADDRESS,
    KVM_TSS_ADDRESS, MAX_SMP_CPUS, PAGE_SIZE,
};
use crate::smp::Smp;
use crate::syscalls::SyscallRegistry;
use crate::trampoline::{Trampoline, TrampolineError};
use crate::vcpu::{RunOutcome, VirtualCpu};

/// KVM API version this crate speaks.
pub const KVM_API_VERSION: i32 = 12;

/// Room reserved for `brk` between the heap start and the mmap area.
pub const BRK_MAX: u64 = 0x10_0000;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum MachineError {
    // ─── guest outcomes ──────────────────────────────────────────
    /// The execution timer fired before the guest stopped.
    #[error("Execution timed out after {ticks} ms")]
    Timeout { ticks: u32 },

    #[error("CPU exception: {name} (vector {vector})")]
    Exception { name: &'static str, vector: u8 },

    /// A fault raised by the trampoline's own code.
    #[error("Security violation: exception {vector} at kernel RIP {rip:#x}")]
    SecurityViolation { vector: u8, rip: u64 },

    /// A page fault on an address the guest may never touch.
    #[error("Kernel-area fault: exception {vector} on address {addr:#x}")]
    KernelFault { vector: u8, addr: u64 },

    #[error("Halt from kernel space")]
    Halted,

    #[error("Failed to enter guest (hardware reason {reason:#x})")]
    FailedEntry { reason: u64 },

    #[error("Shutdown (triple fault)")]
    Shutdown,

    #[error("Write outside of physical memory at {addr:#x}")]
    Mmio { addr: u64 },

    #[error("KVM internal error")]
    Internal,

    #[error("Unexpected exit: {reason}")]
    UnexpectedExit { reason: String },

    // ─── host-side failures ──────────────────────────────────────
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Cpu(#[from] CpuError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Trampoline(#[from] TrampolineError),

    #[error("Failed to arm execution timer: {0}")]
    Timer(#[source] errno::Error),

    #[error("Failed to open /dev/kvm: {0}")]
    KvmOpen(#[source] kvm_ioctls::Error),

    #[error("Unsupported KVM API version {version}")]
    KvmApiVersion { version: i32 },

    #[error("Failed to create VM: {0}")]
    VmCreate(#[source] kvm_ioctls::Error),

    #[error("Failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    #[error("Failed to set identity map address: {0}")]
    SetIdentityMap(#[source] kvm_ioctls::Error),

    #[error("Failed to create vCPU {cpu}: {source}")]
    VcpuCreate {
        cpu: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Failed to get vCPU registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to set vCPU registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to get vCPU special registers: {0}")]
    GetSregs(#[source] kvm_ioctls::Error),

    #[error("Failed to set vCPU special registers: {0}")]
    SetSregs(#[source] kvm_ioctls::Error),

    #[error("Failed to run vCPU: {0}")]
    VcpuRun(#[source] kvm_ioctls::Error),

    #[error("Failed to translate guest address: {0}")]
    Translate(#[source] kvm_ioctls::Error),

    #[error("Failed to set guest debug state: {0}")]
    GuestDebug(#[source] kvm_ioctls::Error),

    /// `KVM_RUN` hit a host page it could not fault in.
    #[error("Guest memory fault: {0}")]
    GuestMemoryFault(#[source] kvm_ioctls::Error),

    // ─── protocol violations ─────────────────────────────────────
    #[error("Machine is not prepared for copy-on-write")]
    NotPrepared,

    #[error("Machine is not a fork of the given master")]
    ForkMismatch,

    #[error("Runtime is already installed")]
    RuntimeInstalled,

    #[error("Remote memory {physbase:#x}+{size:#x} cannot be spliced into this machine's tables")]
    RemoteRange { physbase: u64, size: u64 },

    #[error("A different remote machine is already connected")]
    RemoteAlreadyConnected,

    #[error("No remote machine is configured")]
    RemoteNotConfigured,

    #[error("Remote memory not supported: {reason}")]
    RemoteUnsupported { reason: &'static str },

    #[error("Remote memory fault on {addr:#x}: {reason}")]
    RemoteFault { addr: u64, reason: &'static str },

    #[error("SMP worker for CPU {cpu} is gone")]
    SmpWorker { cpu: u32 },

    #[error("Failed to start SMP worker for CPU {cpu}: {source}")]
    SmpSpawn {
        cpu: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("SMP supports at most {max} CPUs, {requested} requested")]
    SmpTooManyCpus { requested: usize, max: usize },

    #[error("Too many call arguments: {count}")]
    TooManyArguments { count: usize },
}

impl MachineError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Process-wide state
// ═══════════════════════════════════════════════════════════════════════

static KVM: OnceLock<Kvm> = OnceLock::new();

/// The process's KVM handle, opened on first use.
pub fn kvm() -> Result<&'static Kvm, MachineError> {
    if let Some(kvm) = KVM.get() {
        return Ok(kvm);
    }
    let kvm = Kvm::new().map_err(MachineError::KvmOpen)?;
    let version = kvm.get_api_version();
    if version != KVM_API_VERSION {
        return Err(MachineError::KvmApiVersion { version });
    }
    Ok(KVM.get_or_init(|| kvm))
}

/// System calls, callbacks and trampoline shared by every machine.
/// Built once, never mutated afterwards.
#[derive(Debug)]
pub struct Runtime {
    pub syscalls: SyscallRegistry,
    pub trampoline: Trampoline,
}

static RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();

impl Runtime {
    pub fn new(syscalls: SyscallRegistry, trampoline: Trampoline) -> Arc<Self> {
        Arc::new(Self { syscalls, trampoline })
    }

    /// Default callbacks and the built-in trampoline.
    pub fn minimal() -> Arc<Self> {
        Self::new(SyscallRegistry::new(), Trampoline::minimal())
    }

    /// Make `runtime` the process-wide runtime.  Only the first call
    /// succeeds.
    pub fn install(runtime: Arc<Runtime>) -> Result<Arc<Runtime>, MachineError> {
        let mut fresh = false;
        let installed = RUNTIME.get_or_init(|| {
            fresh = true;
            Arc::clone(&runtime)
        });
        if !fresh {
            return Err(MachineError::RuntimeInstalled);
        }
        info!("Runtime installed");
        Ok(Arc::clone(installed))
    }

    /// The process-wide runtime, if one was installed.
    pub fn installed() -> Option<Arc<Runtime>> {
        RUNTIME.get().cloned()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Options
// ═══════════════════════════════════════════════════════════════════════

/// Per-machine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineOptions {
    /// Size of the base region.
    pub max_mem: u64,
    /// Budget for copy-on-write pages (forks).
    pub max_cow_mem: u64,
    /// Guest-physical base of the machine's memory, 1 GiB aligned.
    pub vmem_base_address: u64,
    /// Override for the image's initial stack.
    pub stack_address: Option<u64>,
    pub hugepages: bool,
    pub transparent_hugepages: bool,
    /// Skip merge/THP advice on the mappings.
    pub short_lived: bool,
    /// Leave the heap executable.
    pub executable_heap: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            max_mem: 64 << 20,
            max_cow_mem: 16 << 20,
            vmem_base_address: 0,
            stack_address: None,
            hugepages: false,
            transparent_hugepages: false,
            short_lived: false,
            executable_heap: false,
        }
    }
}

impl MachineOptions {
    pub fn mapping(&self) -> MappingOptions {
        MappingOptions {
            hugepages: self.hugepages,
            transparent_hugepages: self.transparent_hugepages,
            short_lived: self.short_lived,
        }
    }

    pub fn max_cow_pages(&self) -> u64 {
        self.max_cow_mem / PAGE_SIZE
    }
}

/// Millisecond ticks for a timeout; zero means none.
pub fn ticks_for(timeout: Duration) -> u32 {
    if timeout.is_zero() {
        return 0;
    }
    timeout.as_millis().clamp(1, u128::from(u32::MAX)) as u32
}

// ═══════════════════════════════════════════════════════════════════════
//  Machine
// ═══════════════════════════════════════════════════════════════════════

pub struct Machine {
    pub(crate) vm: Arc<VmFd>,
    pub(crate) memory: Arc<AddressSpace>,
    pub(crate) cpu: VirtualCpu,
    pub(crate) smp: Option<Smp>,
    pub(crate) runtime: Arc<Runtime>,
    layout: ImageLayout,
    pub(crate) cpuid: CpuId,
    pub(crate) features: CpuFeatures,
    options: MachineOptions,
    mmap_cursor: u64,
    /// Registers captured by `prepare_copy_on_write`, restored by forks.
    snapshot: Option<(kvm_regs, kvm_sregs)>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("memory", &self.memory)
            .field("layout", &self.layout)
            .field("cpu", &self.cpu)
            .finish_non_exhaustive()
    }
}

/// A vCPU of `vm` in ring-3 long mode, registers untouched.
pub(crate) fn init_vcpu(
    vm: &VmFd,
    cpu_id: u32,
    memory: &Arc<AddressSpace>,
    runtime: &Arc<Runtime>,
    cpuid: &CpuId,
    features: &CpuFeatures,
) -> Result<VirtualCpu, MachineError> {
    let fd = vm
        .create_vcpu(u64::from(cpu_id))
        .map_err(|source| MachineError::VcpuCreate { cpu: cpu_id, source })?;
    let physbase = memory.physbase();
    cpu::setup_cpuid(&fd, cpuid)?;
    cpu::setup_sregs(&fd, physbase, memory.root(), cpu_id, features)?;
    cpu::setup_msrs(&fd, runtime.trampoline.syscall_entry(physbase))?;
    cpu::setup_xcr0(&fd, features)?;
    cpu::setup_fpu(&fd)?;
    debug!("vCPU {cpu_id} created");
    Ok(VirtualCpu::new(fd, cpu_id, Arc::clone(memory), Arc::clone(runtime)))
}

/// A VM with KVM's fixed pages placed.
fn create_vm() -> Result<Arc<VmFd>, MachineError> {
    let vm = kvm()?.create_vm().map_err(MachineError::VmCreate)?;
    vm.set_tss_address(KVM_TSS_ADDRESS as usize)
        .map_err(MachineError::SetTssAddress)?;
    vm.set_identity_map_address(KVM_IDENTITY_MAP_ADDRESS)
        .map_err(MachineError::SetIdentityMap)?;
    Ok(Arc::new(vm))
}

impl Machine {
    /// Build a machine and load `image` into it.
    pub fn new(image: &dyn GuestImage, options: MachineOptions, runtime: Arc<Runtime>) -> Result<Self, MachineError> {
        let vm = create_vm()?;
        let installer: Arc<dyn MemoryInstaller> = Arc::clone(&vm) as Arc<dyn MemoryInstaller>;

        let memory = AddressSpace::new(
            options.vmem_base_address,
            options.max_mem,
            options.mapping(),
            options.max_cow_pages(),
            installer,
        )?;
        memory.install_base(vm.as_ref())?;
        memory.setup_identity_map()?;
        let physbase = memory.physbase();

        write_gdt(&memory)?;
        write_tss(&memory, MAX_SMP_CPUS as u32)?;
        let trampoline = &runtime.trampoline;
        ExceptionTable::new(trampoline.exception_stubs(physbase), trampoline.exception_stride()).write(&memory)?;
        trampoline.install(&memory)?;

        let mut layout = image.load(&memory)?;
        if let Some(stack) = options.stack_address {
            layout.stack = stack;
        }
        if !options.executable_heap {
            memory.set_no_execute_from(layout.heap)?;
        }

        let memory = Arc::new(memory);
        let cpuid = supported_cpuid(kvm()?)?;
        let features = CpuFeatures::from_cpuid(&cpuid);
        let cpu = init_vcpu(&vm, 0, &memory, &runtime, &cpuid, &features)?;
        cpu.set_registers(&kvm_regs {
            rip: layout.entry,
            rsp: layout.stack,
            rflags: GUEST_RFLAGS,
            ..Default::default()
        })?;

        info!(
            "Machine ready: entry {:#x}, stack {:#x}, heap {:#x}",
            layout.entry, layout.stack, layout.heap
        );
        Ok(Self {
            vm,
            memory,
            cpu,
            smp: None,
            runtime,
            mmap_cursor: layout.heap + BRK_MAX,
            layout,
            cpuid,
            features,
            options,
            snapshot: None,
        })
    }

    /// A copy-on-write fork of `master`, which must have been prepared
    /// with [`prepare_copy_on_write`](Self::prepare_copy_on_write).
    pub fn fork(master: &Machine, options: MachineOptions) -> Result<Self, MachineError> {
        let (regs, sregs) = master.snapshot.ok_or(MachineError::NotPrepared)?;
        let template = master.memory.root_template().ok_or(MachineError::NotPrepared)?;

        let vm = create_vm()?;
        let installer: Arc<dyn MemoryInstaller> = Arc::clone(&vm) as Arc<dyn MemoryInstaller>;
        let memory = AddressSpace::fork_of(&master.memory, options.max_cow_pages(), options.mapping(), installer);
        memory.install_base(vm.as_ref())?;
        let root = memory.install_root(&template)?;
        memory.allocate_page_for_write(memory.physbase() + IST_ADDR, 0, true)?;
        let memory = Arc::new(memory);

        let runtime = Arc::clone(&master.runtime);
        let mut cpu = init_vcpu(&vm, 0, &memory, &runtime, &master.cpuid, &master.features)?;
        cpu.set_special_registers(&kvm_sregs { cr3: root, ..sregs })?;
        cpu.set_registers(&regs)?;
        cpu.mark_tables_current();

        debug!("Forked machine at {:#x}, root {root:#x}", memory.physbase());
        Ok(Self {
            vm,
            memory,
            cpu,
            smp: None,
            runtime,
            layout: master.layout,
            cpuid: master.cpuid.clone(),
            features: master.features,
            options,
            mmap_cursor: master.mmap_cursor,
            snapshot: master.snapshot,
        })
    }

    /// Turn this machine into a master that forks share memory with.
    ///
    /// The master itself may keep running with up to `max_work_mem` bytes
    /// of private pages; with 0 it must not run again.
    pub fn prepare_copy_on_write(&mut self, max_work_mem: u64) -> Result<(), MachineError> {
        if self.memory.is_forked() {
            return Err(MachineError::NotPrepared);
        }
        self.memory.make_cow()?;
        let work_pages = max_work_mem / PAGE_SIZE;
        self.memory.set_banked_capacity_pages(work_pages);

        let regs = self.cpu.registers()?;
        let sregs = self.cpu.special_registers()?;
        self.snapshot = Some((regs, sregs));

        if work_pages > 0 {
            let template = self.memory.root_template().ok_or(MachineError::NotPrepared)?;
            let root = self.memory.install_root(&template)?;
            self.memory.allocate_page_for_write(self.memory.physbase() + IST_ADDR, 0, true)?;
            self.cpu.set_special_registers(&kvm_sregs { cr3: root, ..sregs })?;
            self.cpu.mark_tables_current();
        }
        info!(
            "Machine at {:#x} prepared for copy-on-write ({work_pages} working pages)",
            self.memory.physbase()
        );
        Ok(())
    }

    /// Rewind a fork to `master`'s prepared state.
    pub fn reset_to(&mut self, master: &Machine) -> Result<(), MachineError> {
        if !self.memory.is_forked() || !self.memory.shares_base_with(&master.memory) {
            return Err(MachineError::ForkMismatch);
        }
        let (regs, sregs) = master.snapshot.ok_or(MachineError::NotPrepared)?;
        let template = master.memory.root_template().ok_or(MachineError::NotPrepared)?;

        self.cpu.remote_disconnect()?;
        self.smp = None;
        self.memory.reset_banks();
        let root = self.memory.install_root(&template)?;
        self.memory.allocate_page_for_write(self.memory.physbase() + IST_ADDR, 0, true)?;

        self.cpu.set_special_registers(&kvm_sregs { cr3: root, ..sregs })?;
        self.cpu.set_registers(&regs)?;
        self.cpu.mark_tables_current();
        self.mmap_cursor = master.mmap_cursor;
        debug!("Fork at {:#x} reset to master", self.memory.physbase());
        Ok(())
    }

    // ─── accessors ───────────────────────────────────────────────

    pub fn memory(&self) -> &Arc<AddressSpace> {
        &self.memory
    }

    pub fn cpu(&self) -> &VirtualCpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut VirtualCpu {
        &mut self.cpu
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn options(&self) -> &MachineOptions {
        &self.options
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    pub fn entry_address(&self) -> u64 {
        self.layout.entry
    }

    pub fn stack_address(&self) -> u64 {
        self.layout.stack
    }

    pub fn heap_address(&self) -> u64 {
        self.layout.heap
    }

    pub fn kernel_end_address(&self) -> u64 {
        self.layout.kernel_end
    }

    pub fn is_forked(&self) -> bool {
        self.memory.is_forked()
    }

    pub fn uses_cow_memory(&self) -> bool {
        self.memory.uses_cow()
    }

    // ─── execution ───────────────────────────────────────────────

    /// Run the main vCPU until the guest stops.  `Duration::ZERO` means
    /// no timeout.
    pub fn run(&mut self, timeout: Duration) -> Result<(), MachineError> {
        self.cpu.run(ticks_for(timeout))
    }

    pub fn run_once(&mut self) -> Result<RunOutcome, MachineError> {
        self.cpu.run_once()
    }

    pub fn stop(&mut self) {
        self.cpu.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.cpu.is_stopped()
    }

    pub fn step_one(&mut self) -> Result<RunOutcome, MachineError> {
        self.cpu.step_one()
    }

    pub fn run_with_breakpoints(&mut self, breakpoints: [u64; 4], timeout: Duration) -> Result<RunOutcome, MachineError> {
        self.cpu.run_with_breakpoints(breakpoints, ticks_for(timeout))
    }

    pub fn registers(&self) -> Result<kvm_regs, MachineError> {
        self.cpu.registers()
    }

    pub fn set_registers(&self, regs: &kvm_regs) -> Result<(), MachineError> {
        self.cpu.set_registers(regs)
    }

    pub fn special_registers(&self) -> Result<kvm_sregs, MachineError> {
        self.cpu.special_registers()
    }

    pub fn set_special_registers(&self, sregs: &kvm_sregs) -> Result<(), MachineError> {
        self.cpu.set_special_registers(sregs)
    }

    // ─── calls into the guest ────────────────────────────────────

    /// Prepare a call of `addr` on the machine's stack.
    pub fn setup_call(&mut self, addr: u64, args: &[u64]) -> Result<(), MachineError> {
        let stack = self.layout.stack;
        self.cpu.setup_call(addr, stack, args)
    }

    /// Like [`setup_call`](Self::setup_call) with an explicit stack
    /// pointer, e.g. below data placed with [`stack_push`](Self::stack_push).
    pub fn setup_call_on(&mut self, addr: u64, rsp: u64, args: &[u64]) -> Result<(), MachineError> {
        self.cpu.setup_call(addr, rsp, args)
    }

    /// Call `addr` and return its result.
    pub fn vmcall(&mut self, addr: u64, args: &[u64], timeout: Duration) -> Result<u64, MachineError> {
        self.setup_call(addr, args)?;
        self.run(timeout)?;
        self.return_value()
    }

    /// The value the guest passed to the exit stub.
    pub fn return_value(&self) -> Result<u64, MachineError> {
        Ok(self.cpu.registers()?.rdi)
    }

    /// Copy `data` below `*sp`, leaving `*sp` 8-byte aligned at its start.
    pub fn stack_push(&self, sp: &mut u64, data: &[u8]) -> Result<u64, MachineError> {
        let addr = (*sp - data.len() as u64) & !0x7;
        self.memory.copy_to_guest(addr, data)?;
        *sp = addr;
        Ok(addr)
    }

    /// Push a NUL-terminated copy of `s`.
    pub fn stack_push_cstr(&self, sp: &mut u64, s: &str) -> Result<u64, MachineError> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.stack_push(sp, &bytes)
    }

    pub fn translate(&self, vaddr: u64) -> Result<u64, MachineError> {
        self.cpu.translate(vaddr)
    }

    // ─── memory helpers ──────────────────────────────────────────

    pub fn copy_to_guest(&self, addr: u64, data: &[u8]) -> Result<(), MachineError> {
        Ok(self.memory.copy_to_guest(addr, data)?)
    }

    pub fn copy_from_guest(&self, addr: u64, buf: &mut [u8]) -> Result<(), MachineError> {
        Ok(self.memory.copy_from_guest(addr, buf)?)
    }

    /// Read memory the guest cannot address itself (kernel area).
    pub fn unsafe_copy_from_guest(&self, addr: u64, buf: &mut [u8]) -> Result<(), MachineError> {
        Ok(self.memory.kernel_copy_from_guest(addr, buf)?)
    }

    /// Start of the mmap area.
    pub fn mmap_start(&self) -> u64 {
        self.layout.heap + BRK_MAX
    }

    /// Current end of the mmap area.
    pub fn mmap_end(&self) -> u64 {
        self.mmap_cursor
    }

    /// Bump-allocate `len` bytes (page granular) from the mmap area.
    pub fn mmap_allocate(&mut self, len: u64) -> Result<u64, MachineError> {
        let addr = self.mmap_cursor;
        let next = addr.saturating_add(align_up(len.max(1), PAGE_SIZE));
        if next > self.memory.end() {
            return Err(MemoryError::OutOfRange { addr, len }.into());
        }
        self.mmap_cursor = next;
        Ok(addr)
    }

    pub fn banked_memory_pages(&self) -> u64 {
        self.memory.banked_pages()
    }

    pub fn banked_memory_allocated_pages(&self) -> u64 {
        self.memory.banked_allocated_pages()
    }

    pub fn banked_memory_capacity_pages(&self) -> u64 {
        self.memory.banked_capacity_pages()
    }

    // ─── diagnostics ─────────────────────────────────────────────

    pub fn print(&self, text: &str) {
        self.runtime.syscalls.print(text);
    }

    pub fn print_registers(&self) -> Result<(), MachineError> {
        self.cpu.print_registers()
    }

    pub fn print_pagetables(&self) -> Result<(), MachineError> {
        let lines = self.memory.describe_pagetables()?;
        self.print(&lines.join("\n"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_round_up_to_a_millisecond() {
        assert_eq!(ticks_for(Duration::ZERO), 0);
        assert_eq!(ticks_for(Duration::from_micros(10)), 1);
        assert_eq!(ticks_for(Duration::from_millis(250)), 250);
        assert_eq!(ticks_for(Duration::from_secs(u64::MAX)), u32::MAX);
    }

    #[test]
    fn default_options_fit_the_layout() {
        let options = MachineOptions::default();
        assert_eq!(options.max_cow_pages(), 4096);
        assert_eq!(options.vmem_base_address % crate::memory::PHYSBASE_ALIGN, 0);
        assert_eq!(options.mapping(), MappingOptions::default());
    }

    #[test]
    fn only_timeouts_are_timeouts() {
        assert!(MachineError::Timeout { ticks: 5 }.is_timeout());
        assert!(!MachineError::Halted.is_timeout());
        assert!(!MachineError::from(MemoryError::OutOfRange { addr: 0, len: 1 }).is_timeout());
    }

    #[test]
    fn errors_name_the_failure() {
        let err = MachineError::Exception { name: "Invalid Opcode", vector: 6 };
        assert_eq!(err.to_string(), "CPU exception: Invalid Opcode (vector 6)");
        let err = MachineError::from(MemoryError::OutOfRange { addr: 0x10, len: 8 });
        assert_eq!(
            err.to_string(),
            "Memory access outside of guest memory: addr=0x10 len=0x8"
        );
    }
}

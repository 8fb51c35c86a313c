//! tinyvm: a KVM micro-VM control plane.
//!
//! Runs small 64-bit guest programs in ring 3 under KVM with a minimal
//! in-guest trampoline for system calls and exceptions.  Machines can be
//! forked copy-on-write from a prepared master in O(1), and one machine
//! can address another machine's memory in place (remote memory).
//!
//! # Architecture
//!
//! - [`memory`]: guest-physical layout, `AddressSpace`, host mappings
//! - [`bank`]: copy-on-write page pools
//! - [`paging`]: identity tables, copy-on-write materialization, guest copies
//! - [`cpu`]: CPUID, GDT/TSS, long-mode registers, MSRs
//! - [`idt`]: exception table and exception reports
//! - [`trampoline`]: the guest trampoline blob and vsyscall page
//! - [`timer`]: per-run execution timeout
//! - [`syscalls`]: system-call table and embedder callbacks
//! - [`vcpu`]: the run loop
//! - [`image`]: flat and ELF guest payloads
//! - [`machine`]: construction, forking, calls into the guest
//! - [`smp`]: parallel calls on extra vCPUs
//! - [`remote`]: remote memory bridging
//! - [`verified`]: pure encoders and decoders for hardware structures

pub mod bank;
pub mod cpu;
pub mod idt;
pub mod image;
pub mod machine;
pub mod memory;
pub mod paging;
pub mod remote;
pub mod smp;
pub mod syscalls;
pub mod timer;
pub mod trampoline;
pub mod vcpu;
pub mod verified;

pub use image::{ElfImage, FlatImage, GuestImage, ImageError, ImageLayout};
pub use machine::{Machine, MachineError, MachineOptions, Runtime};
pub use memory::{AddressSpace, MemoryError};
pub use syscalls::{InputContext, RegistryError, SyscallRegistry};
pub use trampoline::{Trampoline, TrampolineError};
pub use vcpu::{ExitReason, RunOutcome, VirtualCpu};

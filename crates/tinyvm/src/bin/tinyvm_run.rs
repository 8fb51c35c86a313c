//! Run a guest program in a tinyvm machine.
//!
//! # Usage
//!
//! ```bash
//! # Flat binary with the built-in trampoline, 1 s timeout
//! tinyvm-run guest.bin --timeout-ms 1000
//!
//! # Static ELF with an external trampoline blob
//! tinyvm-run --elf guest.elf --trampoline interrupts.bin --memory-mb 256
//! ```
//!
//! Guest output on any I/O port is written to stdout one byte per `out`.
//! The guest may also use `write(1|2, buf, len)` (system call 1) and
//! `exit(code)` (system call 60).

use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tinyvm::syscalls::SyscallRegistry;
use tinyvm::{ElfImage, FlatImage, GuestImage, Machine, MachineError, MachineOptions, Runtime, Trampoline, VirtualCpu};

const SYS_WRITE: u32 = 1;
const SYS_EXIT: u32 = 60;

/// Largest single write accepted from the guest.
const MAX_WRITE: u64 = 1 << 20;

#[derive(Parser)]
#[command(name = "tinyvm-run")]
#[command(about = "Run a 64-bit guest program under KVM")]
#[command(version)]
struct Cli {
    /// Guest program (flat binary unless --elf).
    payload: String,

    /// Treat the payload as a static ELF executable.
    #[arg(long)]
    elf: bool,

    /// Trampoline blob to install instead of the built-in one.
    #[arg(long)]
    trampoline: Option<String>,

    /// Execution timeout in milliseconds (0 = none).
    #[arg(long, default_value = "0")]
    timeout_ms: u64,

    /// Guest memory in MiB.
    #[arg(long, default_value = "64")]
    memory_mb: u64,

    /// Leave the heap executable.
    #[arg(long)]
    executable_heap: bool,

    /// Back guest memory with huge pages when available.
    #[arg(long)]
    hugepages: bool,
}

fn sys_write(cpu: &mut VirtualCpu) -> Result<(), MachineError> {
    let mut regs = cpu.registers()?;
    let (fd, buf, len) = (regs.rdi, regs.rsi, regs.rdx.min(MAX_WRITE));
    regs.rax = if fd == 1 || fd == 2 {
        let mut data = vec![0u8; len as usize];
        cpu.memory().copy_from_guest(buf, &mut data)?;
        let written = if fd == 1 {
            std::io::stdout().write_all(&data)
        } else {
            std::io::stderr().write_all(&data)
        };
        match written {
            Ok(()) => len,
            Err(_) => (-(libc::EIO as i64)) as u64,
        }
    } else {
        (-(libc::EBADF as i64)) as u64
    };
    cpu.set_registers(&regs)
}

fn sys_exit(cpu: &mut VirtualCpu) -> Result<(), MachineError> {
    let code = cpu.registers()?.rdi;
    log::info!("Guest exit({code})");
    cpu.stop();
    Ok(())
}

fn build_runtime(cli: &Cli) -> Result<std::sync::Arc<Runtime>, Box<dyn std::error::Error>> {
    let trampoline = match &cli.trampoline {
        Some(path) => Trampoline::from_file(path)?,
        None => Trampoline::minimal(),
    };
    let syscalls = SyscallRegistry::new()
        .on_syscall(SYS_WRITE, sys_write)?
        .on_syscall(SYS_EXIT, sys_exit)?
        .on_output(|_cpu, _port, value| {
            let mut out = std::io::stdout();
            // Output is best effort; a closed stdout must not kill the guest.
            let _ = out.write_all(&[value as u8]).and_then(|()| out.flush());
            Ok(())
        });
    Ok(Runtime::install(Runtime::new(syscalls, trampoline))?)
}

fn run(cli: &Cli) -> Result<u64, Box<dyn std::error::Error>> {
    let runtime = build_runtime(cli)?;
    let image: Box<dyn GuestImage> = if cli.elf {
        Box::new(ElfImage::new(&cli.payload))
    } else {
        Box::new(FlatImage::from_file(&cli.payload)?)
    };
    let options = MachineOptions {
        max_mem: cli.memory_mb << 20,
        executable_heap: cli.executable_heap,
        hugepages: cli.hugepages,
        ..Default::default()
    };

    let mut machine = Machine::new(image.as_ref(), options, runtime)?;
    log::info!("Running {} (entry {:#x})", cli.payload, machine.entry_address());
    machine.run(Duration::from_millis(cli.timeout_ms))?;
    Ok(machine.return_value()?)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(value) => {
            log::info!("Guest stopped (rdi = {value:#x})");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

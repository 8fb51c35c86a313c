//! End-to-end tests against a real KVM.  Every test returns early when
//! `/dev/kvm` cannot be opened.
//!
//! Payloads are hand-assembled x86-64 and loaded as flat images at
//! `physbase + 2 MiB`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tinyvm::machine::kvm;
use tinyvm::timer::TIMER_INTERVAL;
use tinyvm::{FlatImage, Machine, MachineError, MachineOptions, Runtime, SyscallRegistry, Trampoline};

const TIMEOUT: Duration = Duration::from_secs(2);

/// mov eax, 0xFFFF; out 0, eax
const EXIT: [u8; 7] = [0xB8, 0xFF, 0xFF, 0x00, 0x00, 0xE7, 0x00];

/// lea rax, [rdi + rsi]; ret
const ADD: [u8; 5] = [0x48, 0x8D, 0x04, 0x37, 0xC3];

/// mov [rdi], rsi; mov rax, [rdi]; ret
const STORE: [u8; 7] = [0x48, 0x89, 0x37, 0x48, 0x8B, 0x07, 0xC3];

fn kvm_available() -> bool {
    match kvm() {
        Ok(_) => true,
        Err(e) => {
            eprintln!("skipping: {e}");
            false
        }
    }
}

fn machine(code: &[u8], options: MachineOptions) -> Machine {
    Machine::new(&FlatImage::new(code), options, Runtime::minimal()).unwrap()
}

fn read_u64(machine: &Machine, addr: u64) -> u64 {
    let mut buf = [0u8; 8];
    machine.copy_from_guest(addr, &mut buf).unwrap();
    u64::from_le_bytes(buf)
}

#[test]
fn exit_stops_the_machine() {
    if !kvm_available() {
        return;
    }
    // mov edi, 42; <exit>
    let mut code = vec![0xBF, 0x2A, 0x00, 0x00, 0x00];
    code.extend_from_slice(&EXIT);

    let mut m = machine(&code, MachineOptions::default());
    m.run(TIMEOUT).unwrap();
    assert!(m.is_stopped());
    assert_eq!(m.return_value().unwrap(), 42);
}

#[test]
fn syscalls_reach_their_handler() {
    if !kvm_available() {
        return;
    }
    // mov eax, 7; mov edi, 5; syscall; mov rdi, rax; <exit>
    let mut code = vec![
        0xB8, 0x07, 0x00, 0x00, 0x00, 0xBF, 0x05, 0x00, 0x00, 0x00, 0x0F, 0x05, 0x48, 0x89, 0xC7,
    ];
    code.extend_from_slice(&EXIT);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let syscalls = SyscallRegistry::new()
        .on_syscall(7, move |cpu| {
            let mut regs = cpu.registers()?;
            log.lock().unwrap().push(regs.rdi);
            regs.rax = regs.rdi * 2;
            cpu.set_registers(&regs)
        })
        .unwrap();
    let runtime = Runtime::new(syscalls, Trampoline::minimal());

    let mut m = Machine::new(&FlatImage::new(code), MachineOptions::default(), runtime).unwrap();
    m.run(TIMEOUT).unwrap();
    assert_eq!(m.return_value().unwrap(), 10);
    assert_eq!(*seen.lock().unwrap(), vec![5]);
}

#[test]
fn unhandled_syscalls_return_enosys() {
    if !kvm_available() {
        return;
    }
    // mov eax, 300; syscall; mov rdi, rax; <exit>
    let mut code = vec![0xB8, 0x2C, 0x01, 0x00, 0x00, 0x0F, 0x05, 0x48, 0x89, 0xC7];
    code.extend_from_slice(&EXIT);

    let mut m = machine(&code, MachineOptions::default());
    m.run(TIMEOUT).unwrap();
    assert_eq!(m.return_value().unwrap() as i64, -(libc::ENOSYS as i64));
}

#[test]
fn output_ports_reach_the_callback() {
    if !kvm_available() {
        return;
    }
    // mov dx, 0x3F8; mov al, 'h'; out dx, al; <exit>
    let mut code = vec![0x66, 0xBA, 0xF8, 0x03, 0xB0, 0x68, 0xEE];
    code.extend_from_slice(&EXIT);

    let written = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&written);
    let syscalls = SyscallRegistry::new().on_output(move |_cpu, port, value| {
        sink.lock().unwrap().push((port, value as u8));
        Ok(())
    });
    let runtime = Runtime::new(syscalls, Trampoline::minimal());

    let mut m = Machine::new(&FlatImage::new(code), MachineOptions::default(), runtime).unwrap();
    m.run(TIMEOUT).unwrap();
    assert_eq!(*written.lock().unwrap(), vec![(0x3F8, b'h')]);
}

#[test]
fn endless_loops_time_out() {
    if !kvm_available() {
        return;
    }
    // jmp $
    let mut m = machine(&[0xEB, 0xFE], MachineOptions::default());
    let err = m.run(Duration::from_millis(50)).unwrap_err();
    assert!(err.is_timeout(), "{err}");
}

#[test]
fn timeouts_fire_within_one_timer_interval() {
    if !kvm_available() {
        return;
    }
    // Scheduling noise on a loaded host.
    let slack = Duration::from_millis(30);
    let mut m = machine(&[0xEB, 0xFE], MachineOptions::default());
    for ms in [50, 100, 200] {
        let timeout = Duration::from_millis(ms);
        let entry = m.entry_address();
        m.setup_call(entry, &[]).unwrap();

        let start = Instant::now();
        let err = m.run(timeout).unwrap_err();
        let elapsed = start.elapsed();

        assert!(err.is_timeout(), "{err}");
        assert!(elapsed >= timeout, "{ms} ms timeout fired after {elapsed:?}");
        assert!(
            elapsed < timeout + TIMER_INTERVAL + slack,
            "{ms} ms timeout fired after {elapsed:?}"
        );
    }
}

#[test]
fn halting_is_an_error() {
    if !kvm_available() {
        return;
    }
    // hlt is privileged in ring 3 and faults with #GP.
    let mut m = machine(&[0xF4], MachineOptions::default());
    let err = m.run(TIMEOUT).unwrap_err();
    assert!(
        matches!(err, MachineError::Exception { vector: 13, .. } | MachineError::Halted),
        "{err}"
    );
}

#[test]
fn vmcall_returns_the_result() {
    if !kvm_available() {
        return;
    }
    let mut m = machine(&ADD, MachineOptions::default());
    let entry = m.entry_address();
    assert_eq!(m.vmcall(entry, &[2, 3], TIMEOUT).unwrap(), 5);
    assert_eq!(m.vmcall(entry, &[40, 2], TIMEOUT).unwrap(), 42);
    assert!(matches!(
        m.vmcall(entry, &[0; 7], TIMEOUT),
        Err(MachineError::TooManyArguments { count: 7 })
    ));
}

#[test]
fn guest_writes_are_visible_to_the_host() {
    if !kvm_available() {
        return;
    }
    let mut m = machine(&STORE, MachineOptions::default());
    let entry = m.entry_address();
    let data = m.mmap_allocate(4096).unwrap();
    assert_eq!(m.vmcall(entry, &[data, 0xDEAD_BEEF], TIMEOUT).unwrap(), 0xDEAD_BEEF);
    assert_eq!(read_u64(&m, data), 0xDEAD_BEEF);
}

#[test]
fn forks_do_not_see_each_others_writes() {
    if !kvm_available() {
        return;
    }
    let mut master = machine(&STORE, MachineOptions::default());
    let entry = master.entry_address();
    let data = master.mmap_allocate(4096).unwrap();
    master.copy_to_guest(data, &7u64.to_le_bytes()).unwrap();
    master.prepare_copy_on_write(0).unwrap();

    let mut a = Machine::fork(&master, MachineOptions::default()).unwrap();
    let mut b = Machine::fork(&master, MachineOptions::default()).unwrap();
    assert!(a.is_forked() && b.is_forked());

    assert_eq!(a.vmcall(entry, &[data, 111], TIMEOUT).unwrap(), 111);
    assert_eq!(b.vmcall(entry, &[data, 222], TIMEOUT).unwrap(), 222);

    assert_eq!(read_u64(&a, data), 111);
    assert_eq!(read_u64(&b, data), 222);
    assert_eq!(read_u64(&master, data), 7);
    assert!(a.banked_memory_allocated_pages() > 0);
}

#[test]
fn reset_rewinds_a_fork() {
    if !kvm_available() {
        return;
    }
    let mut master = machine(&STORE, MachineOptions::default());
    let entry = master.entry_address();
    let data = master.mmap_allocate(4096).unwrap();
    master.prepare_copy_on_write(0).unwrap();

    let mut fork = Machine::fork(&master, MachineOptions::default()).unwrap();
    for round in 1..=3u64 {
        assert_eq!(read_u64(&fork, data), 0);
        assert_eq!(fork.vmcall(entry, &[data, round], TIMEOUT).unwrap(), round);
        assert_eq!(read_u64(&fork, data), round);
        fork.reset_to(&master).unwrap();
    }
    assert_eq!(read_u64(&fork, data), 0);
}

#[test]
fn forking_needs_a_prepared_master() {
    if !kvm_available() {
        return;
    }
    let master = machine(&ADD, MachineOptions::default());
    assert!(matches!(
        Machine::fork(&master, MachineOptions::default()),
        Err(MachineError::NotPrepared)
    ));

    let mut other = machine(&ADD, MachineOptions::default());
    assert!(matches!(other.reset_to(&master), Err(MachineError::ForkMismatch)));
}

#[test]
fn smp_calls_run_on_every_cpu() {
    if !kvm_available() {
        return;
    }
    let mut m = machine(&ADD, MachineOptions::default());
    let entry = m.entry_address();
    let stack_size = 0x4000;
    let stacks = m.mmap_allocate(4 * stack_size).unwrap();

    m.timed_smpcall(4, stacks, stack_size, entry, TIMEOUT, &[20, 22]).unwrap();
    let results = m.gather_return_values();
    assert_eq!(results.len(), 4);
    for result in results {
        assert_eq!(result.unwrap(), 42);
    }
    assert_eq!(m.smp_cpus(), 4);

    // rdi = index, rsi = item address
    let items = m.mmap_allocate(4096).unwrap();
    m.timed_smpcall_array(2, stacks, stack_size, entry, TIMEOUT, items, 16).unwrap();
    let results: Vec<u64> = m.gather_return_values().into_iter().map(Result::unwrap).collect();
    assert_eq!(results, vec![items, 1 + items + 16]);
}

#[test]
fn smp_failures_are_reported_per_cpu() {
    if !kvm_available() {
        return;
    }
    // cmp rdi, 1; jne +1; hlt; lea rax, [rdi + rsi]; ret
    let code = [0x48, 0x83, 0xFF, 0x01, 0x75, 0x01, 0xF4, 0x48, 0x8D, 0x04, 0x37, 0xC3];
    let mut m = machine(&code, MachineOptions::default());
    let entry = m.entry_address();
    let stack_size = 0x4000;
    let stacks = m.mmap_allocate(3 * stack_size).unwrap();
    let items = m.mmap_allocate(4096).unwrap();

    m.timed_smpcall_array(3, stacks, stack_size, entry, TIMEOUT, items, 16).unwrap();
    let results = m.gather_return_values();
    assert_eq!(results.len(), 3);
    assert_eq!(*results[0].as_ref().unwrap(), items);
    assert!(
        matches!(results[1], Err(MachineError::Exception { vector: 13, .. } | MachineError::Halted)),
        "{:?}",
        results[1]
    );
    assert_eq!(*results[2].as_ref().unwrap(), 2 + items + 32);
}

#[test]
fn remote_connection_is_idempotent() {
    if !kvm_available() {
        return;
    }
    let remote = machine(
        &ADD,
        MachineOptions {
            vmem_base_address: 1 << 30,
            ..Default::default()
        },
    );
    let mut host = machine(&ADD, MachineOptions::default());

    let remote_code = remote.entry_address();
    let mut buf = [0u8; ADD.len()];
    assert!(host.copy_from_guest(remote_code, &mut buf).is_err());

    host.remote_connect(&remote, true).unwrap();
    assert!(host.has_remote());
    assert!(host.is_remote_connected());
    host.copy_from_guest(remote_code, &mut buf).unwrap();
    assert_eq!(buf, ADD);
    assert_eq!(host.remote_activate_now().unwrap(), 1);
    assert!(host.is_remote_connected());

    assert_ne!(host.remote_disconnect().unwrap(), 0);
    assert!(!host.is_remote_connected());
    assert!(host.copy_from_guest(remote_code, &mut buf).is_err());
    assert_eq!(host.remote_disconnect().unwrap(), 0);
    assert!(host.has_remote());
}

#[test]
fn calls_into_a_remote_activate_it_on_demand() {
    if !kvm_available() {
        return;
    }
    let remote = machine(
        &ADD,
        MachineOptions {
            vmem_base_address: 1 << 30,
            ..Default::default()
        },
    );
    let mut host = machine(&EXIT, MachineOptions::default());
    host.remote_connect(&remote, false).unwrap();
    assert!(!host.is_remote_connected());

    let remote_add = remote.entry_address();
    assert_eq!(host.vmcall(remote_add, &[4, 5], TIMEOUT).unwrap(), 9);
    assert!(!host.is_remote_connected());
}

#[test]
fn overlapping_remotes_are_rejected() {
    if !kvm_available() {
        return;
    }
    let remote = machine(&ADD, MachineOptions::default());
    let mut host = machine(&ADD, MachineOptions::default());
    assert!(matches!(
        host.remote_connect(&remote, true),
        Err(MachineError::RemoteRange { .. })
    ));
}

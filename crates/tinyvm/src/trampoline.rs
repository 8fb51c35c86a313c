//! The guest trampoline blob and the vsyscall page.
//!
//! The trampoline is a small piece of guest machine code copied to
//! `physbase + 0x2000`.  The host only knows it through its header:
//!
//! ```text
//!   0   u16 syscall            SYSCALL entry (LSTAR)
//!   2   u16 gettimeofday       time-of-day helper
//!   4   u16 exception          first exception stub
//!   6   u16 exception_stride   bytes between stubs
//!   8   u16 tls                thread-local-storage helper
//!   10  u16 remote_disconnect  stub a remote call returns through
//!   12  u32 reserved
//!   16  u64 remote_base        patched by the host
//!   24  u64 remote_return      patched by the host
//! ```
//!
//! [`Trampoline::from_bytes`] accepts any blob whose offsets line up;
//! [`Trampoline::minimal`] builds a self-contained blob that is enough to
//! run bare payloads (syscalls over port 0, page-fault driven copy-on-write,
//! deferred remote activation).

use std::path::Path;

use thiserror::Error;

use crate::memory::{AddressSpace, MemoryError, INTR_ASM_ADDR, MAX_SMP_CPUS, PAGE_SIZE, VSYS_ADDR, VSYS_CPUID_OFFSET, VSYS_EXIT_OFFSET};
use crate::verified::idt::{exception_has_code, handled_vectors, EXCEPTION_STUBS, PAGE_FAULT_VECTOR, TIMER_VECTOR};

/// Size of the fixed header.
pub const HEADER_SIZE: usize = 32;

/// The blob must fit its single page.
pub const MAX_TRAMPOLINE_SIZE: usize = PAGE_SIZE as usize;

/// Offset of the patchable remote base field.
pub const REMOTE_BASE_FIELD: u64 = 16;

/// Offset of the patchable remote return field.
pub const REMOTE_RETURN_FIELD: u64 = 24;

/// Port-0 value that ends the guest.
pub const EXIT_SYSCALL: u32 = 0xFFFF;

/// Port-0 value sent by the remote-disconnect stub.
pub const REMOTE_DISCONNECT_SYSCALL: u32 = 0x1F778;

/// First port of the exception notification range.
pub const EXCEPTION_PORT_BASE: u16 = 0x80;

/// One past the last exception notification port.
pub const EXCEPTION_PORT_END: u16 = 0x100;

const SYS_GETTIMEOFDAY: u32 = 96;
const SYS_ARCH_PRCTL: u32 = 158;

#[derive(Error, Debug)]
pub enum TrampolineError {
    #[error("Trampoline of {len} bytes is shorter than its {HEADER_SIZE}-byte header")]
    TooSmall { len: usize },

    #[error("Trampoline of {len} bytes does not fit in one page")]
    TooLarge { len: usize },

    #[error("Trampoline field {field} points outside the blob (offset {offset:#x})")]
    OffsetOutOfRange { field: &'static str, offset: u16 },

    #[error("Trampoline exception stubs at {exception:#x} with stride {stride} overflow the blob")]
    StubsOverflow { exception: u16, stride: u16 },

    #[error("Failed to read trampoline: {0}")]
    Io(#[from] std::io::Error),
}

/// Entry-point offsets decoded from the blob header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrampolineHeader {
    pub syscall: u16,
    pub gettimeofday: u16,
    pub exception: u16,
    pub exception_stride: u16,
    pub tls: u16,
    pub remote_disconnect: u16,
}

impl TrampolineHeader {
    /// Decode and validate the header of `blob`.
    pub fn parse(blob: &[u8]) -> Result<Self, TrampolineError> {
        let len = blob.len();
        if len < HEADER_SIZE {
            return Err(TrampolineError::TooSmall { len });
        }
        if len > MAX_TRAMPOLINE_SIZE {
            return Err(TrampolineError::TooLarge { len });
        }
        let field = |at: usize| u16::from_le_bytes([blob[at], blob[at + 1]]);
        let header = Self {
            syscall: field(0),
            gettimeofday: field(2),
            exception: field(4),
            exception_stride: field(6),
            tls: field(8),
            remote_disconnect: field(10),
        };
        header.validate(len)?;
        Ok(header)
    }

    fn validate(&self, len: usize) -> Result<(), TrampolineError> {
        let entries = [
            ("syscall", self.syscall),
            ("gettimeofday", self.gettimeofday),
            ("tls", self.tls),
            ("remote_disconnect", self.remote_disconnect),
            ("exception", self.exception),
        ];
        for (field, offset) in entries {
            if (offset as usize) < HEADER_SIZE || offset as usize >= len {
                return Err(TrampolineError::OffsetOutOfRange { field, offset });
            }
        }
        let stubs_end = self.exception as u64 + EXCEPTION_STUBS * self.exception_stride as u64;
        if self.exception_stride == 0 || stubs_end > len as u64 {
            return Err(TrampolineError::StubsOverflow {
                exception: self.exception,
                stride: self.exception_stride,
            });
        }
        Ok(())
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let fields = [
            self.syscall,
            self.gettimeofday,
            self.exception,
            self.exception_stride,
            self.tls,
            self.remote_disconnect,
        ];
        for (i, value) in fields.into_iter().enumerate() {
            out[i * 2..i * 2 + 2].copy_from_slice(&value.to_le_bytes());
        }
        out
    }
}

/// A validated trampoline blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trampoline {
    blob: Vec<u8>,
    header: TrampolineHeader,
}

impl Trampoline {
    pub fn from_bytes(blob: Vec<u8>) -> Result<Self, TrampolineError> {
        let header = TrampolineHeader::parse(&blob)?;
        Ok(Self { blob, header })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TrampolineError> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// The built-in blob.
    pub fn minimal() -> Self {
        let (blob, header) = minimal_blob();
        debug_assert!(header.validate(blob.len()).is_ok());
        Self { blob, header }
    }

    pub fn header(&self) -> &TrampolineHeader {
        &self.header
    }

    pub fn bytes(&self) -> &[u8] {
        &self.blob
    }

    // ─── guest addresses ─────────────────────────────────────────

    pub fn base(physbase: u64) -> u64 {
        physbase + INTR_ASM_ADDR
    }

    pub fn syscall_entry(&self, physbase: u64) -> u64 {
        Self::base(physbase) + u64::from(self.header.syscall)
    }

    pub fn exception_stubs(&self, physbase: u64) -> u64 {
        Self::base(physbase) + u64::from(self.header.exception)
    }

    pub fn exception_stride(&self) -> u64 {
        u64::from(self.header.exception_stride)
    }

    pub fn gettimeofday_entry(&self, physbase: u64) -> u64 {
        Self::base(physbase) + u64::from(self.header.gettimeofday)
    }

    pub fn tls_entry(&self, physbase: u64) -> u64 {
        Self::base(physbase) + u64::from(self.header.tls)
    }

    pub fn remote_disconnect_entry(&self, physbase: u64) -> u64 {
        Self::base(physbase) + u64::from(self.header.remote_disconnect)
    }

    /// Return address used by [`vmcall`](crate::Machine::vmcall)-style
    /// calls: the vsyscall exit stub.
    pub fn exit_address(physbase: u64) -> u64 {
        physbase + VSYS_ADDR + VSYS_EXIT_OFFSET
    }

    // ─── installation ────────────────────────────────────────────

    /// Copy the blob and the vsyscall page into `memory`.
    pub fn install(&self, memory: &AddressSpace) -> Result<(), MemoryError> {
        let physbase = memory.physbase();
        memory.kernel_copy_to_guest(Self::base(physbase), &self.blob)?;
        memory.kernel_copy_to_guest(physbase + VSYS_ADDR, &self.vsyscall_page(physbase))
    }

    /// Contents of the vsyscall page: a jump to the time-of-day helper at
    /// +0, the exit stub, and the per-CPU id table read through GS.
    pub fn vsyscall_page(&self, physbase: u64) -> Vec<u8> {
        let mut page = vec![0xCCu8; PAGE_SIZE as usize];

        let from = physbase + VSYS_ADDR + 5;
        let rel = self.gettimeofday_entry(physbase).wrapping_sub(from) as i64 as i32;
        page[0] = 0xE9;
        page[1..5].copy_from_slice(&rel.to_le_bytes());

        let exit = VSYS_EXIT_OFFSET as usize;
        page[exit..exit + EXIT_STUB.len()].copy_from_slice(&EXIT_STUB);

        for cpu in 0..=MAX_SMP_CPUS {
            let at = VSYS_CPUID_OFFSET as usize + 4 * cpu;
            page[at..at + 4].copy_from_slice(&(cpu as u32).to_le_bytes());
        }
        page
    }

    /// Write the remote base and return address into the installed
    /// header.
    pub fn patch_remote(memory: &AddressSpace, remote_base: u64, remote_return: u64) -> Result<(), MemoryError> {
        let base = Self::base(memory.physbase());
        memory.kernel_copy_to_guest(base + REMOTE_BASE_FIELD, &remote_base.to_le_bytes())?;
        memory.kernel_copy_to_guest(base + REMOTE_RETURN_FIELD, &remote_return.to_le_bytes())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Built-in blob
// ═══════════════════════════════════════════════════════════════════════

/// mov rdi, rax; mov eax, 0xFFFF; out 0, eax
const EXIT_STUB: [u8; 10] = [0x48, 0x89, 0xC7, 0xB8, 0xFF, 0xFF, 0x00, 0x00, 0xE7, 0x00];

const MINIMAL_STRIDE: usize = 64;
const MINIMAL_STUBS: usize = HEADER_SIZE;
const MINIMAL_SYSCALL: usize = MINIMAL_STUBS + EXCEPTION_STUBS as usize * MINIMAL_STRIDE;
const MINIMAL_GETTIMEOFDAY: usize = MINIMAL_SYSCALL + 16;
const MINIMAL_TLS: usize = MINIMAL_GETTIMEOFDAY + 16;
const MINIMAL_REMOTE_DISCONNECT: usize = MINIMAL_TLS + 16;
const MINIMAL_SIZE: usize = MINIMAL_REMOTE_DISCONNECT + 32;

const _: () = assert!(MINIMAL_SIZE <= MAX_TRAMPOLINE_SIZE);

/// Page-fault stub.  Reports cr2 in rdi and the error code in rax.  When
/// the host answers 1 (remote activated) the interrupted call's return
/// address is redirected to the remote-disconnect stub.
fn page_fault_stub(stub_offset: usize) -> Vec<u8> {
    let mut code = vec![
        0x57, // push rdi
        0x50, // push rax
        0x0F, 0x20, 0xD7, // mov rdi, cr2
        0x48, 0x8B, 0x44, 0x24, 0x10, // mov rax, [rsp+16]
        0xE6, 0x80 + PAGE_FAULT_VECTOR, // out 0x8E, al
        0x0F, 0x01, 0x3F, // invlpg [rdi]
        0x48, 0x85, 0xC0, // test rax, rax
        0x74, 0x0F, // jz .done
        0x48, 0x8B, 0x7C, 0x24, 0x30, // mov rdi, [rsp+48]
        0x48, 0x8D, 0x05, // lea rax, [rip+rel32]
    ];
    let next = stub_offset + code.len() + 4;
    let rel = MINIMAL_REMOTE_DISCONNECT as i32 - next as i32;
    code.extend_from_slice(&rel.to_le_bytes());
    code.extend_from_slice(&[
        0x48, 0x89, 0x07, // mov [rdi], rax
        0x58, // .done: pop rax
        0x5F, // pop rdi
        0x48, 0x83, 0xC4, 0x08, // add rsp, 8
        0x48, 0xCF, // iretq
    ]);
    code
}

/// Reports the vector and returns; the host never resumes these.
fn exception_stub(vector: u8) -> Vec<u8> {
    let mut code = vec![0xE6, EXCEPTION_PORT_BASE as u8 + vector];
    if exception_has_code(vector) {
        code.extend_from_slice(&[0x48, 0x83, 0xC4, 0x08]);
    }
    code.extend_from_slice(&[0x48, 0xCF]);
    code
}

fn syscall_helper(nr: u32) -> Vec<u8> {
    let mut code = vec![0xB8];
    code.extend_from_slice(&nr.to_le_bytes());
    code.extend_from_slice(&[0xE7, 0x00, 0xC3]); // out 0, eax; ret
    code
}

fn minimal_blob() -> (Vec<u8>, TrampolineHeader) {
    // hlt in every gap: reaching one is a guest bug and exits as a halt.
    let mut blob = vec![0xF4u8; MINIMAL_SIZE];
    let header = TrampolineHeader {
        syscall: MINIMAL_SYSCALL as u16,
        gettimeofday: MINIMAL_GETTIMEOFDAY as u16,
        exception: MINIMAL_STUBS as u16,
        exception_stride: MINIMAL_STRIDE as u16,
        tls: MINIMAL_TLS as u16,
        remote_disconnect: MINIMAL_REMOTE_DISCONNECT as u16,
    };
    blob[..HEADER_SIZE].copy_from_slice(&header.to_bytes());

    let mut place = |offset: usize, code: &[u8]| blob[offset..offset + code.len()].copy_from_slice(code);

    for (slot, vector) in handled_vectors().enumerate() {
        let offset = MINIMAL_STUBS + slot * MINIMAL_STRIDE;
        let code = if vector == PAGE_FAULT_VECTOR {
            page_fault_stub(offset)
        } else {
            exception_stub(vector)
        };
        debug_assert!(code.len() <= MINIMAL_STRIDE);
        place(offset, &code);
    }
    let timer = MINIMAL_STUBS + (EXCEPTION_STUBS as usize - 1) * MINIMAL_STRIDE;
    place(timer, &[0xE6, EXCEPTION_PORT_BASE as u8 + TIMER_VECTOR, 0x48, 0xCF]);

    // out 0, eax; sysretq
    place(MINIMAL_SYSCALL, &[0xE7, 0x00, 0x48, 0x0F, 0x07]);
    place(MINIMAL_GETTIMEOFDAY, &syscall_helper(SYS_GETTIMEOFDAY));
    place(MINIMAL_TLS, &syscall_helper(SYS_ARCH_PRCTL));
    place(
        MINIMAL_REMOTE_DISCONNECT,
        &[
            0x48, 0x83, 0xEC, 0x08, // sub rsp, 8 (return slot)
            0x50, // push rax
            0x48, 0x83, 0xEC, 0x10, // sub rsp, 16
            0xB8, 0x78, 0xF7, 0x01, 0x00, // mov eax, 0x1F778
            0xE7, 0x00, // out 0, eax
            0x48, 0x83, 0xC4, 0x10, // add rsp, 16
            0x58, // pop rax
            0xC3, // ret
        ],
    );
    (blob, header)
}

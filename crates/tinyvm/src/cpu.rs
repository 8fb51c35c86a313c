//! CPU state for 64-bit guests.
//!
//! Everything a vCPU needs before its first `KVM_RUN`: the host CPUID
//! passed through, the descriptor tables written into the kernel area,
//! long-mode control registers, SYSCALL MSRs, XCR0 and the FPU.
//!
//! # Register state at entry
//!
//! ```text
//!   CR0   PE MP ET NE WP AM PG
//!   CR4   PAE OSFXSR OSXMMEXCPT [FSGSBASE] [OSXSAVE]
//!   EFER  SCE LME LMA NXE
//!   CS    0x2B (user code, L=1)     SS/DS/ES/FS/GS  0x23 (user data)
//!   TR    0x30 (busy 64-bit TSS)    GDT/IDT  physbase + 0x1600 / 0x1800
//!   STAR  kernel CS 0x08, SYSRET base 0x1B      LSTAR  trampoline syscall
//! ```
//!
//! The optional CR4 bits follow what the host CPUID reports, so a guest
//! never sees a feature enabled that the hardware lacks.

use kvm_bindings::{
    kvm_fpu, kvm_msr_entry, kvm_segment, kvm_sregs, kvm_xcrs, CpuId, Msrs, KVM_MAX_CPUID_ENTRIES,
};
use kvm_ioctls::{Kvm, VcpuFd};
use log::debug;
use thiserror::Error;

use crate::memory::{AddressSpace, MemoryError, GDT_ADDR, IDT_ADDR, IST_ADDR, PAGE_SIZE, SMP_IST_ADDR, TSS_ADDR, TSS_SMP_ADDR};
use crate::verified::gdt::{
    gdt_entry, get_avl, get_base, get_db, get_dpl, get_g, get_l, get_limit, get_p, get_s, get_type,
    star_msr, tss_descriptor, GDT_FLAGS_KERNEL_CODE64, GDT_FLAGS_KERNEL_DATA, GDT_FLAGS_USER_CODE32,
    GDT_FLAGS_USER_CODE64, GDT_FLAGS_USER_DATA, GDT_SLOTS, RPL_USER, SEL_TSS, SEL_USER_CODE64, SEL_USER_DATA,
    TSS_SIZE,
};
use crate::verified::idt::{IDT_ENTRIES, IDT_GATE_SIZE};

// ─── control register bits ───────────────────────────────────────────

pub const CR0_PE: u64 = 1 << 0;
pub const CR0_MP: u64 = 1 << 1;
pub const CR0_ET: u64 = 1 << 4;
pub const CR0_NE: u64 = 1 << 5;
pub const CR0_WP: u64 = 1 << 16;
pub const CR0_AM: u64 = 1 << 18;
pub const CR0_PG: u64 = 1 << 31;

pub const CR4_PAE: u64 = 1 << 5;
pub const CR4_OSFXSR: u64 = 1 << 9;
pub const CR4_OSXMMEXCPT: u64 = 1 << 10;
pub const CR4_FSGSBASE: u64 = 1 << 16;
pub const CR4_OSXSAVE: u64 = 1 << 18;

pub const EFER_SCE: u64 = 1 << 0;
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NXE: u64 = 1 << 11;

/// CR0 for every vCPU.  WP stays set so kernel-mode writes honour
/// read-only (copy-on-write) leaves too.
pub const GUEST_CR0: u64 = CR0_PE | CR0_MP | CR0_ET | CR0_NE | CR0_WP | CR0_AM | CR0_PG;
pub const GUEST_EFER: u64 = EFER_SCE | EFER_LME | EFER_LMA | EFER_NXE;

// ─── MSRs ────────────────────────────────────────────────────────────

pub const MSR_STAR: u32 = 0xC000_0081;
pub const MSR_LSTAR: u32 = 0xC000_0082;

// ─── CPUID bits ──────────────────────────────────────────────────────

pub const CPUID_LEAF_FEATURES: u32 = 0x1;
pub const CPUID_LEAF_STRUCTURED_EXT: u32 = 0x7;

/// Leaf 0x1 ECX bit 26: XSAVE/XRSTOR and XCR0.
pub const CPUID_1_ECX_XSAVE: u32 = 1 << 26;

/// Leaf 0x1 ECX bit 28: AVX.
pub const CPUID_1_ECX_AVX: u32 = 1 << 28;

/// Leaf 0x7 EBX bit 0: RDFSBASE/WRFSBASE and friends.
pub const CPUID_7_EBX_FSGSBASE: u32 = 1 << 0;

// ─── XCR0 ────────────────────────────────────────────────────────────

pub const XCR0_X87: u64 = 1 << 0;
pub const XCR0_SSE: u64 = 1 << 1;
pub const XCR0_AVX: u64 = 1 << 2;

/// Segment type of a busy 64-bit TSS, as KVM expects it in TR.
const TSS_TYPE_BUSY: u8 = 11;

/// RFLAGS at entry: reserved bit 1 and IOPL=3 so ring 3 may use port I/O.
pub const GUEST_RFLAGS: u64 = 0x2 | (3 << 12);

#[derive(Error, Debug)]
pub enum CpuError {
    /// `KVM_GET_SUPPORTED_CPUID` failed.
    #[error("Failed to get supported CPUID from KVM: {0}")]
    GetCpuid(#[source] kvm_ioctls::Error),

    /// `KVM_SET_CPUID2` failed.
    #[error("Failed to set CPUID on vCPU: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    #[error("Failed to get vCPU special registers: {0}")]
    GetSregs(#[source] kvm_ioctls::Error),

    #[error("Failed to set vCPU special registers: {0}")]
    SetSregs(#[source] kvm_ioctls::Error),

    #[error("Failed to set STAR/LSTAR: {0}")]
    SetMsrs(#[source] kvm_ioctls::Error),

    #[error("KVM accepted {accepted} of {expected} MSRs")]
    PartialMsrs { accepted: usize, expected: usize },

    #[error("Failed to build MSR list")]
    MsrList,

    #[error("Failed to set XCR0: {0}")]
    SetXcrs(#[source] kvm_ioctls::Error),

    #[error("Failed to set FPU: {0}")]
    SetFpu(#[source] kvm_ioctls::Error),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Host features that change the guest's control registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuFeatures {
    pub fsgsbase: bool,
    pub xsave: bool,
    pub avx: bool,
}

impl CpuFeatures {
    /// Read the relevant bits out of a CPUID table.
    pub fn from_cpuid(cpuid: &CpuId) -> Self {
        let mut features = Self::default();
        for entry in cpuid.as_slice() {
            match entry.function {
                CPUID_LEAF_FEATURES => {
                    features.xsave = entry.ecx & CPUID_1_ECX_XSAVE != 0;
                    features.avx = entry.ecx & CPUID_1_ECX_AVX != 0;
                }
                CPUID_LEAF_STRUCTURED_EXT if entry.index == 0 => {
                    features.fsgsbase = entry.ebx & CPUID_7_EBX_FSGSBASE != 0;
                }
                _ => {}
            }
        }
        features
    }

    pub fn cr4(&self) -> u64 {
        let mut cr4 = CR4_PAE | CR4_OSFXSR | CR4_OSXMMEXCPT;
        if self.fsgsbase {
            cr4 |= CR4_FSGSBASE;
        }
        if self.xsave {
            cr4 |= CR4_OSXSAVE;
        }
        cr4
    }

    /// XCR0 to program, or `None` when the guest cannot use XSAVE.
    pub fn xcr0(&self) -> Option<u64> {
        if !self.xsave {
            return None;
        }
        let mut xcr0 = XCR0_X87 | XCR0_SSE;
        if self.avx {
            xcr0 |= XCR0_AVX;
        }
        Some(xcr0)
    }
}

/// The host's supported CPUID, unfiltered.
pub fn supported_cpuid(kvm: &Kvm) -> Result<CpuId, CpuError> {
    kvm.get_supported_cpuid(KVM_MAX_CPUID_ENTRIES).map_err(CpuError::GetCpuid)
}

/// Hand `cpuid` to the vCPU.
pub fn setup_cpuid(vcpu: &VcpuFd, cpuid: &CpuId) -> Result<(), CpuError> {
    vcpu.set_cpuid2(cpuid).map_err(CpuError::SetCpuid)
}

// ═══════════════════════════════════════════════════════════════════════
//  Descriptor tables in guest memory
// ═══════════════════════════════════════════════════════════════════════

/// The full GDT for a machine at `physbase`.
pub fn gdt_table(physbase: u64) -> [u64; GDT_SLOTS] {
    let [tss_low, tss_high] = tss_descriptor(physbase + TSS_ADDR, (TSS_SIZE - 1) as u32);
    [
        0,
        gdt_entry(GDT_FLAGS_KERNEL_CODE64, 0, 0xfffff),
        gdt_entry(GDT_FLAGS_KERNEL_DATA, 0, 0xfffff),
        gdt_entry(GDT_FLAGS_USER_CODE32, 0, 0xfffff),
        gdt_entry(GDT_FLAGS_USER_DATA, 0, 0xfffff),
        gdt_entry(GDT_FLAGS_USER_CODE64, 0, 0xfffff),
        tss_low,
        tss_high,
    ]
}

pub fn write_gdt(memory: &AddressSpace) -> Result<(), MemoryError> {
    let mut bytes = Vec::with_capacity(GDT_SLOTS * 8);
    for entry in gdt_table(memory.physbase()) {
        bytes.extend_from_slice(&entry.to_le_bytes());
    }
    memory.kernel_copy_to_guest(memory.physbase() + GDT_ADDR, &bytes)
}

/// A 64-bit TSS whose RSP0 and IST1 point at the top of `ist_page`.
/// IST2 points at the middle of the same page.
pub fn tss_bytes(ist_page: u64) -> [u8; TSS_SIZE as usize] {
    let top = ist_page + PAGE_SIZE;
    let mut tss = [0u8; TSS_SIZE as usize];
    tss[4..12].copy_from_slice(&top.to_le_bytes()); // rsp0
    tss[36..44].copy_from_slice(&top.to_le_bytes()); // ist1
    tss[44..52].copy_from_slice(&(ist_page + PAGE_SIZE / 2).to_le_bytes()); // ist2
    tss[102..104].copy_from_slice(&(TSS_SIZE as u16).to_le_bytes()); // no I/O bitmap
    tss
}

/// Guest-physical address of the TSS used by `cpu_id`.
pub fn tss_address(physbase: u64, cpu_id: u32) -> u64 {
    match cpu_id {
        0 => physbase + TSS_ADDR,
        c => physbase + TSS_SMP_ADDR + u64::from(c - 1) * TSS_SIZE,
    }
}

/// Guest-physical address of the interrupt stack page used by `cpu_id`.
pub fn ist_address(physbase: u64, cpu_id: u32) -> u64 {
    match cpu_id {
        0 => physbase + IST_ADDR,
        c => physbase + SMP_IST_ADDR + u64::from(c - 1) * PAGE_SIZE,
    }
}

/// Write the TSS of every possible CPU.
pub fn write_tss(memory: &AddressSpace, cpus: u32) -> Result<(), MemoryError> {
    let physbase = memory.physbase();
    for cpu in 0..=cpus {
        let tss = tss_bytes(ist_address(physbase, cpu));
        memory.kernel_copy_to_guest(tss_address(physbase, cpu), &tss)?;
    }
    Ok(())
}

/// Hidden segment-register state for descriptor `entry` loaded with
/// `selector`.
pub fn kvm_segment_from_gdt(entry: u64, selector: u16) -> kvm_segment {
    kvm_segment {
        base: get_base(entry),
        limit: get_limit(entry),
        selector,
        type_: get_type(entry),
        present: get_p(entry),
        dpl: get_dpl(entry),
        db: get_db(entry),
        s: get_s(entry),
        l: get_l(entry),
        g: get_g(entry),
        avl: get_avl(entry),
        padding: 0,
        unusable: if get_p(entry) == 0 { 1 } else { 0 },
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Special registers, MSRs, XCR0, FPU
// ═══════════════════════════════════════════════════════════════════════

/// Fill `sregs` for ring-3 long mode on CPU `cpu_id`.
pub fn long_mode_sregs(sregs: &mut kvm_sregs, physbase: u64, root: u64, cpu_id: u32, features: &CpuFeatures) {
    let gdt = gdt_table(physbase);

    sregs.cs = kvm_segment_from_gdt(gdt[(SEL_USER_CODE64 / 8) as usize], SEL_USER_CODE64 | RPL_USER);
    let data = kvm_segment_from_gdt(gdt[(SEL_USER_DATA / 8) as usize], SEL_USER_DATA | RPL_USER);
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.ss = data;
    sregs.gs.base = cpu_id_address(physbase, cpu_id);

    sregs.tr = kvm_segment_from_gdt(gdt[(SEL_TSS / 8) as usize], SEL_TSS);
    sregs.tr.base = tss_address(physbase, cpu_id);
    sregs.tr.type_ = TSS_TYPE_BUSY;

    sregs.gdt.base = physbase + GDT_ADDR;
    sregs.gdt.limit = (GDT_SLOTS * 8 - 1) as u16;
    sregs.idt.base = physbase + IDT_ADDR;
    sregs.idt.limit = (IDT_ENTRIES as u64 * IDT_GATE_SIZE - 1) as u16;

    sregs.cr0 = GUEST_CR0;
    sregs.cr3 = root;
    sregs.cr4 = features.cr4();
    sregs.efer = GUEST_EFER;
}

/// Address of `cpu_id`'s slot in the vsyscall page's CPU id table.
pub fn cpu_id_address(physbase: u64, cpu_id: u32) -> u64 {
    physbase + crate::memory::VSYS_ADDR + crate::memory::VSYS_CPUID_OFFSET + 4 * u64::from(cpu_id)
}

pub fn setup_sregs(vcpu: &VcpuFd, physbase: u64, root: u64, cpu_id: u32, features: &CpuFeatures) -> Result<(), CpuError> {
    let mut sregs = vcpu.get_sregs().map_err(CpuError::GetSregs)?;
    long_mode_sregs(&mut sregs, physbase, root, cpu_id, features);
    vcpu.set_sregs(&sregs).map_err(CpuError::SetSregs)
}

/// Enable SYSCALL with `lstar` as the kernel entry point.
pub fn setup_msrs(vcpu: &VcpuFd, lstar: u64) -> Result<(), CpuError> {
    let entries = [
        kvm_msr_entry { index: MSR_STAR, data: star_msr(), ..Default::default() },
        kvm_msr_entry { index: MSR_LSTAR, data: lstar, ..Default::default() },
    ];
    let msrs = Msrs::from_entries(&entries).map_err(|_| CpuError::MsrList)?;
    let accepted = vcpu.set_msrs(&msrs).map_err(CpuError::SetMsrs)?;
    if accepted != entries.len() {
        return Err(CpuError::PartialMsrs { accepted, expected: entries.len() });
    }
    Ok(())
}

pub fn setup_xcr0(vcpu: &VcpuFd, features: &CpuFeatures) -> Result<(), CpuError> {
    let Some(xcr0) = features.xcr0() else {
        return Ok(());
    };
    let mut xcrs = kvm_xcrs { nr_xcrs: 1, ..Default::default() };
    xcrs.xcrs[0].xcr = 0;
    xcrs.xcrs[0].value = xcr0;
    vcpu.set_xcrs(&xcrs).map_err(CpuError::SetXcrs)?;
    debug!("XCR0 = {xcr0:#x}");
    Ok(())
}

pub fn setup_fpu(vcpu: &VcpuFd) -> Result<(), CpuError> {
    let fpu = kvm_fpu {
        fcw: 0x37f,
        mxcsr: 0x1f80,
        ..Default::default()
    };
    vcpu.set_fpu(&fpu).map_err(CpuError::SetFpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bindings::kvm_cpuid_entry2;

    fn cpuid(entries: &[(u32, u32, u32)]) -> CpuId {
        let entries: Vec<kvm_cpuid_entry2> = entries
            .iter()
            .map(|&(function, ebx, ecx)| kvm_cpuid_entry2 { function, ebx, ecx, ..Default::default() })
            .collect();
        CpuId::from_entries(&entries).unwrap()
    }

    #[test]
    fn features_follow_cpuid() {
        let all = CpuFeatures::from_cpuid(&cpuid(&[
            (CPUID_LEAF_FEATURES, 0, CPUID_1_ECX_XSAVE | CPUID_1_ECX_AVX),
            (CPUID_LEAF_STRUCTURED_EXT, CPUID_7_EBX_FSGSBASE, 0),
        ]));
        assert_eq!(all, CpuFeatures { fsgsbase: true, xsave: true, avx: true });
        assert_eq!(all.cr4() & (CR4_FSGSBASE | CR4_OSXSAVE), CR4_FSGSBASE | CR4_OSXSAVE);
        assert_eq!(all.xcr0(), Some(7));

        let bare = CpuFeatures::from_cpuid(&cpuid(&[(CPUID_LEAF_FEATURES, 0, 0)]));
        assert_eq!(bare.cr4(), CR4_PAE | CR4_OSFXSR | CR4_OSXMMEXCPT);
        assert_eq!(bare.xcr0(), None);
    }

    #[test]
    fn xsave_without_avx_enables_sse_only() {
        let f = CpuFeatures { xsave: true, ..Default::default() };
        assert_eq!(f.xcr0(), Some(XCR0_X87 | XCR0_SSE));
    }

    #[test]
    fn gdt_tss_descriptor_points_at_tss() {
        let gdt = gdt_table(1 << 32);
        assert_eq!(gdt[0], 0);
        let tss = kvm_segment_from_gdt(gdt[6], SEL_TSS);
        assert_eq!(tss.base & 0xFFFF_FFFF, TSS_ADDR);
        assert_eq!(gdt[7] & 0xFFFF_FFFF, 1, "upper half holds base[63:32]");
        assert_eq!(tss.limit, 103);
        assert_eq!(tss.s, 0);
    }

    #[test]
    fn user_segments_are_ring3_long_mode() {
        let mut sregs = kvm_sregs::default();
        long_mode_sregs(&mut sregs, 0, 0x5000, 0, &CpuFeatures::default());
        assert_eq!(sregs.cs.selector, 0x2B);
        assert_eq!(sregs.cs.l, 1);
        assert_eq!(sregs.cs.dpl, 3);
        assert_eq!(sregs.ss.selector, 0x23);
        assert_eq!(sregs.ss.dpl, 3);
        assert_eq!(sregs.tr.selector, 0x30);
        assert_eq!(sregs.tr.type_, 11);
        assert_eq!(sregs.tr.base, TSS_ADDR);
        assert_eq!(sregs.idt.limit, 33 * 16 - 1);
        assert_eq!(sregs.cr3, 0x5000);
        assert_ne!(sregs.cr0 & CR0_WP, 0);
        assert_eq!(sregs.efer, EFER_SCE | EFER_LME | EFER_LMA | EFER_NXE);
    }

    #[test]
    fn smp_cpus_get_their_own_tss_and_gs() {
        let mut sregs = kvm_sregs::default();
        long_mode_sregs(&mut sregs, 0, 0x5000, 3, &CpuFeatures::default());
        assert_eq!(sregs.tr.base, TSS_SMP_ADDR + 2 * 104);
        assert_eq!(sregs.gs.base, 0x4000 + 0xC00 + 12);
        assert_eq!(ist_address(0, 3), SMP_IST_ADDR + 2 * PAGE_SIZE);
    }

    #[test]
    fn tss_points_stacks_into_ist_page() {
        let tss = tss_bytes(0x3000);
        let rsp0 = u64::from_le_bytes(tss[4..12].try_into().unwrap());
        let ist1 = u64::from_le_bytes(tss[36..44].try_into().unwrap());
        let ist2 = u64::from_le_bytes(tss[44..52].try_into().unwrap());
        assert_eq!(rsp0, 0x4000);
        assert_eq!(ist1, 0x4000);
        assert_eq!(ist2, 0x3800);
        assert_eq!(u16::from_le_bytes([tss[102], tss[103]]), 104);
    }

    #[test]
    fn descriptor_tables_land_in_kernel_area() {
        let mem = crate::memory::detached(4 << 20);
        write_gdt(&mem).unwrap();
        write_tss(&mem, 2).unwrap();
        assert_eq!(mem.kernel_read_u64(GDT_ADDR + 8).unwrap(), gdt_entry(GDT_FLAGS_KERNEL_CODE64, 0, 0xfffff));
        assert_eq!(mem.kernel_read_u64(TSS_SMP_ADDR + 104 + 36).unwrap(), SMP_IST_ADDR + 2 * PAGE_SIZE);
    }
}

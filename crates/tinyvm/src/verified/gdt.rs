//! Pure functions for GDT/TSS descriptor encoding and SYSCALL selector math.
//!
//! Every function in this module is:
//! - **Pure**: no I/O, no system calls, no side effects beyond the return value.
//! - **Deterministic**: same inputs always produce the same outputs.
//! - **Assertion-guarded**: `debug_assert!` postconditions on every
//!   non-trivial encoder.
//!
//! # Mapping to `cpu.rs`
//!
//! | Pure function          | Used by in `cpu.rs`                        |
//! |------------------------|--------------------------------------------|
//! | [`gdt_entry`]          | `write_gdt()`                              |
//! | [`tss_descriptor`]     | `write_gdt()`                              |
//! | [`get_base`] ..        | `kvm_segment_from_gdt()`                   |
//! | [`star_msr`]           | `setup_msrs()`                             |
//!
//! # Descriptor table
//!
//! ```text
//!   selector  descriptor          DPL   used for
//!   ────────  ──────────────────  ───   ─────────────────────────────────
//!   0x00      null                 -
//!   0x08      kernel code (L=1)    0    trampoline, SYSCALL target CS
//!   0x10      kernel data          0    SYSCALL target SS
//!   0x18      user code (32-bit)   3    SYSRET base (STAR[63:48])
//!   0x20      user data            3    guest SS/DS/ES/FS/GS (RPL 3 → 0x23)
//!   0x28      user code (L=1)      3    guest CS (RPL 3 → 0x2B)
//!   0x30      64-bit TSS (16 B)    0    TR
//! ```

// ═══════════════════════════════════════════════════════════════════════
//  Descriptor flags (access byte | flags nibble << 12)
// ═══════════════════════════════════════════════════════════════════════

/// Kernel 64-bit code: P=1, DPL=0, S=1, type=execute/read, L=1, G=1.
pub const GDT_FLAGS_KERNEL_CODE64: u16 = 0xa09b;

/// Kernel data: P=1, DPL=0, S=1, type=read/write, D/B=1, G=1.
pub const GDT_FLAGS_KERNEL_DATA: u16 = 0xc093;

/// User 32-bit code.  Present only so SYSRET's selector arithmetic works.
pub const GDT_FLAGS_USER_CODE32: u16 = 0xc0fb;

/// User data: as kernel data with DPL=3.
pub const GDT_FLAGS_USER_DATA: u16 = 0xc0f3;

/// User 64-bit code: as kernel code with DPL=3.
pub const GDT_FLAGS_USER_CODE64: u16 = 0xa0fb;

/// Available 64-bit TSS: P=1, DPL=0, S=0, type=9, G=0 (byte-granular limit).
pub const GDT_FLAGS_TSS: u16 = 0x0089;

pub const SEL_KERNEL_CODE: u16 = 0x08;
pub const SEL_KERNEL_DATA: u16 = 0x10;
pub const SEL_USER_CODE32: u16 = 0x18;
pub const SEL_USER_DATA: u16 = 0x20;
pub const SEL_USER_CODE64: u16 = 0x28;
pub const SEL_TSS: u16 = 0x30;

/// Requested privilege level bits for ring-3 selectors.
pub const RPL_USER: u16 = 3;

/// Number of 8-byte slots in the table (the TSS descriptor takes two).
pub const GDT_SLOTS: usize = 8;

/// Size of the 64-bit TSS structure in bytes.
pub const TSS_SIZE: u64 = 104;

// All access bytes carry the Present bit.
const _: () = assert!(GDT_FLAGS_KERNEL_CODE64 & 0x0080 != 0);
const _: () = assert!(GDT_FLAGS_KERNEL_DATA & 0x0080 != 0);
const _: () = assert!(GDT_FLAGS_USER_CODE64 & 0x0080 != 0);
const _: () = assert!(GDT_FLAGS_USER_DATA & 0x0080 != 0);
const _: () = assert!(GDT_FLAGS_TSS & 0x0080 != 0);

// User descriptors carry DPL=3, kernel descriptors DPL=0.
const _: () = assert!(GDT_FLAGS_USER_CODE64 & 0x0060 == 0x0060);
const _: () = assert!(GDT_FLAGS_USER_DATA & 0x0060 == 0x0060);
const _: () = assert!(GDT_FLAGS_KERNEL_CODE64 & 0x0060 == 0);

// TSS is a system segment (S=0).
const _: () = assert!(GDT_FLAGS_TSS & 0x0010 == 0);

// SYSRET loads CS = STAR[63:48] + 16 and SS = STAR[63:48] + 8.
const _: () = assert!(SEL_USER_CODE32 + 16 == SEL_USER_CODE64);
const _: () = assert!(SEL_USER_CODE32 + 8 == SEL_USER_DATA);
// SYSCALL loads SS = STAR[47:32] + 8.
const _: () = assert!(SEL_KERNEL_CODE + 8 == SEL_KERNEL_DATA);

// The TSS descriptor occupies the last two slots.
const _: () = assert!((SEL_TSS as usize) / 8 + 2 == GDT_SLOTS);

// ═══════════════════════════════════════════════════════════════════════
//  GDT entry construction
// ═══════════════════════════════════════════════════════════════════════

/// Construct a raw 8-byte GDT descriptor from flags, base, and limit.
///
/// The `flags` parameter packs the access byte and flags nibble:
///
/// ```text
/// flags[7:0]   → descriptor byte 5  (access: P, DPL, S, Type)
/// flags[15:12] → descriptor byte 6  high nibble (G, D/B, L, AVL)
/// flags[11:8]  → masked out (unused)
/// ```
pub fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    let result = ((u64::from(base) & 0xff00_0000u64) << (56 - 24))
        | ((u64::from(flags) & 0x0000_f0ffu64) << 40)
        | ((u64::from(limit) & 0x000f_0000u64) << (48 - 16))
        | ((u64::from(base) & 0x00ff_ffffu64) << 16)
        | (u64::from(limit) & 0x0000_ffffu64);

    debug_assert_eq!(
        get_base(result),
        base as u64,
        "gdt_entry: base must round-trip (base={base:#x})"
    );
    debug_assert_eq!(
        get_type(result),
        (flags & 0xF) as u8,
        "gdt_entry: type field must round-trip (flags={flags:#x})"
    );

    result
}

/// Encode the 16-byte long-mode TSS descriptor as two GDT slots.
///
/// The low slot is an ordinary descriptor holding base[31:0]; the high
/// slot holds base[63:32] in its low dword and must otherwise be zero.
pub fn tss_descriptor(base: u64, limit: u32) -> [u64; 2] {
    let low = gdt_entry(GDT_FLAGS_TSS, base as u32, limit);
    let high = base >> 32;

    debug_assert_eq!(get_s(low), 0, "tss_descriptor: must be a system segment");
    debug_assert_eq!(
        (get_base(low)) | (high << 32),
        base,
        "tss_descriptor: base must round-trip"
    );

    [low, high]
}

/// Value for the `STAR` MSR.
///
/// `STAR[47:32]` is the kernel CS for SYSCALL; `STAR[63:48]` is the base
/// selector SYSRET derives the user CS/SS from (with RPL 3 applied).
pub const fn star_msr() -> u64 {
    ((SEL_KERNEL_CODE as u64) << 32) | (((SEL_USER_CODE32 | RPL_USER) as u64) << 48)
}

// ═══════════════════════════════════════════════════════════════════════
//  GDT field extraction
// ═══════════════════════════════════════════════════════════════════════
//
// x86 segment descriptor bit layout (8 bytes):
//
//   Bits 63:56: Base address [31:24]
//   Bit  55   : Granularity (G)
//   Bit  54   : Default operation size (D/B)
//   Bit  53   : 64-bit code segment (L)
//   Bit  52   : Available for system use (AVL)
//   Bits 51:48: Segment limit [19:16]
//   Bit  47   : Present (P)
//   Bits 46:45: Descriptor Privilege Level (DPL)
//   Bit  44   : Descriptor type: S (0=system, 1=code/data)
//   Bits 43:40: Type
//   Bits 39:16: Base address [23:0]
//   Bits 15:0 : Segment limit [15:0]

/// Extract the segment base address from a GDT entry.
pub fn get_base(entry: u64) -> u64 {
    let result = ((entry & 0xFF00_0000_0000_0000) >> 32)
        | ((entry & 0x0000_00FF_0000_0000) >> 16)
        | ((entry & 0x0000_0000_FFFF_0000) >> 16);

    debug_assert_eq!(result >> 32, 0, "get_base: upper 32 bits must be zero");

    result
}

/// Extract the segment limit from a GDT entry.
///
/// When the granularity bit (G) is clear, returns the raw 20-bit limit.
/// When G is set, the 20-bit value is scaled: `(raw << 12) | 0xFFF`.
pub fn get_limit(entry: u64) -> u32 {
    let raw: u32 = (((entry & 0x000F_0000_0000_0000) >> 32) | (entry & 0x0000_0000_0000_FFFF)) as u32;

    match get_g(entry) {
        0 => raw,
        _ => (raw << 12) | 0xFFF,
    }
}

/// Granularity bit (G), bit 55.
pub fn get_g(entry: u64) -> u8 {
    ((entry & 0x0080_0000_0000_0000) >> 55) as u8
}

/// Default operation size bit (D/B), bit 54.
pub fn get_db(entry: u64) -> u8 {
    ((entry & 0x0040_0000_0000_0000) >> 54) as u8
}

/// Long mode bit (L), bit 53.
pub fn get_l(entry: u64) -> u8 {
    ((entry & 0x0020_0000_0000_0000) >> 53) as u8
}

/// Available-for-system-use bit (AVL), bit 52.
pub fn get_avl(entry: u64) -> u8 {
    ((entry & 0x0010_0000_0000_0000) >> 52) as u8
}

/// Present bit (P), bit 47.
pub fn get_p(entry: u64) -> u8 {
    ((entry & 0x0000_8000_0000_0000) >> 47) as u8
}

/// Descriptor Privilege Level, bits 46:45.
pub fn get_dpl(entry: u64) -> u8 {
    ((entry & 0x0000_6000_0000_0000) >> 45) as u8
}

/// Descriptor type bit (S), bit 44.  0 = system segment, 1 = code/data.
pub fn get_s(entry: u64) -> u8 {
    ((entry & 0x0000_1000_0000_0000) >> 44) as u8
}

/// Type field, bits 43:40.
pub fn get_type(entry: u64) -> u8 {
    ((entry & 0x0000_0F00_0000_0000) >> 40) as u8
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    // ─── gdt_entry construction ──────────────────────────────────

    #[test]
    fn gdt_null_entry_is_zero() {
        assert_eq!(gdt_entry(0, 0, 0), 0);
    }

    #[test]
    fn gdt_entry_base_roundtrip() {
        for &base in &[0x1u32, 0xFFFF, 0x1234_5678, 0xFF00_0000, 0xFFFF_FFFF] {
            let entry = gdt_entry(GDT_FLAGS_KERNEL_DATA, base, 0xfffff);
            assert_eq!(get_base(entry), base as u64, "base {base:#x} did not round-trip");
        }
    }

    #[test]
    fn gdt_entry_limit_roundtrip_without_granularity() {
        for &limit in &[0x0u32, 0x67, 0xFFFF, 0xFFFFF] {
            let entry = gdt_entry(GDT_FLAGS_TSS, 0, limit);
            assert_eq!(get_g(entry), 0);
            assert_eq!(get_limit(entry), limit);
        }
    }

    #[test]
    fn granular_limit_covers_4gib() {
        let entry = gdt_entry(GDT_FLAGS_USER_DATA, 0, 0xfffff);
        assert_eq!(get_g(entry), 1);
        assert_eq!(get_limit(entry), 0xFFFF_FFFF);
    }

    // ─── descriptor fields ───────────────────────────────────────

    #[test]
    fn kernel_code64_fields() {
        let entry = gdt_entry(GDT_FLAGS_KERNEL_CODE64, 0, 0xfffff);
        assert_eq!(get_l(entry), 1, "L must be set for 64-bit code");
        assert_eq!(get_db(entry), 0, "D/B must be 0 when L=1");
        assert_eq!(get_p(entry), 1);
        assert_eq!(get_s(entry), 1);
        assert_eq!(get_dpl(entry), 0);
        assert_eq!(get_type(entry), 0xB);
    }

    #[test]
    fn user_code64_fields() {
        let entry = gdt_entry(GDT_FLAGS_USER_CODE64, 0, 0xfffff);
        assert_eq!(get_l(entry), 1);
        assert_eq!(get_dpl(entry), 3, "guest code runs in ring 3");
        assert_eq!(get_s(entry), 1);
    }

    #[test]
    fn user_data_fields() {
        let entry = gdt_entry(GDT_FLAGS_USER_DATA, 0, 0xfffff);
        assert_eq!(get_l(entry), 0);
        assert_eq!(get_db(entry), 1);
        assert_eq!(get_dpl(entry), 3);
        assert_eq!(get_type(entry), 0x3);
        assert_eq!(get_avl(entry), 0);
    }

    #[test]
    fn user_code32_is_not_long_mode() {
        let entry = gdt_entry(GDT_FLAGS_USER_CODE32, 0, 0xfffff);
        assert_eq!(get_l(entry), 0);
        assert_eq!(get_db(entry), 1);
        assert_eq!(get_dpl(entry), 3);
    }

    // ─── TSS descriptor ──────────────────────────────────────────

    #[test]
    fn tss_descriptor_splits_high_base() {
        let base = 0x0000_0070_0000_1700u64;
        let [low, high] = tss_descriptor(base, (TSS_SIZE - 1) as u32);
        assert_eq!(get_base(low), 0x1700);
        assert_eq!(high, 0x70);
        assert_eq!(get_limit(low), 103);
        assert_eq!(get_type(low), 9, "available 64-bit TSS");
        assert_eq!(get_s(low), 0);
        assert_eq!(get_p(low), 1);
    }

    #[test]
    fn tss_descriptor_low_base_has_zero_high_slot() {
        let [_, high] = tss_descriptor(0x1700, 103);
        assert_eq!(high, 0);
    }

    // ─── STAR ────────────────────────────────────────────────────

    #[test]
    fn star_selectors() {
        let star = star_msr();
        assert_eq!((star >> 32) & 0xFFFF, 0x08);
        assert_eq!(star >> 48, 0x1B);
        // SYSRET to 64-bit: CS = base + 16, SS = base + 8 (RPL preserved).
        assert_eq!((star >> 48) + 16, (SEL_USER_CODE64 | RPL_USER) as u64);
        assert_eq!((star >> 48) + 8, (SEL_USER_DATA | RPL_USER) as u64);
        assert_eq!(star & 0xFFFF_FFFF, 0);
    }

    // ─── extraction ranges ───────────────────────────────────────

    #[test]
    fn single_bit_extractors_return_0_or_1() {
        for &entry in &[0u64, 0xFFFF_FFFF_FFFF_FFFF, 0xAAAA_AAAA_AAAA_AAAA] {
            assert!(get_g(entry) <= 1);
            assert!(get_db(entry) <= 1);
            assert!(get_l(entry) <= 1);
            assert!(get_avl(entry) <= 1);
            assert!(get_p(entry) <= 1);
            assert!(get_s(entry) <= 1);
            assert!(get_dpl(entry) <= 3);
            assert!(get_type(entry) <= 0xF);
        }
    }
}

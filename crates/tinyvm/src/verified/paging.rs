//! Pure functions for the guest-physical layout and x86_64 page-table entries.
//!
//! The guest runs with an identity map (guest-virtual == guest-physical)
//! built by `crate::paging`.  Everything that decides *which bits* end up in
//! an entry lives here so it can be tested without guest memory.
//!
//! # Layout (offsets relative to `physbase`)
//!
//! ```text
//!   0x0000_0000 ┌──────────────────────┐
//!               │ null page (unmapped) │
//!   0x0000_1600 │ GDT                  │  kernel RW, NX
//!   0x0000_1700 │ TSS (+ per-CPU TSS)  │
//!   0x0000_1800 │ IDT (33 gates)       │
//!   0x0000_2000 │ trampoline blob      │  user R, executable
//!   0x0000_3000 │ IST stack            │  kernel RW, NX
//!   0x0000_4000 │ vsyscall page        │  user R, executable
//!   0x0000_5000 │ PML4, PDPT, PT, PDs  │  kernel RW, NX
//!   0x0008_0000 │ per-CPU IST stacks   │
//!   0x0010_0000 ├──────────────────────┤  safebase
//!               │ default stack (4K)   │  user RW, NX
//!   0x0020_0000 ├──────────────────────┤
//!               │ user memory (2M)     │  user RW, executable
//!               └──────────────────────┘
//! ```

// ═══════════════════════════════════════════════════════════════════════
//  Guest-physical layout
// ═══════════════════════════════════════════════════════════════════════

pub const GDT_ADDR: u64 = 0x1600;
pub const TSS_ADDR: u64 = 0x1700;
pub const IDT_ADDR: u64 = 0x1800;
/// Per-CPU TSS structures for SMP workers, 104 bytes each.
pub const TSS_SMP_ADDR: u64 = 0x1A80;
pub const INTR_ASM_ADDR: u64 = 0x2000;
pub const IST_ADDR: u64 = 0x3000;
pub const VSYS_ADDR: u64 = 0x4000;
/// Offset of the exit stub inside the vsyscall page.
pub const VSYS_EXIT_OFFSET: u64 = 0x800;
/// Offset of the per-CPU id table (u32 per CPU) inside the vsyscall page.
pub const VSYS_CPUID_OFFSET: u64 = 0xC00;
pub const PT_ADDR: u64 = 0x5000;
/// Per-CPU interrupt stacks for SMP workers, one page each.
pub const SMP_IST_ADDR: u64 = 0x8_0000;
/// First guest-reachable byte.
pub const SAFEBASE_OFFSET: u64 = 0x10_0000;
/// End of the 4 KiB-mapped low region.
pub const LOW_REGION_END: u64 = 0x20_0000;

/// Most SMP worker vCPUs a machine can carry (bounded by the TSS area).
pub const MAX_SMP_CPUS: usize = ((INTR_ASM_ADDR - TSS_SMP_ADDR) / 104) as usize;

const _: () = assert!(GDT_ADDR + 64 <= TSS_ADDR);
const _: () = assert!(TSS_ADDR + 104 <= IDT_ADDR);
const _: () = assert!(IDT_ADDR + 33 * 16 <= TSS_SMP_ADDR);
const _: () = assert!(TSS_SMP_ADDR + MAX_SMP_CPUS as u64 * 104 <= INTR_ASM_ADDR);
const _: () = assert!(INTR_ASM_ADDR + PAGE_SIZE <= IST_ADDR);
const _: () = assert!(IST_ADDR + PAGE_SIZE <= VSYS_ADDR);
const _: () = assert!(VSYS_ADDR + PAGE_SIZE <= PT_ADDR);
const _: () = assert!(SMP_IST_ADDR + MAX_SMP_CPUS as u64 * PAGE_SIZE <= SAFEBASE_OFFSET);
const _: () = assert!((MAX_SMP_CPUS as u64 + 1) * 4 <= PAGE_SIZE - VSYS_CPUID_OFFSET);

// ═══════════════════════════════════════════════════════════════════════
//  Page-table entry bits
// ═══════════════════════════════════════════════════════════════════════

pub const PDE64_PRESENT: u64 = 1;
pub const PDE64_RW: u64 = 1 << 1;
pub const PDE64_USER: u64 = 1 << 2;
pub const PDE64_ACCESSED: u64 = 1 << 5;
pub const PDE64_DIRTY: u64 = 1 << 6;
pub const PDE64_PS: u64 = 1 << 7;
/// Software bit: the leaf is a read-only view of a shared page that
/// becomes private on first write.
pub const PDE64_CLONEABLE: u64 = 1 << 11;
pub const PDE64_NX: u64 = 1 << 63;

/// Physical-address bits of a 4 KiB entry (everything but flags and NX).
pub const PDE64_ADDR_MASK: u64 = !0x8000_0000_0000_0FFF;
/// Physical-address bits of a 2 MiB entry (bit 12 is PAT there).
pub const PDE64_HUGE_ADDR_MASK: u64 = !0x8000_0000_001F_FFFF;
/// Flag bits kept when an entry is remapped.
pub const PDE64_FLAGS_MASK: u64 = !PDE64_ADDR_MASK;

pub const USERMODE_FLAGS: u64 = PDE64_PRESENT | PDE64_RW | PDE64_USER | PDE64_NX;
pub const KERNEL_FLAGS: u64 = PDE64_PRESENT | PDE64_RW | PDE64_NX;
/// Non-leaf entries never restrict access; leaves decide.
pub const TABLE_FLAGS: u64 = PDE64_PRESENT | PDE64_RW | PDE64_USER | PDE64_ACCESSED;

pub const PAGE_SIZE: u64 = 0x1000;
pub const HUGE_PAGE_SIZE: u64 = 0x20_0000;
pub const GIGA_PAGE_SIZE: u64 = 0x4000_0000;
pub const PT_ENTRIES: usize = 512;

const _: () = assert!(PDE64_FLAGS_MASK == 0x8000_0000_0000_0FFF);
const _: () = assert!(PDE64_CLONEABLE & 0xE00 != 0, "software-available bit");

// ═══════════════════════════════════════════════════════════════════════
//  Indices and alignment
// ═══════════════════════════════════════════════════════════════════════

pub const fn pml4_index(addr: u64) -> usize {
    ((addr >> 39) & 511) as usize
}

pub const fn pdpt_index(addr: u64) -> usize {
    ((addr >> 30) & 511) as usize
}

pub const fn pd_index(addr: u64) -> usize {
    ((addr >> 21) & 511) as usize
}

pub const fn pt_index(addr: u64) -> usize {
    ((addr >> 12) & 511) as usize
}

pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Round `value` up to `align` (a power of two).
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two(), "align_up: {align:#x} is not a power of two");
    let result = (value + align - 1) & !(align - 1);
    debug_assert!(result >= value && result % align == 0);
    result
}

/// PDPT slots (one per GiB) touched by `[physbase, physbase + size)`.
///
/// The end is rounded up so a partial gigabyte still claims its slot.
/// Callers must reject ranges whose end exceeds [`PT_ENTRIES`].
pub fn gigabyte_slots(physbase: u64, size: u64) -> std::ops::Range<usize> {
    let begin = (physbase >> 30) as usize;
    let end = ((physbase + size + GIGA_PAGE_SIZE - 1) >> 30) as usize;
    debug_assert!(begin <= end);
    begin..end
}

/// Number of page-table pages the identity map needs:
/// PML4 + PDPT + low PT + one PD per GiB.
pub fn pagetable_pages(size: u64) -> u64 {
    3 + size.div_ceil(GIGA_PAGE_SIZE)
}

// ═══════════════════════════════════════════════════════════════════════
//  Entry construction
// ═══════════════════════════════════════════════════════════════════════

pub fn entry_address(entry: u64) -> u64 {
    entry & PDE64_ADDR_MASK
}

pub fn is_present(entry: u64) -> bool {
    entry & PDE64_PRESENT != 0
}

pub fn is_huge(entry: u64) -> bool {
    entry & PDE64_PS != 0
}

pub fn is_cloneable(entry: u64) -> bool {
    entry & PDE64_CLONEABLE != 0
}

/// Build an entry for a page-aligned physical address.
pub fn make_entry(addr: u64, flags: u64) -> u64 {
    debug_assert_eq!(addr & PDE64_FLAGS_MASK, 0, "make_entry: {addr:#x} not page aligned");
    addr | flags
}

/// Entry for page `index` of the low 2 MiB, whose 4 KiB pages start at
/// guest-physical `physbase`.
///
/// The null page is unmapped, the trampoline and vsyscall pages are user
/// readable and executable, the rest of the first MiB is kernel-only data,
/// and the second MiB is the user stack area.
pub fn low_page_entry(physbase: u64, index: usize) -> u64 {
    debug_assert!(index < PT_ENTRIES);
    let offset = index as u64 * PAGE_SIZE;
    let addr = physbase + offset;
    let result = match offset {
        0 => 0,
        INTR_ASM_ADDR | VSYS_ADDR => make_entry(addr, PDE64_PRESENT | PDE64_USER | PDE64_ACCESSED),
        o if o < SAFEBASE_OFFSET => make_entry(addr, KERNEL_FLAGS | PDE64_ACCESSED | PDE64_DIRTY),
        _ => make_entry(addr, USERMODE_FLAGS | PDE64_ACCESSED | PDE64_DIRTY),
    };

    debug_assert!(
        offset >= SAFEBASE_OFFSET || result & PDE64_RW == 0 || result & PDE64_USER == 0,
        "low_page_entry: kernel page {offset:#x} must not be user writable"
    );
    result
}

/// Entry for a 2 MiB user page at `addr`.
pub fn huge_user_entry(addr: u64) -> u64 {
    debug_assert_eq!(addr % HUGE_PAGE_SIZE, 0);
    make_entry(
        addr,
        PDE64_PRESENT | PDE64_RW | PDE64_USER | PDE64_PS | PDE64_ACCESSED | PDE64_DIRTY,
    )
}

/// Turn a leaf into its copy-on-write form.
///
/// User-writable leaves lose `RW` and gain [`PDE64_CLONEABLE`]; every
/// present leaf gets `ACCESSED` preset so the CPU never has to write a
/// shared table.
pub fn cow_entry(entry: u64) -> u64 {
    if !is_present(entry) {
        return entry;
    }
    let writable_user = entry & (PDE64_RW | PDE64_USER) == (PDE64_RW | PDE64_USER);
    let result = if writable_user {
        (entry & !PDE64_RW) | PDE64_CLONEABLE | PDE64_ACCESSED
    } else {
        entry | PDE64_ACCESSED
    };

    debug_assert!(
        result & PDE64_USER == 0 || result & PDE64_RW == 0,
        "cow_entry: user leaves must be read-only"
    );
    result
}

/// Entry `index` of the 4 KiB table that replaces a split 2 MiB leaf.
pub fn split_huge_entry(entry: u64, index: usize) -> u64 {
    debug_assert!(is_huge(entry));
    debug_assert!(index < PT_ENTRIES);
    let base = entry & PDE64_HUGE_ADDR_MASK;
    let flags = entry & PDE64_FLAGS_MASK & !PDE64_PS;
    let result = (base + index as u64 * PAGE_SIZE) | flags;

    debug_assert!(!is_huge(result));
    result
}

/// Leaf for a private page at `page`, derived from the `old` leaf it
/// replaces.
///
/// A cloneable leaf was writable before it went copy-on-write, so it gets
/// `RW` back.  `flags` are added on top.
pub fn private_leaf(old: u64, page: u64, flags: u64) -> u64 {
    let kept = old & PDE64_FLAGS_MASK & !(PDE64_CLONEABLE | PDE64_PS);
    let restored = if is_cloneable(old) { PDE64_RW } else { 0 };
    let result = make_entry(
        page,
        kept | restored | flags | PDE64_PRESENT | PDE64_ACCESSED | PDE64_DIRTY,
    );

    debug_assert!(!is_cloneable(result));
    debug_assert_eq!(entry_address(result), page);
    result
}

/// Page-aligned fault address reported by the trampoline in `rdi`.
pub fn fault_page(rdi: u64) -> u64 {
    rdi & PDE64_ADDR_MASK
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_of_canonical_address() {
        let addr = (3u64 << 39) | (5 << 30) | (7 << 21) | (9 << 12) | 0x123;
        assert_eq!(pml4_index(addr), 3);
        assert_eq!(pdpt_index(addr), 5);
        assert_eq!(pd_index(addr), 7);
        assert_eq!(pt_index(addr), 9);
    }

    #[test]
    fn gigabyte_slots_rounds_up_partial_gigabytes() {
        assert_eq!(gigabyte_slots(0, 64 << 20), 0..1);
        assert_eq!(gigabyte_slots(1 << 30, 1 << 30), 1..2);
        assert_eq!(gigabyte_slots(4 << 30, (1 << 30) + 1), 4..6);
    }

    #[test]
    fn pagetable_pages_counts_directories() {
        assert_eq!(pagetable_pages(64 << 20), 4);
        assert_eq!(pagetable_pages(2 << 30), 5);
    }

    #[test]
    fn null_page_is_unmapped() {
        assert_eq!(low_page_entry(0, 0), 0);
        assert_eq!(low_page_entry(1 << 30, 0), 0);
    }

    #[test]
    fn kernel_pages_are_supervisor_only() {
        for offset in [GDT_ADDR, IST_ADDR, PT_ADDR, SMP_IST_ADDR] {
            let e = low_page_entry(0, (offset / PAGE_SIZE) as usize);
            assert!(is_present(e));
            assert_eq!(e & PDE64_USER, 0, "{offset:#x}");
            assert_ne!(e & PDE64_NX, 0, "{offset:#x}");
        }
    }

    #[test]
    fn trampoline_and_vsyscall_are_user_executable_read_only() {
        for offset in [INTR_ASM_ADDR, VSYS_ADDR] {
            let e = low_page_entry(0, (offset / PAGE_SIZE) as usize);
            assert_ne!(e & PDE64_USER, 0);
            assert_eq!(e & PDE64_RW, 0);
            assert_eq!(e & PDE64_NX, 0);
            assert_eq!(entry_address(e), offset);
        }
    }

    #[test]
    fn stack_area_is_user_rw_noexec() {
        let e = low_page_entry(0x4000_0000, 300);
        assert_eq!(e & USERMODE_FLAGS, USERMODE_FLAGS);
        assert_eq!(entry_address(e), 0x4000_0000 + 300 * PAGE_SIZE);
    }

    #[test]
    fn cow_entry_write_protects_user_pages() {
        let e = huge_user_entry(0x20_0000);
        let c = cow_entry(e);
        assert_eq!(c & PDE64_RW, 0);
        assert!(is_cloneable(c));
        assert!(is_huge(c));
        assert_eq!(c & PDE64_HUGE_ADDR_MASK, 0x20_0000);
    }

    #[test]
    fn cow_entry_leaves_kernel_pages_writable() {
        let e = low_page_entry(0, (IST_ADDR / PAGE_SIZE) as usize);
        let c = cow_entry(e);
        assert_ne!(c & PDE64_RW, 0);
        assert!(!is_cloneable(c));
    }

    #[test]
    fn cow_entry_ignores_absent_entries() {
        assert_eq!(cow_entry(0), 0);
    }

    #[test]
    fn split_keeps_flags_and_steps_addresses() {
        let huge = cow_entry(huge_user_entry(0x40_0000));
        let first = split_huge_entry(huge, 0);
        let last = split_huge_entry(huge, 511);
        assert_eq!(entry_address(first), 0x40_0000);
        assert_eq!(entry_address(last), 0x40_0000 + 511 * PAGE_SIZE);
        assert!(!is_huge(first));
        assert!(is_cloneable(last));
        assert_eq!(last & PDE64_RW, 0);
    }

    #[test]
    fn private_leaf_clears_cloneable_and_grants_flags() {
        let old = split_huge_entry(cow_entry(huge_user_entry(0x20_0000)), 3);
        let leaf = private_leaf(old, 0x70_0000_1000, PDE64_USER | PDE64_RW);
        assert!(!is_cloneable(leaf));
        assert_ne!(leaf & PDE64_RW, 0);
        assert_eq!(entry_address(leaf), 0x70_0000_1000);
    }

    #[test]
    fn private_leaf_restores_write_access_of_cloneable_pages() {
        let old = cow_entry(low_page_entry(0, 300));
        assert_eq!(old & PDE64_RW, 0);
        let leaf = private_leaf(old, 0x70_0000_2000, 0);
        assert_ne!(leaf & PDE64_RW, 0);
    }

    #[test]
    fn private_leaf_keeps_read_only_pages_read_only() {
        let old = low_page_entry(0, (INTR_ASM_ADDR / PAGE_SIZE) as usize);
        let leaf = private_leaf(old, 0x70_0000_3000, 0);
        assert_eq!(leaf & PDE64_RW, 0);
        assert_ne!(leaf & PDE64_USER, 0);
    }

    #[test]
    fn private_leaf_keeps_nx() {
        let old = cow_entry(low_page_entry(0, 400));
        let leaf = private_leaf(old, 0x70_0000_0000, PDE64_USER | PDE64_RW);
        assert_ne!(leaf & PDE64_NX, 0);
    }

    #[test]
    fn fault_page_masks_offset_and_nx() {
        assert_eq!(fault_page(0x8000_0000_0020_1234), 0x20_1000);
    }

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(HUGE_PAGE_SIZE, HUGE_PAGE_SIZE), HUGE_PAGE_SIZE);
        assert_eq!(page_align_down(0x1FFF), 0x1000);
    }
}

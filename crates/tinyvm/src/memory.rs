//! Guest-physical memory for one machine.
//!
//! An [`AddressSpace`] owns (or shares, for forks) one contiguous
//! host-backed region covering `[physbase, physbase + size)`, a set of
//! copy-on-write [`MemoryBanks`](crate::bank::MemoryBanks), and an optional
//! link to another machine's address space (remote mode).
//!
//! # Regions
//!
//! ```text
//!   guest-physical                          host
//!   ─────────────────────────────           ──────────────────────────────
//!   physbase .. physbase+size        ──▶    base MmapRegion (shared by forks)
//!   0x70_0000_0000 + n × 2 MiB       ──▶    bank MmapRegion n (per machine)
//!   remote.physbase .. +remote.size  ──▶    remote's base MmapRegion (alias)
//! ```
//!
//! Addresses below `safebase` hold the kernel structures (GDT, IDT, page
//! tables, trampoline).  They are reachable through [`AddressSpace::translate`]
//! but never through [`AddressSpace::safely_translate`], which is the only
//! path used for guest-controlled addresses.
//!
//! # Locking
//!
//! The bank mutex is the single critical section for page materialization
//! and every page-table write after setup.  The base mapping is immutable
//! after construction and needs no lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use kvm_bindings::kvm_userspace_memory_region;
use log::{debug, info, warn};
use thiserror::Error;
use vm_memory::{GuestAddress, GuestMemory, GuestMemoryMmap, GuestRegionMmap, MmapRegion};

use crate::bank::MemoryBanks;

pub use crate::verified::paging::{
    align_up, GDT_ADDR, HUGE_PAGE_SIZE, IDT_ADDR, INTR_ASM_ADDR, IST_ADDR, LOW_REGION_END,
    MAX_SMP_CPUS, PAGE_SIZE, PT_ADDR, SAFEBASE_OFFSET, SMP_IST_ADDR, TSS_ADDR, TSS_SMP_ADDR,
    VSYS_ADDR, VSYS_CPUID_OFFSET, VSYS_EXIT_OFFSET,
};

// ═══════════════════════════════════════════════════════════════════════
//  Layout constants
// ═══════════════════════════════════════════════════════════════════════

/// KVM slot of the base region.
pub const BASE_SLOT: u32 = 0;

/// KVM slot the remote machine's base region is installed in.
pub const REMOTE_SLOT: u32 = 1;

/// First KVM slot used by memory banks.
pub const BANK_FIRST_SLOT: u32 = 2;

/// Guest-physical start of the bank arena.  Banks are never identity
/// mapped; only page-table entries point into them.
pub const BANK_ARENA_BASE: u64 = 0x70_0000_0000;

/// Pages per memory bank.
pub const BANK_PAGES: u64 = 512;

/// Pages per bank when a full bank cannot be mapped.
pub const BANK_FALLBACK_PAGES: u64 = 4;

/// Address KVM uses for its three-page real-mode TSS.
pub const KVM_TSS_ADDRESS: u64 = 0xfffb_d000;

/// Address of KVM's identity-map page.
pub const KVM_IDENTITY_MAP_ADDRESS: u64 = 0xffff_c000;

/// Smallest usable guest: the low region plus one 2 MiB user page.
pub const MIN_MEMORY: u64 = LOW_REGION_END + HUGE_PAGE_SIZE;

/// Physbase must be gigabyte aligned so the identity map's PDPT slots
/// line up with remote splicing.
pub const PHYSBASE_ALIGN: u64 = 1 << 30;

const _: () = assert!(BANK_ARENA_BASE % HUGE_PAGE_SIZE == 0);
const _: () = assert!(BANK_PAGES * PAGE_SIZE == HUGE_PAGE_SIZE);
const _: () = assert!(KVM_TSS_ADDRESS + 3 * PAGE_SIZE <= KVM_IDENTITY_MAP_ADDRESS);

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors raised by guest memory operations.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Access outside every known region and bank.
    #[error("Memory access outside of guest memory: addr={addr:#x} len={len:#x}")]
    OutOfRange { addr: u64, len: u64 },

    #[error("Failed to allocate {size} bytes of guest memory")]
    Allocate { size: u64 },

    #[error("Guest memory of {size:#x} bytes is smaller than the minimum of {MIN_MEMORY:#x}")]
    TooSmall { size: u64 },

    #[error("Guest memory of {size:#x} bytes does not fit the layout: {reason}")]
    TooLarge { size: u64, reason: &'static str },

    #[error("Address {addr:#x} is not suitably aligned")]
    Misaligned { addr: u64 },

    #[error("Copy-on-write memory exhausted ({max_pages} pages)")]
    BankExhausted { max_pages: u64 },

    #[error("Failed to install memory slot {slot}: {source}")]
    Install {
        slot: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    /// Page walk hit an absent entry.
    #[error("Address {addr:#x} is not mapped")]
    NotMapped { addr: u64 },
}

// ═══════════════════════════════════════════════════════════════════════
//  Host mappings
// ═══════════════════════════════════════════════════════════════════════

/// How a host mapping backing guest memory is acquired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappingOptions {
    /// Try `MAP_HUGETLB` first.
    pub hugepages: bool,
    /// Advise transparent huge pages.
    pub transparent_hugepages: bool,
    /// Skip merge-sharing and THP advice.
    pub short_lived: bool,
}

/// Acquire a zero-initialized anonymous mapping of at least `size` bytes.
///
/// With `hugepages` the size is rounded up to 2 MiB and `MAP_HUGETLB` is
/// tried first, falling back to normal pages.  The returned region's
/// `size()` is the actual mapping size.
pub fn allocate_mapped_memory(size: u64, options: MappingOptions) -> Result<MmapRegion, MemoryError> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

    if options.hugepages {
        let huge_size = align_up(size, HUGE_PAGE_SIZE);
        match MmapRegion::build(None, huge_size as usize, prot, flags | libc::MAP_HUGETLB) {
            Ok(region) => return Ok(region),
            Err(e) => warn!("Hugepage mapping of {huge_size:#x} bytes failed ({e}), using 4K pages"),
        }
    }

    let size = align_up(size, PAGE_SIZE);
    let region =
        MmapRegion::build(None, size as usize, prot, flags).map_err(|_| MemoryError::Allocate { size })?;

    if !options.short_lived {
        advise(region.as_ptr(), region.size(), libc::MADV_MERGEABLE);
        if options.transparent_hugepages {
            advise(region.as_ptr(), region.size(), libc::MADV_HUGEPAGE);
        }
    }
    Ok(region)
}

fn advise(ptr: *mut u8, len: usize, advice: libc::c_int) {
    // SAFETY: ptr/len describe a live mapping we just created.
    let ret = unsafe { libc::madvise(ptr.cast(), len, advice) };
    if ret != 0 {
        debug!("madvise({advice}) failed: {}", std::io::Error::last_os_error());
    }
}

/// Installs host memory into a VM's guest-physical address space.
///
/// Implemented by [`kvm_ioctls::VmFd`]; address spaces that never run
/// (unit tests, offline inspection) use a no-op installer.
pub trait MemoryInstaller: Send + Sync {
    fn install(&self, slot: u32, guest_addr: u64, size: u64, host_addr: u64) -> Result<(), MemoryError>;
}

impl MemoryInstaller for kvm_ioctls::VmFd {
    fn install(&self, slot: u32, guest_addr: u64, size: u64, host_addr: u64) -> Result<(), MemoryError> {
        let region = kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: guest_addr,
            memory_size: size,
            userspace_addr: host_addr,
        };
        // SAFETY: host_addr..host_addr+size is a live mapping owned by an
        // AddressSpace that outlives the VM's use of the slot.
        unsafe { self.set_user_memory_region(region) }.map_err(|source| MemoryError::Install { slot, source })
    }
}

/// Installer for address spaces that are never attached to a VM.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

impl MemoryInstaller for Detached {
    fn install(&self, _slot: u32, _guest_addr: u64, _size: u64, _host_addr: u64) -> Result<(), MemoryError> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  AddressSpace
// ═══════════════════════════════════════════════════════════════════════

/// Another machine's address space, aliased into this one.
pub(crate) struct RemoteLink {
    pub(crate) space: Arc<AddressSpace>,
    /// PDPT entries overwritten by the active splice, for restoration.
    pub(crate) saved: Vec<(usize, u64)>,
    /// FS base of the remote's main vCPU at connect time.
    pub(crate) tls_base: u64,
}

/// Guest-physical memory of one machine.
pub struct AddressSpace {
    physbase: u64,
    safebase: u64,
    size: u64,
    /// Single-region view of the base mapping.  Forks clone it, which
    /// shares the underlying `Arc<GuestRegionMmap>`.
    base: GuestMemoryMmap,
    host_base: usize,
    forked: bool,
    /// Set once page tables are in copy-on-write form.
    cow: AtomicBool,
    /// Guest-physical address of the active PML4.
    pub(crate) root: AtomicU64,
    /// Pristine PML4 that forks are cloned from.
    pub(crate) root_template: Mutex<Option<Box<[u64; 512]>>>,
    banks: Mutex<MemoryBanks>,
    pub(crate) remote: RwLock<Option<RemoteLink>>,
    remote_connected: AtomicBool,
    /// Bumped whenever the host rewrites live page-table entries; vCPUs
    /// flush their TLB before re-entering the guest when it moved.
    tlb_generation: AtomicU64,
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("physbase", &format_args!("{:#x}", self.physbase))
            .field("safebase", &format_args!("{:#x}", self.safebase))
            .field("size", &format_args!("{:#x}", self.size))
            .field("forked", &self.forked)
            .field("cow", &self.uses_cow())
            .finish_non_exhaustive()
    }
}

impl AddressSpace {
    /// Map `size` bytes of guest memory at guest-physical `physbase`.
    ///
    /// The size is rounded up to 2 MiB.  Nothing is installed into a VM
    /// yet; see [`install_base`](Self::install_base).
    pub fn new(
        physbase: u64,
        size: u64,
        options: MappingOptions,
        max_cow_pages: u64,
        installer: Arc<dyn MemoryInstaller>,
    ) -> Result<Self, MemoryError> {
        let size = align_up(size, HUGE_PAGE_SIZE);
        validate_layout(physbase, size)?;

        let mapping = allocate_mapped_memory(size, options)?;
        let region =
            GuestRegionMmap::new(mapping, GuestAddress(physbase)).map_err(|_| MemoryError::Allocate { size })?;
        let base = GuestMemoryMmap::from_regions(vec![region]).map_err(|_| MemoryError::Allocate { size })?;
        let host_base = base
            .get_host_address(GuestAddress(physbase))
            .map_err(|_| MemoryError::NotMapped { addr: physbase })? as usize;

        info!(
            "Guest memory created: {} MB at {physbase:#x} ({size:#x} bytes)",
            size / (1024 * 1024)
        );

        Ok(Self {
            physbase,
            safebase: physbase + SAFEBASE_OFFSET,
            size,
            base,
            host_base,
            forked: false,
            cow: AtomicBool::new(false),
            root: AtomicU64::new(physbase + PT_ADDR),
            root_template: Mutex::new(None),
            banks: Mutex::new(MemoryBanks::new(max_cow_pages, options, installer)),
            remote: RwLock::new(None),
            remote_connected: AtomicBool::new(false),
            tlb_generation: AtomicU64::new(0),
        })
    }

    /// New address space sharing `master`'s base region, with empty banks.
    ///
    /// The caller clones the master's root table afterwards (see
    /// `paging`); until then the space has no valid root.
    pub fn fork_of(
        master: &AddressSpace,
        max_cow_pages: u64,
        options: MappingOptions,
        installer: Arc<dyn MemoryInstaller>,
    ) -> Self {
        Self {
            physbase: master.physbase,
            safebase: master.safebase,
            size: master.size,
            base: master.base.clone(),
            host_base: master.host_base,
            forked: true,
            cow: AtomicBool::new(true),
            root: AtomicU64::new(0),
            root_template: Mutex::new(None),
            banks: Mutex::new(MemoryBanks::new(max_cow_pages, options, installer)),
            remote: RwLock::new(None),
            remote_connected: AtomicBool::new(false),
            tlb_generation: AtomicU64::new(0),
        }
    }

    /// Install the base region into KVM slot [`BASE_SLOT`].
    pub fn install_base(&self, installer: &dyn MemoryInstaller) -> Result<(), MemoryError> {
        installer.install(BASE_SLOT, self.physbase, self.size, self.host_base as u64)
    }

    /// Install this space's base region into another VM at `slot`.
    pub fn install_alias(&self, installer: &dyn MemoryInstaller, slot: u32) -> Result<(), MemoryError> {
        installer.install(slot, self.physbase, self.size, self.host_base as u64)
    }

    pub fn physbase(&self) -> u64 {
        self.physbase
    }

    pub fn safebase(&self) -> u64 {
        self.safebase
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// One past the last byte of the base region.
    pub fn end(&self) -> u64 {
        self.physbase + self.size
    }

    pub fn is_forked(&self) -> bool {
        self.forked
    }

    /// Whether both spaces are views of the same base mapping (a master
    /// and its forks).
    pub fn shares_base_with(&self, other: &AddressSpace) -> bool {
        self.host_base == other.host_base && self.size == other.size
    }

    /// Whether page tables are in copy-on-write form (forks and
    /// prepared masters).
    pub fn uses_cow(&self) -> bool {
        self.cow.load(Ordering::Acquire)
    }

    pub(crate) fn set_cow(&self) {
        self.cow.store(true, Ordering::Release);
    }

    pub fn root(&self) -> u64 {
        self.root.load(Ordering::Acquire)
    }

    /// The base region as a `vm-memory` guest memory (for loaders).
    pub fn guest_memory(&self) -> &GuestMemoryMmap {
        &self.base
    }

    pub(crate) fn banks(&self) -> MutexGuard<'_, MemoryBanks> {
        // A panic while holding the lock leaves the tables consistent:
        // entries are published with single stores after the page is ready.
        self.banks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn remote_connected(&self) -> bool {
        self.remote_connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_remote_connected(&self, connected: bool) {
        self.remote_connected.store(connected, Ordering::Release);
    }

    pub fn tlb_generation(&self) -> u64 {
        self.tlb_generation.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate_tlb(&self) {
        self.tlb_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Remote address space, if one is configured.
    pub fn remote(&self) -> Option<Arc<AddressSpace>> {
        self.remote
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|link| Arc::clone(&link.space))
    }

    /// Whether `[addr, addr+len)` lies inside the base region.
    pub fn within(&self, addr: u64, len: u64) -> bool {
        range_within(addr, len, self.physbase, self.end())
    }

    /// Whether `[addr, addr+len)` lies inside the guest-reachable part of
    /// the base region.
    pub fn safely_within(&self, addr: u64, len: u64) -> bool {
        range_within(addr, len, self.safebase, self.end())
    }

    /// Whether `addr` belongs to the configured remote's base region,
    /// connected or not.
    pub fn is_foreign_address(&self, addr: u64) -> bool {
        !self.within(addr, 1) && self.remote().is_some_and(|remote| remote.within(addr, 1))
    }

    // ─── translation ─────────────────────────────────────────────

    /// Host pointer for guest-physical `[addr, addr+len)`.
    ///
    /// Tries the base region, then the banks in allocation order, then
    /// the remote base region while a remote is connected.
    pub fn translate(&self, addr: u64, len: u64) -> Result<*mut u8, MemoryError> {
        let banks = self.banks();
        self.translate_with(&banks, addr, len)
    }

    pub(crate) fn translate_with(&self, banks: &MemoryBanks, addr: u64, len: u64) -> Result<*mut u8, MemoryError> {
        if self.within(addr, len) {
            return Ok((self.host_base + (addr - self.physbase) as usize) as *mut u8);
        }
        if let Some(host) = banks.translate(addr, len) {
            return Ok(host as *mut u8);
        }
        if let Some(host) = self.remote_translate(addr, len, false) {
            return Ok(host as *mut u8);
        }
        Err(MemoryError::OutOfRange { addr, len })
    }

    /// Like [`translate`](Self::translate), but rejects the kernel area
    /// below `safebase` (of this space and of a connected remote).
    pub fn safely_translate(&self, addr: u64, len: u64) -> Result<*mut u8, MemoryError> {
        if let Some(host) = self.banks().translate(addr, len) {
            return Ok(host as *mut u8);
        }
        if self.safely_within(addr, len) {
            return Ok((self.host_base + (addr - self.physbase) as usize) as *mut u8);
        }
        if let Some(host) = self.remote_translate(addr, len, true) {
            return Ok(host as *mut u8);
        }
        Err(MemoryError::OutOfRange { addr, len })
    }

    fn remote_translate(&self, addr: u64, len: u64, safe: bool) -> Option<usize> {
        if !self.remote_connected() {
            return None;
        }
        let guard = self.remote.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let remote = &guard.as_ref()?.space;
        let ok = if safe {
            remote.safely_within(addr, len)
        } else {
            remote.within(addr, len)
        };
        ok.then(|| remote.host_base + (addr - remote.physbase) as usize)
    }

    /// Whether a guest-virtual range may be touched on behalf of the
    /// guest: inside this space's safe range, or inside a connected
    /// remote's safe range.
    pub(crate) fn check_guest_range(&self, addr: u64, len: u64) -> Result<(), MemoryError> {
        if self.safely_within(addr, len) || self.remote_translate(addr, len, true).is_some() {
            Ok(())
        } else {
            Err(MemoryError::OutOfRange { addr, len })
        }
    }

    // ─── raw entry access ────────────────────────────────────────

    /// Load a page-table entry from guest-physical `addr`.
    pub(crate) fn load_entry(&self, banks: &MemoryBanks, addr: u64) -> Result<u64, MemoryError> {
        let ptr = self.translate_with(banks, addr, 8)?;
        if ptr as usize % 8 != 0 {
            return Err(MemoryError::Misaligned { addr });
        }
        // SAFETY: ptr is an aligned, live 8-byte location in a guest
        // mapping.  Other vCPUs may access it concurrently, hence atomic.
        Ok(unsafe { AtomicU64::from_ptr(ptr.cast()) }.load(Ordering::Acquire))
    }

    /// Store a page-table entry at guest-physical `addr`.
    pub(crate) fn store_entry(&self, banks: &MemoryBanks, addr: u64, value: u64) -> Result<(), MemoryError> {
        let ptr = self.translate_with(banks, addr, 8)?;
        if ptr as usize % 8 != 0 {
            return Err(MemoryError::Misaligned { addr });
        }
        // SAFETY: as in load_entry.
        unsafe { AtomicU64::from_ptr(ptr.cast()) }.store(value, Ordering::Release);
        Ok(())
    }

    // ─── bank accounting ─────────────────────────────────────────

    /// Pages handed out from banks.
    pub fn banked_pages(&self) -> u64 {
        self.banks().used_pages()
    }

    /// Pages mapped into banks (used or not).
    pub fn banked_allocated_pages(&self) -> u64 {
        self.banks().allocated_pages()
    }

    /// Bank budget in pages.
    pub fn banked_capacity_pages(&self) -> u64 {
        self.banks().max_pages()
    }

    pub(crate) fn set_banked_capacity_pages(&self, max_pages: u64) {
        self.banks().set_max_pages(max_pages);
    }

    /// Forget every banked page.  The caller installs a new root right
    /// after; until then the old root points at recycled pages.
    pub(crate) fn reset_banks(&self) {
        self.banks().reset();
        self.invalidate_tlb();
    }

    /// Host pointer into a connected remote's base region.
    pub(crate) fn remote_host(&self, addr: u64, len: u64) -> Option<*mut u8> {
        self.remote_translate(addr, len, false).map(|host| host as *mut u8)
    }
}

/// Check that a base region fits the fixed layout and KVM's reserved pages.
fn validate_layout(physbase: u64, size: u64) -> Result<(), MemoryError> {
    if size < MIN_MEMORY {
        return Err(MemoryError::TooSmall { size });
    }
    if physbase % PHYSBASE_ALIGN != 0 {
        return Err(MemoryError::Misaligned { addr: physbase });
    }
    let end = physbase + size;
    if end > BANK_ARENA_BASE {
        return Err(MemoryError::TooLarge { size, reason: "overlaps the bank arena" });
    }
    if physbase < KVM_TSS_ADDRESS + 4 * PAGE_SIZE && end > KVM_TSS_ADDRESS {
        return Err(MemoryError::TooLarge { size, reason: "overlaps KVM's TSS and identity map" });
    }
    let tables_end = PT_ADDR + crate::verified::paging::pagetable_pages(size) * PAGE_SIZE;
    if tables_end > SMP_IST_ADDR {
        return Err(MemoryError::TooLarge { size, reason: "page tables overflow the kernel area" });
    }
    Ok(())
}

/// Host-only address space at physbase 0 with a 256-page bank budget.
#[cfg(test)]
pub(crate) fn detached(size: u64) -> AddressSpace {
    AddressSpace::new(0, size, MappingOptions::default(), 256, Arc::new(Detached)).unwrap()
}

fn range_within(addr: u64, len: u64, begin: u64, end: u64) -> bool {
    match addr.checked_add(len) {
        Some(last) => addr >= begin && last <= end,
        None => false,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_rejects_tiny_memory() {
        assert!(matches!(validate_layout(0, 0x10_0000), Err(MemoryError::TooSmall { .. })));
    }

    #[test]
    fn layout_rejects_unaligned_physbase() {
        assert!(matches!(
            validate_layout(0x20_0000, 64 << 20),
            Err(MemoryError::Misaligned { .. })
        ));
    }

    #[test]
    fn layout_rejects_kvm_reserved_overlap() {
        assert!(matches!(
            validate_layout(0, 4 << 30),
            Err(MemoryError::TooLarge { .. })
        ));
        assert!(validate_layout(1 << 32, 1 << 30).is_ok());
    }

    #[test]
    fn size_rounds_to_huge_pages() {
        let mem = detached((4 << 20) + 1);
        assert_eq!(mem.size(), 6 << 20);
    }

    #[test]
    fn safely_translate_respects_safebase() {
        let mem = detached(8 << 20);
        assert!(mem.translate(0x1600, 8).is_ok());
        assert!(matches!(
            mem.safely_translate(0x1600, 8),
            Err(MemoryError::OutOfRange { addr: 0x1600, len: 8 })
        ));
        assert!(mem.safely_translate(SAFEBASE_OFFSET, 8).is_ok());
        assert!(mem.safely_translate(SAFEBASE_OFFSET - 4, 8).is_err());
    }

    #[test]
    fn safely_translate_reaches_used_bank_pages() {
        let mem = detached(8 << 20);
        let page = mem.banks().allocate_page().unwrap();
        assert_eq!(page.addr, BANK_ARENA_BASE);

        let host = mem.safely_translate(page.addr + 16, 8).unwrap();
        assert_eq!(host as usize, page.host + 16);
        assert_eq!(mem.banks().used_pages(), 1);
        assert!(matches!(
            mem.safely_translate(page.addr + PAGE_SIZE, 8),
            Err(MemoryError::OutOfRange { .. })
        ));
    }

    #[test]
    fn translate_rejects_straddling_end() {
        let mem = detached(8 << 20);
        assert!(mem.translate((8 << 20) - 8, 8).is_ok());
        assert!(matches!(
            mem.translate((8 << 20) - 4, 8),
            Err(MemoryError::OutOfRange { .. })
        ));
        assert!(mem.safely_translate(u64::MAX - 2, 8).is_err());
    }

    #[test]
    fn entries_roundtrip_through_host_memory() {
        let mem = detached(4 << 20);
        let banks = mem.banks();
        mem.store_entry(&banks, 0x5008, 0xdead_b000).unwrap();
        assert_eq!(mem.load_entry(&banks, 0x5008).unwrap(), 0xdead_b000);
        assert!(matches!(
            mem.load_entry(&banks, 0x5004),
            Err(MemoryError::Misaligned { addr: 0x5004 })
        ));
    }

    #[test]
    fn forks_share_the_base_mapping() {
        let master = detached(4 << 20);
        let fork = AddressSpace::fork_of(&master, 16, MappingOptions::default(), Arc::new(Detached));
        let other = detached(4 << 20);
        assert!(fork.shares_base_with(&master));
        assert!(fork.is_forked());
        assert!(!other.shares_base_with(&master));
    }

    #[test]
    fn no_foreign_addresses_without_remote() {
        let mem = detached(4 << 20);
        assert!(!mem.is_foreign_address(1 << 32));
        assert!(!mem.is_foreign_address(0x20_0000));
    }

    #[test]
    fn hugepage_request_falls_back() {
        let options = MappingOptions { hugepages: true, ..Default::default() };
        let region = allocate_mapped_memory(HUGE_PAGE_SIZE, options).unwrap();
        assert!(region.size() as u64 >= HUGE_PAGE_SIZE);
    }
}

//! Copy-on-write page pools.
//!
//! A [`MemoryBank`] is one host mapping of up to [`BANK_PAGES`] pages,
//! installed into the VM at its own KVM slot inside the bank arena.  Pages
//! are handed out in order and never freed individually; [`MemoryBanks::reset`]
//! rewinds every bank at once while keeping the mappings (and slots) alive.

use std::sync::Arc;

use log::{debug, warn};
use vm_memory::{GuestAddress, GuestMemoryRegion, GuestRegionMmap, MemoryRegionAddress};

use crate::memory::{
    allocate_mapped_memory, MappingOptions, MemoryError, MemoryInstaller, BANK_ARENA_BASE,
    BANK_FALLBACK_PAGES, BANK_FIRST_SLOT, BANK_PAGES, PAGE_SIZE,
};

/// A page handed out by a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankPage {
    /// Guest-physical address.
    pub addr: u64,
    /// Host address.
    pub host: usize,
}

impl BankPage {
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.host as *mut u8
    }
}

/// One lazily consumed pool of pages.
pub struct MemoryBank {
    region: GuestRegionMmap,
    host_base: usize,
    addr: u64,
    n_pages: u64,
    n_used: u64,
    slot: u32,
}

impl MemoryBank {
    fn new(
        addr: u64,
        n_pages: u64,
        slot: u32,
        options: MappingOptions,
        installer: &dyn MemoryInstaller,
    ) -> Result<Self, MemoryError> {
        let size = n_pages * PAGE_SIZE;
        let mapping = allocate_mapped_memory(size, MappingOptions { hugepages: false, ..options })?;
        let region = GuestRegionMmap::new(mapping, GuestAddress(addr)).map_err(|_| MemoryError::Allocate { size })?;
        let host_base = region
            .get_host_address(MemoryRegionAddress(0))
            .map_err(|_| MemoryError::NotMapped { addr })? as usize;

        installer.install(slot, addr, size, host_base as u64)?;
        debug!("Memory bank at {addr:#x}: {n_pages} pages, slot {slot}");

        Ok(Self { region, host_base, addr, n_pages, n_used: 0, slot })
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn n_pages(&self) -> u64 {
        self.n_pages
    }

    pub fn n_used(&self) -> u64 {
        self.n_used
    }

    pub fn size(&self) -> u64 {
        self.region.len()
    }

    /// Whether `[addr, addr+len)` lies inside the used part of the bank.
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        let used_end = self.addr + self.n_used * PAGE_SIZE;
        addr >= self.addr && addr.checked_add(len).is_some_and(|end| end <= used_end)
    }

    fn take_page(&mut self) -> Option<BankPage> {
        if self.n_used == self.n_pages {
            return None;
        }
        let offset = self.n_used * PAGE_SIZE;
        self.n_used += 1;
        Some(BankPage {
            addr: self.addr + offset,
            host: self.host_base + offset as usize,
        })
    }
}

/// All banks of one address space plus the page budget.
pub struct MemoryBanks {
    banks: Vec<MemoryBank>,
    max_pages: u64,
    options: MappingOptions,
    installer: Arc<dyn MemoryInstaller>,
}

impl MemoryBanks {
    pub fn new(max_pages: u64, options: MappingOptions, installer: Arc<dyn MemoryInstaller>) -> Self {
        Self {
            banks: Vec::new(),
            max_pages,
            options,
            installer,
        }
    }

    /// Raise or lower the page budget.  Already handed-out pages stay.
    pub fn set_max_pages(&mut self, max_pages: u64) {
        self.max_pages = max_pages;
    }

    pub fn max_pages(&self) -> u64 {
        self.max_pages
    }

    pub fn used_pages(&self) -> u64 {
        self.banks.iter().map(MemoryBank::n_used).sum()
    }

    pub fn allocated_pages(&self) -> u64 {
        self.banks.iter().map(MemoryBank::n_pages).sum()
    }

    pub fn banks(&self) -> &[MemoryBank] {
        &self.banks
    }

    /// Hand out the next free page, mapping a new bank when needed.
    ///
    /// The page content is whatever was there before; callers overwrite
    /// the whole page.
    pub fn allocate_page(&mut self) -> Result<BankPage, MemoryError> {
        if let Some(page) = self.banks.iter_mut().find_map(MemoryBank::take_page) {
            return Ok(page);
        }

        let remaining = self.max_pages.saturating_sub(self.allocated_pages());
        if remaining == 0 {
            return Err(MemoryError::BankExhausted { max_pages: self.max_pages });
        }

        let index = self.banks.len() as u64;
        let addr = BANK_ARENA_BASE + index * BANK_PAGES * PAGE_SIZE;
        let slot = BANK_FIRST_SLOT + index as u32;
        let n_pages = remaining.min(BANK_PAGES);

        let bank = match MemoryBank::new(addr, n_pages, slot, self.options, self.installer.as_ref()) {
            Ok(bank) => bank,
            Err(MemoryError::Allocate { size }) if n_pages > BANK_FALLBACK_PAGES => {
                warn!("Bank of {size:#x} bytes could not be mapped, retrying with {BANK_FALLBACK_PAGES} pages");
                MemoryBank::new(addr, BANK_FALLBACK_PAGES, slot, self.options, self.installer.as_ref())?
            }
            Err(e) => return Err(e),
        };
        self.banks.push(bank);

        self.banks
            .last_mut()
            .and_then(MemoryBank::take_page)
            .ok_or(MemoryError::BankExhausted { max_pages: self.max_pages })
    }

    /// Host address for `[addr, addr+len)` if a bank serves it.
    pub fn translate(&self, addr: u64, len: u64) -> Option<usize> {
        self.banks
            .iter()
            .find(|bank| bank.contains(addr, len))
            .map(|bank| bank.host_base + (addr - bank.addr) as usize)
    }

    /// Whether the page at `addr` was handed out by one of these banks.
    pub fn owns(&self, addr: u64) -> bool {
        self.banks.iter().any(|bank| bank.contains(addr, 1))
    }

    /// Rewind every bank.  Mappings and KVM slots stay in place.
    pub fn reset(&mut self) {
        for bank in &mut self.banks {
            bank.n_used = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Detached;

    fn banks(max_pages: u64) -> MemoryBanks {
        MemoryBanks::new(max_pages, MappingOptions::default(), Arc::new(Detached))
    }

    #[test]
    fn pages_are_handed_out_in_order() {
        let mut b = banks(16);
        let first = b.allocate_page().unwrap();
        let second = b.allocate_page().unwrap();
        assert_eq!(first.addr, BANK_ARENA_BASE);
        assert_eq!(second.addr, BANK_ARENA_BASE + PAGE_SIZE);
        assert_eq!(second.host - first.host, PAGE_SIZE as usize);
        assert_eq!(b.used_pages(), 2);
        assert_eq!(b.allocated_pages(), 16);
    }

    #[test]
    fn budget_is_enforced() {
        let mut b = banks(3);
        for _ in 0..3 {
            b.allocate_page().unwrap();
        }
        assert!(matches!(
            b.allocate_page(),
            Err(MemoryError::BankExhausted { max_pages: 3 })
        ));
    }

    #[test]
    fn new_bank_when_first_is_full() {
        let mut b = banks(BANK_PAGES + 2);
        for _ in 0..BANK_PAGES {
            b.allocate_page().unwrap();
        }
        let page = b.allocate_page().unwrap();
        assert_eq!(page.addr, BANK_ARENA_BASE + BANK_PAGES * PAGE_SIZE);
        assert_eq!(b.banks().len(), 2);
        assert_eq!(b.banks()[1].slot(), BANK_FIRST_SLOT + 1);
        assert_eq!(b.banks()[1].n_pages(), 2);
    }

    #[test]
    fn translate_and_ownership_cover_used_pages_only() {
        let mut b = banks(8);
        let page = b.allocate_page().unwrap();
        assert_eq!(b.translate(page.addr + 8, 8), Some(page.host + 8));
        assert!(b.owns(page.addr));
        assert!(!b.owns(page.addr + PAGE_SIZE));
        assert_eq!(b.translate(page.addr + PAGE_SIZE - 4, 8), None);
    }

    #[test]
    fn reset_keeps_banks_and_rewinds() {
        let mut b = banks(8);
        let first = b.allocate_page().unwrap();
        b.allocate_page().unwrap();
        b.reset();
        assert_eq!(b.used_pages(), 0);
        assert_eq!(b.allocated_pages(), 8);
        assert!(!b.owns(first.addr));
        assert_eq!(b.allocate_page().unwrap(), first);
    }
}

//! Identity page tables and copy-on-write page materialization.
//!
//! # Table layout
//!
//! ```text
//!   physbase + 0x5000  PML4 ─┐
//!   physbase + 0x6000  PDPT ◀┘─┬─ [physbase >> 30]     ─▶ PD 0
//!                              └─ [physbase >> 30] + n ─▶ PD n
//!   physbase + 0x7000  PT (low 2 MiB, 4 KiB pages) ◀── PD 0 [0]
//!   physbase + 0x8000  PD 0 .. PD n   (2 MiB user pages)
//! ```
//!
//! # Copy-on-write
//!
//! [`AddressSpace::make_cow`] write-protects every user-writable leaf and
//! tags it `CLONEABLE`.  A later write (guest page fault or host copy)
//! goes through [`AddressSpace::allocate_page_for_write`], which walks from
//! the root and duplicates every table page the machine does not own into
//! its banks before touching it, splitting 2 MiB leaves on the way.  The
//! shared tables and pages of the master are never written.

use std::sync::atomic::Ordering;

use log::{debug, info};
use vm_memory::{Bytes, GuestAddress};

use crate::bank::MemoryBanks;
use crate::memory::{AddressSpace, MemoryError};
use crate::verified::paging::{
    cow_entry, entry_address, gigabyte_slots, huge_user_entry, is_huge, is_present, low_page_entry,
    align_up, make_entry, page_align_down, pd_index, pdpt_index, pml4_index, private_leaf,
    pt_index, split_huge_entry, HUGE_PAGE_SIZE, LOW_REGION_END, PAGE_SIZE, PDE64_ADDR_MASK,
    PDE64_FLAGS_MASK, PDE64_NX, PT_ADDR, PT_ENTRIES, TABLE_FLAGS,
};

const PDPT_OFFSET: u64 = PAGE_SIZE;
const LOW_PT_OFFSET: u64 = 2 * PAGE_SIZE;
const PD_OFFSET: u64 = 3 * PAGE_SIZE;

/// A root table snapshot that forks are cloned from.
pub type RootTemplate = Box<[u64; PT_ENTRIES]>;

impl AddressSpace {
    /// Write the identity map for the base region and make it the root.
    pub fn setup_identity_map(&self) -> Result<(), MemoryError> {
        let mem = self.guest_memory();
        let physbase = self.physbase();
        let end = self.end();
        let pml4 = physbase + PT_ADDR;
        let pdpt = pml4 + PDPT_OFFSET;
        let low_pt = pml4 + LOW_PT_OFFSET;

        let write = |addr: u64, value: u64| {
            mem.write_obj(value, GuestAddress(addr))
                .map_err(|_| MemoryError::OutOfRange { addr, len: 8 })
        };

        write(pml4 + pml4_index(physbase) as u64 * 8, make_entry(pdpt, TABLE_FLAGS))?;

        for (n, slot) in gigabyte_slots(physbase, self.size()).enumerate() {
            let pd = pml4 + PD_OFFSET + n as u64 * PAGE_SIZE;
            write(pdpt + slot as u64 * 8, make_entry(pd, TABLE_FLAGS))?;

            let giga = (slot as u64) << 30;
            for i in 0..PT_ENTRIES {
                let addr = giga + i as u64 * HUGE_PAGE_SIZE;
                let entry = if addr == physbase {
                    make_entry(low_pt, TABLE_FLAGS)
                } else if addr > physbase && addr + HUGE_PAGE_SIZE <= end {
                    huge_user_entry(addr)
                } else {
                    continue;
                };
                write(pd + i as u64 * 8, entry)?;
            }
        }

        for i in 0..PT_ENTRIES {
            write(low_pt + i as u64 * 8, low_page_entry(physbase, i))?;
        }

        self.root.store(pml4, Ordering::Release);
        debug!("Identity map for {physbase:#x}..{end:#x} written at {pml4:#x}");
        Ok(())
    }

    /// Convert the page tables to copy-on-write form and record the root
    /// template forks are cloned from.  Idempotent.
    pub fn make_cow(&self) -> Result<(), MemoryError> {
        if self.uses_cow() {
            return Ok(());
        }
        let banks = self.banks();
        let root = self.root();
        let mut leaves = 0u64;

        for_each_present(self, &banks, root, |pml4e| {
            for_each_present(self, &banks, entry_address(pml4e), |pdpte| {
                let pd = entry_address(pdpte);
                for i in 0..PT_ENTRIES as u64 {
                    let pde_addr = pd + i * 8;
                    let pde = self.load_entry(&banks, pde_addr)?;
                    if !is_present(pde) {
                        continue;
                    }
                    if is_huge(pde) {
                        self.store_entry(&banks, pde_addr, cow_entry(pde))?;
                        leaves += 1;
                        continue;
                    }
                    let pt = entry_address(pde);
                    for j in 0..PT_ENTRIES as u64 {
                        let pte_addr = pt + j * 8;
                        let pte = self.load_entry(&banks, pte_addr)?;
                        if is_present(pte) {
                            self.store_entry(&banks, pte_addr, cow_entry(pte))?;
                            leaves += 1;
                        }
                    }
                }
                Ok(())
            })
        })?;

        let template = self.read_table(&banks, root)?;
        *self.root_template.lock().unwrap_or_else(|p| p.into_inner()) = Some(template);
        drop(banks);

        self.set_cow();
        self.invalidate_tlb();
        info!("Page tables at {root:#x} are now copy-on-write ({leaves} leaves)");
        Ok(())
    }

    /// Copy of the root template recorded by [`make_cow`](Self::make_cow).
    pub fn root_template(&self) -> Option<RootTemplate> {
        self.root_template.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Place a copy of `template` in a fresh bank page and make it the root.
    pub fn install_root(&self, template: &[u64; PT_ENTRIES]) -> Result<u64, MemoryError> {
        let mut banks = self.banks();
        let page = banks.allocate_page()?;
        for (i, entry) in template.iter().enumerate() {
            self.store_entry(&banks, page.addr + i as u64 * 8, *entry)?;
        }
        self.root.store(page.addr, Ordering::Release);
        self.invalidate_tlb();
        Ok(page.addr)
    }

    fn read_table(&self, banks: &MemoryBanks, table: u64) -> Result<RootTemplate, MemoryError> {
        let mut out = Box::new([0u64; PT_ENTRIES]);
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.load_entry(banks, table + i as u64 * 8)?;
        }
        Ok(out)
    }

    // ─── materialization ─────────────────────────────────────────

    /// Make the page containing guest-virtual `addr` private and writable
    /// by this machine, and return the host pointer for `addr`.
    ///
    /// With `zero_fill` the new page is zeroed instead of copied.  `flags`
    /// are OR'd into the new leaf.  A page already owned only gets its
    /// flags updated.
    pub fn allocate_page_for_write(&self, addr: u64, flags: u64, zero_fill: bool) -> Result<*mut u8, MemoryError> {
        let mut banks = self.banks();
        let page = page_align_down(addr);
        let offset = (addr - page) as usize;

        let pdpt = self.owned_child(&mut banks, self.root(), pml4_index(addr), addr)?;
        let pd = self.owned_child(&mut banks, pdpt, pdpt_index(addr), addr)?;

        let pde_addr = pd + pd_index(addr) as u64 * 8;
        let pde = self.load_entry(&banks, pde_addr)?;
        if !is_present(pde) {
            return Err(MemoryError::NotMapped { addr });
        }
        let pt = if is_huge(pde) {
            self.split_huge(&mut banks, pde_addr, pde)?
        } else {
            self.owned_child(&mut banks, pd, pd_index(addr), addr)?
        };

        let pte_addr = pt + pt_index(addr) as u64 * 8;
        let pte = self.load_entry(&banks, pte_addr)?;
        if !is_present(pte) {
            return Err(MemoryError::NotMapped { addr });
        }
        let target = entry_address(pte);

        if self.is_owned(&banks, target) {
            let leaf = private_leaf(pte, target, flags);
            if leaf != pte {
                self.store_entry(&banks, pte_addr, leaf)?;
            }
            let host = self.translate_with(&banks, target, PAGE_SIZE)?;
            // SAFETY: offset < PAGE_SIZE and host covers the whole page.
            return Ok(unsafe { host.add(offset) });
        }

        let fresh = banks.allocate_page()?;
        if zero_fill {
            // SAFETY: fresh.host is a whole bank page.
            unsafe { std::ptr::write_bytes(fresh.as_mut_ptr(), 0, PAGE_SIZE as usize) };
        } else {
            let source = self.translate_with(&banks, target, PAGE_SIZE)?;
            // SAFETY: both pointers cover a whole page; bank pages never
            // alias the base region or another bank page.
            unsafe { std::ptr::copy_nonoverlapping(source, fresh.as_mut_ptr(), PAGE_SIZE as usize) };
        }
        self.store_entry(&banks, pte_addr, private_leaf(pte, fresh.addr, flags))?;
        debug!("CoW page {page:#x} -> {:#x} (zero={zero_fill})", fresh.addr);

        // SAFETY: offset < PAGE_SIZE.
        Ok(unsafe { fresh.as_mut_ptr().add(offset) })
    }

    /// Without copy-on-write every table is private to this machine.
    fn is_owned(&self, banks: &MemoryBanks, addr: u64) -> bool {
        !self.uses_cow() || banks.owns(addr)
    }

    /// Guest-physical address of the table referenced by `table[index]`,
    /// duplicated into a bank page first if this machine does not own it.
    pub(crate) fn owned_child(
        &self,
        banks: &mut MemoryBanks,
        table: u64,
        index: usize,
        addr: u64,
    ) -> Result<u64, MemoryError> {
        let entry_addr = table + index as u64 * 8;
        let entry = self.load_entry(banks, entry_addr)?;
        if !is_present(entry) || is_huge(entry) {
            return Err(MemoryError::NotMapped { addr });
        }
        let child = entry_address(entry);
        if self.is_owned(banks, child) {
            return Ok(child);
        }

        let fresh = banks.allocate_page()?;
        let source = self.translate_with(banks, child, PAGE_SIZE)?;
        // SAFETY: whole pages, distinct mappings.
        unsafe { std::ptr::copy_nonoverlapping(source, fresh.as_mut_ptr(), PAGE_SIZE as usize) };
        self.store_entry(banks, entry_addr, make_entry(fresh.addr, entry & PDE64_FLAGS_MASK))?;
        Ok(fresh.addr)
    }

    /// Replace the 2 MiB leaf at `pde_addr` with a private 4 KiB table.
    fn split_huge(&self, banks: &mut MemoryBanks, pde_addr: u64, pde: u64) -> Result<u64, MemoryError> {
        let fresh = banks.allocate_page()?;
        for i in 0..PT_ENTRIES {
            self.store_entry(banks, fresh.addr + i as u64 * 8, split_huge_entry(pde, i))?;
        }
        self.store_entry(banks, pde_addr, make_entry(fresh.addr, TABLE_FLAGS))?;
        Ok(fresh.addr)
    }

    /// Mark every 2 MiB user page at or above `from` non-executable.
    ///
    /// Only valid before [`make_cow`](Self::make_cow): the directories
    /// are edited in place.  Returns the number of pages changed.
    pub fn set_no_execute_from(&self, from: u64) -> Result<u64, MemoryError> {
        let banks = self.banks();
        let mut addr = align_up(from.max(self.physbase() + LOW_REGION_END), HUGE_PAGE_SIZE);
        let mut changed = 0;
        while addr + HUGE_PAGE_SIZE <= self.end() {
            let pml4e = self.load_entry(&banks, self.root() + pml4_index(addr) as u64 * 8)?;
            let pdpte = self.load_entry(&banks, entry_address(pml4e) + pdpt_index(addr) as u64 * 8)?;
            if !is_present(pml4e) || !is_present(pdpte) {
                return Err(MemoryError::NotMapped { addr });
            }
            let pde_addr = entry_address(pdpte) + pd_index(addr) as u64 * 8;
            let pde = self.load_entry(&banks, pde_addr)?;
            if is_present(pde) && is_huge(pde) && pde & PDE64_NX == 0 {
                self.store_entry(&banks, pde_addr, pde | PDE64_NX)?;
                changed += 1;
            }
            addr += HUGE_PAGE_SIZE;
        }
        drop(banks);
        self.invalidate_tlb();
        debug!("Heap from {from:#x} is non-executable ({changed} pages)");
        Ok(changed)
    }

    // ─── lookup ──────────────────────────────────────────────────

    /// Guest-physical address backing guest-virtual `addr`.
    pub fn walk(&self, addr: u64) -> Result<u64, MemoryError> {
        let banks = self.banks();
        self.walk_with(&banks, addr)
    }

    fn walk_with(&self, banks: &MemoryBanks, addr: u64) -> Result<u64, MemoryError> {
        let mut table = self.root();
        for (level, shift) in [39u32, 30, 21, 12].into_iter().enumerate() {
            let index = (addr >> shift) & 511;
            let entry = self.load_entry(banks, table + index * 8)?;
            if !is_present(entry) {
                return Err(MemoryError::NotMapped { addr });
            }
            let size = 1u64 << shift;
            if shift == 12 || (level > 0 && is_huge(entry)) {
                let frame = entry & PDE64_ADDR_MASK & !(size - 1);
                return Ok(frame + (addr & (size - 1)));
            }
            table = entry_address(entry);
        }
        Err(MemoryError::NotMapped { addr })
    }

    // ─── copy helpers ────────────────────────────────────────────

    /// Copy `data` to guest-virtual `addr` on behalf of the guest.
    pub fn copy_to_guest(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.check_guest_range(addr, data.len() as u64)?;
        self.write_guest(addr, Some(data), data.len())
    }

    /// Zero `len` bytes at guest-virtual `addr`.
    pub fn zero_guest(&self, addr: u64, len: usize) -> Result<(), MemoryError> {
        self.check_guest_range(addr, len as u64)?;
        self.write_guest(addr, None, len)
    }

    /// Copy from guest-virtual `addr` into `buf` on behalf of the guest.
    pub fn copy_from_guest(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.check_guest_range(addr, buf.len() as u64)?;
        self.read_guest(addr, buf)
    }

    /// Like [`copy_to_guest`](Self::copy_to_guest) but may write the
    /// kernel area.  Host-internal use only.
    pub fn kernel_copy_to_guest(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.write_guest(addr, Some(data), data.len())
    }

    /// Like [`copy_from_guest`](Self::copy_from_guest) but may read the
    /// kernel area.  Host-internal use only.
    pub fn kernel_copy_from_guest(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.read_guest(addr, buf)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.copy_from_guest(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn kernel_read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.kernel_copy_from_guest(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.copy_to_guest(addr, &value.to_le_bytes())
    }

    fn write_guest(&self, addr: u64, src: Option<&[u8]>, len: usize) -> Result<(), MemoryError> {
        // Spliced remote memory is written in place; its tables are not ours.
        if let Some(dst) = self.remote_host(addr, len as u64) {
            // SAFETY: remote_host checked that dst covers len bytes.
            unsafe {
                match src {
                    Some(data) => std::ptr::copy_nonoverlapping(data.as_ptr(), dst, len),
                    None => std::ptr::write_bytes(dst, 0, len),
                }
            }
            return Ok(());
        }
        if !self.uses_cow() {
            let dst = self.translate(addr, len as u64)?;
            // SAFETY: translate checked that dst covers len bytes.
            unsafe {
                match src {
                    Some(data) => std::ptr::copy_nonoverlapping(data.as_ptr(), dst, len),
                    None => std::ptr::write_bytes(dst, 0, len),
                }
            }
            return Ok(());
        }

        let mut done = 0usize;
        while done < len {
            let cur = addr + done as u64;
            let chunk = ((PAGE_SIZE - (cur & (PAGE_SIZE - 1))) as usize).min(len - done);
            let whole_page = chunk == PAGE_SIZE as usize;
            let dst = self.allocate_page_for_write(cur, 0, whole_page)?;
            // SAFETY: dst points into a private page with chunk bytes left.
            unsafe {
                match src {
                    Some(data) => std::ptr::copy_nonoverlapping(data[done..].as_ptr(), dst, chunk),
                    None => std::ptr::write_bytes(dst, 0, chunk),
                }
            }
            done += chunk;
        }
        self.invalidate_tlb();
        Ok(())
    }

    fn read_guest(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        if !self.uses_cow() {
            let src = self.translate(addr, buf.len() as u64)?;
            // SAFETY: translate checked that src covers buf.len() bytes.
            unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
            return Ok(());
        }

        let banks = self.banks();
        let mut done = 0usize;
        while done < buf.len() {
            let cur = addr + done as u64;
            let chunk = ((PAGE_SIZE - (cur & (PAGE_SIZE - 1))) as usize).min(buf.len() - done);
            let phys = self.walk_with(&banks, cur)?;
            let src = self.translate_with(&banks, phys, chunk as u64)?;
            // SAFETY: translate_with checked the chunk.
            unsafe { std::ptr::copy_nonoverlapping(src, buf[done..].as_mut_ptr(), chunk) };
            done += chunk;
        }
        Ok(())
    }

    // ─── diagnostics ─────────────────────────────────────────────

    /// One line per present table entry, for the printer.
    pub fn describe_pagetables(&self) -> Result<Vec<String>, MemoryError> {
        let banks = self.banks();
        let root = self.root();
        let mut lines = vec![format!("Page tables at 0x{root:X}")];

        for i in 0..PT_ENTRIES as u64 {
            let pml4e = self.load_entry(&banks, root + i * 8)?;
            if !is_present(pml4e) {
                continue;
            }
            lines.push(format!("PML4[{i}] -> 0x{pml4e:X}"));
            let pdpt = entry_address(pml4e);
            for j in 0..PT_ENTRIES as u64 {
                let pdpte = self.load_entry(&banks, pdpt + j * 8)?;
                if !is_present(pdpte) {
                    continue;
                }
                lines.push(format!("  PDPT[{j}] -> 0x{pdpte:X}"));
                let pd = entry_address(pdpte);
                for k in 0..PT_ENTRIES as u64 {
                    let pde = self.load_entry(&banks, pd + k * 8)?;
                    if !is_present(pde) {
                        continue;
                    }
                    let vaddr = (i << 39) | (j << 30) | (k << 21);
                    if is_huge(pde) {
                        lines.push(format!("    0x{vaddr:X} 2MB -> 0x{pde:X}"));
                        continue;
                    }
                    lines.push(format!("    PD[{k}] -> 0x{pde:X}"));
                    let pt = entry_address(pde);
                    for l in 0..PT_ENTRIES as u64 {
                        let pte = self.load_entry(&banks, pt + l * 8)?;
                        if is_present(pte) {
                            lines.push(format!("      0x{:X} 4KB -> 0x{pte:X}", vaddr | (l << 12)));
                        }
                    }
                }
            }
        }
        Ok(lines)
    }
}

/// Visit every present entry of the table at `table`.
fn for_each_present<F>(space: &AddressSpace, banks: &MemoryBanks, table: u64, mut visit: F) -> Result<(), MemoryError>
where
    F: FnMut(u64) -> Result<(), MemoryError>,
{
    for i in 0..PT_ENTRIES as u64 {
        let entry = space.load_entry(banks, table + i * 8)?;
        if is_present(entry) {
            visit(entry)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{detached, MemoryError, INTR_ASM_ADDR, IST_ADDR, SAFEBASE_OFFSET};
    use crate::verified::paging::{is_cloneable, PDE64_RW, PDE64_USER};

    fn mapped(size: u64) -> AddressSpace {
        let mem = detached(size);
        mem.setup_identity_map().unwrap();
        mem
    }

    fn leaf(mem: &AddressSpace, addr: u64) -> u64 {
        let banks = mem.banks();
        let mut table = mem.root();
        for shift in [39u32, 30, 21] {
            let e = mem.load_entry(&banks, table + ((addr >> shift) & 511) * 8).unwrap();
            if shift == 21 && is_huge(e) {
                return e;
            }
            table = entry_address(e);
        }
        mem.load_entry(&banks, table + ((addr >> 12) & 511) * 8).unwrap()
    }

    #[test]
    fn identity_map_translates_to_itself() {
        let mem = mapped(8 << 20);
        for addr in [0x1000u64, 0x2000, 0x10_0123, 0x20_0000, 0x7F_FFF8] {
            assert_eq!(mem.walk(addr).unwrap(), addr, "{addr:#x}");
        }
    }

    #[test]
    fn null_page_and_beyond_end_are_unmapped() {
        let mem = mapped(8 << 20);
        assert!(matches!(mem.walk(0x10), Err(MemoryError::NotMapped { .. })));
        assert!(matches!(mem.walk(8 << 20), Err(MemoryError::NotMapped { .. })));
    }

    #[test]
    fn make_cow_write_protects_user_memory() {
        let mem = mapped(8 << 20);
        mem.make_cow().unwrap();
        let huge = leaf(&mem, 0x40_0000);
        assert!(is_cloneable(huge));
        assert_eq!(huge & PDE64_RW, 0);
        let stack = leaf(&mem, SAFEBASE_OFFSET + 0x1000);
        assert!(is_cloneable(stack));
        let ist = leaf(&mem, IST_ADDR);
        assert_ne!(ist & PDE64_RW, 0);
        assert!(mem.root_template().is_some());
    }

    #[test]
    fn cow_write_does_not_touch_shared_page() {
        let mem = mapped(8 << 20);
        mem.copy_to_guest(0x40_0000, b"master").unwrap();
        mem.make_cow().unwrap();

        mem.copy_to_guest(0x40_0000, b"child!").unwrap();

        let mut buf = [0u8; 6];
        mem.copy_from_guest(0x40_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"child!");

        // Physical page of the base region still holds the old content.
        let banks = mem.banks();
        let host = mem.translate_with(&banks, 0x40_0000, 6).unwrap();
        let original = unsafe { std::slice::from_raw_parts(host, 6) };
        assert_eq!(original, b"master");
    }

    #[test]
    fn cow_write_splits_huge_page_and_preserves_neighbours() {
        let mem = mapped(8 << 20);
        mem.copy_to_guest(0x40_1000, &[0xAB; 16]).unwrap();
        mem.make_cow().unwrap();

        mem.copy_to_guest(0x40_0000, &[1, 2, 3]).unwrap();

        assert!(!is_huge(leaf(&mem, 0x40_0000)));
        let mut buf = [0u8; 16];
        mem.copy_from_guest(0x40_1000, &mut buf).unwrap();
        assert_eq!(buf, [0xAB; 16]);
        assert!(is_cloneable(leaf(&mem, 0x40_1000)));
    }

    #[test]
    fn page_straddling_copy_roundtrips_under_cow() {
        let mem = mapped(8 << 20);
        mem.make_cow().unwrap();
        let data: Vec<u8> = (0..6000u32).map(|i| i as u8).collect();
        mem.copy_to_guest(0x30_0F00, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        mem.copy_from_guest(0x30_0F00, &mut back).unwrap();
        assert_eq!(back, data);
        assert!(mem.banked_pages() >= 3);
    }

    #[test]
    fn second_write_reuses_owned_page() {
        let mem = mapped(8 << 20);
        mem.make_cow().unwrap();
        mem.copy_to_guest(0x40_0000, &[1]).unwrap();
        let used = mem.banked_pages();
        mem.copy_to_guest(0x40_0008, &[2]).unwrap();
        assert_eq!(mem.banked_pages(), used);
    }

    #[test]
    fn installed_root_sees_template_mappings() {
        let mem = mapped(8 << 20);
        mem.make_cow().unwrap();
        let template = mem.root_template().unwrap();
        let root = mem.install_root(&template).unwrap();
        assert_eq!(mem.root(), root);
        assert_eq!(mem.walk(0x20_0000).unwrap(), 0x20_0000);
    }

    #[test]
    fn guest_copies_reject_kernel_area() {
        let mem = mapped(8 << 20);
        assert!(matches!(
            mem.copy_to_guest(INTR_ASM_ADDR, &[0]),
            Err(MemoryError::OutOfRange { .. })
        ));
        assert!(mem.kernel_copy_to_guest(INTR_ASM_ADDR, &[0x90]).is_ok());
        assert_eq!(mem.kernel_read_u64(INTR_ASM_ADDR).unwrap() & 0xFF, 0x90);
    }

    #[test]
    fn private_trampoline_page_stays_read_only() {
        let mem = mapped(8 << 20);
        mem.make_cow().unwrap();
        mem.kernel_copy_to_guest(INTR_ASM_ADDR + 16, &[7; 8]).unwrap();
        let entry = leaf(&mem, INTR_ASM_ADDR);
        assert_eq!(entry & PDE64_RW, 0);
        assert_ne!(entry & PDE64_USER, 0);
        assert_eq!(mem.kernel_read_u64(INTR_ASM_ADDR + 16).unwrap(), 0x0707_0707_0707_0707);
    }

    #[test]
    fn exhausted_budget_is_reported() {
        let mem = AddressSpace::new(
            0,
            8 << 20,
            crate::memory::MappingOptions::default(),
            2,
            std::sync::Arc::new(crate::memory::Detached),
        )
        .unwrap();
        mem.setup_identity_map().unwrap();
        mem.make_cow().unwrap();
        assert!(matches!(
            mem.copy_to_guest(0x40_0000, &[1]),
            Err(MemoryError::BankExhausted { max_pages: 2 })
        ));
    }

    #[test]
    fn heap_can_be_made_non_executable() {
        let mem = mapped(8 << 20);
        let changed = mem.set_no_execute_from(0x40_0000).unwrap();
        assert_eq!(changed, 2);
        assert_eq!(leaf(&mem, 0x20_0000) & PDE64_NX, 0);
        assert_ne!(leaf(&mem, 0x40_0000) & PDE64_NX, 0);
        assert_ne!(leaf(&mem, 0x60_0000) & PDE64_NX, 0);
        assert_eq!(mem.set_no_execute_from(0x40_0000).unwrap(), 0);
    }

    #[test]
    fn describe_lists_tables() {
        let mem = mapped(4 << 20);
        let lines = mem.describe_pagetables().unwrap();
        assert!(lines[0].starts_with("Page tables at 0x5000"));
        assert!(lines.iter().any(|l| l.contains("2MB")));
        assert!(lines.iter().any(|l| l.contains("4KB")));
    }
}

//! Remote memory: one machine addressing another machine's memory in place.
//!
//! The remote's base region is installed into this VM at [`REMOTE_SLOT`].
//! Making it reachable from guest code means splicing the remote's PDPT
//! entries (one per GiB of its memory) into this machine's PDPT:
//!
//! ```text
//!   this PML4[0] ──▶ this PDPT (owned copy)
//!                      [0]        this machine's GiB  ──▶ this PD
//!                      [k..k+n]   spliced             ──▶ remote PDs
//! ```
//!
//! Two modes:
//!
//! - **connect now**: the splice happens in [`Machine::remote_connect`].
//! - **deferred**: the trampoline header is patched with the remote base
//!   and the disconnect stub.  The first call into remote code faults
//!   on instruction fetch; the fault handler splices, swaps FS base to the
//!   remote's TLS and redirects the call's return into the disconnect
//!   stub, which undoes both.
//!
//! The saved PDPT entries live in the [`RemoteLink`].  Disconnecting
//! when nothing is spliced returns 0.

use std::sync::Arc;

use log::{debug, info};

use crate::machine::{Machine, MachineError};
use crate::memory::{AddressSpace, MemoryError, RemoteLink, REMOTE_SLOT};
use crate::trampoline::Trampoline;
use crate::vcpu::VirtualCpu;
use crate::verified::paging::{entry_address, gigabyte_slots, is_present, pml4_index, PT_ENTRIES};

impl AddressSpace {
    /// Record `remote` as this space's remote.  Nothing is spliced yet.
    pub(crate) fn attach_remote(&self, remote: Arc<AddressSpace>, tls_base: u64) {
        let mut link = self.remote.write().unwrap_or_else(|p| p.into_inner());
        *link = Some(RemoteLink {
            space: remote,
            saved: Vec::new(),
            tls_base,
        });
    }

    /// FS base of the remote's main vCPU, captured at connect time.
    pub(crate) fn remote_tls_base(&self) -> Option<u64> {
        self.remote
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|link| link.tls_base)
    }

    /// Alias the remote's PDPT entries into this space's tables.
    /// Returns the number of entries written, 0 when already spliced.
    pub(crate) fn splice_remote(&self) -> Result<usize, MachineError> {
        let remote = self.remote().ok_or(MachineError::RemoteNotConfigured)?;
        if self.remote_connected() {
            return Ok(0);
        }
        let entries = remote_pdpt_entries(&remote)?;

        let mut banks = self.banks();
        let pdpt = self.owned_child(&mut banks, self.root(), pml4_index(remote.physbase()), remote.physbase())?;
        let mut saved = Vec::with_capacity(entries.len());
        for &(slot, entry) in &entries {
            let at = pdpt + slot as u64 * 8;
            saved.push((slot, self.load_entry(&banks, at)?));
            self.store_entry(&banks, at, entry)?;
        }
        drop(banks);

        if let Some(link) = self.remote.write().unwrap_or_else(|p| p.into_inner()).as_mut() {
            link.saved = saved;
        }
        self.set_remote_connected(true);
        self.invalidate_tlb();
        debug!("Remote {:#x}: {} PDPT entries spliced", remote.physbase(), entries.len());
        Ok(entries.len())
    }

    /// Restore the PDPT entries overwritten by [`splice_remote`](Self::splice_remote).
    /// Returns the number restored, 0 when nothing was spliced.
    pub(crate) fn unsplice_remote(&self) -> Result<usize, MachineError> {
        if !self.remote_connected() {
            return Ok(0);
        }
        let (physbase, saved) = {
            let mut guard = self.remote.write().unwrap_or_else(|p| p.into_inner());
            match guard.as_mut() {
                Some(link) => (link.space.physbase(), std::mem::take(&mut link.saved)),
                None => return Ok(0),
            }
        };
        // Unmark first so translations stop reaching the remote even if a
        // restore below fails.
        self.set_remote_connected(false);

        let mut banks = self.banks();
        let pdpt = self.owned_child(&mut banks, self.root(), pml4_index(physbase), physbase)?;
        for &(slot, entry) in &saved {
            self.store_entry(&banks, pdpt + slot as u64 * 8, entry)?;
        }
        drop(banks);

        self.invalidate_tlb();
        debug!("Remote {physbase:#x}: {} PDPT entries restored", saved.len());
        Ok(saved.len())
    }
}

/// The remote's PDPT entries covering its base region, by slot.
fn remote_pdpt_entries(remote: &AddressSpace) -> Result<Vec<(usize, u64)>, MachineError> {
    let physbase = remote.physbase();
    let banks = remote.banks();
    let pml4e = remote.load_entry(&banks, remote.root() + pml4_index(physbase) as u64 * 8)?;
    if !is_present(pml4e) {
        return Err(MemoryError::NotMapped { addr: physbase }.into());
    }
    let pdpt = entry_address(pml4e);
    gigabyte_slots(physbase, remote.size())
        .map(|slot| Ok((slot, remote.load_entry(&banks, pdpt + slot as u64 * 8)?)))
        .collect()
}

/// Check that `remote` can be spliced into `local`'s tables.
fn check_remote_range(local: &AddressSpace, remote: &AddressSpace) -> Result<(), MachineError> {
    let slots = gigabyte_slots(remote.physbase(), remote.size());
    let ours = gigabyte_slots(local.physbase(), local.size());
    let same_directory = pml4_index(remote.physbase()) == pml4_index(local.physbase())
        && pml4_index(remote.end() - 1) == pml4_index(remote.physbase());
    let disjoint = slots.end <= ours.start || ours.end <= slots.start;
    if slots.end > PT_ENTRIES || !same_directory || !disjoint {
        return Err(MachineError::RemoteRange {
            physbase: remote.physbase(),
            size: remote.size(),
        });
    }
    Ok(())
}

impl VirtualCpu {
    /// Splice the configured remote without touching FS.
    pub fn remote_connect_now(&mut self) -> Result<u64, MachineError> {
        let n = self.memory().splice_remote()?;
        Ok(n as u64)
    }

    /// Splice the remote and switch FS base to the remote's TLS.  Returns
    /// 1, the value the page-fault stub expects for "remote activated".
    pub fn remote_activate_now(&mut self) -> Result<u64, MachineError> {
        let tls_base = self.memory().remote_tls_base().ok_or(MachineError::RemoteNotConfigured)?;
        self.memory().splice_remote()?;

        let mut sregs = self.special_registers()?;
        if self.saved_fs_base.is_none() {
            self.saved_fs_base = Some(sregs.fs.base);
        }
        sregs.fs.base = tls_base;
        self.set_special_registers(&sregs)?;
        Ok(1)
    }

    /// Undo the splice and restore FS base.  Returns the number of
    /// entries restored; 0 when no remote is spliced.
    pub fn remote_disconnect(&mut self) -> Result<u64, MachineError> {
        if !self.memory().remote_connected() {
            return Ok(0);
        }
        let n = self.memory().unsplice_remote()?;
        if let Some(fs_base) = self.saved_fs_base.take() {
            let mut sregs = self.special_registers()?;
            sregs.fs.base = fs_base;
            self.set_special_registers(&sregs)?;
        }
        Ok(n as u64)
    }
}

impl Machine {
    /// Make `other`'s memory addressable from this machine.
    ///
    /// `other` must be a plain machine (neither forked nor prepared for
    /// copy-on-write), so its tables live in its base region and stay put.
    /// Connecting the same remote again is allowed; a different one is
    /// an error.
    pub fn remote_connect(&mut self, other: &Machine, connect_now: bool) -> Result<(), MachineError> {
        let remote = Arc::clone(other.memory());
        if let Some(current) = self.memory().remote() {
            if !Arc::ptr_eq(&current, &remote) {
                return Err(MachineError::RemoteAlreadyConnected);
            }
        } else {
            if remote.is_forked() || remote.uses_cow() {
                return Err(MachineError::RemoteUnsupported {
                    reason: "remote machine uses copy-on-write memory",
                });
            }
            if self.memory().uses_cow() && !self.memory().is_forked() {
                return Err(MachineError::RemoteUnsupported {
                    reason: "copy-on-write masters cannot host a remote",
                });
            }
            check_remote_range(self.memory(), &remote)?;

            remote.install_alias(self.vm.as_ref(), REMOTE_SLOT)?;
            let tls_base = other.cpu.special_registers()?.fs.base;
            self.memory().attach_remote(Arc::clone(&remote), tls_base);
            info!(
                "Remote memory {:#x}..{:#x} installed in slot {REMOTE_SLOT}",
                remote.physbase(),
                remote.end()
            );
        }

        if connect_now {
            self.cpu.remote_connect_now()?;
        } else {
            let physbase = self.memory().physbase();
            let disconnect = self.runtime().trampoline.remote_disconnect_entry(physbase);
            Trampoline::patch_remote(self.memory(), remote.physbase(), disconnect)?;
        }
        Ok(())
    }

    /// Splice the configured remote now (guest-independent activation).
    pub fn remote_activate_now(&mut self) -> Result<u64, MachineError> {
        self.cpu.remote_activate_now()
    }

    pub fn remote_disconnect(&mut self) -> Result<u64, MachineError> {
        self.cpu.remote_disconnect()
    }

    pub fn has_remote(&self) -> bool {
        self.memory().remote().is_some()
    }

    pub fn is_remote_connected(&self) -> bool {
        self.memory().remote_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{detached, Detached, MappingOptions};
    use crate::verified::paging::GIGA_PAGE_SIZE;

    fn space_at(physbase: u64, size: u64) -> Arc<AddressSpace> {
        let space = AddressSpace::new(physbase, size, MappingOptions::default(), 64, Arc::new(Detached)).unwrap();
        space.setup_identity_map().unwrap();
        Arc::new(space)
    }

    #[test]
    fn splice_makes_remote_memory_reachable() {
        let local = space_at(0, 8 << 20);
        let remote = space_at(GIGA_PAGE_SIZE, 8 << 20);
        let probe = remote.safebase() + 0x10;
        remote.copy_to_guest(probe, b"remote!").unwrap();

        local.attach_remote(Arc::clone(&remote), 0x1234);
        assert_eq!(local.remote_tls_base(), Some(0x1234));
        assert!(local.is_foreign_address(probe));
        assert!(local.translate(probe, 7).is_err());

        assert_eq!(local.splice_remote().unwrap(), 1);
        assert!(local.remote_connected());
        assert_eq!(local.walk(probe).unwrap(), probe);
        let mut buf = [0u8; 7];
        local.copy_from_guest(probe, &mut buf).unwrap();
        assert_eq!(&buf, b"remote!");
        assert_eq!(local.splice_remote().unwrap(), 0);
    }

    #[test]
    fn unsplice_restores_tables_and_is_idempotent() {
        let local = space_at(0, 8 << 20);
        let remote = space_at(GIGA_PAGE_SIZE, 8 << 20);
        let probe = remote.safebase();
        local.attach_remote(Arc::clone(&remote), 0);
        local.splice_remote().unwrap();

        assert_eq!(local.unsplice_remote().unwrap(), 1);
        assert!(!local.remote_connected());
        assert!(local.walk(probe).is_err());
        assert!(local.translate(probe, 8).is_err());
        assert_eq!(local.unsplice_remote().unwrap(), 0);
    }

    #[test]
    fn splice_without_remote_is_rejected() {
        let local = detached(4 << 20);
        assert!(matches!(local.splice_remote(), Err(MachineError::RemoteNotConfigured)));
        assert_eq!(local.unsplice_remote().unwrap(), 0);
    }

    #[test]
    fn overlapping_remote_range_is_rejected() {
        let local = space_at(0, 8 << 20);
        let same_gig = space_at(0, 4 << 20);
        let other_gig = space_at(2 * GIGA_PAGE_SIZE, 4 << 20);
        assert!(matches!(
            check_remote_range(&local, &same_gig),
            Err(MachineError::RemoteRange { .. })
        ));
        assert!(check_remote_range(&local, &other_gig).is_ok());
    }
}

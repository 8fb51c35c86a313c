//! Guest payloads.
//!
//! A [`GuestImage`] writes itself into a fresh address space and reports
//! where execution starts and where the heap begins.  Two loaders:
//!
//! - [`FlatImage`]: raw machine code copied to `physbase + 2 MiB`, the
//!   first byte of huge-page user memory.
//! - [`ElfImage`]: a static ELF loaded by `linux-loader` at its physical
//!   addresses, which must lie at or above `safebase`.
//!
//! The default stack grows down from `physbase + 2 MiB` through the 4 KiB
//! user stack pages of the second MiB.

use std::fs::File;
use std::path::{Path, PathBuf};

use linux_loader::loader::elf::Elf;
use linux_loader::loader::KernelLoader;
use log::info;
use thiserror::Error;
use vm_memory::GuestAddress;

use crate::memory::{align_up, AddressSpace, MemoryError, LOW_REGION_END, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Failed to read guest image: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load ELF image: {0}")]
    Load(#[source] linux_loader::loader::Error),

    #[error("Guest image is empty")]
    Empty,

    #[error("Guest image of {len} bytes does not fit in {capacity} bytes of user memory")]
    TooLarge { len: u64, capacity: u64 },

    #[error("Entry point {entry:#x} is outside the loaded image")]
    BadEntry { entry: u64 },

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Addresses a loader hands to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    /// First instruction.
    pub entry: u64,
    /// Initial stack pointer.
    pub stack: u64,
    /// First byte after the image, page aligned.
    pub heap: u64,
    /// One past the last loaded byte.
    pub kernel_end: u64,
}

impl ImageLayout {
    fn after(memory: &AddressSpace, entry: u64, end: u64) -> Self {
        Self {
            entry,
            stack: default_stack(memory),
            heap: align_up(end, PAGE_SIZE),
            kernel_end: end,
        }
    }
}

/// Top of the default user stack.
pub fn default_stack(memory: &AddressSpace) -> u64 {
    memory.physbase() + LOW_REGION_END
}

/// Something that can be loaded into guest memory.
pub trait GuestImage {
    fn load(&self, memory: &AddressSpace) -> Result<ImageLayout, ImageError>;
}

// ─── flat binaries ───────────────────────────────────────────────────

/// Raw code loaded at `physbase + 2 MiB`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatImage {
    code: Vec<u8>,
    entry_offset: u64,
}

impl FlatImage {
    /// Image entered at its first byte.
    pub fn new(code: impl Into<Vec<u8>>) -> Self {
        Self {
            code: code.into(),
            entry_offset: 0,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        Ok(Self::new(std::fs::read(path)?))
    }

    pub fn with_entry_offset(mut self, offset: u64) -> Self {
        self.entry_offset = offset;
        self
    }

    /// Guest address the image is copied to.
    pub fn load_address(memory: &AddressSpace) -> u64 {
        memory.physbase() + LOW_REGION_END
    }
}

impl GuestImage for FlatImage {
    fn load(&self, memory: &AddressSpace) -> Result<ImageLayout, ImageError> {
        if self.code.is_empty() {
            return Err(ImageError::Empty);
        }
        let base = Self::load_address(memory);
        let len = self.code.len() as u64;
        let capacity = memory.end().saturating_sub(base);
        if len > capacity {
            return Err(ImageError::TooLarge { len, capacity });
        }
        if self.entry_offset >= len {
            return Err(ImageError::BadEntry {
                entry: base + self.entry_offset,
            });
        }
        memory.kernel_copy_to_guest(base, &self.code)?;
        info!("Flat image loaded at {base:#x} ({len} bytes)");
        Ok(ImageLayout::after(memory, base + self.entry_offset, base + len))
    }
}

// ─── ELF ─────────────────────────────────────────────────────────────

/// A static ELF executable on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfImage {
    path: PathBuf,
}

impl ElfImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl GuestImage for ElfImage {
    fn load(&self, memory: &AddressSpace) -> Result<ImageLayout, ImageError> {
        info!("Loading ELF image from {}", self.path.display());
        let mut file = File::open(&self.path)?;

        let result = Elf::load(
            memory.guest_memory(),
            None,
            &mut file,
            Some(GuestAddress(memory.safebase())),
        )
        .map_err(ImageError::Load)?;

        let entry = result.kernel_load.0;
        let end = result.kernel_end;
        if !memory.safely_within(entry, 1) {
            return Err(ImageError::BadEntry { entry });
        }
        info!("ELF entry point: {entry:#x}, end: {end:#x}");
        Ok(ImageLayout::after(memory, entry, end))
    }
}

//! Pure functions for the tinyvm control plane.
//!
//! This module contains pure, deterministic functions extracted from the
//! imperative shell (KVM ioctls, mmap'd guest memory, signal-driven
//! timers).  Each sub-module corresponds to one hardware structure and
//! contains only functions with **no I/O and no external state mutation**.
//!
//! The bit-level encodings of x86_64 descriptors and page-table entries
//! live here, apart from the KVM plumbing, and are unit-tested without
//! `/dev/kvm`.  Nothing in this module depends on `kvm-ioctls` or
//! `vm-memory`.
//!
//! Layout relationships that must always hold are checked at compile time
//! with `const _: () = assert!(..)`, so a broken invariant is a build
//! failure rather than a guest triple fault.

pub mod gdt;
pub mod idt;
pub mod paging;

// Copyright 2024 The x86-paging Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! A library to build and inspect x86 page tables.
//!
//! It supports:
//!   - 32-bit, PAE, 4-level and 5-level paging
//!   - 4 KiB, 2 MiB and 1 GiB pages, where the paging mode allows them
//!   - changing any subset of the attributes of a range, leaving the rest alone
//!
//! Page tables are accessed through the [`PageTableMemory`](paging::PageTableMemory) trait, and
//! new tables are allocated from a caller-supplied [`PageBuffer`](paging::PageBuffer). If the
//! buffer is too small for a request nothing is changed, and the error says how large it needs to
//! be.
//!
//! # Example
//!
//! ```
//! use x86_paging::{
//!     paging::{MapAttribute, MemoryRegion, PagingMode, ParseOptions, PhysicalAddress, RootTable},
//!     target::FlatMemory,
//! };
//!
//! // Build a page table in 8 pages of memory at 16 MiB.
//! let memory = FlatMemory::new(PhysicalAddress(0x100_0000), 8);
//! let mut buffer = memory.buffer();
//! let mut table = RootTable::new(memory, PagingMode::Level4);
//!
//! // Map 4 MiB at 1 GiB to physical memory at 2 MiB as writable, with 2 MiB pages.
//! table
//!     .map_range(
//!         &mut buffer,
//!         &MemoryRegion::new(0x4000_0000, 0x4040_0000),
//!         (MapAttribute::PRESENT | MapAttribute::READ_WRITE)
//!             .with_base_address(PhysicalAddress(0x20_0000)),
//!         MapAttribute::all(),
//!     )
//!     .unwrap();
//!
//! let entries = table.parse(ParseOptions::empty()).unwrap();
//! assert_eq!(entries.len(), 1);
//! assert_eq!(entries[0].length, 0x40_0000);
//! ```

#![no_std]

pub mod descriptor;
pub mod idmap;
pub mod paging;
pub mod pat;
#[cfg(feature = "alloc")]
pub mod target;

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

use descriptor::{LinearAddress, PhysicalAddress};
use paging::{MapAttribute, MemoryRegion};
use thiserror::Error;

/// An error attempting to map or parse a page table.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum MapError {
    /// The packed paging mode value doesn't name a supported mode.
    #[error("Unsupported paging mode {0:#06x}")]
    UnsupportedPagingMode(u32),
    /// The end of the memory region is before the start.
    #[error("End of memory region {0} is before start.")]
    RegionBackwards(MemoryRegion),
    /// The start of the region is not page aligned.
    #[error("Linear address {0} is not page aligned")]
    UnalignedAddress(LinearAddress),
    /// The length of the region is not a whole number of pages.
    #[error("Length {0:#x} is not a multiple of the page size")]
    UnalignedLength(u64),
    /// The page buffer's base address or size is not page aligned.
    #[error("Page buffer at {0} of {1:#x} bytes is not page aligned")]
    UnalignedBuffer(PhysicalAddress, usize),
    /// The page buffer extends beyond the physical addresses a table entry can point to.
    #[error("Page buffer ending at {0} is out of reach of the paging mode")]
    BufferAddressRange(PhysicalAddress),
    /// The linear address is beyond what the paging mode can translate.
    #[error("Linear address {0} out of range")]
    AddressRange(LinearAddress),
    /// The attributes and mask can't be applied to the region.
    #[error("Invalid attributes {0:?}")]
    InvalidAttributes(MapAttribute),
    /// The page buffer doesn't have enough memory for the tables the request needs.
    #[error("Page buffer too small, {required:#x} bytes required")]
    BufferTooSmall { required: usize },
    /// The output slice doesn't have room for every mapped range.
    #[error("Output too small, {required} entries required")]
    MapCountTooSmall { required: usize },
}

impl MapError {
    /// Returns whether the same request can succeed with a larger buffer or output slice.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BufferTooSmall { .. } | Self::MapCountTooSmall { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn retryable() {
        assert!(MapError::BufferTooSmall { required: 0x3000 }.is_retryable());
        assert!(MapError::MapCountTooSmall { required: 2 }.is_retryable());
        assert!(!MapError::AddressRange(LinearAddress(1 << 48)).is_retryable());
        assert!(!MapError::InvalidAttributes(MapAttribute::NX).is_retryable());
    }

    #[test]
    fn display() {
        assert_eq!(
            MapError::BufferTooSmall { required: 0x3000 }.to_string(),
            "Page buffer too small, 0x3000 bytes required"
        );
        assert_eq!(
            MapError::UnalignedAddress(LinearAddress(0x800)).to_string(),
            "Linear address 0x0000000000000800 is not page aligned"
        );
        assert_eq!(
            MapError::RegionBackwards(MemoryRegion::new(0x2000, 0x1000)).to_string(),
            "End of memory region 0x0000000000002000..0x0000000000001000 is before start."
        );
        assert_eq!(
            MapError::UnsupportedPagingMode(0x0401).to_string(),
            "Unsupported paging mode 0x0401"
        );
    }
}

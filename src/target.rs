// Copyright 2024 The x86-paging Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Types for building a page table in ordinary memory, to be loaded at some other physical address.
//!
//! See [`FlatMemory`] for details on how to use it.

use crate::paging::{PAGE_SIZE, PageBuffer, PageTable, PageTableMemory, PhysicalAddress};
use alloc::{vec, vec::Vec};
use core::mem::size_of;

/// An implementation of `PageTableMemory` for a block of pages which will be loaded on the target
/// in a contiguous block of physical memory starting at a given address.
///
/// # Example
///
/// ```
/// use x86_paging::{
///     paging::{MapAttribute, MemoryRegion, PagingMode, PhysicalAddress, RootTable},
///     target::FlatMemory,
/// };
///
/// let memory = FlatMemory::new(PhysicalAddress(0x1_0000), 4);
/// let mut buffer = memory.buffer();
/// let mut map = RootTable::new(memory, PagingMode::Level4);
/// map.map_range(
///     &mut buffer,
///     &MemoryRegion::new(0x0, 0x1000),
///     (MapAttribute::PRESENT | MapAttribute::NX).with_base_address(PhysicalAddress(0x4_2000)),
///     MapAttribute::all(),
/// )
/// .unwrap();
///
/// let bytes = map.memory().to_bytes();
/// // Build the bytes into a binary image for the target device...
/// ```
#[derive(Clone, Debug)]
pub struct FlatMemory {
    base: PhysicalAddress,
    pages: Vec<PageTable>,
}

impl FlatMemory {
    /// Creates `page_count` zeroed pages which will be loaded at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not page aligned.
    pub fn new(base: PhysicalAddress, page_count: usize) -> Self {
        assert_eq!(base.0 % PAGE_SIZE as u64, 0, "{base} is not page aligned");
        Self {
            base,
            pages: vec![PageTable::EMPTY; page_count],
        }
    }

    /// Returns a buffer covering all of the pages, for allocating tables from.
    pub fn buffer(&self) -> PageBuffer {
        PageBuffer::new(self.base, self.pages.len() * PAGE_SIZE)
            .unwrap_or_else(|_| PageBuffer::empty())
    }

    /// Returns the physical address the first page will be loaded at.
    pub fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns the pages.
    pub fn pages(&self) -> &[PageTable] {
        &self.pages
    }

    /// Returns the contents of all of the pages as bytes to be loaded into the target's memory.
    ///
    /// Entries are stored little-endian, as the processor reads them.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0; self.pages.len() * size_of::<PageTable>()];
        let words = self.pages.iter().flat_map(|page| page.words().iter());
        for (chunk, word) in bytes.chunks_exact_mut(size_of::<u64>()).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    fn index(&self, pa: PhysicalAddress) -> usize {
        let offset = pa
            .0
            .checked_sub(self.base.0)
            .unwrap_or_else(|| panic!("{pa} is below the memory at {}", self.base));
        assert_eq!(offset % PAGE_SIZE as u64, 0, "{pa} is not page aligned");
        let index = (offset / PAGE_SIZE as u64) as usize;
        assert!(
            index < self.pages.len(),
            "{pa} is beyond the {} pages at {}",
            self.pages.len(),
            self.base
        );
        index
    }
}

impl PageTableMemory for FlatMemory {
    fn table(&self, pa: PhysicalAddress) -> &PageTable {
        &self.pages[self.index(pa)]
    }

    fn table_mut(&mut self, pa: PhysicalAddress) -> &mut PageTable {
        let index = self.index(pa);
        &mut self.pages[index]
    }
}

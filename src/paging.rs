// Copyright 2024 The x86-paging Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Generic page table types and the map and parse operations over them.

pub mod attributes;
mod map;
pub mod mode;
mod parse;

pub use self::attributes::MapAttribute;
pub use self::map::map_range;
pub use self::mode::{PagingLevels, PagingMode};
#[cfg(feature = "alloc")]
pub use self::parse::parse;
pub use self::parse::parse_into;

use crate::MapError;
use crate::descriptor::Descriptor;
pub use crate::descriptor::{LinearAddress, PhysicalAddress};

#[cfg(feature = "alloc")]
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt::{self, Debug, Display, Formatter};
use core::ops::Range;

pub const PAGE_SHIFT: usize = 12;

/// The size of a page, which is also the size and alignment of every table.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of 64-bit words in a table.
const TABLE_WORDS: usize = PAGE_SIZE / 8;

/// A range of linear addresses to map.
#[derive(Clone, Eq, PartialEq)]
pub struct MemoryRegion(Range<LinearAddress>);

impl MemoryRegion {
    /// Constructs a new `MemoryRegion` for the given range of linear addresses.
    ///
    /// Unlike a byte range, the bounds are not rounded: mapping a region whose bounds are not page
    /// aligned fails.
    pub const fn new(start: u64, end: u64) -> MemoryRegion {
        MemoryRegion(LinearAddress(start)..LinearAddress(end))
    }

    /// Constructs a new `MemoryRegion` of `length` bytes starting at `start`.
    pub const fn with_length(start: u64, length: u64) -> MemoryRegion {
        Self::new(start, start.wrapping_add(length))
    }

    /// Returns the first linear address of the region.
    pub const fn start(&self) -> LinearAddress {
        self.0.start
    }

    /// Returns the first linear address after the region.
    pub const fn end(&self) -> LinearAddress {
        self.0.end
    }

    /// Returns the length of the region in bytes.
    pub const fn len(&self) -> u64 {
        self.0.end.0.saturating_sub(self.0.start.0)
    }

    /// Returns whether the region is empty.
    pub const fn is_empty(&self) -> bool {
        self.0.start.0 >= self.0.end.0
    }
}

impl From<Range<LinearAddress>> for MemoryRegion {
    fn from(range: Range<LinearAddress>) -> Self {
        Self(range)
    }
}

impl Display for MemoryRegion {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        write!(f, "{}..{}", self.0.start, self.0.end)
    }
}

impl Debug for MemoryRegion {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        Display::fmt(self, f)
    }
}

/// One maximal run of linear addresses mapped with uniform attributes, as reported by
/// [`parse_into`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MapEntry {
    pub linear_address: LinearAddress,
    pub length: u64,
    /// Attributes of the first page. The base address is where `linear_address` maps to.
    pub attributes: MapAttribute,
}

impl MapEntry {
    /// Returns the linear address range covered by the entry.
    pub const fn region(&self) -> MemoryRegion {
        MemoryRegion::with_length(self.linear_address.0, self.length)
    }
}

bitflags! {
    /// Options that control how a page table is reported by [`parse_into`].
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    pub struct ParseOptions: usize {
        /// Clear the accessed and dirty bits before comparing and reporting entries, so that runs
        /// differing only in those bits are coalesced.
        const IGNORE_ACCESSED_DIRTY = 1 << 0;
    }
}

/// A single level of a page table: one page of entries.
///
/// In 32-bit paging the page holds 1024 little-endian 32-bit entries, otherwise 512 64-bit ones.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [u64; TABLE_WORDS],
}

impl PageTable {
    /// An empty page table, with every entry not present.
    pub const EMPTY: Self = Self {
        entries: [0; TABLE_WORDS],
    };

    /// Returns the entry at `index`, interpreting the table in the format of `mode`.
    pub fn entry(&self, index: usize, mode: PagingMode) -> Descriptor {
        if mode.has_short_entries() {
            let shift = (index % 2) * 32;
            Descriptor::from_bits((self.entries[index / 2] >> shift) & 0xffff_ffff)
        } else {
            Descriptor::from_bits(self.entries[index])
        }
    }

    /// Replaces the entry at `index`, interpreting the table in the format of `mode`.
    ///
    /// In 32-bit paging only the low 32 bits of `descriptor` are stored.
    pub fn set_entry(&mut self, index: usize, mode: PagingMode, descriptor: Descriptor) {
        if mode.has_short_entries() {
            let shift = (index % 2) * 32;
            let word = &mut self.entries[index / 2];
            *word =
                (*word & !(0xffff_ffff << shift)) | ((descriptor.bits() & 0xffff_ffff) << shift);
        } else {
            self.entries[index] = descriptor.bits();
        }
    }

    /// Sets every entry to not present.
    pub fn zero(&mut self) {
        self.entries = [0; TABLE_WORDS];
    }

    /// Returns the raw 64-bit words of the table.
    pub fn words(&self) -> &[u64; TABLE_WORDS] {
        &self.entries
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Debug for PageTable {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        writeln!(f)?;
        for (i, word) in self.entries.iter().enumerate() {
            if *word != 0 {
                writeln!(f, "  {i:#05x}: {word:#018x}")?;
            }
        }
        Ok(())
    }
}

/// Access to the memory holding page tables.
///
/// An implementation of this trait needs to be provided to the mapping and parsing routines, so
/// that the physical addresses stored in and pointing to the page tables can be turned into tables
/// the code can access.
pub trait PageTableMemory {
    /// Returns the table at the given page-aligned physical address.
    fn table(&self, pa: PhysicalAddress) -> &PageTable;

    /// Returns the table at the given page-aligned physical address for modification.
    fn table_mut(&mut self, pa: PhysicalAddress) -> &mut PageTable;
}

/// A caller-supplied range of free physical memory from which new tables are allocated.
///
/// Pages are handed out from the end of the range backward, so the same buffer may be passed to
/// several calls, each consuming a further part of it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageBuffer {
    base: PhysicalAddress,
    size: usize,
}

impl PageBuffer {
    /// Creates a buffer of `size` bytes starting at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::UnalignedBuffer`] if either `base` or `size` is not a multiple of
    /// [`PAGE_SIZE`].
    pub fn new(base: PhysicalAddress, size: usize) -> Result<Self, MapError> {
        if !is_aligned(base.0, PAGE_SIZE as u64) || !is_aligned(size as u64, PAGE_SIZE as u64) {
            return Err(MapError::UnalignedBuffer(base, size));
        }
        Ok(Self { base, size })
    }

    /// An empty buffer, for updates which are not expected to allocate.
    pub const fn empty() -> Self {
        Self {
            base: PhysicalAddress(0),
            size: 0,
        }
    }

    /// Returns the physical address of the start of the buffer.
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns the first physical address after the part of the buffer not yet allocated.
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress(self.base.0 + self.size as u64)
    }

    /// Returns the number of bytes not yet allocated.
    pub const fn remaining(&self) -> usize {
        self.size
    }

    /// Takes one page from the end of the buffer, or returns `None` if it is used up.
    pub fn allocate(&mut self) -> Option<PhysicalAddress> {
        self.size = self.size.checked_sub(PAGE_SIZE)?;
        Some(self.base + self.size as u64)
    }
}

/// A page table hierarchy: the memory it lives in, its root and the paging mode used to walk it.
#[derive(Debug)]
pub struct RootTable<M: PageTableMemory> {
    memory: M,
    root: Option<PhysicalAddress>,
    mode: PagingMode,
}

impl<M: PageTableMemory> RootTable<M> {
    /// Creates a handle for a page table which does not exist yet. The root table is allocated by
    /// the first call to [`map_range`](Self::map_range).
    pub fn new(memory: M, mode: PagingMode) -> Self {
        Self {
            memory,
            root: None,
            mode,
        }
    }

    /// Creates a handle for an existing page table with the root table at `root`.
    pub fn from_existing(memory: M, root: PhysicalAddress, mode: PagingMode) -> Self {
        Self {
            memory,
            root: Some(root),
            mode,
        }
    }

    /// Returns the physical address of the root table, if it has been allocated.
    pub fn root_address(&self) -> Option<PhysicalAddress> {
        self.root
    }

    /// Returns the paging mode of the table.
    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    /// Returns the memory the table lives in.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Consumes the handle, returning the memory and the root address.
    pub fn into_parts(self) -> (M, Option<PhysicalAddress>) {
        (self.memory, self.root)
    }

    /// Maps `region` with the fields of `attributes` selected by `mask`, allocating any new tables
    /// from `buffer`. See [`map_range`](crate::paging::map_range) for details.
    ///
    /// Returns whether any entry was changed.
    pub fn map_range(
        &mut self,
        buffer: &mut PageBuffer,
        region: &MemoryRegion,
        attributes: MapAttribute,
        mask: MapAttribute,
    ) -> Result<bool, MapError> {
        map_range(
            &mut self.memory,
            &mut self.root,
            self.mode,
            buffer,
            region,
            attributes,
            mask,
        )
    }

    /// Writes the mapped ranges of the table to `out`. See
    /// [`parse_into`](crate::paging::parse_into) for details.
    pub fn parse_into(
        &self,
        options: ParseOptions,
        out: &mut [MapEntry],
    ) -> Result<usize, MapError> {
        match self.root {
            Some(root) => parse_into(&self.memory, root, self.mode, options, out),
            None => Ok(0),
        }
    }

    /// Returns the mapped ranges of the table.
    #[cfg(feature = "alloc")]
    pub fn parse(&self, options: ParseOptions) -> Result<Vec<MapEntry>, MapError> {
        match self.root {
            Some(root) => parse(&self.memory, root, self.mode, options),
            None => Ok(Vec::new()),
        }
    }
}

pub(crate) const fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}

pub(crate) const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_allocates_from_end() {
        let mut buffer = PageBuffer::new(PhysicalAddress(0x10_0000), 3 * PAGE_SIZE).unwrap();
        assert_eq!(buffer.allocate(), Some(PhysicalAddress(0x10_2000)));
        assert_eq!(buffer.allocate(), Some(PhysicalAddress(0x10_1000)));
        assert_eq!(buffer.remaining(), PAGE_SIZE);
        assert_eq!(buffer.allocate(), Some(PhysicalAddress(0x10_0000)));
        assert_eq!(buffer.allocate(), None);
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn buffer_must_be_aligned() {
        assert_eq!(
            PageBuffer::new(PhysicalAddress(0x10_0000), 0x1800),
            Err(MapError::UnalignedBuffer(PhysicalAddress(0x10_0000), 0x1800))
        );
        assert_eq!(
            PageBuffer::new(PhysicalAddress(0x10_0800), 0x1000),
            Err(MapError::UnalignedBuffer(PhysicalAddress(0x10_0800), 0x1000))
        );
    }

    #[test]
    fn short_entries_share_words() {
        let mut table = PageTable::EMPTY;
        table.set_entry(3, PagingMode::Bits32, Descriptor::from_bits(0xdead_b003));
        table.set_entry(2, PagingMode::Bits32, Descriptor::from_bits(0x1000_2001));
        assert_eq!(table.words()[1], 0xdead_b003_1000_2001);
        assert_eq!(table.entry(3, PagingMode::Bits32).bits(), 0xdead_b003);
        assert_eq!(table.entry(1, PagingMode::Level4).bits(), 0xdead_b003_1000_2001);
    }

    #[test]
    fn region_length() {
        let region = MemoryRegion::with_length(0x1000, 0x2000);
        assert_eq!(region.start(), LinearAddress(0x1000));
        assert_eq!(region.end(), LinearAddress(0x3000));
        assert_eq!(region.len(), 0x2000);
        assert!(!region.is_empty());
        assert!(MemoryRegion::new(0x2000, 0x1000).is_empty());
    }
}

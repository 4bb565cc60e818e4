// Copyright 2024 The x86-paging Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Functionality for managing page tables in identity-mapped memory.
//!
//! See [`IdMap`] for details on how to use it.

use crate::MapError;
use crate::paging::{
    MapAttribute, MapEntry, MemoryRegion, PageBuffer, PageTable, PageTableMemory, PagingMode,
    ParseOptions, PhysicalAddress, RootTable,
};

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

/// Access to page tables in memory where every physical address is mapped at the identical linear
/// address, as in firmware before it enables its own page tables.
#[derive(Debug)]
pub struct IdentityMemory {
    _private: (),
}

impl IdentityMemory {
    /// Creates a new `IdentityMemory`.
    ///
    /// # Safety
    ///
    /// The page tables to be accessed, and every page of any [`PageBuffer`] used with them, must be
    /// readable and writable at the linear address equal to their physical address for as long as
    /// the returned value is used. Nothing else may access that memory in the meantime.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl PageTableMemory for IdentityMemory {
    fn table(&self, pa: PhysicalAddress) -> &PageTable {
        // SAFETY: The caller of `IdentityMemory::new` promised that the table is mapped at the
        // same address and nothing else is accessing it.
        unsafe { &*(pa.0 as usize as *const PageTable) }
    }

    fn table_mut(&mut self, pa: PhysicalAddress) -> &mut PageTable {
        // SAFETY: As above, and `self` is borrowed mutably for the lifetime of the reference.
        unsafe { &mut *(pa.0 as usize as *mut PageTable) }
    }
}

/// Manages a page table whose tables are identity mapped, and which maps regions to the identical
/// physical addresses.
///
/// # Example
///
/// ```no_run
/// use x86_paging::{
///     idmap::IdMap,
///     paging::{MapAttribute, MemoryRegion, PageBuffer, PagingMode, PhysicalAddress},
/// };
///
/// // Free memory set aside for page tables.
/// let mut buffer = PageBuffer::new(PhysicalAddress(0x7f0_0000), 0x10_0000).unwrap();
/// // SAFETY: The buffer is identity mapped and not otherwise in use.
/// let mut idmap = unsafe { IdMap::new(PagingMode::Level4) };
/// // Map 2 MiB as read-only and non-executable.
/// idmap
///     .map_range(
///         &mut buffer,
///         &MemoryRegion::new(0x8020_0000, 0x8040_0000),
///         MapAttribute::PRESENT | MapAttribute::NX,
///     )
///     .unwrap();
/// // The root table address is what CR3 needs to be loaded with.
/// let cr3 = idmap.root_address().unwrap();
/// ```
#[derive(Debug)]
pub struct IdMap {
    table: RootTable<IdentityMemory>,
}

impl IdMap {
    /// Creates a new identity-mapped page table, with the root allocated by the first mapping.
    ///
    /// # Safety
    ///
    /// As for [`IdentityMemory::new`].
    pub unsafe fn new(mode: PagingMode) -> Self {
        Self {
            // SAFETY: Our caller promises the same conditions.
            table: RootTable::new(unsafe { IdentityMemory::new() }, mode),
        }
    }

    /// Takes over an existing page table with its root table at `root`.
    ///
    /// # Safety
    ///
    /// As for [`IdentityMemory::new`], for every table reachable from `root`.
    pub unsafe fn from_existing(root: PhysicalAddress, mode: PagingMode) -> Self {
        Self {
            // SAFETY: Our caller promises the same conditions.
            table: RootTable::from_existing(unsafe { IdentityMemory::new() }, root, mode),
        }
    }

    /// Returns the physical address of the root table, if there is one yet.
    pub fn root_address(&self) -> Option<PhysicalAddress> {
        self.table.root_address()
    }

    /// Maps the given range of linear addresses to the identical physical addresses with the given
    /// attributes, replacing every field of any existing mapping.
    ///
    /// The base address in `attributes` is ignored.
    ///
    /// # Errors
    ///
    /// As for [`map_range`](crate::paging::map_range).
    pub fn map_range(
        &mut self,
        buffer: &mut PageBuffer,
        range: &MemoryRegion,
        attributes: MapAttribute,
    ) -> Result<bool, MapError> {
        let attributes = attributes.with_base_address(PhysicalAddress(range.start().0));
        self.table.map_range(buffer, range, attributes, MapAttribute::all())
    }

    /// Changes only the fields of the mappings of the given range selected by `mask`. The base
    /// address must not be selected.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::InvalidAttributes`] if `mask` includes the base address, or as for
    /// [`map_range`](crate::paging::map_range).
    pub fn modify_range(
        &mut self,
        buffer: &mut PageBuffer,
        range: &MemoryRegion,
        attributes: MapAttribute,
        mask: MapAttribute,
    ) -> Result<bool, MapError> {
        if mask.intersects(MapAttribute::PAGE_TABLE_BASE_ADDRESS) {
            return Err(MapError::InvalidAttributes(attributes));
        }
        self.table.map_range(buffer, range, attributes, mask)
    }

    /// Unmaps the given range.
    pub fn unmap_range(&mut self, range: &MemoryRegion) -> Result<bool, MapError> {
        self.table.map_range(
            &mut PageBuffer::empty(),
            range,
            MapAttribute::empty(),
            MapAttribute::PRESENT,
        )
    }

    /// Writes the mapped ranges to `out`. See [`parse_into`](crate::paging::parse_into).
    pub fn parse_into(
        &self,
        options: ParseOptions,
        out: &mut [MapEntry],
    ) -> Result<usize, MapError> {
        self.table.parse_into(options, out)
    }

    /// Returns the mapped ranges.
    #[cfg(feature = "alloc")]
    pub fn parse(&self, options: ParseOptions) -> Result<Vec<MapEntry>, MapError> {
        self.table.parse(options)
    }
}

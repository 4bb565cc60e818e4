// Copyright 2024 The x86-paging Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

use super::{
    MapAttribute, MemoryRegion, PAGE_SIZE, PageBuffer, PageTableMemory, PagingMode, align_down,
    is_aligned,
};
use crate::MapError;
use crate::descriptor::{Descriptor, LinearAddress, PhysicalAddress};

use log::{debug, trace};

/// Maps `region` to the physical range starting at `attributes.base_address()`, applying only the
/// fields of `attributes` selected by `mask`.
///
/// If `root` is `None` a new root table is allocated and stored in it. Every table allocated is
/// taken from the end of `buffer`. Fields outside `mask` keep the value already stored in the
/// affected entries, and new entries start out with all fields clear. A mask containing
/// [`MapAttribute::PRESENT`] with an attribute that does not unmaps the region.
///
/// A leaf that is only partly covered by `region` is split into a table of smaller leaves that
/// reproduce the old mapping. A table entry which is fully covered by `region` is replaced by a
/// single leaf if the paging mode allows a leaf at that level, the physical address is suitably
/// aligned, and `mask` includes the base address; the tables below it are abandoned.
///
/// The request is first walked without changing anything to find out how much memory it needs,
/// so on error neither the page table nor `buffer` has been modified.
///
/// Returns whether any entry was changed.
///
/// # Errors
///
/// Returns [`MapError::RegionBackwards`] if the range is backwards.
///
/// Returns [`MapError::UnalignedAddress`] or [`MapError::UnalignedLength`] if the start or the
/// length of `region` is not a multiple of [`PAGE_SIZE`].
///
/// Returns [`MapError::AddressRange`] if the end of `region` is beyond the largest linear address
/// the paging mode can translate.
///
/// Returns [`MapError::InvalidAttributes`] if `attributes` and `mask` can't be applied to the
/// region: unmapping with further fields in the mask, fields the paging mode can't encode, a
/// physical range beyond what the paging mode can address, or changing fields of a range which is
/// not mapped without making it present with at least the fields of
/// [`MapAttribute::REQUIRED_FOR_NEW_MAPPING`].
///
/// Returns [`MapError::BufferTooSmall`] with the number of bytes the request needs if `buffer` has
/// less than that remaining. Calling again with a buffer that large has the same effect as if the
/// first call had succeeded.
///
/// Returns [`MapError::BufferAddressRange`] if new tables are needed but `buffer` extends beyond
/// the physical addresses a table entry of the paging mode can point to.
pub fn map_range<M: PageTableMemory + ?Sized>(
    memory: &mut M,
    root: &mut Option<PhysicalAddress>,
    mode: PagingMode,
    buffer: &mut PageBuffer,
    region: &MemoryRegion,
    attributes: MapAttribute,
    mask: MapAttribute,
) -> Result<bool, MapError> {
    if region.end() < region.start() {
        return Err(MapError::RegionBackwards(region.clone()));
    }
    if !is_aligned(region.start().0, PAGE_SIZE as u64) {
        return Err(MapError::UnalignedAddress(region.start()));
    }
    if !is_aligned(region.len(), PAGE_SIZE as u64) {
        return Err(MapError::UnalignedLength(region.len()));
    }
    if region.is_empty() || mask.is_empty() {
        return Ok(false);
    }
    if region.end().0 > mode.max_linear_address() {
        return Err(MapError::AddressRange(region.end()));
    }
    check_attributes(mode, region, attributes, mask)?;

    let mut walker = Walker {
        memory,
        buffer,
        mode,
        start: region.start(),
        attributes,
        mask,
        commit: false,
        required: 0,
        modified: false,
    };
    if root.is_none() && walker.is_unmap() {
        return Ok(false);
    }

    walker.walk(root, region)?;
    if walker.required > walker.buffer.remaining() {
        debug!(
            "Mapping {} needs {:#x} bytes of page tables, only {:#x} available",
            region,
            walker.required,
            walker.buffer.remaining()
        );
        return Err(MapError::BufferTooSmall {
            required: walker.required,
        });
    }
    if walker.required > 0 && walker.buffer.end().0 > mode.max_physical_address() {
        return Err(MapError::BufferAddressRange(walker.buffer.end()));
    }

    walker.commit = true;
    walker.required = 0;
    walker.walk(root, region)?;
    debug!(
        "Mapped {} to {} with mask {:#x} ({:?}), {:#x} bytes of page tables allocated",
        region,
        attributes.base_address(),
        mask.bits(),
        mode,
        walker.required
    );
    Ok(walker.modified)
}

/// Checks the parts of a request that don't depend on the current contents of the page table.
fn check_attributes(
    mode: PagingMode,
    region: &MemoryRegion,
    attributes: MapAttribute,
    mask: MapAttribute,
) -> Result<(), MapError> {
    let invalid = Err(MapError::InvalidAttributes(attributes));
    if mask.contains(MapAttribute::PRESENT)
        && !attributes.contains(MapAttribute::PRESENT)
        && mask != MapAttribute::PRESENT
    {
        return invalid;
    }
    if attributes.intersects(mask & mode.unsupported_attributes()) {
        return invalid;
    }
    if mask.intersects(MapAttribute::PAGE_TABLE_BASE_ADDRESS) {
        if !mask.contains(MapAttribute::PAGE_TABLE_BASE_ADDRESS) {
            return invalid;
        }
        match attributes.base_address().0.checked_add(region.len()) {
            Some(end) if end <= mode.max_physical_address() => {}
            _ => return invalid,
        }
    }
    Ok(())
}

/// A table visited by the walk.
///
/// While working out how much memory a request needs, tables which would be allocated don't exist
/// yet; their contents are implied by how they would be created.
#[derive(Copy, Clone, Debug)]
enum Table {
    /// A table already in memory.
    Existing(PhysicalAddress),
    /// A new table with no entries present.
    Empty,
    /// A new table splitting the leaf with the given attributes into smaller leaves.
    Split(MapAttribute),
}

struct Walker<'a, M: PageTableMemory + ?Sized> {
    memory: &'a mut M,
    buffer: &'a mut PageBuffer,
    mode: PagingMode,
    start: LinearAddress,
    attributes: MapAttribute,
    mask: MapAttribute,
    /// Whether to write to the page table, or only count the memory needed.
    commit: bool,
    required: usize,
    modified: bool,
}

impl<M: PageTableMemory + ?Sized> Walker<'_, M> {
    fn is_unmap(&self) -> bool {
        self.mask.contains(MapAttribute::PRESENT)
            && !self.attributes.contains(MapAttribute::PRESENT)
    }

    /// Returns the requested attributes for the page at `la`.
    fn target(&self, la: u64) -> MapAttribute {
        self.attributes
            .with_base_address(self.attributes.base_address() + (la - self.start.0))
    }

    fn walk(
        &mut self,
        root: &mut Option<PhysicalAddress>,
        region: &MemoryRegion,
    ) -> Result<(), MapError> {
        let table = match *root {
            Some(pa) => Table::Existing(pa),
            None => {
                self.required += PAGE_SIZE;
                if self.commit {
                    let pa = self.allocate()?;
                    trace!("Allocated root table at {}", pa);
                    *root = Some(pa);
                    self.modified = true;
                    Table::Existing(pa)
                } else {
                    Table::Empty
                }
            }
        };
        self.map_level(
            table,
            self.mode.levels().levels,
            region.start().0,
            region.end().0,
            MapAttribute::empty(),
        )
    }

    /// Applies the request to `[start, end)` within `table`. Entries which are not wholly covered
    /// are first restricted by `pushed`, the permissions taken away from the entry above.
    fn map_level(
        &mut self,
        table: Table,
        level: usize,
        start: u64,
        end: u64,
        pushed: MapAttribute,
    ) -> Result<(), MapError> {
        let entry_size = self.mode.entry_size(level);
        let mut chunk_start = start;
        while chunk_start < end {
            let entry_start = align_down(chunk_start, entry_size);
            let chunk_end = end.min(entry_start + entry_size);
            self.map_entry(table, level, entry_start, chunk_start, chunk_end, pushed)?;
            chunk_start = chunk_end;
        }
        Ok(())
    }

    /// Applies the request to `[start, end)`, which lies within the entry covering `entry_start`
    /// onwards.
    fn map_entry(
        &mut self,
        table: Table,
        level: usize,
        entry_start: u64,
        start: u64,
        end: u64,
        pushed: MapAttribute,
    ) -> Result<(), MapError> {
        let index = self.mode.index(level, start);
        let mut entry = self.entry(table, level, index);
        let entry_size = self.mode.entry_size(level);
        let covers_entry = start == entry_start && end - start == entry_size;
        if entry.is_present() && !covers_entry {
            // Already written by `push_down` when committing.
            entry = entry.restricted(pushed);
        }
        let is_leaf = entry.is_leaf(level, self.mode);

        if !entry.is_present() {
            if self.is_unmap() {
                return Ok(());
            }
            self.check_new_mapping()?;
        } else if is_leaf {
            let old = entry.leaf_attributes(level);
            let old = old.with_base_address(old.base_address() + (start - entry_start));
            if old.merge(self.target(start), self.mask) == old {
                return Ok(());
            }
        }

        if self.is_unmap() {
            if covers_entry {
                trace!("Unmapping level {} entry at {:#x}", level, entry_start);
                self.write(table, index, Descriptor::EMPTY);
                return Ok(());
            }
        } else if level <= self.mode.levels().max_leaf_level
            && covers_entry
            && (!entry.is_present()
                || is_leaf
                || self.mask.contains(MapAttribute::PAGE_TABLE_BASE_ADDRESS))
        {
            let current = if !entry.is_present() {
                MapAttribute::empty()
            } else if is_leaf {
                entry.leaf_attributes(level)
            } else {
                entry.table_permissions(level, self.mode)
            };
            let leaf = current.merge(self.target(start), self.mask);
            if is_aligned(leaf.base_address().0, entry_size) {
                if entry.is_present() && !is_leaf {
                    trace!(
                        "Dropping level {} table at {} for a leaf at {:#x}",
                        level - 1,
                        entry.table_address(),
                        entry_start
                    );
                }
                self.write(table, index, Descriptor::leaf(level, leaf));
                return Ok(());
            }
        }

        debug_assert!(level > 1, "4 KiB entries never need a lower level");
        let mut lifted = MapAttribute::empty();
        let child = if !entry.is_present() {
            self.allocate_table(table, level, index, None)?
        } else if is_leaf {
            trace!(
                "Splitting level {} leaf at {:#x} for {:#x}..{:#x}",
                level,
                entry_start,
                start,
                end
            );
            self.allocate_table(table, level, index, Some(entry.leaf_attributes(level)))?
        } else {
            lifted = self.lifted(entry.table_permissions(level, self.mode));
            if !lifted.is_empty() {
                self.push_down(entry, level, entry_start, start, end, lifted);
                self.write(table, index, entry.loosened(lifted));
            }
            Table::Existing(entry.table_address())
        };
        self.map_level(child, level - 1, start, end, lifted)
    }

    /// Returns the permissions the request grants which a table entry with `permissions` denies to
    /// everything below it.
    fn lifted(&self, permissions: MapAttribute) -> MapAttribute {
        if self.is_unmap() {
            return MapAttribute::empty();
        }
        let granted = self.attributes
            & self.mask
            & (MapAttribute::READ_WRITE | MapAttribute::USER_SUPERVISOR);
        let mut lifted = granted - permissions;
        if self.mask.contains(MapAttribute::NX)
            && !self.attributes.contains(MapAttribute::NX)
            && permissions.contains(MapAttribute::NX)
        {
            lifted |= MapAttribute::NX;
        }
        lifted
    }

    /// Moves the restriction `lifted` from the table entry `entry` at `level` onto the entries of
    /// the table below it which `[start, end)` doesn't wholly cover, before the entry itself is
    /// loosened.
    fn push_down(
        &mut self,
        entry: Descriptor,
        level: usize,
        entry_start: u64,
        start: u64,
        end: u64,
        lifted: MapAttribute,
    ) {
        trace!(
            "Moving {:?} from level {} entry at {:#x} to the table below",
            lifted,
            level,
            entry_start
        );
        if !self.commit {
            return;
        }
        let mode = self.mode;
        let child_size = mode.entry_size(level - 1);
        let child_table = self.memory.table_mut(entry.table_address());
        for i in 0..mode.entries_at(level - 1) {
            let child_start = entry_start + i as u64 * child_size;
            let covered = start <= child_start && child_start + child_size <= end;
            let child = child_table.entry(i, mode);
            if child.is_present() && !covered {
                child_table.set_entry(i, mode, child.restricted(lifted));
            }
        }
    }

    fn check_new_mapping(&self) -> Result<(), MapError> {
        if self.attributes.contains(MapAttribute::PRESENT)
            && self.mask.contains(MapAttribute::REQUIRED_FOR_NEW_MAPPING)
        {
            Ok(())
        } else {
            Err(MapError::InvalidAttributes(self.attributes))
        }
    }

    fn entry(&self, table: Table, level: usize, index: usize) -> Descriptor {
        match table {
            Table::Existing(pa) => self.memory.table(pa).entry(index, self.mode),
            Table::Empty => Descriptor::EMPTY,
            Table::Split(leaf) => {
                Descriptor::leaf(level, split_leaf(leaf, self.mode.entry_size(level), index))
            }
        }
    }

    fn write(&mut self, table: Table, index: usize, descriptor: Descriptor) {
        if !self.commit {
            return;
        }
        let mode = self.mode;
        if let Table::Existing(pa) = table {
            let table = self.memory.table_mut(pa);
            if table.entry(index, mode) != descriptor {
                table.set_entry(index, mode, descriptor);
                self.modified = true;
            }
        }
    }

    fn allocate(&mut self) -> Result<PhysicalAddress, MapError> {
        let pa = self.buffer.allocate().ok_or(MapError::BufferTooSmall {
            required: self.required,
        })?;
        self.memory.table_mut(pa).zero();
        Ok(pa)
    }

    /// Allocates the table below the entry at `index`, filled with smaller leaves reproducing
    /// `split` if it is given, and points the entry at it.
    fn allocate_table(
        &mut self,
        table: Table,
        level: usize,
        index: usize,
        split: Option<MapAttribute>,
    ) -> Result<Table, MapError> {
        self.required += PAGE_SIZE;
        if !self.commit {
            return Ok(split.map_or(Table::Empty, Table::Split));
        }

        let mode = self.mode;
        let pa = self.allocate()?;
        if let Some(leaf) = split {
            let child_size = mode.entry_size(level - 1);
            let new_table = self.memory.table_mut(pa);
            for i in 0..mode.entries_per_table() {
                new_table.set_entry(
                    i,
                    mode,
                    Descriptor::leaf(level - 1, split_leaf(leaf, child_size, i)),
                );
            }
        }
        trace!("Allocated level {} table at {}", level - 1, pa);
        self.write(table, index, Descriptor::table(pa, level, mode));
        Ok(Table::Existing(pa))
    }
}

/// Returns the attributes of the `index`th piece of size `size` of the leaf `leaf`.
fn split_leaf(leaf: MapAttribute, size: u64, index: usize) -> MapAttribute {
    leaf.with_base_address(leaf.base_address() + size * index as u64)
}

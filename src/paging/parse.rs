// Copyright 2024 The x86-paging Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

use super::{MapAttribute, MapEntry, PageTableMemory, PagingMode, ParseOptions};
use crate::MapError;
use crate::descriptor::{LinearAddress, PhysicalAddress};

#[cfg(feature = "alloc")]
use alloc::{vec, vec::Vec};
use log::debug;

/// Permissions in effect above the root table.
const ROOT_PERMISSIONS: MapAttribute = MapAttribute::PRESENT
    .union(MapAttribute::READ_WRITE)
    .union(MapAttribute::USER_SUPERVISOR);

/// Writes the ranges mapped by the page table with the root table at `root` to `out`, in
/// ascending order of linear address, and returns how many there are.
///
/// Each entry is a maximal run of linear addresses mapped to contiguous physical addresses with
/// identical attributes. The attributes reported are the effective ones: read/write and
/// user/supervisor access must be allowed by every level of the walk, and execution is disabled
/// if any level disables it.
///
/// # Errors
///
/// Returns [`MapError::MapCountTooSmall`] with the number of entries needed if `out` is too short
/// for all of them. `out` is still filled with the first entries in that case.
pub fn parse_into<M: PageTableMemory + ?Sized>(
    memory: &M,
    root: PhysicalAddress,
    mode: PagingMode,
    options: ParseOptions,
    out: &mut [MapEntry],
) -> Result<usize, MapError> {
    let mut collector = Collector {
        out,
        count: 0,
        last: None,
        options,
    };
    parse_level(
        memory,
        mode,
        root,
        mode.levels().levels,
        0,
        ROOT_PERMISSIONS,
        &mut collector,
    );

    let count = collector.count;
    if count > collector.out.len() {
        debug!(
            "Page table at {} has {} mapped ranges, room for {}",
            root,
            count,
            collector.out.len()
        );
        return Err(MapError::MapCountTooSmall { required: count });
    }
    Ok(count)
}

/// Returns the ranges mapped by the page table with the root table at `root`.
///
/// See [`parse_into`] for the form of the entries.
#[cfg(feature = "alloc")]
pub fn parse<M: PageTableMemory + ?Sized>(
    memory: &M,
    root: PhysicalAddress,
    mode: PagingMode,
    options: ParseOptions,
) -> Result<Vec<MapEntry>, MapError> {
    let count = match parse_into(memory, root, mode, options, &mut []) {
        Ok(count) => count,
        Err(MapError::MapCountTooSmall { required }) => required,
        Err(e) => return Err(e),
    };
    let mut entries = vec![MapEntry::default(); count];
    let count = parse_into(memory, root, mode, options, &mut entries)?;
    entries.truncate(count);
    Ok(entries)
}

fn parse_level<M: PageTableMemory + ?Sized>(
    memory: &M,
    mode: PagingMode,
    table: PhysicalAddress,
    level: usize,
    table_start: u64,
    permissions: MapAttribute,
    collector: &mut Collector,
) {
    let entry_size = mode.entry_size(level);
    let table = memory.table(table);
    for index in 0..mode.entries_at(level) {
        let entry = table.entry(index, mode);
        if !entry.is_present() {
            continue;
        }
        let start = table_start + index as u64 * entry_size;
        if entry.is_leaf(level, mode) {
            collector.push(MapEntry {
                linear_address: LinearAddress(start),
                length: entry_size,
                attributes: effective(entry.leaf_attributes(level), permissions),
            });
        } else {
            parse_level(
                memory,
                mode,
                entry.table_address(),
                level - 1,
                start,
                effective(entry.table_permissions(level, mode), permissions),
                collector,
            );
        }
    }
}

/// Restricts `attributes` by the permissions of the levels above.
fn effective(attributes: MapAttribute, permissions: MapAttribute) -> MapAttribute {
    let restricting = MapAttribute::READ_WRITE | MapAttribute::USER_SUPERVISOR;
    let mut attributes = (attributes & MapAttribute::all()) - (restricting - permissions);
    if permissions.contains(MapAttribute::NX) {
        attributes |= MapAttribute::NX;
    }
    attributes
}

/// Coalesces leaves into entries, counting those that don't fit.
struct Collector<'a> {
    out: &'a mut [MapEntry],
    count: usize,
    last: Option<MapEntry>,
    options: ParseOptions,
}

impl Collector<'_> {
    fn push(&mut self, mut entry: MapEntry) {
        if self.options.contains(ParseOptions::IGNORE_ACCESSED_DIRTY) {
            entry.attributes -= MapAttribute::TRANSIENT;
        }
        if let Some(last) = &mut self.last {
            if continues(last, &entry) {
                last.length += entry.length;
                if let Some(slot) = self.out.get_mut(self.count - 1) {
                    *slot = *last;
                }
                return;
            }
        }
        if let Some(slot) = self.out.get_mut(self.count) {
            *slot = entry;
        }
        self.last = Some(entry);
        self.count += 1;
    }
}

/// Returns whether `next` carries on the mapping of `last` without a change of attributes.
fn continues(last: &MapEntry, next: &MapEntry) -> bool {
    last.linear_address + last.length == next.linear_address
        && last.attributes.base_address() + last.length == next.attributes.base_address()
        && last.attributes - MapAttribute::PAGE_TABLE_BASE_ADDRESS
            == next.attributes - MapAttribute::PAGE_TABLE_BASE_ADDRESS
}

#[cfg(all(test, feature = "alloc"))]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use crate::paging::{MemoryRegion, PageBuffer, RootTable};
    use crate::target::FlatMemory;

    const MEMORY_BASE: PhysicalAddress = PhysicalAddress(0x9000_0000);

    fn read_write(base: u64) -> MapAttribute {
        (MapAttribute::PRESENT | MapAttribute::READ_WRITE).with_base_address(PhysicalAddress(base))
    }

    fn entry(linear_address: u64, length: u64, attributes: MapAttribute) -> MapEntry {
        MapEntry {
            linear_address: LinearAddress(linear_address),
            length,
            attributes,
        }
    }

    fn new_table(mode: PagingMode) -> (RootTable<FlatMemory>, PageBuffer) {
        let memory = FlatMemory::new(MEMORY_BASE, 32);
        let buffer = memory.buffer();
        (RootTable::new(memory, mode), buffer)
    }

    fn map(
        table: &mut RootTable<FlatMemory>,
        buffer: &mut PageBuffer,
        start: u64,
        length: u64,
        attributes: MapAttribute,
    ) {
        table
            .map_range(
                buffer,
                &MemoryRegion::with_length(start, length),
                attributes,
                MapAttribute::all(),
            )
            .unwrap();
    }

    #[test]
    fn parse_without_root() {
        let (table, _) = new_table(PagingMode::Level4);
        assert_eq!(table.parse(ParseOptions::empty()), Ok(vec![]));
        assert_eq!(table.parse_into(ParseOptions::empty(), &mut []), Ok(0));
    }

    #[test]
    fn ascending_order() {
        let (mut table, mut buffer) = new_table(PagingMode::Level4);
        map(&mut table, &mut buffer, 0x80_0000_0000, 0x1000, read_write(0x1000));
        map(&mut table, &mut buffer, 0x4000, 0x1000, read_write(0x2000));
        assert_eq!(
            table.parse(ParseOptions::empty()),
            Ok(vec![
                entry(0x4000, 0x1000, read_write(0x2000)),
                entry(0x80_0000_0000, 0x1000, read_write(0x1000)),
            ])
        );
    }

    #[test]
    fn coalesce_across_tables() {
        let (mut table, mut buffer) = new_table(PagingMode::Level4);
        map(&mut table, &mut buffer, 0x1f_f000, 0x2000, read_write(0x5000));
        assert_eq!(
            table.parse(ParseOptions::empty()),
            Ok(vec![entry(0x1f_f000, 0x2000, read_write(0x5000))])
        );
    }

    #[test]
    fn coalesce_only_contiguous_physical_addresses() {
        let (mut table, mut buffer) = new_table(PagingMode::Level4);
        map(&mut table, &mut buffer, 0, 0x1000, read_write(0x5000));
        map(&mut table, &mut buffer, 0x1000, 0x1000, read_write(0x9000));
        map(&mut table, &mut buffer, 0x2000, 0x1000, read_write(0xa000) | MapAttribute::NX);
        assert_eq!(
            table.parse(ParseOptions::empty()),
            Ok(vec![
                entry(0, 0x1000, read_write(0x5000)),
                entry(0x1000, 0x1000, read_write(0x9000)),
                entry(0x2000, 0x1000, read_write(0xa000) | MapAttribute::NX),
            ])
        );
    }

    #[test]
    fn map_count_too_small() {
        let (mut table, mut buffer) = new_table(PagingMode::Level4);
        map(&mut table, &mut buffer, 0, 0x1000, read_write(0x5000));
        map(&mut table, &mut buffer, 0x3000, 0x1000, read_write(0x8000));
        map(&mut table, &mut buffer, 0x4000_0000, 0x20_0000, read_write(0));

        let mut out = [MapEntry::default(); 1];
        assert_eq!(
            table.parse_into(ParseOptions::empty(), &mut out),
            Err(MapError::MapCountTooSmall { required: 3 })
        );
        assert_eq!(out[0], entry(0, 0x1000, read_write(0x5000)));

        let mut out = [MapEntry::default(); 4];
        assert_eq!(table.parse_into(ParseOptions::empty(), &mut out), Ok(3));
        assert_eq!(out[2], entry(0x4000_0000, 0x20_0000, read_write(0)));
        assert_eq!(out[3], MapEntry::default());
    }

    #[test]
    fn accessed_and_dirty() {
        let (mut table, mut buffer) = new_table(PagingMode::Level4);
        map(
            &mut table,
            &mut buffer,
            0,
            0x1000,
            read_write(0x5000) | MapAttribute::ACCESSED | MapAttribute::DIRTY,
        );
        map(&mut table, &mut buffer, 0x1000, 0x1000, read_write(0x6000));

        assert_eq!(
            table.parse(ParseOptions::empty()),
            Ok(vec![
                entry(
                    0,
                    0x1000,
                    read_write(0x5000) | MapAttribute::ACCESSED | MapAttribute::DIRTY
                ),
                entry(0x1000, 0x1000, read_write(0x6000)),
            ])
        );
        assert_eq!(
            table.parse(ParseOptions::IGNORE_ACCESSED_DIRTY),
            Ok(vec![entry(0, 0x2000, read_write(0x5000))])
        );
    }

    #[test]
    fn large_page_pat() {
        let (mut table, mut buffer) = new_table(PagingMode::Level4);
        let attributes = read_write(0x60_0000) | MapAttribute::PAT | MapAttribute::CACHE_DISABLED;
        map(&mut table, &mut buffer, 0x20_0000, 0x20_0000, attributes);
        assert_eq!(
            table.parse(ParseOptions::empty()),
            Ok(vec![entry(0x20_0000, 0x20_0000, attributes)])
        );
    }

    #[test]
    fn inherit_parent_permissions() {
        let (mut table, mut buffer) = new_table(PagingMode::Level4);
        let attributes = read_write(0x5000) | MapAttribute::USER_SUPERVISOR;
        map(&mut table, &mut buffer, 0, 0x2000, attributes);
        map(&mut table, &mut buffer, 0x40_0000, 0x1000, attributes);

        let (mut memory, root) = table.into_parts();
        let root = root.unwrap();
        let mode = PagingMode::Level4;
        let pdpt = memory.table(root).entry(0, mode).table_address();
        let pd = memory.table(pdpt).entry(0, mode).table_address();

        // Make the first 2 MiB read-only at the PD level.
        let pde = memory.table(pd).entry(0, mode);
        memory.table_mut(pd).set_entry(
            0,
            mode,
            Descriptor::from_bits(pde.bits() & !MapAttribute::READ_WRITE.bits()),
        );
        let table = RootTable::from_existing(memory, root, mode);
        assert_eq!(
            table.parse(ParseOptions::empty()),
            Ok(vec![
                entry(0, 0x2000, attributes - MapAttribute::READ_WRITE),
                entry(
                    0x40_0000,
                    0x1000,
                    attributes.with_base_address(PhysicalAddress(0x5000))
                ),
            ])
        );

        // Disable execution for everything at the root.
        let (mut memory, _) = table.into_parts();
        let pml4e = memory.table(root).entry(0, mode);
        memory.table_mut(root).set_entry(
            0,
            mode,
            Descriptor::from_bits(pml4e.bits() | MapAttribute::NX.bits()),
        );
        let table = RootTable::from_existing(memory, root, mode);
        assert_eq!(
            table.parse(ParseOptions::empty()),
            Ok(vec![
                entry(
                    0,
                    0x2000,
                    (attributes - MapAttribute::READ_WRITE) | MapAttribute::NX
                ),
                entry(0x40_0000, 0x1000, attributes | MapAttribute::NX),
            ])
        );
    }

    #[test]
    fn round_trip() {
        for mode in [
            PagingMode::Pae,
            PagingMode::Level4,
            PagingMode::Level4With1G,
            PagingMode::Level5With1G,
        ] {
            let (mut table, mut buffer) = new_table(mode);
            map(&mut table, &mut buffer, 0, 0x4000_0000, read_write(0x4000_0000));
            map(&mut table, &mut buffer, 0x10_0000, 0x3000, read_write(0x2000) | MapAttribute::NX);
            map(
                &mut table,
                &mut buffer,
                0x8000_0000,
                0x40_1000,
                read_write(0x1000) | MapAttribute::GLOBAL,
            );
            table
                .map_range(
                    &mut buffer,
                    &MemoryRegion::with_length(0x20_0000, 0x20_0000),
                    MapAttribute::empty(),
                    MapAttribute::PRESENT,
                )
                .unwrap();
            let entries = table.parse(ParseOptions::empty()).unwrap();
            assert_eq!(entries.len(), 5, "{mode:?}");

            let (mut copy, mut copy_buffer) = new_table(mode);
            for entry in &entries {
                copy.map_range(
                    &mut copy_buffer,
                    &entry.region(),
                    entry.attributes,
                    MapAttribute::all(),
                )
                .unwrap();
            }
            assert_eq!(copy.parse(ParseOptions::empty()), Ok(entries), "{mode:?}");
        }
    }

    #[test]
    fn bits32() {
        let (mut table, mut buffer) = new_table(PagingMode::Bits32);
        map(&mut table, &mut buffer, 0x3f_f000, 0x2000, read_write(0x10_0000));
        map(&mut table, &mut buffer, 0xffff_f000, 0x1000, read_write(0xffff_f000));
        assert_eq!(
            table.parse(ParseOptions::empty()),
            Ok(vec![
                entry(0x3f_f000, 0x2000, read_write(0x10_0000)),
                entry(0xffff_f000, 0x1000, read_write(0xffff_f000)),
            ])
        );
    }
}

// Copyright 2024 The x86-paging Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Abstractions for page table entries and the linear and physical addresses they describe.

use crate::paging::{MapAttribute, PagingMode};

use core::fmt::{self, Debug, Display, Formatter};
use core::ops::{Add, Sub};

/// An x86 linear address, the input of a page table walk.
#[derive(Copy, Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct LinearAddress(pub u64);

impl Display for LinearAddress {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        write!(f, "{:#018x}", self.0)
    }
}

impl Debug for LinearAddress {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        write!(f, "LinearAddress({})", self)
    }
}

impl Sub for LinearAddress {
    type Output = u64;

    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

impl Add<u64> for LinearAddress {
    type Output = Self;

    fn add(self, other: u64) -> Self {
        Self(self.0 + other)
    }
}

/// An x86 physical address, the output of a page table walk and the address of every table.
#[derive(Copy, Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct PhysicalAddress(pub u64);

impl Display for PhysicalAddress {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        write!(f, "{:#018x}", self.0)
    }
}

impl Debug for PhysicalAddress {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        write!(f, "PhysicalAddress({})", self)
    }
}

impl Sub for PhysicalAddress {
    type Output = u64;

    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    fn add(self, other: u64) -> Self {
        Self(self.0 + other)
    }
}

/// Page size bit (PS) of a PDE or PDPTE, which makes it a 2 MiB or 1 GiB leaf.
const PAGE_SIZE_BIT: u64 = 1 << 7;
/// Position of the PAT bit in a PDE or PDPTE leaf. Bit 7 is taken by PS there.
const LARGE_PAT_BIT: u64 = 1 << 12;

/// A raw entry in a page table.
///
/// A descriptor may be:
///   - Not present, i.e. the linear address range is unmapped
///   - A 4 KiB page mapping, if it is in the lowest level table.
///   - A 2 MiB or 1 GiB leaf, if it has the PS bit set at a level that allows leaves.
///   - A pointer to a lower level table otherwise.
///
/// The attributes of a leaf are exposed in the normalized [`MapAttribute`] layout, which always
/// keeps PAT in bit 7 regardless of the level the leaf lives at.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct Descriptor(u64);

impl Descriptor {
    /// An empty (i.e. 0) descriptor.
    pub const EMPTY: Self = Self(0);

    /// Creates a descriptor from its raw value.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw value of the descriptor.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns `true` if the present bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & MapAttribute::PRESENT.bits() != 0
    }

    /// Returns `true` if this entry terminates the walk at `level` for the given paging mode.
    ///
    /// Entries in the lowest level table are always leaves. Above that, an entry is a leaf only if
    /// it is present, has the PS bit set, and the paging mode allows leaves at that level.
    pub fn is_leaf(self, level: usize, mode: PagingMode) -> bool {
        level == 1
            || (self.is_present()
                && level <= mode.levels().max_leaf_level
                && self.0 & PAGE_SIZE_BIT != 0)
    }

    /// Returns the physical address of the next level table this entry points to.
    ///
    /// Only meaningful for present non-leaf entries.
    pub fn table_address(self) -> PhysicalAddress {
        PhysicalAddress(self.0 & MapAttribute::PAGE_TABLE_BASE_ADDRESS.bits())
    }

    /// Returns the attributes of a leaf at `level` in the normalized layout.
    pub fn leaf_attributes(self, level: usize) -> MapAttribute {
        if level == 1 {
            return MapAttribute::from_bits_retain(self.0);
        }
        let mut bits = self.0 & !(LARGE_PAT_BIT | PAGE_SIZE_BIT);
        if self.0 & LARGE_PAT_BIT != 0 {
            bits |= MapAttribute::PAT.bits();
        }
        MapAttribute::from_bits_retain(bits)
    }

    /// Encodes normalized leaf attributes as a leaf entry at `level`.
    ///
    /// The base address of a large leaf must be aligned to the size of the entry.
    pub(crate) fn leaf(level: usize, attributes: MapAttribute) -> Self {
        if level == 1 {
            return Self(attributes.bits());
        }
        let mut bits = (attributes.bits() & !MapAttribute::PAT.bits()) | PAGE_SIZE_BIT;
        if attributes.contains(MapAttribute::PAT) {
            bits |= LARGE_PAT_BIT;
        }
        Self(bits)
    }

    /// Encodes a non-leaf entry at `level` pointing to the table at `pa`.
    ///
    /// Non-leaf entries grant every permission. PAE PDPTEs have no permission bits.
    pub(crate) fn table(pa: PhysicalAddress, level: usize, mode: PagingMode) -> Self {
        let flags = if mode.is_pae_root(level) {
            MapAttribute::PRESENT
        } else {
            MapAttribute::PRESENT | MapAttribute::READ_WRITE | MapAttribute::USER_SUPERVISOR
        };
        Self((pa.0 & MapAttribute::PAGE_TABLE_BASE_ADDRESS.bits()) | flags.bits())
    }

    /// Returns the permissions a non-leaf entry at `level` imposes on everything below it.
    pub(crate) fn table_permissions(self, level: usize, mode: PagingMode) -> MapAttribute {
        if mode.is_pae_root(level) {
            MapAttribute::PRESENT | MapAttribute::READ_WRITE | MapAttribute::USER_SUPERVISOR
        } else {
            MapAttribute::from_bits_retain(self.0) & MapAttribute::INHERITED
        }
    }

    /// Returns a copy which denies the permissions in `permissions`: read/write and
    /// user/supervisor access are cleared, and execute-disable is set.
    pub(crate) fn restricted(self, permissions: MapAttribute) -> Self {
        let denied = permissions & (MapAttribute::READ_WRITE | MapAttribute::USER_SUPERVISOR);
        Self((self.0 & !denied.bits()) | (permissions & MapAttribute::NX).bits())
    }

    /// The reverse of [`restricted`](Self::restricted).
    pub(crate) fn loosened(self, permissions: MapAttribute) -> Self {
        let granted = permissions & (MapAttribute::READ_WRITE | MapAttribute::USER_SUPERVISOR);
        Self((self.0 | granted.bits()) & !(permissions & MapAttribute::NX).bits())
    }
}

impl Debug for Descriptor {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        write!(f, "{:#018x}", self.0)?;
        if self.is_present() {
            write!(
                f,
                " ({}, {:?})",
                self.table_address(),
                MapAttribute::from_bits_retain(self.0) - MapAttribute::PAGE_TABLE_BASE_ADDRESS
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_leaf_moves_pat() {
        let attributes = MapAttribute::PRESENT
            | MapAttribute::READ_WRITE
            | MapAttribute::PAT
            | MapAttribute::from_bits_retain(0x4020_0000);
        let descriptor = Descriptor::leaf(2, attributes);
        assert_eq!(descriptor.bits(), 0x4020_1083);
        assert!(descriptor.is_leaf(2, PagingMode::Level4));
        assert_eq!(descriptor.leaf_attributes(2), attributes);
    }

    #[test]
    fn small_leaf_keeps_pat() {
        let attributes =
            MapAttribute::PRESENT | MapAttribute::PAT | MapAttribute::from_bits_retain(0x5000);
        let descriptor = Descriptor::leaf(1, attributes);
        assert_eq!(descriptor.bits(), 0x5081);
        assert_eq!(descriptor.leaf_attributes(1), attributes);
    }

    #[test]
    fn ps_bit_only_counts_where_leaves_are_allowed() {
        let descriptor = Descriptor::from_bits(0x4000_0081);
        assert!(descriptor.is_leaf(3, PagingMode::Level4With1G));
        assert!(!descriptor.is_leaf(3, PagingMode::Level4));
        assert!(!Descriptor::from_bits(0x4000_0080).is_leaf(3, PagingMode::Level4With1G));
    }

    #[test]
    fn table_entries() {
        let pa = PhysicalAddress(0x7000);
        assert_eq!(Descriptor::table(pa, 4, PagingMode::Level4).bits(), 0x7007);
        assert_eq!(Descriptor::table(pa, 3, PagingMode::Pae).bits(), 0x7001);
        assert_eq!(Descriptor::table(pa, 2, PagingMode::Pae).bits(), 0x7007);
        assert_eq!(Descriptor::table(pa, 4, PagingMode::Level4).table_address(), pa);
    }

    #[test]
    fn table_permissions_keep_nx() {
        let descriptor = Descriptor::from_bits(0x8000_0000_0000_7005);
        assert_eq!(
            descriptor.table_permissions(2, PagingMode::Level4),
            MapAttribute::PRESENT | MapAttribute::USER_SUPERVISOR | MapAttribute::NX
        );
    }

    #[test]
    fn restrict_and_loosen() {
        let permissions = MapAttribute::READ_WRITE | MapAttribute::NX;
        let descriptor = Descriptor::from_bits(0x7007);
        assert_eq!(
            descriptor.restricted(permissions).bits(),
            0x8000_0000_0000_7005
        );
        assert_eq!(
            descriptor.restricted(permissions).loosened(permissions),
            descriptor
        );
        assert_eq!(
            descriptor.restricted(MapAttribute::USER_SUPERVISOR).bits(),
            0x7003
        );
    }
}

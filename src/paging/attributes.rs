// Copyright 2024 The x86-paging Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

use crate::descriptor::PhysicalAddress;
use bitflags::bitflags;

bitflags! {
    /// Attributes of a mapping, laid out like the bits of a 4 KiB page table entry.
    ///
    /// The same value is used both for the attributes to map and for the mask selecting which of
    /// them to apply. [`MapAttribute::all()`] selects every field.
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    pub struct MapAttribute: u64 {
        const PRESENT         = 1 << 0;
        const READ_WRITE      = 1 << 1;
        const USER_SUPERVISOR = 1 << 2;
        const WRITE_THROUGH   = 1 << 3;
        const CACHE_DISABLED  = 1 << 4;
        const ACCESSED        = 1 << 5;
        const DIRTY           = 1 << 6;
        const PAT             = 1 << 7;
        const GLOBAL          = 1 << 8;

        /// Physical address bits 12..=51 of the first page of the mapping.
        const PAGE_TABLE_BASE_ADDRESS = 0x000f_ffff_ffff_f000;
        /// Protection key, bits 59..=62.
        const PROTECTION_KEY = 0xf << 59;

        /// Execute-disable.
        const NX              = 1 << 63;
    }
}

impl MapAttribute {
    /// The fields a new present mapping must have in its mask.
    pub const REQUIRED_FOR_NEW_MAPPING: Self = Self::PRESENT
        .union(Self::READ_WRITE)
        .union(Self::USER_SUPERVISOR)
        .union(Self::PAGE_TABLE_BASE_ADDRESS);

    /// The fields a non-leaf entry passes down to the mappings below it.
    pub const INHERITED: Self = Self::PRESENT
        .union(Self::READ_WRITE)
        .union(Self::USER_SUPERVISOR)
        .union(Self::NX);

    /// Bits set by the processor on access.
    pub const TRANSIENT: Self = Self::ACCESSED.union(Self::DIRTY);

    const PROTECTION_KEY_SHIFT: u32 = 59;

    /// Returns the physical address of the first page of the mapping.
    pub const fn base_address(self) -> PhysicalAddress {
        PhysicalAddress(self.bits() & Self::PAGE_TABLE_BASE_ADDRESS.bits())
    }

    /// Returns a copy with the base address replaced.
    ///
    /// Bits of `pa` outside the base address field are ignored.
    pub const fn with_base_address(self, pa: PhysicalAddress) -> Self {
        Self::from_bits_retain(
            (self.bits() & !Self::PAGE_TABLE_BASE_ADDRESS.bits())
                | (pa.0 & Self::PAGE_TABLE_BASE_ADDRESS.bits()),
        )
    }

    /// Returns the protection key of the mapping.
    pub const fn protection_key(self) -> u8 {
        ((self.bits() & Self::PROTECTION_KEY.bits()) >> Self::PROTECTION_KEY_SHIFT) as u8
    }

    /// Returns a copy with the protection key replaced.
    ///
    /// Only the low 4 bits of `key` are used.
    pub const fn with_protection_key(self, key: u8) -> Self {
        Self::from_bits_retain(
            (self.bits() & !Self::PROTECTION_KEY.bits())
                | (((key & 0xf) as u64) << Self::PROTECTION_KEY_SHIFT),
        )
    }

    /// Applies the fields of `attributes` selected by `mask` on top of `self`.
    pub const fn merge(self, attributes: Self, mask: Self) -> Self {
        Self::from_bits_retain((self.bits() & !mask.bits()) | (attributes.bits() & mask.bits()))
    }
}

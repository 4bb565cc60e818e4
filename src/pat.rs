// Copyright 2024 The x86-paging Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Types for Page Attribute Table values.
//!
//! The PAT, CD and WT bits of a mapping together select one of the 8 entries of the IA32_PAT MSR,
//! which gives the memory type. These types build a PAT value in a readable structured way and
//! work out which memory type a mapping ends up with.
//!
//! # Example
//!
//! ```
//! use x86_paging::{
//!     paging::MapAttribute,
//!     pat::{MemoryType, Pat},
//! };
//!
//! const PAT: Pat = Pat::DEFAULT.with_entry(5, MemoryType::WriteCombining);
//!
//! let attributes = PAT.attributes_for(MemoryType::WriteCombining).unwrap();
//! assert_eq!(attributes, MapAttribute::PAT | MapAttribute::WRITE_THROUGH);
//! assert_eq!(PAT.resolve(attributes), Some(MemoryType::WriteCombining));
//! ```

use crate::paging::MapAttribute;
use core::fmt::{self, Display, Formatter, Write};

/// An IA32_PAT MSR value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Pat(pub u64);

impl Pat {
    /// The value the processor has after reset.
    pub const DEFAULT: Self = Self::new([
        MemoryType::WriteBack,
        MemoryType::WriteThrough,
        MemoryType::UncachedMinus,
        MemoryType::Uncacheable,
        MemoryType::WriteBack,
        MemoryType::WriteThrough,
        MemoryType::UncachedMinus,
        MemoryType::Uncacheable,
    ]);

    /// Constructs a new PAT value from a memory type for each entry.
    pub const fn new(types: [MemoryType; 8]) -> Self {
        let mut value = 0;
        let mut i = 0;
        while i < 8 {
            value |= (types[i] as u64) << (i * 8);
            i += 1;
        }
        Self(value)
    }

    /// Sets the memory type of the entry at the given index, returning the new PAT value.
    pub const fn with_entry(self, index: u8, memory_type: MemoryType) -> Self {
        assert!(index < 8);
        let offset = index * 8;
        Self(self.0 & !(0xff << offset) | (memory_type as u64) << offset)
    }

    /// Returns the memory type of the entry at the given index, or `None` if it holds a reserved
    /// encoding.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not less than 8.
    pub fn memory_type(self, index: u8) -> Option<MemoryType> {
        assert!(index < 8);
        MemoryType::try_from((self.0 >> (index * 8)) as u8).ok()
    }

    /// Returns the memory type selected by the PAT, CD and WT bits of `attributes`.
    pub fn resolve(self, attributes: MapAttribute) -> Option<MemoryType> {
        self.memory_type(index_of(attributes))
    }

    /// Returns the PAT, CD and WT bits selecting the lowest entry with the given memory type, or
    /// `None` if no entry has it.
    pub fn attributes_for(self, memory_type: MemoryType) -> Option<MapAttribute> {
        (0..8)
            .find(|&index| self.memory_type(index) == Some(memory_type))
            .map(attributes_of)
    }
}

impl Default for Pat {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<Pat> for u64 {
    fn from(value: Pat) -> Self {
        value.0
    }
}

impl From<[MemoryType; 8]> for Pat {
    fn from(types: [MemoryType; 8]) -> Self {
        Self::new(types)
    }
}

impl Display for Pat {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_char('{')?;
        for i in 0..8 {
            if i != 0 {
                f.write_str("; ")?;
            }
            match self.memory_type(i) {
                Some(memory_type) => write!(f, "{}: {}", i, memory_type)?,
                None => write!(f, "{}: Reserved ({:#04x})", i, (self.0 >> (i * 8)) as u8)?,
            }
        }
        f.write_char('}')?;
        Ok(())
    }
}

/// Index of the PAT entry selected by `attributes`.
fn index_of(attributes: MapAttribute) -> u8 {
    let mut index = 0;
    if attributes.contains(MapAttribute::PAT) {
        index |= 0b100;
    }
    if attributes.contains(MapAttribute::CACHE_DISABLED) {
        index |= 0b010;
    }
    if attributes.contains(MapAttribute::WRITE_THROUGH) {
        index |= 0b001;
    }
    index
}

fn attributes_of(index: u8) -> MapAttribute {
    let mut attributes = MapAttribute::empty();
    attributes.set(MapAttribute::PAT, index & 0b100 != 0);
    attributes.set(MapAttribute::CACHE_DISABLED, index & 0b010 != 0);
    attributes.set(MapAttribute::WRITE_THROUGH, index & 0b001 != 0);
    attributes
}

/// A memory type which can be given in a PAT entry.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum MemoryType {
    /// Uncacheable (UC)
    Uncacheable = 0,
    /// Write combining (WC)
    WriteCombining = 1,
    /// Write-through (WT)
    WriteThrough = 4,
    /// Write-protected (WP)
    WriteProtected = 5,
    /// Write-back (WB)
    WriteBack = 6,
    /// Uncached (UC-), which MTRRs may override to write combining.
    UncachedMinus = 7,
}

impl TryFrom<u8> for MemoryType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Uncacheable),
            1 => Ok(Self::WriteCombining),
            4 => Ok(Self::WriteThrough),
            5 => Ok(Self::WriteProtected),
            6 => Ok(Self::WriteBack),
            7 => Ok(Self::UncachedMinus),
            _ => Err(()),
        }
    }
}

impl MemoryType {
    fn as_str(self) -> &'static str {
        match self {
            MemoryType::Uncacheable => "UC",
            MemoryType::WriteCombining => "WC",
            MemoryType::WriteThrough => "WT",
            MemoryType::WriteProtected => "WP",
            MemoryType::WriteBack => "WB",
            MemoryType::UncachedMinus => "UC-",
        }
    }
}

impl Display for MemoryType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

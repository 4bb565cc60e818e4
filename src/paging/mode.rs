// Copyright 2024 The x86-paging Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

use super::{MapAttribute, PAGE_SHIFT};
use crate::MapError;

/// The shape of the page table hierarchy for a paging mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PagingLevels {
    /// Number of levels, i.e. the level of the root table. The lowest level is 1.
    pub levels: usize,
    /// Highest level at which an entry may map memory directly.
    pub max_leaf_level: usize,
}

/// An x86 paging mode.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum PagingMode {
    /// 32-bit paging with 4 KiB pages.
    Bits32,
    /// PAE paging with 4 KiB and 2 MiB pages.
    Pae,
    /// 4-level paging with 4 KiB and 2 MiB pages.
    Level4,
    /// 4-level paging with 4 KiB, 2 MiB and 1 GiB pages.
    Level4With1G,
    /// 5-level paging with 4 KiB and 2 MiB pages.
    Level5,
    /// 5-level paging with 4 KiB, 2 MiB and 1 GiB pages.
    Level5With1G,
}

impl PagingMode {
    /// Returns the number of levels and the highest level that may hold leaves.
    pub const fn levels(self) -> PagingLevels {
        let (levels, max_leaf_level) = match self {
            Self::Bits32 => (2, 1),
            Self::Pae => (3, 2),
            Self::Level4 => (4, 2),
            Self::Level4With1G => (4, 3),
            Self::Level5 => (5, 2),
            Self::Level5With1G => (5, 3),
        };
        PagingLevels {
            levels,
            max_leaf_level,
        }
    }

    /// Returns `true` for 32-bit paging, the only mode with 4-byte entries.
    pub const fn has_short_entries(self) -> bool {
        matches!(self, Self::Bits32)
    }

    /// Number of linear address bits translated by each level.
    pub const fn bits_per_level(self) -> u32 {
        if self.has_short_entries() { 10 } else { 9 }
    }

    /// Number of entries in a table.
    pub const fn entries_per_table(self) -> usize {
        1 << self.bits_per_level()
    }

    /// Number of entries of a table at `level` which can be reached by a linear address.
    pub const fn entries_at(self, level: usize) -> usize {
        if self.is_pae_root(level) {
            4
        } else {
            self.entries_per_table()
        }
    }

    /// Returns `true` if `level` is the 4-entry PDPT of PAE paging.
    pub const fn is_pae_root(self, level: usize) -> bool {
        matches!(self, Self::Pae) && level == 3
    }

    /// Shift of the linear address bits that index a table at `level`.
    pub const fn level_shift(self, level: usize) -> u32 {
        PAGE_SHIFT as u32 + (level as u32 - 1) * self.bits_per_level()
    }

    /// Size of the region covered by one entry at `level`.
    pub const fn entry_size(self, level: usize) -> u64 {
        1 << self.level_shift(level)
    }

    /// Index of the entry covering `la` in a table at `level`.
    pub const fn index(self, level: usize, la: u64) -> usize {
        ((la >> self.level_shift(level)) & (self.entries_per_table() as u64 - 1)) as usize
    }

    /// One past the largest linear address the mode can translate.
    pub const fn max_linear_address(self) -> u64 {
        match self {
            Self::Bits32 | Self::Pae => 1 << 32,
            Self::Level4 | Self::Level4With1G => 1 << 48,
            Self::Level5 | Self::Level5With1G => 1 << 57,
        }
    }

    /// One past the largest physical address the mode can map to.
    pub const fn max_physical_address(self) -> u64 {
        if self.has_short_entries() {
            1 << 32
        } else {
            1 << 52
        }
    }

    /// Returns the attribute fields that cannot be encoded in entries of this mode.
    pub const fn unsupported_attributes(self) -> MapAttribute {
        if self.has_short_entries() {
            MapAttribute::NX.union(MapAttribute::PROTECTION_KEY)
        } else {
            MapAttribute::empty()
        }
    }
}

impl From<PagingMode> for u32 {
    /// Packs the mode as the number of levels in the high byte and the highest leaf level in the
    /// low byte. 32-bit paging is 0.
    fn from(mode: PagingMode) -> Self {
        match mode {
            PagingMode::Bits32 => 0,
            mode => {
                let levels = mode.levels();
                ((levels.levels as u32) << 8) | levels.max_leaf_level as u32
            }
        }
    }
}

impl TryFrom<u32> for PagingMode {
    type Error = MapError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Bits32),
            0x0302 => Ok(Self::Pae),
            0x0402 => Ok(Self::Level4),
            0x0403 => Ok(Self::Level4With1G),
            0x0502 => Ok(Self::Level5),
            0x0503 => Ok(Self::Level5With1G),
            _ => Err(MapError::UnsupportedPagingMode(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_MODES: [PagingMode; 6] = [
        PagingMode::Bits32,
        PagingMode::Pae,
        PagingMode::Level4,
        PagingMode::Level4With1G,
        PagingMode::Level5,
        PagingMode::Level5With1G,
    ];

    #[test]
    fn packed_encoding() {
        assert_eq!(u32::from(PagingMode::Pae), 0x0302);
        assert_eq!(u32::from(PagingMode::Level4With1G), 0x0403);
        assert_eq!(u32::from(PagingMode::Level5), 0x0502);
        for mode in ALL_MODES {
            assert_eq!(PagingMode::try_from(u32::from(mode)), Ok(mode));
        }
    }

    #[test]
    fn unsupported_encoding() {
        assert_eq!(
            PagingMode::try_from(0x0401),
            Err(MapError::UnsupportedPagingMode(0x0401))
        );
        assert_eq!(
            PagingMode::try_from(0x0504),
            Err(MapError::UnsupportedPagingMode(0x0504))
        );
    }

    #[test]
    fn level_arithmetic() {
        assert_eq!(PagingMode::Level4.entry_size(1), 0x1000);
        assert_eq!(PagingMode::Level4.entry_size(2), 0x20_0000);
        assert_eq!(PagingMode::Level4.entry_size(3), 0x4000_0000);
        assert_eq!(PagingMode::Level5.level_shift(5), 48);
        assert_eq!(PagingMode::Bits32.entry_size(2), 0x40_0000);
        assert_eq!(PagingMode::Bits32.index(2, 0xffc0_0000), 1023);
        assert_eq!(PagingMode::Level4.index(4, 0x0000_8000_0000_0000 - 1), 255);
        assert_eq!(PagingMode::Pae.index(3, 0xc000_0000), 3);
        assert_eq!(PagingMode::Pae.entries_at(3), 4);
        assert_eq!(PagingMode::Pae.entries_at(2), 512);
    }

    #[test]
    fn root_covers_linear_range() {
        for mode in ALL_MODES {
            let levels = mode.levels();
            let covered = mode.entry_size(levels.levels) * mode.entries_at(levels.levels) as u64;
            assert_eq!(covered, mode.max_linear_address(), "{mode:?}");
        }
    }
}

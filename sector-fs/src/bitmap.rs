use log::trace;

use crate::error::{FsError, Result};
use crate::layout::FileHeader;
use crate::synch_disk::SynchDisk;
use crate::SectorId;

/// One bit per sector, set when the sector is allocated.
///
/// The map lives in memory while an operation runs and is persisted as the
/// contents of the free-map file: bit `i` is bit `i % 8` of byte `i / 8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeMap {
    num_sectors: usize,
    bits: Vec<u64>,
}

impl FreeMap {
    /// A map of `num_sectors` sectors, all free.
    pub fn new(num_sectors: usize) -> Self {
        Self {
            num_sectors,
            bits: vec![0; (num_sectors + 63) / 64],
        }
    }

    pub fn num_sectors(&self) -> usize {
        self.num_sectors
    }

    /// Size in bytes of the persisted form.
    pub fn byte_len(&self) -> usize {
        (self.num_sectors + 7) / 8
    }

    fn position(&self, sector: SectorId) -> Result<(usize, u64)> {
        if sector >= self.num_sectors {
            return Err(FsError::SectorOutOfRange {
                sector,
                max: self.num_sectors,
            });
        }
        Ok((sector / 64, 1u64 << (sector % 64)))
    }

    /// Returns the lowest free sector and marks it allocated, or `None` when
    /// every sector is taken.
    pub fn find_free(&mut self) -> Option<SectorId> {
        let sector = self
            .bits
            .iter()
            .enumerate()
            .find(|(_, bit64)| **bit64 != u64::MAX)
            .map(|(word, bit64)| word * 64 + bit64.trailing_ones() as usize)
            .filter(|sector| *sector < self.num_sectors)?;
        self.bits[sector / 64] |= 1 << (sector % 64);
        trace!("allocated sector {}", sector);
        Some(sector)
    }

    pub fn mark(&mut self, sector: SectorId) -> Result<()> {
        let (word, mask) = self.position(sector)?;
        self.bits[word] |= mask;
        Ok(())
    }

    /// Mark `sector` free. The sector must currently be allocated.
    pub fn clear(&mut self, sector: SectorId) -> Result<()> {
        let (word, mask) = self.position(sector)?;
        if self.bits[word] & mask == 0 {
            return Err(FsError::NotAllocated { sector });
        }
        self.bits[word] &= !mask;
        trace!("released sector {}", sector);
        Ok(())
    }

    pub fn is_allocated(&self, sector: SectorId) -> bool {
        self.position(sector)
            .map(|(word, mask)| self.bits[word] & mask != 0)
            .unwrap_or(false)
    }

    pub fn count_free(&self) -> usize {
        let used: usize = self.bits.iter().map(|bit64| bit64.count_ones() as usize).sum();
        self.num_sectors - used
    }

    /// Rebuild a map of `num_sectors` sectors from its persisted bytes.
    pub fn load_from(num_sectors: usize, bytes: &[u8]) -> Result<Self> {
        let mut map = Self::new(num_sectors);
        if bytes.len() < map.byte_len() {
            return Err(FsError::Corruption {
                sector: crate::FREE_MAP_SECTOR,
                detail: format!(
                    "free map holds {} bytes, {} needed",
                    bytes.len(),
                    map.byte_len()
                ),
            });
        }
        for (idx, byte) in bytes[..map.byte_len()].iter().enumerate() {
            map.bits[idx / 8] |= (*byte as u64) << ((idx % 8) * 8);
        }
        // bits past the last sector are never set
        if num_sectors % 64 != 0 {
            if let Some(last) = map.bits.last_mut() {
                *last &= (1u64 << (num_sectors % 64)) - 1;
            }
        }
        Ok(map)
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.bits
            .iter()
            .flat_map(|bit64| bit64.to_le_bytes())
            .take(self.byte_len())
            .collect()
    }

    /// Read the map from the file described by `header`.
    pub fn fetch_from(header: &FileHeader, disk: &SynchDisk) -> Result<Self> {
        let mut bytes = vec![0u8; header.byte_length()];
        header.read_at(0, &mut bytes, disk)?;
        Self::load_from(disk.num_sectors(), &bytes)
    }

    /// Persist the map into the file described by `header`.
    pub fn write_back(&self, header: &FileHeader, disk: &SynchDisk) -> Result<()> {
        let bytes = self.serialize();
        let written = header.write_at(0, &bytes, disk)?;
        debug_assert_eq!(written, bytes.len());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finds_lowest_free() -> Result<()> {
        let mut map = FreeMap::new(130);
        assert_eq!(map.count_free(), 130);
        map.mark(0)?;
        map.mark(1)?;
        map.mark(3)?;
        assert_eq!(map.find_free(), Some(2));
        assert_eq!(map.find_free(), Some(4));
        map.clear(1)?;
        assert_eq!(map.find_free(), Some(1));
        assert_eq!(map.count_free(), 125);
        Ok(())
    }

    #[test]
    fn exhausted() {
        let mut map = FreeMap::new(70);
        for expect in 0..70 {
            assert_eq!(map.find_free(), Some(expect));
        }
        assert_eq!(map.find_free(), None);
        assert_eq!(map.count_free(), 0);
    }

    #[test]
    fn clear_requires_allocated() -> Result<()> {
        let mut map = FreeMap::new(16);
        map.mark(5)?;
        map.clear(5)?;
        assert!(matches!(map.clear(5), Err(FsError::NotAllocated { sector: 5 })));
        assert!(matches!(
            map.clear(16),
            Err(FsError::SectorOutOfRange { sector: 16, max: 16 })
        ));
        Ok(())
    }

    #[test]
    fn persisted_bit_order() -> Result<()> {
        let mut map = FreeMap::new(1024);
        map.mark(0)?;
        map.mark(9)?;
        map.mark(1023)?;
        let bytes = map.serialize();
        assert_eq!(bytes.len(), 128);
        assert_eq!(bytes[0], 0b0000_0001);
        assert_eq!(bytes[1], 0b0000_0010);
        assert_eq!(bytes[127], 0b1000_0000);
        assert_eq!(FreeMap::load_from(1024, &bytes)?, map);
        Ok(())
    }

    #[test]
    fn short_input_is_corruption() {
        assert!(matches!(
            FreeMap::load_from(1024, &[0u8; 10]),
            Err(FsError::Corruption { .. })
        ));
    }
}

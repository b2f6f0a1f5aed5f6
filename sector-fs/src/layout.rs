//! On-disk records: file headers, indirection blocks and directory entries.
//!
//! Every record is encoded little-endian through an explicit codec; nothing is
//! read by reinterpreting a sector buffer as a struct.

use core::fmt::{Debug, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::bitmap::FreeMap;
use crate::error::{FsError, Result};
use crate::synch_disk::{SectorData, SynchDisk};
use crate::{
    SectorId, DIRECT_DATA_COUNT, DIRENTRY_SIZE, INDEX_DATA_ENTRIES, INDEX_ENTRIES,
    NAME_LENGTH_LIMIT, NUM_DIRECT, SECTOR_SIZE, TYPE_TAG_LEN,
};

const HEADER_LEN: usize = 4 + 4 + 4 * NUM_DIRECT + TYPE_TAG_LEN + 3 * 8;
const _: () = assert!(HEADER_LEN <= SECTOR_SIZE);
const _: () = assert!(4 * INDEX_ENTRIES == SECTOR_SIZE);
const _: () = assert!(1 + 4 + NAME_LENGTH_LIMIT + 1 + 1 == DIRENTRY_SIZE);

/// Seconds since the Unix epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn put(buf: &mut [u8], at: &mut usize, bytes: &[u8]) {
    buf[*at..*at + bytes.len()].copy_from_slice(bytes);
    *at += bytes.len();
}

fn take_u32(buf: &[u8], at: &mut usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[*at..*at + 4]);
    *at += 4;
    u32::from_le_bytes(raw)
}

fn take_u64(buf: &[u8], at: &mut usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[*at..*at + 8]);
    *at += 8;
    u64::from_le_bytes(raw)
}

fn out_of_space(needed: usize, free_map: &FreeMap) -> FsError {
    FsError::OutOfSpace {
        needed,
        free: free_map.count_free(),
    }
}

fn take_sector(free_map: &mut FreeMap) -> Result<u32> {
    free_map
        .find_free()
        .map(|sector| sector as u32)
        .ok_or_else(|| out_of_space(1, free_map))
}

/// A full sector of sector numbers. Slots `0..INDEX_DATA_ENTRIES` address
/// data sectors; the last slot holds the next block of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    entries: [u32; INDEX_ENTRIES],
}

impl Default for IndexBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexBlock {
    pub fn new() -> Self {
        Self {
            entries: [0; INDEX_ENTRIES],
        }
    }

    pub fn get(&self, slot: usize) -> SectorId {
        assert!(slot < INDEX_DATA_ENTRIES);
        self.entries[slot] as SectorId
    }

    pub fn set(&mut self, slot: usize, sector: u32) {
        assert!(slot < INDEX_DATA_ENTRIES);
        self.entries[slot] = sector;
    }

    pub fn next(&self) -> SectorId {
        self.entries[INDEX_ENTRIES - 1] as SectorId
    }

    pub fn set_next(&mut self, sector: u32) {
        self.entries[INDEX_ENTRIES - 1] = sector;
    }

    pub fn encode(&self) -> SectorData {
        let mut data = [0u8; SECTOR_SIZE];
        let mut at = 0;
        for entry in self.entries.iter() {
            put(&mut data, &mut at, &entry.to_le_bytes());
        }
        data
    }

    pub fn decode(data: &SectorData) -> Self {
        let mut block = Self::new();
        let mut at = 0;
        for entry in block.entries.iter_mut() {
            *entry = take_u32(data, &mut at);
        }
        block
    }

    pub fn fetch_from(sector: SectorId, disk: &SynchDisk) -> Result<Self> {
        Ok(disk.read(sector, Self::decode)?)
    }

    pub fn write_back(&self, sector: SectorId, disk: &SynchDisk) -> Result<()> {
        disk.replace(sector, &self.encode())?;
        Ok(())
    }
}

/// Per-file metadata, stored in exactly one sector.
///
/// The first `DIRECT_DATA_COUNT` data sectors are addressed from the direct
/// table. A file with more data sectors uses the last direct slot for the
/// first [`IndexBlock`]; each index block addresses `INDEX_DATA_ENTRIES` more
/// data sectors and links the next block through its last slot.
#[derive(Clone, PartialEq, Eq)]
pub struct FileHeader {
    byte_length: u32,
    sector_count: u32,
    direct: [u32; NUM_DIRECT],
    file_type: [u8; TYPE_TAG_LEN],
    created: u64,
    accessed: u64,
    modified: u64,
}

impl Debug for FileHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileHeader")
            .field("byte_length", &self.byte_length)
            .field("sector_count", &self.sector_count)
            .field("direct", &&self.direct[..])
            .field("file_type", &self.file_type())
            .field("created", &self.created)
            .field("accessed", &self.accessed)
            .field("modified", &self.modified)
            .finish()
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl FileHeader {
    /// An empty header stamped with the current time.
    pub fn new() -> Self {
        let now = now();
        Self {
            byte_length: 0,
            sector_count: 0,
            direct: [0; NUM_DIRECT],
            file_type: [0; TYPE_TAG_LEN],
            created: now,
            accessed: now,
            modified: now,
        }
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length as usize
    }

    pub fn sector_count(&self) -> usize {
        self.sector_count as usize
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn accessed(&self) -> u64 {
        self.accessed
    }

    pub fn modified(&self) -> u64 {
        self.modified
    }

    /// Type tag taken from the file name's extension.
    pub fn file_type(&self) -> String {
        let len = self
            .file_type
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(TYPE_TAG_LEN);
        String::from_utf8_lossy(&self.file_type[..len]).into_owned()
    }

    /// Record the text after the last `.` of `name` as the type tag.
    pub fn set_file_type(&mut self, name: &str) {
        let ext = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
        let len = ext.len().min(TYPE_TAG_LEN);
        self.file_type = [0; TYPE_TAG_LEN];
        self.file_type[..len].copy_from_slice(&ext.as_bytes()[..len]);
    }

    pub fn touch_access(&mut self) {
        self.accessed = now();
    }

    pub fn touch_modify(&mut self) {
        self.modified = now();
    }

    /// Number of data sectors needed to hold `size` bytes.
    pub fn data_sectors_by_size(size: usize) -> usize {
        size / SECTOR_SIZE + usize::from(size % SECTOR_SIZE != 0)
    }

    /// Number of index blocks needed to address `data_sectors` data sectors.
    pub fn index_blocks_by_sectors(data_sectors: usize) -> usize {
        if data_sectors <= DIRECT_DATA_COUNT {
            0
        } else {
            (data_sectors - DIRECT_DATA_COUNT + INDEX_DATA_ENTRIES - 1) / INDEX_DATA_ENTRIES
        }
    }

    /// Sectors (data and index) a file of `size` bytes occupies, header excluded.
    pub fn total_sectors_by_size(size: usize) -> usize {
        let data = Self::data_sectors_by_size(size);
        data + Self::index_blocks_by_sectors(data)
    }

    fn checked(&self, sector: u32, disk: &SynchDisk, what: &str) -> Result<SectorId> {
        let sector = sector as SectorId;
        if sector == 0 || sector >= disk.num_sectors() {
            return Err(FsError::corruption(
                sector,
                format!("{} points at invalid sector {}", what, sector),
            ));
        }
        Ok(sector)
    }

    /// Index blocks of the chain for the current sector count, in order.
    fn load_chain(&self, disk: &SynchDisk) -> Result<Vec<(SectorId, IndexBlock)>> {
        let blocks = Self::index_blocks_by_sectors(self.sector_count());
        let mut chain: Vec<(SectorId, IndexBlock)> = Vec::with_capacity(blocks);
        if blocks == 0 {
            return Ok(chain);
        }
        let mut sector = self.checked(self.direct[NUM_DIRECT - 1], disk, "direct table")?;
        loop {
            let block = IndexBlock::fetch_from(sector, disk)?;
            let next = block.next() as u32;
            chain.push((sector, block));
            if chain.len() == blocks {
                break;
            }
            sector = self.checked(next, disk, "index chain")?;
        }
        Ok(chain)
    }

    /// Data sectors in file order.
    pub fn data_sectors(&self, disk: &SynchDisk) -> Result<Vec<SectorId>> {
        let total = self.sector_count();
        let mut sectors = Vec::with_capacity(total);
        for sector in self.direct.iter().take(total.min(DIRECT_DATA_COUNT)) {
            sectors.push(self.checked(*sector, disk, "direct table")?);
        }
        for (_, block) in self.load_chain(disk)? {
            let remaining = total - sectors.len();
            for slot in 0..remaining.min(INDEX_DATA_ENTRIES) {
                sectors.push(self.checked(block.get(slot) as u32, disk, "index block")?);
            }
        }
        if sectors.len() != total {
            return Err(FsError::corruption(
                self.direct[NUM_DIRECT - 1] as SectorId,
                format!("reached {} of {} data sectors", sectors.len(), total),
            ));
        }
        Ok(sectors)
    }

    /// Sectors of the index chain in order.
    pub fn index_sectors(&self, disk: &SynchDisk) -> Result<Vec<SectorId>> {
        Ok(self
            .load_chain(disk)?
            .into_iter()
            .map(|(sector, _)| sector)
            .collect())
    }

    /// Initialize a fresh header for a file of `size` bytes, drawing its
    /// sectors from `free_map`. Index blocks are written to disk right away.
    /// Fails without touching `free_map` if there is not enough space.
    pub fn allocate(&mut self, free_map: &mut FreeMap, size: usize, disk: &SynchDisk) -> Result<()> {
        let needed = Self::total_sectors_by_size(size);
        let byte_length = u32::try_from(size).map_err(|_| out_of_space(needed, free_map))?;
        if free_map.count_free() < needed {
            return Err(out_of_space(needed, free_map));
        }
        let data = Self::data_sectors_by_size(size);
        self.byte_length = byte_length;
        self.sector_count = 0;
        self.direct = [0; NUM_DIRECT];
        self.grow(free_map, data, disk)?;
        self.sector_count = data as u32;
        debug!("allocated {} data sectors ({} in total)", data, needed);
        Ok(())
    }

    /// Extend the sector structure from the current sector count to `to`
    /// data sectors.
    fn grow(&mut self, free_map: &mut FreeMap, to: usize, disk: &SynchDisk) -> Result<()> {
        let mut pos = self.sector_count();
        while pos < to.min(DIRECT_DATA_COUNT) {
            self.direct[pos] = take_sector(free_map)?;
            pos += 1;
        }
        if pos >= to {
            return Ok(());
        }
        let mut blocks = self.load_chain(disk)?;
        let mut chain_len = blocks.len();
        let mut current = blocks.pop();
        while pos < to {
            let rel = pos - DIRECT_DATA_COUNT;
            let (block_idx, slot) = (rel / INDEX_DATA_ENTRIES, rel % INDEX_DATA_ENTRIES);
            if block_idx == chain_len {
                let sector = take_sector(free_map)?;
                match current.take() {
                    None => {
                        debug!("started indirection at sector {}", sector);
                        self.direct[NUM_DIRECT - 1] = sector;
                    }
                    Some((prev_sector, mut prev)) => {
                        debug!("linked index block {} after {}", sector, prev_sector);
                        prev.set_next(sector);
                        prev.write_back(prev_sector, disk)?;
                    }
                }
                chain_len += 1;
                current = Some((sector as SectorId, IndexBlock::new()));
            }
            if let Some((_, block)) = current.as_mut() {
                block.set(slot, take_sector(free_map)?);
            }
            pos += 1;
        }
        if let Some((sector, block)) = current {
            block.write_back(sector, disk)?;
        }
        Ok(())
    }

    /// Return every sector this header reaches (data and index blocks) to
    /// `free_map` and reset the header to an empty file.
    pub fn deallocate(&mut self, free_map: &mut FreeMap, disk: &SynchDisk) -> Result<()> {
        let mut sectors = self.data_sectors(disk)?;
        sectors.extend(self.index_sectors(disk)?);
        for sector in sectors.iter() {
            free_map.clear(*sector).map_err(|_| {
                FsError::corruption(*sector, "header references a free sector")
            })?;
        }
        debug!("released {} sectors", sectors.len());
        self.byte_length = 0;
        self.sector_count = 0;
        self.direct = [0; NUM_DIRECT];
        Ok(())
    }

    /// Sector holding byte `offset` of the file.
    pub fn byte_to_sector(&self, offset: usize, disk: &SynchDisk) -> Result<SectorId> {
        if offset >= self.byte_length() {
            return Err(FsError::OffsetOutOfRange {
                offset,
                length: self.byte_length(),
            });
        }
        let idx = offset / SECTOR_SIZE;
        if idx < DIRECT_DATA_COUNT {
            return self.checked(self.direct[idx], disk, "direct table");
        }
        let mut rel = idx - DIRECT_DATA_COUNT;
        let mut sector = self.checked(self.direct[NUM_DIRECT - 1], disk, "direct table")?;
        let mut block = IndexBlock::fetch_from(sector, disk)?;
        while rel >= INDEX_DATA_ENTRIES {
            rel -= INDEX_DATA_ENTRIES;
            sector = self.checked(block.next() as u32, disk, "index chain")?;
            block = IndexBlock::fetch_from(sector, disk)?;
        }
        self.checked(block.get(rel) as u32, disk, "index block")
    }

    /// Grow the file by `extra` bytes, keeping every sector it already has.
    /// On failure for lack of space the length is left unchanged.
    pub fn enlarge(&mut self, free_map: &mut FreeMap, extra: usize, disk: &SynchDisk) -> Result<()> {
        let old_length = self.byte_length();
        let new_length = old_length
            .checked_add(extra)
            .ok_or_else(|| out_of_space(usize::MAX, free_map))?;
        let old_count = self.sector_count();
        let new_count = Self::data_sectors_by_size(new_length);
        let needed =
            Self::total_sectors_by_size(new_length) - Self::total_sectors_by_size(old_length);
        self.byte_length =
            u32::try_from(new_length).map_err(|_| out_of_space(needed, free_map))?;
        if new_count == old_count {
            return Ok(());
        }
        if free_map.count_free() < needed {
            self.byte_length = old_length as u32;
            return Err(out_of_space(needed, free_map));
        }
        debug!(
            "enlarging by {} bytes, {} -> {} data sectors",
            extra, old_count, new_count
        );
        self.grow(free_map, new_count, disk)?;
        self.sector_count = new_count as u32;
        Ok(())
    }

    fn end_of(&self, offset: usize, len: usize) -> Result<usize> {
        offset.checked_add(len).ok_or(FsError::OffsetOutOfRange {
            offset,
            length: self.byte_length(),
        })
    }

    /// Read from byte `offset` into `buffer`; returns the bytes read, which
    /// stop at the end of the file.
    pub fn read_at(&self, offset: usize, buffer: &mut [u8], disk: &SynchDisk) -> Result<usize> {
        let mut start = offset;
        let end = self.byte_length().min(self.end_of(offset, buffer.len())?);
        if end <= start {
            return Ok(0);
        }
        let mut read_size = 0;
        while start < end {
            let inner_start = start % SECTOR_SIZE;
            let curr_len = (SECTOR_SIZE - inner_start).min(end - start);
            let sector = self.byte_to_sector(start, disk)?;
            let dst = &mut buffer[read_size..read_size + curr_len];
            disk.read(sector, |data| {
                dst.copy_from_slice(&data[inner_start..inner_start + curr_len]);
            })?;
            read_size += curr_len;
            start += curr_len;
        }
        Ok(read_size)
    }

    /// Write `buffer` at byte `offset`; bytes past the end of the file are
    /// not written. Returns the bytes written.
    pub fn write_at(&self, offset: usize, buffer: &[u8], disk: &SynchDisk) -> Result<usize> {
        let mut start = offset;
        let end = self.byte_length().min(self.end_of(offset, buffer.len())?);
        if end <= start {
            return Ok(0);
        }
        let mut write_size = 0;
        while start < end {
            let inner_start = start % SECTOR_SIZE;
            let curr_len = (SECTOR_SIZE - inner_start).min(end - start);
            let sector = self.byte_to_sector(start, disk)?;
            let src = &buffer[write_size..write_size + curr_len];
            if curr_len == SECTOR_SIZE {
                let mut data = [0u8; SECTOR_SIZE];
                data.copy_from_slice(src);
                disk.replace(sector, &data)?;
            } else {
                disk.modify(sector, |data| {
                    data[inner_start..inner_start + curr_len].copy_from_slice(src);
                })?;
            }
            write_size += curr_len;
            start += curr_len;
        }
        Ok(write_size)
    }

    pub fn encode(&self) -> SectorData {
        let mut data = [0u8; SECTOR_SIZE];
        let mut at = 0;
        put(&mut data, &mut at, &self.byte_length.to_le_bytes());
        put(&mut data, &mut at, &self.sector_count.to_le_bytes());
        for sector in self.direct.iter() {
            put(&mut data, &mut at, &sector.to_le_bytes());
        }
        put(&mut data, &mut at, &self.file_type);
        put(&mut data, &mut at, &self.created.to_le_bytes());
        put(&mut data, &mut at, &self.accessed.to_le_bytes());
        put(&mut data, &mut at, &self.modified.to_le_bytes());
        data
    }

    /// Decode the header stored in `sector`, checking that its sector count
    /// matches its length.
    pub fn decode(sector: SectorId, data: &SectorData) -> Result<Self> {
        let mut at = 0;
        let byte_length = take_u32(data, &mut at);
        let sector_count = take_u32(data, &mut at);
        let mut direct = [0u32; NUM_DIRECT];
        for entry in direct.iter_mut() {
            *entry = take_u32(data, &mut at);
        }
        let mut file_type = [0u8; TYPE_TAG_LEN];
        file_type.copy_from_slice(&data[at..at + TYPE_TAG_LEN]);
        at += TYPE_TAG_LEN;
        let created = take_u64(data, &mut at);
        let accessed = take_u64(data, &mut at);
        let modified = take_u64(data, &mut at);
        let expected = Self::data_sectors_by_size(byte_length as usize);
        if sector_count as usize != expected {
            return Err(FsError::corruption(
                sector,
                format!(
                    "header of {} bytes claims {} sectors, {} expected",
                    byte_length, sector_count, expected
                ),
            ));
        }
        Ok(Self {
            byte_length,
            sector_count,
            direct,
            file_type,
            created,
            accessed,
            modified,
        })
    }

    pub fn fetch_from(sector: SectorId, disk: &SynchDisk) -> Result<Self> {
        disk.read(sector, |data| Self::decode(sector, data))?
    }

    pub fn write_back(&self, sector: SectorId, disk: &SynchDisk) -> Result<()> {
        disk.replace(sector, &self.encode())?;
        Ok(())
    }
}

/// One slot of a directory table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    in_use: bool,
    sector: u32,
    name: [u8; NAME_LENGTH_LIMIT + 1], // NUL padded
    is_dir: bool,
}

impl DirEntry {
    pub fn empty() -> Self {
        Self {
            in_use: false,
            sector: 0,
            name: [0; NAME_LENGTH_LIMIT + 1],
            is_dir: false,
        }
    }

    pub fn new(name: &str, sector: SectorId, is_dir: bool) -> Result<Self> {
        if name.len() > NAME_LENGTH_LIMIT {
            return Err(FsError::NameTooLong(name.to_string()));
        }
        let mut bytes = [0u8; NAME_LENGTH_LIMIT + 1];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self {
            in_use: true,
            sector: sector as u32,
            name: bytes,
            is_dir,
        })
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn sector(&self) -> SectorId {
        self.sector as SectorId
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn encode(&self, buf: &mut [u8]) {
        let mut at = 0;
        put(buf, &mut at, &[self.in_use as u8]);
        put(buf, &mut at, &self.sector.to_le_bytes());
        put(buf, &mut at, &self.name);
        put(buf, &mut at, &[self.is_dir as u8]);
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut at = 1;
        let sector = take_u32(buf, &mut at);
        let mut name = [0u8; NAME_LENGTH_LIMIT + 1];
        name.copy_from_slice(&buf[at..at + NAME_LENGTH_LIMIT + 1]);
        at += NAME_LENGTH_LIMIT + 1;
        Self {
            in_use: buf[0] != 0,
            sector,
            name,
            is_dir: buf[at] != 0,
        }
    }
}

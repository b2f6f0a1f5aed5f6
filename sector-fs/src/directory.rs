use log::trace;

use crate::error::{FsError, Result};
use crate::layout::{DirEntry, FileHeader};
use crate::synch_disk::SynchDisk;
use crate::{SectorId, DIRENTRY_SIZE};

/// A fixed-capacity table of directory entries, loaded into memory from a
/// directory file and written back as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    table: Vec<DirEntry>,
}

impl Directory {
    /// An empty directory with room for `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            table: vec![DirEntry::empty(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    /// Size in bytes of the persisted table.
    pub fn byte_len(&self) -> usize {
        self.table.len() * DIRENTRY_SIZE
    }

    /// Load the table stored in the directory file described by `header`.
    pub fn fetch_from(header: &FileHeader, disk: &SynchDisk) -> Result<Self> {
        let mut bytes = vec![0u8; header.byte_length()];
        let read = header.read_at(0, &mut bytes, disk)?;
        if read % DIRENTRY_SIZE != 0 {
            return Err(FsError::corruption(
                header.byte_to_sector(0, disk)?,
                format!("directory file of {} bytes", read),
            ));
        }
        Ok(Self {
            table: bytes.chunks_exact(DIRENTRY_SIZE).map(DirEntry::decode).collect(),
        })
    }

    pub fn write_back(&self, header: &FileHeader, disk: &SynchDisk) -> Result<()> {
        let mut bytes = vec![0u8; self.byte_len()];
        for (entry, chunk) in self.table.iter().zip(bytes.chunks_exact_mut(DIRENTRY_SIZE)) {
            entry.encode(chunk);
        }
        header.write_at(0, &bytes, disk)?;
        Ok(())
    }

    pub fn find_entry(&self, name: &str) -> Option<&DirEntry> {
        self.table
            .iter()
            .find(|entry| entry.in_use() && entry.name() == name)
    }

    /// Header sector of `name`.
    pub fn find(&self, name: &str) -> Option<SectorId> {
        self.find_entry(name).map(DirEntry::sector)
    }

    /// Insert `name` into the first unused slot.
    pub fn add(&mut self, name: &str, sector: SectorId, is_dir: bool) -> Result<()> {
        if self.find_entry(name).is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
        let entry = DirEntry::new(name, sector, is_dir)?;
        let slot = self
            .table
            .iter_mut()
            .find(|entry| !entry.in_use())
            .ok_or_else(|| FsError::DirectoryFull(name.to_string()))?;
        *slot = entry;
        trace!("added {} -> {}", name, sector);
        Ok(())
    }

    /// Drop `name` from the table and return its entry.
    pub fn remove(&mut self, name: &str) -> Result<DirEntry> {
        let slot = self
            .table
            .iter_mut()
            .find(|entry| entry.in_use() && entry.name() == name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        let removed = core::mem::replace(slot, DirEntry::empty());
        trace!("removed {} -> {}", name, removed.sector());
        Ok(removed)
    }

    /// Entries in use, in storage order.
    pub fn list(&self) -> impl Iterator<Item = &DirEntry> {
        self.table.iter().filter(|entry| entry.in_use())
    }

    pub fn len(&self) -> usize {
        self.list().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bitmap::FreeMap;
    use crate::block_dev::BlockDevice;
    use crate::mem_disk::MemDisk;
    use crate::{DIRECTORY_FILE_SIZE, NUM_DIR_ENTRIES};
    use std::sync::Arc;

    #[test]
    fn add_find_remove() -> Result<()> {
        let mut dir = Directory::new(3);
        dir.add("a", 10, false)?;
        dir.add("sub", 11, true)?;
        assert_eq!(dir.find("a"), Some(10));
        assert!(dir.find_entry("sub").map(DirEntry::is_dir).unwrap_or(false));
        assert!(matches!(dir.add("a", 12, false), Err(FsError::AlreadyExists(_))));
        dir.add("c", 12, false)?;
        assert!(matches!(dir.add("d", 13, false), Err(FsError::DirectoryFull(_))));
        assert_eq!(dir.remove("a")?.sector(), 10);
        assert!(matches!(dir.remove("a"), Err(FsError::NotFound(_))));
        assert_eq!(dir.len(), 2);
        Ok(())
    }

    #[test]
    fn list_keeps_storage_order() -> Result<()> {
        let mut dir = Directory::new(4);
        dir.add("x", 5, false)?;
        dir.add("y", 6, false)?;
        dir.add("z", 7, false)?;
        dir.remove("x")?;
        // the freed first slot is reused
        dir.add("w", 8, false)?;
        let names: Vec<&str> = dir.list().map(DirEntry::name).collect();
        assert_eq!(names, ["w", "y", "z"]);
        Ok(())
    }

    #[test]
    fn persisted_table() -> Result<()> {
        let mem: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(64));
        let disk = SynchDisk::new(mem);
        let mut free_map = FreeMap::new(64);
        free_map.mark(0)?;
        let mut header = FileHeader::new();
        header.allocate(&mut free_map, DIRECTORY_FILE_SIZE, &disk)?;

        let mut dir = Directory::new(NUM_DIR_ENTRIES);
        dir.add("file.txt", 20, false)?;
        dir.add("docs", 21, true)?;
        dir.write_back(&header, &disk)?;

        let loaded = Directory::fetch_from(&header, &disk)?;
        assert_eq!(loaded, dir);
        assert_eq!(loaded.capacity(), NUM_DIR_ENTRIES);
        Ok(())
    }
}

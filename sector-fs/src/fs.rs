use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, error, warn};
use spin::Mutex;

use crate::bitmap::FreeMap;
use crate::block_dev::BlockDevice;
use crate::directory::Directory;
use crate::error::{FsError, Result};
use crate::layout::FileHeader;
use crate::mutex::MutexBlocking;
use crate::open_file::{OpenFile, OpenFlags};
use crate::synch_disk::SynchDisk;
use crate::{
    SectorId, DIRECTORY_FILE_SIZE, DIRECTORY_SECTOR, FREE_MAP_SECTOR, NUM_DIR_ENTRIES,
    PIPE_SECTOR,
};

/// What `stat` reports about a file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Sector of the file header.
    pub sector: SectorId,
    pub is_dir: bool,
    pub size: usize,
    /// Number of data sectors, index blocks excluded.
    pub sectors: usize,
    /// Data sectors in file order.
    pub data_sectors: Vec<SectorId>,
    /// Index blocks of the chain in order.
    pub index_sectors: Vec<SectorId>,
    pub file_type: String,
    pub created: u64,
    pub accessed: u64,
    pub modified: u64,
}

struct FsInner {
    free_map_file: FileHeader,
}

/// Named files and directories on one disk.
///
/// Every operation that changes a directory or the free map runs under the
/// manager lock. The free map is loaded from disk at the start of such an
/// operation, changed in memory and written back only once the operation has
/// succeeded.
pub struct FileSystem {
    disk: Arc<SynchDisk>,
    inner: MutexBlocking<FsInner>,
    open_counts: Mutex<BTreeMap<SectorId, usize>>,
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|part| !part.is_empty()).collect()
}

/// Log a corruption loudly and stop debug builds on the spot.
pub(crate) fn surface<T>(result: Result<T>) -> Result<T> {
    if let Err(FsError::Corruption { sector, detail }) = &result {
        error!("corruption at sector {}: {}", sector, detail);
        debug_assert!(false, "file system corruption at sector {}: {}", sector, detail);
    }
    result
}

impl FileSystem {
    /// Build an empty file system on `device`, overwriting whatever was there.
    pub fn format(device: Arc<dyn BlockDevice>) -> Result<Arc<Self>> {
        let disk = Arc::new(SynchDisk::new(device));
        let mut free_map = FreeMap::new(disk.num_sectors());
        for sector in [FREE_MAP_SECTOR, DIRECTORY_SECTOR, PIPE_SECTOR] {
            free_map.mark(sector)?;
        }
        let map_len = free_map.byte_len();
        let mut map_header = FileHeader::new();
        map_header.allocate(&mut free_map, map_len, &disk)?;
        let mut dir_header = FileHeader::new();
        dir_header.allocate(&mut free_map, DIRECTORY_FILE_SIZE, &disk)?;
        let pipe_header = FileHeader::new();

        map_header.write_back(FREE_MAP_SECTOR, &disk)?;
        dir_header.write_back(DIRECTORY_SECTOR, &disk)?;
        pipe_header.write_back(PIPE_SECTOR, &disk)?;
        free_map.write_back(&map_header, &disk)?;
        Directory::new(NUM_DIR_ENTRIES).write_back(&dir_header, &disk)?;
        debug!(
            "formatted {} sectors, {} free",
            disk.num_sectors(),
            free_map.count_free()
        );
        Ok(Arc::new(Self {
            disk,
            inner: MutexBlocking::new(FsInner {
                free_map_file: map_header,
            }),
            open_counts: Mutex::new(BTreeMap::new()),
        }))
    }

    /// Open the file system already stored on `device`.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Arc<Self>> {
        let disk = Arc::new(SynchDisk::new(device));
        let map_header = surface(FileHeader::fetch_from(FREE_MAP_SECTOR, &disk))?;
        let free_map = surface(FreeMap::fetch_from(&map_header, &disk))?;
        let dir_header = surface(FileHeader::fetch_from(DIRECTORY_SECTOR, &disk))?;
        surface(Directory::fetch_from(&dir_header, &disk))?;
        debug!(
            "mounted {} sectors, {} free",
            disk.num_sectors(),
            free_map.count_free()
        );
        Ok(Arc::new(Self {
            disk,
            inner: MutexBlocking::new(FsInner {
                free_map_file: map_header,
            }),
            open_counts: Mutex::new(BTreeMap::new()),
        }))
    }

    pub fn disk(&self) -> &Arc<SynchDisk> {
        &self.disk
    }

    fn load_free_map(&self, inner: &FsInner) -> Result<FreeMap> {
        FreeMap::fetch_from(&inner.free_map_file, &self.disk)
    }

    /// Walk `parts` from the root, each of which must name a directory.
    fn lookup_dir(&self, parts: &[&str], path: &str) -> Result<(FileHeader, Directory)> {
        let mut header = FileHeader::fetch_from(DIRECTORY_SECTOR, &self.disk)?;
        let mut dir = Directory::fetch_from(&header, &self.disk)?;
        for part in parts {
            let entry = dir
                .find_entry(part)
                .filter(|entry| entry.is_dir())
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            header = FileHeader::fetch_from(entry.sector(), &self.disk)?;
            dir = Directory::fetch_from(&header, &self.disk)?;
        }
        Ok((header, dir))
    }

    /// Header sector of `path` and whether it is a directory.
    fn resolve(&self, path: &str) -> Result<(SectorId, bool)> {
        let parts = components(path);
        let Some((leaf, parent)) = parts.split_last() else {
            return Ok((DIRECTORY_SECTOR, true));
        };
        let (_, dir) = self.lookup_dir(parent, path)?;
        dir.find_entry(leaf)
            .map(|entry| (entry.sector(), entry.is_dir()))
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    fn create_node(&self, path: &str, size: usize, is_dir: bool) -> Result<SectorId> {
        let parts = components(path);
        let Some((leaf, parent)) = parts.split_last() else {
            return Err(FsError::AlreadyExists(path.to_string()));
        };
        let inner = self.inner.lock();
        let (dir_header, mut dir) = self.lookup_dir(parent, path)?;
        if dir.find(leaf).is_some() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        let mut free_map = self.load_free_map(&inner)?;
        let size = if is_dir { DIRECTORY_FILE_SIZE } else { size };
        let sector = free_map.find_free().ok_or_else(|| FsError::OutOfSpace {
            needed: 1 + FileHeader::total_sectors_by_size(size),
            free: 0,
        })?;
        dir.add(leaf, sector, is_dir)?;
        let mut header = FileHeader::new();
        if !is_dir {
            header.set_file_type(leaf);
        }
        header.allocate(&mut free_map, size, &self.disk)?;
        header.write_back(sector, &self.disk)?;
        if is_dir {
            Directory::new(NUM_DIR_ENTRIES).write_back(&header, &self.disk)?;
        } else if size > 0 {
            header.write_at(0, &vec![0u8; size], &self.disk)?;
        }
        dir.write_back(&dir_header, &self.disk)?;
        free_map.write_back(&inner.free_map_file, &self.disk)?;
        debug!("created {} at sector {} ({} bytes)", path, sector, size);
        Ok(sector)
    }

    /// Create a file of `size` bytes, zero filled.
    pub fn create(&self, path: &str, size: usize) -> Result<()> {
        surface(self.create_node(path, size, false))
            .map(|_| ())
            .map_err(|err| {
                warn!("create {} failed: {}", path, err);
                err
            })
    }

    /// Create an empty directory.
    pub fn mkdir(&self, path: &str) -> Result<()> {
        surface(self.create_node(path, 0, true))
            .map(|_| ())
            .map_err(|err| {
                warn!("mkdir {} failed: {}", path, err);
                err
            })
    }

    /// Open `path` for reading and writing.
    pub fn open(self: &Arc<Self>, path: &str) -> Result<OpenFile> {
        self.open_with(path, OpenFlags::READ_WRITE)
    }

    pub fn open_with(self: &Arc<Self>, path: &str, flags: OpenFlags) -> Result<OpenFile> {
        let (readable, writable) = flags.read_write();
        if flags.contains(OpenFlags::CREATE) {
            match surface(self.create_node(path, 0, false)) {
                Ok(_) | Err(FsError::AlreadyExists(_)) => {}
                Err(err) => return Err(err),
            }
        }
        let inner = self.inner.lock();
        let (sector, is_dir) = surface(self.resolve(path))?;
        if is_dir && (writable || flags.contains(OpenFlags::TRUNC)) {
            return Err(FsError::PermissionDenied("directories cannot be written"));
        }
        if flags.contains(OpenFlags::TRUNC) {
            surface(self.truncate(&inner, sector, path))?;
        }
        debug!("open {} (sector {})", path, sector);
        Ok(OpenFile::new(Arc::clone(self), sector, readable, writable))
    }

    fn truncate(&self, inner: &FsInner, sector: SectorId, path: &str) -> Result<()> {
        let handles = self.handles(sector);
        if handles > 0 {
            return Err(FsError::InUse {
                path: path.to_string(),
                handles,
            });
        }
        let mut header = FileHeader::fetch_from(sector, &self.disk)?;
        let mut free_map = self.load_free_map(inner)?;
        header.deallocate(&mut free_map, &self.disk)?;
        header.touch_modify();
        header.write_back(sector, &self.disk)?;
        free_map.write_back(&inner.free_map_file, &self.disk)?;
        Ok(())
    }

    fn remove_node(&self, path: &str) -> Result<()> {
        let parts = components(path);
        let Some((leaf, parent)) = parts.split_last() else {
            return Err(FsError::PermissionDenied("cannot remove the root directory"));
        };
        let inner = self.inner.lock();
        let (dir_header, mut dir) = self.lookup_dir(parent, path)?;
        let entry = dir
            .find_entry(leaf)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let handles = self.handles(entry.sector());
        if handles > 0 {
            return Err(FsError::InUse {
                path: path.to_string(),
                handles,
            });
        }
        let mut header = FileHeader::fetch_from(entry.sector(), &self.disk)?;
        if entry.is_dir() && !Directory::fetch_from(&header, &self.disk)?.is_empty() {
            return Err(FsError::DirectoryNotEmpty(path.to_string()));
        }
        let mut free_map = self.load_free_map(&inner)?;
        header.deallocate(&mut free_map, &self.disk)?;
        free_map.clear(entry.sector()).map_err(|_| {
            FsError::corruption(entry.sector(), format!("header of {} is not allocated", path))
        })?;
        dir.remove(leaf)?;
        dir.write_back(&dir_header, &self.disk)?;
        free_map.write_back(&inner.free_map_file, &self.disk)?;
        debug!("removed {} (sector {})", path, entry.sector());
        Ok(())
    }

    /// Delete a file or an empty directory and release all of its sectors.
    pub fn remove(&self, path: &str) -> Result<()> {
        surface(self.remove_node(path)).map_err(|err| {
            warn!("remove {} failed: {}", path, err);
            err
        })
    }

    /// Entries of the directory at `path` as `(name, is_dir)`, in storage
    /// order.
    pub fn list(&self, path: &str) -> Result<Vec<(String, bool)>> {
        let _inner = self.inner.lock();
        surface(self.lookup_dir(&components(path), path)).map(|(_, dir)| {
            dir.list()
                .map(|entry| (entry.name().to_string(), entry.is_dir()))
                .collect()
        })
    }

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let _inner = self.inner.lock();
        let (sector, is_dir) = surface(self.resolve(path))?;
        let header = surface(FileHeader::fetch_from(sector, &self.disk))?;
        Ok(FileStat {
            sector,
            is_dir,
            size: header.byte_length(),
            sectors: header.sector_count(),
            data_sectors: surface(header.data_sectors(&self.disk))?,
            index_sectors: surface(header.index_sectors(&self.disk))?,
            file_type: header.file_type(),
            created: header.created(),
            accessed: header.accessed(),
            modified: header.modified(),
        })
    }

    pub fn free_sectors(&self) -> Result<usize> {
        let inner = self.inner.lock();
        surface(self.load_free_map(&inner)).map(|free_map| free_map.count_free())
    }

    /// Append `data` to the pipe buffer.
    pub fn pipe_push(&self, data: &[u8]) -> Result<()> {
        let inner = self.inner.lock();
        surface(self.pipe_push_locked(&inner, data))
    }

    fn pipe_push_locked(&self, inner: &FsInner, data: &[u8]) -> Result<()> {
        let mut header = FileHeader::fetch_from(PIPE_SECTOR, &self.disk)?;
        let mut free_map = self.load_free_map(inner)?;
        let old_length = header.byte_length();
        header.enlarge(&mut free_map, data.len(), &self.disk)?;
        header.write_at(old_length, data, &self.disk)?;
        header.touch_modify();
        header.write_back(PIPE_SECTOR, &self.disk)?;
        free_map.write_back(&inner.free_map_file, &self.disk)
    }

    /// Take the whole content of the pipe buffer, leaving it empty.
    pub fn pipe_pop(&self) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        surface(self.pipe_pop_locked(&inner))
    }

    fn pipe_pop_locked(&self, inner: &FsInner) -> Result<Vec<u8>> {
        let mut header = FileHeader::fetch_from(PIPE_SECTOR, &self.disk)?;
        let mut data = vec![0u8; header.byte_length()];
        header.read_at(0, &mut data, &self.disk)?;
        let mut free_map = self.load_free_map(inner)?;
        header.deallocate(&mut free_map, &self.disk)?;
        header.touch_access();
        header.write_back(PIPE_SECTOR, &self.disk)?;
        free_map.write_back(&inner.free_map_file, &self.disk)?;
        Ok(data)
    }

    /// Make room for `len` bytes at `offset` in the file whose header is at
    /// `sector`, zero filling any gap past the old end. Returns the updated
    /// header.
    pub(crate) fn reserve(&self, sector: SectorId, offset: usize, len: usize) -> Result<FileHeader> {
        let inner = self.inner.lock();
        surface(self.reserve_locked(&inner, sector, offset, len))
    }

    fn reserve_locked(
        &self,
        inner: &FsInner,
        sector: SectorId,
        offset: usize,
        len: usize,
    ) -> Result<FileHeader> {
        let mut header = FileHeader::fetch_from(sector, &self.disk)?;
        let old_length = header.byte_length();
        let end = offset.checked_add(len).ok_or(FsError::OutOfSpace {
            needed: usize::MAX,
            free: 0,
        })?;
        if end > old_length {
            let mut free_map = self.load_free_map(inner)?;
            header.enlarge(&mut free_map, end - old_length, &self.disk)?;
            if offset > old_length {
                header.write_at(old_length, &vec![0u8; offset - old_length], &self.disk)?;
            }
            free_map.write_back(&inner.free_map_file, &self.disk)?;
        }
        header.touch_modify();
        header.write_back(sector, &self.disk)?;
        Ok(header)
    }

    pub(crate) fn touch_access(&self, sector: SectorId) -> Result<()> {
        let _inner = self.inner.lock();
        let mut header = surface(FileHeader::fetch_from(sector, &self.disk))?;
        header.touch_access();
        header.write_back(sector, &self.disk)
    }

    /// Open handles on the file whose header is at `sector`.
    pub fn handles(&self, sector: SectorId) -> usize {
        self.open_counts.lock().get(&sector).copied().unwrap_or(0)
    }

    pub(crate) fn acquire_handle(&self, sector: SectorId) {
        *self.open_counts.lock().entry(sector).or_insert(0) += 1;
    }

    pub(crate) fn release_handle(&self, sector: SectorId) {
        let mut counts = self.open_counts.lock();
        if let Some(count) = counts.get_mut(&sector) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&sector);
            }
        }
    }
}

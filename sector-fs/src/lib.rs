//! Sector-addressed file system for a teaching operating system.
//!
//! Files are described by one-sector headers holding direct sector pointers
//! and, for larger files, a linked chain of indirection blocks. Sector
//! allocation is tracked by a free-space bitmap and all physical I/O goes
//! through [`SynchDisk`], which serializes device access, caches recently used
//! sectors and arbitrates readers and writers per sector.

pub mod bitmap;
pub mod block_dev;
pub mod directory;
pub mod error;
pub mod file_disk;
pub mod fs;
pub mod layout;
pub mod mem_disk;
pub mod mutex;
pub mod open_file;
pub mod semaphore;
pub mod synch_disk;

pub use bitmap::FreeMap;
pub use block_dev::{BlockDevice, DiskError, RequestDone};
pub use directory::Directory;
pub use error::{FsError, Result};
pub use file_disk::FileDisk;
pub use fs::{FileStat, FileSystem};
pub use layout::{FileHeader, IndexBlock};
pub use mem_disk::MemDisk;
pub use mutex::MutexBlocking;
pub use open_file::{OpenFile, OpenFlags};
pub use synch_disk::{DiskStats, SynchDisk};

/// Sector number on the device.
pub type SectorId = usize;

pub const SECTOR_SIZE: usize = 128;
pub const DEFAULT_NUM_SECTORS: usize = 1024;
pub const CACHE_SIZE: usize = 16;

/// Slots in a file header's direct table.
pub const NUM_DIRECT: usize = 22;
/// Data sectors a header addresses directly; the last direct slot is kept for
/// the first indirection block.
pub const DIRECT_DATA_COUNT: usize = NUM_DIRECT - 1;
/// Sector numbers held by one indirection block.
pub const INDEX_ENTRIES: usize = SECTOR_SIZE / 4;
/// Data sectors addressed by one indirection block; the last slot links the
/// next block of the chain.
pub const INDEX_DATA_ENTRIES: usize = INDEX_ENTRIES - 1;
pub const TYPE_TAG_LEN: usize = 8;

pub const NAME_LENGTH_LIMIT: usize = 9;
pub const DIRENTRY_SIZE: usize = 16;
pub const NUM_DIR_ENTRIES: usize = 10;
pub const DIRECTORY_FILE_SIZE: usize = DIRENTRY_SIZE * NUM_DIR_ENTRIES;

// Headers of the files the file system keeps open while mounted.
pub const FREE_MAP_SECTOR: SectorId = 0;
pub const DIRECTORY_SECTOR: SectorId = 1;
pub const PIPE_SECTOR: SectorId = 2;

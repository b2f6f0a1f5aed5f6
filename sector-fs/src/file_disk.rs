use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::block_dev::{BlockDevice, DiskError, RequestDone};
use crate::SECTOR_SIZE;

/// Disk image stored in a host file.
#[derive(Debug)]
pub struct FileDisk {
    file: File,
    sector_cnt: usize,
}

impl FileDisk {
    /// Create (or resize) the image at `path` to hold `sector_cnt` sectors.
    pub fn create(path: impl AsRef<Path>, sector_cnt: usize) -> Result<Self, DiskError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        file.set_len((sector_cnt * SECTOR_SIZE) as u64)?;
        Ok(Self { file, sector_cnt })
    }

    /// Open an existing image; its length decides the sector count.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DiskError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len() as usize;
        if len % SECTOR_SIZE != 0 {
            return Err(DiskError::BufferSize { size: len });
        }
        Ok(Self {
            file,
            sector_cnt: len / SECTOR_SIZE,
        })
    }

    fn offset_of(&self, block_idx: usize, len: usize) -> Result<u64, DiskError> {
        if block_idx >= self.sector_cnt {
            return Err(DiskError::OutOfRange {
                idx: block_idx,
                max: self.sector_cnt,
            });
        }
        if len != SECTOR_SIZE {
            return Err(DiskError::BufferSize { size: len });
        }
        Ok((block_idx * SECTOR_SIZE) as u64)
    }
}

impl BlockDevice for FileDisk {
    fn read_request(
        &self,
        block_idx: usize,
        buffer: &mut [u8],
        done: &dyn RequestDone,
    ) -> Result<(), DiskError> {
        let offset = self.offset_of(block_idx, buffer.len())?;
        self.file.read_exact_at(buffer, offset)?;
        done.request_done();
        Ok(())
    }

    fn write_request(
        &self,
        block_idx: usize,
        data: &[u8],
        done: &dyn RequestDone,
    ) -> Result<(), DiskError> {
        let offset = self.offset_of(block_idx, data.len())?;
        self.file.write_all_at(data, offset)?;
        done.request_done();
        Ok(())
    }

    fn num_blocks(&self) -> usize {
        self.sector_cnt
    }
}

use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

use crate::error::{FsError, Result};
use crate::fs::{surface, FileSystem};
use crate::layout::FileHeader;
use crate::SectorId;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ_ONLY = 0;
        const WRITE_ONLY = 1 << 0;
        const READ_WRITE = 1 << 1;
        const CREATE = 1 << 9;
        const TRUNC = 1 << 10;
    }
}

impl OpenFlags {
    /// `(readable, writable)` for these flags.
    pub fn read_write(&self) -> (bool, bool) {
        if self.is_empty() {
            (true, false)
        } else if self.contains(Self::WRITE_ONLY) {
            (false, true)
        } else {
            (true, true)
        }
    }
}

/// A handle on an open file with its own seek position.
///
/// While any handle on a file is alive the file cannot be removed or
/// truncated.
pub struct OpenFile {
    fs: Arc<FileSystem>,
    sector: SectorId,
    readable: bool,
    writable: bool,
    position: Mutex<usize>,
}

impl OpenFile {
    pub(crate) fn new(fs: Arc<FileSystem>, sector: SectorId, readable: bool, writable: bool) -> Self {
        fs.acquire_handle(sector);
        Self {
            fs,
            sector,
            readable,
            writable,
            position: Mutex::new(0),
        }
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Sector of the file header.
    pub fn sector(&self) -> SectorId {
        self.sector
    }

    fn header(&self) -> Result<FileHeader> {
        surface(FileHeader::fetch_from(self.sector, self.fs.disk()))
    }

    pub fn length(&self) -> Result<usize> {
        Ok(self.header()?.byte_length())
    }

    pub fn seek(&self, position: usize) {
        *self.position.lock() = position;
    }

    pub fn tell(&self) -> usize {
        *self.position.lock()
    }

    /// Read from `offset` without moving the seek position.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        if !self.readable {
            return Err(FsError::PermissionDenied("file not opened for reading"));
        }
        let read = surface(self.header()?.read_at(offset, buf, self.fs.disk()))?;
        self.fs.touch_access(self.sector)?;
        Ok(read)
    }

    /// Write at `offset` without moving the seek position, growing the file
    /// when the write runs past its end.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(FsError::PermissionDenied("file not opened for writing"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let header = self.fs.reserve(self.sector, offset, buf.len())?;
        surface(header.write_at(offset, buf, self.fs.disk()))
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut position = self.position.lock();
        let read = self.read_at(*position, buf)?;
        *position += read;
        Ok(read)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut position = self.position.lock();
        let written = self.write_at(*position, buf)?;
        *position += written;
        Ok(written)
    }

    /// Everything from the seek position to the end of the file.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut position = self.position.lock();
        let len = self.length()?.saturating_sub(*position);
        let mut data = vec![0u8; len];
        let read = self.read_at(*position, &mut data)?;
        data.truncate(read);
        *position += read;
        Ok(data)
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        self.fs.release_handle(self.sector);
    }
}

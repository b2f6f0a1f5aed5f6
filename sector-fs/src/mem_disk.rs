use core::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use spin::Mutex;

use crate::block_dev::{BlockDevice, DiskError, RequestDone};
use crate::SECTOR_SIZE;

/// Sector storage kept in memory. Counts every physical transfer it serves.
#[derive(Debug)]
pub struct MemDisk {
    sector_cnt: usize,
    data: Mutex<Vec<u8>>,
    latency: Option<Duration>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDisk {
    pub fn new(sector_cnt: usize) -> Self {
        assert!(sector_cnt > 0);
        Self {
            sector_cnt,
            data: Mutex::new(vec![0u8; sector_cnt * SECTOR_SIZE]),
            latency: None,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Make every request take at least `latency` before completing.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Physical reads served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Physical writes served so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self, sector_idx: usize, len: usize) -> Result<(usize, usize), DiskError> {
        if sector_idx >= self.sector_cnt {
            return Err(DiskError::OutOfRange {
                idx: sector_idx,
                max: self.sector_cnt,
            });
        }
        if len != SECTOR_SIZE {
            return Err(DiskError::BufferSize { size: len });
        }
        let start = sector_idx * SECTOR_SIZE;
        Ok((start, start + SECTOR_SIZE))
    }

    fn wait(&self) {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
    }
}

impl BlockDevice for MemDisk {
    fn read_request(
        &self,
        sector_idx: usize,
        buffer: &mut [u8],
        done: &dyn RequestDone,
    ) -> Result<(), DiskError> {
        let (start, end) = self.check(sector_idx, buffer.len())?;
        self.wait();
        buffer.copy_from_slice(&self.data.lock()[start..end]);
        self.reads.fetch_add(1, Ordering::SeqCst);
        done.request_done();
        Ok(())
    }

    fn write_request(
        &self,
        sector_idx: usize,
        data: &[u8],
        done: &dyn RequestDone,
    ) -> Result<(), DiskError> {
        let (start, end) = self.check(sector_idx, data.len())?;
        self.wait();
        self.data.lock()[start..end].copy_from_slice(data);
        self.writes.fetch_add(1, Ordering::SeqCst);
        done.request_done();
        Ok(())
    }

    fn num_blocks(&self) -> usize {
        self.sector_cnt
    }
}

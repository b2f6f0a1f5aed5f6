//! Synchronous, cached access to a [`BlockDevice`].
//!
//! Only one physical request is in flight at a time: a caller takes the
//! device lock, issues the request and sleeps until the device signals
//! completion. Recently read sectors are mirrored in a small cache; when the
//! cache is full the slot with the oldest access timestamp is replaced. A write
//! always reaches the device and drops every mirror of the sector it wrote.
//!
//! Independently of device serialization, each sector carries a reader count
//! and a writability permit. Callers that walk or rewrite multi-sector
//! structures bracket their accesses with [`SynchDisk::start_reader`] /
//! [`SynchDisk::end_reader`] or [`SynchDisk::start_writer`] /
//! [`SynchDisk::end_writer`] so that readers share a sector and writers own it.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

use log::{trace, warn};
use spin::Mutex;

use crate::block_dev::{BlockDevice, DiskError};
use crate::semaphore::Semaphore;
use crate::{SectorId, CACHE_SIZE, SECTOR_SIZE};

pub type SectorData = [u8; SECTOR_SIZE];

struct CacheSlot {
    valid: bool,
    sector: SectorId,
    timestamp: u64,
    data: SectorData,
}

impl CacheSlot {
    fn empty() -> Self {
        Self {
            valid: false,
            sector: 0,
            timestamp: 0,
            data: [0; SECTOR_SIZE],
        }
    }
}

struct SectorLock {
    mutex: Semaphore,
    reader_count: AtomicUsize,
    writable: Semaphore,
}

impl SectorLock {
    fn new() -> Self {
        Self {
            mutex: Semaphore::new(1),
            reader_count: AtomicUsize::new(0),
            writable: Semaphore::new(1),
        }
    }
}

/// Counters of the traffic a [`SynchDisk`] has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskStats {
    /// Physical reads issued to the device.
    pub reads: usize,
    /// Physical writes issued to the device.
    pub writes: usize,
    pub hits: usize,
    pub misses: usize,
}

pub struct SynchDisk {
    device: Arc<dyn BlockDevice>,
    num_sectors: usize,
    lock: Semaphore,
    request_done: Semaphore,
    cache: Mutex<Vec<CacheSlot>>,
    ticks: AtomicU64,
    sector_locks: Mutex<BTreeMap<SectorId, Arc<SectorLock>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl SynchDisk {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self::with_capacity(device, CACHE_SIZE)
    }

    /// A disk whose cache holds `cache_slots` sectors.
    pub fn with_capacity(device: Arc<dyn BlockDevice>, cache_slots: usize) -> Self {
        assert!(cache_slots > 0);
        let num_sectors = device.num_blocks();
        Self {
            device,
            num_sectors,
            lock: Semaphore::new(1),
            request_done: Semaphore::new(0),
            cache: Mutex::new((0..cache_slots).map(|_| CacheSlot::empty()).collect()),
            ticks: AtomicU64::new(0),
            sector_locks: Mutex::new(BTreeMap::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn num_sectors(&self) -> usize {
        self.num_sectors
    }

    pub fn stats(&self) -> DiskStats {
        DiskStats {
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
        }
    }

    fn check(&self, sector: SectorId) -> Result<(), DiskError> {
        if sector >= self.num_sectors {
            return Err(DiskError::OutOfRange {
                idx: sector,
                max: self.num_sectors,
            });
        }
        Ok(())
    }

    fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Copy of the cached mirror of `sector`, refreshing its timestamp.
    fn lookup(&self, sector: SectorId) -> Option<SectorData> {
        let mut cache = self.cache.lock();
        let slot = cache
            .iter_mut()
            .find(|slot| slot.valid && slot.sector == sector)?;
        slot.timestamp = self.tick();
        Some(slot.data)
    }

    fn insert(&self, sector: SectorId, data: &SectorData) {
        let mut cache = self.cache.lock();
        let victim = cache
            .iter()
            .position(|slot| slot.valid && slot.sector == sector)
            .or_else(|| cache.iter().position(|slot| !slot.valid))
            .or_else(|| {
                cache
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| slot.timestamp)
                    .map(|(idx, _)| idx)
            });
        if let Some(idx) = victim {
            let slot = &mut cache[idx];
            if slot.valid && slot.sector != sector {
                trace!("evict sector {} for {}", slot.sector, sector);
            }
            slot.valid = true;
            slot.sector = sector;
            slot.timestamp = self.tick();
            slot.data = *data;
        }
    }

    /// Read the contents of `sector`. A cache hit is served without touching
    /// the device.
    pub fn read_sector(&self, sector: SectorId) -> Result<SectorData, DiskError> {
        self.check(sector)?;
        if let Some(data) = self.lookup(sector) {
            trace!("hit {}", sector);
            self.hits.fetch_add(1, Ordering::SeqCst);
            return Ok(data);
        }
        // only one disk I/O at a time
        let _device = self.lock.acquire();
        // Another reader may have populated the slot while we waited.
        if let Some(data) = self.lookup(sector) {
            trace!("hit {} after wait", sector);
            self.hits.fetch_add(1, Ordering::SeqCst);
            return Ok(data);
        }
        trace!("miss {}", sector);
        self.misses.fetch_add(1, Ordering::SeqCst);
        let mut data = [0u8; SECTOR_SIZE];
        self.device
            .read_request(sector, &mut data, &self.request_done)?;
        self.request_done.down();
        self.reads.fetch_add(1, Ordering::SeqCst);
        // Still under the device lock, so no write can slip in between the
        // transfer and the insert.
        self.insert(sector, &data);
        Ok(data)
    }

    /// Write `data` to `sector` and drop every cached mirror of it.
    pub fn write_sector(&self, sector: SectorId, data: &SectorData) -> Result<(), DiskError> {
        self.check(sector)?;
        let _device = self.lock.acquire();
        self.device.write_request(sector, data, &self.request_done)?;
        self.request_done.down();
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.cache
            .lock()
            .iter_mut()
            .filter(|slot| slot.sector == sector)
            .for_each(|slot| slot.valid = false);
        Ok(())
    }

    /// Read `sector` under its reader permit and map `func` over the data.
    pub fn read<V>(&self, sector: SectorId, func: impl FnOnce(&SectorData) -> V) -> Result<V, DiskError> {
        let _reader = self.reader(sector);
        let data = self.read_sector(sector)?;
        Ok(func(&data))
    }

    /// Read-modify-write of `sector` under its writer permit.
    pub fn modify<V>(
        &self,
        sector: SectorId,
        func: impl FnOnce(&mut SectorData) -> V,
    ) -> Result<V, DiskError> {
        let _writer = self.writer(sector);
        let mut data = self.read_sector(sector)?;
        let ret = func(&mut data);
        self.write_sector(sector, &data)?;
        Ok(ret)
    }

    /// Overwrite `sector` entirely under its writer permit.
    pub fn replace(&self, sector: SectorId, data: &SectorData) -> Result<(), DiskError> {
        let _writer = self.writer(sector);
        self.write_sector(sector, data)
    }

    fn sector_lock(&self, sector: SectorId) -> Arc<SectorLock> {
        Arc::clone(
            self.sector_locks
                .lock()
                .entry(sector)
                .or_insert_with(|| Arc::new(SectorLock::new())),
        )
    }

    pub fn start_reader(&self, sector: SectorId) {
        let lock = self.sector_lock(sector);
        let _mutex = lock.mutex.acquire();
        let readers = lock.reader_count.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("sector {} reader count {}", sector, readers);
        if readers == 1 {
            lock.writable.down();
        }
    }

    pub fn end_reader(&self, sector: SectorId) {
        let lock = self.sector_lock(sector);
        let _mutex = lock.mutex.acquire();
        let readers = lock.reader_count.load(Ordering::SeqCst);
        if readers == 0 {
            warn!("end_reader on sector {} without a reader", sector);
            return;
        }
        lock.reader_count.store(readers - 1, Ordering::SeqCst);
        if readers == 1 {
            lock.writable.up();
        }
    }

    pub fn start_writer(&self, sector: SectorId) {
        self.sector_lock(sector).writable.down();
    }

    pub fn end_writer(&self, sector: SectorId) {
        self.sector_lock(sector).writable.up();
    }

    /// Reader permit on `sector`, released on drop.
    pub fn reader(&self, sector: SectorId) -> SectorGuard<'_> {
        self.start_reader(sector);
        SectorGuard {
            disk: self,
            sector,
            writer: false,
        }
    }

    /// Writer permit on `sector`, released on drop.
    pub fn writer(&self, sector: SectorId) -> SectorGuard<'_> {
        self.start_writer(sector);
        SectorGuard {
            disk: self,
            sector,
            writer: true,
        }
    }
}

pub struct SectorGuard<'a> {
    disk: &'a SynchDisk,
    sector: SectorId,
    writer: bool,
}

impl Drop for SectorGuard<'_> {
    fn drop(&mut self) {
        if self.writer {
            self.disk.end_writer(self.sector);
        } else {
            self.disk.end_reader(self.sector);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mem_disk::MemDisk;
    use core::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    fn disk(slots: usize) -> (Arc<MemDisk>, SynchDisk) {
        let mem = Arc::new(MemDisk::new(64));
        let disk = SynchDisk::with_capacity(Arc::clone(&mem) as Arc<dyn BlockDevice>, slots);
        (mem, disk)
    }

    #[test]
    fn hit_skips_device() -> Result<(), DiskError> {
        let (mem, disk) = disk(4);
        disk.write_sector(5, &[7; SECTOR_SIZE])?;
        assert_eq!(disk.read_sector(5)?, [7; SECTOR_SIZE]);
        assert_eq!(mem.reads(), 1);
        assert_eq!(disk.read_sector(5)?, [7; SECTOR_SIZE]);
        assert_eq!(mem.reads(), 1);
        let stats = disk.stats();
        assert_eq!((stats.hits, stats.misses, stats.reads), (1, 1, 1));
        Ok(())
    }

    #[test]
    fn write_invalidates_mirror() -> Result<(), DiskError> {
        let (mem, disk) = disk(4);
        disk.read_sector(3)?;
        disk.write_sector(3, &[9; SECTOR_SIZE])?;
        assert_eq!(mem.writes(), 1);
        assert_eq!(disk.read_sector(3)?, [9; SECTOR_SIZE]);
        assert_eq!(mem.reads(), 2);
        Ok(())
    }

    #[test]
    fn evicts_oldest_timestamp() -> Result<(), DiskError> {
        let (mem, disk) = disk(2);
        disk.read_sector(1)?;
        disk.read_sector(2)?;
        // touch 1 so that 2 becomes the oldest
        disk.read_sector(1)?;
        disk.read_sector(3)?;
        assert_eq!(mem.reads(), 3);
        disk.read_sector(1)?;
        assert_eq!(mem.reads(), 3);
        disk.read_sector(2)?;
        assert_eq!(mem.reads(), 4);
        Ok(())
    }

    #[test]
    fn out_of_range() {
        let (_, disk) = disk(2);
        assert!(matches!(
            disk.read_sector(64),
            Err(DiskError::OutOfRange { idx: 64, max: 64 })
        ));
    }

    #[test]
    fn modify_is_read_modify_write() -> Result<(), DiskError> {
        let (_, disk) = disk(2);
        disk.write_sector(4, &[1; SECTOR_SIZE])?;
        let old = disk.modify(4, |data| {
            let old = data[0];
            data[10] = 42;
            old
        })?;
        assert_eq!(old, 1);
        let data = disk.read_sector(4)?;
        assert_eq!((data[0], data[10]), (1, 42));
        Ok(())
    }

    #[test]
    fn concurrent_readers_agree() -> Result<(), DiskError> {
        let mem = Arc::new(MemDisk::new(16).with_latency(Duration::from_millis(5)));
        let disk = Arc::new(SynchDisk::new(mem as Arc<dyn BlockDevice>));
        disk.write_sector(6, &[0xab; SECTOR_SIZE])?;
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let disk = Arc::clone(&disk);
                thread::spawn(move || disk.read(6, |data| *data))
            })
            .collect();
        let seen: Vec<SectorData> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Result<_, _>>()?;
        assert_eq!(seen[0], seen[1]);
        assert_eq!(seen[0], [0xab; SECTOR_SIZE]);
        Ok(())
    }

    #[test]
    fn readers_share_permit() {
        let (_, disk) = disk(2);
        disk.start_reader(9);
        // a second reader of the same sector does not block
        disk.start_reader(9);
        disk.end_reader(9);
        disk.end_reader(9);
        // permit is free again
        disk.start_writer(9);
        disk.end_writer(9);
    }

    #[test]
    fn writer_waits_for_reader() {
        let (_, disk) = disk(2);
        let disk = Arc::new(disk);
        let written = Arc::new(AtomicBool::new(false));
        disk.start_reader(12);
        let handle = {
            let disk = Arc::clone(&disk);
            let written = Arc::clone(&written);
            thread::spawn(move || {
                disk.start_writer(12);
                disk.write_sector(12, &[1; SECTOR_SIZE]).unwrap();
                written.store(true, Ordering::SeqCst);
                disk.end_writer(12);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!written.load(Ordering::SeqCst));
        disk.end_reader(12);
        handle.join().unwrap();
        assert!(written.load(Ordering::SeqCst));
        assert_eq!(disk.read_sector(12).unwrap(), [1; SECTOR_SIZE]);
    }

    #[test]
    fn reader_waits_for_writer() {
        let (_, disk) = disk(2);
        let disk = Arc::new(disk);
        let entered = Arc::new(AtomicBool::new(false));
        disk.start_writer(8);
        let handle = {
            let disk = Arc::clone(&disk);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _reader = disk.reader(8);
                entered.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        disk.end_writer(8);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}

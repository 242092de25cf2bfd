mod scheduler;
mod slot;

use crate::disk_manager::{BlockDevice, SectorId, SECTOR_SIZE};
use crate::errors::Error;
use crate::{get_caller_name, printdbg};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use scheduler::IoScheduler;
use slot::{CacheSlot, SlotFlags};
use std::sync::Arc;

pub const CACHE_SIZE: usize = 64;

/// How many label-mismatch retries a caller tolerates before the sector is
/// declared unreadable.
const ACQUIRE_ATTEMPTS: usize = 3;

/// Slot-table directory: which sector each slot holds, who is holding a
/// reference, and the eviction clock hand. One mutex covers the lot; the
/// per-slot state lives behind each slot's own lock.
pub(crate) struct Directory {
    pub(crate) sectors: Vec<Option<SectorId>>,
    refs: Vec<u32>,
    evict_ptr: usize,
}

impl Directory {
    fn lookup(&self, sector: SectorId) -> Option<usize> {
        self.sectors.iter().position(|s| *s == Some(sector))
    }
}

/// Fixed-size buffered cache over a block device: sector-granular reads and
/// writes, clock eviction, speculative read-ahead and asynchronous
/// write-back through a single background worker.
pub struct DiskCache {
    sched: IoScheduler,
    device: Arc<dyn BlockDevice>,
    slots: Arc<Vec<CacheSlot>>,
    dir: Arc<Mutex<Directory>>,
}

impl DiskCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = Arc::new((0..CACHE_SIZE).map(|_| CacheSlot::new()).collect::<Vec<_>>());
        let dir = Arc::new(Mutex::new(Directory {
            sectors: vec![None; CACHE_SIZE],
            refs: vec![0; CACHE_SIZE],
            evict_ptr: 0,
        }));
        let sched = IoScheduler::spawn(device.clone(), slots.clone(), dir.clone());

        Self {
            sched,
            device,
            slots,
            dir,
        }
    }

    /// Copy `dst.len()` bytes out of `sector` starting at `offset`,
    /// loading the sector first if needed.
    pub fn read(&self, sector: SectorId, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(sector, offset, dst.len())?;
        if dst.is_empty() {
            return Ok(());
        }

        let slot = self.acquire(sector)?;
        {
            let mut state = self.slots[slot].state.lock();
            dst.copy_from_slice(&state.data[offset..offset + dst.len()]);
            state.flags.insert(SlotFlags::ACCESSED);
        }
        self.release_ref(slot);
        Ok(())
    }

    /// Copy `src` into `sector` at `offset`, loading the sector first if
    /// needed. The write lands in the cache; the device copy follows on
    /// eviction or [`flush_all`](Self::flush_all).
    pub fn write(&self, sector: SectorId, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(sector, offset, src.len())?;
        if src.is_empty() {
            return Ok(());
        }

        let slot = self.acquire(sector)?;
        {
            let mut state = self.slots[slot].state.lock();
            state.data[offset..offset + src.len()].copy_from_slice(src);
            state.flags.insert(SlotFlags::DIRTY | SlotFlags::ACCESSED);
        }
        self.release_ref(slot);
        Ok(())
    }

    /// Fill `sector` with zeros without reading the device copy.
    pub fn zero(&self, sector: SectorId) -> Result<()> {
        if sector >= self.device.size() {
            return Err(anyhow!(Error::IoFailure(format!(
                "sector {sector} out of range"
            ))));
        }

        let mut attempts = 0;
        loop {
            let mut dir = self.dir.lock();
            if let Some(slot) = dir.lookup(sector) {
                dir.refs[slot] += 1;
                drop(dir);
                self.wait_ready(slot);

                let mut dir = self.dir.lock();
                if dir.sectors[slot] != Some(sector) {
                    // re-labeled by a failed load; try again
                    dir.refs[slot] -= 1;
                    drop(dir);
                    attempts += 1;
                    if attempts >= ACQUIRE_ATTEMPTS {
                        return Err(anyhow!(Error::IoFailure(format!(
                            "sector {sector} kept disappearing"
                        ))));
                    }
                    continue;
                }
                let mut state = self.slots[slot].state.lock();
                state.data = [0u8; SECTOR_SIZE];
                state.flags.insert(SlotFlags::DIRTY | SlotFlags::ACCESSED);
                drop(state);
                dir.refs[slot] -= 1;
                return Ok(());
            }

            // miss: no device read needed, the slot is ready immediately
            match self.evict_slot(&mut dir) {
                Some(slot) => {
                    dir.sectors[slot] = Some(sector);
                    let mut state = self.slots[slot].state.lock();
                    state.data = [0u8; SECTOR_SIZE];
                    state.flags = SlotFlags::DIRTY | SlotFlags::ACCESSED;
                    return Ok(());
                }
                None => {
                    drop(dir);
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Synchronously write back every dirty, unpinned slot. Best effort:
    /// slots mid-I/O are skipped.
    pub fn flush_all(&self) -> Result<()> {
        let dir = self.dir.lock();
        for slot in 0..CACHE_SIZE {
            let Some(sector) = dir.sectors[slot] else {
                continue;
            };
            let Some(mut state) = self.slots[slot].state.try_lock() else {
                continue;
            };
            if state.flags.contains(SlotFlags::DIRTY) && !state.flags.contains(SlotFlags::PINNED) {
                self.device.write(sector, &state.data)?;
                state.flags.remove(SlotFlags::DIRTY);
            }
        }
        Ok(())
    }

    /// Resolve `sector` to a ready slot, holding one reference on it.
    /// Misses reserve a slot through the eviction clock, label it while the
    /// directory lock is still held, and queue the read plus a speculative
    /// read of the next sector.
    fn acquire(&self, sector: SectorId) -> Result<usize> {
        let mut attempts = 0;
        loop {
            let mut dir = self.dir.lock();
            if let Some(slot) = dir.lookup(sector) {
                dir.refs[slot] += 1;
                drop(dir);
                self.wait_ready(slot);

                // The reference forbids relabeling, so the label can only
                // have changed if the load failed and the worker unlabeled
                // the slot while we waited.
                let mut dir = self.dir.lock();
                if dir.sectors[slot] == Some(sector) {
                    return Ok(slot);
                }
                dir.refs[slot] -= 1;
                drop(dir);
                attempts += 1;
                if attempts >= ACQUIRE_ATTEMPTS {
                    return Err(anyhow!(Error::IoFailure(format!(
                        "sector {sector} failed to load"
                    ))));
                }
                continue;
            }

            match self.evict_slot(&mut dir) {
                Some(slot) => {
                    printdbg!(
                        "{} loading sector {sector} into slot {slot}",
                        get_caller_name!()
                    );
                    dir.sectors[slot] = Some(sector);
                    {
                        let mut state = self.slots[slot].state.lock();
                        state.flags = SlotFlags::UNREADY | SlotFlags::PINNED;
                    }
                    self.sched.enqueue_read(sector, slot);
                    self.read_ahead(&mut dir, sector + 1);
                    // fall through to the hit path to take the reference
                }
                None => {
                    drop(dir);
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Speculatively start loading `sector`. Skipped past the end of the
    /// device and when no slot is free without blocking; a miss here costs
    /// nothing but the lost prefetch.
    fn read_ahead(&self, dir: &mut Directory, sector: SectorId) {
        if sector >= self.device.size() || dir.lookup(sector).is_some() {
            return;
        }
        if let Some(slot) = self.evict_slot(dir) {
            dir.sectors[slot] = Some(sector);
            {
                let mut state = self.slots[slot].state.lock();
                state.flags = SlotFlags::UNREADY | SlotFlags::PINNED;
            }
            self.sched.enqueue_read(sector, slot);
        }
    }

    /// Clock sweep for a reusable slot. Runs with the directory locked;
    /// slot locks are only tried, never waited on.
    ///
    /// Returns the victim still labeled with its old sector; the caller
    /// relabels under the same directory lock.
    fn evict_slot(&self, dir: &mut Directory) -> Option<usize> {
        for _ in 0..2 * CACHE_SIZE {
            let slot = dir.evict_ptr;
            dir.evict_ptr = (dir.evict_ptr + 1) % CACHE_SIZE;

            if dir.refs[slot] > 0 {
                continue;
            }
            let Some(mut state) = self.slots[slot].state.try_lock() else {
                continue;
            };
            if state.flags.contains(SlotFlags::PINNED) {
                continue;
            }
            if state.flags.contains(SlotFlags::DIRTY) {
                // protect the slot across the lock gap until the worker
                // has written it out
                state.flags.insert(SlotFlags::PINNED);
                let sector = dir.sectors[slot].expect("dirty slot without a sector");
                drop(state);
                self.sched.enqueue_write(sector, slot);
                continue;
            }
            if state.flags.contains(SlotFlags::ACCESSED) {
                state.flags.remove(SlotFlags::ACCESSED);
                continue;
            }
            return Some(slot);
        }
        None
    }

    fn wait_ready(&self, slot: usize) {
        let mut state = self.slots[slot].state.lock();
        while state.flags.contains(SlotFlags::UNREADY) {
            self.slots[slot].ready.wait(&mut state);
        }
    }

    fn release_ref(&self, slot: usize) {
        self.dir.lock().refs[slot] -= 1;
    }

    fn check_range(&self, sector: SectorId, offset: usize, len: usize) -> Result<()> {
        if offset + len > SECTOR_SIZE {
            return Err(anyhow!(Error::Internal(format!(
                "cache access [{offset}, {}) beyond sector size",
                offset + len
            ))));
        }
        if sector >= self.device.size() {
            return Err(anyhow!(Error::IoFailure(format!(
                "sector {sector} out of range"
            ))));
        }
        Ok(())
    }

    #[cfg(test)]
    fn reads_enqueued(&self) -> u64 {
        self.sched.reads_enqueued()
    }

    #[cfg(test)]
    fn serviced_count(&self) -> usize {
        self.sched.serviced().len()
    }

    /// Label a slot and queue its read without waiting or read-ahead.
    #[cfg(test)]
    fn start_read(&self, sector: SectorId) {
        loop {
            let mut dir = self.dir.lock();
            if dir.lookup(sector).is_some() {
                return;
            }
            if let Some(slot) = self.evict_slot(&mut dir) {
                dir.sectors[slot] = Some(sector);
                let mut state = self.slots[slot].state.lock();
                state.flags = SlotFlags::UNREADY | SlotFlags::PINNED;
                drop(state);
                self.sched.enqueue_read(sector, slot);
                return;
            }
            drop(dir);
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_manager::MemDisk;
    use parking_lot::Condvar;
    use std::collections::HashSet;
    use std::time::Duration;

    fn test_cache(sectors: u64) -> (DiskCache, Arc<MemDisk>) {
        let device = Arc::new(MemDisk::new(sectors));
        (DiskCache::new(device.clone()), device)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("condition never became true");
    }

    /// A device that can hold selected reads hostage, recording the order
    /// in which reads arrive.
    struct GatedDisk {
        inner: MemDisk,
        gate: Mutex<HashSet<SectorId>>,
        released: Condvar,
        reads: Mutex<Vec<SectorId>>,
    }

    impl GatedDisk {
        fn new(sectors: u64) -> Self {
            Self {
                inner: MemDisk::new(sectors),
                gate: Mutex::new(HashSet::new()),
                released: Condvar::new(),
                reads: Mutex::new(Vec::new()),
            }
        }

        fn block(&self, sector: SectorId) {
            self.gate.lock().insert(sector);
        }

        fn release(&self, sector: SectorId) {
            self.gate.lock().remove(&sector);
            self.released.notify_all();
        }

        fn reads(&self) -> Vec<SectorId> {
            self.reads.lock().clone()
        }
    }

    impl BlockDevice for GatedDisk {
        fn read(&self, sector: SectorId, buf: &mut [u8]) -> Result<()> {
            self.reads.lock().push(sector);
            let mut gate = self.gate.lock();
            while gate.contains(&sector) {
                self.released.wait(&mut gate);
            }
            drop(gate);
            self.inner.read(sector, buf)
        }

        fn write(&self, sector: SectorId, buf: &[u8]) -> Result<()> {
            self.inner.write(sector, buf)
        }

        fn size(&self) -> u64 {
            self.inner.size()
        }
    }

    #[test]
    fn test_write_then_read_back() -> Result<()> {
        let (cache, _) = test_cache(16);
        let data = [0xABu8; 100];
        cache.write(3, 40, &data)?;

        let mut out = [0u8; 100];
        cache.read(3, 40, &mut out)?;
        assert_eq!(out, data);
        Ok(())
    }

    #[test]
    fn test_sector_boundary() -> Result<()> {
        let (cache, _) = test_cache(16);
        let mut one = [0u8; 1];
        let mut two = [0u8; 2];
        cache.read(0, SECTOR_SIZE - 1, &mut one)?;
        assert!(cache.read(0, SECTOR_SIZE - 1, &mut two).is_err());
        assert!(cache.write(0, SECTOR_SIZE - 1, &[0, 0]).is_err());
        cache.write(0, SECTOR_SIZE - 1, &[7])?;
        Ok(())
    }

    #[test]
    fn test_round_trip_survives_eviction() -> Result<()> {
        use rand::RngCore;

        let (cache, device) = test_cache(512);
        let mut data = [0u8; SECTOR_SIZE];
        rand::thread_rng().fill_bytes(&mut data);
        cache.write(5, 0, &data)?;

        // touch enough sectors to cycle sector 5 out of all 64 slots
        let mut scratch = [0u8; 8];
        for sector in 100..300 {
            cache.read(sector, 0, &mut scratch)?;
        }

        let mut out = [0u8; SECTOR_SIZE];
        cache.read(5, 0, &mut out)?;
        assert_eq!(out, data);

        // whatever was still dirty goes out now; the device copy matches
        cache.flush_all()?;
        let mut on_disk = [0u8; SECTOR_SIZE];
        device.read(5, &mut on_disk)?;
        assert_eq!(on_disk, data);
        Ok(())
    }

    #[test]
    fn test_zero_discards_device_content() -> Result<()> {
        let (cache, device) = test_cache(16);
        device.write(9, &[0xFFu8; SECTOR_SIZE])?;

        cache.zero(9)?;
        let mut out = [1u8; 32];
        cache.read(9, 0, &mut out)?;
        assert_eq!(out, [0u8; 32]);

        // zeroing is a modification: flush carries it to the device
        cache.flush_all()?;
        let mut on_disk = [1u8; SECTOR_SIZE];
        device.read(9, &mut on_disk)?;
        assert_eq!(on_disk, [0u8; SECTOR_SIZE]);
        Ok(())
    }

    #[test]
    fn test_concurrent_readers_single_request() -> Result<()> {
        let (cache, device) = test_cache(64);
        let mut pattern = [0u8; SECTOR_SIZE];
        for (i, byte) in pattern.iter_mut().enumerate() {
            *byte = (i % 7) as u8 + 1;
        }
        device.write(42, &pattern)?;

        let cache = Arc::new(cache);
        let mut handles = Vec::new();
        for _ in 0..2 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || -> Result<Vec<u8>> {
                let mut out = vec![0u8; SECTOR_SIZE];
                cache.read(42, 0, &mut out)?;
                Ok(out)
            }));
        }
        for handle in handles {
            let out = handle.join().unwrap()?;
            assert_eq!(out[..], pattern[..]);
        }

        // one request for sector 42 plus the read-ahead of 43
        assert_eq!(cache.reads_enqueued(), 2);
        Ok(())
    }

    #[test]
    fn test_elevator_services_ascending() {
        let device = Arc::new(GatedDisk::new(32));
        let cache = DiskCache::new(device.clone());

        device.block(8);
        cache.start_read(8);
        wait_until(|| device.reads().contains(&8));

        // enqueued descending while the worker is stuck on 8
        cache.start_read(12);
        cache.start_read(3);
        device.release(8);

        wait_until(|| cache.serviced_count() >= 3);
        assert_eq!(device.reads(), vec![8, 3, 12]);
    }

    #[test]
    fn test_read_ahead_stops_at_device_end() -> Result<()> {
        let (cache, _) = test_cache(4);
        let mut out = [0u8; 4];
        // no sector 4 exists; the read-ahead must simply not happen
        cache.read(3, 0, &mut out)?;
        assert_eq!(cache.reads_enqueued(), 1);
        Ok(())
    }

    #[test]
    fn test_read_ahead_covers_next_sector() -> Result<()> {
        let (cache, device) = test_cache(64);
        device.write(21, &[0x11u8; SECTOR_SIZE])?;

        let mut out = [0u8; 1];
        cache.read(20, 0, &mut out)?;
        assert_eq!(cache.reads_enqueued(), 2);

        // 21 is already resident: reading it adds no new request
        wait_until(|| cache.serviced_count() >= 2);
        cache.read(21, 0, &mut out)?;
        assert_eq!(out[0], 0x11);
        assert_eq!(cache.reads_enqueued(), 2);
        Ok(())
    }
}

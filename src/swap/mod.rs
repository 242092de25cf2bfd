use crate::disk_manager::{BlockDevice, SectorId, SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::pages::Page;
use anyhow::Result;
use arrayvec::ArrayVec;
use parking_lot::Mutex;
use std::sync::Arc;

pub type SwapSlot = u64;

struct SwapMap {
    /// One bit per slot, set = in use.
    bits: Vec<u64>,
    slots: u64,
}

impl SwapMap {
    fn first_fit(&mut self) -> Option<SwapSlot> {
        for (word_idx, word) in self.bits.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as u64;
            let slot = word_idx as u64 * 64 + bit;
            if slot >= self.slots {
                return None;
            }
            *word |= 1 << bit;
            return Some(slot);
        }
        None
    }

    fn clear(&mut self, slot: SwapSlot) {
        assert!(slot < self.slots, "swap slot {slot} out of range");
        let mask = 1u64 << (slot % 64);
        let word = &mut self.bits[(slot / 64) as usize];
        assert!(*word & mask != 0, "swap slot {slot} already free");
        *word &= !mask;
    }

    fn is_set(&self, slot: SwapSlot) -> bool {
        self.bits[(slot / 64) as usize] & (1 << (slot % 64)) != 0
    }
}

/// Bitmap-managed page slots over a block device. One slot holds exactly
/// one page, laid out as [`SECTORS_PER_PAGE`] consecutive sectors.
///
/// The mutex covers the bitmap *and* the slot I/O so that a freed slot can
/// never be re-allocated while its page is still being read out.
pub struct SwapDevice {
    device: Arc<dyn BlockDevice>,
    map: Mutex<SwapMap>,
}

impl SwapDevice {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = device.size() / SECTORS_PER_PAGE as u64;
        Self {
            device,
            map: Mutex::new(SwapMap {
                bits: vec![0u64; ((slots + 63) / 64) as usize],
                slots,
            }),
        }
    }

    /// First-fit scan for a free slot. `None` means the swap device is full,
    /// which the eviction path treats as fatal.
    pub fn alloc(&self) -> Option<SwapSlot> {
        self.map.lock().first_fit()
    }

    pub fn free(&self, slot: SwapSlot) {
        self.map.lock().clear(slot);
    }

    /// Write one page into `slot`, sector by sector.
    pub fn write(&self, slot: SwapSlot, page: &Page) -> Result<()> {
        let map = self.map.lock();
        assert!(map.is_set(slot), "writing to free swap slot {slot}");
        for (i, sector) in Self::slot_sectors(slot).into_iter().enumerate() {
            let start = i * SECTOR_SIZE;
            self.device
                .write(sector, page.read_bytes(start, start + SECTOR_SIZE))?;
        }
        Ok(())
    }

    /// Read one page out of `slot` and release the slot.
    pub fn read(&self, slot: SwapSlot, page: &mut Page) -> Result<()> {
        let mut map = self.map.lock();
        assert!(map.is_set(slot), "reading from free swap slot {slot}");
        for (i, sector) in Self::slot_sectors(slot).into_iter().enumerate() {
            let start = i * SECTOR_SIZE;
            self.device.read(
                sector,
                &mut page.as_bytes_mut()[start..start + SECTOR_SIZE],
            )?;
        }
        map.clear(slot);
        Ok(())
    }

    fn slot_sectors(slot: SwapSlot) -> ArrayVec<SectorId, SECTORS_PER_PAGE> {
        let base = slot * SECTORS_PER_PAGE as u64;
        (base..base + SECTORS_PER_PAGE as u64).collect()
    }

    #[cfg(test)]
    pub fn used_slots(&self) -> u64 {
        let map = self.map.lock();
        (0..map.slots).filter(|s| map.is_set(*s)).count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_manager::MemDisk;

    fn test_swap(slots: u64) -> SwapDevice {
        SwapDevice::new(Arc::new(MemDisk::new(slots * SECTORS_PER_PAGE as u64)))
    }

    #[test]
    fn test_alloc_free_first_fit() {
        let swap = test_swap(4);
        assert_eq!(swap.alloc(), Some(0));
        assert_eq!(swap.alloc(), Some(1));
        assert_eq!(swap.alloc(), Some(2));
        swap.free(1);
        // lowest free slot wins
        assert_eq!(swap.alloc(), Some(1));
        assert_eq!(swap.alloc(), Some(3));
        assert_eq!(swap.alloc(), None);
    }

    #[test]
    fn test_page_round_trip_frees_slot() -> Result<()> {
        let swap = test_swap(2);
        let slot = swap.alloc().unwrap();

        let mut page = Page::new();
        for i in 0..crate::pages::PAGE_SIZE {
            page.as_bytes_mut()[i] = (i % 256) as u8;
        }
        swap.write(slot, &page)?;
        assert_eq!(swap.used_slots(), 1);

        let mut out = Page::new();
        swap.read(slot, &mut out)?;
        assert_eq!(out.as_bytes()[..], page.as_bytes()[..]);
        // read releases the slot
        assert_eq!(swap.used_slots(), 0);
        Ok(())
    }

    #[test]
    #[should_panic]
    fn test_double_free_panics() {
        let swap = test_swap(2);
        let slot = swap.alloc().unwrap();
        swap.free(slot);
        swap.free(slot);
    }
}

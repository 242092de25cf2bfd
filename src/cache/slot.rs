use crate::disk_manager::SECTOR_SIZE;
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};

bitflags! {
    pub(super) struct SlotFlags: u8 {
        /// Touched since the clock hand last passed.
        const ACCESSED = 1 << 0;
        /// Buffer modified; cleared only by a successful write-back.
        const DIRTY    = 1 << 1;
        /// Protected from eviction while I/O or a lock gap is in flight.
        const PINNED   = 1 << 2;
        /// A background read is loading this slot; readers wait on `ready`.
        const UNREADY  = 1 << 3;
    }
}

pub(super) struct SlotState {
    pub flags: SlotFlags,
    pub data: [u8; SECTOR_SIZE],
}

/// One cache slot: its own lock over flags + buffer, and the condition
/// broadcast when an in-flight read clears `UNREADY`.
pub(super) struct CacheSlot {
    pub state: Mutex<SlotState>,
    pub ready: Condvar,
}

impl CacheSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                flags: SlotFlags::empty(),
                data: [0u8; SECTOR_SIZE],
            }),
            ready: Condvar::new(),
        }
    }
}

mod entry;

use crate::context::{Pid, Tid};
use crate::pages::{Page, VirtPage, PAGE_SIZE};
use crate::printdbg;
pub use entry::{FrameEntry, FrameUser};

pub type FrameId = usize;

/// Dense table over a contiguous run of physical frames. The entry array
/// and the page arena are parallel: entry `i` describes `pages[i]`.
///
/// The table charges itself for its own storage: the leading `own_used`
/// frames are permanently reserved and pinned, exactly as if the entry
/// array lived inside the managed region.
pub struct FrameTable {
    entries: Vec<FrameEntry>,
    pages: Vec<Page>,
    /// Number of non-free entries, own storage included.
    used: usize,
    /// Frames charged for the table's own storage.
    own_used: usize,
    /// Next entry to inspect when searching for a free frame.
    search_ptr: usize,
    /// Clock hand for eviction, separate from the free-search cursor.
    evict_ptr: usize,
}

impl FrameTable {
    pub fn new(size: usize) -> Self {
        let own_used = (size * std::mem::size_of::<FrameEntry>()).div_ceil(PAGE_SIZE);
        assert!(
            own_used < size,
            "frame table of {size} frames cannot hold its own storage"
        );

        let mut entries = vec![FrameEntry::new(FrameUser::Free, false); size];
        for entry in entries.iter_mut().take(own_used) {
            // never evict the table's own frames
            *entry = FrameEntry::new(FrameUser::Reserved, true);
        }

        Self {
            entries,
            pages: vec![Page::new(); size],
            used: own_used,
            own_used,
            search_ptr: 0,
            evict_ptr: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_full(&self) -> bool {
        self.used == self.entries.len()
    }

    /// Claim a free frame, if any. The returned frame is `Reserved`: it is
    /// excluded from eviction until [`install`](Self::install) attaches it
    /// to a process or [`release`](Self::release) gives it back.
    pub fn allocate_free(&mut self) -> Option<FrameId> {
        if self.is_full() {
            return None;
        }
        loop {
            let frame = self.search_ptr;
            self.search_ptr = (self.search_ptr + 1) % self.entries.len();
            if self.entries[frame].is_free() {
                self.entries[frame].set_user(FrameUser::Reserved);
                self.used += 1;
                printdbg!("### free frame {frame} (used: {}) ###", self.used);
                return Some(frame);
            }
        }
    }

    /// Finalize a frame after the caller populated it and mapped it.
    pub fn install(&mut self, frame: FrameId, pid: Pid, tid: Tid, vpage: VirtPage) {
        assert_eq!(
            self.entries[frame].user(),
            FrameUser::Reserved,
            "installing over an unreserved frame"
        );
        self.entries[frame].set_user(FrameUser::Mapped { pid, tid, vpage });
    }

    /// Give a frame back. Pinned frames may never be released.
    pub fn release(&mut self, frame: FrameId) {
        assert!(
            !self.entries[frame].is_pinned(),
            "releasing pinned frame {frame}"
        );
        assert!(!self.entries[frame].is_free());
        self.entries[frame].set_user(FrameUser::Free);
        self.used -= 1;
    }

    /// Demote a mapped frame back to the reserved sentinel. The eviction
    /// path uses this on its victim before handing the frame out again.
    pub fn reset_to_reserved(&mut self, frame: FrameId) {
        self.entries[frame].set_user(FrameUser::Reserved);
    }

    pub fn set_pin(&mut self, frame: FrameId, pin: bool) {
        self.entries[frame].set_pinned(pin);
    }

    pub fn entry(&self, frame: FrameId) -> &FrameEntry {
        &self.entries[frame]
    }

    pub fn page(&self, frame: FrameId) -> &Page {
        &self.pages[frame]
    }

    pub fn page_mut(&mut self, frame: FrameId) -> &mut Page {
        &mut self.pages[frame]
    }

    /// Advance the clock hand and return the entry it passed over.
    pub fn tick_clock(&mut self) -> FrameId {
        let frame = self.evict_ptr;
        self.evict_ptr = (self.evict_ptr + 1) % self.entries.len();
        frame
    }

    #[cfg(test)]
    pub fn inspect(&self) {
        println!("used: {} / {}", self.used, self.entries.len());
        for (i, e) in self.entries.iter().enumerate() {
            println!("  frame {i}: {:?} pinned: {}", e.user(), e.is_pinned());
        }
    }

    #[cfg(test)]
    pub fn own_used(&self) -> usize {
        self.own_used
    }
}

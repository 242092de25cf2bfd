use crate::errors::Error;
use crate::fs::FileHandle;
use crate::pages::{is_page_aligned, VirtPage, PAGE_SIZE};
use crate::swap::SwapSlot;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// The authoritative source for a page's contents while it is not present.
pub enum Backing {
    ZeroFill,
    FileBacked {
        file: Arc<dyn FileHandle>,
        offset: u64,
        /// Bytes to read from the file; the rest of the page is zero padding.
        size: usize,
    },
    Swapped {
        slot: SwapSlot,
    },
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backing::ZeroFill => write!(f, "ZeroFill"),
            Backing::FileBacked { offset, size, .. } => {
                write!(f, "FileBacked(ofs: {offset}, size: {size})")
            }
            Backing::Swapped { slot } => write!(f, "Swapped(slot: {slot})"),
        }
    }
}

#[derive(Debug)]
pub struct SpageEntry {
    pub backing: Backing,
    pub writable: bool,
    pub mmap: bool,
}

/// Per-process supplementary page table, keyed by page-aligned virtual
/// address. Describes how to materialize every page that is mapped but
/// not present.
#[derive(Default)]
pub struct SpageTable {
    entries: HashMap<VirtPage, SpageEntry>,
}

impl SpageTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Map a page of zeros at `vpage`.
    pub fn map_zero(&mut self, vpage: VirtPage, writable: bool) -> Result<()> {
        self.insert(
            vpage,
            SpageEntry {
                backing: Backing::ZeroFill,
                writable,
                mmap: false,
            },
        )
    }

    /// Map up to one page of `file` at `vpage`, `size` bytes read from
    /// `offset` and the rest zero padding. Segment pages are never written
    /// back to their file.
    pub fn map_segment(
        &mut self,
        file: Arc<dyn FileHandle>,
        offset: u64,
        vpage: VirtPage,
        writable: bool,
        size: usize,
    ) -> Result<()> {
        self.map_file(file, offset, vpage, writable, size, false)
    }

    /// Like [`map_segment`](Self::map_segment), but dirty pages are written
    /// back to the file on eviction and unmap.
    pub fn map_mmap(
        &mut self,
        file: Arc<dyn FileHandle>,
        offset: u64,
        vpage: VirtPage,
        writable: bool,
        size: usize,
    ) -> Result<()> {
        self.map_file(file, offset, vpage, writable, size, true)
    }

    fn map_file(
        &mut self,
        file: Arc<dyn FileHandle>,
        offset: u64,
        vpage: VirtPage,
        writable: bool,
        size: usize,
        mmap: bool,
    ) -> Result<()> {
        if size == 0 || size > PAGE_SIZE {
            return Err(anyhow!(Error::BadMapping(vpage)));
        }
        self.insert(
            vpage,
            SpageEntry {
                backing: Backing::FileBacked { file, offset, size },
                writable,
                mmap,
            },
        )
    }

    /// Record that an evicted page now lives in a swap slot.
    pub fn map_swapped(&mut self, vpage: VirtPage, slot: SwapSlot) -> Result<()> {
        self.insert(
            vpage,
            SpageEntry {
                backing: Backing::Swapped { slot },
                writable: true,
                mmap: false,
            },
        )
    }

    fn insert(&mut self, vpage: VirtPage, entry: SpageEntry) -> Result<()> {
        if !is_page_aligned(vpage) {
            return Err(anyhow!(Error::BadMapping(vpage)));
        }
        if self.entries.contains_key(&vpage) {
            return Err(anyhow!(Error::BadMapping(vpage)));
        }
        self.entries.insert(vpage, entry);
        Ok(())
    }

    pub fn get(&self, vpage: VirtPage) -> Option<&SpageEntry> {
        self.entries.get(&vpage)
    }

    pub fn remove(&mut self, vpage: VirtPage) -> Option<SpageEntry> {
        self.entries.remove(&vpage)
    }

    pub fn contains(&self, vpage: VirtPage) -> bool {
        self.entries.contains_key(&vpage)
    }

    pub fn drain(&mut self) -> Vec<(VirtPage, SpageEntry)> {
        self.entries.drain().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

use crate::errors::Error;
use crate::frame_table::FrameId;
use crate::pages::VirtPage;
use anyhow::{anyhow, Result};
use bitflags::bitflags;
use std::collections::HashMap;

bitflags! {
    pub struct PteFlags: u8 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const ACCESSED = 1 << 2;
        const DIRTY    = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Pte {
    pub frame: FrameId,
    pub flags: PteFlags,
}

/// Hardware page-table stand-in for one process: present/writable bits
/// plus the accessed and dirty bits the eviction clock consults.
#[derive(Default)]
pub struct PageDirectory {
    entries: HashMap<VirtPage, Pte>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Install a present mapping. The page must not be mapped yet.
    pub fn install(&mut self, vpage: VirtPage, frame: FrameId, writable: bool) -> Result<()> {
        if self.entries.contains_key(&vpage) {
            return Err(anyhow!(Error::BadMapping(vpage)));
        }
        let mut flags = PteFlags::PRESENT;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        self.entries.insert(vpage, Pte { frame, flags });
        Ok(())
    }

    /// Mark the page not-present and hand back its final entry state.
    /// Eviction calls this first so the owner cannot re-dirty the page
    /// while the victim is written out.
    pub fn clear(&mut self, vpage: VirtPage) -> Option<Pte> {
        self.entries.remove(&vpage)
    }

    pub fn get(&self, vpage: VirtPage) -> Option<&Pte> {
        self.entries.get(&vpage)
    }

    pub fn present(&self, vpage: VirtPage) -> bool {
        self.entries.contains_key(&vpage)
    }

    pub fn set_accessed(&mut self, vpage: VirtPage) {
        if let Some(pte) = self.entries.get_mut(&vpage) {
            pte.flags |= PteFlags::ACCESSED;
        }
    }

    pub fn set_dirty(&mut self, vpage: VirtPage) {
        if let Some(pte) = self.entries.get_mut(&vpage) {
            pte.flags |= PteFlags::DIRTY;
        }
    }

    /// Second-chance probe: report the accessed bit and clear it.
    pub fn test_and_clear_accessed(&mut self, vpage: VirtPage) -> bool {
        match self.entries.get_mut(&vpage) {
            Some(pte) => {
                let was = pte.flags.contains(PteFlags::ACCESSED);
                pte.flags -= PteFlags::ACCESSED;
                was
            }
            None => false,
        }
    }

    pub fn is_dirty(&self, vpage: VirtPage) -> bool {
        self.entries
            .get(&vpage)
            .map(|pte| pte.flags.contains(PteFlags::DIRTY))
            .unwrap_or(false)
    }

    pub fn clear_dirty(&mut self, vpage: VirtPage) {
        if let Some(pte) = self.entries.get_mut(&vpage) {
            pte.flags -= PteFlags::DIRTY;
        }
    }

    /// Tear the directory down, yielding every remaining mapping.
    pub fn drain(&mut self) -> Vec<(VirtPage, Pte)> {
        self.entries.drain().collect()
    }
}

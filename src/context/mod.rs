use crate::disk_manager::BlockDevice;
use crate::errors::Error;
use crate::frame_table::{FrameId, FrameTable, FrameUser};
use crate::fs::FileHandle;
use crate::page_dir::{PageDirectory, PteFlags};
use crate::pages::{
    is_page_aligned, page_offset, page_round_down, Page, VirtAddr, VirtPage, PAGE_SIZE,
};
use crate::printdbg;
use crate::spage::{Backing, SpageTable};
use crate::swap::{SwapDevice, SwapSlot};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Pid = u64;
/// Owning thread identifier recorded in frame-table entries. The hosted
/// core schedules one kernel-visible thread per process, so thread ids
/// coincide with process ids.
pub type Tid = u64;

/// First address above user space.
pub const USER_TOP: VirtAddr = 0xC000_0000;
/// How far the user stack may grow.
pub const STACK_MAX: u64 = 8 * 1024 * 1024;
pub const STACK_LIMIT: VirtAddr = USER_TOP - STACK_MAX;
/// PUSHA may touch up to 32 bytes below the stack pointer before faulting.
const STACK_SLACK: u64 = 32;

struct Process {
    tid: Tid,
    pagedir: PageDirectory,
    spage: SpageTable,
    user_sp: VirtAddr,
}

struct VmState {
    frames: FrameTable,
    procs: HashMap<Pid, Process>,
}

/// What the fault handler has to do once the supplementary entry for the
/// faulting page has been classified.
enum FaultPlan {
    StackGrow,
    Swapped {
        slot: SwapSlot,
    },
    File {
        file: Arc<dyn FileHandle>,
        offset: u64,
        size: usize,
        writable: bool,
        mmap: bool,
    },
    Zero {
        writable: bool,
    },
}

/// One virtual-memory universe: the frame table, every process's page
/// directory and supplementary page table, and the swap device. All state
/// sits behind a single mutex; fault handling, eviction and the map/unmap
/// paths run as plain `&mut` methods under it, so the re-entrant locking
/// the eviction cascade would otherwise need never arises.
pub struct VmContext {
    state: Mutex<VmState>,
    swap: SwapDevice,
    next_pid: AtomicU64,
}

impl VmContext {
    /// `frames` is the size of the managed physical region in pages; the
    /// frame table charges itself for its own storage out of it.
    pub fn new(frames: usize, swap_device: Arc<dyn BlockDevice>) -> Self {
        Self {
            state: Mutex::new(VmState {
                frames: FrameTable::new(frames),
                procs: HashMap::new(),
            }),
            swap: SwapDevice::new(swap_device),
            next_pid: AtomicU64::new(1),
        }
    }

    pub fn create_process(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        self.state.lock().procs.insert(
            pid,
            Process {
                tid: pid,
                pagedir: PageDirectory::new(),
                spage: SpageTable::new(),
                user_sp: USER_TOP,
            },
        );
        pid
    }

    /// Record the user stack pointer the fault handler consults for stack
    /// growth. Stands in for the trap frame of a real fault.
    pub fn set_stack_pointer(&self, pid: Pid, sp: VirtAddr) -> Result<()> {
        let mut state = self.state.lock();
        let process = Self::process(&mut state.procs, pid)?;
        process.user_sp = sp;
        Ok(())
    }

    /// Tear a process down at exit. Swap slots are released and lazy
    /// mappings discarded; a writable mmap that was never unmapped is a
    /// syscall-layer bug and panics.
    pub fn destroy_process(&self, pid: Pid) -> Result<()> {
        let mut state = self.state.lock();
        let VmState { frames, procs } = &mut *state;
        let Some(mut process) = procs.remove(&pid) else {
            return Err(anyhow!(Error::Internal(format!("no process {pid}"))));
        };

        for (vpage, entry) in process.spage.drain() {
            match entry.backing {
                Backing::Swapped { slot } => self.swap.free(slot),
                Backing::ZeroFill => {}
                Backing::FileBacked { .. } => {
                    assert!(
                        !(entry.writable && entry.mmap),
                        "process {pid} exited with writable mmap at {vpage:#x}"
                    );
                }
            }
        }

        for (_, pte) in process.pagedir.drain() {
            frames.release(pte.frame);
        }
        Ok(())
    }

    /// Map a page of zeros at `vaddr`.
    pub fn map_zero(&self, pid: Pid, vaddr: VirtAddr, writable: bool) -> Result<()> {
        let mut state = self.state.lock();
        let process = Self::process(&mut state.procs, pid)?;
        if process.pagedir.present(vaddr) {
            return Err(anyhow!(Error::BadMapping(vaddr)));
        }
        process.spage.map_zero(vaddr, writable)
    }

    /// Map up to one page of `file` at `vaddr` for lazy loading. Segment
    /// pages are never written back.
    pub fn map_segment(
        &self,
        pid: Pid,
        file: Arc<dyn FileHandle>,
        offset: u64,
        vaddr: VirtAddr,
        writable: bool,
        size: usize,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let process = Self::process(&mut state.procs, pid)?;
        if process.pagedir.present(vaddr) {
            return Err(anyhow!(Error::BadMapping(vaddr)));
        }
        process.spage.map_segment(file, offset, vaddr, writable, size)
    }

    /// Map `len` bytes of `file` at `vaddr` as a memory-mapped file. The
    /// mapping gets its own reopened handle so cursor state elsewhere
    /// cannot interfere; dirty pages are written back on eviction and
    /// unmap. On failure any successfully mapped prefix is unmapped again.
    pub fn mmap(
        &self,
        pid: Pid,
        file: Arc<dyn FileHandle>,
        vaddr: VirtAddr,
        len: u64,
        writable: bool,
    ) -> Result<()> {
        if !is_page_aligned(vaddr) || len == 0 {
            return Err(anyhow!(Error::BadMapping(vaddr)));
        }
        if file.is_empty() || len > file.len() {
            return Err(anyhow!(Error::BadMapping(vaddr)));
        }
        let file = file.reopen();
        let pages = len.div_ceil(PAGE_SIZE as u64);

        let mut state = self.state.lock();
        let VmState { frames, procs } = &mut *state;
        for index in 0..pages {
            let vpage = vaddr + index * PAGE_SIZE as u64;
            let offset = index * PAGE_SIZE as u64;
            let size = (len - offset).min(PAGE_SIZE as u64) as usize;

            let mapped = (|| {
                let process = Self::process(procs, pid)?;
                if process.pagedir.present(vpage) {
                    return Err(anyhow!(Error::BadMapping(vpage)));
                }
                process
                    .spage
                    .map_mmap(file.clone(), offset, vpage, writable, size)
            })();

            if let Err(e) = mapped {
                for undone in 0..index {
                    let vpage = vaddr + undone * PAGE_SIZE as u64;
                    let _ = Self::unmap_page(frames, procs, &self.swap, pid, vpage);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unmap `len` bytes starting at `vaddr`, flushing dirty mmap pages to
    /// their file. Pages without a mapping are skipped.
    pub fn munmap(&self, pid: Pid, vaddr: VirtAddr, len: u64) -> Result<()> {
        if !is_page_aligned(vaddr) || len == 0 {
            return Err(anyhow!(Error::BadMapping(vaddr)));
        }
        let pages = len.div_ceil(PAGE_SIZE as u64);
        let mut state = self.state.lock();
        let VmState { frames, procs } = &mut *state;
        for index in 0..pages {
            let vpage = vaddr + index * PAGE_SIZE as u64;
            Self::unmap_page(frames, procs, &self.swap, pid, vpage)?;
        }
        Ok(())
    }

    /// Resolve a fault at `vaddr`, optionally leaving the loaded frame
    /// pinned for the caller.
    pub fn resolve_fault(&self, pid: Pid, vaddr: VirtAddr, for_write: bool, pin: bool) -> Result<()> {
        let mut state = self.state.lock();
        Self::handle_fault(&mut state, &self.swap, pid, vaddr, for_write, pin)
    }

    /// Copy bytes out of a process's address space, faulting pages in as
    /// needed and setting accessed bits as the hardware would.
    pub fn read_user(&self, pid: Pid, vaddr: VirtAddr, buf: &mut [u8]) -> Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let addr = vaddr + pos as u64;
            let ofs = page_offset(addr);
            let chunk = (PAGE_SIZE - ofs).min(buf.len() - pos);
            let dst = &mut buf[pos..pos + chunk];
            self.with_present_page(pid, addr, false, |page| {
                dst.copy_from_slice(page.read_bytes(ofs, ofs + chunk));
            })?;
            pos += chunk;
        }
        Ok(())
    }

    /// Copy bytes into a process's address space, faulting pages in as
    /// needed and setting accessed + dirty bits as the hardware would.
    pub fn write_user(&self, pid: Pid, vaddr: VirtAddr, bytes: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < bytes.len() {
            let addr = vaddr + pos as u64;
            let ofs = page_offset(addr);
            let chunk = (PAGE_SIZE - ofs).min(bytes.len() - pos);
            let src = &bytes[pos..pos + chunk];
            self.with_present_page(pid, addr, true, |page| {
                page.write_bytes(ofs, ofs + chunk, src);
            })?;
            pos += chunk;
        }
        Ok(())
    }

    /// Pin every frame backing `[vaddr, vaddr + len)`, faulting pages in
    /// pinned, so the range cannot be evicted while a syscall works on it.
    /// Rolls the pins back if any page fails.
    pub fn pin_buffer(&self, pid: Pid, vaddr: VirtAddr, len: u64, for_write: bool) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let first = page_round_down(vaddr);
        let last = page_round_down(vaddr + len - 1);

        let mut state = self.state.lock();
        let mut pinned = Vec::new();
        let mut vpage = first;
        loop {
            match Self::pin_page(&mut state, &self.swap, pid, vpage, for_write) {
                Ok(()) => pinned.push(vpage),
                Err(e) => {
                    for vpage in pinned {
                        Self::unpin_page(&mut state, pid, vpage);
                    }
                    return Err(e);
                }
            }
            if vpage == last {
                break;
            }
            vpage += PAGE_SIZE as u64;
        }
        Ok(())
    }

    pub fn unpin_buffer(&self, pid: Pid, vaddr: VirtAddr, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let first = page_round_down(vaddr);
        let last = page_round_down(vaddr + len - 1);

        let mut state = self.state.lock();
        let mut vpage = first;
        loop {
            Self::unpin_page(&mut state, pid, vpage);
            if vpage == last {
                break;
            }
            vpage += PAGE_SIZE as u64;
        }
        Ok(())
    }

    fn pin_page(
        state: &mut VmState,
        swap: &SwapDevice,
        pid: Pid,
        vpage: VirtPage,
        for_write: bool,
    ) -> Result<()> {
        let VmState { frames, procs } = state;
        let process = Self::process(procs, pid)?;
        if let Some(pte) = process.pagedir.get(vpage) {
            if for_write && !pte.flags.contains(PteFlags::WRITABLE) {
                return Err(anyhow!(Error::AddressViolation(vpage)));
            }
            frames.set_pin(pte.frame, true);
            return Ok(());
        }
        // the fault installs the page already pinned
        Self::handle_fault(state, swap, pid, vpage, for_write, true)
    }

    fn unpin_page(state: &mut VmState, pid: Pid, vpage: VirtPage) {
        let VmState { frames, procs } = state;
        if let Some(process) = procs.get_mut(&pid) {
            if let Some(pte) = process.pagedir.get(vpage) {
                frames.set_pin(pte.frame, false);
            }
        }
    }

    /// Run `work` on the frame backing `addr`, faulting the page in first
    /// if it is absent. Accessed and dirty bits are maintained under the
    /// same lock acquisition that resolves the frame, so the page cannot
    /// be evicted in between.
    fn with_present_page<F>(&self, pid: Pid, addr: VirtAddr, for_write: bool, work: F) -> Result<()>
    where
        F: FnOnce(&mut Page),
    {
        let vpage = page_round_down(addr);
        let mut work = Some(work);
        loop {
            let mut state = self.state.lock();
            let VmState { frames, procs } = &mut *state;
            let process = Self::process(procs, pid)?;

            if let Some(pte) = process.pagedir.get(vpage) {
                if for_write && !pte.flags.contains(PteFlags::WRITABLE) {
                    return Err(anyhow!(Error::AddressViolation(addr)));
                }
                let frame = pte.frame;
                process.pagedir.set_accessed(vpage);
                if for_write {
                    process.pagedir.set_dirty(vpage);
                }
                (work.take().expect("page callback reused"))(frames.page_mut(frame));
                return Ok(());
            }

            Self::handle_fault(&mut state, &self.swap, pid, addr, for_write, false)?;
        }
    }

    /// Fault resolution. A frame is taken first (possibly evicting); on
    /// any later failure it is released again before the error surfaces.
    fn handle_fault(
        state: &mut VmState,
        swap: &SwapDevice,
        pid: Pid,
        fault_addr: VirtAddr,
        for_write: bool,
        pin: bool,
    ) -> Result<()> {
        let vpage = page_round_down(fault_addr);
        printdbg!("@@@ fault (pid: {pid}, vaddr: {fault_addr:#x}, write: {for_write}) @@@");

        let frame = state.allocate_frame(swap)?;
        let VmState { frames, procs } = state;
        let Some(process) = procs.get_mut(&pid) else {
            frames.release(frame);
            return Err(anyhow!(Error::Internal(format!("no process {pid}"))));
        };

        if process.pagedir.present(vpage) {
            // present pages do not fault here
            frames.release(frame);
            return Err(anyhow!(Error::BadMapping(fault_addr)));
        }
        let tid = process.tid;

        let plan = match process.spage.get(vpage) {
            None => {
                let sp = process.user_sp;
                let grows = fault_addr < USER_TOP - PAGE_SIZE as u64
                    && fault_addr + STACK_SLACK >= sp
                    && fault_addr > STACK_LIMIT;
                if !grows {
                    frames.release(frame);
                    return Err(anyhow!(Error::AddressViolation(fault_addr)));
                }
                FaultPlan::StackGrow
            }
            Some(entry) => {
                if for_write && !entry.writable {
                    frames.release(frame);
                    return Err(anyhow!(Error::AddressViolation(fault_addr)));
                }
                match &entry.backing {
                    Backing::Swapped { slot } => FaultPlan::Swapped { slot: *slot },
                    Backing::FileBacked { file, offset, size } => FaultPlan::File {
                        file: file.clone(),
                        offset: *offset,
                        size: *size,
                        writable: entry.writable,
                        mmap: entry.mmap,
                    },
                    Backing::ZeroFill => FaultPlan::Zero {
                        writable: entry.writable,
                    },
                }
            }
        };

        match plan {
            FaultPlan::StackGrow => {
                frames.page_mut(frame).zero();
                process
                    .pagedir
                    .install(vpage, frame, true)
                    .expect("page appeared during fault");
                frames.install(frame, pid, tid, vpage);
            }
            FaultPlan::Swapped { slot } => {
                // the read releases the slot on success
                if let Err(e) = swap.read(slot, frames.page_mut(frame)) {
                    frames.release(frame);
                    return Err(e);
                }
                process
                    .pagedir
                    .install(vpage, frame, true)
                    .expect("page appeared during fault");
                frames.install(frame, pid, tid, vpage);
                process.spage.remove(vpage);
            }
            FaultPlan::File {
                file,
                offset,
                size,
                writable,
                mmap,
            } => {
                let page = frames.page_mut(frame);
                page.zero();
                match file.read_at(offset, &mut page.as_bytes_mut()[..size]) {
                    Ok(n) if n == size => {}
                    Ok(n) => {
                        frames.release(frame);
                        return Err(anyhow!(Error::IoFailure(format!(
                            "short read: {n} of {size} bytes at offset {offset}"
                        ))));
                    }
                    Err(e) => {
                        frames.release(frame);
                        return Err(e);
                    }
                }
                process
                    .pagedir
                    .install(vpage, frame, writable)
                    .expect("page appeared during fault");
                frames.install(frame, pid, tid, vpage);
                // mmap entries stay: eviction needs them for write-back
                if !mmap {
                    process.spage.remove(vpage);
                }
            }
            FaultPlan::Zero { writable } => {
                frames.page_mut(frame).zero();
                process
                    .pagedir
                    .install(vpage, frame, writable)
                    .expect("page appeared during fault");
                frames.install(frame, pid, tid, vpage);
                process.spage.remove(vpage);
            }
        }

        if pin {
            frames.set_pin(frame, true);
        }
        Ok(())
    }

    /// Unmap one page: flush it if it is a dirty writable mmap, drop the
    /// page-directory entry and its frame, and free whatever backing the
    /// supplementary entry still holds.
    fn unmap_page(
        frames: &mut FrameTable,
        procs: &mut HashMap<Pid, Process>,
        swap: &SwapDevice,
        pid: Pid,
        vpage: VirtPage,
    ) -> Result<()> {
        let process = Self::process(procs, pid)?;

        let flush = match process.spage.get(vpage) {
            Some(entry) if entry.mmap && entry.writable => match &entry.backing {
                Backing::FileBacked { file, offset, size } => Some((file.clone(), *offset, *size)),
                _ => None,
            },
            _ => None,
        };

        if let Some(pte) = process.pagedir.clear(vpage) {
            if pte.flags.contains(PteFlags::DIRTY) {
                if let Some((file, offset, size)) = &flush {
                    if let Err(e) = write_window(file, *offset, *size, frames.page(pte.frame)) {
                        frames.release(pte.frame);
                        return Err(e);
                    }
                }
            }
            frames.release(pte.frame);
        }

        if let Some(entry) = process.spage.remove(vpage) {
            if let Backing::Swapped { slot } = entry.backing {
                swap.free(slot);
            }
        }
        Ok(())
    }

    fn process(procs: &mut HashMap<Pid, Process>, pid: Pid) -> Result<&mut Process> {
        procs
            .get_mut(&pid)
            .ok_or_else(|| anyhow!(Error::Internal(format!("no process {pid}"))))
    }

    #[cfg(test)]
    fn frame_of(&self, pid: Pid, vaddr: VirtAddr) -> Option<FrameId> {
        let state = self.state.lock();
        state
            .procs
            .get(&pid)?
            .pagedir
            .get(page_round_down(vaddr))
            .map(|pte| pte.frame)
    }

    #[cfg(test)]
    fn pte_accessed(&self, pid: Pid, vaddr: VirtAddr) -> bool {
        let state = self.state.lock();
        state.procs[&pid]
            .pagedir
            .get(page_round_down(vaddr))
            .map(|pte| pte.flags.contains(PteFlags::ACCESSED))
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn frames_used(&self) -> usize {
        self.state.lock().frames.used()
    }

    #[cfg(test)]
    pub(crate) fn table_overhead(&self) -> usize {
        self.state.lock().frames.own_used()
    }

    #[cfg(test)]
    fn swap_used(&self) -> u64 {
        self.swap.used_slots()
    }

    #[cfg(test)]
    fn is_swapped(&self, pid: Pid, vaddr: VirtAddr) -> bool {
        let state = self.state.lock();
        matches!(
            state.procs[&pid].spage.get(page_round_down(vaddr)),
            Some(entry) if matches!(entry.backing, Backing::Swapped { .. })
        )
    }

    #[cfg(test)]
    fn has_spage(&self, pid: Pid, vaddr: VirtAddr) -> bool {
        let state = self.state.lock();
        state.procs[&pid].spage.contains(page_round_down(vaddr))
    }
}

impl VmState {
    fn allocate_frame(&mut self, swap: &SwapDevice) -> Result<FrameId> {
        if let Some(frame) = self.frames.allocate_free() {
            return Ok(frame);
        }
        self.evict_frame(swap)
    }

    /// Second-chance clock over the frame table. The victim's mapping is
    /// torn down before its contents are written anywhere, so the owner
    /// cannot re-dirty the page mid-eviction.
    fn evict_frame(&mut self, swap: &SwapDevice) -> Result<FrameId> {
        let VmState { frames, procs } = self;
        // two full revolutions: one to clear accessed bits, one to pick
        let sweep = 2 * frames.size();

        for _ in 0..sweep {
            let frame = frames.tick_clock();
            let entry = *frames.entry(frame);
            let FrameUser::Mapped { pid, tid, vpage } = entry.user() else {
                continue;
            };
            if entry.is_pinned() {
                continue;
            }
            let process = procs
                .get_mut(&pid)
                .unwrap_or_else(|| panic!("frame of thread {tid} owned by dead process {pid}"));
            if process.pagedir.test_and_clear_accessed(vpage) {
                continue;
            }

            let pte = process
                .pagedir
                .clear(vpage)
                .expect("mapped frame missing from page directory");
            assert_eq!(pte.frame, frame, "frame table and page directory disagree");
            let dirty = pte.flags.contains(PteFlags::DIRTY);

            if pte.flags.contains(PteFlags::WRITABLE) {
                if let Some(spte) = process.spage.get(vpage) {
                    assert!(
                        spte.mmap,
                        "writable page {vpage:#x} with non-mmap backing at eviction"
                    );
                    if dirty {
                        let Backing::FileBacked { file, offset, size } = &spte.backing else {
                            panic!("mmap entry at {vpage:#x} without file backing");
                        };
                        let (file, offset, size) = (file.clone(), *offset, *size);
                        if let Err(e) = write_window(&file, offset, size, frames.page(frame)) {
                            // roll the mapping back; the page stays resident
                            process.pagedir.install(vpage, frame, true)?;
                            process.pagedir.set_dirty(vpage);
                            return Err(e);
                        }
                        printdbg!("flushed mmap page {vpage:#x} (tid: {tid})");
                    }
                } else {
                    let Some(slot) = swap.alloc() else {
                        panic!("swap device full while evicting {vpage:#x}");
                    };
                    if let Err(e) = swap.write(slot, frames.page(frame)) {
                        swap.free(slot);
                        process.pagedir.install(vpage, frame, true)?;
                        if dirty {
                            process.pagedir.set_dirty(vpage);
                        }
                        return Err(e);
                    }
                    process.spage.map_swapped(vpage, slot)?;
                    printdbg!("swapped out page {vpage:#x} (tid: {tid}, slot: {slot})");
                }
            }
            // read-only contents are authoritative in their backing store

            frames.reset_to_reserved(frame);
            return Ok(frame);
        }
        panic!("no evictable frame in a full clock cycle");
    }
}

fn write_window(file: &Arc<dyn FileHandle>, offset: u64, size: usize, page: &Page) -> Result<()> {
    let written = file.write_at(offset, page.read_bytes(0, size))?;
    if written != size {
        return Err(anyhow!(Error::IoFailure(format!(
            "short write: {written} of {size} bytes at offset {offset}"
        ))));
    }
    Ok(())
}

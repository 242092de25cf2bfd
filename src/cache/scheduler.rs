use super::slot::{CacheSlot, SlotFlags};
use super::Directory;
use crate::disk_manager::{BlockDevice, SectorId, SECTOR_SIZE};
use crate::printdbg;
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum IoOp {
    Read,
    Write,
}

/// One queued I/O. Identity is `(sector, op)` so the queue itself enforces
/// at most one pending request per sector and direction.
#[derive(Debug, Clone, Copy)]
pub(super) struct IoRequest {
    pub sector: SectorId,
    pub op: IoOp,
    pub slot: usize,
}

impl PartialEq for IoRequest {
    fn eq(&self, other: &Self) -> bool {
        self.sector == other.sector && self.op == other.op
    }
}

impl Eq for IoRequest {}

impl Hash for IoRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sector.hash(state);
        self.op.hash(state);
    }
}

struct QueueState {
    /// Pending requests in ascending sector order (elevator discipline).
    queue: PriorityQueue<IoRequest, Reverse<SectorId>>,
    shutdown: bool,
}

struct SchedShared {
    state: Mutex<QueueState>,
    work: Condvar,
    reads_enqueued: AtomicU64,
    writes_enqueued: AtomicU64,
    #[cfg(test)]
    serviced: Mutex<Vec<(SectorId, IoOp)>>,
}

/// Single background worker serving cache I/O. The queue lock is held only
/// across inspection and dequeue; block I/O runs with it released so other
/// threads can keep enqueueing.
pub(super) struct IoScheduler {
    shared: Arc<SchedShared>,
    worker: Option<JoinHandle<()>>,
}

impl IoScheduler {
    pub fn spawn(
        device: Arc<dyn BlockDevice>,
        slots: Arc<Vec<CacheSlot>>,
        dir: Arc<Mutex<Directory>>,
    ) -> Self {
        let shared = Arc::new(SchedShared {
            state: Mutex::new(QueueState {
                queue: PriorityQueue::new(),
                shutdown: false,
            }),
            work: Condvar::new(),
            reads_enqueued: AtomicU64::new(0),
            writes_enqueued: AtomicU64::new(0),
            #[cfg(test)]
            serviced: Mutex::new(Vec::new()),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::spawn(move || {
            worker_loop(worker_shared, device, slots, dir);
        });

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Queue a read for `sector` into `slot`. The slot must already be
    /// labeled with the sector and marked `UNREADY | PINNED`.
    pub fn enqueue_read(&self, sector: SectorId, slot: usize) {
        let req = IoRequest {
            sector,
            op: IoOp::Read,
            slot,
        };
        let mut state = self.shared.state.lock();
        if state.queue.push(req, Reverse(sector)).is_none() {
            self.shared.reads_enqueued.fetch_add(1, Ordering::Relaxed);
        }
        drop(state);
        self.shared.work.notify_one();
    }

    /// Queue a write-back of `slot`. Idempotent while one is pending.
    pub fn enqueue_write(&self, sector: SectorId, slot: usize) {
        let req = IoRequest {
            sector,
            op: IoOp::Write,
            slot,
        };
        let mut state = self.shared.state.lock();
        if state.queue.push(req, Reverse(sector)).is_none() {
            self.shared.writes_enqueued.fetch_add(1, Ordering::Relaxed);
        }
        drop(state);
        self.shared.work.notify_one();
    }

    #[allow(unused)]
    pub fn reads_enqueued(&self) -> u64 {
        self.shared.reads_enqueued.load(Ordering::Relaxed)
    }

    #[allow(unused)]
    pub fn writes_enqueued(&self) -> u64 {
        self.shared.writes_enqueued.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn serviced(&self) -> Vec<(SectorId, IoOp)> {
        self.shared.serviced.lock().clone()
    }
}

impl Drop for IoScheduler {
    /// Explicit shutdown: the worker drains the queue, then exits.
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.work.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    shared: Arc<SchedShared>,
    device: Arc<dyn BlockDevice>,
    slots: Arc<Vec<CacheSlot>>,
    dir: Arc<Mutex<Directory>>,
) {
    loop {
        let req = {
            let mut state = shared.state.lock();
            loop {
                if let Some((req, _)) = state.queue.pop() {
                    break req;
                }
                if state.shutdown {
                    return;
                }
                shared.work.wait(&mut state);
            }
        };

        match req.op {
            IoOp::Read => complete_read(&req, &device, &slots, &dir),
            IoOp::Write => complete_write(&req, &device, &slots),
        }

        #[cfg(test)]
        shared.serviced.lock().push((req.sector, req.op));
    }
}

fn complete_read(
    req: &IoRequest,
    device: &Arc<dyn BlockDevice>,
    slots: &Arc<Vec<CacheSlot>>,
    dir: &Arc<Mutex<Directory>>,
) {
    let mut buf = [0u8; SECTOR_SIZE];
    match device.read(req.sector, &mut buf) {
        Ok(()) => {
            let mut state = slots[req.slot].state.lock();
            state.data.copy_from_slice(&buf);
            state.flags.remove(SlotFlags::UNREADY | SlotFlags::PINNED);
            drop(state);
        }
        Err(e) => {
            printdbg!("read of sector {} failed: {e}", req.sector);
            // Unlabel the slot so nothing serves the stale buffer; waiters
            // notice the label mismatch and retry or surface the failure.
            let mut dir = dir.lock();
            let mut state = slots[req.slot].state.lock();
            if dir.sectors[req.slot] == Some(req.sector) {
                dir.sectors[req.slot] = None;
            }
            state.flags.remove(SlotFlags::UNREADY | SlotFlags::PINNED);
            drop(state);
            drop(dir);
        }
    }
    slots[req.slot].ready.notify_all();
}

fn complete_write(req: &IoRequest, device: &Arc<dyn BlockDevice>, slots: &Arc<Vec<CacheSlot>>) {
    let mut state = slots[req.slot].state.lock();
    let res: Result<()> = device.write(req.sector, &state.data);
    match res {
        Ok(()) => {
            state.flags.remove(SlotFlags::DIRTY | SlotFlags::PINNED);
        }
        Err(e) => {
            printdbg!("write-back of sector {} failed: {e}", req.sector);
            // stays dirty; a later eviction sweep reschedules it
            state.flags.remove(SlotFlags::PINNED);
        }
    }
    drop(state);
    slots[req.slot].ready.notify_all();
}

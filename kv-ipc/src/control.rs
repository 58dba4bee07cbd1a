//! The shared control block of one command channel.
//!
//! Layout, all inside a single named segment:
//!
//! ```text
//! | Header (repr C) | ResponseSync[channels] | command area [frame_capacity] |
//! ```
//!
//! The header holds the lifecycle word, the worker's pid, the `started` flag and the five
//! semaphores guarding the command area: `mutex` (one producer at a time), `full` (the area is
//! free, initially posted), the lazy-start pair `agent[0]`/`agent[1]`, and `worker` (a command is
//! waiting). The magic word is published last, so a block with a valid magic is completely
//! initialized.
use core::mem::{align_of, size_of};
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::io;

use kv_shm::{Mapping, Protection, Segment, Semaphore};

use crate::error::Error;
use crate::message::Envelope;
use crate::state::WorkerState;

const MAGIC: u64 = u64::from_ne_bytes(*b"kvshmcb1");

#[repr(C)]
struct Header {
    magic: AtomicU64,
    frame_capacity: u64,
    channels: u32,
    state: AtomicU32,
    worker_pid: AtomicU32,
    started: AtomicBool,
    mutex: Semaphore,
    full: Semaphore,
    agent: [Semaphore; 2],
    worker: Semaphore,
}

const LEASED: u32 = 0;
const ABANDONED: u32 = 1;
const ANSWERED: u32 = 2;

/// The lock and completion signal of one response channel.
#[repr(C)]
pub struct ResponseSync {
    /// Posted while the channel is free to lease.
    pub lock: Semaphore,
    /// Posted by the worker once the response is complete.
    pub ready: Semaphore,
    /// Who finishes the current exchange: the leaser, or the worker when the leaser gave up.
    exchange: AtomicU32,
}

impl ResponseSync {
    /// Called by the leaser right after acquiring `lock`.
    pub fn begin(&self) {
        self.exchange.store(LEASED, Ordering::Release);
    }

    /// The leaser stops waiting. Returns `false` when the worker has already answered, in which
    /// case `ready` is or will be posted and the leaser still owns the channel.
    pub fn abandon(&self) -> bool {
        self.exchange
            .compare_exchange(LEASED, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The worker has written the response. Returns `false` when the leaser gave up, in which
    /// case the worker hands the channel back to the pool instead of posting `ready`.
    pub fn answer(&self) -> bool {
        self.exchange
            .compare_exchange(LEASED, ANSWERED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Layout {
    channels: u32,
    frame_capacity: usize,
    sync_offset: usize,
    area_offset: usize,
    len: usize,
}

pub struct ControlBlock {
    name: String,
    map: Mapping,
    layout: Layout,
    owner: bool,
}

fn align_up(offset: usize, align: usize) -> Option<usize> {
    Some(offset.checked_add(align - 1)? & !(align - 1))
}

impl Layout {
    fn new(channels: u32, frame_capacity: usize) -> Option<Self> {
        if channels == 0 || frame_capacity < Envelope::LEN {
            return None;
        }

        let sync_offset = align_up(size_of::<Header>(), align_of::<ResponseSync>())?;
        let sync_len = size_of::<ResponseSync>().checked_mul(channels as usize)?;
        let area_offset = align_up(sync_offset.checked_add(sync_len)?, 8)?;
        let len = area_offset.checked_add(frame_capacity)?;

        Some(Layout {
            channels,
            frame_capacity,
            sync_offset,
            area_offset,
            len,
        })
    }
}

impl ControlBlock {
    /// Provision a fresh block, replacing any stale object of the same name.
    ///
    /// The returned block owns the name: dropping it destroys the semaphores and unlinks it.
    pub fn create(name: &str, channels: u32, frame_capacity: usize) -> Result<Self, Error> {
        let layout = Layout::new(channels, frame_capacity)
            .ok_or(Error::InvalidConfig("control block layout does not fit"))?;

        let segment = Segment::recreate(name, layout.len)?;
        let map = segment.map(layout.len, Protection::ReadWrite)?;

        let block = ControlBlock {
            name: name.to_owned(),
            map,
            layout,
            owner: true,
        };

        // Safety: nobody can have opened the block yet, there is no valid magic.
        unsafe {
            let header = block.map.as_mut_ptr() as *mut Header;
            addr_of_mut!((*header).channels).write(channels);
            addr_of_mut!((*header).frame_capacity).write(frame_capacity as u64);
        }

        let header = block.header();
        header.state.store(WorkerState::NotStarted as u32, Ordering::Relaxed);
        header.worker_pid.store(0, Ordering::Relaxed);
        header.started.store(false, Ordering::Relaxed);

        unsafe {
            header.mutex.init(1)?;
            header.full.init(1)?;
            header.agent[0].init(0)?;
            header.agent[1].init(0)?;
            header.worker.init(0)?;

            for sync in block.syncs() {
                sync.lock.init(1)?;
                sync.ready.init(0)?;
                sync.exchange.store(ANSWERED, Ordering::Relaxed);
            }
        }

        header.magic.store(MAGIC, Ordering::Release);
        tracing::debug!(name, channels, frame_capacity, "provisioned control block");

        Ok(block)
    }

    /// Attach to a block provisioned by somebody else.
    pub fn open(name: &str) -> Result<Self, Error> {
        let not_provisioned = || Error::NotProvisioned {
            name: name.to_owned(),
        };

        let segment = match Segment::open(name) {
            Ok(segment) => segment,
            Err(err) if err.is_not_found() => return Err(not_provisioned()),
            Err(err) => return Err(err.into()),
        };

        let len = segment.len()?;
        if len < size_of::<Header>() {
            return Err(not_provisioned());
        }

        let map = segment.map(len, Protection::ReadWrite)?;
        // Safety: the mapping is page aligned and long enough for a header.
        let header = unsafe { &*(map.as_ptr() as *const Header) };

        if header.magic.load(Ordering::Acquire) != MAGIC {
            return Err(not_provisioned());
        }

        let layout = usize::try_from(header.frame_capacity)
            .ok()
            .and_then(|capacity| Layout::new(header.channels, capacity))
            .filter(|layout| layout.len <= len)
            .ok_or_else(not_provisioned)?;

        Ok(ControlBlock {
            name: name.to_owned(),
            map,
            layout,
            owner: false,
        })
    }

    fn header(&self) -> &Header {
        // Safety: checked by the constructors.
        unsafe { &*(self.map.as_ptr() as *const Header) }
    }

    fn syncs(&self) -> &[ResponseSync] {
        unsafe {
            let first = self.map.as_ptr().add(self.layout.sync_offset) as *const ResponseSync;
            core::slice::from_raw_parts(first, self.layout.channels as usize)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> u32 {
        self.layout.channels
    }

    pub fn frame_capacity(&self) -> usize {
        self.layout.frame_capacity
    }

    /// Held by the producer for the whole production of one command.
    pub fn mutex(&self) -> &Semaphore {
        &self.header().mutex
    }

    /// Posted while the command area holds no unconsumed command.
    pub fn full(&self) -> &Semaphore {
        &self.header().full
    }

    /// The lazy-start handshake: `agent(0)` asks for a launch, `agent(1)` answers.
    pub fn agent(&self, which: usize) -> &Semaphore {
        &self.header().agent[which & 1]
    }

    /// Posted once per command placed into the area.
    pub fn work(&self) -> &Semaphore {
        &self.header().worker
    }

    pub fn response_sync(&self, channel: u32) -> Option<&ResponseSync> {
        self.syncs().get(channel as usize)
    }

    /// The command area.
    ///
    /// # Safety
    ///
    /// The caller must own the area: as a producer between acquiring `full` and posting `work`,
    /// or as the consumer between acquiring `work` and posting `full`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn area_mut(&self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(
            self.map.as_mut_ptr().add(self.layout.area_offset),
            self.layout.frame_capacity,
        )
    }

    /// See [`ControlBlock::area_mut`].
    pub unsafe fn area(&self) -> &[u8] {
        core::slice::from_raw_parts(
            self.map.as_ptr().add(self.layout.area_offset),
            self.layout.frame_capacity,
        )
    }

    pub fn is_started(&self) -> bool {
        self.header().started.load(Ordering::Acquire)
    }

    pub fn set_started(&self) {
        self.header().started.store(true, Ordering::Release)
    }

    pub fn worker_pid(&self) -> Option<u32> {
        match self.header().worker_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn set_worker_pid(&self, pid: u32) {
        self.header().worker_pid.store(pid, Ordering::Release)
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u32(self.header().state.load(Ordering::Acquire))
    }

    /// Move to `next`, returning the previous state, or the current one if the order forbids it.
    pub fn advance(&self, next: WorkerState) -> Result<WorkerState, WorkerState> {
        let word = &self.header().state;
        let mut current = word.load(Ordering::Acquire);

        loop {
            let state = WorkerState::from_u32(current);
            if !state.can_advance_to(next) {
                return Err(state);
            }

            match word.compare_exchange_weak(
                current,
                next as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!(block = %self.name, from = ?state, to = ?next, "lifecycle");
                    return Ok(state);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether the partner can still be expected to act on this block.
    pub fn is_alive(&self) -> bool {
        if self.state() == WorkerState::Terminated {
            return false;
        }

        match self.worker_pid() {
            None => true,
            Some(pid) => process_exists(pid),
        }
    }

    fn teardown(&self) {
        let _ = self.advance(WorkerState::Terminated);

        let header = self.header();
        if header.magic.swap(0, Ordering::AcqRel) == MAGIC {
            let sems = [
                &header.mutex,
                &header.full,
                &header.agent[0],
                &header.agent[1],
                &header.worker,
            ];

            let syncs = self.syncs().iter().flat_map(|sync| [&sync.lock, &sync.ready]);

            for sem in sems.into_iter().chain(syncs) {
                // Safety: the owner tears down after every partner was terminated.
                if let Err(err) = unsafe { sem.destroy() } {
                    tracing::warn!(%err, block = %self.name, "could not destroy semaphore");
                }
            }
        }

        Segment::unlink_quiet(&self.name);
    }
}

impl Drop for ControlBlock {
    fn drop(&mut self) {
        if self.owner {
            self.teardown();
        }
    }
}

fn process_exists(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }

    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };

    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }

    // Exists, but belongs to somebody else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
pub(crate) fn unique_name(tag: &str) -> String {
    use core::sync::atomic::AtomicUsize;
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    format!("/kvipc-test-{tag}-{}-{n}", std::process::id())
}

#[test]
fn layout_is_aligned() {
    let layout = Layout::new(16, 4096).unwrap();
    assert_eq!(layout.sync_offset % align_of::<ResponseSync>(), 0);
    assert_eq!(layout.area_offset % 8, 0);
    assert!(layout.area_offset >= layout.sync_offset + 16 * size_of::<ResponseSync>());
    assert_eq!(layout.len, layout.area_offset + 4096);

    assert_eq!(Layout::new(0, 4096), None);
    assert_eq!(Layout::new(1, 4), None);
}

#[test]
fn create_then_open() {
    use kv_shm::TryWait;

    let name = unique_name("cb");
    let owner = ControlBlock::create(&name, 4, 1024).unwrap();
    let other = ControlBlock::open(&name).unwrap();

    assert_eq!(other.channels(), 4);
    assert_eq!(other.frame_capacity(), 1024);
    assert_eq!(other.state(), WorkerState::NotStarted);
    assert!(!other.is_started());

    // Semaphores are shared, with their initial counts.
    assert_eq!(other.full().try_wait().unwrap(), TryWait::Acquired);
    assert_eq!(owner.full().try_wait().unwrap(), TryWait::WouldBlock);
    assert_eq!(owner.work().try_wait().unwrap(), TryWait::WouldBlock);
    assert_eq!(other.response_sync(3).unwrap().lock.value().unwrap(), 1);
    assert!(other.response_sync(4).is_none());

    owner.set_started();
    owner.set_worker_pid(std::process::id());
    assert!(other.is_started());
    assert!(other.is_alive());

    drop(owner);
    assert_eq!(other.state(), WorkerState::Terminated);
    assert!(!other.is_alive());
    assert!(matches!(
        ControlBlock::open(&name),
        Err(Error::NotProvisioned { .. })
    ));
}

#[test]
fn lifecycle_order_is_enforced() {
    let block = ControlBlock::create(&unique_name("life"), 1, 256).unwrap();

    assert_eq!(block.advance(WorkerState::Ready), Err(WorkerState::NotStarted));
    assert_eq!(block.advance(WorkerState::Starting), Ok(WorkerState::NotStarted));
    assert_eq!(block.advance(WorkerState::Ready), Ok(WorkerState::Starting));
    assert_eq!(block.advance(WorkerState::Running), Ok(WorkerState::Ready));
    assert_eq!(block.advance(WorkerState::Starting), Err(WorkerState::Running));
    assert_eq!(block.advance(WorkerState::Terminating), Ok(WorkerState::Running));
    assert_eq!(block.advance(WorkerState::Terminated), Ok(WorkerState::Terminating));
    assert_eq!(block.state(), WorkerState::Terminated);
}

#[test]
fn exchange_has_one_finisher() {
    let block = ControlBlock::create(&unique_name("exchange"), 1, 256).unwrap();
    let sync = block.response_sync(0).unwrap();

    sync.begin();
    assert!(sync.answer());
    assert!(!sync.abandon());

    sync.begin();
    assert!(sync.abandon());
    assert!(!sync.answer());
}

#[test]
fn open_missing_is_not_provisioned() {
    assert!(matches!(
        ControlBlock::open(&unique_name("none")),
        Err(Error::NotProvisioned { .. })
    ));
}

use std::time::Instant;

use kv_shm::{Mapping, Protection, Segment, ShmError, TimedWait, TryWait};

use crate::control::ControlBlock;
use crate::error::Error;
use crate::names;

/// The response buffers of one control block.
///
/// Their locks and completion signals live in the control block, the buffers themselves in one
/// segment each, named after the block with the channel index as suffix.
pub struct ResponsePool {
    buffers: Vec<Mapping>,
    names: Vec<String>,
    owner: bool,
}

impl ResponsePool {
    pub fn create(control: &str, channels: u32, capacity: usize) -> Result<Self, Error> {
        let mut pool = ResponsePool {
            buffers: Vec::with_capacity(channels as usize),
            names: Vec::with_capacity(channels as usize),
            owner: true,
        };

        for channel in 0..channels {
            let name = names::response(control, channel);
            let segment = Segment::recreate(&name, capacity)?;
            // Registered before mapping so that a failure below still unlinks it.
            pool.names.push(name);
            pool.buffers.push(segment.map(capacity, Protection::ReadWrite)?);
        }

        Ok(pool)
    }

    /// Map the buffers of an existing block.
    pub fn open(control: &ControlBlock) -> Result<Self, Error> {
        let capacity = control.frame_capacity();
        let mut pool = ResponsePool {
            buffers: Vec::with_capacity(control.channels() as usize),
            names: Vec::with_capacity(control.channels() as usize),
            owner: false,
        };

        for channel in 0..control.channels() {
            let name = names::response(control.name(), channel);
            let segment = match Segment::open(&name) {
                Ok(segment) => segment,
                Err(err) if err.is_not_found() => return Err(Error::NotProvisioned { name }),
                Err(err) => return Err(err.into()),
            };

            pool.buffers.push(segment.map(capacity, Protection::ReadWrite)?);
            pool.names.push(name);
        }

        Ok(pool)
    }

    /// Try-lock every channel in index order until one is acquired.
    ///
    /// Yields between full scans. Returns `None` once `deadline` has passed without success.
    pub fn lease(
        &self,
        control: &ControlBlock,
        deadline: Option<Instant>,
    ) -> Result<Option<u32>, ShmError> {
        loop {
            for channel in 0..control.channels() {
                let Some(sync) = control.response_sync(channel) else {
                    break;
                };

                if sync.lock.try_wait()? == TryWait::Acquired {
                    sync.begin();
                    return Ok(Some(channel));
                }
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(None);
            }

            std::thread::yield_now();
        }
    }

    pub fn unlease(&self, control: &ControlBlock, channel: u32) -> Result<(), ShmError> {
        match control.response_sync(channel) {
            Some(sync) => sync.lock.post(),
            None => Ok(()),
        }
    }

    /// Hand a written response to its leaser, or the channel back to the pool when the leaser
    /// gave up waiting. Returns whether the leaser was still waiting.
    pub fn signal_ready(&self, control: &ControlBlock, channel: u32) -> Result<bool, ShmError> {
        let Some(sync) = control.response_sync(channel) else {
            return Ok(false);
        };

        if sync.answer() {
            sync.ready.post()?;
            Ok(true)
        } else {
            sync.lock.post()?;
            Ok(false)
        }
    }

    /// Wait for at most one poll slice for the response on `channel`.
    pub fn await_ready(
        &self,
        control: &ControlBlock,
        channel: u32,
        slice: std::time::Duration,
    ) -> Result<TimedWait, ShmError> {
        match control.response_sync(channel) {
            Some(sync) => sync.ready.wait_timeout(slice),
            None => Ok(TimedWait::TimedOut),
        }
    }

    /// The buffer of `channel`.
    ///
    /// Owned by the worker while the channel is leased and not yet ready, afterwards by the
    /// leaser until it unleases.
    pub fn buffer(&self, channel: u32) -> Option<&Mapping> {
        self.buffers.get(channel as usize)
    }
}

impl Drop for ResponsePool {
    fn drop(&mut self) {
        if self.owner {
            for name in &self.names {
                Segment::unlink_quiet(name);
            }
        }
    }
}

//! The client side of a worker: typed wrappers around its command channel.
//!
//! Scans return their records out of band. A [`Cursor`] or [`RangeScan`] is keyed by this
//! process's pid and an operation id unique within it, which also names the segment the worker
//! fills for it.
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};

use kv_ipc::batch::Records;
use kv_ipc::frame::{FrameError, FrameReader};
use kv_ipc::{
    names, BatchState, Channel, CursorKey, Endpoint, Error, IpcConfig, Mapping, OpenOptions,
    Protection, RangeOptions, Request, Response, Segment, Status, WorkerId, WorkerState,
};

use crate::manager::ManagerClient;

static NEXT_OPERATION: AtomicU64 = AtomicU64::new(1);

fn next_key() -> CursorKey {
    CursorKey {
        pid: std::process::id(),
        operation: NEXT_OPERATION.fetch_add(1, Ordering::Relaxed),
    }
}

pub struct WorkerClient {
    config: IpcConfig,
    worker: WorkerId,
    channel: Channel,
}

/// An open scan over the whole relation.
pub struct Cursor<'c> {
    client: &'c WorkerClient,
    key: CursorKey,
    name: String,
    mapping: Option<Mapping>,
    closed: bool,
}

/// An open range query.
pub struct RangeScan<'c> {
    client: &'c WorkerClient,
    key: CursorKey,
    name: String,
    options: RangeOptions,
    started: bool,
    mapping: Option<Mapping>,
    closed: bool,
}

/// One batch of records, valid until the next one is requested.
#[derive(Clone, Copy, Debug)]
pub struct Batch<'a> {
    pub has_more: bool,
    pub data: &'a [u8],
}

impl<'a> Batch<'a> {
    pub fn records(&self) -> Records<'a> {
        Records::new(self.data)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl WorkerClient {
    /// Attach to `worker`, asking the manager to provision it when it is missing or terminated.
    pub fn connect(config: &IpcConfig, worker: WorkerId) -> Result<Self, Error> {
        match Channel::open(config, Endpoint::Worker(worker)) {
            Ok(channel) if !channel.control().state().is_terminal() => {
                return Ok(WorkerClient::new(config, worker, channel))
            }
            Ok(_) | Err(Error::NotProvisioned { .. }) => {}
            Err(err) => return Err(err),
        }

        tracing::debug!(worker, "asking the manager to provision worker");
        ManagerClient::connect(config)?.launch(worker)?;

        let channel = Channel::open(config, Endpoint::Worker(worker))?;
        Ok(WorkerClient::new(config, worker, channel))
    }

    /// Attach to `worker` without involving the manager.
    pub fn attach(config: &IpcConfig, worker: WorkerId) -> Result<Self, Error> {
        let channel = Channel::open(config, Endpoint::Worker(worker))?;
        Ok(WorkerClient::new(config, worker, channel))
    }

    fn new(config: &IpcConfig, worker: WorkerId, channel: Channel) -> Self {
        WorkerClient {
            config: config.clone(),
            worker,
            channel,
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn state(&self) -> WorkerState {
        self.channel.control().state()
    }

    /// The largest request body that fits one frame. A Put body is the key with its eight byte
    /// length, then the value.
    pub fn max_body(&self) -> usize {
        self.channel.max_body()
    }

    fn call(&self, request: &Request<'_>) -> Result<Response, Error> {
        self.channel.call(self.worker, request)
    }

    /// Open the relation at `path`. Returns how many opens are outstanding.
    pub fn open(&self, path: &str, options: OpenOptions) -> Result<u32, Error> {
        let response = self.call(&Request::Open { options, path })?;
        Ok(FrameReader::new(&response.body).read_u32()?)
    }

    /// `None` when the relation was not open.
    pub fn close(&self) -> Result<Option<u32>, Error> {
        let response = self.call(&Request::Close)?;
        if response.envelope.status == Status::Failure {
            return Ok(None);
        }

        Ok(Some(FrameReader::new(&response.body).read_u32()?))
    }

    pub fn count(&self) -> Result<u64, Error> {
        let response = self.call(&Request::Count)?;
        Ok(FrameReader::new(&response.body).read_u64()?)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool, Error> {
        let response = self.call(&Request::Put { key, value })?;
        Ok(response.envelope.status == Status::Success)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let response = self.call(&Request::Get { key })?;
        Ok(match response.envelope.status {
            Status::Success => Some(response.body),
            _ => None,
        })
    }

    pub fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        let response = self.call(&Request::Delete { key })?;
        Ok(response.envelope.status == Status::Success)
    }

    /// Store a record without waiting for the worker to do so.
    pub fn load(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.channel.send(self.worker, &Request::Load { key, value })
    }

    /// Ask the worker itself to exit. Its shared memory stays until the manager retires it.
    ///
    /// A worker that was never started is left alone.
    pub fn terminate(&self) -> Result<(), Error> {
        if !self.channel.control().is_started() {
            tracing::debug!(worker = self.worker, "worker never started, nothing to terminate");
            return Ok(());
        }

        self.call(&Request::Terminate)?;
        Ok(())
    }

    pub fn scan(&self) -> Cursor<'_> {
        let key = next_key();
        Cursor {
            client: self,
            key,
            name: names::read_batch(&self.config.prefix, key.pid, self.worker, key.operation),
            mapping: None,
            closed: false,
        }
    }

    pub fn range(&self, options: RangeOptions) -> RangeScan<'_> {
        let key = next_key();
        RangeScan {
            client: self,
            key,
            name: names::range_query(&self.config.prefix, key.pid, self.worker, key.operation),
            options,
            started: false,
            mapping: None,
            closed: false,
        }
    }
}

/// Map the first `size` bytes the worker placed into segment `name`.
fn map_batch(name: &str, size: u64) -> Result<Option<Mapping>, Error> {
    if size == 0 {
        return Ok(None);
    }

    let segment = Segment::open(name)?;
    let len = segment.len()?;
    let size = usize::try_from(size).unwrap_or(usize::MAX);

    if size > len {
        return Err(FrameError::Truncated {
            offset: len,
            wanted: size,
        }
        .into());
    }

    Ok(Some(segment.map(size, Protection::ReadOnly)?))
}

fn view(mapping: Option<&Mapping>) -> &[u8] {
    match mapping {
        // Safety: the worker is done with the segment once it answered.
        Some(mapping) => unsafe { mapping.as_slice() },
        None => &[],
    }
}

impl Cursor<'_> {
    pub fn key(&self) -> CursorKey {
        self.key
    }

    /// Fetch the next batch. An exhausted cursor keeps returning empty batches.
    pub fn next_batch(&mut self) -> Result<Batch<'_>, Error> {
        self.mapping = None;

        let response = self.client.call(&Request::ReadBatch { cursor: self.key })?;
        let state = BatchState::decode(&response.body)?;
        self.mapping = map_batch(&self.name, state.size)?;

        Ok(Batch {
            has_more: state.has_more,
            data: view(self.mapping.as_ref()),
        })
    }

    pub fn close(mut self) -> Result<(), Error> {
        self.release()
    }

    fn release(&mut self) -> Result<(), Error> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }

        self.mapping = None;
        Segment::unlink_stale(&self.name);
        self.client
            .call(&Request::CloseCursor { cursor: self.key })?;
        Ok(())
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(worker = self.client.worker, %err, "could not close cursor");
        }
    }
}

impl RangeScan<'_> {
    pub fn key(&self) -> CursorKey {
        self.key
    }

    /// Fetch the next non-empty chunk, or the final empty one.
    pub fn next_chunk(&mut self) -> Result<Batch<'_>, Error> {
        self.mapping = None;

        // Only the first request of a key carries its options.
        let options = (!self.started).then_some(Cow::Borrowed(&self.options));
        let response = self.client.call(&Request::RangeQuery {
            cursor: self.key,
            options,
        })?;
        self.started = true;

        let state = BatchState::decode(&response.body)?;
        self.mapping = map_batch(&self.name, state.size)?;

        Ok(Batch {
            has_more: state.has_more,
            data: view(self.mapping.as_ref()),
        })
    }

    pub fn close(mut self) -> Result<(), Error> {
        self.release()
    }

    fn release(&mut self) -> Result<(), Error> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }

        self.mapping = None;
        self.client
            .call(&Request::ClearRangeQuery { cursor: self.key })?;
        Ok(())
    }
}

impl Drop for RangeScan<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(worker = self.client.worker, %err, "could not clear range query");
        }
    }
}

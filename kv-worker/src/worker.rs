//! The receive loop of a worker.
//!
//! A worker attaches to the command channel provisioned for its id, then serves one request at a
//! time until it is told to terminate, its lifecycle word moves to `Terminating`, or an external
//! stop flag is raised. Whatever way the loop ends, dropping the worker releases every cursor and
//! range still registered, unlinks their segments, closes the connection and tells the manager.
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kv_ipc::{
    names, BatchState, Channel, CursorKey, Endpoint, Error, Inbox, Incoming, IpcConfig,
    OpenOptions, Protection, RangeOptions, Reply, Request, Segment, WorkerId, WorkerState,
};

use crate::manager::ManagerClient;
use crate::registry::{RangeQueryState, Registry};
use crate::storage::{Connection, Engine};

/// How long the exit notification may wait for the manager inbox.
const NOTIFY_TIMEOUT: Duration = Duration::from_millis(200);

/// The open relation of a worker.
///
/// `refs` counts Open minus Close requests. It is bookkeeping only: the connection stays open when
/// it drops to zero and is closed when the worker exits.
pub struct WorkerRecord<C> {
    pub relation: WorkerId,
    pub refs: u32,
    conn: C,
}

type Cursors<E> = Registry<<<E as Engine>::Connection as Connection>::Cursor>;
type Ranges<E> = Registry<RangeQueryState<<<E as Engine>::Connection as Connection>::Range>>;

pub struct Worker<E: Engine> {
    id: WorkerId,
    prefix: String,
    batch_capacity: usize,
    poll: Duration,
    inbox: Inbox,
    manager: Option<ManagerClient>,
    engine: E,
    record: Option<WorkerRecord<E::Connection>>,
    cursors: Cursors<E>,
    ranges: Ranges<E>,
    running: bool,
}

const NOT_OPEN: &str = "relation is not open";

fn outcome(accepted: bool) -> Reply {
    if accepted {
        Reply::success()
    } else {
        Reply::failure()
    }
}

impl<E: Engine> Worker<E> {
    /// Attach to the channel provisioned for `id`.
    ///
    /// The manager inbox is optional: without one, lifecycle notifications are skipped.
    pub fn attach(config: &IpcConfig, id: WorkerId, engine: E) -> Result<Self, Error> {
        config.validate()?;
        let inbox = Inbox::new(Channel::open(config, Endpoint::Worker(id))?);

        let manager = match ManagerClient::connect(config) {
            Ok(manager) => Some(manager),
            Err(Error::NotProvisioned { .. }) => {
                tracing::debug!(worker = id, "no manager inbox, not sending notifications");
                None
            }
            Err(err) => return Err(err),
        };

        Ok(Worker {
            id,
            prefix: config.prefix.clone(),
            batch_capacity: config.batch_capacity,
            poll: config.poll_interval,
            inbox,
            manager,
            engine,
            record: None,
            cursors: Registry::new(),
            ranges: Registry::new(),
            running: false,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn record(&self) -> Option<&WorkerRecord<E::Connection>> {
        self.record.as_ref()
    }

    pub fn run(self) -> Result<(), Error> {
        self.run_until(&AtomicBool::new(false))
    }

    /// Serve until terminated or until `stop` is raised.
    pub fn run_until(mut self, stop: &AtomicBool) -> Result<(), Error> {
        let control = self.inbox.control();
        control.set_worker_pid(std::process::id());

        if let Err(state) = control.advance(WorkerState::Ready) {
            tracing::warn!(worker = self.id, ?state, "attached outside of a launch");
        }

        self.notify(Request::Ready);
        let _ = self.inbox.control().advance(WorkerState::Running);
        tracing::info!(worker = self.id, pid = std::process::id(), "worker running");

        self.running = true;
        while self.running {
            if stop.load(Ordering::Acquire) {
                tracing::info!(worker = self.id, "stop requested");
                break;
            }

            match self.inbox.recv_timeout(self.poll)? {
                Some(incoming) => self.dispatch(incoming)?,
                None if self.inbox.control().state().is_terminal() => break,
                None => {}
            }
        }

        Ok(())
    }

    fn dispatch(&mut self, incoming: Incoming) -> Result<(), Error> {
        let envelope = incoming.envelope;

        let request = match Request::decode(envelope.op, &incoming.body) {
            Ok(request) => request,
            Err(err) => {
                tracing::error!(worker = self.id, %err, op = ?envelope.op, "malformed request");
                self.inbox
                    .reply(&envelope, &Reply::exception(format!("malformed request: {err}")))?;
                return Err(err.into());
            }
        };

        tracing::debug!(worker = self.id, op = ?envelope.op, channel = envelope.channel, "dispatch");

        let reply = if envelope.target != self.id {
            Reply::exception(format!(
                "request for relation {} reached worker {}",
                envelope.target, self.id
            ))
        } else {
            match self.handle(request) {
                Ok(reply) => reply,
                Err(err) => {
                    // Fatal: answer so the caller does not wait for a dead worker, then stop.
                    let _ = self.inbox.reply(&envelope, &Reply::exception(err.to_string()));
                    return Err(err);
                }
            }
        };

        self.inbox.reply(&envelope, &reply)
    }

    fn handle(&mut self, request: Request<'_>) -> Result<Reply, Error> {
        Ok(match request {
            Request::Open { options, path } => self.open(&options, path),
            Request::Close => self.close(),
            Request::Count => self.with_conn(|conn| Reply::count(conn.count())),
            Request::Put { key, value } => self.put(key, value),
            Request::Get { key } => self.with_conn(|conn| match conn.get(key) {
                Some(value) => Reply::bytes(value),
                None => Reply::failure(),
            }),
            Request::Delete { key } => self.with_conn_mut(|conn| outcome(conn.delete(key))),
            Request::Load { key, value } => self.put(key, value),
            Request::ReadBatch { cursor } => self.read_batch(cursor)?,
            Request::CloseCursor { cursor } => self.close_cursor(cursor),
            Request::RangeQuery { cursor, options } => {
                self.range_query(cursor, options.map(|options| options.into_owned()))?
            }
            Request::ClearRangeQuery { cursor } => self.clear_range_query(cursor),
            Request::Terminate => {
                tracing::info!(worker = self.id, "terminating on request");
                let _ = self.inbox.control().advance(WorkerState::Terminating);
                self.running = false;
                Reply::success()
            }
            Request::Launch | Request::Ready | Request::Destroyed => {
                Reply::exception("not a worker operation")
            }
        })
    }

    fn with_conn(&self, f: impl FnOnce(&E::Connection) -> Reply) -> Reply {
        match &self.record {
            Some(record) => f(&record.conn),
            None => Reply::exception(NOT_OPEN),
        }
    }

    fn with_conn_mut(&mut self, f: impl FnOnce(&mut E::Connection) -> Reply) -> Reply {
        match &mut self.record {
            Some(record) => f(&mut record.conn),
            None => Reply::exception(NOT_OPEN),
        }
    }

    /// Opens the connection on the first Open only; later ones just count.
    fn open(&mut self, options: &OpenOptions, path: &str) -> Reply {
        if let Some(record) = &mut self.record {
            record.refs += 1;
            tracing::debug!(worker = self.id, refs = record.refs, "relation opened again");
            return Reply::ref_count(record.refs);
        }

        match self.engine.open(path, options) {
            Ok(conn) => {
                tracing::info!(worker = self.id, path, "relation opened");
                self.record = Some(WorkerRecord {
                    relation: self.id,
                    refs: 1,
                    conn,
                });
                Reply::ref_count(1)
            }
            Err(err) => Reply::exception(err.to_string()),
        }
    }

    fn close(&mut self) -> Reply {
        match &mut self.record {
            Some(record) => {
                record.refs = record.refs.saturating_sub(1);
                tracing::debug!(worker = self.id, refs = record.refs, "relation closed");
                Reply::ref_count(record.refs)
            }
            None => Reply::failure(),
        }
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Reply {
        self.with_conn_mut(|conn| outcome(conn.put(key, value)))
    }

    fn read_batch(&mut self, key: CursorKey) -> Result<Reply, Error> {
        let Some(record) = &self.record else {
            return Ok(Reply::exception(NOT_OPEN));
        };

        let cursor = self
            .cursors
            .get_or_try_insert_with(key, || Ok::<_, Error>(record.conn.new_cursor()))?;

        let name = names::read_batch(&self.prefix, key.pid, self.id, key.operation);
        // A crashed client may have left the previous batch of this key behind.
        let segment = Segment::recreate(&name, self.batch_capacity)?;
        let mapping = segment.map(self.batch_capacity, Protection::ReadWrite)?;

        // Safety: the client maps the segment only after our response.
        let out = unsafe { mapping.as_mut_slice() };
        Ok(match record.conn.batch_read(cursor, out) {
            Ok(state) => Reply::batch(state),
            Err(err) => Reply::exception(err.to_string()),
        })
    }

    fn close_cursor(&mut self, key: CursorKey) -> Reply {
        if let Some(cursor) = self.cursors.remove(&key) {
            if let Some(record) = &self.record {
                record.conn.close_cursor(cursor);
            }
        }

        Reply::success()
    }

    fn range_query(&mut self, key: CursorKey, options: Option<RangeOptions>) -> Result<Reply, Error> {
        let Some(record) = &self.record else {
            return Ok(Reply::exception(NOT_OPEN));
        };

        let created = self.ranges.get_or_try_insert_with(key, || {
            let options = options.unwrap_or_default();
            record
                .conn
                .new_range(&options)
                .map(|range| RangeQueryState { range, options })
        });

        let state = match created {
            Ok(state) => state,
            Err(err) => return Ok(Reply::exception(err.to_string())),
        };

        // Empty chunks are not the end of the stream as long as more is promised.
        let chunk = loop {
            match record.conn.range_read(&mut state.range) {
                Ok(chunk) if chunk.data.is_empty() && chunk.has_more => continue,
                Ok(chunk) => break chunk,
                Err(err) => return Ok(Reply::exception(err.to_string())),
            }
        };

        let name = names::range_query(&self.prefix, key.pid, self.id, key.operation);
        Segment::unlink_stale(&name);

        if !chunk.data.is_empty() {
            let segment = Segment::create(&name, chunk.data.len())?;
            let mapping = segment.map(chunk.data.len(), Protection::ReadWrite)?;
            // Safety: freshly created, nobody else has it mapped.
            unsafe { mapping.as_mut_slice() }.copy_from_slice(&chunk.data);
        }

        Ok(Reply::batch(BatchState {
            has_more: chunk.has_more,
            size: chunk.data.len() as u64,
        }))
    }

    fn clear_range_query(&mut self, key: CursorKey) -> Reply {
        if let Some(state) = self.ranges.remove(&key) {
            if let Some(record) = &self.record {
                record.conn.close_range(state.range);
            }

            Segment::unlink_stale(&names::range_query(
                &self.prefix,
                key.pid,
                self.id,
                key.operation,
            ));
        }

        Reply::success()
    }

    fn notify(&self, request: Request<'_>) {
        let Some(manager) = &self.manager else {
            return;
        };

        if let Err(err) = manager.notify(self.id, &request, NOTIFY_TIMEOUT) {
            tracing::warn!(worker = self.id, %err, op = ?request.op(), "could not notify manager");
        }
    }
}

impl<E: Engine> Drop for Worker<E> {
    fn drop(&mut self) {
        let record = self.record.take();

        for (key, cursor) in self.cursors.drain() {
            if let Some(record) = &record {
                record.conn.close_cursor(cursor);
            }
            Segment::unlink_stale(&names::read_batch(&self.prefix, key.pid, self.id, key.operation));
        }

        for (key, state) in self.ranges.drain() {
            if let Some(record) = &record {
                record.conn.close_range(state.range);
            }
            Segment::unlink_stale(&names::range_query(&self.prefix, key.pid, self.id, key.operation));
        }

        if let Some(record) = record {
            tracing::info!(worker = self.id, refs = record.refs, "closing relation");
            record.conn.close();
        }

        let _ = self.inbox.control().advance(WorkerState::Terminated);
        self.notify(Request::Destroyed);
        tracing::info!(worker = self.id, "worker exited");
    }
}

#[cfg(test)]
mod tests;

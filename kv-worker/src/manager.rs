//! The worker lifecycle manager.
//!
//! The manager serves an inbox of its own. `Launch` provisions the control block and response
//! buffers of a worker and starts a supervisor thread for it; the worker itself is only launched
//! when the first request arrives, through the start handshake on its control block. `Terminate`
//! stops a worker and tears its shared memory down. Workers report `Ready` and `Destroyed`.
//!
//! All teardown also runs from `Drop`, so an early return or a panic unwinding through the
//! manager still removes every segment it provisioned.
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kv_ipc::{
    Channel, Endpoint, Error, Inbox, Incoming, IpcConfig, Reply, Request, TimedWait, WorkerId,
    WorkerState,
};

use crate::launch::{Launcher, WorkerHandle};

/// The client side of the manager inbox.
pub struct ManagerClient {
    channel: Channel,
}

impl ManagerClient {
    pub fn connect(config: &IpcConfig) -> Result<Self, Error> {
        Ok(ManagerClient {
            channel: Channel::open(config, Endpoint::Manager)?,
        })
    }

    /// Provision `worker` unless it is already healthy.
    pub fn launch(&self, worker: WorkerId) -> Result<(), Error> {
        self.channel.call(worker, &Request::Launch)?;
        Ok(())
    }

    /// Stop `worker` and remove its shared memory. Unknown workers are ignored.
    pub fn terminate(&self, worker: WorkerId) -> Result<(), Error> {
        self.channel.call(worker, &Request::Terminate)?;
        Ok(())
    }

    /// Send a lifecycle notification about `worker`, waiting at most `timeout` for the inbox.
    pub fn notify(&self, worker: WorkerId, request: &Request<'_>, timeout: Duration) -> Result<(), Error> {
        self.channel.send_within(worker, request, Some(timeout))
    }
}

/// Shared between the manager and the supervisor thread of one worker.
struct Supervised {
    id: WorkerId,
    channel: Channel,
    handle: Mutex<Option<Box<dyn WorkerHandle>>>,
    stop: AtomicBool,
}

struct WorkerSlot {
    shared: Arc<Supervised>,
    supervisor: Option<JoinHandle<()>>,
}

pub struct Manager {
    config: IpcConfig,
    inbox: Inbox,
    launcher: Arc<dyn Launcher>,
    workers: Mutex<HashMap<WorkerId, WorkerSlot>>,
}

/// A manager serving its inbox on a thread of its own.
pub struct ManagerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<(), Error>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Manager {
    /// Provision the manager inbox, replacing a stale one of a crashed manager.
    pub fn new(config: IpcConfig, launcher: impl Launcher) -> Result<Self, Error> {
        let channel = Channel::create(&config, Endpoint::Manager)?;

        let control = channel.control();
        control.set_worker_pid(std::process::id());
        for state in [WorkerState::Starting, WorkerState::Ready, WorkerState::Running] {
            let _ = control.advance(state);
        }
        control.set_started();

        tracing::info!(prefix = %config.prefix, "manager inbox ready");

        Ok(Manager {
            config,
            inbox: Inbox::new(channel),
            launcher: Arc::new(launcher),
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Run a manager on a new thread until the handle is shut down or dropped.
    pub fn spawn(config: IpcConfig, launcher: impl Launcher) -> Result<ManagerHandle, Error> {
        let mut manager = Manager::new(config, launcher)?;
        let stop = Arc::new(AtomicBool::new(false));

        let thread = thread::Builder::new().name("kv-manager".into()).spawn({
            let stop = stop.clone();
            move || manager.run(&stop)
        })?;

        Ok(ManagerHandle {
            stop,
            thread: Some(thread),
        })
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    /// Serve the inbox until `stop` is raised, then shut every worker down.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), Error> {
        let result = self.serve(stop);
        if let Err(err) = &result {
            tracing::error!(%err, "manager inbox failed");
        }

        self.shutdown();
        result
    }

    fn serve(&mut self, stop: &AtomicBool) -> Result<(), Error> {
        while !stop.load(Ordering::Acquire) {
            match self.inbox.recv_timeout(self.config.poll_interval)? {
                Some(incoming) => self.dispatch(incoming)?,
                None => self.reap(),
            }
        }

        Ok(())
    }

    fn dispatch(&self, incoming: Incoming) -> Result<(), Error> {
        let envelope = incoming.envelope;
        let worker = envelope.target;

        let request = match Request::decode(envelope.op, &incoming.body) {
            Ok(request) => request,
            Err(err) => {
                self.inbox
                    .reply(&envelope, &Reply::exception(format!("malformed request: {err}")))?;
                return Err(err.into());
            }
        };

        let reply = match request {
            Request::Launch => match self.launch(worker) {
                Ok(()) => Reply::success(),
                Err(err) => Reply::exception(err.to_string()),
            },
            Request::Terminate => {
                self.terminate(worker);
                Reply::success()
            }
            Request::Ready => {
                tracing::info!(worker, "worker ready");
                Reply::success()
            }
            Request::Destroyed => {
                tracing::info!(worker, "worker destroyed");
                self.reap();
                Reply::success()
            }
            other => Reply::exception(format!("{:?} is not a manager operation", other.op())),
        };

        self.inbox.reply(&envelope, &reply)
    }

    /// Provision `worker`. Idempotent while the worker is healthy.
    pub fn launch(&self, worker: WorkerId) -> Result<(), Error> {
        let mut workers = lock(&self.workers);

        if let Some(slot) = workers.get(&worker) {
            let state = slot.shared.channel.control().state();
            if !state.is_terminal() {
                tracing::debug!(worker, ?state, "already provisioned");
                return Ok(());
            }
        }

        if let Some(stale) = workers.remove(&worker) {
            tracing::info!(worker, "replacing terminated worker");
            retire(stale);
        }

        let shared = Arc::new(Supervised {
            id: worker,
            channel: Channel::create(&self.config, Endpoint::Worker(worker))?,
            handle: Mutex::new(None),
            stop: AtomicBool::new(false),
        });

        let supervisor = thread::Builder::new()
            .name(format!("kv-supervisor-{worker}"))
            .spawn({
                let shared = shared.clone();
                let launcher = self.launcher.clone();
                let config = self.config.clone();
                move || supervise(&shared, &*launcher, &config)
            })?;

        workers.insert(
            worker,
            WorkerSlot {
                shared,
                supervisor: Some(supervisor),
            },
        );

        tracing::info!(worker, "worker provisioned");
        Ok(())
    }

    /// Stop `worker` and tear its shared memory down. A no-op for unknown workers.
    pub fn terminate(&self, worker: WorkerId) {
        let slot = lock(&self.workers).remove(&worker);

        match slot {
            Some(slot) => retire(slot),
            None => tracing::debug!(worker, "nothing to terminate"),
        }
    }

    pub fn state(&self, worker: WorkerId) -> Option<WorkerState> {
        lock(&self.workers)
            .get(&worker)
            .map(|slot| slot.shared.channel.control().state())
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        let mut ids: Vec<_> = lock(&self.workers).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Mark workers whose process or thread is gone as terminated.
    fn reap(&self) {
        for slot in lock(&self.workers).values() {
            let control = slot.shared.channel.control();
            if control.state() == WorkerState::Terminated {
                continue;
            }

            let exited = lock(&slot.shared.handle)
                .as_mut()
                .is_some_and(|handle| !handle.is_alive());

            if exited {
                tracing::warn!(worker = slot.shared.id, "worker exited unexpectedly");
                let _ = control.advance(WorkerState::Terminated);
            }
        }
    }

    /// Terminate every worker and tear down all shared memory but the inbox.
    pub fn shutdown(&self) {
        let slots: Vec<_> = lock(&self.workers).drain().map(|(_, slot)| slot).collect();

        if !slots.is_empty() {
            tracing::info!(workers = slots.len(), "shutting down workers");
        }

        for slot in slots {
            retire(slot);
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ManagerHandle {
    pub fn shutdown(mut self) -> Result<(), Error> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<(), Error> {
        self.stop.store(true, Ordering::Release);

        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| Error::Io(io::Error::other("manager thread panicked")))?,
            None => Ok(()),
        }
    }
}

impl Drop for ManagerHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop_and_join() {
            tracing::warn!(%err, "manager did not shut down cleanly");
        }
    }
}

/// Answer start requests on the handshake of one worker until stopped.
fn supervise(shared: &Supervised, launcher: &dyn Launcher, config: &IpcConfig) {
    let control = shared.channel.control();

    while !shared.stop.load(Ordering::Acquire) {
        match control.agent(0).wait_timeout(config.poll_interval) {
            Ok(TimedWait::Acquired) => {}
            Ok(TimedWait::TimedOut) => continue,
            Err(err) => {
                tracing::error!(worker = shared.id, %err, "supervisor failed");
                return;
            }
        }

        if !control.is_started() {
            start(shared, launcher, config);
        }

        if let Err(err) = control.agent(1).post() {
            tracing::error!(worker = shared.id, %err, "supervisor failed");
            return;
        }
    }
}

fn start(shared: &Supervised, launcher: &dyn Launcher, config: &IpcConfig) {
    let control = shared.channel.control();

    if let Err(state) = control.advance(WorkerState::Starting) {
        tracing::warn!(worker = shared.id, ?state, "refusing to start worker");
        return;
    }

    match launcher.launch(shared.id, config) {
        Ok(handle) => {
            tracing::info!(worker = shared.id, pid = ?handle.pid(), "worker launched");
            *lock(&shared.handle) = Some(handle);
            control.set_started();
        }
        Err(err) => {
            tracing::error!(worker = shared.id, %err, "worker launch failed");
            let _ = control.advance(WorkerState::Terminated);
        }
    }
}

/// Stop one worker and release its shared memory.
fn retire(mut slot: WorkerSlot) {
    let shared = &slot.shared;
    let control = shared.channel.control();
    shared.stop.store(true, Ordering::Release);

    let answered = control.is_started()
        && !control.state().is_terminal()
        && match shared.channel.call(shared.id, &Request::Terminate) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(worker = shared.id, %err, "worker did not acknowledge termination");
                false
            }
        };

    if !answered {
        // Running loops notice this between two polls.
        let _ = control.advance(WorkerState::Terminating);
    }

    if let Some(mut handle) = lock(&shared.handle).take() {
        if !answered && handle.is_alive() {
            if let Err(err) = handle.kill() {
                tracing::debug!(worker = shared.id, %err, "cannot kill worker, waiting for it");
            }
        }

        if let Err(err) = handle.wait() {
            tracing::warn!(worker = shared.id, %err, "could not wait for worker");
        }
    }

    let _ = control.advance(WorkerState::Terminated);

    if let Some(supervisor) = slot.supervisor.take() {
        if supervisor.join().is_err() {
            tracing::error!(worker = shared.id, "supervisor thread panicked");
        }
    }

    tracing::info!(worker = shared.id, "worker retired");
    // Dropping the last reference to the channel destroys and unlinks its shared memory.
}

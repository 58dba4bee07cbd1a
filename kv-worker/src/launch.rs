//! Ways to bring a worker to life once its control block is provisioned.
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use kv_ipc::{Error, IpcConfig, WorkerId};

use crate::memory::MemoryEngine;
use crate::worker::Worker;

pub trait Launcher: Send + Sync + 'static {
    /// Start worker `id`. It attaches to its channel by itself.
    fn launch(&self, id: WorkerId, config: &IpcConfig) -> io::Result<Box<dyn WorkerHandle>>;
}

/// A running worker as seen by the manager.
pub trait WorkerHandle: Send {
    /// The OS process, if the worker has one of its own.
    fn pid(&self) -> Option<u32>;

    fn is_alive(&mut self) -> bool;

    /// Block until the worker exited.
    fn wait(&mut self) -> io::Result<()>;

    fn kill(&mut self) -> io::Result<()>;
}

/// Runs `<program> <config args> worker --id <id>`.
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        ProcessLauncher {
            program: program.into(),
        }
    }

    /// The same binary as the running one.
    pub fn current_exe() -> io::Result<Self> {
        Ok(ProcessLauncher::new(std::env::current_exe()?))
    }

    fn command(&self, id: WorkerId, config: &IpcConfig) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--prefix")
            .arg(&config.prefix)
            .arg("--database")
            .arg(config.database.to_string())
            .arg("--channels")
            .arg(config.channels.to_string())
            .arg("--frame-capacity")
            .arg(config.frame_capacity.to_string())
            .arg("--batch-capacity")
            .arg(config.batch_capacity.to_string())
            .arg("--response-timeout-ms")
            // Zero means no deadline, so a bounded timeout is at least one millisecond.
            .arg(millis(config.response_timeout).to_string())
            .arg("--poll-interval-ms")
            .arg((config.poll_interval.as_millis() as u64).to_string())
            .arg("worker")
            .arg("--id")
            .arg(id.to_string());
        command
    }
}

fn millis(timeout: Option<Duration>) -> u64 {
    timeout.map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX).max(1))
}

impl Launcher for ProcessLauncher {
    fn launch(&self, id: WorkerId, config: &IpcConfig) -> io::Result<Box<dyn WorkerHandle>> {
        let child = self.command(id, config).spawn()?;
        tracing::info!(worker = id, pid = child.id(), "spawned worker process");
        Ok(Box::new(ChildHandle { child }))
    }
}

struct ChildHandle {
    child: Child,
}

impl WorkerHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn wait(&mut self) -> io::Result<()> {
        let status = self.child.wait()?;
        if !status.success() {
            tracing::warn!(pid = self.child.id(), %status, "worker process failed");
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.kill() {
            // Already reaped.
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

type WorkerMain = dyn Fn(WorkerId, IpcConfig) -> Result<(), Error> + Send + Sync;

/// Runs workers on threads of the current process.
#[derive(Clone)]
pub struct ThreadLauncher {
    main: Arc<WorkerMain>,
}

impl ThreadLauncher {
    pub fn new<F>(main: F) -> Self
    where
        F: Fn(WorkerId, IpcConfig) -> Result<(), Error> + Send + Sync + 'static,
    {
        ThreadLauncher {
            main: Arc::new(main),
        }
    }

    /// Workers serving fresh [`MemoryEngine`]s.
    pub fn memory() -> Self {
        ThreadLauncher::new(|id, config| Worker::attach(&config, id, MemoryEngine::new())?.run())
    }
}

impl Launcher for ThreadLauncher {
    fn launch(&self, id: WorkerId, config: &IpcConfig) -> io::Result<Box<dyn WorkerHandle>> {
        let main = self.main.clone();
        let config = config.clone();

        let thread = std::thread::Builder::new()
            .name(format!("kv-worker-{id}"))
            .spawn(move || {
                let result = main(id, config);
                if let Err(err) = &result {
                    tracing::error!(worker = id, %err, "worker failed");
                }
                result
            })?;

        Ok(Box::new(ThreadHandle {
            thread: Some(thread),
        }))
    }
}

struct ThreadHandle {
    thread: Option<JoinHandle<Result<(), Error>>>,
}

impl WorkerHandle for ThreadHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_alive(&mut self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }

    fn wait(&mut self) -> io::Result<()> {
        match self.thread.take().map(JoinHandle::join) {
            Some(Err(_)) => Err(io::Error::other("worker thread panicked")),
            // The worker logged its own error.
            Some(Ok(_)) | None => Ok(()),
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "threads cannot be killed",
        ))
    }
}

#[test]
fn worker_arguments() {
    let config = IpcConfig::with_prefix("pfx").batch_capacity(4096);
    let command = ProcessLauncher::new("/bin/kv-worker").command(9, &config);
    let args: Vec<_> = command
        .get_args()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    assert_eq!(args[..2], ["--prefix", "pfx"]);
    assert_eq!(args[args.len() - 3..], ["worker", "--id", "9"]);
    let batch = args.iter().position(|arg| arg == "--batch-capacity").unwrap();
    assert_eq!(args[batch + 1], "4096");
}

#[test]
fn short_timeouts_stay_bounded() {
    assert_eq!(millis(None), 0);
    assert_eq!(millis(Some(Duration::from_micros(500))), 1);
    assert_eq!(millis(Some(Duration::ZERO)), 1);
    assert_eq!(millis(Some(Duration::from_millis(1500))), 1500);

    let config = IpcConfig::with_prefix("pfx").response_timeout(Some(Duration::from_micros(10)));
    let command = ProcessLauncher::new("/bin/kv-worker").command(1, &config);
    let args: Vec<_> = command
        .get_args()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    let timeout = args.iter().position(|arg| arg == "--response-timeout-ms").unwrap();
    assert_eq!(args[timeout + 1], "1");
}

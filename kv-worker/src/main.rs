use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kv_worker::{Error, IpcConfig, Manager, MemoryEngine, ProcessLauncher, Worker, WorkerId};
use tracing_subscriber::EnvFilter;

static STOP: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(about = "Shared-memory key-value manager and storage workers")]
struct Cli {
    #[command(flatten)]
    shared: SharedArgs,

    #[command(subcommand)]
    command: Command,
}

/// Must agree between the manager, its workers and every client.
#[derive(Args)]
struct SharedArgs {
    /// Namespace of all shared memory objects.
    #[arg(long, env = "KV_SHM_PREFIX", default_value = "kvshm")]
    prefix: String,

    #[arg(long, default_value_t = 0)]
    database: u32,

    /// Response channels per worker, the bound on requests in flight.
    #[arg(long, default_value_t = 16)]
    channels: u32,

    /// Bytes of the command area and of every response buffer.
    #[arg(long, default_value_t = 64 * 1024)]
    frame_capacity: usize,

    /// Bytes of one ReadBatch segment.
    #[arg(long, default_value_t = 1024 * 1024)]
    batch_capacity: usize,

    /// Bound on one request-response exchange. Zero waits forever.
    #[arg(long, default_value_t = 30_000)]
    response_timeout_ms: u64,

    /// Slice of every blocking wait.
    #[arg(long, default_value_t = 50)]
    poll_interval_ms: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the manager inbox, launching workers as this binary.
    Manager,
    /// Serve the channel of one worker. Normally started by the manager.
    Worker {
        #[arg(long)]
        id: WorkerId,
    },
}

impl SharedArgs {
    fn config(&self) -> IpcConfig {
        let timeout = match self.response_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        IpcConfig::with_prefix(self.prefix.clone())
            .database(self.database)
            .channels(self.channels)
            .frame_capacity(self.frame_capacity)
            .batch_capacity(self.batch_capacity)
            .response_timeout(timeout)
            .poll_interval(Duration::from_millis(self.poll_interval_ms))
    }
}

fn main() -> ExitCode {
    let Cli { shared, command } = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Safety: the handler only stores to an atomic.
    unsafe { stop_on_signals() };

    let config = shared.config();
    let result = match command {
        Command::Manager => run_manager(config),
        Command::Worker { id } => run_worker(config, id),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "exiting");
            ExitCode::FAILURE
        }
    }
}

fn run_manager(config: IpcConfig) -> Result<(), Error> {
    let launcher = ProcessLauncher::current_exe()?;
    Manager::new(config, launcher)?.run(&STOP)
}

fn run_worker(config: IpcConfig, id: WorkerId) -> Result<(), Error> {
    Worker::attach(&config, id, MemoryEngine::new())?.run_until(&STOP)
}

extern "C" fn raise_stop(_: libc::c_int) {
    STOP.store(true, Ordering::Release);
}

unsafe fn stop_on_signals() {
    let mut action: libc::sigaction = core::mem::zeroed();
    action.sa_sigaction = raise_stop as extern "C" fn(libc::c_int) as usize;

    libc::sigaction(libc::SIGTERM, &action, core::ptr::null_mut());
    libc::sigaction(libc::SIGINT, &action, core::ptr::null_mut());
}

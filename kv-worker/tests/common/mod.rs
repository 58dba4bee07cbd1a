#![allow(dead_code)]
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kv_worker::{IpcConfig, Launcher, WorkerHandle, WorkerId};

/// A configuration under a prefix no other test uses.
pub fn config(tag: &str) -> IpcConfig {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);

    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    IpcConfig::with_prefix(format!("kvt-{tag}-{}-{n}", std::process::id()))
        .channels(4)
        .frame_capacity(4096)
        .batch_capacity(1024)
        .response_timeout(Some(Duration::from_secs(10)))
        .poll_interval(Duration::from_millis(5))
}

/// Never manages to start a worker.
pub struct Broken;

impl Launcher for Broken {
    fn launch(&self, _: WorkerId, _: &IpcConfig) -> io::Result<Box<dyn WorkerHandle>> {
        Err(io::Error::other("no workers today"))
    }
}

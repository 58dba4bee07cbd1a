//! Storage workers of a shared-memory key-value service, the manager supervising them and the
//! client used to talk to both.
//!
//! A [`Manager`] provisions the channel of a worker when asked to; the worker process or thread
//! is started lazily by the first request reaching that channel. A [`Worker`] serves exactly one
//! relation through a storage [`Engine`](storage::Engine). Clients use [`WorkerClient`].
pub mod client;
pub mod launch;
pub mod manager;
pub mod memory;
pub mod registry;
pub mod storage;
pub mod worker;

pub use client::{Batch, Cursor, RangeScan, WorkerClient};
pub use launch::{Launcher, ProcessLauncher, ThreadLauncher, WorkerHandle};
pub use manager::{Manager, ManagerClient, ManagerHandle};
pub use memory::MemoryEngine;
pub use worker::Worker;

pub use kv_ipc::{
    BatchState, CursorKey, Error, IpcConfig, OpenOptions, RangeOptions, WorkerId, WorkerState,
};

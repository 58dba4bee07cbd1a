//! Shared-memory request/response channels between key-value clients and their workers.
//!
//! Every worker owns one command channel: a [`ControlBlock`] with a single command area guarded
//! by semaphores, and a [`ResponsePool`] of buffers leased one per in-flight request. Clients
//! produce commands through a [`Channel`], the worker consumes them through an [`Inbox`].
//! Messages are an [`Envelope`] followed by a body described by [`Request`], written with the
//! bounds-checked cursors of the [`frame`] module.
//!
//! Scans return their results out of band, through segments named by the [`names`] module and
//! filled with [`batch`] records.
pub mod batch;
mod channel;
mod config;
mod control;
mod error;
pub mod frame;
mod message;
pub mod names;
mod response;
mod state;

pub use channel::{Channel, Inbox, Incoming, Response};
pub use config::IpcConfig;
pub use control::{ControlBlock, ResponseSync};
pub use error::Error;
pub use frame::FrameError;
pub use message::{
    BatchState, CursorKey, DatabaseId, Envelope, Op, OpenOptions, RangeOptions, Reply, Request,
    Status, WorkerId, NO_CHANNEL,
};
pub use names::Endpoint;
pub use response::ResponsePool;
pub use state::WorkerState;

pub use kv_shm::{Mapping, Protection, Segment, ShmError, TimedWait};

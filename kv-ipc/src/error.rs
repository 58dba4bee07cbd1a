use std::io;
use std::time::Duration;

use kv_shm::ShmError;

use crate::frame::FrameError;
use crate::message::WorkerId;
use crate::names::Endpoint;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The shared infrastructure itself failed.
    #[error(transparent)]
    Resource(#[from] ShmError),
    /// A frame could not be written or read.
    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),
    /// The partner answered with status `Exception`.
    #[error("exception in worker: {0}")]
    Exception(String),
    #[error("{endpoint} did not answer within {waited:?}")]
    Timeout { endpoint: Endpoint, waited: Duration },
    #[error("{endpoint} is gone")]
    PartnerGone { endpoint: Endpoint },
    #[error("worker {worker} could not be launched")]
    LaunchFailed { worker: WorkerId },
    /// Nobody provisioned a control block under this name (yet).
    #[error("no control block is provisioned as `{name}`")]
    NotProvisioned { name: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

use std::time::Duration;

use crate::error::Error;
use crate::message::{DatabaseId, Envelope};
use crate::names::{self, Endpoint};

/// Parameters shared by the manager, its workers and their clients.
///
/// Channel count and frame capacity are fixed by whoever provisions a control block; parties
/// attaching later read them from the block itself.
#[derive(Clone, Debug)]
pub struct IpcConfig {
    /// Namespace of every shared-memory name.
    pub prefix: String,
    /// Stamped into every request envelope.
    pub database: DatabaseId,
    /// Response channels per control block.
    pub channels: u32,
    /// Bytes of the command area and of every response buffer.
    pub frame_capacity: usize,
    /// Size of a ReadBatch segment.
    pub batch_capacity: usize,
    /// Bound of every blocking wait of a client. `None` waits forever.
    pub response_timeout: Option<Duration>,
    /// Slice of the timed waits between liveness probes.
    pub poll_interval: Duration,
}

impl Default for IpcConfig {
    fn default() -> Self {
        IpcConfig {
            prefix: "kvshm".into(),
            database: 0,
            channels: 16,
            frame_capacity: 1 << 16,
            batch_capacity: 1 << 20,
            response_timeout: Some(Duration::from_secs(30)),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl IpcConfig {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        IpcConfig {
            prefix: prefix.into(),
            ..IpcConfig::default()
        }
    }

    pub fn database(mut self, database: DatabaseId) -> Self {
        self.database = database;
        self
    }

    pub fn channels(mut self, channels: u32) -> Self {
        self.channels = channels;
        self
    }

    pub fn frame_capacity(mut self, bytes: usize) -> Self {
        self.frame_capacity = bytes;
        self
    }

    pub fn batch_capacity(mut self, bytes: usize) -> Self {
        self.batch_capacity = bytes;
        self
    }

    pub fn response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn control_name(&self, endpoint: Endpoint) -> String {
        names::control(&self.prefix, endpoint)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.prefix.is_empty() || self.prefix.contains(['/', '\0']) {
            return Err(Error::InvalidConfig("prefix must be non-empty and free of `/`"));
        }

        if self.channels == 0 || self.channels == u32::MAX {
            return Err(Error::InvalidConfig("at least one response channel is required"));
        }

        if self.frame_capacity < Envelope::LEN {
            return Err(Error::InvalidConfig("frame capacity is smaller than an envelope"));
        }

        if self.batch_capacity == 0 {
            return Err(Error::InvalidConfig("batch capacity must not be zero"));
        }

        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll interval must not be zero"));
        }

        Ok(())
    }
}

#[test]
fn defaults_are_valid() {
    IpcConfig::default().validate().unwrap();
    assert!(IpcConfig::with_prefix("a/b").validate().is_err());
    assert!(IpcConfig::default().channels(0).validate().is_err());
    assert!(IpcConfig::default().frame_capacity(8).validate().is_err());
}

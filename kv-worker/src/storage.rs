//! The contract between a worker and its storage engine.
//!
//! A worker holds at most one [`Connection`], opened through its [`Engine`] on the first Open.
//! Cursors and ranges are engine handles the worker keeps in its registries between requests.
use std::io;

use kv_ipc::{BatchState, OpenOptions, RangeOptions};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("cannot open `{path}`: {reason}")]
    Open { path: String, reason: String },
    /// A single record is larger than the batch it has to be placed in.
    #[error("a record of {len} bytes does not fit a batch of {capacity} bytes")]
    RecordTooLarge { len: usize, capacity: usize },
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One chunk of a range query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub has_more: bool,
}

pub trait Engine {
    type Connection: Connection;

    fn open(&mut self, path: &str, options: &OpenOptions) -> Result<Self::Connection, StorageError>;
}

pub trait Connection {
    type Cursor;
    type Range;

    fn count(&self) -> u64;

    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Returns whether the engine accepted the write.
    fn put(&mut self, key: &[u8], value: &[u8]) -> bool;

    /// Returns whether the key existed.
    fn delete(&mut self, key: &[u8]) -> bool;

    fn new_cursor(&self) -> Self::Cursor;

    /// Fill `out` with the next records of the cursor, see [`kv_ipc::batch`] for the layout.
    ///
    /// An exhausted cursor keeps answering `has_more: false, size: 0`.
    fn batch_read(&self, cursor: &mut Self::Cursor, out: &mut [u8]) -> Result<BatchState, StorageError>;

    fn close_cursor(&self, cursor: Self::Cursor) {
        drop(cursor)
    }

    fn new_range(&self, options: &RangeOptions) -> Result<Self::Range, StorageError>;

    /// The next chunk of the range. A chunk may be empty while `has_more` is still set.
    fn range_read(&self, range: &mut Self::Range) -> Result<Chunk, StorageError>;

    fn close_range(&self, range: Self::Range) {
        drop(range)
    }

    fn close(self)
    where
        Self: Sized,
    {
    }
}

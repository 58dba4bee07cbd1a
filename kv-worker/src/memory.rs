//! An engine keeping every relation in a `BTreeMap`.
//!
//! Values are opaque to it, so a range projection is accepted but not applied.
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use kv_ipc::batch::{self, BatchWriter};
use kv_ipc::{BatchState, OpenOptions, RangeOptions};

use crate::storage::{Chunk, Connection, Engine, StorageError};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Chunk size of range queries that leave the choice to the engine.
const DEFAULT_CHUNK: usize = 64 * 1024;

#[derive(Default)]
pub struct MemoryEngine {
    tables: HashMap<String, Table>,
}

pub struct MemoryConnection {
    path: String,
    table: Table,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Position {
    Start,
    At(Vec<u8>),
    Done,
}

pub struct MemoryCursor {
    position: Position,
}

pub struct MemoryRange {
    position: Position,
    limit: Vec<u8>,
    capacity: usize,
}

impl MemoryEngine {
    pub fn new() -> Self {
        MemoryEngine::default()
    }

    /// Pre-populate the relation at `path`.
    pub fn with_table(
        mut self,
        path: impl Into<String>,
        entries: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    ) -> Self {
        self.tables.insert(path.into(), entries.into_iter().collect());
        self
    }
}

impl Engine for MemoryEngine {
    type Connection = MemoryConnection;

    fn open(&mut self, path: &str, options: &OpenOptions) -> Result<MemoryConnection, StorageError> {
        let table = match self.tables.remove(path) {
            Some(table) => table,
            None if options.create_if_missing => Table::new(),
            None => {
                return Err(StorageError::Open {
                    path: path.to_owned(),
                    reason: "no such relation".into(),
                })
            }
        };

        tracing::debug!(
            path,
            entries = table.len(),
            use_column = options.use_column,
            attrs = options.attr_count,
            "opened in-memory relation"
        );

        Ok(MemoryConnection {
            path: path.to_owned(),
            table,
        })
    }
}

impl Position {
    fn lower(&self) -> Option<Bound<&[u8]>> {
        match self {
            Position::Start => Some(Bound::Unbounded),
            Position::At(key) => Some(Bound::Included(key.as_slice())),
            Position::Done => None,
        }
    }
}

impl Connection for MemoryConnection {
    type Cursor = MemoryCursor;
    type Range = MemoryRange;

    fn count(&self) -> u64 {
        self.table.len() as u64
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.table.get(key).cloned()
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> bool {
        self.table.insert(key.to_vec(), value.to_vec());
        true
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        self.table.remove(key).is_some()
    }

    fn new_cursor(&self) -> MemoryCursor {
        MemoryCursor {
            position: Position::Start,
        }
    }

    fn batch_read(&self, cursor: &mut MemoryCursor, out: &mut [u8]) -> Result<BatchState, StorageError> {
        let Some(lower) = cursor.position.lower() else {
            return Ok(BatchState::default());
        };

        let mut batch = BatchWriter::new(out);
        let mut resume = None;

        for (key, value) in self.table.range::<[u8], _>((lower, Bound::Unbounded)) {
            if batch.push(key, value) {
                continue;
            }

            if batch.records() == 0 {
                return Err(StorageError::RecordTooLarge {
                    len: batch::record_len(key, value),
                    capacity: batch.capacity(),
                });
            }

            resume = Some(key.clone());
            break;
        }

        let state = BatchState {
            has_more: resume.is_some(),
            size: batch.written() as u64,
        };

        cursor.position = resume.map_or(Position::Done, Position::At);
        Ok(state)
    }

    fn new_range(&self, options: &RangeOptions) -> Result<MemoryRange, StorageError> {
        if !options.limit.is_empty() && options.start > options.limit {
            return Err(StorageError::InvalidRange(format!(
                "start {:?} lies behind limit {:?}",
                options.start, options.limit
            )));
        }

        let capacity = match options.batch_capacity {
            0 => DEFAULT_CHUNK,
            bytes => usize::try_from(bytes).unwrap_or(usize::MAX),
        };

        let position = if options.start.is_empty() {
            Position::Start
        } else {
            Position::At(options.start.clone())
        };

        Ok(MemoryRange {
            position,
            limit: options.limit.clone(),
            capacity,
        })
    }

    fn range_read(&self, range: &mut MemoryRange) -> Result<Chunk, StorageError> {
        let Some(lower) = range.position.lower() else {
            return Ok(Chunk::default());
        };

        let upper = if range.limit.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(range.limit.as_slice())
        };

        let mut data = Vec::new();
        let mut resume = None;

        for (key, value) in self.table.range::<[u8], _>((lower, upper)) {
            let len = batch::record_len(key, value);
            // A chunk holds at least one record, however large.
            if !data.is_empty() && data.len() + len > range.capacity {
                resume = Some(key.clone());
                break;
            }

            batch::append(&mut data, key, value);
        }

        let has_more = resume.is_some();
        range.position = resume.map_or(Position::Done, Position::At);
        Ok(Chunk { data, has_more })
    }

    fn close(self) {
        tracing::debug!(path = %self.path, entries = self.table.len(), "closed in-memory relation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_ipc::batch::Records;

    fn table(n: u8) -> MemoryConnection {
        let entries = (0..n).map(|i| (vec![b'k', i], vec![i; 10]));
        MemoryEngine::new()
            .with_table("rel", entries)
            .open("rel", &OpenOptions::default())
            .unwrap()
    }

    fn keys(batch: &[u8]) -> Vec<Vec<u8>> {
        Records::new(batch)
            .map(|record| record.unwrap().0.to_vec())
            .collect()
    }

    #[test]
    fn open_requires_create_flag() {
        let mut engine = MemoryEngine::new();
        assert!(matches!(
            engine.open("missing", &OpenOptions::default()),
            Err(StorageError::Open { .. })
        ));

        let conn = engine
            .open("missing", &OpenOptions::default().create_if_missing(true))
            .unwrap();
        assert_eq!(conn.count(), 0);
    }

    #[test]
    fn batches_page_through_everything() {
        let conn = table(10);
        let mut cursor = conn.new_cursor();
        // Each record is 16 + 2 + 10 bytes, three fit.
        let mut out = [0u8; 90];
        let mut seen = Vec::new();

        loop {
            let state = conn.batch_read(&mut cursor, &mut out).unwrap();
            seen.extend(keys(&out[..state.size as usize]));
            if !state.has_more {
                break;
            }
            assert_eq!(state.size, 84);
        }

        let expected: Vec<_> = (0..10).map(|i| vec![b'k', i]).collect();
        assert_eq!(seen, expected);

        // Exhausted cursors stay exhausted.
        assert_eq!(
            conn.batch_read(&mut cursor, &mut out).unwrap(),
            BatchState::default()
        );
    }

    #[test]
    fn empty_table_batch() {
        let conn = table(0);
        let mut cursor = conn.new_cursor();
        let mut out = [0u8; 64];
        assert_eq!(
            conn.batch_read(&mut cursor, &mut out).unwrap(),
            BatchState {
                has_more: false,
                size: 0
            }
        );
    }

    #[test]
    fn oversized_record() {
        let conn = table(1);
        let mut cursor = conn.new_cursor();
        let mut out = [0u8; 16];
        assert!(matches!(
            conn.batch_read(&mut cursor, &mut out),
            Err(StorageError::RecordTooLarge {
                len: 28,
                capacity: 16
            })
        ));
    }

    #[test]
    fn range_respects_bounds_and_capacity() {
        let conn = table(10);
        let options = RangeOptions {
            start: vec![b'k', 2],
            limit: vec![b'k', 7],
            batch_capacity: 60,
            attrs: vec![],
        };

        let mut range = conn.new_range(&options).unwrap();
        let mut chunks = Vec::new();
        loop {
            let chunk = conn.range_read(&mut range).unwrap();
            chunks.push(keys(&chunk.data));
            if !chunk.has_more {
                break;
            }
        }

        let expected: Vec<Vec<Vec<u8>>> = vec![
            vec![vec![b'k', 2], vec![b'k', 3]],
            vec![vec![b'k', 4], vec![b'k', 5]],
            vec![vec![b'k', 6]],
        ];
        assert_eq!(chunks, expected);
        assert_eq!(conn.range_read(&mut range).unwrap(), Chunk::default());
    }

    #[test]
    fn inverted_range() {
        let conn = table(3);
        let options = RangeOptions {
            start: b"z".to_vec(),
            limit: b"a".to_vec(),
            ..RangeOptions::default()
        };
        assert!(conn.new_range(&options).is_err());
    }
}

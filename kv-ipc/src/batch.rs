//! Records of a scan batch: `[key_len u64][key][value_len u64][value]`, repeated.
use crate::frame::{FrameError, FrameReader, FrameWriter};

/// Bytes one record occupies in a batch.
pub fn record_len(key: &[u8], value: &[u8]) -> usize {
    16 + key.len() + value.len()
}

/// Append one record to a growable buffer.
pub fn append(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    out.reserve(record_len(key, value));
    out.extend_from_slice(&(key.len() as u64).to_ne_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&(value.len() as u64).to_ne_bytes());
    out.extend_from_slice(value);
}

/// Appends whole records to a fixed batch segment.
pub struct BatchWriter<'buf> {
    frame: FrameWriter<'buf>,
    records: usize,
}

impl<'buf> BatchWriter<'buf> {
    pub fn new(buf: &'buf mut [u8]) -> Self {
        BatchWriter {
            frame: FrameWriter::new(buf),
            records: 0,
        }
    }

    /// Append a record. Returns `false`, and writes nothing, if it does not fit.
    pub fn push(&mut self, key: &[u8], value: &[u8]) -> bool {
        if record_len(key, value) > self.frame.remaining() {
            return false;
        }

        let written = self
            .frame
            .write_len_prefixed(key)
            .and_then(|_| self.frame.write_len_prefixed(value));

        if written.is_err() {
            return false;
        }

        self.records += 1;
        true
    }

    pub fn written(&self) -> usize {
        self.frame.offset()
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn capacity(&self) -> usize {
        self.frame.capacity()
    }
}

/// Iterates the records of a batch.
pub struct Records<'buf> {
    frame: FrameReader<'buf>,
}

impl<'buf> Records<'buf> {
    pub fn new(batch: &'buf [u8]) -> Self {
        Records {
            frame: FrameReader::new(batch),
        }
    }
}

impl<'buf> Iterator for Records<'buf> {
    type Item = Result<(&'buf [u8], &'buf [u8]), FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.frame.is_empty() {
            return None;
        }

        let record = self
            .frame
            .read_len_prefixed()
            .and_then(|key| Ok((key, self.frame.read_len_prefixed()?)));

        if record.is_err() {
            // Nothing after a broken record can be trusted.
            self.frame.rest();
        }

        Some(record)
    }
}

#[test]
fn push_until_full() {
    let mut buf = [0u8; 64];
    let mut batch = BatchWriter::new(&mut buf);
    assert!(batch.push(b"a", b"1"));
    assert!(batch.push(b"bb", b""));
    // 46 bytes do not fit into the remaining 28.
    assert!(!batch.push(b"c", &[0; 29]));
    let written = batch.written();
    assert_eq!(written, 18 + 18);
    assert_eq!(batch.records(), 2);

    let records: Vec<_> = Records::new(&buf[..written])
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records, [(&b"a"[..], &b"1"[..]), (&b"bb"[..], &b""[..])]);
}

#[test]
fn append_matches_writer() {
    let mut fixed = [0u8; 40];
    let mut batch = BatchWriter::new(&mut fixed);
    assert!(batch.push(b"key", b"value"));
    let written = batch.written();

    let mut grown = Vec::new();
    append(&mut grown, b"key", b"value");
    assert_eq!(grown, fixed[..written]);
}

#[test]
fn broken_record_ends_iteration() {
    let mut buf = [0u8; 12];
    FrameWriter::new(&mut buf).write_u64(4).unwrap();
    let mut records = Records::new(&buf);
    assert!(records.next().unwrap().is_err());
    assert!(records.next().is_none());
}

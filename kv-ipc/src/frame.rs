//! A write/read cursor over a flat byte region.
//!
//! Frames are the plain concatenation of native-endian integers and raw byte strings. A
//! variable-length field carries its length in a preceding `u64` unless the length is implied by
//! the size of the frame. Both cursors check every access against the capacity of the underlying
//! slice and fail instead of overrunning it.

/// A frame that cannot be written or read as requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The frame does not fit into the fixed region.
    #[error("a frame of {needed} bytes exceeds the capacity of {capacity} bytes")]
    Overflow { needed: usize, capacity: usize },
    /// The frame ended before a field was complete.
    #[error("frame ended at offset {offset} while {wanted} more bytes were expected")]
    Truncated { offset: usize, wanted: usize },
    /// Bytes left over after the last field of a body.
    #[error("{0} unexpected bytes after the end of the frame")]
    TrailingBytes(usize),
    #[error("unknown operation code {0}")]
    UnknownOp(u32),
    #[error("unknown status code {0}")]
    UnknownStatus(u32),
    /// A response channel id outside of the pool.
    #[error("response channel {0} does not exist")]
    UnknownChannel(u32),
    /// A response arrived on a channel other than the one leased for it.
    #[error("response for channel {found} arrived on channel {expected}")]
    Misrouted { expected: u32, found: u32 },
    #[error("a text field is not valid UTF-8")]
    InvalidUtf8,
}

pub struct FrameWriter<'buf> {
    buf: &'buf mut [u8],
    offset: usize,
}

pub struct FrameReader<'buf> {
    buf: &'buf [u8],
    offset: usize,
}

impl<'buf> FrameWriter<'buf> {
    pub fn new(buf: &'buf mut [u8]) -> Self {
        FrameWriter { buf, offset: 0 }
    }

    /// Bytes written so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        let end = self
            .offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.buf.len())
            .ok_or(FrameError::Overflow {
                needed: self.offset.saturating_add(bytes.len()),
                capacity: self.buf.len(),
            })?;

        self.buf[self.offset..end].copy_from_slice(bytes);
        self.offset = end;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), FrameError> {
        self.write_bytes(&[value])
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), FrameError> {
        self.write_u8(value.into())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), FrameError> {
        self.write_bytes(&value.to_ne_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), FrameError> {
        self.write_bytes(&value.to_ne_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), FrameError> {
        self.write_bytes(&value.to_ne_bytes())
    }

    /// A `u64` length followed by the bytes.
    pub fn write_len_prefixed(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        self.write_u64(bytes.len() as u64)?;
        self.write_bytes(bytes)
    }
}

impl<'buf> FrameReader<'buf> {
    pub fn new(buf: &'buf [u8]) -> Self {
        FrameReader { buf, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'buf [u8], FrameError> {
        if len > self.remaining() {
            return Err(FrameError::Truncated {
                offset: self.offset,
                wanted: len,
            });
        }

        let bytes = &self.buf[self.offset..][..len];
        self.offset += len;
        Ok(bytes)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'buf [u8] {
        let bytes = &self.buf[self.offset..];
        self.offset = self.buf.len();
        bytes
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        let mut array = [0; N];
        array.copy_from_slice(self.read_bytes(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, FrameError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, FrameError> {
        self.read_array().map(u16::from_ne_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, FrameError> {
        self.read_array().map(u32::from_ne_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64, FrameError> {
        self.read_array().map(u64::from_ne_bytes)
    }

    pub fn read_len_prefixed(&mut self) -> Result<&'buf [u8], FrameError> {
        let offset = self.offset;
        let len = self.read_u64()?;
        let len = usize::try_from(len).map_err(|_| FrameError::Truncated {
            offset,
            wanted: usize::MAX,
        })?;

        self.read_bytes(len)
    }

    pub fn read_str(&mut self, len: usize) -> Result<&'buf str, FrameError> {
        core::str::from_utf8(self.read_bytes(len)?).map_err(|_| FrameError::InvalidUtf8)
    }
}

#[test]
fn fields_in_order() {
    let mut buf = [0u8; 32];
    let mut writer = FrameWriter::new(&mut buf);
    writer.write_u32(7).unwrap();
    writer.write_len_prefixed(b"key").unwrap();
    writer.write_bool(true).unwrap();
    writer.write_bytes(b"tail").unwrap();
    let len = writer.offset();
    assert_eq!(len, 4 + 8 + 3 + 1 + 4);

    let mut reader = FrameReader::new(&buf[..len]);
    assert_eq!(reader.read_u32().unwrap(), 7);
    assert_eq!(reader.read_len_prefixed().unwrap(), b"key");
    assert!(reader.read_bool().unwrap());
    assert_eq!(reader.rest(), b"tail");
    assert!(reader.is_empty());
}

#[test]
fn writer_rejects_overflow_without_writing() {
    let mut buf = [0xffu8; 8];
    let mut writer = FrameWriter::new(&mut buf);
    writer.write_u32(0).unwrap();

    let err = writer.write_u64(0).unwrap_err();
    assert_eq!(
        err,
        FrameError::Overflow {
            needed: 12,
            capacity: 8
        }
    );
    assert_eq!(writer.offset(), 4);
    // Exactly filling the region is fine.
    writer.write_bytes(&[1, 2, 3, 4]).unwrap();
    assert_eq!(writer.remaining(), 0);
    assert_eq!(buf[4..], [1, 2, 3, 4]);
}

#[test]
fn reader_rejects_lying_length() {
    let mut buf = [0u8; 12];
    FrameWriter::new(&mut buf).write_u64(100).unwrap();

    let mut reader = FrameReader::new(&buf);
    assert_eq!(
        reader.read_len_prefixed(),
        Err(FrameError::Truncated {
            offset: 8,
            wanted: 100
        })
    );
}

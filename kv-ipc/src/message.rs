//! The message catalog: envelope, operation codes and per-operation bodies.
use std::borrow::Cow;

use crate::frame::{FrameError, FrameReader, FrameWriter};

pub type WorkerId = u32;
pub type DatabaseId = u32;

/// The response channel id of a command that expects no response.
pub const NO_CHANNEL: u32 = u32::MAX;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Open = 1,
    Close,
    Count,
    Put,
    Get,
    Delete,
    Load,
    ReadBatch,
    CloseCursor,
    RangeQuery,
    ClearRangeQuery,
    Launch,
    Terminate,
    Ready,
    Destroyed,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Requests carry no status.
    Unset = 0,
    Success,
    /// The operation was refused, e.g. the key does not exist.
    Failure,
    /// The worker could not perform the operation; the body holds a message.
    Exception,
}

impl Op {
    const ALL: [Op; 15] = [
        Op::Open,
        Op::Close,
        Op::Count,
        Op::Put,
        Op::Get,
        Op::Delete,
        Op::Load,
        Op::ReadBatch,
        Op::CloseCursor,
        Op::RangeQuery,
        Op::ClearRangeQuery,
        Op::Launch,
        Op::Terminate,
        Op::Ready,
        Op::Destroyed,
    ];

    pub fn from_u32(code: u32) -> Result<Self, FrameError> {
        Op::ALL
            .into_iter()
            .find(|op| *op as u32 == code)
            .ok_or(FrameError::UnknownOp(code))
    }
}

impl Status {
    pub fn from_u32(code: u32) -> Result<Self, FrameError> {
        Ok(match code {
            0 => Status::Unset,
            1 => Status::Success,
            2 => Status::Failure,
            3 => Status::Exception,
            other => return Err(FrameError::UnknownStatus(other)),
        })
    }
}

/// The fixed header in front of every request and response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub op: Op,
    /// The response channel leased for this exchange, or [`NO_CHANNEL`].
    pub channel: u32,
    pub database: DatabaseId,
    /// The worker (relation) the operation is about.
    pub target: WorkerId,
    pub status: Status,
    /// Length of the body following the envelope.
    pub size: u64,
}

impl Envelope {
    pub const LEN: usize = 5 * 4 + 8;

    pub fn request(op: Op, channel: u32, database: DatabaseId, target: WorkerId, size: u64) -> Self {
        Envelope {
            op,
            channel,
            database,
            target,
            status: Status::Unset,
            size,
        }
    }

    /// The header answering `self`, with routing fields copied over.
    pub fn response(&self, status: Status, size: u64) -> Self {
        Envelope {
            status,
            size,
            ..*self
        }
    }

    pub fn encode(&self, w: &mut FrameWriter) -> Result<(), FrameError> {
        w.write_u32(self.op as u32)?;
        w.write_u32(self.channel)?;
        w.write_u32(self.database)?;
        w.write_u32(self.target)?;
        w.write_u32(self.status as u32)?;
        w.write_u64(self.size)
    }

    pub fn decode(r: &mut FrameReader) -> Result<Self, FrameError> {
        Ok(Envelope {
            op: Op::from_u32(r.read_u32()?)?,
            channel: r.read_u32()?,
            database: r.read_u32()?,
            target: r.read_u32()?,
            status: Status::from_u32(r.read_u32()?)?,
            size: r.read_u64()?,
        })
    }
}

/// Identifies one scan or range query of one client process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CursorKey {
    pub pid: u32,
    pub operation: u64,
}

impl CursorKey {
    pub const LEN: usize = 4 + 8;

    fn encode(&self, w: &mut FrameWriter) -> Result<(), FrameError> {
        w.write_u32(self.pid)?;
        w.write_u64(self.operation)
    }

    fn decode(r: &mut FrameReader) -> Result<Self, FrameError> {
        Ok(CursorKey {
            pid: r.read_u32()?,
            operation: r.read_u64()?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub create_if_missing: bool,
    /// Store the relation column-wise, if the engine supports it.
    pub use_column: bool,
    /// Number of attributes of the relation.
    pub attr_count: u32,
}

impl OpenOptions {
    const LEN: usize = 1 + 1 + 4;

    pub fn create_if_missing(mut self, yes: bool) -> Self {
        self.create_if_missing = yes;
        self
    }

    pub fn use_column(mut self, yes: bool) -> Self {
        self.use_column = yes;
        self
    }

    pub fn attr_count(mut self, count: u32) -> Self {
        self.attr_count = count;
        self
    }
}

/// Bounds, projection and chunk size of a range query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeOptions {
    /// Inclusive lower bound. Empty means unbounded.
    pub start: Vec<u8>,
    /// Exclusive upper bound. Empty means unbounded.
    pub limit: Vec<u8>,
    /// Upper bound for the bytes of one chunk. Zero leaves the choice to the engine.
    pub batch_capacity: u64,
    /// Attribute numbers to project. Empty selects all.
    pub attrs: Vec<u16>,
}

impl RangeOptions {
    fn encoded_len(&self) -> usize {
        8 + self.start.len() + 8 + self.limit.len() + 8 + 4 + 2 * self.attrs.len()
    }

    fn encode(&self, w: &mut FrameWriter) -> Result<(), FrameError> {
        w.write_len_prefixed(&self.start)?;
        w.write_len_prefixed(&self.limit)?;
        w.write_u64(self.batch_capacity)?;
        w.write_u32(self.attrs.len() as u32)?;
        self.attrs.iter().try_for_each(|&attr| w.write_u16(attr))
    }

    fn decode(r: &mut FrameReader) -> Result<Self, FrameError> {
        let start = r.read_len_prefixed()?.to_vec();
        let limit = r.read_len_prefixed()?.to_vec();
        let batch_capacity = r.read_u64()?;
        let count = r.read_u32()? as usize;

        if count.saturating_mul(2) > r.remaining() {
            return Err(FrameError::Truncated {
                offset: r.offset(),
                wanted: count.saturating_mul(2),
            });
        }

        let attrs = (0..count)
            .map(|_| r.read_u16())
            .collect::<Result<_, _>>()?;

        Ok(RangeOptions {
            start,
            limit,
            batch_capacity,
            attrs,
        })
    }
}

/// The answer to ReadBatch and RangeQuery: where the stream stands after this batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchState {
    pub has_more: bool,
    /// Bytes placed into the batch segment.
    pub size: u64,
}

impl BatchState {
    pub const LEN: usize = 1 + 8;

    pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
        let mut r = FrameReader::new(body);
        Ok(BatchState {
            has_more: r.read_bool()?,
            size: r.read_u64()?,
        })
    }
}

/// A request body, typed by operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request<'a> {
    Open { options: OpenOptions, path: &'a str },
    Close,
    Count,
    Put { key: &'a [u8], value: &'a [u8] },
    Get { key: &'a [u8] },
    Delete { key: &'a [u8] },
    /// A put that is not answered.
    Load { key: &'a [u8], value: &'a [u8] },
    ReadBatch { cursor: CursorKey },
    CloseCursor { cursor: CursorKey },
    /// Options are only read on the first call for a cursor.
    RangeQuery {
        cursor: CursorKey,
        options: Option<Cow<'a, RangeOptions>>,
    },
    ClearRangeQuery { cursor: CursorKey },
    Launch,
    Terminate,
    Ready,
    Destroyed,
}

impl<'a> Request<'a> {
    pub fn op(&self) -> Op {
        match self {
            Request::Open { .. } => Op::Open,
            Request::Close => Op::Close,
            Request::Count => Op::Count,
            Request::Put { .. } => Op::Put,
            Request::Get { .. } => Op::Get,
            Request::Delete { .. } => Op::Delete,
            Request::Load { .. } => Op::Load,
            Request::ReadBatch { .. } => Op::ReadBatch,
            Request::CloseCursor { .. } => Op::CloseCursor,
            Request::RangeQuery { .. } => Op::RangeQuery,
            Request::ClearRangeQuery { .. } => Op::ClearRangeQuery,
            Request::Launch => Op::Launch,
            Request::Terminate => Op::Terminate,
            Request::Ready => Op::Ready,
            Request::Destroyed => Op::Destroyed,
        }
    }

    /// Size of the body, computed without writing it.
    pub fn body_len(&self) -> usize {
        match self {
            Request::Open { path, .. } => OpenOptions::LEN + path.len(),
            Request::Put { key, value } | Request::Load { key, value } => {
                8 + key.len() + value.len()
            }
            Request::Get { key } | Request::Delete { key } => key.len(),
            Request::ReadBatch { .. }
            | Request::CloseCursor { .. }
            | Request::ClearRangeQuery { .. } => CursorKey::LEN,
            Request::RangeQuery { options, .. } => {
                CursorKey::LEN + options.as_ref().map_or(0, |o| o.encoded_len())
            }
            Request::Close
            | Request::Count
            | Request::Launch
            | Request::Terminate
            | Request::Ready
            | Request::Destroyed => 0,
        }
    }

    pub fn encode_body(&self, w: &mut FrameWriter) -> Result<(), FrameError> {
        match self {
            Request::Open { options, path } => {
                w.write_bool(options.create_if_missing)?;
                w.write_bool(options.use_column)?;
                w.write_u32(options.attr_count)?;
                w.write_bytes(path.as_bytes())
            }
            Request::Put { key, value } | Request::Load { key, value } => {
                w.write_len_prefixed(key)?;
                w.write_bytes(value)
            }
            Request::Get { key } | Request::Delete { key } => w.write_bytes(key),
            Request::ReadBatch { cursor }
            | Request::CloseCursor { cursor }
            | Request::ClearRangeQuery { cursor } => cursor.encode(w),
            Request::RangeQuery { cursor, options } => {
                cursor.encode(w)?;
                match options {
                    Some(options) => options.encode(w),
                    None => Ok(()),
                }
            }
            Request::Close
            | Request::Count
            | Request::Launch
            | Request::Terminate
            | Request::Ready
            | Request::Destroyed => Ok(()),
        }
    }

    /// Decode the body of a request with operation `op`. The body must be consumed exactly.
    pub fn decode(op: Op, body: &'a [u8]) -> Result<Self, FrameError> {
        let mut r = FrameReader::new(body);

        let request = match op {
            Op::Open => {
                let options = OpenOptions {
                    create_if_missing: r.read_bool()?,
                    use_column: r.read_bool()?,
                    attr_count: r.read_u32()?,
                };
                let path = r.read_str(r.remaining())?;
                Request::Open { options, path }
            }
            Op::Put | Op::Load => {
                let key = r.read_len_prefixed()?;
                let value = r.rest();
                if op == Op::Put {
                    Request::Put { key, value }
                } else {
                    Request::Load { key, value }
                }
            }
            Op::Get => Request::Get { key: r.rest() },
            Op::Delete => Request::Delete { key: r.rest() },
            Op::ReadBatch => Request::ReadBatch {
                cursor: CursorKey::decode(&mut r)?,
            },
            Op::CloseCursor => Request::CloseCursor {
                cursor: CursorKey::decode(&mut r)?,
            },
            Op::ClearRangeQuery => Request::ClearRangeQuery {
                cursor: CursorKey::decode(&mut r)?,
            },
            Op::RangeQuery => {
                let cursor = CursorKey::decode(&mut r)?;
                let options = if r.is_empty() {
                    None
                } else {
                    Some(Cow::Owned(RangeOptions::decode(&mut r)?))
                };
                Request::RangeQuery { cursor, options }
            }
            Op::Close => Request::Close,
            Op::Count => Request::Count,
            Op::Launch => Request::Launch,
            Op::Terminate => Request::Terminate,
            Op::Ready => Request::Ready,
            Op::Destroyed => Request::Destroyed,
        };

        if !r.is_empty() {
            return Err(FrameError::TrailingBytes(r.remaining()));
        }

        Ok(request)
    }
}

/// A response as produced by a handler: status and owned body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn success() -> Self {
        Reply::status(Status::Success)
    }

    pub fn failure() -> Self {
        Reply::status(Status::Failure)
    }

    pub fn status(status: Status) -> Self {
        Reply {
            status,
            body: Vec::new(),
        }
    }

    pub fn exception(message: impl Into<String>) -> Self {
        Reply {
            status: Status::Exception,
            body: message.into().into_bytes(),
        }
    }

    pub fn bytes(body: Vec<u8>) -> Self {
        Reply {
            status: Status::Success,
            body,
        }
    }

    pub fn count(count: u64) -> Self {
        Reply::bytes(count.to_ne_bytes().to_vec())
    }

    pub fn ref_count(refs: u32) -> Self {
        Reply::bytes(refs.to_ne_bytes().to_vec())
    }

    pub fn batch(state: BatchState) -> Self {
        let mut body = Vec::with_capacity(BatchState::LEN);
        body.push(u8::from(state.has_more));
        body.extend_from_slice(&state.size.to_ne_bytes());
        Reply::bytes(body)
    }
}

#[cfg(test)]
fn roundtrip(request: &Request<'_>) -> Vec<u8> {
    let mut body = vec![0; request.body_len()];
    let mut w = FrameWriter::new(&mut body);
    request.encode_body(&mut w).unwrap();
    assert_eq!(w.offset(), request.body_len());
    body
}

#[test]
fn put_value_length_is_implied() {
    let put = Request::Put {
        key: b"k1",
        value: b"",
    };
    let body = roundtrip(&put);
    assert_eq!(body.len(), 8 + 2);
    assert_eq!(Request::decode(Op::Put, &body).unwrap(), put);

    let load = Request::Load {
        key: b"",
        value: b"some value",
    };
    let body = roundtrip(&load);
    assert_eq!(Request::decode(Op::Load, &body).unwrap(), load);
}

#[test]
fn put_key_longer_than_body() {
    let mut body = vec![0; 12];
    FrameWriter::new(&mut body).write_u64(9).unwrap();
    assert!(matches!(
        Request::decode(Op::Put, &body),
        Err(FrameError::Truncated { .. })
    ));
}

#[test]
fn range_query_options_are_optional() {
    let cursor = CursorKey {
        pid: 42,
        operation: 7,
    };
    let options = RangeOptions {
        start: b"a".to_vec(),
        limit: b"m".to_vec(),
        batch_capacity: 4096,
        attrs: vec![1, 3],
    };

    let first = Request::RangeQuery {
        cursor,
        options: Some(Cow::Borrowed(&options)),
    };
    let body = roundtrip(&first);
    assert_eq!(Request::decode(Op::RangeQuery, &body).unwrap(), first);

    let next = Request::RangeQuery {
        cursor,
        options: None,
    };
    let body = roundtrip(&next);
    assert_eq!(body.len(), CursorKey::LEN);
    assert_eq!(Request::decode(Op::RangeQuery, &body).unwrap(), next);
}

#[test]
fn open_carries_path() {
    let open = Request::Open {
        options: OpenOptions::default().create_if_missing(true).attr_count(3),
        path: "/data/rel-16384",
    };
    let body = roundtrip(&open);
    assert_eq!(Request::decode(Op::Open, &body).unwrap(), open);

    let mut broken = body.clone();
    broken.push(0xff);
    assert_eq!(
        Request::decode(Op::Open, &broken),
        Err(FrameError::InvalidUtf8)
    );
}

#[test]
fn trailing_bytes_are_rejected() {
    let body = [0u8; CursorKey::LEN + 1];
    assert!(Request::decode(Op::CloseCursor, &body).is_err());
    assert!(Request::decode(Op::Count, &[1]).is_err());
}

#[test]
fn unknown_codes() {
    assert_eq!(Op::from_u32(0), Err(FrameError::UnknownOp(0)));
    assert_eq!(Op::from_u32(99), Err(FrameError::UnknownOp(99)));
    assert_eq!(Op::from_u32(Op::Destroyed as u32), Ok(Op::Destroyed));
    assert_eq!(Status::from_u32(4), Err(FrameError::UnknownStatus(4)));
}

#[test]
fn envelope_layout() {
    let envelope = Envelope::request(Op::Get, 3, 1, 16384, 5);
    let mut buf = [0u8; Envelope::LEN];
    envelope.encode(&mut FrameWriter::new(&mut buf)).unwrap();
    assert_eq!(buf[..4], (Op::Get as u32).to_ne_bytes());

    let decoded = Envelope::decode(&mut FrameReader::new(&buf)).unwrap();
    assert_eq!(decoded, envelope);
    let response = decoded.response(Status::Failure, 0);
    assert_eq!(response.channel, 3);
    assert_eq!(response.status, Status::Failure);
}

use super::*;
use crate::client::WorkerClient;
use crate::memory::MemoryEngine;
use crate::storage::{Chunk, StorageError};

use std::sync::atomic::AtomicUsize;
use std::thread::{self, JoinHandle};

use kv_ipc::batch;
use kv_ipc::frame::FrameWriter;
use kv_ipc::{Envelope, Op, Status, NO_CHANNEL};

const ID: WorkerId = 3;

fn config() -> IpcConfig {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    IpcConfig::with_prefix(format!("kvw-worker-{}-{n}", std::process::id()))
        .channels(4)
        .frame_capacity(4096)
        .batch_capacity(256)
        .response_timeout(Some(Duration::from_secs(10)))
        .poll_interval(Duration::from_millis(5))
}

/// A worker on its own thread, attached to a channel provisioned by the test.
struct Served {
    config: IpcConfig,
    owner: Channel,
    worker: Option<JoinHandle<Result<(), Error>>>,
}

fn serve<E: Engine + Send + 'static>(engine: E) -> Served {
    let config = config();
    let owner = Channel::create(&config, Endpoint::Worker(ID)).unwrap();
    owner.control().advance(WorkerState::Starting).unwrap();
    owner.control().set_started();

    let worker = thread::spawn({
        let config = config.clone();
        move || Worker::attach(&config, ID, engine)?.run()
    });

    Served {
        config,
        owner,
        worker: Some(worker),
    }
}

impl Served {
    fn client(&self) -> WorkerClient {
        WorkerClient::attach(&self.config, ID).unwrap()
    }

    fn join(&mut self) -> Result<(), Error> {
        self.worker.take().unwrap().join().unwrap()
    }

    fn stop(mut self) {
        self.client().terminate().unwrap();
        self.join().unwrap();
        assert_eq!(self.owner.control().state(), WorkerState::Terminated);
    }
}

impl Drop for Served {
    fn drop(&mut self) {
        // The worker must be gone before the owner destroys the semaphores.
        let _ = self.owner.control().advance(WorkerState::Terminating);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn seeded(n: u8) -> MemoryEngine {
    MemoryEngine::new().with_table("rel", (0..n).map(|i| (vec![b'k', i], vec![i; 20])))
}

#[test]
fn lifecycle_reaches_running() {
    let served = serve(MemoryEngine::new());
    let client = served.client();

    // Any answered request implies the worker passed Ready.
    assert!(client.close().unwrap().is_none());
    assert_eq!(client.state(), WorkerState::Running);
    assert_eq!(
        served.owner.control().worker_pid(),
        Some(std::process::id())
    );

    served.stop();
}

#[test]
fn open_counts_references() {
    let served = serve(seeded(2));
    let (first, second) = (served.client(), served.client());

    assert_eq!(first.close().unwrap(), None);
    assert_eq!(first.open("rel", OpenOptions::default()).unwrap(), 1);
    assert_eq!(second.open("rel", OpenOptions::default()).unwrap(), 2);
    assert_eq!(first.close().unwrap(), Some(1));

    // Still served for the client that keeps it open.
    assert_eq!(second.get(&[b'k', 0]).unwrap(), Some(vec![0; 20]));
    assert_eq!(second.close().unwrap(), Some(0));

    // The connection outlives a count of zero.
    assert_eq!(first.count().unwrap(), 2);
    assert_eq!(second.get(&[b'k', 1]).unwrap(), Some(vec![1; 20]));
    assert_eq!(first.close().unwrap(), Some(0));

    served.stop();
}

#[test]
fn terminate_before_start_is_a_no_op() {
    let config = config();
    let owner = Channel::create(&config, Endpoint::Worker(ID)).unwrap();
    let client = WorkerClient::attach(&config, ID).unwrap();

    client.terminate().unwrap();

    // No start was requested and nothing was placed into the command area.
    assert_eq!(owner.control().agent(0).value().unwrap(), 0);
    assert_eq!(owner.control().work().value().unwrap(), 0);
    assert_eq!(owner.control().state(), WorkerState::NotStarted);
}

#[test]
fn requests_need_an_open_relation() {
    let served = serve(MemoryEngine::new());
    let client = served.client();

    match client.count() {
        Err(Error::Exception(message)) => assert!(message.contains("not open"), "{message}"),
        other => panic!("expected an exception, got {other:?}"),
    }

    assert!(matches!(client.put(b"a", b"b"), Err(Error::Exception(_))));
    assert!(matches!(
        client.open("missing", OpenOptions::default()),
        Err(Error::Exception(_))
    ));

    served.stop();
}

#[test]
fn put_get_delete() {
    let served = serve(MemoryEngine::new());
    let client = served.client();
    let options = OpenOptions::default().create_if_missing(true);
    client.open("rel", options).unwrap();

    assert!(client.put(b"a", b"1").unwrap());
    assert!(client.put(b"b", b"2").unwrap());
    assert!(client.put(b"a", b"3").unwrap());
    assert_eq!(client.count().unwrap(), 2);
    assert_eq!(client.get(b"a").unwrap(), Some(b"3".to_vec()));

    assert!(client.delete(b"a").unwrap());
    assert!(!client.delete(b"a").unwrap());
    assert_eq!(client.get(b"a").unwrap(), None);
    assert_eq!(client.count().unwrap(), 1);

    served.stop();
}

#[test]
fn loads_are_served_in_order() {
    let served = serve(MemoryEngine::new());
    let client = served.client();
    client
        .open("rel", OpenOptions::default().create_if_missing(true))
        .unwrap();

    for i in 0..20u8 {
        client.load(&[i], &[i; 8]).unwrap();
    }

    // The single command area serializes the loads before this call.
    assert_eq!(client.count().unwrap(), 20);
    assert_eq!(client.get(&[7]).unwrap(), Some(vec![7; 8]));

    served.stop();
}

#[test]
fn request_for_another_relation() {
    let served = serve(MemoryEngine::new());
    let channel = Channel::open(&served.config, Endpoint::Worker(ID)).unwrap();

    assert!(matches!(
        channel.call(ID + 1, &Request::Count),
        Err(Error::Exception(_))
    ));
    assert!(matches!(
        channel.call(ID, &Request::Launch),
        Err(Error::Exception(_))
    ));

    served.stop();
}

#[test]
fn scan_pages_through_relation() {
    let served = serve(seeded(20));
    let client = served.client();
    client.open("rel", OpenOptions::default()).unwrap();

    let mut cursor = client.scan();
    let mut keys = Vec::new();
    let mut batches = 0;

    loop {
        let batch = cursor.next_batch().unwrap();
        batches += 1;
        for record in batch.records() {
            let (key, value) = record.unwrap();
            assert_eq!(value, [key[1]; 20]);
            keys.push(key.to_vec());
        }

        if !batch.has_more {
            break;
        }
    }

    // Records of 38 bytes, six to a batch of 256.
    assert_eq!(batches, 4);
    assert_eq!(keys, (0..20).map(|i| vec![b'k', i]).collect::<Vec<_>>());

    // Exhausted cursors stay exhausted.
    let again = cursor.next_batch().unwrap();
    assert!(!again.has_more && again.is_empty());
    cursor.close().unwrap();

    served.stop();
}

#[test]
fn empty_scan_is_idempotent() {
    let served = serve(MemoryEngine::new());
    let client = served.client();
    client
        .open("rel", OpenOptions::default().create_if_missing(true))
        .unwrap();

    let mut cursor = client.scan();
    for _ in 0..3 {
        let batch = cursor.next_batch().unwrap();
        assert!(!batch.has_more);
        assert!(batch.is_empty());
    }
    drop(cursor);

    served.stop();
}

#[test]
fn closing_unknown_scans() {
    let served = serve(MemoryEngine::new());
    let channel = Channel::open(&served.config, Endpoint::Worker(ID)).unwrap();
    let cursor = CursorKey {
        pid: 1,
        operation: 77,
    };

    let closed = channel.call(ID, &Request::CloseCursor { cursor }).unwrap();
    assert_eq!(closed.envelope.status, Status::Success);
    let cleared = channel.call(ID, &Request::ClearRangeQuery { cursor }).unwrap();
    assert_eq!(cleared.envelope.status, Status::Success);

    served.stop();
}

#[test]
fn range_query_in_chunks() {
    let served = serve(seeded(10));
    let client = served.client();
    client.open("rel", OpenOptions::default()).unwrap();

    let mut range = client.range(RangeOptions {
        start: vec![b'k', 3],
        limit: vec![b'k', 8],
        batch_capacity: 80,
        attrs: vec![],
    });

    let mut chunks = Vec::new();
    loop {
        let chunk = range.next_chunk().unwrap();
        let keys: Vec<u8> = chunk.records().map(|r| r.unwrap().0[1]).collect();
        chunks.push(keys);
        if !chunk.has_more {
            break;
        }
    }

    assert_eq!(chunks, [vec![3, 4], vec![5, 6], vec![7]]);
    range.close().unwrap();

    served.stop();
}

/// Emits a fixed sequence of chunks for every range.
struct Scripted;

struct ScriptedConnection;

impl Engine for Scripted {
    type Connection = ScriptedConnection;

    fn open(&mut self, _: &str, _: &OpenOptions) -> Result<ScriptedConnection, StorageError> {
        Ok(ScriptedConnection)
    }
}

fn chunk(records: &[(&[u8], &[u8])], has_more: bool) -> Chunk {
    let mut data = Vec::new();
    for (key, value) in records {
        batch::append(&mut data, key, value);
    }
    Chunk { data, has_more }
}

impl Connection for ScriptedConnection {
    type Cursor = ();
    type Range = Vec<Chunk>;

    fn count(&self) -> u64 {
        0
    }

    fn get(&self, _: &[u8]) -> Option<Vec<u8>> {
        None
    }

    fn put(&mut self, _: &[u8], _: &[u8]) -> bool {
        false
    }

    fn delete(&mut self, _: &[u8]) -> bool {
        false
    }

    fn new_cursor(&self) {}

    fn batch_read(&self, _: &mut (), _: &mut [u8]) -> Result<BatchState, StorageError> {
        Ok(BatchState::default())
    }

    fn new_range(&self, _: &RangeOptions) -> Result<Vec<Chunk>, StorageError> {
        let mut script = vec![
            chunk(&[], true),
            chunk(&[], true),
            chunk(&[(b"key", b"value")], true),
            chunk(&[], false),
        ];
        script.reverse();
        Ok(script)
    }

    fn range_read(&self, range: &mut Vec<Chunk>) -> Result<Chunk, StorageError> {
        Ok(range.pop().unwrap_or_default())
    }
}

#[test]
fn empty_chunks_do_not_end_a_range() {
    let served = serve(Scripted);
    let client = served.client();
    client.open("any", OpenOptions::default()).unwrap();

    // Rejected writes are failures, not exceptions.
    assert!(!client.put(b"a", b"b").unwrap());

    let mut range = client.range(RangeOptions::default());

    let first = range.next_chunk().unwrap();
    assert!(first.has_more);
    let records: Vec<_> = first.records().map(Result::unwrap).collect();
    assert_eq!(records, [(&b"key"[..], &b"value"[..])]);

    let last = range.next_chunk().unwrap();
    assert!(!last.has_more);
    assert!(last.is_empty());
    drop(range);

    served.stop();
}

#[test]
fn exit_unlinks_scan_segments() {
    let mut served = serve(seeded(20));
    let client = served.client();
    client.open("rel", OpenOptions::default()).unwrap();

    let mut cursor = client.scan();
    assert!(cursor.next_batch().unwrap().has_more);
    let mut range = client.range(RangeOptions {
        batch_capacity: 40,
        ..RangeOptions::default()
    });
    assert!(range.next_chunk().unwrap().has_more);

    let (rb, rq) = (cursor.key(), range.key());
    let rb = names::read_batch(&served.config.prefix, rb.pid, ID, rb.operation);
    let rq = names::range_query(&served.config.prefix, rq.pid, ID, rq.operation);
    assert!(Segment::open(&rb).is_ok());
    assert!(Segment::open(&rq).is_ok());

    client.terminate().unwrap();
    served.join().unwrap();

    for name in [&rb, &rq] {
        assert!(
            matches!(Segment::open(name), Err(err) if err.is_not_found()),
            "{name} left behind"
        );
    }

    // Requests to a worker that is gone fail instead of hanging.
    assert!(matches!(
        client.count(),
        Err(Error::PartnerGone { .. })
    ));
    drop((cursor, range));
}

#[test]
fn malformed_request_stops_the_worker() {
    let mut served = serve(MemoryEngine::new());
    let control = served.owner.control();

    control.mutex().wait().unwrap();
    control.full().wait().unwrap();
    {
        // Safety: holding `full`.
        let area = unsafe { control.area_mut() };
        let mut w = FrameWriter::new(area);
        // A ReadBatch body is a twelve byte cursor key.
        Envelope::request(Op::ReadBatch, NO_CHANNEL, 0, ID, 3)
            .encode(&mut w)
            .unwrap();
        w.write_bytes(&[1, 2, 3]).unwrap();
    }
    control.work().post().unwrap();
    control.mutex().post().unwrap();

    let worker = served.worker.take().unwrap();
    assert!(matches!(worker.join().unwrap(), Err(Error::Protocol(_))));
    assert_eq!(control.state(), WorkerState::Terminated);
}

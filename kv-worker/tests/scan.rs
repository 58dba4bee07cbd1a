mod common;

use std::collections::BTreeMap;

use kv_worker::{
    Error, Manager, ManagerHandle, MemoryEngine, OpenOptions, RangeOptions, ThreadLauncher, Worker,
    WorkerClient,
};

fn seeded(config: &kv_worker::IpcConfig, entries: u32) -> ManagerHandle {
    let launcher = ThreadLauncher::new(move |id, config| {
        let table = (0..entries).map(|i| (format!("key{i:05}").into_bytes(), i.to_ne_bytes().repeat(8)));
        Worker::attach(&config, id, MemoryEngine::new().with_table("rel", table))?.run()
    });

    Manager::spawn(config.clone(), launcher).unwrap()
}

fn drain(cursor: &mut kv_worker::Cursor<'_>) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut seen = BTreeMap::new();
    loop {
        let batch = cursor.next_batch().unwrap();
        for record in batch.records() {
            let (key, value) = record.unwrap();
            assert!(seen.insert(key.to_vec(), value.to_vec()).is_none());
        }
        if !batch.has_more {
            return seen;
        }
    }
}

#[test]
fn scan_sees_every_record_once() {
    let config = common::config("scan");
    let _manager = seeded(&config, 500);

    let client = WorkerClient::connect(&config, 1).unwrap();
    client.open("rel", OpenOptions::default()).unwrap();

    let mut cursor = client.scan();
    let seen = drain(&mut cursor);
    cursor.close().unwrap();

    assert_eq!(seen.len(), 500);
    assert_eq!(seen[&b"key00042"[..]], 42u32.to_ne_bytes().repeat(8));
}

#[test]
fn cursors_are_independent() {
    let config = common::config("cursors");
    let _manager = seeded(&config, 100);

    let client = WorkerClient::connect(&config, 1).unwrap();
    client.open("rel", OpenOptions::default()).unwrap();

    let mut first = client.scan();
    let mut second = client.scan();
    assert_ne!(first.key(), second.key());

    // Interleave: advancing one cursor leaves the other where it was.
    let head: Vec<_> = {
        let batch = first.next_batch().unwrap();
        assert!(batch.has_more);
        batch.records().map(|r| r.unwrap().0.to_vec()).collect()
    };

    let all = drain(&mut second);
    assert_eq!(all.len(), 100);

    let rest = drain(&mut first);
    assert_eq!(head.len() + rest.len(), 100);
    assert!(head.iter().all(|key| !rest.contains_key(key)));
}

#[test]
fn scans_from_other_clients() {
    let config = common::config("clients");
    let _manager = seeded(&config, 64);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let config = config.clone();
            std::thread::spawn(move || {
                let client = WorkerClient::connect(&config, 1).unwrap();
                client.open("rel", OpenOptions::default()).unwrap();
                let mut cursor = client.scan();
                drain(&mut cursor).len()
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().unwrap(), 64);
    }
}

#[test]
fn range_query_bounds() {
    let config = common::config("range");
    let _manager = seeded(&config, 50);

    let client = WorkerClient::connect(&config, 1).unwrap();
    client.open("rel", OpenOptions::default()).unwrap();

    let mut range = client.range(RangeOptions {
        start: b"key00010".to_vec(),
        limit: b"key00030".to_vec(),
        batch_capacity: 200,
        attrs: vec![1, 2],
    });

    let mut keys = Vec::new();
    let mut chunks = 0;
    loop {
        let chunk = range.next_chunk().unwrap();
        chunks += 1;
        assert!(chunk.data.len() <= 200);
        keys.extend(chunk.records().map(|r| r.unwrap().0.to_vec()));
        if !chunk.has_more {
            break;
        }
    }

    let expected: Vec<_> = (10..30).map(|i| format!("key{i:05}").into_bytes()).collect();
    assert_eq!(keys, expected);
    assert!(chunks > 1);
    range.close().unwrap();

    // An inverted range is refused by the engine.
    let mut inverted = client.range(RangeOptions {
        start: b"z".to_vec(),
        limit: b"a".to_vec(),
        ..RangeOptions::default()
    });
    assert!(matches!(inverted.next_chunk(), Err(Error::Exception(_))));
}

#[test]
fn scan_without_open_relation() {
    let config = common::config("closed");
    let _manager = seeded(&config, 1);

    let client = WorkerClient::connect(&config, 1).unwrap();
    let mut cursor = client.scan();
    assert!(matches!(cursor.next_batch(), Err(Error::Exception(_))));
    let mut range = client.range(RangeOptions::default());
    assert!(matches!(range.next_chunk(), Err(Error::Exception(_))));
}

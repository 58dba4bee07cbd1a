mod common;

use kv_ipc::FrameError;
use kv_worker::{Error, Manager, OpenOptions, ThreadLauncher, WorkerClient};

fn client(config: &kv_worker::IpcConfig) -> WorkerClient {
    let client = WorkerClient::connect(config, 1).unwrap();
    client
        .open("rel", OpenOptions::default().create_if_missing(true))
        .unwrap();
    client
}

#[test]
fn frame_filled_to_capacity() {
    let config = common::config("frame");
    let _manager = Manager::spawn(config.clone(), ThreadLauncher::memory()).unwrap();
    let client = client(&config);

    // Put bodies are a length-prefixed key followed by the value.
    let value_len = client.max_body() - 8 - 3;
    let value = vec![7u8; value_len];
    assert!(client.put(b"big", &value).unwrap());
    assert_eq!(client.get(b"big").unwrap(), Some(value.clone()));

    let over = vec![7u8; value_len + 1];
    match client.put(b"big", &over) {
        Err(Error::Protocol(FrameError::Overflow { needed, capacity })) => {
            assert_eq!(needed, capacity + 1);
            assert_eq!(capacity, config.frame_capacity);
        }
        other => panic!("expected an overflow, got {other:?}"),
    }

    // The failed call did not disturb the channel.
    assert_eq!(client.count().unwrap(), 1);
}

#[test]
fn empty_keys_and_values() {
    let config = common::config("empty");
    let _manager = Manager::spawn(config.clone(), ThreadLauncher::memory()).unwrap();
    let client = client(&config);

    assert!(client.put(b"", b"").unwrap());
    assert_eq!(client.get(b"").unwrap(), Some(vec![]));
    assert!(client.delete(b"").unwrap());
    assert_eq!(client.get(b"").unwrap(), None);
}

#[test]
fn record_larger_than_a_batch() {
    let config = common::config("batch").batch_capacity(64);
    let _manager = Manager::spawn(config.clone(), ThreadLauncher::memory()).unwrap();
    let client = client(&config);

    client.put(b"small", b"fits").unwrap();
    client.put(b"zz", &[0; 100]).unwrap();

    let mut cursor = client.scan();
    let first = cursor.next_batch().unwrap();
    assert!(first.has_more);
    assert_eq!(first.records().count(), 1);

    match cursor.next_batch() {
        Err(Error::Exception(message)) => assert!(message.contains("does not fit"), "{message}"),
        other => panic!("expected an exception, got {other:?}"),
    }
}

#[test]
fn invalid_configuration() {
    let config = common::config("invalid").channels(0);
    assert!(matches!(
        Manager::new(config, ThreadLauncher::memory()),
        Err(Error::InvalidConfig(_))
    ));
}

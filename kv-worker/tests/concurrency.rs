mod common;

use std::sync::Barrier;
use std::thread;

use kv_worker::{Manager, OpenOptions, ThreadLauncher, WorkerClient};

#[test]
fn many_clients_one_worker() {
    const CLIENTS: u8 = 8;
    const KEYS: u8 = 40;

    // Fewer response channels than clients: leases have to be waited for.
    let config = common::config("many").channels(2);
    let _manager = Manager::spawn(config.clone(), ThreadLauncher::memory()).unwrap();

    let setup = WorkerClient::connect(&config, 1).unwrap();
    setup
        .open("rel", OpenOptions::default().create_if_missing(true))
        .unwrap();

    let barrier = Barrier::new(CLIENTS.into());
    thread::scope(|scope| {
        for client in 0..CLIENTS {
            let (config, barrier) = (&config, &barrier);
            scope.spawn(move || {
                let worker = WorkerClient::connect(config, 1).unwrap();
                barrier.wait();

                for key in 0..KEYS {
                    let value = [client, key, client ^ key];
                    assert!(worker.put(&[client, key], &value).unwrap());
                    assert_eq!(worker.get(&[client, key]).unwrap(), Some(value.to_vec()));
                }
            });
        }
    });

    assert_eq!(setup.count().unwrap(), u64::from(CLIENTS) * u64::from(KEYS));
}

#[test]
fn workers_are_isolated() {
    let config = common::config("isolated");
    let _manager = Manager::spawn(config.clone(), ThreadLauncher::memory()).unwrap();

    thread::scope(|scope| {
        for worker in 1..=4u32 {
            let config = &config;
            scope.spawn(move || {
                let client = WorkerClient::connect(config, worker).unwrap();
                client
                    .open("rel", OpenOptions::default().create_if_missing(true))
                    .unwrap();

                for i in 0..worker {
                    client.load(&i.to_ne_bytes(), b"loaded").unwrap();
                }

                assert_eq!(client.count().unwrap(), u64::from(worker));
            });
        }
    });
}

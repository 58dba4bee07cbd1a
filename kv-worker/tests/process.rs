mod common;

use std::thread;
use std::time::{Duration, Instant};

use assert_cmd::Command;
use kv_ipc::{Channel, Endpoint};
use kv_worker::{
    Error, IpcConfig, Manager, OpenOptions, ProcessLauncher, WorkerClient, WorkerState,
};

fn launcher() -> ProcessLauncher {
    ProcessLauncher::new(env!("CARGO_BIN_EXE_kv-worker"))
}

fn worker_pid(config: &IpcConfig, worker: u32) -> u32 {
    let channel = Channel::open(config, Endpoint::Worker(worker)).unwrap();
    channel.control().worker_pid().unwrap()
}

fn exists(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[test]
fn help_lists_subcommands() {
    let assert = Command::cargo_bin("kv-worker")
        .unwrap()
        .arg("--help")
        .assert()
        .success();

    let help = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    assert!(help.contains("manager"), "{help}");
    assert!(help.contains("worker"), "{help}");
}

#[test]
fn worker_without_channel_fails() {
    let config = common::config("orphan");
    Command::cargo_bin("kv-worker")
        .unwrap()
        .args(["--prefix", &config.prefix, "worker", "--id", "1"])
        .assert()
        .failure();
}

#[test]
fn worker_process_end_to_end() {
    let config = common::config("process");
    let manager = Manager::spawn(config.clone(), launcher()).unwrap();

    let client = WorkerClient::connect(&config, 1).unwrap();
    client
        .open("rel", OpenOptions::default().create_if_missing(true))
        .unwrap();

    let pid = worker_pid(&config, 1);
    assert_ne!(pid, std::process::id());

    for i in 0..100u32 {
        assert!(client.put(&i.to_be_bytes(), &[1; 64]).unwrap());
    }
    assert_eq!(client.get(&7u32.to_be_bytes()).unwrap(), Some(vec![1; 64]));

    let mut cursor = client.scan();
    let mut seen = 0;
    loop {
        let batch = cursor.next_batch().unwrap();
        seen += batch.records().count();
        if !batch.has_more {
            break;
        }
    }
    assert_eq!(seen, 100);
    drop(cursor);

    drop(client);
    manager.shutdown().unwrap();
    assert!(!exists(pid));
}

#[test]
fn worker_stops_on_sigterm() {
    let config = common::config("sigterm");
    let _manager = Manager::spawn(config.clone(), launcher()).unwrap();

    let client = WorkerClient::connect(&config, 1).unwrap();
    client
        .open("rel", OpenOptions::default().create_if_missing(true))
        .unwrap();

    let pid = worker_pid(&config, 1);
    assert_eq!(unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) }, 0);

    let deadline = Instant::now() + Duration::from_secs(10);
    while client.state() != WorkerState::Terminated {
        assert!(Instant::now() < deadline, "worker ignored SIGTERM");
        thread::sleep(Duration::from_millis(10));
    }

    assert!(matches!(client.count(), Err(Error::PartnerGone { .. })));
}

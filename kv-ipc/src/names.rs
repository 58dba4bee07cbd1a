//! Names of the shared-memory objects, all derived from the configured prefix.
use core::fmt;

use crate::message::WorkerId;

/// The owner of a command channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Manager,
    Worker(WorkerId),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Manager => f.write_str("manager"),
            Endpoint::Worker(id) => write!(f, "worker {id}"),
        }
    }
}

pub fn control(prefix: &str, endpoint: Endpoint) -> String {
    match endpoint {
        Endpoint::Manager => format!("/{prefix}.manager"),
        Endpoint::Worker(id) => format!("/{prefix}.w{id}"),
    }
}

pub fn response(control: &str, channel: u32) -> String {
    format!("{control}.r{channel}")
}

pub fn read_batch(prefix: &str, pid: u32, worker: WorkerId, operation: u64) -> String {
    format!("/{prefix}.rb.{pid}.{worker}.{operation}")
}

pub fn range_query(prefix: &str, pid: u32, worker: WorkerId, operation: u64) -> String {
    format!("/{prefix}.rq.{pid}.{worker}.{operation}")
}

#[test]
fn names_are_distinct() {
    let worker = control("kv", Endpoint::Worker(3));
    assert_eq!(worker, "/kv.w3");
    assert_eq!(response(&worker, 0), "/kv.w3.r0");
    assert_eq!(control("kv", Endpoint::Manager), "/kv.manager");
    assert_ne!(read_batch("kv", 1, 3, 9), range_query("kv", 1, 3, 9));
}

use std::collections::hash_map::{Entry, HashMap};

use kv_ipc::{CursorKey, RangeOptions};

/// Engine handles of open scans, keyed by the client process and its operation.
///
/// Owned by the worker loop and only ever touched from it.
pub struct Registry<H> {
    entries: HashMap<CursorKey, H>,
}

/// A cached range query.
pub struct RangeQueryState<R> {
    pub range: R,
    /// Options as given by the first request for the key.
    pub options: RangeOptions,
}

impl<H> Registry<H> {
    pub fn new() -> Self {
        Registry {
            entries: HashMap::new(),
        }
    }

    /// The handle registered for `key`, created by `create` when there is none.
    pub fn get_or_try_insert_with<E>(
        &mut self,
        key: CursorKey,
        create: impl FnOnce() -> Result<H, E>,
    ) -> Result<&mut H, E> {
        match self.entries.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(create()?)),
        }
    }

    pub fn remove(&mut self, key: &CursorKey) -> Option<H> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &CursorKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (CursorKey, H)> + '_ {
        self.entries.drain()
    }
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Registry::new()
    }
}

#[test]
fn create_once_remove_idempotent() {
    let key = CursorKey {
        pid: 1,
        operation: 2,
    };
    let mut registry = Registry::<u32>::new();

    let created = registry
        .get_or_try_insert_with(key, || Ok::<_, ()>(5))
        .unwrap();
    *created += 1;

    let again = registry
        .get_or_try_insert_with(key, || -> Result<u32, ()> { panic!("created twice") })
        .unwrap();
    assert_eq!(*again, 6);

    assert_eq!(registry.remove(&key), Some(6));
    assert_eq!(registry.remove(&key), None);
    assert!(registry.is_empty());
}

#[test]
fn failed_creation_registers_nothing() {
    let key = CursorKey {
        pid: 1,
        operation: 3,
    };
    let mut registry = Registry::<u32>::new();
    assert_eq!(registry.get_or_try_insert_with(key, || Err("no")), Err("no"));
    assert!(!registry.contains(&key));
}

// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! In-memory reference implementation of the small, shared configuration registry that two
//! domains use to advertise and discover a channel's connection parameters.
//!
//! A real deployment backs this with whatever per-domain key/value store the host platform
//! already exposes (xenstore, in the hypervisor this substrate is modeled on); callers never
//! see that detail; they only get `write`, a blocking `read`, and `delete` keyed by the pair
//! that names a single advertisement record.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

pub type Domid = u16;
pub type Port = u32;

/// Identifies a single advertisement record. Both the server (which writes it) and the client
/// (which reads it) name the record with the same `(Domid, Port)` pair: the remote domain id
/// and the port the server is listening on.
pub type Key = (Domid, Port);

struct RegistryTable {
    records: HashMap<Key, String>,
}

impl RegistryTable {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }
}

/// Handle to the registry substrate, shared between both ends of a test (or, in a real
/// deployment, a thin wrapper around the platform's key/value store).
#[derive(Clone)]
pub struct Registry {
    inner: Arc<(Mutex<RegistryTable>, Condvar)>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(RegistryTable::new()), Condvar::new())),
        }
    }

    /// Publishes (or replaces) the advertisement record for `key`.
    pub fn write(&self, key: Key, value: String) {
        let (lock, cv) = &*self.inner;
        let mut table = lock.lock().unwrap();
        log::trace!("write: key={key:?}");
        table.records.insert(key, value);
        cv.notify_all();
    }

    /// Blocks until `key` has an advertisement record published, then returns a copy of it.
    pub fn read(&self, key: Key) -> String {
        let (lock, cv) = &*self.inner;
        let table = lock.lock().unwrap();
        let table = cv
            .wait_while(table, |table| !table.records.contains_key(&key))
            .unwrap();
        table.records[&key].clone()
    }

    /// Returns the current record for `key` without blocking, if one exists.
    pub fn try_read(&self, key: Key) -> Option<String> {
        let (lock, _cv) = &*self.inner;
        let table = lock.lock().unwrap();
        table.records.get(&key).cloned()
    }

    /// Removes the advertisement record for `key`, if any.
    pub fn delete(&self, key: Key) {
        let (lock, cv) = &*self.inner;
        let mut table = lock.lock().unwrap();
        log::trace!("delete: key={key:?}");
        table.records.remove(&key);
        cv.notify_all();
    }

    /// Fails if any advertisement record is still published. Intended for end-of-test
    /// assertions.
    pub fn assert_cleaned_up(&self) -> bool {
        let (lock, _cv) = &*self.inner;
        let table = lock.lock().unwrap();
        table.records.is_empty()
    }
}

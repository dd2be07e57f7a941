//! Group member presence tracking
//!
//! The download pipeline needs to know, per parity group, how many members
//! are locally present without re-querying the store for every key on every
//! scheduler tick. Groups register for a handle; block add/remove events
//! update per-key presence shared across all registered groups.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tessera_core::{Group, Key};

/// Opaque registration handle for one group.
pub type GroupHandle = u64;

pub trait PresenceTracker: Send + Sync {
    fn register(&self, group: &Group) -> GroupHandle;
    fn unregister(&self, handle: GroupHandle);
    fn set_present(&self, key: &Key, present: bool);
    fn count_present(&self, handle: GroupHandle) -> usize;
    /// Member keys of the group filtered by presence.
    fn members(&self, handle: GroupHandle, present: bool) -> Vec<Key>;
}

#[derive(Default)]
struct PresenceInner {
    next_handle: GroupHandle,
    groups: HashMap<GroupHandle, Vec<Key>>,
    /// How many registered groups reference each key.
    key_refs: HashMap<Key, usize>,
    present: HashSet<Key>,
}

/// Default in-memory tracker.
#[derive(Default)]
pub struct GroupPresence {
    inner: Mutex<PresenceInner>,
}

impl GroupPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PresenceTracker for GroupPresence {
    fn register(&self, group: &Group) -> GroupHandle {
        let mut inner = self.inner.lock();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        for key in &group.keys {
            *inner.key_refs.entry(*key).or_insert(0) += 1;
        }
        inner.groups.insert(handle, group.keys.clone());
        handle
    }

    fn unregister(&self, handle: GroupHandle) {
        let mut inner = self.inner.lock();
        let Some(keys) = inner.groups.remove(&handle) else {
            return;
        };
        for key in keys {
            if let Some(count) = inner.key_refs.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    inner.key_refs.remove(&key);
                    inner.present.remove(&key);
                }
            }
        }
    }

    fn set_present(&self, key: &Key, present: bool) {
        let mut inner = self.inner.lock();
        if !inner.key_refs.contains_key(key) {
            return;
        }
        if present {
            inner.present.insert(*key);
        } else {
            inner.present.remove(key);
        }
    }

    fn count_present(&self, handle: GroupHandle) -> usize {
        let inner = self.inner.lock();
        inner
            .groups
            .get(&handle)
            .map(|keys| keys.iter().filter(|k| inner.present.contains(k)).count())
            .unwrap_or(0)
    }

    fn members(&self, handle: GroupHandle, present: bool) -> Vec<Key> {
        let inner = self.inner.lock();
        inner
            .groups
            .get(&handle)
            .map(|keys| {
                keys.iter()
                    .filter(|k| inner.present.contains(k) == present)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }
}

//! Store mutation events
//!
//! Mutations are published on unbounded channels and drained by subscriber
//! threads, so the store never calls into pipeline logic while holding its
//! own lock.

use std::path::PathBuf;
use tessera_core::Key;

/// Notification of a block store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    BlockAdded(Key),
    BlockRemoved(Key),
    ShareRemoved(PathBuf),
}

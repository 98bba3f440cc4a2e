//! In-memory table of tracked calls

use crate::call::{Call, CallSnapshot};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Calls in flight, keyed by `Uniqueid`.
///
/// The registry owns each [`Call`] while it is tracked; readers get clones.
#[derive(Debug, Default)]
pub struct CallRegistry {
    calls: Mutex<HashMap<String, Call>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<String, Call>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `call`, replacing any call with the same id.
    pub fn watch(&self, call: Call) -> Option<Call> {
        self.calls()
            .insert(
                call.unique_id()
                    .to_string(),
                call,
            )
    }

    /// Clone of the tracked call.
    pub fn lookup(&self, unique_id: &str) -> Option<Call> {
        self.calls()
            .get(unique_id)
            .cloned()
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.calls()
            .contains_key(unique_id)
    }

    /// Mutate a tracked call under the lock. Returns `None` if the id is unknown.
    pub fn update<R>(&self, unique_id: &str, f: impl FnOnce(&mut Call) -> R) -> Option<R> {
        self.calls()
            .get_mut(unique_id)
            .map(f)
    }

    /// Stop tracking a call, handing it back.
    pub fn unwatch(&self, unique_id: &str) -> Option<Call> {
        self.calls()
            .remove(unique_id)
    }

    pub fn len(&self) -> usize {
        self.calls()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots of every tracked call, sorted by id.
    pub fn snapshot(&self) -> Vec<CallSnapshot> {
        let mut snapshots: Vec<CallSnapshot> = self
            .calls()
            .values()
            .map(Call::snapshot)
            .collect();
        snapshots.sort_by(|a, b| {
            a.unique_id
                .cmp(&b.unique_id)
        });
        snapshots
    }
}

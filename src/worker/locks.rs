//! In-process advisory locks.
//!
//! One reconciliation step may run per internal key at a time. For the
//! create path, where no internal key exists yet, the lock is keyed on the
//! foreign-key triple instead. Guards release on drop.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::model::{ForeignKey, InternalKey};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockKey {
    Internal(InternalKey),
    Foreign(ForeignKey),
}

#[derive(Clone, Default)]
pub struct LockTable {
    held: Arc<Mutex<BTreeSet<LockKey>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `key` if free. Contention is rare; callers abandon the item
    /// with a short backoff rather than block.
    pub fn try_acquire(&self, key: LockKey) -> Option<LockGuard> {
        let mut held = self.held.lock().expect("lock table poisoned");
        if held.insert(key.clone()) {
            Some(LockGuard {
                table: self.clone(),
                key,
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, key: &LockKey) -> bool {
        let held = self.held.lock().expect("lock table poisoned");
        held.contains(key)
    }
}

pub struct LockGuard {
    table: LockTable,
    key: LockKey,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut held = self.table.held.lock().expect("lock table poisoned");
        let released = held.remove(&self.key);
        debug_assert!(released, "lock released twice");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityName;

    fn key(id: u64) -> LockKey {
        LockKey::Internal(InternalKey::new(
            EntityName::new("customer").expect("entity"),
            id,
        ))
    }

    #[test]
    fn second_acquisition_fails_until_release() {
        let table = LockTable::new();
        let guard = table.try_acquire(key(1)).expect("first acquire");
        assert!(table.try_acquire(key(1)).is_none());
        assert!(table.try_acquire(key(2)).is_some());

        drop(guard);
        assert!(!table.is_held(&key(1)));
        assert!(table.try_acquire(key(1)).is_some());
    }
}

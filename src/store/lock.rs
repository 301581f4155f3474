//! Per-xid mutation lock with bounded wait
//!
//! Every mutation of a global session (protocol report or operator command)
//! runs while holding that xid's lock, so a command and a concurrent
//! coordinator update never interleave. Acquisition gives up after the
//! configured wait and the caller surfaces `Busy`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

use crate::error::{ConsoleError, Result};

/// Lock table keyed by xid. Entries are dropped once nobody holds or waits on them.
#[derive(Default)]
pub struct KeyedLock {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Held per-xid lock; releases (and garbage-collects its slot) on drop
pub struct KeyGuard<'a> {
    owner: &'a KeyedLock,
    key: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `key`, waiting at most `wait`
    pub fn acquire(&self, key: &str, wait: Duration) -> Result<KeyGuard<'_>> {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key.to_string()).or_default())
        };

        match slot.try_lock_arc_for(wait) {
            Some(guard) => Ok(KeyGuard {
                owner: self,
                key: key.to_string(),
                guard: Some(guard),
            }),
            None => {
                drop(slot);
                self.collect(key);
                Err(ConsoleError::lock_timeout(key, wait.as_millis() as u64))
            }
        }
    }

    /// Number of xids currently locked or awaited
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn collect(&self, key: &str) {
        let mut slots = self.slots.lock();
        // Only the table itself still references the slot
        if slots.get(key).map(|s| Arc::strong_count(s) == 1).unwrap_or(false) {
            slots.remove(key);
        }
    }
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex (and its Arc) before checking whether the slot is unused
        self.guard.take();
        self.owner.collect(&self.key);
    }
}

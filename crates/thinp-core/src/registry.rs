//! Process-wide table of live pools, keyed by metadata device path.
//!
//! Mirrors how a real thin-provisioning target shares one `Pool` across
//! every thin device built on top of the same metadata device: the first
//! `create_thin`/`bind` call constructs it, later ones find it already
//! running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::pool::Pool;

#[derive(Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<String, Weak<Pool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pool already registered for `metadata_dev`, if its last
    /// strong reference hasn't been dropped yet.
    pub fn get(&self, metadata_dev: &str) -> Option<Arc<Pool>> {
        self.pools.lock().unwrap().get(metadata_dev).and_then(Weak::upgrade)
    }

    /// Registers `pool` under `metadata_dev`, replacing any stale entry
    /// whose pool has already been torn down.
    pub fn insert(&self, metadata_dev: impl Into<String>, pool: &Arc<Pool>) {
        self.pools
            .lock()
            .unwrap()
            .insert(metadata_dev.into(), Arc::downgrade(pool));
    }

    /// Drops any entries whose pool has already been torn down.
    pub fn reap(&self) {
        self.pools.lock().unwrap().retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn live_count(&self) -> usize {
        self.pools
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

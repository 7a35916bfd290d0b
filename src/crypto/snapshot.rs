//! Versioned key pool snapshots.
//!
//! A snapshot pins the exact pool state a signature was produced against,
//! so verification stays reproducible while the live pool keeps rotating.
//! Snapshots share the pool vector by reference; taking one never copies
//! key material.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::keypool::KeyEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPoolSnapshot {
    pub id: Uuid,
    pub key_pool: Arc<Vec<KeyEntry>>,
    /// Pool-wide keyed-hash secret, distinct from every pool key.
    pub sign_key: Arc<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

/// Bounded snapshot cache: many readers, first writer wins per id, oldest
/// entries evicted once the capacity is reached.
pub struct SnapshotCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    map: HashMap<Uuid, Arc<KeyPoolSnapshot>>,
    order: VecDeque<Uuid>,
}

impl SnapshotCache {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<KeyPoolSnapshot>> {
        let mut inner = self.inner.lock();
        let snapshot = inner.map.get(id).cloned()?;
        // Move to the back so hot snapshots outlive cold ones.
        if let Some(pos) = inner.order.iter().position(|v| v == id) {
            inner.order.remove(pos);
            inner.order.push_back(*id);
        }
        Some(snapshot)
    }

    /// Insert a snapshot. A later insert for the same id is a no-op.
    pub fn insert(&self, snapshot: Arc<KeyPoolSnapshot>) {
        let mut inner = self.inner.lock();
        let id = snapshot.id;
        if inner.map.contains_key(&id) {
            return;
        }

        inner.map.insert(id, snapshot);
        inner.order.push_back(id);

        while inner.map.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.map.remove(&evicted);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

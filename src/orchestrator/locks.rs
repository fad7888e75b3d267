//! Per-identity mutual exclusion
//!
//! Mutations on one volume identity hold its lock from the existence or
//! ETag check until the driver call returns. Unrelated identities never
//! contend.

use crate::storage::VolumeIdentity;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct VolumeLocks {
    locks: Mutex<HashMap<VolumeIdentity, Arc<AsyncMutex<()>>>>,
}

/// Held while mutating one identity
pub struct VolumeGuard {
    _guard: OwnedMutexGuard<()>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, identity: &VolumeIdentity) -> VolumeGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // drop entries nobody holds or waits on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        VolumeGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Lock two identities in a fixed order
    pub async fn lock_pair(
        &self,
        a: &VolumeIdentity,
        b: &VolumeIdentity,
    ) -> (VolumeGuard, Option<VolumeGuard>) {
        if a == b {
            return (self.lock(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.lock(first).await;
        let second = self.lock(second).await;
        (first, Some(second))
    }
}

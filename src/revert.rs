//! Compensation list for multi-step mutations
//!
//! Each forward step that succeeds pushes a typed [`Undo`] record. If the
//! sequence never reaches [`Reverter::success`], [`Reverter::rollback`]
//! replays the records in reverse order.

use crate::cluster::db::{ClusterDb, DeviceRef};
use crate::common::Result;
use crate::storage::driver::{DriverVolume, PoolDriver};
use std::sync::Arc;

/// One compensating action
pub enum Undo {
    /// Remove a volume record that was inserted
    DeleteVolumeRecord { id: u64 },
    /// Rename a volume record back
    RenameVolumeRecord { id: u64, name: String },
    /// Remove a volume the driver created
    DeleteDriverVolume {
        driver: Arc<dyn PoolDriver>,
        vol: DriverVolume,
    },
    /// Point a device back at its previous pool and source
    RestoreDevice(DeviceRef),
}

impl Undo {
    fn describe(&self) -> String {
        match self {
            Undo::DeleteVolumeRecord { id } => format!("delete volume record {}", id),
            Undo::RenameVolumeRecord { id, name } => {
                format!("rename volume record {} to {:?}", id, name)
            }
            Undo::DeleteDriverVolume { vol, .. } => format!("delete volume {:?}", vol.name),
            Undo::RestoreDevice(r) => format!(
                "restore device {:?} on {}",
                r.device,
                r.consumer.url()
            ),
        }
    }

    async fn apply(self, db: &ClusterDb) -> Result<()> {
        match self {
            Undo::DeleteVolumeRecord { id } => db.transaction(|tx| tx.delete_storage_volume(id)),
            Undo::RenameVolumeRecord { id, name } => {
                db.transaction(|tx| tx.rename_storage_volume(id, &name))
            }
            Undo::DeleteDriverVolume { driver, vol } => driver.delete_volume(&vol).await,
            Undo::RestoreDevice(r) => db
                .transaction(|tx| tx.set_device_source(&r.consumer, &r.device, &r.pool, &r.source))
                .map(|_| ()),
        }
    }
}

pub struct Reverter {
    db: Arc<ClusterDb>,
    undo: Vec<Undo>,
}

impl Reverter {
    pub fn new(db: Arc<ClusterDb>) -> Self {
        Self {
            db,
            undo: Vec::new(),
        }
    }

    pub fn add(&mut self, undo: Undo) {
        self.undo.push(undo);
    }

    /// Mark the sequence complete; nothing will be reverted
    pub fn success(mut self) {
        self.undo.clear();
    }

    /// Replay every record in reverse. Failures are logged and do not stop
    /// the remaining records.
    pub async fn rollback(mut self) {
        while let Some(undo) = self.undo.pop() {
            let what = undo.describe();
            match undo.apply(&self.db).await {
                Ok(()) => tracing::debug!("Reverted: {}", what),
                Err(e) => tracing::error!(error = %e, "Failed to revert: {}", what),
            }
        }
    }

    /// Run `result` through the reverter: roll back on error, commit on success
    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Ok(v) => {
                self.success();
                Ok(v)
            }
            Err(e) => {
                self.rollback().await;
                Err(e)
            }
        }
    }
}

impl Drop for Reverter {
    fn drop(&mut self) {
        if !self.undo.is_empty() {
            tracing::warn!(
                pending = self.undo.len(),
                "Reverter dropped without success or rollback"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::db::tests::volume;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_rollback_replays_in_reverse() {
        let db = Arc::new(ClusterDb::in_memory());
        let pool_id = db
            .transaction(|tx| tx.create_storage_pool("default", "dir", "", BTreeMap::new()))
            .unwrap();
        let id = db
            .transaction(|tx| tx.create_storage_volume(volume(pool_id, "data", Some("node1"))))
            .unwrap();

        let mut revert = Reverter::new(db.clone());
        revert.add(Undo::DeleteVolumeRecord { id });
        db.transaction(|tx| tx.rename_storage_volume(id, "renamed")).unwrap();
        revert.add(Undo::RenameVolumeRecord {
            id,
            name: "data".into(),
        });
        revert.rollback().await;

        // rename undone first, then the record removed
        let remaining = db
            .transaction(|tx| Ok(tx.list_storage_volumes(pool_id, None, None)))
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_success_keeps_changes() {
        let db = Arc::new(ClusterDb::in_memory());
        let pool_id = db
            .transaction(|tx| tx.create_storage_pool("default", "dir", "", BTreeMap::new()))
            .unwrap();
        let id = db
            .transaction(|tx| tx.create_storage_volume(volume(pool_id, "data", Some("node1"))))
            .unwrap();

        let mut revert = Reverter::new(db.clone());
        revert.add(Undo::DeleteVolumeRecord { id });
        let out = revert.finish(Ok::<_, crate::Error>(7)).await.unwrap();
        assert_eq!(out, 7);
        assert!(db.transaction(|tx| tx.get_storage_volume_by_id(id)).is_ok());
    }
}

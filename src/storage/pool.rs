//! Storage pool: a pool record bound to its driver
//!
//! Every capability keeps the metadata records and the driver state in step;
//! a failed driver call rolls the records back through a [`Reverter`].

use crate::cluster::db::{ClusterDb, PoolRecord, VolumeRecord};
use crate::common::{Error, Result};
use crate::revert::{Reverter, Undo};
use crate::storage::driver::{DriverInfo, DriverVolume, PoolDriver, VolumeReader};
use crate::storage::volume::{
    snapshot_name, split_snapshot, validate_volume_name, ContentType, VolumeKind,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Parameters of a volume about to be created
#[derive(Debug, Clone, Default)]
pub struct NewVolume {
    pub project: String,
    pub name: String,
    pub description: String,
    pub config: BTreeMap<String, String>,
    pub content_type: ContentType,
}

/// Source of a local copy
pub struct CopySource<'a> {
    pub pool: &'a StoragePool,
    pub project: &'a str,
    pub name: &'a str,
    pub volume_only: bool,
}

#[derive(Clone)]
pub struct StoragePool {
    record: PoolRecord,
    driver: Arc<dyn PoolDriver>,
    db: Arc<ClusterDb>,
    member: String,
}

impl StoragePool {
    pub fn new(
        record: PoolRecord,
        driver: Arc<dyn PoolDriver>,
        db: Arc<ClusterDb>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            record,
            driver,
            db,
            member: member.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn id(&self) -> u64 {
        self.record.id
    }

    pub fn record(&self) -> &PoolRecord {
        &self.record
    }

    pub fn driver_info(&self) -> DriverInfo {
        self.driver.info()
    }

    pub fn driver(&self) -> &Arc<dyn PoolDriver> {
        &self.driver
    }

    /// Member recorded on volumes this node creates in the pool
    pub fn owner(&self) -> Option<String> {
        if self.driver.info().remote {
            None
        } else {
            Some(self.member.clone())
        }
    }

    /// Generic and driver rules for a new volume
    pub fn validate_volume(&self, name: &str, config: &BTreeMap<String, String>) -> Result<()> {
        validate_volume_name(name)?;
        self.driver.validate_name(name)?;
        self.driver.validate_config(config)
    }

    /// Record of a volume hosted by this member
    pub fn get_volume(&self, project: &str, kind: VolumeKind, name: &str) -> Result<VolumeRecord> {
        let owner = self.owner();
        self.db.transaction(|tx| {
            tx.get_storage_volume_on(self.id(), project, kind, name, owner.as_deref())
        })
    }

    pub fn list_snapshots(&self, parent: &VolumeRecord) -> Result<Vec<VolumeRecord>> {
        self.db
            .transaction(|tx| Ok(tx.list_storage_volume_snapshots(parent)))
    }

    pub fn driver_volume(record: &VolumeRecord) -> DriverVolume {
        DriverVolume::new(&record.project, record.kind, &record.name, record.content_type)
    }

    /// Open the content of a volume or one of its snapshots
    pub async fn open_volume(
        &self,
        record: &VolumeRecord,
        snapshot: Option<&str>,
    ) -> Result<(VolumeReader, u64)> {
        self.driver
            .read_volume(&Self::driver_volume(record), snapshot)
            .await
    }

    fn volume_record(&self, new: &NewVolume, kind: VolumeKind) -> VolumeRecord {
        VolumeRecord {
            id: 0,
            pool_id: self.id(),
            project: new.project.clone(),
            kind,
            name: new.name.clone(),
            member: self.owner(),
            content_type: new.content_type,
            description: new.description.clone(),
            config: new.config.clone(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Insert the record and create the empty driver volume, registering
    /// both on `revert`
    async fn allocate(&self, new: &NewVolume, revert: &mut Reverter) -> Result<VolumeRecord> {
        self.validate_volume(&new.name, &new.config)?;
        let mut record = self.volume_record(new, VolumeKind::Custom);
        record.id = self
            .db
            .transaction(|tx| tx.create_storage_volume(record.clone()))?;
        revert.add(Undo::DeleteVolumeRecord { id: record.id });

        let vol = Self::driver_volume(&record);
        self.driver.create_volume(&vol).await?;
        revert.add(Undo::DeleteDriverVolume {
            driver: self.driver.clone(),
            vol,
        });
        Ok(record)
    }

    /// Create an empty custom volume
    pub async fn create_custom_volume(&self, new: NewVolume) -> Result<VolumeRecord> {
        let mut revert = Reverter::new(self.db.clone());
        let result = self.allocate(&new, &mut revert).await;
        let record = revert.finish(result).await?;
        tracing::info!(pool = %self.name(), project = %record.project, volume = %record.name, "Created custom volume");
        Ok(record)
    }

    /// Create a custom volume and fill it with `reader`
    pub async fn create_custom_volume_from_reader(
        &self,
        new: NewVolume,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<VolumeRecord> {
        let mut revert = Reverter::new(self.db.clone());
        let result = async {
            let record = self.allocate(&new, &mut revert).await?;
            self.driver
                .write_volume(&Self::driver_volume(&record), None, reader)
                .await?;
            Ok(record)
        }
        .await;
        revert.finish(result).await
    }

    /// Copy a custom volume, then its snapshots in source order. A failed
    /// snapshot copy keeps the primary volume and earlier snapshots.
    pub async fn create_custom_volume_from_copy(
        &self,
        mut new: NewVolume,
        src: CopySource<'_>,
        cancel: &CancellationToken,
    ) -> Result<VolumeRecord> {
        let src_record = src.pool.get_volume(src.project, VolumeKind::Custom, src.name)?;
        new.content_type = src_record.content_type;
        if new.config.is_empty() {
            new.config = src_record.config.clone();
        }
        if new.description.is_empty() {
            new.description = src_record.description.clone();
        }
        let snapshots = if src.volume_only {
            Vec::new()
        } else {
            src.pool.list_snapshots(&src_record)?
        };

        let mut revert = Reverter::new(self.db.clone());
        let result = async {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let record = self.allocate(&new, &mut revert).await?;
            let (mut reader, _) = src.pool.open_volume(&src_record, None).await?;
            self.driver
                .write_volume(&Self::driver_volume(&record), None, &mut reader)
                .await?;
            Ok(record)
        }
        .await;
        let record = revert.finish(result).await?;

        for snap in &snapshots {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.copy_snapshot(src.pool, &src_record, snap, &record)
                .await
                .map_err(|e| {
                    tracing::warn!(volume = %record.name, snapshot = %snap.name, error = %e, "Snapshot copy failed");
                    e
                })?;
        }

        tracing::info!(
            pool = %self.name(),
            volume = %record.name,
            source = %src_record.name,
            snapshots = snapshots.len(),
            "Copied custom volume"
        );
        Ok(record)
    }

    /// Copy one snapshot of `src_parent` onto `dst_parent`
    async fn copy_snapshot(
        &self,
        src_pool: &StoragePool,
        src_parent: &VolumeRecord,
        snap: &VolumeRecord,
        dst_parent: &VolumeRecord,
    ) -> Result<VolumeRecord> {
        let (_, snap_part) = split_snapshot(&snap.name);
        let snap_part = snap_part.unwrap_or_default();
        let (mut reader, _) = src_pool.open_volume(src_parent, Some(snap_part)).await?;
        self.import_snapshot(dst_parent, snap_part, snap.created_at, snap.config.clone(), &mut reader)
            .await
    }

    /// Write a snapshot of `parent` from a stream and record it
    pub async fn import_snapshot(
        &self,
        parent: &VolumeRecord,
        snapshot: &str,
        created_at: i64,
        config: BTreeMap<String, String>,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<VolumeRecord> {
        let vol = Self::driver_volume(parent);
        self.driver.write_volume(&vol, Some(snapshot), reader).await?;

        let mut record = parent.clone();
        record.name = snapshot_name(&parent.name, snapshot);
        record.created_at = created_at;
        record.config = config;
        let inserted = self
            .db
            .transaction(|tx| tx.create_storage_volume(record.clone()));
        match inserted {
            Ok(id) => {
                record.id = id;
                Ok(record)
            }
            Err(e) => {
                if let Err(cleanup) = self.driver.delete_snapshot(&vol, snapshot).await {
                    tracing::error!(pool = %self.name(), volume = %parent.name, snapshot, error = %cleanup, "Failed to remove unrecorded snapshot");
                }
                Err(e)
            }
        }
    }

    /// Re-sync an existing volume from another local volume. Snapshots are
    /// reconciled by (name, creation time); config only changes when given.
    pub async fn refresh_custom_volume(
        &self,
        project: &str,
        name: &str,
        config: Option<BTreeMap<String, String>>,
        src: CopySource<'_>,
        cancel: &CancellationToken,
    ) -> Result<VolumeRecord> {
        let dst = self.get_volume(project, VolumeKind::Custom, name)?;
        let src_record = src.pool.get_volume(src.project, VolumeKind::Custom, src.name)?;
        if dst.content_type != src_record.content_type {
            return Err(Error::InvalidInput(format!(
                "Content type mismatch: source is {} but target is {}",
                src_record.content_type.as_str(),
                dst.content_type.as_str()
            )));
        }
        if let Some(config) = &config {
            self.driver.validate_config(config)?;
        }

        if !src.volume_only {
            let src_snaps = src.pool.list_snapshots(&src_record)?;
            let wanted = self
                .sync_snapshot_list(&dst, &src_snaps, |s| (s.name.clone(), s.created_at))
                .await?;
            for snap in src_snaps.iter().filter(|s| wanted.contains(&snapshot_part(&s.name))) {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.copy_snapshot(src.pool, &src_record, snap, &dst).await?;
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (mut reader, _) = src.pool.open_volume(&src_record, None).await?;
        self.driver
            .write_volume(&Self::driver_volume(&dst), None, &mut reader)
            .await?;

        let record = match config {
            Some(config) => self
                .db
                .transaction(|tx| tx.update_storage_volume(dst.id, |v| v.config = config))?,
            None => dst,
        };
        tracing::info!(pool = %self.name(), volume = %record.name, "Refreshed custom volume");
        Ok(record)
    }

    /// Drop local snapshots that are absent from (or differ in creation time
    /// with) the source list; return the snapshot names still missing.
    pub async fn sync_snapshot_list<T>(
        &self,
        parent: &VolumeRecord,
        source: &[T],
        key: impl Fn(&T) -> (String, i64),
    ) -> Result<Vec<String>> {
        let source: Vec<(String, i64)> = source
            .iter()
            .map(|s| {
                let (name, created) = key(s);
                (snapshot_part(&name), created)
            })
            .collect();
        let local = self.list_snapshots(parent)?;
        let vol = Self::driver_volume(parent);

        let mut kept = Vec::new();
        for snap in local {
            let part = snapshot_part(&snap.name);
            if source.contains(&(part.clone(), snap.created_at)) {
                kept.push(part);
            } else {
                self.driver.delete_snapshot(&vol, &part).await?;
                self.db.transaction(|tx| tx.delete_storage_volume(snap.id))?;
            }
        }

        Ok(source
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| !kept.contains(name))
            .collect())
    }

    /// Rename a custom volume; the record rename is reverted if the driver fails
    pub async fn rename_custom_volume(&self, project: &str, name: &str, new_name: &str) -> Result<()> {
        self.validate_volume(new_name, &BTreeMap::new())?;
        let record = self.get_volume(project, VolumeKind::Custom, name)?;

        let mut revert = Reverter::new(self.db.clone());
        let result = async {
            self.db
                .transaction(|tx| tx.rename_storage_volume(record.id, new_name))?;
            revert.add(Undo::RenameVolumeRecord {
                id: record.id,
                name: name.to_string(),
            });
            self.driver
                .rename_volume(&Self::driver_volume(&record), new_name)
                .await
        }
        .await;
        revert.finish(result).await?;
        tracing::info!(pool = %self.name(), project, from = name, to = new_name, "Renamed custom volume");
        Ok(())
    }

    /// Delete a custom volume together with its snapshots
    pub async fn delete_custom_volume(&self, project: &str, name: &str) -> Result<()> {
        self.delete_volume(project, VolumeKind::Custom, name).await
    }

    /// Delete the image volume of `fingerprint`
    pub async fn delete_image_volume(&self, project: &str, fingerprint: &str) -> Result<()> {
        self.delete_volume(project, VolumeKind::Image, fingerprint).await
    }

    async fn delete_volume(&self, project: &str, kind: VolumeKind, name: &str) -> Result<()> {
        let record = self.get_volume(project, kind, name)?;
        let snapshots = self.list_snapshots(&record)?;

        self.driver
            .delete_volume(&Self::driver_volume(&record))
            .await?;
        self.db.transaction(|tx| {
            for snap in &snapshots {
                tx.delete_storage_volume(snap.id)?;
            }
            tx.delete_storage_volume(record.id)
        })?;
        tracing::info!(pool = %self.name(), project, volume = name, kind = %kind, "Deleted volume");
        Ok(())
    }

    /// Roll a custom volume back to one of its snapshots
    pub async fn restore_custom_volume(&self, project: &str, name: &str, snapshot: &str) -> Result<()> {
        let record = self.get_volume(project, VolumeKind::Custom, name)?;
        let full = snapshot_name(name, snapshot);
        if !self.list_snapshots(&record)?.iter().any(|s| s.name == full) {
            return Err(Error::NotFound(format!("Snapshot {:?} not found", snapshot)));
        }
        self.driver
            .restore_snapshot(&Self::driver_volume(&record), snapshot)
            .await
    }

    pub async fn update_custom_volume(
        &self,
        project: &str,
        name: &str,
        description: Option<String>,
        config: Option<BTreeMap<String, String>>,
    ) -> Result<VolumeRecord> {
        self.update_volume(project, VolumeKind::Custom, name, description, config)
    }

    pub async fn update_image_volume(
        &self,
        project: &str,
        fingerprint: &str,
        description: Option<String>,
        config: Option<BTreeMap<String, String>>,
    ) -> Result<VolumeRecord> {
        self.update_volume(project, VolumeKind::Image, fingerprint, description, config)
    }

    pub async fn update_instance_volume(
        &self,
        project: &str,
        kind: VolumeKind,
        name: &str,
        description: Option<String>,
        config: Option<BTreeMap<String, String>>,
    ) -> Result<VolumeRecord> {
        if !matches!(kind, VolumeKind::Container | VolumeKind::VirtualMachine) {
            return Err(Error::InvalidInput(format!("{} is not an instance volume type", kind)));
        }
        self.update_volume(project, kind, name, description, config)
    }

    fn update_volume(
        &self,
        project: &str,
        kind: VolumeKind,
        name: &str,
        description: Option<String>,
        config: Option<BTreeMap<String, String>>,
    ) -> Result<VolumeRecord> {
        if let Some(config) = &config {
            self.driver.validate_config(config)?;
        }
        let record = self.get_volume(project, kind, name)?;
        self.db.transaction(|tx| {
            tx.update_storage_volume(record.id, |v| {
                if let Some(description) = description {
                    v.description = description;
                }
                if let Some(config) = config {
                    v.config = config;
                }
            })
        })
    }

    /// Snapshot the current content of a custom volume
    pub async fn create_custom_volume_snapshot(
        &self,
        project: &str,
        name: &str,
        snapshot: &str,
    ) -> Result<VolumeRecord> {
        validate_volume_name(snapshot)?;
        let parent = self.get_volume(project, VolumeKind::Custom, name)?;
        let vol = Self::driver_volume(&parent);
        self.driver.create_snapshot(&vol, snapshot).await?;

        let mut record = parent.clone();
        record.name = snapshot_name(name, snapshot);
        record.created_at = chrono::Utc::now().timestamp();
        let inserted = self
            .db
            .transaction(|tx| tx.create_storage_volume(record.clone()));
        match inserted {
            Ok(id) => {
                record.id = id;
                Ok(record)
            }
            Err(e) => {
                if let Err(cleanup) = self.driver.delete_snapshot(&vol, snapshot).await {
                    tracing::error!(pool = %self.name(), volume = %parent.name, snapshot, error = %cleanup, "Failed to remove unrecorded snapshot");
                }
                Err(e)
            }
        }
    }
}

fn snapshot_part(name: &str) -> String {
    split_snapshot(name).1.unwrap_or(name).to_string()
}

//! Reads, full updates and config patches

use super::{quota, Orchestrator, VolumeFilter};
use crate::api::types::VolumePut;
use crate::common::{Error, Result};
use crate::storage::volume::{is_snapshot, VolumeAction};
use crate::storage::{StorageVolume, VolumeKind};
use std::collections::BTreeMap;

/// Scope of a list request
#[derive(Debug, Clone, Default)]
pub struct ListScope {
    pub project: String,
    pub all_projects: bool,
    pub kind: Option<VolumeKind>,
    /// Only volumes held by this member (or by no member)
    pub member: Option<String>,
}

impl Orchestrator {
    pub fn get_volume(
        &self,
        pool_name: &str,
        project: &str,
        kind: VolumeKind,
        name: &str,
    ) -> Result<StorageVolume> {
        kind.require(VolumeAction::Read)?;
        let project = self.volume_project(project, kind)?;
        let pool = self.pool(pool_name)?;
        let record = pool.get_volume(&project, kind, name)?;
        self.volume_view(&pool, &record)
    }

    pub fn list_volumes(
        &self,
        pool_name: &str,
        scope: &ListScope,
        filter: &VolumeFilter,
    ) -> Result<Vec<StorageVolume>> {
        let pool = self.pool(pool_name)?;
        let projects = if scope.all_projects {
            None
        } else {
            Some((
                self.effective_project(&scope.project)?,
                scope.project.clone(),
            ))
        };

        let mut records = self.db.transaction(|tx| {
            Ok(tx.list_storage_volumes(pool.id(), None, scope.kind))
        })?;
        records.retain(|r| {
            if is_snapshot(&r.name) {
                return false;
            }
            let in_project = match &projects {
                None => true,
                Some((custom, other)) => match r.kind {
                    VolumeKind::Custom => &r.project == custom,
                    _ => &r.project == other,
                },
            };
            let on_member = match (&scope.member, &r.member) {
                (Some(want), Some(has)) => want == has,
                _ => true,
            };
            in_project && on_member
        });
        records.sort_by(|a, b| {
            (&a.project, a.kind, &a.name, &a.member).cmp(&(&b.project, b.kind, &b.name, &b.member))
        });

        let mut out = Vec::with_capacity(records.len());
        for record in &records {
            let view = self.volume_view(&pool, record)?;
            if filter.matches(&view) {
                out.push(view);
            }
        }
        Ok(out)
    }

    fn check_etag(view: &StorageVolume, if_match: Option<&str>) -> Result<()> {
        let Some(expected) = if_match else {
            return Ok(());
        };
        let expected = expected.trim().trim_matches('"');
        if expected != view.etag()? {
            return Err(Error::PreconditionFailed("ETag doesn't match".into()));
        }
        Ok(())
    }

    /// PUT: replace description and config
    pub async fn update_volume(
        &self,
        pool_name: &str,
        project: &str,
        kind: VolumeKind,
        name: &str,
        req: VolumePut,
        if_match: Option<&str>,
    ) -> Result<StorageVolume> {
        kind.require(VolumeAction::Update)?;
        let project = self.volume_project(project, kind)?;
        let pool = self.pool(pool_name)?;
        let identity = Self::identity(pool.name(), &project, kind, name);
        let _guard = self.locks.lock(&identity).await;

        let record = pool.get_volume(&project, kind, name)?;
        Self::check_etag(&self.volume_view(&pool, &record)?, if_match)?;

        let record = match kind {
            VolumeKind::Custom => {
                self.check_busy(&identity)?;
                let config = if req.restore.is_empty() || req.config.is_some() {
                    Some(req.config.unwrap_or_default())
                } else {
                    None
                };
                if let Some(config) = &config {
                    self.check_quota(&project, name, config)?;
                }
                if !req.restore.is_empty() {
                    pool.restore_custom_volume(&project, name, &req.restore).await?;
                    tracing::info!(pool = %pool.name(), project = %project, volume = name, snapshot = %req.restore, "Restored custom volume");
                }
                pool.update_custom_volume(&project, name, req.description, config)
                    .await?
            }
            VolumeKind::Image => {
                pool.update_image_volume(
                    &project,
                    name,
                    req.description,
                    Some(req.config.unwrap_or_default()),
                )
                .await?
            }
            VolumeKind::Container | VolumeKind::VirtualMachine => {
                pool.update_instance_volume(
                    &project,
                    kind,
                    name,
                    req.description,
                    Some(req.config.unwrap_or_default()),
                )
                .await?
            }
        };
        self.volume_view(&pool, &record)
    }

    /// PATCH: merge the supplied config onto the current one
    pub async fn patch_volume(
        &self,
        pool_name: &str,
        project: &str,
        kind: VolumeKind,
        name: &str,
        req: VolumePut,
        if_match: Option<&str>,
    ) -> Result<StorageVolume> {
        kind.require(VolumeAction::Patch)?;
        let project = self.volume_project(project, kind)?;
        let pool = self.pool(pool_name)?;
        let identity = Self::identity(pool.name(), &project, kind, name);
        let _guard = self.locks.lock(&identity).await;

        let record = pool.get_volume(&project, kind, name)?;
        Self::check_etag(&self.volume_view(&pool, &record)?, if_match)?;
        self.check_busy(&identity)?;

        let mut config = record.config.clone();
        if let Some(patch) = req.config {
            config.extend(patch);
        }
        self.check_quota(&project, name, &config)?;
        let record = pool
            .update_custom_volume(&project, name, req.description, Some(config))
            .await?;
        self.volume_view(&pool, &record)
    }

    fn check_quota(&self, project: &str, name: &str, config: &BTreeMap<String, String>) -> Result<()> {
        self.db
            .transaction(|tx| quota::check_disk_limit(tx, project, name, config))
    }
}

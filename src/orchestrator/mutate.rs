//! POST on a volume: rename, move, migrate and cross-member move

use super::{quota, Caller, Orchestrator, Outcome};
use crate::api::types::{VolumePost, VolumeSource, VolumesPost};
use crate::cluster::db::MemberRecord;
use crate::common::{encode_segment, Error, Result};
use crate::migration::{MigrationSource, PushTarget};
use crate::operations::{
    Canceller, Operation, OperationContext, OperationSpec, OperationStatus, OperationType, Runner,
};
use crate::revert::{Reverter, Undo};
use crate::storage::volume::VolumeAction;
use crate::storage::{CopySource, NewVolume, StoragePool, VolumeKind};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Where a volume POST has to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostRoute {
    /// Serve here
    Local,
    /// Relay to the member named in `source.location`
    Forward(MemberRecord),
    /// The source member is gone but the pool is reachable from here, so a
    /// move reduces to a rename
    LocalRename,
}

impl Orchestrator {
    /// Decide where a POST carrying `source.location` runs
    pub fn route_post(&self, pool_name: &str, req: &VolumePost) -> Result<PostRoute> {
        let location = &req.source.location;
        if !req.migration || location.is_empty() || location == &self.member {
            return Ok(PostRoute::Local);
        }

        match self.forwarder.online_member(location) {
            Ok(member) => Ok(PostRoute::Forward(member)),
            Err(Error::RemoteUnavailable { member, .. }) => {
                if self.pool(pool_name)?.driver_info().remote {
                    tracing::info!(member = %member, "Source member is offline, renaming on the shared pool");
                    Ok(PostRoute::LocalRename)
                } else {
                    Err(Error::unavailable(
                        member,
                        "The cluster member hosting the storage volume is offline",
                    ))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// POST on `/storage-pools/{pool}/volumes/{type}/{name}`.
    /// `target_member` is the `?target=` destination of a cross-member move.
    #[allow(clippy::too_many_arguments)]
    pub async fn post_volume(
        self: &Arc<Self>,
        pool_name: &str,
        project: &str,
        kind: VolumeKind,
        name: &str,
        mut req: VolumePost,
        target_member: Option<&str>,
        caller: &Caller,
    ) -> Result<Outcome> {
        let src_project = self.effective_project(project)?;
        let pool = self.pool(pool_name)?;

        if req.migration {
            kind.require(VolumeAction::Migrate)?;
            if let Some(member) = target_member.filter(|m| *m != self.member) {
                return self
                    .move_to_member(pool, project, &src_project, name, req, member, caller)
                    .await;
            }
            return self.start_source(pool, &src_project, name, req);
        }

        kind.require(VolumeAction::Rename)?;
        if req.name.is_empty() {
            req.name = name.to_string();
        }
        let dst_pool = if req.pool.is_empty() {
            pool.clone()
        } else {
            self.pool(&req.pool)?
        };
        let dst_project = if req.project.is_empty() {
            src_project.clone()
        } else {
            self.effective_project(&req.project)?
        };

        if dst_pool.name() == pool.name() && dst_project == src_project {
            self.rename(&pool, &src_project, name, &req.name).await
        } else {
            self.start_move(pool, dst_pool, &src_project, &dst_project, name, &req.name)
        }
    }

    /// Rename within one pool and project, keeping device references in step
    pub async fn rename(
        &self,
        pool: &StoragePool,
        project: &str,
        name: &str,
        new_name: &str,
    ) -> Result<Outcome> {
        let from = Self::identity(pool.name(), project, VolumeKind::Custom, name);
        let to = Self::identity(pool.name(), project, VolumeKind::Custom, new_name);
        let _guards = self.locks.lock_pair(&from, &to).await;

        pool.validate_volume(new_name, &Default::default())?;
        pool.get_volume(project, VolumeKind::Custom, name)?;
        self.check_busy(&from)?;
        self.ensure_no_running_consumers(pool.name(), project, name)?;
        let owner = pool.owner();
        self.db.transaction(|tx| {
            if tx.volume_exists(pool.id(), project, VolumeKind::Custom, new_name, owner.as_deref()) {
                return Err(Error::Conflict("Volume by that name already exists".into()));
            }
            Ok(())
        })?;

        let mut revert = Reverter::new(self.db.clone());
        let result = async {
            self.retarget_consumers(&mut revert, pool.name(), project, name, pool.name(), new_name)?;
            pool.rename_custom_volume(project, name, new_name).await
        }
        .await;
        revert.finish(result).await?;

        Ok(Outcome::Done {
            location: Some(to.url()),
        })
    }

    /// Point every device referencing the volume at its new place,
    /// recording the old references on `revert`
    fn retarget_consumers(
        &self,
        revert: &mut Reverter,
        pool: &str,
        project: &str,
        name: &str,
        new_pool: &str,
        new_name: &str,
    ) -> Result<()> {
        let previous = self.db.transaction(|tx| {
            let consumers = tx.volume_consumers(pool, project, name);
            let mut previous = Vec::with_capacity(consumers.len());
            for c in &consumers {
                previous.push(tx.set_device_source(&c.consumer, &c.device, new_pool, new_name)?);
            }
            Ok(previous)
        })?;
        for device in previous {
            revert.add(Undo::RestoreDevice(device));
        }
        Ok(())
    }

    fn start_move(
        self: &Arc<Self>,
        src_pool: StoragePool,
        dst_pool: StoragePool,
        src_project: &str,
        dst_project: &str,
        name: &str,
        new_name: &str,
    ) -> Result<Outcome> {
        let from = Self::identity(src_pool.name(), src_project, VolumeKind::Custom, name);
        let to = Self::identity(dst_pool.name(), dst_project, VolumeKind::Custom, new_name);

        let source = src_pool.get_volume(src_project, VolumeKind::Custom, name)?;
        dst_pool.validate_volume(new_name, &source.config)?;
        self.check_busy(&from)?;
        self.ensure_no_running_consumers(src_pool.name(), src_project, name)?;
        let owner = dst_pool.owner();
        self.db.transaction(|tx| {
            if tx.volume_exists(dst_pool.id(), dst_project, VolumeKind::Custom, new_name, owner.as_deref()) {
                return Err(Error::Conflict("Volume by that name already exists".into()));
            }
            if src_project != dst_project {
                if !tx.volume_consumers(src_pool.name(), src_project, name).is_empty() {
                    return Err(Error::InvalidInput(
                        "Volume is still in use and cannot change project".into(),
                    ));
                }
                quota::check_disk_limit(tx, dst_project, new_name, &source.config)?;
            }
            Ok(())
        })?;

        let runner = MoveRunner {
            orch: self.clone(),
            src_pool,
            dst_pool,
            src_project: src_project.to_string(),
            dst_project: dst_project.to_string(),
            name: name.to_string(),
            new_name: new_name.to_string(),
        };
        let op = self.launch(
            OperationSpec::task(OperationType::VolumeMove, src_project, Arc::new(runner))
                .with_resources(vec![from.url(), to.url()]),
        )?;
        Ok(Outcome::Started(op))
    }

    /// Migration source. With a push target this member dials out;
    /// otherwise it waits for the sink to connect with the secrets.
    fn start_source(
        self: &Arc<Self>,
        pool: StoragePool,
        project: &str,
        name: &str,
        req: VolumePost,
    ) -> Result<Outcome> {
        pool.get_volume(project, VolumeKind::Custom, name)?;
        let push = req.target.map(|t| PushTarget {
            operation: t.operation,
            secrets: t.websockets,
            certificate: (!t.certificate.is_empty()).then_some(t.certificate),
        });
        let (source, op) = self.launch_source(pool, project, name, req.volume_only, push)?;
        tracing::info!(volume = name, push = source.is_push(), operation = %op.id(), "Started migration source");
        Ok(Outcome::Started(op))
    }

    fn launch_source(
        self: &Arc<Self>,
        pool: StoragePool,
        project: &str,
        name: &str,
        volume_only: bool,
        push: Option<PushTarget>,
    ) -> Result<(Arc<MigrationSource>, Arc<Operation>)> {
        let source = Arc::new(MigrationSource::new(volume_only, push, self.migration.clone())?);
        let url = Self::identity(pool.name(), project, VolumeKind::Custom, name).url();
        let runner = Arc::new(SourceRunner {
            source: source.clone(),
            pool,
            project: project.to_string(),
            name: name.to_string(),
        });
        let canceller = Arc::new(SourceCanceller(source.clone()));

        let spec = if source.is_push() {
            OperationSpec {
                canceller: Some(canceller),
                ..OperationSpec::task(OperationType::VolumeMigrate, project, runner)
            }
        } else {
            OperationSpec::websocket(
                OperationType::VolumeMigrate,
                project,
                runner,
                source.session(),
                canceller,
            )
            .with_metadata(source.metadata())
        };
        let op = self.launch(spec.with_resources(vec![url]).exclusive(false))?;
        Ok((source, op))
    }

    /// Move a volume to another member: open a pull source here, have the
    /// destination create the volume from it, then drop the local copy
    #[allow(clippy::too_many_arguments)]
    async fn move_to_member(
        self: &Arc<Self>,
        pool: StoragePool,
        project: &str,
        src_project: &str,
        name: &str,
        req: VolumePost,
        member: &str,
        caller: &Caller,
    ) -> Result<Outcome> {
        if !req.pool.is_empty() && req.pool != pool.name() {
            return Err(Error::InvalidInput(
                "Moving to another member keeps the volume in its pool".into(),
            ));
        }
        let member = self.forwarder.online_member(member)?;
        let new_name = if req.name.is_empty() { name } else { req.name.as_str() };
        let record = pool.get_volume(src_project, VolumeKind::Custom, name)?;
        self.check_busy(&Self::identity(pool.name(), src_project, VolumeKind::Custom, name))?;
        self.ensure_no_running_consumers(pool.name(), src_project, name)?;

        let (source, source_op) =
            self.launch_source(pool.clone(), src_project, name, req.volume_only, None)?;
        let secrets = source
            .session()
            .secrets()
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k, v.to_string())))
            .collect();

        let create = VolumesPost {
            name: new_name.to_string(),
            kind: VolumeKind::Custom.as_str().to_string(),
            content_type: record.content_type.as_str().to_string(),
            description: record.description.clone(),
            config: record.config.clone(),
            source: VolumeSource {
                source_type: "migration".into(),
                name: name.to_string(),
                mode: "pull".into(),
                volume_only: req.volume_only,
                operation: format!("{}{}", self.advertise_url, source_op.url()),
                websockets: secrets,
                certificate: self.certificate.clone().unwrap_or_default(),
                ..VolumeSource::default()
            },
        };
        let path = collection_url(pool.name(), project);
        let resp = match self
            .forwarder
            .client()
            .post_json(&member, &path, &create, caller.authorization.as_deref())
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                source.disconnect();
                return Err(e);
            }
        };
        let remote_op = resp["operation"]
            .as_str()
            .ok_or_else(|| Error::Http("Response carries no operation".into()))?
            .to_string();

        let runner = MemberMoveRunner {
            orch: self.clone(),
            pool: pool.clone(),
            project: src_project.to_string(),
            name: name.to_string(),
            source,
            source_op,
            member,
            remote_op,
            authorization: caller.authorization.clone(),
        };
        let url = Self::identity(pool.name(), src_project, VolumeKind::Custom, name).url();
        let op = self.launch(
            OperationSpec::task(OperationType::VolumeMove, src_project, Arc::new(runner))
                .with_resources(vec![url]),
        )?;
        Ok(Outcome::Started(op))
    }
}

fn collection_url(pool: &str, project: &str) -> String {
    let mut url = format!("/1.0/storage-pools/{}/volumes", encode_segment(pool));
    if project != "default" {
        url.push_str("?project=");
        url.push_str(&encode_segment(project));
    }
    url
}

struct MoveRunner {
    orch: Arc<Orchestrator>,
    src_pool: StoragePool,
    dst_pool: StoragePool,
    src_project: String,
    dst_project: String,
    name: String,
    new_name: String,
}

#[async_trait]
impl Runner for MoveRunner {
    async fn run(&self, ctx: OperationContext) -> Result<()> {
        let from = Orchestrator::identity(
            self.src_pool.name(),
            &self.src_project,
            VolumeKind::Custom,
            &self.name,
        );
        let to = Orchestrator::identity(
            self.dst_pool.name(),
            &self.dst_project,
            VolumeKind::Custom,
            &self.new_name,
        );
        let _guards = self.orch.locks.lock_pair(&from, &to).await;

        let mut revert = Reverter::new(self.orch.db.clone());
        let result = async {
            self.orch.retarget_consumers(
                &mut revert,
                self.src_pool.name(),
                &self.src_project,
                &self.name,
                self.dst_pool.name(),
                &self.new_name,
            )?;
            let copied = self
                .dst_pool
                .create_custom_volume_from_copy(
                    NewVolume {
                        project: self.dst_project.clone(),
                        name: self.new_name.clone(),
                        ..NewVolume::default()
                    },
                    CopySource {
                        pool: &self.src_pool,
                        project: &self.src_project,
                        name: &self.name,
                        volume_only: false,
                    },
                    &ctx.cancel,
                )
                .await;
            if let Err(e) = copied {
                // a snapshot failure leaves the primary behind
                if self
                    .dst_pool
                    .get_volume(&self.dst_project, VolumeKind::Custom, &self.new_name)
                    .is_ok()
                {
                    if let Err(cleanup) = self
                        .dst_pool
                        .delete_custom_volume(&self.dst_project, &self.new_name)
                        .await
                    {
                        tracing::error!(volume = %self.new_name, error = %cleanup, "Failed to remove partial move destination");
                    }
                }
                return Err(e);
            }
            Ok(())
        }
        .await;
        revert.finish(result).await?;

        // the destination stays even if the source cannot be removed
        self.src_pool
            .delete_custom_volume(&self.src_project, &self.name)
            .await
            .map_err(|e| {
                tracing::error!(volume = %self.name, error = %e, "Moved volume but failed to delete the source");
                e
            })?;
        tracing::info!(
            from = %from,
            to = %to,
            "Moved custom volume"
        );
        Ok(())
    }
}

struct SourceRunner {
    source: Arc<MigrationSource>,
    pool: StoragePool,
    project: String,
    name: String,
}

#[async_trait]
impl Runner for SourceRunner {
    async fn run(&self, ctx: OperationContext) -> Result<()> {
        self.source
            .do_storage(&self.pool, &self.project, &self.name, &ctx.cancel)
            .await
    }
}

struct SourceCanceller(Arc<MigrationSource>);

#[async_trait]
impl Canceller for SourceCanceller {
    async fn cancel(&self) -> Result<()> {
        self.0.disconnect();
        Ok(())
    }
}

/// How long one remote wait call blocks
const REMOTE_WAIT: Duration = Duration::from_secs(30);

struct MemberMoveRunner {
    orch: Arc<Orchestrator>,
    pool: StoragePool,
    project: String,
    name: String,
    source: Arc<MigrationSource>,
    source_op: Arc<Operation>,
    member: MemberRecord,
    remote_op: String,
    authorization: Option<String>,
}

impl MemberMoveRunner {
    async fn wait_remote(&self) -> Result<()> {
        let client = self.orch.forwarder.client();
        loop {
            let view = client
                .wait_operation(
                    &self.member,
                    &self.remote_op,
                    REMOTE_WAIT,
                    self.authorization.as_deref(),
                )
                .await?;
            match view.status {
                OperationStatus::Success => return Ok(()),
                OperationStatus::Failure | OperationStatus::Cancelled => {
                    return Err(Error::Internal(format!(
                        "Volume creation on {} failed: {}",
                        self.member.name, view.err
                    )))
                }
                OperationStatus::Pending | OperationStatus::Running => continue,
            }
        }
    }
}

#[async_trait]
impl Runner for MemberMoveRunner {
    async fn run(&self, ctx: OperationContext) -> Result<()> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                self.source.disconnect();
                return Err(Error::Cancelled);
            }
            res = self.wait_remote() => {
                if let Err(e) = res {
                    // the remote sink will never dial in
                    self.source.disconnect();
                    return Err(e);
                }
            }
        }

        let source = self.orch.tracker.wait(self.source_op.id(), None).await?;
        if source.status != OperationStatus::Success {
            return Err(Error::Internal(format!(
                "Migration source failed: {}",
                source.err
            )));
        }

        let identity =
            Orchestrator::identity(self.pool.name(), &self.project, VolumeKind::Custom, &self.name);
        let _guard = self.orch.locks.lock(&identity).await;
        self.pool.delete_custom_volume(&self.project, &self.name).await?;
        tracing::info!(volume = %self.name, member = %self.member.name, "Moved custom volume to cluster member");
        Ok(())
    }
}

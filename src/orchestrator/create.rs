//! Create, copy, refresh and migration sink

use super::{quota, Orchestrator, Outcome};
use crate::api::types::{VolumePost, VolumeSource, VolumesPost};
use crate::cluster::Location;
use crate::common::{Error, Result};
use crate::migration::{MigrationMode, MigrationSink, SinkArgs, SinkRequest};
use crate::operations::{
    Canceller, OperationContext, OperationSpec, OperationType, Runner,
};
use crate::storage::volume::{volume_url, VolumeAction};
use crate::storage::{ContentType, CopySource, NewVolume, StoragePool, VolumeKind};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Who is creating, used for member-to-member calls made on their behalf
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub authorization: Option<String>,
}

impl Orchestrator {
    /// POST on the volume collection. `path_kind` is the type segment of the
    /// URL, if any; the body's `type` wins when both are set.
    pub async fn create_volume(
        self: &Arc<Self>,
        pool_name: &str,
        project: &str,
        path_kind: Option<VolumeKind>,
        req: VolumesPost,
        caller: &Caller,
    ) -> Result<Outcome> {
        let kind = match req.kind.as_str() {
            "" => path_kind.unwrap_or(VolumeKind::Custom),
            other => VolumeKind::parse(other)?,
        };
        kind.require(VolumeAction::Create)?;
        let project = self.effective_project(project)?;
        let pool = self.pool(pool_name)?;

        match req.source.source_type.as_str() {
            "" | "none" => self.create_empty(&pool, &project, req).await,
            "copy" => self.create_copy(&pool, &project, req, caller).await,
            "migration" => self.create_from_migration(pool, &project, req),
            other => Err(Error::InvalidInput(format!(
                "Unknown source type {:?}",
                other
            ))),
        }
    }

    /// Reject a taken name or an exceeded quota before anything is allocated
    pub(super) fn check_new_volume(
        &self,
        pool: &StoragePool,
        project: &str,
        name: &str,
        config: &BTreeMap<String, String>,
    ) -> Result<()> {
        pool.validate_volume(name, config)?;
        let owner = pool.owner();
        self.db.transaction(|tx| {
            if tx.volume_exists(pool.id(), project, VolumeKind::Custom, name, owner.as_deref()) {
                return Err(Error::Conflict("Volume by that name already exists".into()));
            }
            quota::check_disk_limit(tx, project, name, config)
        })
    }

    async fn create_empty(
        &self,
        pool: &StoragePool,
        project: &str,
        req: VolumesPost,
    ) -> Result<Outcome> {
        let content_type = ContentType::parse(&req.content_type)?;
        let identity = Self::identity(pool.name(), project, VolumeKind::Custom, &req.name);
        let _guard = self.locks.lock(&identity).await;
        self.check_new_volume(pool, project, &req.name, &req.config)?;

        pool.create_custom_volume(NewVolume {
            project: project.to_string(),
            name: req.name,
            description: req.description,
            config: req.config,
            content_type,
        })
        .await?;
        Ok(Outcome::Done {
            location: Some(identity.url()),
        })
    }

    async fn create_copy(
        self: &Arc<Self>,
        pool: &StoragePool,
        project: &str,
        req: VolumesPost,
        caller: &Caller,
    ) -> Result<Outcome> {
        let source = &req.source;
        if source.name.is_empty() {
            return Err(Error::InvalidInput("No source volume name supplied".into()));
        }
        let src_pool_name = if source.pool.is_empty() {
            pool.name().to_string()
        } else {
            source.pool.clone()
        };
        let src_project = if source.project.is_empty() {
            project.to_string()
        } else {
            self.effective_project(&source.project)?
        };

        let owner = pool.owner();
        let exists = self.db.transaction(|tx| {
            Ok(tx.volume_exists(pool.id(), project, VolumeKind::Custom, &req.name, owner.as_deref()))
        })?;
        if source.refresh {
            if !exists {
                return Err(Error::NotFound(format!(
                    "Refresh target {:?} does not exist",
                    req.name
                )));
            }
            if !req.config.is_empty() {
                pool.driver().validate_config(&req.config)?;
            }
        } else {
            self.check_new_volume(pool, project, &req.name, &req.config)?;
        }

        let location = self.forwarder.resolver().resolve(
            &src_pool_name,
            &src_project,
            VolumeKind::Custom,
            &source.name,
        )?;
        if let Location::Remote(member) = location {
            return self
                .copy_from_member(pool.clone(), project, &src_project, &src_pool_name, &member, req, caller)
                .await;
        }

        let src_pool = self.pool(&src_pool_name)?;
        let target = Self::identity(pool.name(), project, VolumeKind::Custom, &req.name);
        let resources = vec![target.url()];
        let runner = CopyRunner {
            orch: self.clone(),
            pool: pool.clone(),
            src_pool,
            src_project,
            src_name: source.name.clone(),
            volume_only: source.volume_only,
            refresh: source.refresh,
            new: NewVolume {
                project: project.to_string(),
                name: req.name.clone(),
                description: req.description.clone(),
                config: req.config.clone(),
                content_type: ContentType::default(),
            },
        };

        let op = self.launch(
            OperationSpec::task(OperationType::VolumeCopy, project, Arc::new(runner))
                .with_resources(resources),
        )?;
        Ok(Outcome::Started(op))
    }

    /// Copy from a volume another member holds: ask it for a pull-mode
    /// source and drain that into a local sink
    #[allow(clippy::too_many_arguments)]
    async fn copy_from_member(
        self: &Arc<Self>,
        pool: StoragePool,
        project: &str,
        src_project: &str,
        src_pool: &str,
        member: &crate::cluster::MemberRecord,
        req: VolumesPost,
        caller: &Caller,
    ) -> Result<Outcome> {
        if self.forwarder.is_offline(member) {
            return Err(Error::unavailable(
                &member.name,
                "The cluster member hosting the storage volume is offline",
            ));
        }
        let source_url = volume_url(src_pool, src_project, VolumeKind::Custom, &req.source.name);
        let body = VolumePost {
            name: req.source.name.clone(),
            migration: true,
            volume_only: req.source.volume_only,
            ..VolumePost::default()
        };
        let resp = self
            .forwarder
            .client()
            .post_json(member, &source_url, &body, caller.authorization.as_deref())
            .await?;
        let (operation, secrets) = parse_async_secrets(&resp)?;

        let args = SinkArgs {
            mode: MigrationMode::Pull,
            operation: format!("{}{}", member.url.trim_end_matches('/'), operation),
            secrets,
            certificate: self.certificate.clone(),
            volume_only: req.source.volume_only,
            refresh: req.source.refresh,
        };
        let sink_req = SinkRequest {
            project: project.to_string(),
            name: req.name.clone(),
            description: req.description,
            config: req.config,
            content_type: None,
            source_name: Some(req.source.name.clone()),
        };
        tracing::info!(member = %member.name, volume = %req.source.name, "Copying volume from cluster member");
        let resources = vec![Self::identity(pool.name(), project, VolumeKind::Custom, &req.name).url()];
        self.start_sink(pool, args, sink_req, OperationType::VolumeCopy, resources)
    }

    fn create_from_migration(
        self: &Arc<Self>,
        pool: StoragePool,
        project: &str,
        req: VolumesPost,
    ) -> Result<Outcome> {
        let source: &VolumeSource = &req.source;
        let mode = MigrationMode::parse(&source.mode)?;
        let content_type = match req.content_type.as_str() {
            "" => None,
            ct => Some(ContentType::parse(ct)?),
        };
        if source.refresh {
            let owner = pool.owner();
            let exists = self.db.transaction(|tx| {
                Ok(tx.volume_exists(pool.id(), project, VolumeKind::Custom, &req.name, owner.as_deref()))
            })?;
            if !exists {
                return Err(Error::NotFound(format!(
                    "Refresh target {:?} does not exist",
                    req.name
                )));
            }
        } else {
            self.check_new_volume(&pool, project, &req.name, &req.config)?;
        }

        let args = SinkArgs {
            mode,
            operation: source.operation.clone(),
            secrets: source.websockets.clone(),
            certificate: non_empty(&source.certificate),
            volume_only: source.volume_only,
            refresh: source.refresh,
        };
        let sink_req = SinkRequest {
            project: project.to_string(),
            name: req.name.clone(),
            description: req.description.clone(),
            config: req.config.clone(),
            content_type,
            source_name: non_empty(&source.name),
        };
        let resources = vec![Self::identity(pool.name(), project, VolumeKind::Custom, &req.name).url()];
        self.start_sink(pool, args, sink_req, OperationType::VolumeCreate, resources)
    }

    /// Pull mode runs as a task; push mode waits for the source to dial in
    fn start_sink(
        self: &Arc<Self>,
        pool: StoragePool,
        args: SinkArgs,
        req: SinkRequest,
        op_type: OperationType,
        resources: Vec<String>,
    ) -> Result<Outcome> {
        let project = req.project.clone();
        let sink = Arc::new(MigrationSink::new(args, self.migration.clone())?);
        let runner = Arc::new(SinkRunner {
            orch: self.clone(),
            sink: sink.clone(),
            pool,
            req,
        });
        let canceller = Arc::new(SinkCanceller(sink.clone()));

        let spec = match sink.mode() {
            MigrationMode::Pull => OperationSpec {
                canceller: Some(canceller),
                ..OperationSpec::task(op_type, &project, runner)
            },
            MigrationMode::Push => {
                OperationSpec::websocket(op_type, &project, runner, sink.session(), canceller)
                    .with_metadata(sink.metadata())
            }
        };
        let op = self.launch(spec.with_resources(resources))?;
        Ok(Outcome::Started(op))
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// Operation URL and channel secrets out of an async envelope
pub(super) fn parse_async_secrets(
    resp: &serde_json::Value,
) -> Result<(String, std::collections::HashMap<String, String>)> {
    let operation = resp["operation"]
        .as_str()
        .ok_or_else(|| Error::Http("Response carries no operation".into()))?
        .to_string();
    let secrets = serde_json::from_value(resp["metadata"]["metadata"]["websockets"].clone())
        .map_err(|e| Error::Http(format!("Operation carries no websocket secrets: {}", e)))?;
    Ok((operation, secrets))
}

struct CopyRunner {
    orch: Arc<Orchestrator>,
    pool: StoragePool,
    src_pool: StoragePool,
    src_project: String,
    src_name: String,
    volume_only: bool,
    refresh: bool,
    new: NewVolume,
}

#[async_trait]
impl Runner for CopyRunner {
    async fn run(&self, ctx: OperationContext) -> Result<()> {
        let identity = Orchestrator::identity(
            self.pool.name(),
            &self.new.project,
            VolumeKind::Custom,
            &self.new.name,
        );
        let _guard = self.orch.locks.lock(&identity).await;
        let src = CopySource {
            pool: &self.src_pool,
            project: &self.src_project,
            name: &self.src_name,
            volume_only: self.volume_only,
        };

        if self.refresh {
            let config = (!self.new.config.is_empty()).then(|| self.new.config.clone());
            self.pool
                .refresh_custom_volume(&self.new.project, &self.new.name, config, src, &ctx.cancel)
                .await?;
        } else {
            self.pool
                .create_custom_volume_from_copy(self.new.clone(), src, &ctx.cancel)
                .await?;
        }
        Ok(())
    }
}

struct SinkRunner {
    orch: Arc<Orchestrator>,
    sink: Arc<MigrationSink>,
    pool: StoragePool,
    req: SinkRequest,
}

#[async_trait]
impl Runner for SinkRunner {
    async fn run(&self, ctx: OperationContext) -> Result<()> {
        let identity = Orchestrator::identity(
            self.pool.name(),
            &self.req.project,
            VolumeKind::Custom,
            &self.req.name,
        );
        let _guard = self.orch.locks.lock(&identity).await;
        let record = self.sink.do_storage(&self.pool, &self.req, &ctx.cancel).await?;
        tracing::info!(
            pool = %self.pool.name(),
            project = %record.project,
            volume = %record.name,
            mode = %self.sink.mode(),
            "Received migrated volume"
        );
        Ok(())
    }
}

struct SinkCanceller(Arc<MigrationSink>);

#[async_trait]
impl Canceller for SinkCanceller {
    async fn cancel(&self) -> Result<()> {
        self.0.disconnect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::fixture;
    use crate::operations::OperationStatus;
    use std::time::Duration;

    fn body(name: &str) -> VolumesPost {
        VolumesPost {
            name: name.into(),
            ..VolumesPost::default()
        }
    }

    #[tokio::test]
    async fn test_create_twice_conflicts() {
        let f = fixture();
        let caller = Caller::default();
        let out = f
            .orch
            .create_volume("default", "default", None, body("backups"), &caller)
            .await
            .unwrap();
        assert!(matches!(out, Outcome::Done { location: Some(ref l) } if l.ends_with("/custom/backups")));

        let err = f
            .orch
            .create_volume("default", "default", None, body("backups"), &caller)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        let count = f
            .db
            .transaction(|tx| {
                let pool = tx.get_storage_pool_id("default")?;
                Ok(tx.list_storage_volumes(pool, None, None).len())
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_instance_type() {
        let f = fixture();
        let err = f
            .orch
            .create_volume(
                "default",
                "default",
                Some(VolumeKind::Container),
                body("c1"),
                &Caller::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_project_without_volumes_feature_uses_default() {
        let f = fixture();
        f.orch
            .create_volume("default", "shared-vols", None, body("data"), &Caller::default())
            .await
            .unwrap();
        let pool = f.orch.pool("default").unwrap();
        assert!(pool.get_volume("default", VolumeKind::Custom, "data").is_ok());
    }

    #[tokio::test]
    async fn test_copy_runs_as_operation() {
        let f = fixture();
        let caller = Caller::default();
        f.orch
            .create_volume("default", "default", None, body("src"), &caller)
            .await
            .unwrap();

        let mut req = body("dst");
        req.source = VolumeSource {
            source_type: "copy".into(),
            name: "src".into(),
            ..VolumeSource::default()
        };
        let op = match f
            .orch
            .create_volume("fast", "default", None, req, &caller)
            .await
            .unwrap()
        {
            Outcome::Started(op) => op,
            Outcome::Done { .. } => panic!("copy must run as an operation"),
        };
        let view = f
            .orch
            .tracker()
            .wait(op.id(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(view.status, OperationStatus::Success, "{}", view.err);
        assert!(f
            .orch
            .pool("fast")
            .unwrap()
            .get_volume("default", VolumeKind::Custom, "dst")
            .is_ok());
    }

    #[tokio::test]
    async fn test_refresh_requires_target() {
        let f = fixture();
        let mut req = body("missing");
        req.source = VolumeSource {
            source_type: "copy".into(),
            name: "src".into(),
            refresh: true,
            ..VolumeSource::default()
        };
        let err = f
            .orch
            .create_volume("default", "default", None, req, &Caller::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_migration_mode_is_strict() {
        let f = fixture();
        let mut req = body("incoming");
        req.source = VolumeSource {
            source_type: "migration".into(),
            mode: "relay".into(),
            ..VolumeSource::default()
        };
        let err = f
            .orch
            .create_volume("default", "default", None, req, &Caller::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_push_sink_exposes_secrets() {
        let f = fixture();
        let mut req = body("incoming");
        req.source = VolumeSource {
            source_type: "migration".into(),
            mode: "push".into(),
            ..VolumeSource::default()
        };
        let op = match f
            .orch
            .create_volume("default", "default", None, req, &Caller::default())
            .await
            .unwrap()
        {
            Outcome::Started(op) => op,
            Outcome::Done { .. } => panic!("migration must run as an operation"),
        };
        let secrets = &op.metadata()["websockets"];
        assert!(secrets["control"].is_string());
        assert!(secrets["filesystem"].is_string());
        f.orch.tracker().cancel(op.id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_quota_is_enforced() {
        let f = fixture();
        f.db.transaction(|tx| {
            tx.create_project(
                "limited",
                BTreeMap::from([(quota::LIMIT_KEY.to_string(), "1GiB".to_string())]),
            )
        })
        .unwrap();
        let mut req = body("big");
        req.config.insert("size".into(), "2GiB".into());
        let err = f
            .orch
            .create_volume("default", "limited", None, req, &Caller::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }
}

//! Volume mutation orchestrator
//!
//! Create, copy, refresh, rename, move, migrate, update and delete of
//! storage volumes. Multi-step mutations run as sagas: each forward step
//! pushes an undo record and a failure replays them in reverse. Long
//! mutations run as tracked operations.

mod create;
mod delete;
mod filter;
mod import;
pub mod locks;
mod mutate;
mod quota;
mod update;

pub use create::Caller;
pub use filter::VolumeFilter;
pub use locks::{VolumeGuard, VolumeLocks};
pub use mutate::PostRoute;
pub use update::ListScope;

use crate::cluster::db::{ClusterDb, VolumeRecord};
use crate::cluster::Forwarder;
use crate::common::config::Config;
use crate::common::{Error, MigrationConfig, Result};
use crate::operations::{Operation, OperationSpec, OperationTracker};
use crate::storage::volume::{is_snapshot, StorageVolume, VolumeIdentity, VolumeKind};
use crate::storage::{PoolRegistry, StoragePool};
use chrono::{TimeZone, Utc};
use std::path::PathBuf;
use std::sync::Arc;

/// How a mutation finished
pub enum Outcome {
    /// Finished inline; `location` is the URL of the resulting volume
    Done { location: Option<String> },
    /// Running as an operation
    Started(Arc<Operation>),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Done { location } => f.debug_struct("Done").field("location", location).finish(),
            Outcome::Started(op) => f.debug_tuple("Started").field(&op.id()).finish(),
        }
    }
}

pub struct Orchestrator {
    db: Arc<ClusterDb>,
    pools: Arc<PoolRegistry>,
    tracker: Arc<OperationTracker>,
    forwarder: Arc<Forwarder>,
    locks: VolumeLocks,
    migration: MigrationConfig,
    member: String,
    advertise_url: String,
    /// Certificate handed to peers so they can pin this member
    certificate: Option<String>,
    /// Scratch space for uploads restored in the background
    spool_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        db: Arc<ClusterDb>,
        pools: Arc<PoolRegistry>,
        tracker: Arc<OperationTracker>,
        forwarder: Arc<Forwarder>,
        config: &Config,
        certificate: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            pools,
            tracker,
            forwarder,
            locks: VolumeLocks::new(),
            migration: config.migration.clone(),
            member: config.server.member_name.clone(),
            advertise_url: config.server.advertised_url(),
            certificate,
            spool_dir: config.server.data_dir.join("spool"),
        })
    }

    pub fn db(&self) -> &Arc<ClusterDb> {
        &self.db
    }

    pub fn tracker(&self) -> &Arc<OperationTracker> {
        &self.tracker
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    /// Project that stores the custom volumes of `project`
    pub fn effective_project(&self, project: &str) -> Result<String> {
        self.db.transaction(|tx| tx.effective_project(project))
    }

    /// Project a volume of `kind` lives in. Only custom volumes follow the
    /// project's storage-volume feature.
    pub fn volume_project(&self, project: &str, kind: VolumeKind) -> Result<String> {
        match kind {
            VolumeKind::Custom => self.effective_project(project),
            _ => {
                self.db.transaction(|tx| tx.get_project(project))?;
                Ok(project.to_string())
            }
        }
    }

    pub fn pool(&self, name: &str) -> Result<StoragePool> {
        self.pools.load(name)
    }

    /// Register and start an operation
    fn launch(&self, spec: OperationSpec) -> Result<Arc<Operation>> {
        let op = self.tracker.create(spec)?;
        self.tracker.start(&op)?;
        Ok(op)
    }

    /// API view of a record, including the URLs of its consumers
    pub fn volume_view(&self, pool: &StoragePool, record: &VolumeRecord) -> Result<StorageVolume> {
        let used_by = self.db.transaction(|tx| {
            Ok(match record.kind {
                VolumeKind::Custom if !is_snapshot(&record.name) => {
                    let mut urls: Vec<String> = tx
                        .volume_consumers(pool.name(), &record.project, &record.name)
                        .into_iter()
                        .map(|c| c.consumer.url())
                        .collect();
                    urls.sort();
                    urls.dedup();
                    urls
                }
                VolumeKind::Image => image_urls(&tx.image_projects(&record.name), &record.name),
                _ => Vec::new(),
            })
        })?;

        Ok(StorageVolume {
            name: record.name.clone(),
            description: record.description.clone(),
            kind: record.kind,
            pool: pool.name().to_string(),
            project: record.project.clone(),
            content_type: record.content_type,
            config: record.config.clone(),
            location: record.member.clone().unwrap_or_default(),
            used_by,
            created_at: Utc
                .timestamp_opt(record.created_at, 0)
                .single()
                .unwrap_or_default(),
        })
    }

    fn identity(pool: &str, project: &str, kind: VolumeKind, name: &str) -> VolumeIdentity {
        VolumeIdentity::new(pool, project, kind, name)
    }

    /// Fail when a live exclusive operation holds the volume
    fn check_busy(&self, identity: &VolumeIdentity) -> Result<()> {
        self.tracker.check_conflict(&[identity.url()])
    }

    fn ensure_no_running_consumers(&self, pool: &str, project: &str, name: &str) -> Result<()> {
        let running = self.db.transaction(|tx| {
            Ok(tx
                .volume_consumers(pool, project, name)
                .into_iter()
                .any(|c| c.running_on.is_some()))
        })?;
        if running {
            return Err(Error::InvalidInput(
                "Volume is still in use by running instances".into(),
            ));
        }
        Ok(())
    }
}

fn image_urls(projects: &[String], fingerprint: &str) -> Vec<String> {
    let mut urls: Vec<String> = projects
        .iter()
        .map(|p| {
            if p == "default" {
                format!("/1.0/images/{}", fingerprint)
            } else {
                format!("/1.0/images/{}?project={}", fingerprint, crate::common::encode_segment(p))
            }
        })
        .collect();
    urls.sort();
    urls
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cluster::db::{InstanceRecord, MemberRecord};
    use crate::cluster::{LocationResolver, MemberClient};
    use crate::common::config::{PoolSeed, ProjectSeed};
    use crate::common::timestamp_now;
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;

    pub(crate) struct Fixture {
        pub orch: Arc<Orchestrator>,
        pub db: Arc<ClusterDb>,
        pub _dir: tempfile::TempDir,
    }

    pub(crate) fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.member_name = "node1".into();
        config.server.data_dir = dir.path().to_path_buf();
        config.pools = vec![
            PoolSeed {
                name: "default".into(),
                driver: "dir".into(),
                description: String::new(),
                config: HashMap::new(),
            },
            PoolSeed {
                name: "fast".into(),
                driver: "dir".into(),
                description: String::new(),
                config: HashMap::new(),
            },
        ];
        config.projects = vec![ProjectSeed {
            name: "shared-vols".into(),
            config: HashMap::from([("features.storage.volumes".to_string(), "false".to_string())]),
        }];

        let db = Arc::new(ClusterDb::in_memory());
        db.transaction(|tx| {
            tx.upsert_member(MemberRecord {
                name: "node1".into(),
                url: "http://127.0.0.1:1".into(),
                last_heartbeat: timestamp_now(),
            })?;
            tx.create_project("default", BTreeMap::new())?;
            tx.create_project("other", BTreeMap::new())?;
            for seed in &config.projects {
                tx.create_project(&seed.name, seed.config.clone().into_iter().collect())?;
            }
            Ok(())
        })
        .unwrap();

        let pools = Arc::new(PoolRegistry::new(db.clone(), "node1", dir.path()));
        pools.seed(&config.pools).unwrap();
        let tracker = Arc::new(OperationTracker::new("node1", Duration::from_secs(300)));
        let resolver = Arc::new(LocationResolver::new(db.clone(), pools.clone(), "node1"));
        let client = MemberClient::new("node1", None, Duration::from_secs(1)).unwrap();
        let forwarder = Arc::new(Forwarder::new(
            db.clone(),
            client,
            resolver,
            Duration::from_secs(20),
        ));
        let orch = Orchestrator::new(db.clone(), pools, tracker, forwarder, &config, None);
        Fixture {
            orch,
            db,
            _dir: dir,
        }
    }

    pub(crate) fn attach(db: &ClusterDb, instance: &str, pool: &str, volume: &str, running: bool) {
        db.transaction(|tx| {
            tx.put_instance(InstanceRecord {
                project: "default".into(),
                name: instance.into(),
                member: "node1".into(),
                running,
                devices: BTreeMap::from([(
                    "data".to_string(),
                    BTreeMap::from([
                        ("type".to_string(), "disk".to_string()),
                        ("pool".to_string(), pool.to_string()),
                        ("source".to_string(), volume.to_string()),
                        ("path".to_string(), "/mnt".to_string()),
                    ]),
                )]),
            })
        })
        .unwrap();
    }

    pub(crate) fn device_target(db: &ClusterDb, instance: &str) -> (String, String) {
        let inst = db.transaction(|tx| tx.get_instance("default", instance)).unwrap();
        let dev = &inst.devices["data"];
        (dev["pool"].clone(), dev["source"].clone())
    }
}

//! Cluster metadata store
//!
//! Stores:
//! - Cluster members (name → URL, last heartbeat)
//! - Projects, storage pools and storage volume records
//! - Instance, profile and image records (volume consumers)
//!
//! State is held in memory and written through to RocksDB column families as
//! bincode values. Every read and write goes through [`ClusterDb::transaction`],
//! whose closure is synchronous, so no transaction can span an `.await`.

use crate::common::{Error, Result};
use crate::storage::volume::{ContentType, VolumeKind};
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

const CF_MEMBERS: &str = "members";
const CF_PROJECTS: &str = "projects";
const CF_POOLS: &str = "pools";
const CF_VOLUMES: &str = "volumes";
const CF_INSTANCES: &str = "instances";
const CF_PROFILES: &str = "profiles";
const CF_IMAGES: &str = "images";
const CF_META: &str = "meta";

const ALL_CFS: [&str; 8] = [
    CF_MEMBERS,
    CF_PROJECTS,
    CF_POOLS,
    CF_VOLUMES,
    CF_INSTANCES,
    CF_PROFILES,
    CF_IMAGES,
    CF_META,
];

const NEXT_ID_KEY: &[u8] = b"next_id";

/// Cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub name: String,
    /// Base URL of the member's API, e.g. `https://10.0.0.2:8443`
    pub url: String,
    /// Unix seconds
    pub last_heartbeat: u64,
}

impl MemberRecord {
    pub fn is_offline(&self, now: u64, threshold_secs: u64) -> bool {
        now.saturating_sub(self.last_heartbeat) > threshold_secs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub name: String,
    pub config: BTreeMap<String, String>,
}

impl ProjectRecord {
    /// Whether the project keeps its own custom volumes
    pub fn has_storage_volumes(&self) -> bool {
        self.config
            .get("features.storage.volumes")
            .map(|v| v != "false")
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub id: u64,
    pub name: String,
    pub driver: String,
    pub description: String,
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: u64,
    pub pool_id: u64,
    pub project: String,
    pub kind: VolumeKind,
    /// `parent` or `parent/snapshot`
    pub name: String,
    /// Owning member; `None` on network-attached pools
    pub member: Option<String>,
    pub content_type: ContentType,
    pub description: String,
    pub config: BTreeMap<String, String>,
    /// Unix seconds
    pub created_at: i64,
}

/// Device map entry; disk devices use `type=disk`, `pool`, `source`
pub type Device = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub project: String,
    pub name: String,
    pub member: String,
    pub running: bool,
    pub devices: BTreeMap<String, Device>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub project: String,
    pub name: String,
    pub devices: BTreeMap<String, Device>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub project: String,
    pub fingerprint: String,
}

/// Something holding a disk device that points at a custom volume
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConsumerRef {
    Instance { project: String, name: String },
    Profile { project: String, name: String },
}

impl ConsumerRef {
    pub fn url(&self) -> String {
        match self {
            ConsumerRef::Instance { project, name } => project_url("instances", project, name),
            ConsumerRef::Profile { project, name } => project_url("profiles", project, name),
        }
    }
}

fn project_url(collection: &str, project: &str, name: &str) -> String {
    let mut url = format!(
        "/1.0/{}/{}",
        collection,
        crate::common::encode_segment(name)
    );
    if project != "default" {
        url.push_str("?project=");
        url.push_str(&crate::common::encode_segment(project));
    }
    url
}

/// One disk device that references a volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConsumer {
    pub consumer: ConsumerRef,
    pub device: String,
    /// Running instance and the member it runs on
    pub running_on: Option<String>,
}

/// (pool, source) of a device before it was rewritten
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    pub consumer: ConsumerRef,
    pub device: String,
    pub pool: String,
    pub source: String,
}

#[derive(Debug, Clone, Default)]
struct State {
    members: BTreeMap<String, MemberRecord>,
    projects: BTreeMap<String, ProjectRecord>,
    pools: BTreeMap<String, PoolRecord>,
    volumes: BTreeMap<u64, VolumeRecord>,
    instances: BTreeMap<String, InstanceRecord>,
    profiles: BTreeMap<String, ProfileRecord>,
    images: BTreeMap<String, ImageRecord>,
    next_id: u64,
}

enum Write {
    Put(&'static str, Vec<u8>, Vec<u8>),
    Delete(&'static str, Vec<u8>),
}

fn scoped_key(project: &str, name: &str) -> String {
    format!("{}/{}", project, name)
}

/// Metadata store
pub struct ClusterDb {
    state: Mutex<State>,
    db: Option<DB>,
}

impl ClusterDb {
    /// Open or create a persistent store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, ALL_CFS)?;
        let mut state = State {
            next_id: 1,
            ..State::default()
        };

        for m in load_cf::<MemberRecord>(&db, CF_MEMBERS)? {
            state.members.insert(m.name.clone(), m);
        }
        for p in load_cf::<ProjectRecord>(&db, CF_PROJECTS)? {
            state.projects.insert(p.name.clone(), p);
        }
        for p in load_cf::<PoolRecord>(&db, CF_POOLS)? {
            state.pools.insert(p.name.clone(), p);
        }
        for v in load_cf::<VolumeRecord>(&db, CF_VOLUMES)? {
            state.volumes.insert(v.id, v);
        }
        for i in load_cf::<InstanceRecord>(&db, CF_INSTANCES)? {
            state.instances.insert(scoped_key(&i.project, &i.name), i);
        }
        for p in load_cf::<ProfileRecord>(&db, CF_PROFILES)? {
            state.profiles.insert(scoped_key(&p.project, &p.name), p);
        }
        for i in load_cf::<ImageRecord>(&db, CF_IMAGES)? {
            state.images.insert(scoped_key(&i.project, &i.fingerprint), i);
        }

        let meta = cf_handle(&db, CF_META)?;
        if let Some(bytes) = db.get_cf(meta, NEXT_ID_KEY)? {
            state.next_id = bincode::deserialize(&bytes)?;
        }

        tracing::debug!(
            pools = state.pools.len(),
            volumes = state.volumes.len(),
            "Loaded cluster metadata"
        );

        Ok(Self {
            state: Mutex::new(state),
            db: Some(db),
        })
    }

    /// Volatile store, used by tests and single-shot tools
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
            db: None,
        }
    }

    /// Run `f` against a private copy of the state. On `Ok` the writes are
    /// persisted atomically and published; on `Err` they are discarded.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut ClusterTx) -> Result<T>) -> Result<T> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| Error::Internal("cluster database lock poisoned".into()))?;

        let mut tx = ClusterTx {
            state: guard.clone(),
            writes: Vec::new(),
        };
        let out = f(&mut tx)?;

        if let Some(db) = &self.db {
            if !tx.writes.is_empty() {
                let mut batch = WriteBatch::default();
                for write in &tx.writes {
                    match write {
                        Write::Put(cf, key, value) => {
                            batch.put_cf(cf_handle(db, cf)?, key, value)
                        }
                        Write::Delete(cf, key) => batch.delete_cf(cf_handle(db, cf)?, key),
                    }
                }
                db.write(batch)?;
            }
        }

        *guard = tx.state;
        Ok(out)
    }
}

fn cf_handle<'a>(db: &'a DB, name: &str) -> Result<&'a rocksdb::ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| Error::MetadataCorrupted(format!("missing column family {}", name)))
}

fn load_cf<T: DeserializeOwned>(db: &DB, name: &str) -> Result<Vec<T>> {
    let cf = cf_handle(db, name)?;
    let mut out = Vec::new();
    for item in db.iterator_cf(cf, IteratorMode::Start) {
        let (_, value) = item?;
        out.push(bincode::deserialize(&value)?);
    }
    Ok(out)
}

/// Handle passed to [`ClusterDb::transaction`] closures
pub struct ClusterTx {
    state: State,
    writes: Vec<Write>,
}

impl ClusterTx {
    fn put<T: Serialize>(&mut self, cf: &'static str, key: &[u8], value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.writes.push(Write::Put(cf, key.to_vec(), bytes));
        Ok(())
    }

    fn delete(&mut self, cf: &'static str, key: &[u8]) {
        self.writes.push(Write::Delete(cf, key.to_vec()));
    }

    fn allocate_id(&mut self) -> Result<u64> {
        let id = self.state.next_id.max(1);
        self.state.next_id = id + 1;
        let next = self.state.next_id;
        self.put(CF_META, NEXT_ID_KEY, &next)?;
        Ok(id)
    }

    // === Members ===

    pub fn upsert_member(&mut self, member: MemberRecord) -> Result<()> {
        self.put(CF_MEMBERS, member.name.as_bytes(), &member)?;
        self.state.members.insert(member.name.clone(), member);
        Ok(())
    }

    pub fn get_node_by_name(&self, name: &str) -> Result<MemberRecord> {
        self.state
            .members
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Cluster member {:?} not found", name)))
    }

    pub fn list_members(&self) -> Vec<MemberRecord> {
        self.state.members.values().cloned().collect()
    }

    pub fn touch_heartbeat(&mut self, name: &str, now: u64) -> Result<()> {
        let mut member = self.get_node_by_name(name)?;
        member.last_heartbeat = now;
        self.upsert_member(member)
    }

    // === Projects ===

    pub fn create_project(&mut self, name: &str, config: BTreeMap<String, String>) -> Result<()> {
        if self.state.projects.contains_key(name) {
            return Err(Error::Conflict(format!("Project {:?} already exists", name)));
        }
        let record = ProjectRecord {
            name: name.to_string(),
            config,
        };
        self.put(CF_PROJECTS, name.as_bytes(), &record)?;
        self.state.projects.insert(name.to_string(), record);
        Ok(())
    }

    pub fn get_project(&self, name: &str) -> Result<ProjectRecord> {
        self.state
            .projects
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Project {:?} not found", name)))
    }

    pub fn list_projects(&self) -> Vec<ProjectRecord> {
        self.state.projects.values().cloned().collect()
    }

    /// Project that actually stores custom volumes for `project`
    pub fn effective_project(&self, project: &str) -> Result<String> {
        let record = self.get_project(project)?;
        if record.has_storage_volumes() {
            Ok(record.name)
        } else {
            Ok("default".to_string())
        }
    }

    fn effective_project_or_self(&self, project: &str) -> String {
        self.effective_project(project)
            .unwrap_or_else(|_| project.to_string())
    }

    // === Pools ===

    pub fn create_storage_pool(
        &mut self,
        name: &str,
        driver: &str,
        description: &str,
        config: BTreeMap<String, String>,
    ) -> Result<u64> {
        if self.state.pools.contains_key(name) {
            return Err(Error::Conflict(format!(
                "Storage pool {:?} already exists",
                name
            )));
        }
        let record = PoolRecord {
            id: self.allocate_id()?,
            name: name.to_string(),
            driver: driver.to_string(),
            description: description.to_string(),
            config,
        };
        self.put(CF_POOLS, name.as_bytes(), &record)?;
        let id = record.id;
        self.state.pools.insert(name.to_string(), record);
        Ok(id)
    }

    pub fn get_storage_pool(&self, name: &str) -> Result<PoolRecord> {
        self.state
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Storage pool {:?} not found", name)))
    }

    pub fn get_storage_pool_id(&self, name: &str) -> Result<u64> {
        self.get_storage_pool(name).map(|p| p.id)
    }

    pub fn list_storage_pools(&self) -> Vec<PoolRecord> {
        self.state.pools.values().cloned().collect()
    }

    // === Volumes ===

    fn volumes_named<'a>(
        &'a self,
        pool_id: u64,
        project: &'a str,
        kind: VolumeKind,
        name: &'a str,
    ) -> impl Iterator<Item = &'a VolumeRecord> + 'a {
        self.state.volumes.values().filter(move |v| {
            v.pool_id == pool_id && v.project == project && v.kind == kind && v.name == name
        })
    }

    /// The single record for this identity
    pub fn get_storage_volume(
        &self,
        pool_id: u64,
        project: &str,
        kind: VolumeKind,
        name: &str,
    ) -> Result<VolumeRecord> {
        let mut found = self.volumes_named(pool_id, project, kind, name);
        match (found.next(), found.next()) {
            (Some(v), None) => Ok(v.clone()),
            (Some(_), Some(_)) => Err(Error::AmbiguousLocation(name.to_string())),
            (None, _) => Err(Error::NotFound("Storage volume not found".into())),
        }
    }

    /// The record for this identity held by one member (or by no member)
    pub fn get_storage_volume_on(
        &self,
        pool_id: u64,
        project: &str,
        kind: VolumeKind,
        name: &str,
        member: Option<&str>,
    ) -> Result<VolumeRecord> {
        self.volumes_named(pool_id, project, kind, name)
            .find(|v| v.member.is_none() || v.member.as_deref() == member)
            .cloned()
            .ok_or_else(|| Error::NotFound("Storage volume not found".into()))
    }

    /// Whether a create of this identity by `member` would collide. `None`
    /// stands for a pool shared by every member.
    pub fn volume_exists(
        &self,
        pool_id: u64,
        project: &str,
        kind: VolumeKind,
        name: &str,
        member: Option<&str>,
    ) -> bool {
        self.volumes_named(pool_id, project, kind, name)
            .any(|v| v.member.is_none() || member.is_none() || v.member.as_deref() == member)
    }

    /// Members recorded as hosting the volume
    pub fn get_storage_volume_nodes(
        &self,
        pool_id: u64,
        project: &str,
        kind: VolumeKind,
        name: &str,
    ) -> Result<Vec<MemberRecord>> {
        let mut names: Vec<String> = Vec::new();
        let mut any = false;
        for v in self.volumes_named(pool_id, project, kind, name) {
            any = true;
            if let Some(member) = &v.member {
                if !names.contains(member) {
                    names.push(member.clone());
                }
            }
        }
        if !any {
            return Err(Error::NotFound("Storage volume not found".into()));
        }
        names
            .iter()
            .map(|n| self.get_node_by_name(n))
            .collect()
    }

    /// Insert a record; fails with `Conflict` when the identity is taken on
    /// the same member
    pub fn create_storage_volume(&mut self, mut record: VolumeRecord) -> Result<u64> {
        let taken = self.volume_exists(
            record.pool_id,
            &record.project,
            record.kind,
            &record.name,
            record.member.as_deref(),
        );
        if taken {
            return Err(Error::Conflict("Volume by that name already exists".into()));
        }
        record.id = self.allocate_id()?;
        let id = record.id;
        self.put(CF_VOLUMES, &id.to_be_bytes(), &record)?;
        self.state.volumes.insert(id, record);
        Ok(id)
    }

    pub fn get_storage_volume_by_id(&self, id: u64) -> Result<VolumeRecord> {
        self.state
            .volumes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound("Storage volume not found".into()))
    }

    /// Apply `f` to a record in place
    pub fn update_storage_volume(
        &mut self,
        id: u64,
        f: impl FnOnce(&mut VolumeRecord),
    ) -> Result<VolumeRecord> {
        let mut record = self.get_storage_volume_by_id(id)?;
        f(&mut record);
        self.put(CF_VOLUMES, &id.to_be_bytes(), &record)?;
        self.state.volumes.insert(id, record.clone());
        Ok(record)
    }

    /// Rename a volume and its snapshot records
    pub fn rename_storage_volume(&mut self, id: u64, new_name: &str) -> Result<()> {
        let record = self.get_storage_volume_by_id(id)?;
        let clash = self
            .volumes_named(record.pool_id, &record.project, record.kind, new_name)
            .any(|v| v.member.is_none() || v.member == record.member);
        if clash {
            return Err(Error::Conflict(format!(
                "Volume by that name already exists: {:?}",
                new_name
            )));
        }

        for snap in self.list_storage_volume_snapshots(&record) {
            let (_, snap_name) = crate::storage::volume::split_snapshot(&snap.name);
            let renamed = crate::storage::volume::snapshot_name(new_name, snap_name.unwrap_or_default());
            self.update_storage_volume(snap.id, |v| v.name = renamed)?;
        }
        self.update_storage_volume(id, |v| v.name = new_name.to_string())?;
        Ok(())
    }

    pub fn delete_storage_volume(&mut self, id: u64) -> Result<()> {
        if self.state.volumes.remove(&id).is_none() {
            return Err(Error::NotFound("Storage volume not found".into()));
        }
        self.delete(CF_VOLUMES, &id.to_be_bytes());
        Ok(())
    }

    /// Volumes in a pool, optionally scoped to a project and/or kind
    pub fn list_storage_volumes(
        &self,
        pool_id: u64,
        project: Option<&str>,
        kind: Option<VolumeKind>,
    ) -> Vec<VolumeRecord> {
        self.state
            .volumes
            .values()
            .filter(|v| v.pool_id == pool_id)
            .filter(|v| project.map_or(true, |p| v.project == p))
            .filter(|v| kind.map_or(true, |k| v.kind == k))
            .cloned()
            .collect()
    }

    /// Snapshot records of a volume, oldest first
    pub fn list_storage_volume_snapshots(&self, parent: &VolumeRecord) -> Vec<VolumeRecord> {
        let prefix = format!("{}{}", parent.name, crate::storage::volume::SNAPSHOT_DELIMITER);
        let mut snaps: Vec<VolumeRecord> = self
            .state
            .volumes
            .values()
            .filter(|v| {
                v.pool_id == parent.pool_id
                    && v.project == parent.project
                    && v.kind == parent.kind
                    && v.member == parent.member
                    && v.name.starts_with(&prefix)
            })
            .cloned()
            .collect();
        snaps.sort_by_key(|v| (v.created_at, v.id));
        snaps
    }

    // === Consumers ===

    pub fn put_instance(&mut self, instance: InstanceRecord) -> Result<()> {
        let key = scoped_key(&instance.project, &instance.name);
        self.put(CF_INSTANCES, key.as_bytes(), &instance)?;
        self.state.instances.insert(key, instance);
        Ok(())
    }

    pub fn get_instance(&self, project: &str, name: &str) -> Result<InstanceRecord> {
        self.state
            .instances
            .get(&scoped_key(project, name))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Instance {:?} not found", name)))
    }

    pub fn put_profile(&mut self, profile: ProfileRecord) -> Result<()> {
        let key = scoped_key(&profile.project, &profile.name);
        self.put(CF_PROFILES, key.as_bytes(), &profile)?;
        self.state.profiles.insert(key, profile);
        Ok(())
    }

    pub fn get_profile(&self, project: &str, name: &str) -> Result<ProfileRecord> {
        self.state
            .profiles
            .get(&scoped_key(project, name))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Profile {:?} not found", name)))
    }

    pub fn put_image(&mut self, image: ImageRecord) -> Result<()> {
        let key = scoped_key(&image.project, &image.fingerprint);
        self.put(CF_IMAGES, key.as_bytes(), &image)?;
        self.state.images.insert(key, image);
        Ok(())
    }

    /// Projects with at least one image of this fingerprint
    pub fn image_projects(&self, fingerprint: &str) -> Vec<String> {
        self.state
            .images
            .values()
            .filter(|i| i.fingerprint == fingerprint)
            .map(|i| i.project.clone())
            .collect()
    }

    /// Disk devices of instances and profiles referencing a custom volume.
    /// `project` is the effective volume project; consumers in projects
    /// that share it are included.
    pub fn volume_consumers(&self, pool: &str, project: &str, name: &str) -> Vec<VolumeConsumer> {
        let mut out = Vec::new();

        for instance in self.state.instances.values() {
            if self.effective_project_or_self(&instance.project) != project {
                continue;
            }
            for (device, config) in &instance.devices {
                if is_volume_device(config, pool, name) {
                    out.push(VolumeConsumer {
                        consumer: ConsumerRef::Instance {
                            project: instance.project.clone(),
                            name: instance.name.clone(),
                        },
                        device: device.clone(),
                        running_on: instance.running.then(|| instance.member.clone()),
                    });
                }
            }
        }

        for profile in self.state.profiles.values() {
            if self.effective_project_or_self(&profile.project) != project {
                continue;
            }
            for (device, config) in &profile.devices {
                if is_volume_device(config, pool, name) {
                    out.push(VolumeConsumer {
                        consumer: ConsumerRef::Profile {
                            project: profile.project.clone(),
                            name: profile.name.clone(),
                        },
                        device: device.clone(),
                        running_on: None,
                    });
                }
            }
        }

        out
    }

    /// Point a consumer's device at (`pool`, `source`); returns the previous reference
    pub fn set_device_source(
        &mut self,
        consumer: &ConsumerRef,
        device: &str,
        pool: &str,
        source: &str,
    ) -> Result<DeviceRef> {
        match consumer {
            ConsumerRef::Instance { project, name } => {
                let mut instance = self.get_instance(project, name)?;
                let previous = rewrite_device(&mut instance.devices, consumer, device, pool, source)?;
                self.put_instance(instance)?;
                Ok(previous)
            }
            ConsumerRef::Profile { project, name } => {
                let mut profile = self.get_profile(project, name)?;
                let previous = rewrite_device(&mut profile.devices, consumer, device, pool, source)?;
                self.put_profile(profile)?;
                Ok(previous)
            }
        }
    }
}

fn rewrite_device(
    devices: &mut BTreeMap<String, Device>,
    consumer: &ConsumerRef,
    device: &str,
    pool: &str,
    source: &str,
) -> Result<DeviceRef> {
    let entry = devices.get_mut(device).ok_or_else(|| {
        Error::NotFound(format!("Device {:?} not found on {}", device, consumer.url()))
    })?;
    let previous = DeviceRef {
        consumer: consumer.clone(),
        device: device.to_string(),
        pool: entry.get("pool").cloned().unwrap_or_default(),
        source: entry.get("source").cloned().unwrap_or_default(),
    };
    entry.insert("pool".to_string(), pool.to_string());
    entry.insert("source".to_string(), source.to_string());
    Ok(previous)
}

fn is_volume_device(config: &Device, pool: &str, name: &str) -> bool {
    config.get("type").map(String::as_str) == Some("disk")
        && config.get("pool").map(String::as_str) == Some(pool)
        && config.get("source").map(String::as_str) == Some(name)
}

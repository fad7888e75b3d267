//! Which member should serve a request for a volume

use crate::cluster::db::{ClusterDb, MemberRecord};
use crate::common::{Error, Result};
use crate::storage::volume::VolumeKind;
use crate::storage::PoolRegistry;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// This member hosts the volume
    Local,
    /// Another member hosts the volume
    Remote(MemberRecord),
    /// Reachable from any member
    NoOwner,
}

pub struct LocationResolver {
    db: Arc<ClusterDb>,
    pools: Arc<PoolRegistry>,
    local: String,
}

impl LocationResolver {
    pub fn new(db: Arc<ClusterDb>, pools: Arc<PoolRegistry>, local: impl Into<String>) -> Self {
        Self {
            db,
            pools,
            local: local.into(),
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    /// Locate `name` in `pool`. `project` must already be the effective
    /// project of the volume.
    ///
    /// On pools whose driver is reachable from every member, a volume
    /// exclusively attached to a running instance is served by that
    /// instance's member; otherwise any member can serve it.
    pub fn resolve(
        &self,
        pool: &str,
        project: &str,
        kind: VolumeKind,
        name: &str,
    ) -> Result<Location> {
        let remote_driver = self.pools.load(pool)?.driver_info().remote;

        let member = self.db.transaction(|tx| {
            let pool_id = tx.get_storage_pool_id(pool)?;
            if remote_driver {
                let record = tx.get_storage_volume(pool_id, project, kind, name)?;
                let shared = record
                    .config
                    .get("security.shared")
                    .map(|v| v == "true")
                    .unwrap_or(false);
                if shared || kind != VolumeKind::Custom {
                    return Ok(None);
                }

                let mut running: Vec<String> = tx
                    .volume_consumers(pool, project, name)
                    .into_iter()
                    .filter_map(|c| c.running_on)
                    .collect();
                running.sort();
                running.dedup();
                return match running.len() {
                    0 => Ok(None),
                    1 => tx.get_node_by_name(&running[0]).map(Some),
                    _ => Err(Error::AmbiguousLocation(name.to_string())),
                };
            }

            let mut nodes = tx.get_storage_volume_nodes(pool_id, project, kind, name)?;
            match nodes.len() {
                0 => Err(Error::EmptyLocation(name.to_string())),
                1 => Ok(nodes.pop()),
                _ => Err(Error::AmbiguousLocation(name.to_string())),
            }
        })?;

        Ok(match member {
            None => Location::NoOwner,
            Some(m) if m.name == self.local => Location::Local,
            Some(m) => Location::Remote(m),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::db::tests::volume;
    use crate::cluster::db::InstanceRecord;
    use crate::common::config::PoolSeed;
    use std::collections::{BTreeMap, HashMap};
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path) -> (Arc<ClusterDb>, LocationResolver, u64, u64) {
        let db = Arc::new(ClusterDb::in_memory());
        let pools = Arc::new(PoolRegistry::new(db.clone(), "node1", dir));
        pools
            .seed(&[
                PoolSeed {
                    name: "local".into(),
                    driver: "dir".into(),
                    description: String::new(),
                    config: HashMap::new(),
                },
                PoolSeed {
                    name: "ceph".into(),
                    driver: "shared".into(),
                    description: String::new(),
                    config: HashMap::from([(
                        "source".to_string(),
                        dir.join("shared").display().to_string(),
                    )]),
                },
            ])
            .unwrap();
        let (local_id, shared_id) = db
            .transaction(|tx| {
                for (name, url) in [("node1", "http://n1"), ("node2", "http://n2")] {
                    tx.upsert_member(MemberRecord {
                        name: name.into(),
                        url: url.into(),
                        last_heartbeat: 0,
                    })?;
                }
                tx.create_project("default", BTreeMap::new())?;
                Ok((tx.get_storage_pool_id("local")?, tx.get_storage_pool_id("ceph")?))
            })
            .unwrap();
        let resolver = LocationResolver::new(db.clone(), pools, "node1");
        (db, resolver, local_id, shared_id)
    }

    #[test]
    fn test_local_pool_locations() {
        let dir = tempdir().unwrap();
        let (db, resolver, pool_id, _) = setup(dir.path());
        db.transaction(|tx| {
            tx.create_storage_volume(volume(pool_id, "mine", Some("node1")))?;
            tx.create_storage_volume(volume(pool_id, "theirs", Some("node2")))?;
            tx.create_storage_volume(volume(pool_id, "twice", Some("node1")))?;
            tx.create_storage_volume(volume(pool_id, "twice", Some("node2")))
        })
        .unwrap();

        assert_eq!(
            resolver.resolve("local", "default", VolumeKind::Custom, "mine").unwrap(),
            Location::Local
        );
        assert!(matches!(
            resolver.resolve("local", "default", VolumeKind::Custom, "theirs").unwrap(),
            Location::Remote(m) if m.name == "node2"
        ));
        assert!(matches!(
            resolver.resolve("local", "default", VolumeKind::Custom, "twice"),
            Err(Error::AmbiguousLocation(_))
        ));
        assert!(matches!(
            resolver.resolve("local", "default", VolumeKind::Custom, "nope"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_unowned_record_is_empty_location() {
        let dir = tempdir().unwrap();
        let (db, resolver, pool_id, _) = setup(dir.path());
        db.transaction(|tx| tx.create_storage_volume(volume(pool_id, "orphan", None)))
            .unwrap();
        assert!(matches!(
            resolver.resolve("local", "default", VolumeKind::Custom, "orphan"),
            Err(Error::EmptyLocation(_))
        ));
    }

    #[test]
    fn test_shared_pool_follows_running_instance() {
        let dir = tempdir().unwrap();
        let (db, resolver, _, shared_id) = setup(dir.path());
        db.transaction(|tx| tx.create_storage_volume(volume(shared_id, "data", None)))
            .unwrap();
        assert_eq!(
            resolver.resolve("ceph", "default", VolumeKind::Custom, "data").unwrap(),
            Location::NoOwner
        );

        db.transaction(|tx| {
            tx.put_instance(InstanceRecord {
                project: "default".into(),
                name: "c1".into(),
                member: "node2".into(),
                running: true,
                devices: BTreeMap::from([(
                    "data".to_string(),
                    BTreeMap::from([
                        ("type".to_string(), "disk".to_string()),
                        ("pool".to_string(), "ceph".to_string()),
                        ("source".to_string(), "data".to_string()),
                    ]),
                )]),
            })
        })
        .unwrap();
        assert!(matches!(
            resolver.resolve("ceph", "default", VolumeKind::Custom, "data").unwrap(),
            Location::Remote(m) if m.name == "node2"
        ));

        // shared volumes are never pinned to a member
        db.transaction(|tx| {
            let id = tx.get_storage_volume(shared_id, "default", VolumeKind::Custom, "data")?.id;
            tx.update_storage_volume(id, |v| {
                v.config.insert("security.shared".into(), "true".into());
            })
        })
        .unwrap();
        assert_eq!(
            resolver.resolve("ceph", "default", VolumeKind::Custom, "data").unwrap(),
            Location::NoOwner
        );
    }
}

//! Storage pools, drivers and volume types

pub mod dir;
pub mod driver;
pub mod pool;
pub mod volume;

pub use driver::{DriverInfo, DriverVolume, PoolDriver};
pub use pool::{CopySource, NewVolume, StoragePool};
pub use volume::{ContentType, StorageVolume, VolumeAction, VolumeIdentity, VolumeKind};

use crate::cluster::db::{ClusterDb, PoolRecord};
use crate::common::config::PoolSeed;
use crate::common::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Builds [`StoragePool`] handles from pool records, caching one driver per pool
pub struct PoolRegistry {
    db: Arc<ClusterDb>,
    member: String,
    data_dir: PathBuf,
    drivers: Mutex<HashMap<String, Arc<dyn PoolDriver>>>,
}

impl PoolRegistry {
    pub fn new(db: Arc<ClusterDb>, member: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            member: member.into(),
            data_dir: data_dir.into(),
            drivers: Mutex::new(HashMap::new()),
        }
    }

    /// Create seeded pools that do not exist yet
    pub fn seed(&self, seeds: &[PoolSeed]) -> Result<()> {
        for seed in seeds {
            let created = self.db.transaction(|tx| {
                if tx.get_storage_pool(&seed.name).is_ok() {
                    return Ok(false);
                }
                tx.create_storage_pool(
                    &seed.name,
                    &seed.driver,
                    &seed.description,
                    seed.config.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                )?;
                Ok(true)
            })?;
            if created {
                tracing::info!("  Storage pool: {} ({})", seed.name, seed.driver);
            }
        }
        Ok(())
    }

    /// Handle for a pool by name
    pub fn load(&self, name: &str) -> Result<StoragePool> {
        let record = self.db.transaction(|tx| tx.get_storage_pool(name))?;
        let driver = {
            let mut drivers = self
                .drivers
                .lock()
                .map_err(|_| Error::Internal("driver cache lock poisoned".into()))?;
            match drivers.get(name) {
                Some(driver) => driver.clone(),
                None => {
                    let driver = self.driver_for(&record)?;
                    drivers.insert(name.to_string(), driver.clone());
                    driver
                }
            }
        };
        Ok(StoragePool::new(record, driver, self.db.clone(), self.member.clone()))
    }

    fn driver_for(&self, record: &PoolRecord) -> Result<Arc<dyn PoolDriver>> {
        let source = record.config.get("source").map(PathBuf::from);
        match record.driver.as_str() {
            "dir" => Ok(Arc::new(dir::DirDriver::local(source.unwrap_or_else(|| {
                self.data_dir.join("storage-pools").join(&record.name)
            })))),
            "shared" => {
                let source = source.ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "pool {:?}: the shared driver requires config.source",
                        record.name
                    ))
                })?;
                Ok(Arc::new(dir::DirDriver::shared(source)))
            }
            other => Err(Error::InvalidConfig(format!(
                "pool {:?}: unknown driver {:?}",
                record.name, other
            ))),
        }
    }
}

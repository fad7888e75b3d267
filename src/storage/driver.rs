//! Byte-level storage driver capability trait

use crate::common::Result;
use crate::storage::volume::{ContentType, VolumeKind};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::io::AsyncRead;

/// What a driver reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverInfo {
    pub name: &'static str,
    /// Reachable from every member, so volumes have no single owner
    pub remote: bool,
}

/// Volume as seen by a driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverVolume {
    pub project: String,
    pub kind: VolumeKind,
    pub name: String,
    pub content_type: ContentType,
}

impl DriverVolume {
    pub fn new(project: &str, kind: VolumeKind, name: &str, content_type: ContentType) -> Self {
        Self {
            project: project.to_string(),
            kind,
            name: name.to_string(),
            content_type,
        }
    }
}

pub type VolumeReader = Box<dyn AsyncRead + Send + Unpin>;

/// Storage backend of one pool
#[async_trait]
pub trait PoolDriver: Send + Sync {
    fn info(&self) -> DriverInfo;

    /// Driver-specific name rules, on top of the generic ones
    fn validate_name(&self, name: &str) -> Result<()>;

    fn validate_config(&self, config: &BTreeMap<String, String>) -> Result<()>;

    /// Create an empty volume
    async fn create_volume(&self, vol: &DriverVolume) -> Result<()>;

    /// Remove a volume with all of its snapshots
    async fn delete_volume(&self, vol: &DriverVolume) -> Result<()>;

    async fn rename_volume(&self, vol: &DriverVolume, new_name: &str) -> Result<()>;

    async fn has_volume(&self, vol: &DriverVolume) -> Result<bool>;

    /// Content of the volume or one of its snapshots, with its size
    async fn read_volume(&self, vol: &DriverVolume, snapshot: Option<&str>) -> Result<(VolumeReader, u64)>;

    /// Replace the content of the volume or one of its snapshots. The write
    /// is atomic: on error the previous content is left untouched.
    async fn write_volume(
        &self,
        vol: &DriverVolume,
        snapshot: Option<&str>,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64>;

    async fn create_snapshot(&self, vol: &DriverVolume, snapshot: &str) -> Result<()>;

    async fn delete_snapshot(&self, vol: &DriverVolume, snapshot: &str) -> Result<()>;

    async fn restore_snapshot(&self, vol: &DriverVolume, snapshot: &str) -> Result<()>;

    /// Snapshot names present on disk
    async fn list_snapshots(&self, vol: &DriverVolume) -> Result<Vec<String>>;
}

//! Directory-backed storage driver
//!
//! Layout under the pool root:
//! - `<type>/<project>_<name>/volume.data`
//! - `<type>/<project>_<name>/snapshots/<snapshot>.data`
//!
//! The same code backs two drivers: `dir` (a node-local directory) and
//! `shared` (a directory every member mounts, e.g. over NFS).

use crate::common::{encode_segment, parse_size, Error, Result};
use crate::storage::driver::{DriverInfo, DriverVolume, PoolDriver, VolumeReader};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};

const DATA_FILE: &str = "volume.data";
const SNAPSHOTS_DIR: &str = "snapshots";
const PARTIAL_SUFFIX: &str = ".partial";

/// Config keys a volume may carry
const ALLOWED_KEYS: &[&str] = &[
    "size",
    "security.shared",
    "security.unmapped",
    "snapshots.expiry",
    "snapshots.pattern",
    "snapshots.schedule",
    "block.filesystem",
    "block.mount_options",
];

pub struct DirDriver {
    root: PathBuf,
    remote: bool,
}

impl DirDriver {
    /// Node-local directory pool
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            remote: false,
        }
    }

    /// Directory shared by all members
    pub fn shared(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            remote: true,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn volume_dir(&self, vol: &DriverVolume) -> PathBuf {
        self.volume_dir_named(vol, &vol.name)
    }

    fn volume_dir_named(&self, vol: &DriverVolume, name: &str) -> PathBuf {
        self.root.join(vol.kind.as_str()).join(format!(
            "{}_{}",
            encode_segment(&vol.project),
            encode_segment(name)
        ))
    }

    fn data_path(&self, vol: &DriverVolume, snapshot: Option<&str>) -> PathBuf {
        let dir = self.volume_dir(vol);
        match snapshot {
            Some(snap) => dir
                .join(SNAPSHOTS_DIR)
                .join(format!("{}.data", encode_segment(snap))),
            None => dir.join(DATA_FILE),
        }
    }

    async fn require_volume(&self, vol: &DriverVolume) -> Result<()> {
        if !self.has_volume(vol).await? {
            return Err(Error::NotFound(format!(
                "Volume {:?} not found in storage",
                vol.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PoolDriver for DirDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo {
            name: if self.remote { "shared" } else { "dir" },
            remote: self.remote,
        }
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        if name.len() > 200 {
            return Err(Error::InvalidInput(format!(
                "Volume name {:?} is too long",
                name
            )));
        }
        if name.starts_with('-') || name.ends_with(PARTIAL_SUFFIX) {
            return Err(Error::InvalidInput(format!(
                "Volume name {:?} is reserved by the {} driver",
                name,
                self.info().name
            )));
        }
        Ok(())
    }

    fn validate_config(&self, config: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in config {
            let known = ALLOWED_KEYS.contains(&key.as_str())
                || key.starts_with("user.")
                || key.starts_with("volatile.");
            if !known {
                return Err(Error::InvalidInput(format!(
                    "Invalid volume config key {:?}",
                    key
                )));
            }
            match key.as_str() {
                "size" if !value.is_empty() => {
                    parse_size(value)?;
                }
                "security.shared" | "security.unmapped"
                    if !matches!(value.as_str(), "" | "true" | "false") =>
                {
                    return Err(Error::InvalidInput(format!(
                        "Invalid value for {:?}: {:?}",
                        key, value
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn create_volume(&self, vol: &DriverVolume) -> Result<()> {
        let dir = self.volume_dir(vol);
        if fs::try_exists(&dir).await? {
            return Err(Error::Conflict(format!(
                "Volume {:?} already exists in storage",
                vol.name
            )));
        }
        fs::create_dir_all(dir.join(SNAPSHOTS_DIR)).await?;
        fs::File::create(dir.join(DATA_FILE)).await?;
        tracing::debug!(path = %dir.display(), "Created volume");
        Ok(())
    }

    async fn delete_volume(&self, vol: &DriverVolume) -> Result<()> {
        let dir = self.volume_dir(vol);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rename_volume(&self, vol: &DriverVolume, new_name: &str) -> Result<()> {
        self.require_volume(vol).await?;
        let target = self.volume_dir_named(vol, new_name);
        if fs::try_exists(&target).await? {
            return Err(Error::Conflict(format!(
                "Volume {:?} already exists in storage",
                new_name
            )));
        }
        fs::rename(self.volume_dir(vol), target).await?;
        Ok(())
    }

    async fn has_volume(&self, vol: &DriverVolume) -> Result<bool> {
        Ok(fs::try_exists(self.volume_dir(vol).join(DATA_FILE)).await?)
    }

    async fn read_volume(
        &self,
        vol: &DriverVolume,
        snapshot: Option<&str>,
    ) -> Result<(VolumeReader, u64)> {
        let path = self.data_path(vol, snapshot);
        let file = fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!(
                "Volume {:?} not found in storage",
                snapshot.map_or(vol.name.clone(), |s| format!("{}/{}", vol.name, s))
            )),
            _ => e.into(),
        })?;
        let size = file.metadata().await?.len();
        Ok((Box::new(file), size))
    }

    async fn write_volume(
        &self,
        vol: &DriverVolume,
        snapshot: Option<&str>,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        self.require_volume(vol).await?;
        let path = self.data_path(vol, snapshot);
        let mut partial = path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        let written = async {
            let mut file = fs::File::create(&partial).await?;
            let n = tokio::io::copy(&mut *reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<u64, std::io::Error>(n)
        }
        .await;

        match written {
            Ok(n) => {
                fs::rename(&partial, &path).await?;
                Ok(n)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                Err(e.into())
            }
        }
    }

    async fn create_snapshot(&self, vol: &DriverVolume, snapshot: &str) -> Result<()> {
        self.require_volume(vol).await?;
        let target = self.data_path(vol, Some(snapshot));
        if fs::try_exists(&target).await? {
            return Err(Error::Conflict(format!(
                "Snapshot {:?} already exists",
                snapshot
            )));
        }
        fs::create_dir_all(self.volume_dir(vol).join(SNAPSHOTS_DIR)).await?;
        fs::copy(self.data_path(vol, None), target).await?;
        Ok(())
    }

    async fn delete_snapshot(&self, vol: &DriverVolume, snapshot: &str) -> Result<()> {
        match fs::remove_file(self.data_path(vol, Some(snapshot))).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn restore_snapshot(&self, vol: &DriverVolume, snapshot: &str) -> Result<()> {
        let (mut reader, _) = self.read_volume(vol, Some(snapshot)).await?;
        self.write_volume(vol, None, &mut reader).await?;
        Ok(())
    }

    async fn list_snapshots(&self, vol: &DriverVolume) -> Result<Vec<String>> {
        let dir = self.volume_dir(vol).join(SNAPSHOTS_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = file_name.strip_suffix(".data") {
                names.push(crate::common::decode_segment(stem)?);
            }
        }
        names.sort();
        Ok(names)
    }
}

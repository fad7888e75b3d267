//! Volume kinds, identities and the API representation of a volume

use crate::common::{encode_segment, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Separates a parent volume name from a snapshot name.
pub const SNAPSHOT_DELIMITER: char = '/';

/// Closed set of volume kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeKind {
    Custom,
    Image,
    Container,
    VirtualMachine,
}

/// Something a request wants to do with a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeAction {
    Create,
    Read,
    Update,
    Patch,
    Rename,
    Migrate,
    Delete,
}

impl VolumeKind {
    pub const ALL: [VolumeKind; 4] = [
        VolumeKind::Custom,
        VolumeKind::Image,
        VolumeKind::Container,
        VolumeKind::VirtualMachine,
    ];

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "custom" => Ok(VolumeKind::Custom),
            "image" => Ok(VolumeKind::Image),
            "container" => Ok(VolumeKind::Container),
            "virtual-machine" => Ok(VolumeKind::VirtualMachine),
            other => Err(Error::InvalidInput(format!(
                "Invalid storage volume type {:?}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeKind::Custom => "custom",
            VolumeKind::Image => "image",
            VolumeKind::Container => "container",
            VolumeKind::VirtualMachine => "virtual-machine",
        }
    }

    /// Custom volumes support everything, image volumes can be read, updated
    /// and deleted, instance volumes can only be read and updated.
    pub fn supports(&self, action: VolumeAction) -> bool {
        match self {
            VolumeKind::Custom => true,
            VolumeKind::Image => matches!(
                action,
                VolumeAction::Read | VolumeAction::Update | VolumeAction::Delete
            ),
            VolumeKind::Container | VolumeKind::VirtualMachine => {
                matches!(action, VolumeAction::Read | VolumeAction::Update)
            }
        }
    }

    /// Boundary check; fails with an input error naming the type
    pub fn require(&self, action: VolumeAction) -> Result<()> {
        if self.supports(action) {
            return Ok(());
        }
        let verb = match action {
            VolumeAction::Create => "created",
            VolumeAction::Read => "read",
            VolumeAction::Update | VolumeAction::Patch => "modified",
            VolumeAction::Rename => "renamed or moved",
            VolumeAction::Migrate => "migrated",
            VolumeAction::Delete => "deleted",
        };
        Err(Error::InvalidInput(format!(
            "Storage volumes of type {:?} cannot be {} with the storage API",
            self.as_str(),
            verb
        )))
    }
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content type, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Filesystem,
    Block,
    Iso,
}

impl ContentType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "filesystem" => Ok(ContentType::Filesystem),
            "block" => Ok(ContentType::Block),
            "iso" => Ok(ContentType::Iso),
            other => Err(Error::InvalidInput(format!(
                "Invalid content type {:?}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Filesystem => "filesystem",
            ContentType::Block => "block",
            ContentType::Iso => "iso",
        }
    }
}

/// (pool, project, type, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeIdentity {
    pub pool: String,
    pub project: String,
    pub kind: VolumeKind,
    pub name: String,
}

impl VolumeIdentity {
    pub fn new(
        pool: impl Into<String>,
        project: impl Into<String>,
        kind: VolumeKind,
        name: impl Into<String>,
    ) -> Self {
        Self {
            pool: pool.into(),
            project: project.into(),
            kind,
            name: name.into(),
        }
    }

    /// API URL of the volume, with `?project=` for non-default projects
    pub fn url(&self) -> String {
        volume_url(&self.pool, &self.project, self.kind, &self.name)
    }
}

impl fmt::Display for VolumeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.pool, self.project, self.kind, self.name)
    }
}

pub fn volume_url(pool: &str, project: &str, kind: VolumeKind, name: &str) -> String {
    let mut url = format!(
        "/1.0/storage-pools/{}/volumes/{}/{}",
        encode_segment(pool),
        kind,
        encode_segment(name)
    );
    if project != "default" {
        url.push_str("?project=");
        url.push_str(&encode_segment(project));
    }
    url
}

/// Split `parent/snap` into its parts
pub fn split_snapshot(name: &str) -> (&str, Option<&str>) {
    match name.split_once(SNAPSHOT_DELIMITER) {
        Some((parent, snap)) => (parent, Some(snap)),
        None => (name, None),
    }
}

pub fn is_snapshot(name: &str) -> bool {
    name.contains(SNAPSHOT_DELIMITER)
}

pub fn snapshot_name(parent: &str, snap: &str) -> String {
    format!("{}{}{}", parent, SNAPSHOT_DELIMITER, snap)
}

/// Generic volume name rules; drivers may add their own
pub fn validate_volume_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("No name provided".into()));
    }
    if name.contains(SNAPSHOT_DELIMITER) || name.contains('\\') {
        return Err(Error::InvalidInput(format!(
            "Invalid volume name {:?}: storage volume names may not contain slashes",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidInput(format!(
            "Invalid volume name {:?}",
            name
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(Error::InvalidInput(format!(
            "Invalid volume name {:?}: control characters are not allowed",
            name
        )));
    }
    Ok(())
}

/// Volume as exposed by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageVolume {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: VolumeKind,
    pub pool: String,
    pub project: String,
    pub content_type: ContentType,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub used_by: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl StorageVolume {
    /// ETag over the mutable fields
    pub fn etag(&self) -> Result<String> {
        crate::common::etag(&(&self.name, self.kind.as_str(), &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_capabilities() {
        assert!(VolumeKind::Custom.require(VolumeAction::Migrate).is_ok());
        assert!(VolumeKind::Image.require(VolumeAction::Delete).is_ok());
        assert!(VolumeKind::Image.require(VolumeAction::Rename).is_err());
        assert!(VolumeKind::Container.require(VolumeAction::Update).is_ok());

        let err = VolumeKind::Container
            .require(VolumeAction::Delete)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(err.to_string().contains("container"));
    }

    #[test]
    fn test_kind_parse_roundtrip() {
        for kind in VolumeKind::ALL {
            assert_eq!(VolumeKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(VolumeKind::parse("disk").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_volume_name("backups").is_ok());
        assert!(validate_volume_name("").is_err());
        assert!(validate_volume_name("a/b").is_err());
        assert!(validate_volume_name("..").is_err());
        assert!(validate_volume_name("bad\nname").is_err());
    }

    #[test]
    fn test_snapshot_split() {
        assert_eq!(split_snapshot("data/snap0"), ("data", Some("snap0")));
        assert_eq!(split_snapshot("data"), ("data", None));
        assert_eq!(snapshot_name("data", "snap1"), "data/snap1");
    }

    #[test]
    fn test_volume_url() {
        assert_eq!(
            volume_url("default", "default", VolumeKind::Custom, "backups"),
            "/1.0/storage-pools/default/volumes/custom/backups"
        );
        assert_eq!(
            volume_url("fast", "web", VolumeKind::Custom, "a b"),
            "/1.0/storage-pools/fast/volumes/custom/a%20b?project=web"
        );
    }
}

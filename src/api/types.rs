//! JSON bodies of the volume API

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// `source` of a create request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSource {
    /// "", "copy" or "migration"
    #[serde(rename = "type")]
    pub source_type: String,
    pub name: String,
    pub pool: String,
    pub project: String,
    pub location: String,
    #[serde(alias = "volumeOnly")]
    pub volume_only: bool,
    pub refresh: bool,
    pub mode: String,
    pub certificate: String,
    pub operation: String,
    pub websockets: HashMap<String, String>,
    /// Push-mode callback address
    pub target: String,
}

/// POST `/storage-pools/{pool}/volumes[/{type}]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumesPost {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(alias = "contentType")]
    pub content_type: String,
    pub description: String,
    pub config: BTreeMap<String, String>,
    pub source: VolumeSource,
}

/// Push target of a migration started on the source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumePostTarget {
    pub certificate: String,
    pub operation: String,
    pub websockets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumePostSource {
    /// Member currently holding the volume
    pub location: String,
}

/// POST `/storage-pools/{pool}/volumes/{type}/{name}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumePost {
    pub name: String,
    pub pool: String,
    pub project: String,
    pub migration: bool,
    #[serde(alias = "volumeOnly")]
    pub volume_only: bool,
    pub target: Option<VolumePostTarget>,
    pub source: VolumePostSource,
}

/// PUT and PATCH body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumePut {
    pub description: Option<String>,
    pub config: Option<BTreeMap<String, String>>,
    /// Snapshot to restore before applying the update
    pub restore: String,
}

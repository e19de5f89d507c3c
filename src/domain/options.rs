//! Operation descriptors sent to a remote executor
//!
//! Each descriptor carries the resource id, size/metadata, pool/profile
//! bindings and the serialized caller context. `driver_name` and `pool_name`
//! are only filled in on the direct-to-dock path.

use crate::domain::model::HostInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeOpts {
    pub id: String,
    pub name: String,
    pub description: String,
    pub size: u64,
    pub availability_zone: String,
    pub profile_id: String,
    /// Serialized profile
    pub profile: String,
    pub pool_id: String,
    pub pool_name: String,
    pub snapshot_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Serialized caller context
    pub context: String,
    pub driver_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendVolumeOpts {
    pub id: String,
    /// Validated target size in GiB
    pub size: u64,
    pub pool_id: String,
    pub metadata: BTreeMap<String, String>,
    pub context: String,
    pub driver_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteVolumeOpts {
    pub id: String,
    pub profile_id: String,
    pub profile: String,
    pub pool_id: String,
    pub metadata: BTreeMap<String, String>,
    pub context: String,
    pub driver_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeAttachmentOpts {
    pub id: String,
    pub volume_id: String,
    pub pool_id: String,
    pub host_info: HostInfo,
    pub metadata: BTreeMap<String, String>,
    pub context: String,
    pub driver_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteVolumeAttachmentOpts {
    pub id: String,
    pub volume_id: String,
    pub pool_id: String,
    pub access_protocol: String,
    pub host_info: HostInfo,
    pub metadata: BTreeMap<String, String>,
    pub context: String,
    pub driver_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeSnapshotOpts {
    pub id: String,
    pub name: String,
    pub description: String,
    pub volume_id: String,
    pub pool_id: String,
    pub size: u64,
    pub metadata: BTreeMap<String, String>,
    pub context: String,
    pub driver_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteVolumeSnapshotOpts {
    pub id: String,
    pub volume_id: String,
    pub pool_id: String,
    pub metadata: BTreeMap<String, String>,
    pub context: String,
    pub driver_name: String,
}

/// Result of a successful remote call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorReply {
    /// Backend facts to merge into the resource metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

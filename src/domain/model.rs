//! Domain Model - Ledger records and their status machines
//!
//! Every record the ledger stores lives here: volumes, attachments,
//! snapshots and replications, plus the pool/dock/profile records used for
//! placement, routing and policy resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Resource Kind
// =============================================================================

/// Kinds of records tracked by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Volume,
    Attachment,
    Snapshot,
    Replication,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Volume => write!(f, "Volume"),
            ResourceKind::Attachment => write!(f, "VolumeAttachment"),
            ResourceKind::Snapshot => write!(f, "VolumeSnapshot"),
            ResourceKind::Replication => write!(f, "Replication"),
        }
    }
}

// =============================================================================
// Resource Status
// =============================================================================

/// Status shared by volumes, attachments and snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceStatus {
    Creating,
    Available,
    ErrorCreating,
    Extending,
    ErrorExtending,
    Deleting,
    ErrorDeleting,
    Error,
}

impl ResourceStatus {
    /// One of the `Error*` variants
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ResourceStatus::ErrorCreating
                | ResourceStatus::ErrorExtending
                | ResourceStatus::ErrorDeleting
                | ResourceStatus::Error
        )
    }

    /// Delete may start from a stable status or any error status
    pub fn is_deletable(&self) -> bool {
        *self == ResourceStatus::Available || self.is_error()
    }

    /// Check whether `next` is reachable from this status
    pub fn can_transition_to(&self, next: ResourceStatus) -> bool {
        use ResourceStatus::*;
        match (self, next) {
            (Creating, Available | ErrorCreating | Error) => true,
            (Available, Extending) => true,
            // rollback of a precondition failure returns to the stable status
            (Extending, Available | ErrorExtending | Error) => true,
            (Deleting, ErrorDeleting | Error) => true,
            (current, Deleting) => current.is_deletable(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceStatus::Creating => "creating",
            ResourceStatus::Available => "available",
            ResourceStatus::ErrorCreating => "errorCreating",
            ResourceStatus::Extending => "extending",
            ResourceStatus::ErrorExtending => "errorExtending",
            ResourceStatus::Deleting => "deleting",
            ResourceStatus::ErrorDeleting => "errorDeleting",
            ResourceStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Replication lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplicationState {
    Creating,
    Enabled,
    Disabling,
    Disabled,
    Error,
}

impl ReplicationState {
    /// No replication sequence is running
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ReplicationState::Enabled | ReplicationState::Disabled | ReplicationState::Error
        )
    }
}

impl std::fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplicationState::Creating => "creating",
            ReplicationState::Enabled => "enabled",
            ReplicationState::Disabling => "disabling",
            ReplicationState::Disabled => "disabled",
            ReplicationState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Resources
// =============================================================================

/// A block volume record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeResource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Size in GiB
    pub size: u64,
    #[serde(default)]
    pub availability_zone: String,
    /// Empty until a pool has been bound at intake
    #[serde(default)]
    pub pool_id: String,
    /// Empty until a profile has been resolved at intake
    #[serde(default)]
    pub profile_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    pub status: ResourceStatus,
    /// Opaque backend key/value data
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VolumeResource {
    /// The volume never reached a backend and can be dropped from the ledger directly
    pub fn is_unbound(&self) -> bool {
        self.pool_id.is_empty() || self.profile_id.is_empty()
    }
}

/// Host the volume is attached to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub os_type: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub initiator: String,
}

/// A volume attachment record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentResource {
    pub id: String,
    pub volume_id: String,
    pub host_info: HostInfo,
    #[serde(default)]
    pub access_protocol: String,
    pub status: ResourceStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A volume snapshot record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub volume_id: String,
    /// Size in GiB
    pub size: u64,
    pub status: ResourceStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A cross-cluster replication record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationResource {
    pub id: String,
    pub primary_volume_id: String,
    pub secondary_volume_id: String,
    #[serde(default)]
    pub pool_id: String,
    #[serde(default)]
    pub profile_id: String,
    #[serde(default)]
    pub availability_zone: String,
    /// Connection facts reported for the primary cluster
    #[serde(default)]
    pub primary_side_data: BTreeMap<String, String>,
    /// Connection facts reported for the secondary cluster
    #[serde(default)]
    pub secondary_side_data: BTreeMap<String, String>,
    pub state: ReplicationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReplicationResource {
    /// `volume_id` is either side of this replication
    pub fn references(&self, volume_id: &str) -> bool {
        self.primary_volume_id == volume_id || self.secondary_volume_id == volume_id
    }
}

// =============================================================================
// Placement, Routing and Policy Records
// =============================================================================

/// A capacity-bearing allocation unit within a backend cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    pub id: String,
    pub name: String,
    pub dock_id: String,
    #[serde(default)]
    pub availability_zone: String,
    /// Total capacity in GiB
    pub total_capacity: u64,
    /// Free capacity in GiB
    pub free_capacity: u64,
}

/// Execution agent owning one or more pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockSpec {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub driver_name: String,
}

/// Named policy bundle applied to a resource at creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ProfileSpec {
    /// Serialized form carried in operation descriptors
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// Caller Context
// =============================================================================

/// Identity of the caller, serialized into every operation descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerContext {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub request_id: String,
}

impl CallerContext {
    /// Serialized form carried in operation descriptors
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

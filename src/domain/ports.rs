//! Domain Ports - Core trait definitions for the control plane
//!
//! These traits define the boundaries between the orchestration logic and
//! external systems: the persistence engine behind the ledger, the remote
//! execution agents, and the shell sessions used to drive replication peers.

use crate::domain::model::{
    AttachmentResource, DockSpec, PoolSpec, ProfileSpec, ReplicationResource, ResourceStatus,
    SnapshotResource, VolumeResource,
};
use crate::domain::options::{
    CreateVolumeAttachmentOpts, CreateVolumeOpts, CreateVolumeSnapshotOpts,
    DeleteVolumeAttachmentOpts, DeleteVolumeOpts, DeleteVolumeSnapshotOpts, ExecutorReply,
    ExtendVolumeOpts,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zeroize::Zeroizing;

// =============================================================================
// Ledger Port
// =============================================================================

/// Filter applied to ledger list queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    #[serde(default)]
    pub status: Option<ResourceStatus>,
    #[serde(default)]
    pub volume_id: Option<String>,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListFilter {
    /// Apply offset/limit to an already filtered listing
    pub fn paginate<T>(&self, items: Vec<T>) -> Vec<T> {
        let offset = self.offset.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        items.into_iter().skip(offset).take(limit).collect()
    }
}

/// Durable, queryable record of every resource and its status.
///
/// Implementations must offer read-your-writes consistency: a read issued
/// after a write returns has to observe that write.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create_volume(&self, volume: VolumeResource) -> Result<VolumeResource>;
    async fn get_volume(&self, id: &str) -> Result<VolumeResource>;
    async fn list_volumes(&self, filter: &ListFilter) -> Result<Vec<VolumeResource>>;
    async fn update_volume(&self, volume: VolumeResource) -> Result<VolumeResource>;
    async fn delete_volume(&self, id: &str) -> Result<()>;

    async fn create_attachment(&self, attachment: AttachmentResource)
        -> Result<AttachmentResource>;
    async fn get_attachment(&self, id: &str) -> Result<AttachmentResource>;
    async fn list_attachments(&self, filter: &ListFilter) -> Result<Vec<AttachmentResource>>;
    async fn update_attachment(&self, attachment: AttachmentResource)
        -> Result<AttachmentResource>;
    async fn delete_attachment(&self, id: &str) -> Result<()>;

    async fn create_snapshot(&self, snapshot: SnapshotResource) -> Result<SnapshotResource>;
    async fn get_snapshot(&self, id: &str) -> Result<SnapshotResource>;
    async fn list_snapshots(&self, filter: &ListFilter) -> Result<Vec<SnapshotResource>>;
    async fn update_snapshot(&self, snapshot: SnapshotResource) -> Result<SnapshotResource>;
    async fn delete_snapshot(&self, id: &str) -> Result<()>;

    async fn create_replication(
        &self,
        replication: ReplicationResource,
    ) -> Result<ReplicationResource>;
    async fn get_replication(&self, id: &str) -> Result<ReplicationResource>;
    async fn list_replications(&self) -> Result<Vec<ReplicationResource>>;
    async fn update_replication(
        &self,
        replication: ReplicationResource,
    ) -> Result<ReplicationResource>;
    async fn delete_replication(&self, id: &str) -> Result<()>;

    async fn get_pool(&self, id: &str) -> Result<PoolSpec>;
    async fn list_pools(&self) -> Result<Vec<PoolSpec>>;
    async fn get_dock(&self, id: &str) -> Result<DockSpec>;
    async fn get_dock_by_pool_id(&self, pool_id: &str) -> Result<DockSpec>;
    async fn get_default_profile(&self) -> Result<ProfileSpec>;
    async fn get_profile(&self, id: &str) -> Result<ProfileSpec>;
}

// =============================================================================
// Remote Executor Port
// =============================================================================

/// Which kind of remote service an executor client talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Execution agent owning the resource's pool
    Dock,
    /// Central controller mediating to the agent
    Controller,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Dock => write!(f, "dock"),
            ExecutorKind::Controller => write!(f, "controller"),
        }
    }
}

/// Connect/invoke/close client for a remote executor
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    /// Bind the client to an endpoint
    async fn connect(&mut self, endpoint: &str) -> Result<()>;

    /// Release the connection
    async fn close(&mut self) -> Result<()>;

    async fn create_volume(&self, opts: &CreateVolumeOpts) -> Result<ExecutorReply>;
    async fn extend_volume(&self, opts: &ExtendVolumeOpts) -> Result<ExecutorReply>;
    async fn delete_volume(&self, opts: &DeleteVolumeOpts) -> Result<ExecutorReply>;
    async fn create_volume_attachment(
        &self,
        opts: &CreateVolumeAttachmentOpts,
    ) -> Result<ExecutorReply>;
    async fn delete_volume_attachment(
        &self,
        opts: &DeleteVolumeAttachmentOpts,
    ) -> Result<ExecutorReply>;
    async fn create_volume_snapshot(&self, opts: &CreateVolumeSnapshotOpts)
        -> Result<ExecutorReply>;
    async fn delete_volume_snapshot(&self, opts: &DeleteVolumeSnapshotOpts)
        -> Result<ExecutorReply>;
}

/// Creates a fresh, unconnected client for every operation
pub trait ExecutorConnector: Send + Sync {
    fn new_client(&self, kind: ExecutorKind) -> Box<dyn ExecutorClient>;
}

// =============================================================================
// Remote Transport Port
// =============================================================================

/// Address and credentials of a replication peer host
#[derive(Clone)]
pub struct RemoteTarget {
    /// Label used in logs and reports ("primary" / "secondary")
    pub label: String,
    /// `host:port` to dial
    pub dial_addr: String,
    pub username: String,
    /// Decrypted password, wiped on drop
    pub password: Zeroizing<String>,
}

impl std::fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("label", &self.label)
            .field("dial_addr", &self.dial_addr)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Combined output of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }
}

/// An authenticated session to one host
#[async_trait]
pub trait RemoteSession: Send {
    /// Execute one command string. A non-zero exit is returned as output,
    /// not as an error; errors are reserved for the session itself failing.
    async fn exec(&mut self, command: &str) -> Result<CommandOutput>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens per-operation sessions to replication peers
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteSession>>;
}

// =============================================================================
// Credential Port
// =============================================================================

/// Turns a password stored at rest into plaintext right before use
pub trait PasswordDecrypter: Send + Sync {
    fn decrypt(&self, stored: &str) -> Result<Zeroizing<String>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type LedgerRef = Arc<dyn Ledger>;
pub type ExecutorConnectorRef = Arc<dyn ExecutorConnector>;
pub type RemoteTransportRef = Arc<dyn RemoteTransport>;
pub type PasswordDecrypterRef = Arc<dyn PasswordDecrypter>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_kind_display() {
        assert_eq!(format!("{}", ExecutorKind::Dock), "dock");
        assert_eq!(format!("{}", ExecutorKind::Controller), "controller");
    }

    #[test]
    fn test_paginate() {
        let filter = ListFilter {
            offset: Some(1),
            limit: Some(2),
            ..Default::default()
        };
        assert_eq!(filter.paginate(vec![1, 2, 3, 4]), vec![2, 3]);
        assert_eq!(ListFilter::default().paginate(vec![1, 2]), vec![1, 2]);
    }

    #[test]
    fn test_command_output_combined() {
        let out = CommandOutput {
            exit_code: Some(1),
            stdout: "partial\n".into(),
            stderr: "rbd: error\n".into(),
        };
        assert!(!out.is_success());
        assert_eq!(out.combined(), "partial\nrbd: error");
    }

    #[test]
    fn test_remote_target_redacts_password() {
        let target = RemoteTarget {
            label: "primary".into(),
            dial_addr: "10.0.0.1:22".into(),
            username: "root".into(),
            password: Zeroizing::new("hunter2".into()),
        };
        assert!(!format!("{:?}", target).contains("hunter2"));
    }
}

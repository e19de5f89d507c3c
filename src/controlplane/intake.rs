//! Request Intake - The "Front Door"
//!
//! Validates portal operations, writes the provisional ledger entry and
//! answers "accepted" before any remote work starts. Remote work runs as a
//! tracked background operation that records its own outcome in the ledger;
//! errors after acceptance are only visible through the ledger.

use crate::controlplane::dispatcher::{Dispatcher, ExecutorCall};
use crate::controlplane::rollback::{Feasibility, RollbackCoordinator};
use crate::controlplane::tasks::{OperationHandle, OperationOutcome, OperationRunner};
use crate::domain::model::*;
use crate::domain::options::*;
use crate::domain::ports::{LedgerRef, ListFilter};
use crate::error::{Error, Result};
use crate::ledger::ResourceLocks;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

// =============================================================================
// Requests
// =============================================================================

/// Body of a create volume request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub description: String,
    /// Size in GiB
    pub size: u64,
    pub availability_zone: String,
    pub profile_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Body of an extend volume request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendVolumeRequest {
    pub new_size: u64,
}

/// Descriptive fields of a volume that may be updated
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateVolumeRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Body of a create attachment request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateAttachmentRequest {
    pub volume_id: String,
    pub host_info: HostInfo,
    pub metadata: BTreeMap<String, String>,
}

/// Descriptive fields of an attachment that may be updated
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateAttachmentRequest {
    pub host_info: Option<HostInfo>,
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Body of a create snapshot request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateSnapshotRequest {
    pub name: String,
    pub description: String,
    pub volume_id: String,
    pub metadata: BTreeMap<String, String>,
}

/// Descriptive fields of a snapshot that may be updated
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateSnapshotRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Result of an accepted asynchronous operation
#[derive(Debug)]
pub struct Accepted<T> {
    /// Ledger entry as written at intake
    pub body: T,
    /// Background operation, absent when nothing remote was needed
    pub operation: Option<OperationHandle>,
}

impl<T> Accepted<T> {
    /// Wait for the background operation, if any
    pub async fn outcome(self) -> OperationOutcome {
        match self.operation {
            Some(handle) => handle.join().await,
            None => OperationOutcome::Completed,
        }
    }
}

fn check_transition(
    kind: ResourceKind,
    id: &str,
    from: ResourceStatus,
    to: ResourceStatus,
) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            kind: kind.to_string(),
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// =============================================================================
// Request Intake
// =============================================================================

/// Validates requests and hands remote work to the dispatcher
pub struct RequestIntake {
    ledger: LedgerRef,
    dispatcher: Arc<Dispatcher>,
    rollback: Arc<RollbackCoordinator>,
    locks: Arc<ResourceLocks>,
    runner: OperationRunner,
}

impl RequestIntake {
    /// Create a new request intake
    pub fn new(
        ledger: LedgerRef,
        dispatcher: Arc<Dispatcher>,
        locks: Arc<ResourceLocks>,
        runner: OperationRunner,
    ) -> Arc<Self> {
        let rollback = Arc::new(RollbackCoordinator::new(ledger.clone()));
        Arc::new(Self {
            ledger,
            dispatcher,
            rollback,
            locks,
            runner,
        })
    }

    pub fn ledger(&self) -> &LedgerRef {
        &self.ledger
    }

    pub fn runner(&self) -> &OperationRunner {
        &self.runner
    }

    /// Explicit profile id, or the cluster default
    async fn resolve_profile(&self, profile_id: Option<&str>) -> Result<ProfileSpec> {
        match profile_id.filter(|id| !id.is_empty()) {
            Some(id) => self
                .ledger
                .get_profile(id)
                .await
                .map_err(|e| Error::BadRequest(format!("get profile failed: {}", e))),
            None => self
                .ledger
                .get_default_profile()
                .await
                .map_err(|e| Error::BadRequest(format!("get default profile failed: {}", e))),
        }
    }

    /// First pool in the zone with enough free capacity
    async fn select_pool(&self, availability_zone: &str, size: u64) -> Result<PoolSpec> {
        self.ledger
            .list_pools()
            .await?
            .into_iter()
            .find(|pool| {
                (availability_zone.is_empty() || pool.availability_zone == availability_zone)
                    && pool.free_capacity >= size
            })
            .ok_or_else(|| {
                Error::BadRequest(format!(
                    "no pool in zone '{}' has {} GiB free",
                    availability_zone, size
                ))
            })
    }

    /// Parent volume of an attachment or snapshot, which must be Available
    async fn available_parent(&self, volume_id: &str) -> Result<VolumeResource> {
        if volume_id.is_empty() {
            return Err(Error::BadRequest("volumeId is required".into()));
        }
        let volume = self
            .ledger
            .get_volume(volume_id)
            .await
            .map_err(|e| Error::BadRequest(format!("parent volume: {}", e)))?;
        if volume.status != ResourceStatus::Available {
            return Err(Error::BadRequest(format!(
                "volume {} is {}, expected available",
                volume_id, volume.status
            )));
        }
        Ok(volume)
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    pub async fn create_volume(
        &self,
        ctx: &CallerContext,
        req: CreateVolumeRequest,
    ) -> Result<Accepted<VolumeResource>> {
        if req.name.trim().is_empty() {
            return Err(Error::BadRequest("volume name is required".into()));
        }
        if req.size == 0 {
            return Err(Error::BadRequest("volume size must be positive".into()));
        }
        if let Some(snapshot_id) = req.snapshot_id.as_deref().filter(|s| !s.is_empty()) {
            let snapshot = self
                .ledger
                .get_snapshot(snapshot_id)
                .await
                .map_err(|e| Error::BadRequest(format!("source snapshot: {}", e)))?;
            if snapshot.status != ResourceStatus::Available {
                return Err(Error::BadRequest(format!(
                    "snapshot {} is {}, expected available",
                    snapshot_id, snapshot.status
                )));
            }
            if req.size < snapshot.size {
                return Err(Error::BadRequest(format!(
                    "size {} is smaller than snapshot {} ({})",
                    req.size, snapshot_id, snapshot.size
                )));
            }
        }

        let profile = self.resolve_profile(req.profile_id.as_deref()).await?;
        let pool = self.select_pool(&req.availability_zone, req.size).await?;

        let now = Utc::now();
        let volume = VolumeResource {
            id: new_id(),
            name: req.name,
            description: req.description,
            size: req.size,
            availability_zone: pool.availability_zone.clone(),
            pool_id: pool.id.clone(),
            profile_id: profile.id.clone(),
            snapshot_id: req.snapshot_id.filter(|s| !s.is_empty()),
            status: ResourceStatus::Creating,
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
        };
        let opts = CreateVolumeOpts {
            id: volume.id.clone(),
            name: volume.name.clone(),
            description: volume.description.clone(),
            size: volume.size,
            availability_zone: volume.availability_zone.clone(),
            profile_id: profile.id.clone(),
            profile: profile.to_json()?,
            pool_id: pool.id.clone(),
            snapshot_id: volume.snapshot_id.clone(),
            metadata: volume.metadata.clone(),
            context: ctx.to_json()?,
            ..Default::default()
        };

        let guard = self
            .locks
            .try_acquire(ResourceKind::Volume, &volume.id, "create_volume")?;
        let volume = self.ledger.create_volume(volume).await?;
        info!(
            "Accepted create of volume {} ({} GiB) in pool {}",
            volume.id, volume.size, volume.pool_id
        );

        let ledger = self.ledger.clone();
        let dispatcher = self.dispatcher.clone();
        let id = volume.id.clone();
        let handle = self.runner.spawn("create_volume", guard, async move {
            let result = dispatcher
                .dispatch(&opts.pool_id.clone(), ExecutorCall::CreateVolume(opts))
                .await;
            record_volume(&ledger, &id, result, ResourceStatus::ErrorCreating, None).await
        });

        Ok(Accepted {
            body: volume,
            operation: Some(handle),
        })
    }

    pub async fn get_volume(&self, id: &str) -> Result<VolumeResource> {
        self.ledger.get_volume(id).await
    }

    pub async fn list_volumes(&self, filter: &ListFilter) -> Result<Vec<VolumeResource>> {
        self.ledger.list_volumes(filter).await
    }

    /// Change descriptive fields only
    pub async fn update_volume(
        &self,
        id: &str,
        req: UpdateVolumeRequest,
    ) -> Result<VolumeResource> {
        let _guard = self
            .locks
            .try_acquire(ResourceKind::Volume, id, "update_volume")?;
        let mut volume = self.ledger.get_volume(id).await?;
        if let Some(name) = req.name {
            if name.trim().is_empty() {
                return Err(Error::BadRequest("volume name must not be empty".into()));
            }
            volume.name = name;
        }
        if let Some(description) = req.description {
            volume.description = description;
        }
        if let Some(metadata) = req.metadata {
            volume.metadata = metadata;
        }
        self.ledger.update_volume(volume).await
    }

    pub async fn extend_volume(
        &self,
        ctx: &CallerContext,
        id: &str,
        req: ExtendVolumeRequest,
    ) -> Result<Accepted<VolumeResource>> {
        let guard = self
            .locks
            .try_acquire(ResourceKind::Volume, id, "extend_volume")?;
        let mut volume = self.ledger.get_volume(id).await?;
        check_transition(ResourceKind::Volume, id, volume.status, ResourceStatus::Extending)?;
        if req.new_size <= volume.size {
            return Err(Error::BadRequest(format!(
                "new size {} must be larger than current size {}",
                req.new_size, volume.size
            )));
        }
        let context = ctx.to_json()?;

        volume.status = ResourceStatus::Extending;
        let volume = self.ledger.update_volume(volume).await?;
        info!(
            "Accepted extend of volume {} from {} to {} GiB",
            id, volume.size, req.new_size
        );

        let ledger = self.ledger.clone();
        let dispatcher = self.dispatcher.clone();
        let rollback = self.rollback.clone();
        let snapshot = volume.clone();
        let new_size = req.new_size;
        let handle = self.runner.spawn("extend_volume", guard, async move {
            if let Feasibility::Infeasible { reason } =
                rollback.check_extend(&snapshot, new_size).await
            {
                return match rollback.revert(&snapshot.id, ResourceStatus::Available).await {
                    Ok(_) => OperationOutcome::RolledBack { reason },
                    Err(e) => {
                        error!("Rollback of volume {} failed: {}", snapshot.id, e);
                        OperationOutcome::Failed {
                            reason: format!("{}; rollback failed: {}", reason, e),
                        }
                    }
                };
            }

            let opts = ExtendVolumeOpts {
                id: snapshot.id.clone(),
                size: new_size,
                pool_id: snapshot.pool_id.clone(),
                metadata: snapshot.metadata.clone(),
                context,
                ..Default::default()
            };
            let result = dispatcher
                .dispatch(&snapshot.pool_id, ExecutorCall::ExtendVolume(opts))
                .await;
            record_volume(
                &ledger,
                &snapshot.id,
                result,
                ResourceStatus::ErrorExtending,
                Some(new_size),
            )
            .await
        });

        Ok(Accepted {
            body: volume,
            operation: Some(handle),
        })
    }

    pub async fn delete_volume(
        &self,
        ctx: &CallerContext,
        id: &str,
    ) -> Result<Accepted<VolumeResource>> {
        let guard = self
            .locks
            .try_acquire(ResourceKind::Volume, id, "delete_volume")?;
        let mut volume = self.ledger.get_volume(id).await?;
        let replicated = self
            .ledger
            .list_replications()
            .await?
            .into_iter()
            .any(|r| r.references(id));
        if replicated {
            return Err(Error::BadRequest(format!(
                "volume {} is part of a replication",
                id
            )));
        }

        // never reached a backend, nothing remote to clean up
        if volume.is_unbound() {
            self.ledger.delete_volume(id).await?;
            info!("Deleted unbound volume {} from the ledger", id);
            return Ok(Accepted {
                body: volume,
                operation: None,
            });
        }

        check_transition(ResourceKind::Volume, id, volume.status, ResourceStatus::Deleting)?;
        let by_volume = ListFilter {
            volume_id: Some(id.to_string()),
            ..Default::default()
        };
        if !self.ledger.list_attachments(&by_volume).await?.is_empty() {
            return Err(Error::BadRequest(format!(
                "volume {} still has attachments",
                id
            )));
        }
        if !self.ledger.list_snapshots(&by_volume).await?.is_empty() {
            return Err(Error::BadRequest(format!("volume {} still has snapshots", id)));
        }
        let profile = self
            .ledger
            .get_profile(&volume.profile_id)
            .await
            .map_err(|e| Error::Internal(format!("delete volume failed: {}", e)))?;

        let opts = DeleteVolumeOpts {
            id: volume.id.clone(),
            profile_id: profile.id.clone(),
            profile: profile.to_json()?,
            pool_id: volume.pool_id.clone(),
            metadata: volume.metadata.clone(),
            context: ctx.to_json()?,
            ..Default::default()
        };

        volume.status = ResourceStatus::Deleting;
        let volume = self.ledger.update_volume(volume).await?;
        info!("Accepted delete of volume {}", id);

        let ledger = self.ledger.clone();
        let dispatcher = self.dispatcher.clone();
        let id = id.to_string();
        let handle = self.runner.spawn("delete_volume", guard, async move {
            let result = dispatcher
                .dispatch(&opts.pool_id.clone(), ExecutorCall::DeleteVolume(opts))
                .await;
            match result {
                Ok(_) => removed(ledger.delete_volume(&id).await),
                Err(e) => {
                    let reason = e.to_string();
                    mark_volume(&ledger, &id, ResourceStatus::ErrorDeleting).await;
                    OperationOutcome::Failed { reason }
                }
            }
        });

        Ok(Accepted {
            body: volume,
            operation: Some(handle),
        })
    }

    // =========================================================================
    // Attachments
    // =========================================================================

    pub async fn create_attachment(
        &self,
        ctx: &CallerContext,
        req: CreateAttachmentRequest,
    ) -> Result<Accepted<AttachmentResource>> {
        let _parent = self.locks.try_acquire(
            ResourceKind::Volume,
            &req.volume_id,
            "create_volume_attachment",
        )?;
        let volume = self.available_parent(&req.volume_id).await?;

        let now = Utc::now();
        let attachment = AttachmentResource {
            id: new_id(),
            volume_id: volume.id.clone(),
            host_info: req.host_info,
            access_protocol: String::new(),
            status: ResourceStatus::Creating,
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
        };
        let opts = CreateVolumeAttachmentOpts {
            id: attachment.id.clone(),
            volume_id: volume.id.clone(),
            pool_id: volume.pool_id.clone(),
            host_info: attachment.host_info.clone(),
            metadata: attachment.metadata.clone(),
            context: ctx.to_json()?,
            ..Default::default()
        };

        let guard = self.locks.try_acquire(
            ResourceKind::Attachment,
            &attachment.id,
            "create_volume_attachment",
        )?;
        let attachment = self.ledger.create_attachment(attachment).await?;
        info!(
            "Accepted attachment {} of volume {}",
            attachment.id, volume.id
        );

        let ledger = self.ledger.clone();
        let dispatcher = self.dispatcher.clone();
        let id = attachment.id.clone();
        let handle = self
            .runner
            .spawn("create_volume_attachment", guard, async move {
                let result = dispatcher
                    .dispatch(
                        &opts.pool_id.clone(),
                        ExecutorCall::CreateVolumeAttachment(opts),
                    )
                    .await;
                record_attachment(&ledger, &id, result).await
            });

        Ok(Accepted {
            body: attachment,
            operation: Some(handle),
        })
    }

    pub async fn get_attachment(&self, id: &str) -> Result<AttachmentResource> {
        self.ledger.get_attachment(id).await
    }

    pub async fn list_attachments(&self, filter: &ListFilter) -> Result<Vec<AttachmentResource>> {
        self.ledger.list_attachments(filter).await
    }

    pub async fn update_attachment(
        &self,
        id: &str,
        req: UpdateAttachmentRequest,
    ) -> Result<AttachmentResource> {
        let _guard =
            self.locks
                .try_acquire(ResourceKind::Attachment, id, "update_volume_attachment")?;
        let mut attachment = self.ledger.get_attachment(id).await?;
        if let Some(host_info) = req.host_info {
            attachment.host_info = host_info;
        }
        if let Some(metadata) = req.metadata {
            attachment.metadata = metadata;
        }
        self.ledger.update_attachment(attachment).await
    }

    pub async fn delete_attachment(
        &self,
        ctx: &CallerContext,
        id: &str,
    ) -> Result<Accepted<AttachmentResource>> {
        let guard =
            self.locks
                .try_acquire(ResourceKind::Attachment, id, "delete_volume_attachment")?;
        let mut attachment = self.ledger.get_attachment(id).await?;
        check_transition(
            ResourceKind::Attachment,
            id,
            attachment.status,
            ResourceStatus::Deleting,
        )?;
        let volume = self.ledger.get_volume(&attachment.volume_id).await?;

        let opts = DeleteVolumeAttachmentOpts {
            id: attachment.id.clone(),
            volume_id: volume.id.clone(),
            pool_id: volume.pool_id.clone(),
            access_protocol: attachment.access_protocol.clone(),
            host_info: attachment.host_info.clone(),
            metadata: attachment.metadata.clone(),
            context: ctx.to_json()?,
            ..Default::default()
        };

        attachment.status = ResourceStatus::Deleting;
        let attachment = self.ledger.update_attachment(attachment).await?;
        info!("Accepted delete of attachment {}", id);

        let ledger = self.ledger.clone();
        let dispatcher = self.dispatcher.clone();
        let id = id.to_string();
        let handle = self
            .runner
            .spawn("delete_volume_attachment", guard, async move {
                let result = dispatcher
                    .dispatch(
                        &opts.pool_id.clone(),
                        ExecutorCall::DeleteVolumeAttachment(opts),
                    )
                    .await;
                match result {
                    Ok(_) => removed(ledger.delete_attachment(&id).await),
                    Err(e) => {
                        let reason = e.to_string();
                        if let Err(e) =
                            set_attachment_status(&ledger, &id, ResourceStatus::ErrorDeleting)
                                .await
                        {
                            error!("Failed to record error status of attachment {}: {}", id, e);
                        }
                        OperationOutcome::Failed { reason }
                    }
                }
            });

        Ok(Accepted {
            body: attachment,
            operation: Some(handle),
        })
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub async fn create_snapshot(
        &self,
        ctx: &CallerContext,
        req: CreateSnapshotRequest,
    ) -> Result<Accepted<SnapshotResource>> {
        if req.name.trim().is_empty() {
            return Err(Error::BadRequest("snapshot name is required".into()));
        }
        let _parent = self.locks.try_acquire(
            ResourceKind::Volume,
            &req.volume_id,
            "create_volume_snapshot",
        )?;
        let volume = self.available_parent(&req.volume_id).await?;

        let now = Utc::now();
        let snapshot = SnapshotResource {
            id: new_id(),
            name: req.name,
            description: req.description,
            volume_id: volume.id.clone(),
            size: volume.size,
            status: ResourceStatus::Creating,
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
        };
        let opts = CreateVolumeSnapshotOpts {
            id: snapshot.id.clone(),
            name: snapshot.name.clone(),
            description: snapshot.description.clone(),
            volume_id: volume.id.clone(),
            pool_id: volume.pool_id.clone(),
            size: snapshot.size,
            metadata: snapshot.metadata.clone(),
            context: ctx.to_json()?,
            ..Default::default()
        };

        let guard = self.locks.try_acquire(
            ResourceKind::Snapshot,
            &snapshot.id,
            "create_volume_snapshot",
        )?;
        let snapshot = self.ledger.create_snapshot(snapshot).await?;
        info!(
            "Accepted snapshot {} of volume {}",
            snapshot.id, volume.id
        );

        let ledger = self.ledger.clone();
        let dispatcher = self.dispatcher.clone();
        let id = snapshot.id.clone();
        let handle = self
            .runner
            .spawn("create_volume_snapshot", guard, async move {
                let result = dispatcher
                    .dispatch(
                        &opts.pool_id.clone(),
                        ExecutorCall::CreateVolumeSnapshot(opts),
                    )
                    .await;
                record_snapshot(&ledger, &id, result).await
            });

        Ok(Accepted {
            body: snapshot,
            operation: Some(handle),
        })
    }

    pub async fn get_snapshot(&self, id: &str) -> Result<SnapshotResource> {
        self.ledger.get_snapshot(id).await
    }

    pub async fn list_snapshots(&self, filter: &ListFilter) -> Result<Vec<SnapshotResource>> {
        self.ledger.list_snapshots(filter).await
    }

    pub async fn update_snapshot(
        &self,
        id: &str,
        req: UpdateSnapshotRequest,
    ) -> Result<SnapshotResource> {
        let _guard = self
            .locks
            .try_acquire(ResourceKind::Snapshot, id, "update_volume_snapshot")?;
        let mut snapshot = self.ledger.get_snapshot(id).await?;
        if let Some(name) = req.name {
            if name.trim().is_empty() {
                return Err(Error::BadRequest("snapshot name must not be empty".into()));
            }
            snapshot.name = name;
        }
        if let Some(description) = req.description {
            snapshot.description = description;
        }
        if let Some(metadata) = req.metadata {
            snapshot.metadata = metadata;
        }
        self.ledger.update_snapshot(snapshot).await
    }

    pub async fn delete_snapshot(
        &self,
        ctx: &CallerContext,
        id: &str,
    ) -> Result<Accepted<SnapshotResource>> {
        let guard = self
            .locks
            .try_acquire(ResourceKind::Snapshot, id, "delete_volume_snapshot")?;
        let mut snapshot = self.ledger.get_snapshot(id).await?;
        check_transition(
            ResourceKind::Snapshot,
            id,
            snapshot.status,
            ResourceStatus::Deleting,
        )?;
        let volume = self.ledger.get_volume(&snapshot.volume_id).await?;

        let opts = DeleteVolumeSnapshotOpts {
            id: snapshot.id.clone(),
            volume_id: volume.id.clone(),
            pool_id: volume.pool_id.clone(),
            metadata: snapshot.metadata.clone(),
            context: ctx.to_json()?,
            ..Default::default()
        };

        snapshot.status = ResourceStatus::Deleting;
        let snapshot = self.ledger.update_snapshot(snapshot).await?;
        info!("Accepted delete of snapshot {}", id);

        let ledger = self.ledger.clone();
        let dispatcher = self.dispatcher.clone();
        let id = id.to_string();
        let handle = self
            .runner
            .spawn("delete_volume_snapshot", guard, async move {
                let result = dispatcher
                    .dispatch(
                        &opts.pool_id.clone(),
                        ExecutorCall::DeleteVolumeSnapshot(opts),
                    )
                    .await;
                match result {
                    Ok(_) => removed(ledger.delete_snapshot(&id).await),
                    Err(e) => {
                        let reason = e.to_string();
                        if let Err(e) = set_snapshot_status(
                            &ledger,
                            &id,
                            ResourceStatus::ErrorDeleting,
                            None,
                        )
                        .await
                        {
                            error!("Failed to record error status of snapshot {}: {}", id, e);
                        }
                        OperationOutcome::Failed { reason }
                    }
                }
            });

        Ok(Accepted {
            body: snapshot,
            operation: Some(handle),
        })
    }
}

// =============================================================================
// Completion Recording
// =============================================================================

fn removed(result: Result<()>) -> OperationOutcome {
    match result {
        Ok(()) => OperationOutcome::Completed,
        Err(e) => OperationOutcome::Failed {
            reason: format!("remote delete succeeded but ledger removal failed: {}", e),
        },
    }
}

async fn mark_volume(ledger: &LedgerRef, id: &str, status: ResourceStatus) {
    let result = async {
        let mut volume = ledger.get_volume(id).await?;
        volume.status = status;
        ledger.update_volume(volume).await
    }
    .await;
    if let Err(e) = result {
        error!("Failed to record status {} of volume {}: {}", status, id, e);
    }
}

/// Record the result of a create/extend dispatch on a volume
async fn record_volume(
    ledger: &LedgerRef,
    id: &str,
    result: Result<ExecutorReply>,
    failed: ResourceStatus,
    new_size: Option<u64>,
) -> OperationOutcome {
    match result {
        Ok(reply) => {
            let updated = async {
                let mut volume = ledger.get_volume(id).await?;
                volume.status = ResourceStatus::Available;
                if let Some(size) = new_size {
                    volume.size = size;
                }
                volume.metadata.extend(reply.metadata);
                ledger.update_volume(volume).await
            }
            .await;
            match updated {
                Ok(_) => OperationOutcome::Completed,
                Err(e) => {
                    error!("Failed to record completion of volume {}: {}", id, e);
                    OperationOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            }
        }
        Err(e) => {
            let reason = e.to_string();
            mark_volume(ledger, id, failed).await;
            OperationOutcome::Failed { reason }
        }
    }
}

async fn set_attachment_status(
    ledger: &LedgerRef,
    id: &str,
    status: ResourceStatus,
) -> Result<AttachmentResource> {
    let mut attachment = ledger.get_attachment(id).await?;
    attachment.status = status;
    ledger.update_attachment(attachment).await
}

async fn record_attachment(
    ledger: &LedgerRef,
    id: &str,
    result: Result<ExecutorReply>,
) -> OperationOutcome {
    match result {
        Ok(reply) => {
            let updated = async {
                let mut attachment = ledger.get_attachment(id).await?;
                attachment.status = ResourceStatus::Available;
                if let Some(protocol) = reply.metadata.get("accessProtocol") {
                    attachment.access_protocol = protocol.clone();
                }
                attachment.metadata.extend(reply.metadata);
                ledger.update_attachment(attachment).await
            }
            .await;
            match updated {
                Ok(_) => OperationOutcome::Completed,
                Err(e) => OperationOutcome::Failed {
                    reason: e.to_string(),
                },
            }
        }
        Err(e) => {
            let reason = e.to_string();
            if let Err(e) = set_attachment_status(ledger, id, ResourceStatus::ErrorCreating).await {
                error!("Failed to record error status of attachment {}: {}", id, e);
            }
            OperationOutcome::Failed { reason }
        }
    }
}

async fn set_snapshot_status(
    ledger: &LedgerRef,
    id: &str,
    status: ResourceStatus,
    metadata: Option<BTreeMap<String, String>>,
) -> Result<SnapshotResource> {
    let mut snapshot = ledger.get_snapshot(id).await?;
    snapshot.status = status;
    if let Some(metadata) = metadata {
        snapshot.metadata.extend(metadata);
    }
    ledger.update_snapshot(snapshot).await
}

async fn record_snapshot(
    ledger: &LedgerRef,
    id: &str,
    result: Result<ExecutorReply>,
) -> OperationOutcome {
    match result {
        Ok(reply) => {
            match set_snapshot_status(ledger, id, ResourceStatus::Available, Some(reply.metadata))
                .await
            {
                Ok(_) => OperationOutcome::Completed,
                Err(e) => OperationOutcome::Failed {
                    reason: e.to_string(),
                },
            }
        }
        Err(e) => {
            let reason = e.to_string();
            if let Err(e) =
                set_snapshot_status(ledger, id, ResourceStatus::ErrorCreating, None).await
            {
                error!("Failed to record error status of snapshot {}: {}", id, e);
            }
            OperationOutcome::Failed { reason }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::dispatcher::RoutingConfig;
    use crate::domain::ports::Ledger;
    use crate::error::ErrorKind;
    use crate::ledger::InMemoryLedger;
    use crate::testing::{seeded_ledger, MockConnector};
    use assert_matches::assert_matches;

    struct Harness {
        ledger: Arc<InMemoryLedger>,
        connector: Arc<MockConnector>,
        intake: Arc<RequestIntake>,
    }

    fn harness_with(connector: Arc<MockConnector>) -> Harness {
        let ledger = seeded_ledger();
        let dispatcher = Arc::new(Dispatcher::new(
            ledger.clone(),
            connector.clone(),
            RoutingConfig::default(),
        ));
        let intake = RequestIntake::new(
            ledger.clone(),
            dispatcher,
            ResourceLocks::new(),
            OperationRunner::new(),
        );
        Harness {
            ledger,
            connector,
            intake,
        }
    }

    fn harness() -> Harness {
        harness_with(MockConnector::new())
    }

    fn ctx() -> CallerContext {
        CallerContext {
            user_id: "u1".into(),
            tenant_id: "t1".into(),
            ..Default::default()
        }
    }

    fn create_req(size: u64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: "data".into(),
            size,
            ..Default::default()
        }
    }

    /// Volume written straight into the ledger
    async fn seed_volume(ledger: &InMemoryLedger, id: &str, size: u64, status: ResourceStatus) {
        let now = Utc::now();
        ledger
            .create_volume(VolumeResource {
                id: id.into(),
                name: id.into(),
                description: String::new(),
                size,
                availability_zone: "default".into(),
                pool_id: "pool-1".into(),
                profile_id: "profile-default".into(),
                snapshot_id: None,
                status,
                metadata: BTreeMap::new(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_is_recorded_before_dispatch_completes() {
        let h = harness_with(MockConnector::gated());
        let accepted = h.intake.create_volume(&ctx(), create_req(5)).await.unwrap();

        assert_eq!(accepted.body.status, ResourceStatus::Creating);
        let stored = h.ledger.get_volume(&accepted.body.id).await.unwrap();
        assert_eq!(stored.status, ResourceStatus::Creating);
        assert!(h.connector.calls().is_empty());

        h.connector.release(1);
        let id = accepted.body.id.clone();
        assert_eq!(accepted.outcome().await, OperationOutcome::Completed);
        assert_eq!(
            h.ledger.get_volume(&id).await.unwrap().status,
            ResourceStatus::Available
        );
    }

    #[tokio::test]
    async fn test_create_carries_context_and_profile() {
        let h = harness();
        h.connector.reply_with("lun", "7");
        let accepted = h.intake.create_volume(&ctx(), create_req(5)).await.unwrap();
        let id = accepted.body.id.clone();
        accepted.outcome().await;

        let call = &h.connector.calls_for("create_volume")[0];
        assert_eq!(call.payload["poolId"], "pool-1");
        assert!(call.payload["context"].as_str().unwrap().contains("\"userId\":\"u1\""));
        assert!(call.payload["profile"].as_str().unwrap().contains("profile-default"));
        assert_eq!(h.ledger.get_volume(&id).await.unwrap().metadata["lun"], "7");
    }

    #[tokio::test]
    async fn test_create_validation_happens_before_ledger_write() {
        let h = harness();
        let err = h.intake.create_volume(&ctx(), create_req(0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let mut req = create_req(1);
        req.profile_id = Some("missing".into());
        let err = h.intake.create_volume(&ctx(), req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        // no pool has 500 GiB free
        let err = h.intake.create_volume(&ctx(), create_req(500)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        assert!(h
            .ledger
            .list_volumes(&ListFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_create_selects_pool_in_zone() {
        let h = harness();
        let mut req = create_req(5);
        req.availability_zone = "az-2".into();
        let accepted = h.intake.create_volume(&ctx(), req).await.unwrap();
        assert_eq!(accepted.body.pool_id, "pool-2");
    }

    #[tokio::test]
    async fn test_create_failure_records_error_status() {
        let h = harness();
        h.connector.fail("create_volume");
        let accepted = h.intake.create_volume(&ctx(), create_req(5)).await.unwrap();
        let id = accepted.body.id.clone();

        assert_matches!(accepted.outcome().await, OperationOutcome::Failed { .. });
        assert_eq!(
            h.ledger.get_volume(&id).await.unwrap().status,
            ResourceStatus::ErrorCreating
        );
    }

    #[tokio::test]
    async fn test_extend_beyond_free_capacity_rolls_back() {
        let h = harness();
        seed_volume(&h.ledger, "vol-1", 10, ResourceStatus::Available).await;

        // pool-1 has 50 GiB free, this asks for 51 more
        let accepted = h
            .intake
            .extend_volume(&ctx(), "vol-1", ExtendVolumeRequest { new_size: 61 })
            .await
            .unwrap();
        assert_eq!(accepted.body.status, ResourceStatus::Extending);

        assert_matches!(accepted.outcome().await, OperationOutcome::RolledBack { .. });
        let volume = h.ledger.get_volume("vol-1").await.unwrap();
        assert_eq!(volume.status, ResourceStatus::Available);
        assert_eq!(volume.size, 10);
        assert!(h.connector.calls().is_empty());
    }

    #[tokio::test]
    async fn test_extend_within_capacity_dispatches_once() {
        let h = harness();
        seed_volume(&h.ledger, "vol-1", 10, ResourceStatus::Available).await;

        let accepted = h
            .intake
            .extend_volume(&ctx(), "vol-1", ExtendVolumeRequest { new_size: 60 })
            .await
            .unwrap();
        assert_eq!(accepted.outcome().await, OperationOutcome::Completed);

        let calls = h.connector.calls_for("extend_volume");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].payload["size"], 60);
        let volume = h.ledger.get_volume("vol-1").await.unwrap();
        assert_eq!(volume.size, 60);
        assert_eq!(volume.status, ResourceStatus::Available);
    }

    #[tokio::test]
    async fn test_extend_failure_is_not_rolled_back() {
        let h = harness();
        h.connector.fail("extend_volume");
        seed_volume(&h.ledger, "vol-1", 10, ResourceStatus::Available).await;

        let accepted = h
            .intake
            .extend_volume(&ctx(), "vol-1", ExtendVolumeRequest { new_size: 20 })
            .await
            .unwrap();
        assert_matches!(accepted.outcome().await, OperationOutcome::Failed { .. });
        let volume = h.ledger.get_volume("vol-1").await.unwrap();
        assert_eq!(volume.status, ResourceStatus::ErrorExtending);
        assert_eq!(volume.size, 10);
    }

    #[tokio::test]
    async fn test_extend_validation() {
        let h = harness();
        seed_volume(&h.ledger, "vol-1", 10, ResourceStatus::Available).await;
        seed_volume(&h.ledger, "vol-2", 10, ResourceStatus::Creating).await;

        let err = h
            .intake
            .extend_volume(&ctx(), "missing", ExtendVolumeRequest { new_size: 20 })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = h
            .intake
            .extend_volume(&ctx(), "vol-1", ExtendVolumeRequest { new_size: 10 })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let err = h
            .intake
            .extend_volume(&ctx(), "vol-2", ExtendVolumeRequest { new_size: 20 })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_concurrent_extends_conflict() {
        let h = harness_with(MockConnector::gated());
        seed_volume(&h.ledger, "vol-1", 10, ResourceStatus::Available).await;

        let ctx = ctx();
        let (first, second) = tokio::join!(
            h.intake
                .extend_volume(&ctx, "vol-1", ExtendVolumeRequest { new_size: 20 }),
            h.intake
                .extend_volume(&ctx, "vol-1", ExtendVolumeRequest { new_size: 30 }),
        );
        let (winner, loser) = match (first, second) {
            (Ok(accepted), Err(e)) | (Err(e), Ok(accepted)) => (accepted, e),
            other => panic!("expected exactly one winner, got {:?}", other),
        };
        assert_eq!(loser.kind(), ErrorKind::Conflict);

        h.connector.release(1);
        assert_eq!(winner.outcome().await, OperationOutcome::Completed);
        assert_eq!(h.connector.calls_for("extend_volume").len(), 1);
    }

    #[tokio::test]
    async fn test_delete_unbound_volume_skips_dispatch() {
        let h = harness();
        let now = Utc::now();
        h.ledger
            .create_volume(VolumeResource {
                id: "vol-x".into(),
                name: "orphan".into(),
                description: String::new(),
                size: 1,
                availability_zone: String::new(),
                pool_id: String::new(),
                profile_id: String::new(),
                snapshot_id: None,
                status: ResourceStatus::ErrorCreating,
                metadata: BTreeMap::new(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let accepted = h.intake.delete_volume(&ctx(), "vol-x").await.unwrap();
        assert!(accepted.operation.is_none());
        assert_matches!(h.ledger.get_volume("vol-x").await, Err(Error::NotFound { .. }));
        assert!(h.connector.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_volume_removes_entry() {
        let h = harness();
        seed_volume(&h.ledger, "vol-1", 10, ResourceStatus::Available).await;

        let accepted = h.intake.delete_volume(&ctx(), "vol-1").await.unwrap();
        assert_eq!(accepted.body.status, ResourceStatus::Deleting);
        assert_eq!(accepted.outcome().await, OperationOutcome::Completed);
        assert_matches!(h.ledger.get_volume("vol-1").await, Err(Error::NotFound { .. }));
        assert_eq!(h.connector.calls_for("delete_volume").len(), 1);
    }

    #[tokio::test]
    async fn test_delete_refused_with_dependents() {
        let h = harness();
        seed_volume(&h.ledger, "vol-1", 10, ResourceStatus::Available).await;
        let snap = h
            .intake
            .create_snapshot(
                &ctx(),
                CreateSnapshotRequest {
                    name: "s1".into(),
                    volume_id: "vol-1".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        snap.outcome().await;

        let err = h.intake.delete_volume(&ctx(), "vol-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(
            h.ledger.get_volume("vol-1").await.unwrap().status,
            ResourceStatus::Available
        );
    }

    #[tokio::test]
    async fn test_delete_refused_while_replicated() {
        let h = harness();
        seed_volume(&h.ledger, "vol-1", 10, ResourceStatus::Available).await;
        let now = Utc::now();
        h.ledger
            .create_replication(ReplicationResource {
                id: "rep-1".into(),
                primary_volume_id: "vol-9".into(),
                secondary_volume_id: "vol-1".into(),
                pool_id: "pool-1".into(),
                profile_id: "profile-default".into(),
                availability_zone: "default".into(),
                primary_side_data: BTreeMap::new(),
                secondary_side_data: BTreeMap::new(),
                state: ReplicationState::Enabled,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let err = h.intake.delete_volume(&ctx(), "vol-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(h.connector.calls().is_empty());
        assert_eq!(
            h.ledger.get_volume("vol-1").await.unwrap().status,
            ResourceStatus::Available
        );
    }

    #[tokio::test]
    async fn test_delete_failure_records_error_deleting() {
        let h = harness();
        h.connector.fail("delete_volume");
        seed_volume(&h.ledger, "vol-1", 10, ResourceStatus::Available).await;

        let accepted = h.intake.delete_volume(&ctx(), "vol-1").await.unwrap();
        accepted.outcome().await;
        assert_eq!(
            h.ledger.get_volume("vol-1").await.unwrap().status,
            ResourceStatus::ErrorDeleting
        );
    }

    #[tokio::test]
    async fn test_attachment_lifecycle() {
        let h = harness();
        h.connector.reply_with("accessProtocol", "iscsi");
        seed_volume(&h.ledger, "vol-1", 10, ResourceStatus::Available).await;

        let accepted = h
            .intake
            .create_attachment(
                &ctx(),
                CreateAttachmentRequest {
                    volume_id: "vol-1".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let id = accepted.body.id.clone();
        assert_eq!(accepted.outcome().await, OperationOutcome::Completed);

        let attachment = h.ledger.get_attachment(&id).await.unwrap();
        assert_eq!(attachment.status, ResourceStatus::Available);
        assert_eq!(attachment.access_protocol, "iscsi");

        let accepted = h.intake.delete_attachment(&ctx(), &id).await.unwrap();
        assert_eq!(accepted.outcome().await, OperationOutcome::Completed);
        assert!(h.ledger.get_attachment(&id).await.is_err());

        let call = &h.connector.calls_for("delete_volume_attachment")[0];
        assert_eq!(call.payload["accessProtocol"], "iscsi");
    }

    #[tokio::test]
    async fn test_attachment_requires_available_parent() {
        let h = harness();
        seed_volume(&h.ledger, "vol-1", 10, ResourceStatus::Extending).await;

        for volume_id in ["vol-1", "missing"] {
            let err = h
                .intake
                .create_attachment(
                    &ctx(),
                    CreateAttachmentRequest {
                        volume_id: volume_id.into(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::BadRequest);
        }
    }

    #[tokio::test]
    async fn test_snapshot_takes_volume_size() {
        let h = harness();
        seed_volume(&h.ledger, "vol-1", 12, ResourceStatus::Available).await;
        let accepted = h
            .intake
            .create_snapshot(
                &ctx(),
                CreateSnapshotRequest {
                    name: "s1".into(),
                    volume_id: "vol-1".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(accepted.body.size, 12);
        let id = accepted.body.id.clone();
        accepted.outcome().await;
        assert_eq!(
            h.ledger.get_snapshot(&id).await.unwrap().status,
            ResourceStatus::Available
        );

        h.connector.fail("delete_volume_snapshot");
        let accepted = h.intake.delete_snapshot(&ctx(), &id).await.unwrap();
        accepted.outcome().await;
        assert_eq!(
            h.ledger.get_snapshot(&id).await.unwrap().status,
            ResourceStatus::ErrorDeleting
        );
    }

    #[tokio::test]
    async fn test_update_changes_descriptive_fields_only() {
        let h = harness();
        seed_volume(&h.ledger, "vol-1", 10, ResourceStatus::Available).await;

        let updated = h
            .intake
            .update_volume(
                "vol-1",
                UpdateVolumeRequest {
                    description: Some("scratch".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.description, "scratch");
        assert_eq!(updated.name, "vol-1");
        assert_eq!(updated.size, 10);
        assert_eq!(updated.status, ResourceStatus::Available);
    }
}

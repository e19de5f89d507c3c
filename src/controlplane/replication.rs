//! Replication Service
//!
//! Persists replication records and walks them through their state machine
//! around the blocking sequences of the replication orchestrator. Unlike
//! volume intake these calls return only once the remote sequence is done.

use crate::domain::model::{ReplicationResource, ReplicationState, ResourceKind};
use crate::domain::ports::LedgerRef;
use crate::error::{Error, Result};
use crate::ledger::ResourceLocks;
use crate::replication::{
    CreateReplicationOpts, MirrorTarget, ReplicationOrchestrator, ReplicationReport,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Result of a replication operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationOutcome {
    pub replication: ReplicationResource,
    pub report: ReplicationReport,
}

/// Ledger-backed front for the replication orchestrator
pub struct ReplicationService {
    ledger: LedgerRef,
    locks: Arc<ResourceLocks>,
    orchestrator: Option<Arc<ReplicationOrchestrator>>,
}

impl ReplicationService {
    /// `orchestrator` is `None` when the deployment has no replication peer
    pub fn new(
        ledger: LedgerRef,
        locks: Arc<ResourceLocks>,
        orchestrator: Option<Arc<ReplicationOrchestrator>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            locks,
            orchestrator,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.orchestrator.is_some()
    }

    fn orchestrator(&self) -> Result<&ReplicationOrchestrator> {
        self.orchestrator
            .as_deref()
            .ok_or_else(|| Error::Configuration("replication is not configured".into()))
    }

    fn require_state(
        replication: &ReplicationResource,
        allowed: &[ReplicationState],
        to: &str,
    ) -> Result<()> {
        if allowed.contains(&replication.state) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                kind: ResourceKind::Replication.to_string(),
                id: replication.id.clone(),
                from: replication.state.to_string(),
                to: to.to_string(),
            })
        }
    }

    async fn set_state(
        &self,
        mut replication: ReplicationResource,
        state: ReplicationState,
    ) -> Result<ReplicationResource> {
        replication.state = state;
        replication.updated_at = Utc::now();
        self.ledger.update_replication(replication).await
    }

    /// Record Error after a failed sequence and hand back the original error
    async fn fail(&self, replication: ReplicationResource, err: Error) -> Error {
        let id = replication.id.clone();
        error!("Replication {} failed: {}", id, err);
        if let Err(e) = self.set_state(replication, ReplicationState::Error).await {
            error!("Failed to record error state of replication {}: {}", id, e);
        }
        err
    }

    /// Persist the state reached by a successful sequence, recording Error
    /// if the write itself fails
    async fn commit(
        &self,
        replication: ReplicationResource,
        state: ReplicationState,
    ) -> Result<ReplicationResource> {
        match self.set_state(replication.clone(), state).await {
            Ok(updated) => Ok(updated),
            Err(e) => Err(self.fail(replication, e).await),
        }
    }

    /// First of the two volumes found on either side of an existing
    /// replication, paired with that replication's id
    async fn replication_of(
        &self,
        primary_volume_id: &str,
        secondary_volume_id: &str,
    ) -> Result<Option<(String, String)>> {
        let replications = self.ledger.list_replications().await?;
        Ok([primary_volume_id, secondary_volume_id]
            .into_iter()
            .find_map(|volume_id| {
                replications
                    .iter()
                    .find(|r| r.references(volume_id))
                    .map(|r| (volume_id.to_string(), r.id.clone()))
            }))
    }

    pub async fn create(&self, opts: CreateReplicationOpts) -> Result<ReplicationOutcome> {
        let orchestrator = self.orchestrator()?;
        if opts.primary_volume_id.is_empty() || opts.secondary_volume_id.is_empty() {
            return Err(Error::BadRequest(
                "primary and secondary volume ids are required".into(),
            ));
        }
        if opts.primary_volume_id == opts.secondary_volume_id {
            return Err(Error::BadRequest(
                "primary and secondary volume must differ".into(),
            ));
        }
        let primary = self.ledger.get_volume(&opts.primary_volume_id).await?;

        // held until the record is inserted so a concurrent create sees it
        let volume_guards = [&opts.primary_volume_id, &opts.secondary_volume_id]
            .into_iter()
            .map(|id| {
                self.locks
                    .try_acquire(ResourceKind::Volume, id, "create_replication")
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some((volume_id, replication_id)) = self
            .replication_of(&opts.primary_volume_id, &opts.secondary_volume_id)
            .await?
        {
            return Err(Error::BadRequest(format!(
                "volume {} is already replicated by {}",
                volume_id, replication_id
            )));
        }

        let now = Utc::now();
        let replication = ReplicationResource {
            id: uuid::Uuid::new_v4().to_string(),
            primary_volume_id: opts.primary_volume_id.clone(),
            secondary_volume_id: opts.secondary_volume_id.clone(),
            pool_id: if opts.pool_id.is_empty() {
                primary.pool_id.clone()
            } else {
                opts.pool_id.clone()
            },
            profile_id: if opts.profile_id.is_empty() {
                primary.profile_id.clone()
            } else {
                opts.profile_id.clone()
            },
            availability_zone: if opts.availability_zone.is_empty() {
                primary.availability_zone.clone()
            } else {
                opts.availability_zone.clone()
            },
            primary_side_data: Default::default(),
            secondary_side_data: Default::default(),
            state: ReplicationState::Creating,
            created_at: now,
            updated_at: now,
        };
        let opts = CreateReplicationOpts {
            pool_id: replication.pool_id.clone(),
            profile_id: replication.profile_id.clone(),
            availability_zone: replication.availability_zone.clone(),
            ..opts
        };

        let _guard = self.locks.try_acquire(
            ResourceKind::Replication,
            &replication.id,
            "create_replication",
        )?;
        let mut replication = self.ledger.create_replication(replication).await?;
        drop(volume_guards);
        info!(
            "Replication {} created for volume {}",
            replication.id, replication.primary_volume_id
        );

        let (spec, mut report) = match orchestrator.create_replication(&opts).await {
            Ok(created) => created,
            Err(e) => return Err(self.fail(replication, e).await),
        };
        replication.primary_side_data = spec.primary_side_data;
        replication.secondary_side_data = spec.secondary_side_data;
        let replication = match self.ledger.update_replication(replication.clone()).await {
            Ok(updated) => updated,
            Err(e) => return Err(self.fail(replication, e).await),
        };

        let target = MirrorTarget::for_resource(&replication, orchestrator.config());
        match orchestrator.enable_replication(&target).await {
            Ok(enabled) => report.steps.extend(enabled.steps),
            Err(e) => return Err(self.fail(replication, e).await),
        }

        let replication = self.commit(replication, ReplicationState::Enabled).await?;
        Ok(ReplicationOutcome {
            replication,
            report,
        })
    }

    pub async fn get(&self, id: &str) -> Result<ReplicationResource> {
        self.ledger.get_replication(id).await
    }

    pub async fn list(&self) -> Result<Vec<ReplicationResource>> {
        self.ledger.list_replications().await
    }

    pub async fn enable(&self, id: &str) -> Result<ReplicationOutcome> {
        let orchestrator = self.orchestrator()?;
        let _guard = self
            .locks
            .try_acquire(ResourceKind::Replication, id, "enable_replication")?;
        let replication = self.ledger.get_replication(id).await?;
        Self::require_state(
            &replication,
            &[ReplicationState::Disabled, ReplicationState::Error],
            "enabled",
        )?;

        let target = MirrorTarget::for_resource(&replication, orchestrator.config());
        match orchestrator.enable_replication(&target).await {
            Ok(report) => Ok(ReplicationOutcome {
                replication: self.commit(replication, ReplicationState::Enabled).await?,
                report,
            }),
            Err(e) => Err(self.fail(replication, e).await),
        }
    }

    pub async fn disable(&self, id: &str) -> Result<ReplicationOutcome> {
        let orchestrator = self.orchestrator()?;
        let _guard = self
            .locks
            .try_acquire(ResourceKind::Replication, id, "disable_replication")?;
        let replication = self.ledger.get_replication(id).await?;
        Self::require_state(&replication, &[ReplicationState::Enabled], "disabling")?;

        let replication = self.set_state(replication, ReplicationState::Disabling).await?;
        let target = MirrorTarget::for_resource(&replication, orchestrator.config());
        match orchestrator.disable_replication(&target).await {
            Ok(report) => Ok(ReplicationOutcome {
                replication: self.commit(replication, ReplicationState::Disabled).await?,
                report,
            }),
            Err(e) => Err(self.fail(replication, e).await),
        }
    }

    pub async fn failover(&self, id: &str) -> Result<ReplicationResource> {
        let orchestrator = self.orchestrator()?;
        let _guard = self
            .locks
            .try_acquire(ResourceKind::Replication, id, "failover_replication")?;
        let replication = self.ledger.get_replication(id).await?;
        let swapped = orchestrator.failover_replication(&replication)?;
        self.ledger.update_replication(swapped).await
    }

    pub async fn delete(&self, id: &str) -> Result<ReplicationReport> {
        let orchestrator = self.orchestrator()?;
        let _guard = self
            .locks
            .try_acquire(ResourceKind::Replication, id, "delete_replication")?;
        let replication = self.ledger.get_replication(id).await?;
        if !replication.state.is_settled() {
            return Err(Error::InvalidTransition {
                kind: ResourceKind::Replication.to_string(),
                id: id.to_string(),
                from: replication.state.to_string(),
                to: "deleted".into(),
            });
        }

        let target = MirrorTarget::for_resource(&replication, orchestrator.config());
        match orchestrator.delete_replication(&target).await {
            Ok(report) => {
                self.ledger.delete_replication(id).await?;
                info!("Replication {} deleted", id);
                Ok(report)
            }
            Err(e) => Err(self.fail(replication, e).await),
        }
    }
}

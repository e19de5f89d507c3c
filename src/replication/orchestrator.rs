//! Replication Orchestrator
//!
//! Drives ordered command sequences over per-operation sessions to the two
//! clusters of a replication pair. Each sequence produces a per-step report;
//! the configured [`StepPolicy`] decides whether a failed step aborts it.

use crate::domain::model::{ReplicationResource, ReplicationState};
use crate::domain::ports::{
    PasswordDecrypterRef, RemoteSession, RemoteTarget, RemoteTransportRef,
};
use crate::error::{Error, Result};
use crate::replication::commands::{CommandPlanner, PlannedStep, Side};
use crate::replication::config::{ClusterEndpoint, ReplicationConfig, StepPolicy};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Side data key carrying the primary cluster address
pub const PRIMARY_IP_KEY: &str = "PrimaryIP";
/// Side data key carrying the secondary cluster address
pub const REMOTE_IP_KEY: &str = "RemoteIP";
/// Side data key naming the physical cluster host behind a role
pub const HOST_KEY: &str = "Host";
/// Side data key carrying the mirrored image name
pub const IMAGE_KEY: &str = "Image";

// =============================================================================
// Descriptors and Reports
// =============================================================================

/// Input to CreateReplication
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReplicationOpts {
    pub primary_volume_id: String,
    pub secondary_volume_id: String,
    #[serde(default)]
    pub pool_id: String,
    #[serde(default)]
    pub profile_id: String,
    #[serde(default)]
    pub availability_zone: String,
}

/// Composite descriptor returned by CreateReplication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSpec {
    /// Backend image name of the primary volume
    pub primary_volume_id: String,
    /// Backend image name of the secondary volume
    pub secondary_volume_id: String,
    pub pool_id: String,
    pub profile_id: String,
    pub availability_zone: String,
    pub primary_side_data: BTreeMap<String, String>,
    pub secondary_side_data: BTreeMap<String, String>,
}

/// Result of one executed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub side: Side,
    pub step: String,
    pub command: String,
    pub success: bool,
    /// Combined output on success, failure reason otherwise
    pub output: String,
}

/// Ordered per-step results of one replication sequence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationReport {
    pub operation: String,
    pub steps: Vec<StepReport>,
}

impl ReplicationReport {
    fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| !s.success)
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Which physical cluster currently holds the primary role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Configured primary cluster is primary
    Forward,
    /// Roles swapped by a failover
    Reversed,
}

/// The image a sequence acts on and the current role layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTarget {
    pub image: String,
    pub orientation: Orientation,
}

impl MirrorTarget {
    /// Recover the target from a stored replication record
    pub fn for_resource(resource: &ReplicationResource, config: &ReplicationConfig) -> Self {
        let image = resource
            .primary_side_data
            .get(IMAGE_KEY)
            .cloned()
            .unwrap_or_else(|| config.image_name(&resource.primary_volume_id));
        let orientation = match resource.primary_side_data.get(HOST_KEY) {
            Some(host) if *host == config.secondary.host => Orientation::Reversed,
            _ => Orientation::Forward,
        };
        Self { image, orientation }
    }
}

// =============================================================================
// Sessions
// =============================================================================

struct Sessions {
    primary: Option<Box<dyn RemoteSession>>,
    secondary: Option<Box<dyn RemoteSession>>,
}

impl Sessions {
    fn get(&mut self, side: Side) -> Result<&mut Box<dyn RemoteSession>> {
        let slot = match side {
            Side::Primary => &mut self.primary,
            Side::Secondary => &mut self.secondary,
        };
        slot.as_mut()
            .ok_or_else(|| Error::Internal(format!("no session open to the {} cluster", side)))
    }

    async fn close(self) {
        for (side, session) in [(Side::Primary, self.primary), (Side::Secondary, self.secondary)] {
            if let Some(mut session) = session {
                if let Err(e) = session.close().await {
                    warn!("Failed to close {} session: {}", side, e);
                }
            }
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Drives replication sequences against a primary/secondary cluster pair
pub struct ReplicationOrchestrator {
    config: Arc<ReplicationConfig>,
    transport: RemoteTransportRef,
    decrypter: PasswordDecrypterRef,
}

impl ReplicationOrchestrator {
    pub fn new(
        config: Arc<ReplicationConfig>,
        transport: RemoteTransportRef,
        decrypter: PasswordDecrypterRef,
    ) -> Self {
        Self {
            config,
            transport,
            decrypter,
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    fn clusters(&self, orientation: Orientation) -> (&ClusterEndpoint, &ClusterEndpoint) {
        match orientation {
            Orientation::Forward => (&self.config.primary, &self.config.secondary),
            Orientation::Reversed => (&self.config.secondary, &self.config.primary),
        }
    }

    async fn open(&self, side: Side, cluster: &ClusterEndpoint) -> Result<Box<dyn RemoteSession>> {
        let target = RemoteTarget {
            label: side.to_string(),
            dial_addr: cluster.dial_addr.clone(),
            username: self.config.username.clone(),
            password: self.decrypter.decrypt(&self.config.password)?,
        };
        self.transport.connect(&target).await
    }

    /// Open sessions only to the sides `plan` touches
    async fn open_sessions(
        &self,
        orientation: Orientation,
        plan: &[PlannedStep],
    ) -> Result<Sessions> {
        let (primary, secondary) = self.clusters(orientation);
        let mut sessions = Sessions {
            primary: None,
            secondary: None,
        };
        if plan.iter().any(|s| s.side == Side::Primary) {
            sessions.primary = Some(self.open(Side::Primary, primary).await?);
        }
        if plan.iter().any(|s| s.side == Side::Secondary) {
            match self.open(Side::Secondary, secondary).await {
                Ok(session) => sessions.secondary = Some(session),
                Err(e) => {
                    sessions.close().await;
                    return Err(e);
                }
            }
        }
        Ok(sessions)
    }

    /// Run `plan` in order, pausing `settle` between consecutive steps
    async fn run_plan(
        &self,
        operation: &str,
        orientation: Orientation,
        plan: Vec<PlannedStep>,
        policy: StepPolicy,
        settle: Option<Duration>,
    ) -> Result<ReplicationReport> {
        let mut sessions = self.open_sessions(orientation, &plan).await?;
        let mut report = ReplicationReport::new(operation);
        let mut outcome = Ok(());

        for (index, step) in plan.into_iter().enumerate() {
            if index > 0 {
                if let Some(settle) = settle {
                    tokio::time::sleep(settle).await;
                }
            }

            let result = match sessions.get(step.side) {
                Ok(session) => session.exec(&step.command).await,
                Err(e) => Err(e),
            };
            let (success, output) = match result {
                Ok(out) if out.is_success() => (true, out.combined()),
                Ok(out) => {
                    let reason = match (out.combined(), out.exit_code) {
                        (msg, _) if !msg.is_empty() => msg,
                        (_, Some(code)) => format!("exit status {}", code),
                        (_, None) => "terminated by signal".to_string(),
                    };
                    (false, reason)
                }
                Err(e) => (false, e.to_string()),
            };

            if !success {
                warn!(
                    "{}: step {} failed on {} cluster: {}",
                    operation, step.name, step.side, output
                );
            }
            report.steps.push(StepReport {
                side: step.side,
                step: step.name.to_string(),
                command: step.command,
                success,
                output: output.clone(),
            });

            if !success && policy == StepPolicy::AbortOnFirstFailure {
                outcome = Err(Error::ReplicationStep {
                    side: step.side.to_string(),
                    step: step.name.to_string(),
                    reason: output,
                });
                break;
            }
        }

        sessions.close().await;
        outcome.map(|_| report)
    }

    /// Provision mirroring of one volume between both clusters.
    ///
    /// Succeeds once both sessions are open unless `create_policy` aborts on
    /// a failed step.
    pub async fn create_replication(
        &self,
        opts: &CreateReplicationOpts,
    ) -> Result<(ReplicationSpec, ReplicationReport)> {
        if opts.primary_volume_id.is_empty() || opts.secondary_volume_id.is_empty() {
            return Err(Error::BadRequest(
                "primary and secondary volume ids are required".into(),
            ));
        }
        if opts.primary_volume_id == opts.secondary_volume_id {
            return Err(Error::BadRequest(format!(
                "primary and secondary volume must differ, both are {}",
                opts.primary_volume_id
            )));
        }

        let image = self.config.image_name(&opts.primary_volume_id);
        let (primary, secondary) = self.clusters(Orientation::Forward);
        let plan = CommandPlanner::new(&self.config, primary, secondary).create_plan(&image);

        info!(
            "Creating replication {} -> {}",
            opts.primary_volume_id, opts.secondary_volume_id
        );
        let report = self
            .run_plan(
                "create_replication",
                Orientation::Forward,
                plan,
                self.config.create_policy,
                None,
            )
            .await?;
        if !report.is_clean() {
            warn!(
                "Replication of {} created with {} failed step(s)",
                opts.primary_volume_id,
                report.failures().count()
            );
        }

        let spec = ReplicationSpec {
            primary_volume_id: image.clone(),
            secondary_volume_id: self.config.image_name(&opts.secondary_volume_id),
            pool_id: opts.pool_id.clone(),
            profile_id: opts.profile_id.clone(),
            availability_zone: opts.availability_zone.clone(),
            primary_side_data: BTreeMap::from([
                (PRIMARY_IP_KEY.to_string(), primary.host.clone()),
                (HOST_KEY.to_string(), primary.host.clone()),
                (IMAGE_KEY.to_string(), image.clone()),
            ]),
            secondary_side_data: BTreeMap::from([
                (REMOTE_IP_KEY.to_string(), secondary.host.clone()),
                (HOST_KEY.to_string(), secondary.host.clone()),
                (IMAGE_KEY.to_string(), image),
            ]),
        };
        Ok((spec, report))
    }

    /// Enable mirroring of the image on the current primary
    pub async fn enable_replication(&self, target: &MirrorTarget) -> Result<ReplicationReport> {
        let (primary, secondary) = self.clusters(target.orientation);
        let plan = CommandPlanner::new(&self.config, primary, secondary).enable_plan(&target.image);
        info!("Enabling mirroring of {}", target.image);
        self.run_plan(
            "enable_replication",
            target.orientation,
            plan,
            StepPolicy::AbortOnFirstFailure,
            None,
        )
        .await
    }

    /// Demote, promote, force-disable and snapshot, in that order, with the
    /// settle interval between steps. Any failure aborts the sequence.
    pub async fn disable_replication(&self, target: &MirrorTarget) -> Result<ReplicationReport> {
        let (primary, secondary) = self.clusters(target.orientation);
        let plan =
            CommandPlanner::new(&self.config, primary, secondary).disable_plan(&target.image);
        info!(
            "Disabling mirroring of {} (settle interval {:?})",
            target.image,
            self.config.settle_interval()
        );
        let result = self
            .run_plan(
                "disable_replication",
                target.orientation,
                plan,
                StepPolicy::AbortOnFirstFailure,
                Some(self.config.settle_interval()),
            )
            .await;
        if let Err(e) = &result {
            error!("Disable of {} aborted: {}", target.image, e);
        }
        result
    }

    /// Stop the mirror daemon on both clusters
    pub async fn delete_replication(&self, target: &MirrorTarget) -> Result<ReplicationReport> {
        let (primary, secondary) = self.clusters(target.orientation);
        let plan = CommandPlanner::new(&self.config, primary, secondary).delete_plan();
        info!("Deleting replication of {}", target.image);
        self.run_plan(
            "delete_replication",
            target.orientation,
            plan,
            self.config.delete_policy,
            None,
        )
        .await
    }

    /// Swap the role labels of a disabled replication
    pub fn failover_replication(
        &self,
        resource: &ReplicationResource,
    ) -> Result<ReplicationResource> {
        if resource.state != ReplicationState::Disabled {
            return Err(Error::InvalidTransition {
                kind: "Replication".into(),
                id: resource.id.clone(),
                from: resource.state.to_string(),
                to: "failover".into(),
            });
        }
        let mut swapped = resource.clone();
        std::mem::swap(
            &mut swapped.primary_volume_id,
            &mut swapped.secondary_volume_id,
        );
        std::mem::swap(
            &mut swapped.primary_side_data,
            &mut swapped.secondary_side_data,
        );
        swapped.updated_at = Utc::now();
        info!(
            "Failed over replication {}: primary is now {}",
            swapped.id, swapped.primary_volume_id
        );
        Ok(swapped)
    }
}

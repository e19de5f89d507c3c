//! Rollback Coordinator
//!
//! Checks preconditions of capacity-sensitive operations against the pool
//! before anything is dispatched, and reverts the ledger entry when they
//! fail. Remote failures after dispatch are not rolled back.

use crate::domain::model::{ResourceStatus, VolumeResource};
use crate::domain::ports::LedgerRef;
use crate::error::Result;
use tracing::{info, warn};

/// Verdict of a precondition check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feasibility {
    Feasible,
    Infeasible { reason: String },
}

pub struct RollbackCoordinator {
    ledger: LedgerRef,
}

impl RollbackCoordinator {
    pub fn new(ledger: LedgerRef) -> Self {
        Self { ledger }
    }

    /// The size increase must fit into the pool's free capacity
    pub async fn check_extend(&self, volume: &VolumeResource, new_size: u64) -> Feasibility {
        let pool = match self.ledger.get_pool(&volume.pool_id).await {
            Ok(pool) => pool,
            Err(e) => {
                return Feasibility::Infeasible {
                    reason: format!("pool lookup failed: {}", e),
                }
            }
        };

        let increase = new_size.saturating_sub(volume.size);
        if increase > pool.free_capacity {
            return Feasibility::Infeasible {
                reason: format!(
                    "extend of {} by {} exceeds free capacity {} of pool {}",
                    volume.id, increase, pool.free_capacity, pool.id
                ),
            };
        }
        Feasibility::Feasible
    }

    /// Put the volume back into `prior` after a failed precondition
    pub async fn revert(&self, volume_id: &str, prior: ResourceStatus) -> Result<VolumeResource> {
        let mut volume = self.ledger.get_volume(volume_id).await?;
        warn!(
            "Rolling back {} from {} to {}",
            volume_id, volume.status, prior
        );
        volume.status = prior;
        let volume = self.ledger.update_volume(volume).await?;
        info!("Volume {} reverted to {}", volume_id, volume.status);
        Ok(volume)
    }
}

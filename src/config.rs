//! Deployment configuration
//!
//! Loaded from an optional YAML file. Every section has a default, so an
//! empty document describes a direct-routing control plane with no pools and
//! no replication peer.

use crate::controlplane::api::ApiServerConfig;
use crate::controlplane::dispatcher::{DispatchPolicy, RoutingConfig};
use crate::domain::model::{DockSpec, PoolSpec, ProfileSpec};
use crate::error::{Error, Result};
use crate::ledger::InMemoryLedger;
use crate::replication::ReplicationConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Remote executor client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorSettings {
    pub request_timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
        }
    }
}

impl ExecutorSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Top-level control plane configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlPlaneConfig {
    pub api: ApiServerConfig,
    pub routing: RoutingConfig,
    pub executor: ExecutorSettings,
    /// Pools seeded into the ledger at startup
    pub pools: Vec<PoolSpec>,
    pub docks: Vec<DockSpec>,
    pub profiles: Vec<ProfileSpec>,
    /// Cross-cluster replication peer, if any
    pub replication: Option<ReplicationConfig>,
}

impl ControlPlaneConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Reject contradictory settings
    pub fn validate(&self) -> Result<()> {
        let mediated = self.routing.default_policy == DispatchPolicy::Mediated
            || self
                .routing
                .pool_overrides
                .values()
                .any(|p| *p == DispatchPolicy::Mediated);
        if mediated && self.routing.controller_endpoint.trim().is_empty() {
            return Err(Error::Configuration(
                "mediated routing requires routing.controllerEndpoint".into(),
            ));
        }

        if self.executor.request_timeout_secs == 0 {
            return Err(Error::Configuration(
                "executor.requestTimeoutSecs must be positive".into(),
            ));
        }

        let docks: HashSet<&str> = self.docks.iter().map(|d| d.id.as_str()).collect();
        for pool in &self.pools {
            if !docks.contains(pool.dock_id.as_str()) {
                return Err(Error::Configuration(format!(
                    "pool {} references unknown dock {}",
                    pool.id, pool.dock_id
                )));
            }
            if pool.free_capacity > pool.total_capacity {
                return Err(Error::Configuration(format!(
                    "pool {} has more free than total capacity",
                    pool.id
                )));
            }
        }

        if self.profiles.iter().filter(|p| p.is_default).count() > 1 {
            return Err(Error::Configuration(
                "at most one profile may be the default".into(),
            ));
        }

        if let Some(replication) = &self.replication {
            replication.validate()?;
        }
        Ok(())
    }

    /// Load pools, docks and profiles into the ledger
    pub fn seed_ledger(&self, ledger: &InMemoryLedger) {
        for dock in &self.docks {
            ledger.put_dock(dock.clone());
        }
        for pool in &self.pools {
            ledger.put_pool(pool.clone());
        }
        for profile in &self.profiles {
            ledger.put_profile(profile.clone());
        }
        info!(
            "Seeded ledger with {} dock(s), {} pool(s), {} profile(s)",
            self.docks.len(),
            self.pools.len(),
            self.profiles.len()
        );
    }
}

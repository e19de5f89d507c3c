//! Dispatcher - routes operations to a remote executor
//!
//! The execution path is a deployment policy: either straight to the dock
//! owning the resource's pool, or through the central controller. Pools can
//! override the deployment default.

use crate::domain::options::*;
use crate::domain::ports::{ExecutorClient, ExecutorConnectorRef, ExecutorKind, LedgerRef};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

// =============================================================================
// Routing Configuration
// =============================================================================

/// How operations reach the execution agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPolicy {
    /// Talk to the dock owning the pool
    #[default]
    Direct,
    /// Go through the central controller
    Mediated,
}

/// Routing policy injected into the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingConfig {
    pub default_policy: DispatchPolicy,
    /// Per-pool policy overrides keyed by pool id
    pub pool_overrides: BTreeMap<String, DispatchPolicy>,
    /// Controller address used by mediated dispatch
    pub controller_endpoint: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_policy: DispatchPolicy::Direct,
            pool_overrides: BTreeMap::new(),
            controller_endpoint: "127.0.0.1:50049".to_string(),
        }
    }
}

impl RoutingConfig {
    /// Policy applying to `pool_id`
    pub fn policy_for(&self, pool_id: &str) -> DispatchPolicy {
        self.pool_overrides
            .get(pool_id)
            .copied()
            .unwrap_or(self.default_policy)
    }
}

/// Resolved target of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub kind: ExecutorKind,
    pub endpoint: String,
    /// Set on the direct path only
    pub driver_name: String,
    pub pool_name: String,
}

// =============================================================================
// Executor Calls
// =============================================================================

/// One remote operation and its descriptor
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorCall {
    CreateVolume(CreateVolumeOpts),
    ExtendVolume(ExtendVolumeOpts),
    DeleteVolume(DeleteVolumeOpts),
    CreateVolumeAttachment(CreateVolumeAttachmentOpts),
    DeleteVolumeAttachment(DeleteVolumeAttachmentOpts),
    CreateVolumeSnapshot(CreateVolumeSnapshotOpts),
    DeleteVolumeSnapshot(DeleteVolumeSnapshotOpts),
}

impl ExecutorCall {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutorCall::CreateVolume(_) => "create_volume",
            ExecutorCall::ExtendVolume(_) => "extend_volume",
            ExecutorCall::DeleteVolume(_) => "delete_volume",
            ExecutorCall::CreateVolumeAttachment(_) => "create_volume_attachment",
            ExecutorCall::DeleteVolumeAttachment(_) => "delete_volume_attachment",
            ExecutorCall::CreateVolumeSnapshot(_) => "create_volume_snapshot",
            ExecutorCall::DeleteVolumeSnapshot(_) => "delete_volume_snapshot",
        }
    }

    /// Stamp route facts into the descriptor
    fn bind_route(&mut self, route: &Route) {
        let driver_name = route.driver_name.clone();
        match self {
            ExecutorCall::CreateVolume(opts) => {
                opts.driver_name = driver_name;
                opts.pool_name = route.pool_name.clone();
            }
            ExecutorCall::ExtendVolume(opts) => opts.driver_name = driver_name,
            ExecutorCall::DeleteVolume(opts) => opts.driver_name = driver_name,
            ExecutorCall::CreateVolumeAttachment(opts) => opts.driver_name = driver_name,
            ExecutorCall::DeleteVolumeAttachment(opts) => opts.driver_name = driver_name,
            ExecutorCall::CreateVolumeSnapshot(opts) => opts.driver_name = driver_name,
            ExecutorCall::DeleteVolumeSnapshot(opts) => opts.driver_name = driver_name,
        }
    }

    async fn invoke(&self, client: &dyn ExecutorClient) -> Result<ExecutorReply> {
        match self {
            ExecutorCall::CreateVolume(opts) => client.create_volume(opts).await,
            ExecutorCall::ExtendVolume(opts) => client.extend_volume(opts).await,
            ExecutorCall::DeleteVolume(opts) => client.delete_volume(opts).await,
            ExecutorCall::CreateVolumeAttachment(opts) => {
                client.create_volume_attachment(opts).await
            }
            ExecutorCall::DeleteVolumeAttachment(opts) => {
                client.delete_volume_attachment(opts).await
            }
            ExecutorCall::CreateVolumeSnapshot(opts) => client.create_volume_snapshot(opts).await,
            ExecutorCall::DeleteVolumeSnapshot(opts) => client.delete_volume_snapshot(opts).await,
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Resolves a route per operation and drives one executor client through it
pub struct Dispatcher {
    ledger: LedgerRef,
    connector: ExecutorConnectorRef,
    routing: RoutingConfig,
}

impl Dispatcher {
    pub fn new(ledger: LedgerRef, connector: ExecutorConnectorRef, routing: RoutingConfig) -> Self {
        Self {
            ledger,
            connector,
            routing,
        }
    }

    /// Resolve the executor for a resource bound to `pool_id`
    pub async fn resolve(&self, pool_id: &str) -> Result<Route> {
        match self.routing.policy_for(pool_id) {
            DispatchPolicy::Direct => {
                let dock = self.ledger.get_dock_by_pool_id(pool_id).await?;
                let pool = self.ledger.get_pool(pool_id).await?;
                Ok(Route {
                    kind: ExecutorKind::Dock,
                    endpoint: dock.endpoint,
                    driver_name: dock.driver_name,
                    pool_name: pool.name,
                })
            }
            DispatchPolicy::Mediated => Ok(Route {
                kind: ExecutorKind::Controller,
                endpoint: self.routing.controller_endpoint.clone(),
                driver_name: String::new(),
                pool_name: String::new(),
            }),
        }
    }

    /// Route, connect, invoke and close for a single operation
    pub async fn dispatch(&self, pool_id: &str, mut call: ExecutorCall) -> Result<ExecutorReply> {
        let route = self.resolve(pool_id).await?;
        call.bind_route(&route);
        debug!(
            "Dispatching {} to {} at {}",
            call.name(),
            route.kind,
            route.endpoint
        );

        let mut client = self.connector.new_client(route.kind);
        client.connect(&route.endpoint).await?;
        let result = call.invoke(client.as_ref()).await;
        if let Err(e) = client.close().await {
            warn!("Failed to close {} client: {}", route.kind, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seeded_ledger, MockConnector};
    use std::sync::Arc;

    #[test]
    fn test_pool_override_wins() {
        let mut routing = RoutingConfig::default();
        routing
            .pool_overrides
            .insert("pool-2".into(), DispatchPolicy::Mediated);
        assert_eq!(routing.policy_for("pool-1"), DispatchPolicy::Direct);
        assert_eq!(routing.policy_for("pool-2"), DispatchPolicy::Mediated);
    }

    #[tokio::test]
    async fn test_direct_dispatch_binds_dock() {
        let connector = MockConnector::new();
        let dispatcher =
            Dispatcher::new(seeded_ledger(), connector.clone(), RoutingConfig::default());

        dispatcher
            .dispatch(
                "pool-1",
                ExecutorCall::CreateVolume(CreateVolumeOpts {
                    id: "vol-1".into(),
                    size: 1,
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        let calls = connector.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, ExecutorKind::Dock);
        assert_eq!(calls[0].endpoint, "10.0.0.10:50050");
        assert_eq!(calls[0].payload["driverName"], "ceph");
        assert_eq!(calls[0].payload["poolName"], "rbd");
        assert_eq!(connector.close_count(), 1);
    }

    #[tokio::test]
    async fn test_mediated_dispatch_uses_controller() {
        let connector = MockConnector::new();
        let routing = RoutingConfig {
            default_policy: DispatchPolicy::Mediated,
            controller_endpoint: "controller:50049".into(),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(seeded_ledger(), connector.clone(), routing);

        dispatcher
            .dispatch(
                "pool-1",
                ExecutorCall::DeleteVolume(DeleteVolumeOpts {
                    id: "vol-1".into(),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        let calls = connector.calls();
        assert_eq!(calls[0].kind, ExecutorKind::Controller);
        assert_eq!(calls[0].endpoint, "controller:50049");
        assert_eq!(calls[0].payload["driverName"], "");
    }

    #[tokio::test]
    async fn test_unknown_pool_fails_before_connect() {
        let connector = MockConnector::new();
        let ledger: LedgerRef = seeded_ledger();
        let dispatcher = Dispatcher::new(
            Arc::clone(&ledger),
            connector.clone(),
            RoutingConfig::default(),
        );

        let err = dispatcher
            .dispatch("missing", ExecutorCall::ExtendVolume(ExtendVolumeOpts::default()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        assert!(connector.calls().is_empty());
    }
}

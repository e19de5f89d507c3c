//! Test doubles shared across module tests
//!
//! A recording executor connector (optionally gated so tests can observe
//! state before a dispatch completes) and a recording remote transport with
//! scripted failures.

use crate::domain::model::*;
use crate::domain::options::*;
use crate::domain::ports::*;
use crate::error::{Error, Result};
use crate::ledger::InMemoryLedger;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;

// =============================================================================
// Ledger Fixtures
// =============================================================================

/// Ledger seeded with one dock, two pools and a default profile
pub fn seeded_ledger() -> Arc<InMemoryLedger> {
    let ledger = InMemoryLedger::new();
    ledger.put_dock(DockSpec {
        id: "dock-1".into(),
        name: "ceph-dock".into(),
        endpoint: "10.0.0.10:50050".into(),
        driver_name: "ceph".into(),
    });
    ledger.put_pool(PoolSpec {
        id: "pool-1".into(),
        name: "rbd".into(),
        dock_id: "dock-1".into(),
        availability_zone: "default".into(),
        total_capacity: 100,
        free_capacity: 50,
    });
    ledger.put_pool(PoolSpec {
        id: "pool-2".into(),
        name: "rbd-ssd".into(),
        dock_id: "dock-1".into(),
        availability_zone: "az-2".into(),
        total_capacity: 20,
        free_capacity: 5,
    });
    ledger.put_profile(ProfileSpec {
        id: "profile-default".into(),
        name: "default".into(),
        description: String::new(),
        is_default: true,
        properties: BTreeMap::new(),
    });
    ledger
}

/// Ledger that rejects replication updates into one state
pub struct FailingLedger {
    inner: Arc<InMemoryLedger>,
    reject: Mutex<Option<ReplicationState>>,
}

impl FailingLedger {
    pub fn new(inner: Arc<InMemoryLedger>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            reject: Mutex::new(None),
        })
    }

    /// Updates that move a replication into `state` fail from now on
    pub fn reject_replication_state(&self, state: ReplicationState) {
        *self.reject.lock() = Some(state);
    }
}

#[async_trait]
impl Ledger for FailingLedger {
    async fn create_volume(&self, volume: VolumeResource) -> Result<VolumeResource> {
        self.inner.create_volume(volume).await
    }
    async fn get_volume(&self, id: &str) -> Result<VolumeResource> {
        self.inner.get_volume(id).await
    }
    async fn list_volumes(&self, filter: &ListFilter) -> Result<Vec<VolumeResource>> {
        self.inner.list_volumes(filter).await
    }
    async fn update_volume(&self, volume: VolumeResource) -> Result<VolumeResource> {
        self.inner.update_volume(volume).await
    }
    async fn delete_volume(&self, id: &str) -> Result<()> {
        self.inner.delete_volume(id).await
    }

    async fn create_attachment(
        &self,
        attachment: AttachmentResource,
    ) -> Result<AttachmentResource> {
        self.inner.create_attachment(attachment).await
    }
    async fn get_attachment(&self, id: &str) -> Result<AttachmentResource> {
        self.inner.get_attachment(id).await
    }
    async fn list_attachments(&self, filter: &ListFilter) -> Result<Vec<AttachmentResource>> {
        self.inner.list_attachments(filter).await
    }
    async fn update_attachment(
        &self,
        attachment: AttachmentResource,
    ) -> Result<AttachmentResource> {
        self.inner.update_attachment(attachment).await
    }
    async fn delete_attachment(&self, id: &str) -> Result<()> {
        self.inner.delete_attachment(id).await
    }

    async fn create_snapshot(&self, snapshot: SnapshotResource) -> Result<SnapshotResource> {
        self.inner.create_snapshot(snapshot).await
    }
    async fn get_snapshot(&self, id: &str) -> Result<SnapshotResource> {
        self.inner.get_snapshot(id).await
    }
    async fn list_snapshots(&self, filter: &ListFilter) -> Result<Vec<SnapshotResource>> {
        self.inner.list_snapshots(filter).await
    }
    async fn update_snapshot(&self, snapshot: SnapshotResource) -> Result<SnapshotResource> {
        self.inner.update_snapshot(snapshot).await
    }
    async fn delete_snapshot(&self, id: &str) -> Result<()> {
        self.inner.delete_snapshot(id).await
    }

    async fn create_replication(
        &self,
        replication: ReplicationResource,
    ) -> Result<ReplicationResource> {
        self.inner.create_replication(replication).await
    }
    async fn get_replication(&self, id: &str) -> Result<ReplicationResource> {
        self.inner.get_replication(id).await
    }
    async fn list_replications(&self) -> Result<Vec<ReplicationResource>> {
        self.inner.list_replications().await
    }
    async fn update_replication(
        &self,
        replication: ReplicationResource,
    ) -> Result<ReplicationResource> {
        if *self.reject.lock() == Some(replication.state) {
            return Err(Error::Internal("injected ledger failure".into()));
        }
        self.inner.update_replication(replication).await
    }
    async fn delete_replication(&self, id: &str) -> Result<()> {
        self.inner.delete_replication(id).await
    }

    async fn get_pool(&self, id: &str) -> Result<PoolSpec> {
        self.inner.get_pool(id).await
    }
    async fn list_pools(&self) -> Result<Vec<PoolSpec>> {
        self.inner.list_pools().await
    }
    async fn get_dock(&self, id: &str) -> Result<DockSpec> {
        self.inner.get_dock(id).await
    }
    async fn get_dock_by_pool_id(&self, pool_id: &str) -> Result<DockSpec> {
        self.inner.get_dock_by_pool_id(pool_id).await
    }
    async fn get_default_profile(&self) -> Result<ProfileSpec> {
        self.inner.get_default_profile().await
    }
    async fn get_profile(&self, id: &str) -> Result<ProfileSpec> {
        self.inner.get_profile(id).await
    }
}

// =============================================================================
// Mock Executor
// =============================================================================

/// One executor invocation as seen by the mock
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub kind: ExecutorKind,
    pub endpoint: String,
    pub operation: &'static str,
    pub payload: serde_json::Value,
}

#[derive(Default)]
struct ConnectorState {
    calls: Mutex<Vec<RecordedCall>>,
    failing: Mutex<Vec<&'static str>>,
    reply: Mutex<BTreeMap<String, String>>,
    closes: Mutex<usize>,
}

/// Connector handing out clients that record every call
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<ConnectorState>,
    gate: Option<Arc<Semaphore>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(ConnectorState::default()),
            gate: None,
        })
    }

    /// Every operation blocks until `release` is called
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(ConnectorState::default()),
            gate: Some(Arc::new(Semaphore::new(0))),
        })
    }

    /// Let `n` blocked operations complete
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Make `operation` fail from now on
    pub fn fail(&self, operation: &'static str) {
        self.state.failing.lock().push(operation);
    }

    pub fn reply_with(&self, key: &str, value: &str) {
        self.state
            .reply
            .lock()
            .insert(key.to_string(), value.to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().clone()
    }

    pub fn calls_for(&self, operation: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.operation == operation)
            .collect()
    }

    pub fn close_count(&self) -> usize {
        *self.state.closes.lock()
    }
}

impl ExecutorConnector for MockConnector {
    fn new_client(&self, kind: ExecutorKind) -> Box<dyn ExecutorClient> {
        Box::new(MockClient {
            kind,
            endpoint: None,
            state: self.state.clone(),
            gate: self.gate.clone(),
        })
    }
}

struct MockClient {
    kind: ExecutorKind,
    endpoint: Option<String>,
    state: Arc<ConnectorState>,
    gate: Option<Arc<Semaphore>>,
}

impl MockClient {
    async fn record<T: serde::Serialize>(
        &self,
        operation: &'static str,
        opts: &T,
    ) -> Result<ExecutorReply> {
        let endpoint = self.endpoint.clone().ok_or(Error::ExecutorNotConnected)?;
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?
                .forget();
        }
        self.state.calls.lock().push(RecordedCall {
            kind: self.kind,
            endpoint,
            operation,
            payload: serde_json::to_value(opts)?,
        });
        if self.state.failing.lock().contains(&operation) {
            return Err(Error::ExecutorOperation {
                operation: operation.to_string(),
                reason: "injected failure".into(),
            });
        }
        Ok(ExecutorReply {
            metadata: self.state.reply.lock().clone(),
        })
    }
}

#[async_trait]
impl ExecutorClient for MockClient {
    async fn connect(&mut self, endpoint: &str) -> Result<()> {
        self.endpoint = Some(endpoint.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        *self.state.closes.lock() += 1;
        self.endpoint = None;
        Ok(())
    }

    async fn create_volume(&self, opts: &CreateVolumeOpts) -> Result<ExecutorReply> {
        self.record("create_volume", opts).await
    }

    async fn extend_volume(&self, opts: &ExtendVolumeOpts) -> Result<ExecutorReply> {
        self.record("extend_volume", opts).await
    }

    async fn delete_volume(&self, opts: &DeleteVolumeOpts) -> Result<ExecutorReply> {
        self.record("delete_volume", opts).await
    }

    async fn create_volume_attachment(
        &self,
        opts: &CreateVolumeAttachmentOpts,
    ) -> Result<ExecutorReply> {
        self.record("create_volume_attachment", opts).await
    }

    async fn delete_volume_attachment(
        &self,
        opts: &DeleteVolumeAttachmentOpts,
    ) -> Result<ExecutorReply> {
        self.record("delete_volume_attachment", opts).await
    }

    async fn create_volume_snapshot(
        &self,
        opts: &CreateVolumeSnapshotOpts,
    ) -> Result<ExecutorReply> {
        self.record("create_volume_snapshot", opts).await
    }

    async fn delete_volume_snapshot(
        &self,
        opts: &DeleteVolumeSnapshotOpts,
    ) -> Result<ExecutorReply> {
        self.record("delete_volume_snapshot", opts).await
    }
}

// =============================================================================
// Mock Remote Transport
// =============================================================================

/// One command executed through the mock transport
#[derive(Debug, Clone)]
pub struct RecordedCommand {
    pub label: String,
    pub dial_addr: String,
    pub command: String,
    pub at: Instant,
}

#[derive(Default)]
struct TransportState {
    log: Mutex<Vec<RecordedCommand>>,
    /// (dial_addr, command substring) pairs that exit non-zero
    failing: Mutex<Vec<(String, String)>>,
    unreachable: Mutex<Vec<String>>,
    passwords: Mutex<Vec<String>>,
}

/// Transport that records commands instead of running them
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<TransportState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Commands on `dial_addr` containing `needle` exit with status 1
    pub fn fail_command(&self, dial_addr: &str, needle: &str) {
        self.state
            .failing
            .lock()
            .push((dial_addr.to_string(), needle.to_string()));
    }

    /// Connecting to `dial_addr` fails
    pub fn unreachable(&self, dial_addr: &str) {
        self.state.unreachable.lock().push(dial_addr.to_string());
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state.log.lock().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.commands().into_iter().map(|c| c.command).collect()
    }

    /// Passwords seen at connect time
    pub fn passwords(&self) -> Vec<String> {
        self.state.passwords.lock().clone()
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteSession>> {
        if self.state.unreachable.lock().contains(&target.dial_addr) {
            return Err(Error::Transport {
                host: target.dial_addr.clone(),
                reason: "connection refused".into(),
            });
        }
        self.state
            .passwords
            .lock()
            .push(target.password.as_str().to_string());
        Ok(Box::new(MockSession {
            label: target.label.clone(),
            dial_addr: target.dial_addr.clone(),
            state: self.state.clone(),
        }))
    }
}

struct MockSession {
    label: String,
    dial_addr: String,
    state: Arc<TransportState>,
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        self.state.log.lock().push(RecordedCommand {
            label: self.label.clone(),
            dial_addr: self.dial_addr.clone(),
            command: command.to_string(),
            at: Instant::now(),
        });
        let fails = self
            .state
            .failing
            .lock()
            .iter()
            .any(|(addr, needle)| *addr == self.dial_addr && command.contains(needle.as_str()));
        if fails {
            return Ok(CommandOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: format!("injected failure: {}", command),
            });
        }
        Ok(CommandOutput {
            exit_code: Some(0),
            ..Default::default()
        })
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

//! In-Memory Ledger
//!
//! A `Ledger` backed by `parking_lot` guarded maps. Writes complete before
//! the call returns, so every subsequent read observes them.

use crate::domain::model::{
    AttachmentResource, DockSpec, PoolSpec, ProfileSpec, ReplicationResource, ResourceKind,
    SnapshotResource, VolumeResource,
};
use crate::domain::ports::{Ledger, ListFilter};
use crate::error::{Error, Result};
use crate::ledger::events::LedgerEvent;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the change-event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Record Table
// =============================================================================

/// Row stored in a status-bearing table
trait Record: Clone + Send + Sync {
    fn id(&self) -> &str;
    fn status_label(&self) -> String;
    fn touch(&mut self);
}

impl Record for VolumeResource {
    fn id(&self) -> &str {
        &self.id
    }
    fn status_label(&self) -> String {
        self.status.to_string()
    }
    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Record for AttachmentResource {
    fn id(&self) -> &str {
        &self.id
    }
    fn status_label(&self) -> String {
        self.status.to_string()
    }
    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Record for SnapshotResource {
    fn id(&self) -> &str {
        &self.id
    }
    fn status_label(&self) -> String {
        self.status.to_string()
    }
    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Record for ReplicationResource {
    fn id(&self) -> &str {
        &self.id
    }
    fn status_label(&self) -> String {
        self.state.to_string()
    }
    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

struct Table<T: Record> {
    kind: ResourceKind,
    rows: RwLock<BTreeMap<String, T>>,
}

impl<T: Record> Table<T> {
    fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    fn insert(&self, row: T, events: &broadcast::Sender<LedgerEvent>) -> Result<T> {
        let mut rows = self.rows.write();
        if rows.contains_key(row.id()) {
            return Err(Error::AlreadyExists {
                kind: self.kind.to_string(),
                id: row.id().to_string(),
            });
        }
        rows.insert(row.id().to_string(), row.clone());
        drop(rows);

        let _ = events.send(LedgerEvent::Created {
            kind: self.kind,
            id: row.id().to_string(),
            status: row.status_label(),
        });
        Ok(row)
    }

    fn get(&self, id: &str) -> Result<T> {
        self.rows
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(&self.kind.to_string(), id))
    }

    fn list(&self, keep: impl Fn(&T) -> bool) -> Vec<T> {
        self.rows.read().values().filter(|r| keep(r)).cloned().collect()
    }

    fn replace(&self, mut row: T, events: &broadcast::Sender<LedgerEvent>) -> Result<T> {
        let mut rows = self.rows.write();
        let previous = rows
            .get(row.id())
            .map(|r| r.status_label())
            .ok_or_else(|| Error::not_found(&self.kind.to_string(), row.id()))?;
        row.touch();
        rows.insert(row.id().to_string(), row.clone());
        drop(rows);

        let current = row.status_label();
        if previous != current {
            debug!("{} {}: {} -> {}", self.kind, row.id(), previous, current);
            let _ = events.send(LedgerEvent::StatusChanged {
                kind: self.kind,
                id: row.id().to_string(),
                from: previous,
                to: current,
            });
        }
        Ok(row)
    }

    fn remove(&self, id: &str, events: &broadcast::Sender<LedgerEvent>) -> Result<()> {
        if self.rows.write().remove(id).is_none() {
            return Err(Error::not_found(&self.kind.to_string(), id));
        }
        let _ = events.send(LedgerEvent::Deleted {
            kind: self.kind,
            id: id.to_string(),
        });
        Ok(())
    }
}

// =============================================================================
// In-Memory Ledger
// =============================================================================

/// Ledger kept entirely in process memory
pub struct InMemoryLedger {
    volumes: Table<VolumeResource>,
    attachments: Table<AttachmentResource>,
    snapshots: Table<SnapshotResource>,
    replications: Table<ReplicationResource>,
    pools: RwLock<BTreeMap<String, PoolSpec>>,
    docks: RwLock<BTreeMap<String, DockSpec>>,
    profiles: RwLock<BTreeMap<String, ProfileSpec>>,
    events: broadcast::Sender<LedgerEvent>,
}

impl InMemoryLedger {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            volumes: Table::new(ResourceKind::Volume),
            attachments: Table::new(ResourceKind::Attachment),
            snapshots: Table::new(ResourceKind::Snapshot),
            replications: Table::new(ResourceKind::Replication),
            pools: RwLock::new(BTreeMap::new()),
            docks: RwLock::new(BTreeMap::new()),
            profiles: RwLock::new(BTreeMap::new()),
            events,
        })
    }

    /// Subscribe to change events
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Insert or replace a pool record
    pub fn put_pool(&self, pool: PoolSpec) {
        self.pools.write().insert(pool.id.clone(), pool);
    }

    /// Insert or replace a dock record
    pub fn put_dock(&self, dock: DockSpec) {
        self.docks.write().insert(dock.id.clone(), dock);
    }

    /// Insert or replace a profile record
    pub fn put_profile(&self, profile: ProfileSpec) {
        self.profiles.write().insert(profile.id.clone(), profile);
    }
}

fn matches_filter(
    filter: &ListFilter,
    status: crate::domain::model::ResourceStatus,
    volume_id: Option<&str>,
    pool_id: Option<&str>,
) -> bool {
    if filter.status.is_some_and(|s| s != status) {
        return false;
    }
    if let Some(wanted) = &filter.volume_id {
        if volume_id != Some(wanted.as_str()) {
            return false;
        }
    }
    if let Some(wanted) = &filter.pool_id {
        if pool_id != Some(wanted.as_str()) {
            return false;
        }
    }
    true
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn create_volume(&self, volume: VolumeResource) -> Result<VolumeResource> {
        self.volumes.insert(volume, &self.events)
    }

    async fn get_volume(&self, id: &str) -> Result<VolumeResource> {
        self.volumes.get(id)
    }

    async fn list_volumes(&self, filter: &ListFilter) -> Result<Vec<VolumeResource>> {
        let rows = self.volumes.list(|v| {
            matches_filter(filter, v.status, Some(v.id.as_str()), Some(v.pool_id.as_str()))
        });
        Ok(filter.paginate(rows))
    }

    async fn update_volume(&self, volume: VolumeResource) -> Result<VolumeResource> {
        self.volumes.replace(volume, &self.events)
    }

    async fn delete_volume(&self, id: &str) -> Result<()> {
        self.volumes.remove(id, &self.events)
    }

    async fn create_attachment(
        &self,
        attachment: AttachmentResource,
    ) -> Result<AttachmentResource> {
        self.attachments.insert(attachment, &self.events)
    }

    async fn get_attachment(&self, id: &str) -> Result<AttachmentResource> {
        self.attachments.get(id)
    }

    async fn list_attachments(&self, filter: &ListFilter) -> Result<Vec<AttachmentResource>> {
        let rows = self
            .attachments
            .list(|a| matches_filter(filter, a.status, Some(a.volume_id.as_str()), None));
        Ok(filter.paginate(rows))
    }

    async fn update_attachment(
        &self,
        attachment: AttachmentResource,
    ) -> Result<AttachmentResource> {
        self.attachments.replace(attachment, &self.events)
    }

    async fn delete_attachment(&self, id: &str) -> Result<()> {
        self.attachments.remove(id, &self.events)
    }

    async fn create_snapshot(&self, snapshot: SnapshotResource) -> Result<SnapshotResource> {
        self.snapshots.insert(snapshot, &self.events)
    }

    async fn get_snapshot(&self, id: &str) -> Result<SnapshotResource> {
        self.snapshots.get(id)
    }

    async fn list_snapshots(&self, filter: &ListFilter) -> Result<Vec<SnapshotResource>> {
        let rows = self
            .snapshots
            .list(|s| matches_filter(filter, s.status, Some(s.volume_id.as_str()), None));
        Ok(filter.paginate(rows))
    }

    async fn update_snapshot(&self, snapshot: SnapshotResource) -> Result<SnapshotResource> {
        self.snapshots.replace(snapshot, &self.events)
    }

    async fn delete_snapshot(&self, id: &str) -> Result<()> {
        self.snapshots.remove(id, &self.events)
    }

    async fn create_replication(
        &self,
        replication: ReplicationResource,
    ) -> Result<ReplicationResource> {
        self.replications.insert(replication, &self.events)
    }

    async fn get_replication(&self, id: &str) -> Result<ReplicationResource> {
        self.replications.get(id)
    }

    async fn list_replications(&self) -> Result<Vec<ReplicationResource>> {
        Ok(self.replications.list(|_| true))
    }

    async fn update_replication(
        &self,
        replication: ReplicationResource,
    ) -> Result<ReplicationResource> {
        self.replications.replace(replication, &self.events)
    }

    async fn delete_replication(&self, id: &str) -> Result<()> {
        self.replications.remove(id, &self.events)
    }

    async fn get_pool(&self, id: &str) -> Result<PoolSpec> {
        self.pools
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("Pool", id))
    }

    async fn list_pools(&self) -> Result<Vec<PoolSpec>> {
        Ok(self.pools.read().values().cloned().collect())
    }

    async fn get_dock(&self, id: &str) -> Result<DockSpec> {
        self.docks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("Dock", id))
    }

    async fn get_dock_by_pool_id(&self, pool_id: &str) -> Result<DockSpec> {
        let pool = self.get_pool(pool_id).await?;
        self.get_dock(&pool.dock_id).await
    }

    async fn get_default_profile(&self) -> Result<ProfileSpec> {
        self.profiles
            .read()
            .values()
            .find(|p| p.is_default)
            .cloned()
            .ok_or_else(|| Error::not_found("Profile", "default"))
    }

    async fn get_profile(&self, id: &str) -> Result<ProfileSpec> {
        self.profiles
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("Profile", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::ResourceStatus;
    use assert_matches::assert_matches;

    fn volume(id: &str, pool_id: &str) -> VolumeResource {
        let now = Utc::now();
        VolumeResource {
            id: id.to_string(),
            name: format!("name-{}", id),
            description: String::new(),
            size: 1,
            availability_zone: "default".to_string(),
            pool_id: pool_id.to_string(),
            profile_id: "prf-1".to_string(),
            snapshot_id: None,
            status: ResourceStatus::Creating,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let ledger = InMemoryLedger::new();
        ledger.create_volume(volume("vol-1", "pool-1")).await.unwrap();

        let mut vol = ledger.get_volume("vol-1").await.unwrap();
        assert_eq!(vol.status, ResourceStatus::Creating);

        vol.status = ResourceStatus::Available;
        ledger.update_volume(vol).await.unwrap();
        assert_eq!(
            ledger.get_volume("vol-1").await.unwrap().status,
            ResourceStatus::Available
        );
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_records() {
        let ledger = InMemoryLedger::new();
        ledger.create_volume(volume("vol-1", "pool-1")).await.unwrap();

        let err = ledger.create_volume(volume("vol-1", "pool-1")).await.unwrap_err();
        assert_matches!(err, Error::AlreadyExists { .. });

        let err = ledger.update_volume(volume("vol-9", "pool-1")).await.unwrap_err();
        assert_matches!(err, Error::NotFound { .. });

        let err = ledger.delete_volume("vol-9").await.unwrap_err();
        assert_matches!(err, Error::NotFound { .. });
    }

    #[tokio::test]
    async fn test_list_filters() {
        let ledger = InMemoryLedger::new();
        ledger.create_volume(volume("vol-1", "pool-1")).await.unwrap();
        ledger.create_volume(volume("vol-2", "pool-2")).await.unwrap();
        let mut v3 = volume("vol-3", "pool-1");
        v3.status = ResourceStatus::Available;
        ledger.create_volume(v3).await.unwrap();

        let by_pool = ListFilter {
            pool_id: Some("pool-1".into()),
            ..Default::default()
        };
        assert_eq!(ledger.list_volumes(&by_pool).await.unwrap().len(), 2);

        let by_status = ListFilter {
            status: Some(ResourceStatus::Available),
            ..Default::default()
        };
        let listed = ledger.list_volumes(&by_status).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "vol-3");
    }

    #[tokio::test]
    async fn test_status_change_events() {
        let ledger = InMemoryLedger::new();
        let mut events = ledger.subscribe();

        ledger.create_volume(volume("vol-1", "pool-1")).await.unwrap();
        let mut vol = ledger.get_volume("vol-1").await.unwrap();
        vol.description = "no status change".into();
        ledger.update_volume(vol.clone()).await.unwrap();
        vol.status = ResourceStatus::Available;
        ledger.update_volume(vol).await.unwrap();
        ledger.delete_volume("vol-1").await.unwrap();

        assert_matches!(events.recv().await.unwrap(), LedgerEvent::Created { .. });
        assert_matches!(
            events.recv().await.unwrap(),
            LedgerEvent::StatusChanged { ref to, .. } if to == "available"
        );
        assert_matches!(events.recv().await.unwrap(), LedgerEvent::Deleted { .. });
    }

    #[tokio::test]
    async fn test_dock_by_pool_and_default_profile() {
        let ledger = InMemoryLedger::new();
        ledger.put_dock(DockSpec {
            id: "dock-1".into(),
            name: "dock-1".into(),
            endpoint: "http://dock-1:50050".into(),
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
        ledger.put_profile(ProfileSpec {
            id: "prf-1".into(),
            name: "default".into(),
            description: String::new(),
            is_default: true,
            properties: BTreeMap::new(),
        });

        let dock = ledger.get_dock_by_pool_id("pool-1").await.unwrap();
        assert_eq!(dock.driver_name, "ceph");
        assert_eq!(ledger.get_default_profile().await.unwrap().id, "prf-1");
        assert!(ledger.get_dock_by_pool_id("pool-x").await.is_err());
    }
}

//! Per-resource exclusivity
//!
//! At most one mutating operation may be in flight per resource id. Intake
//! acquires the lock synchronously and hands the guard to the background
//! task, so the lock spans intake through completion.

use crate::domain::model::ResourceKind;
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Table of resource ids with an operation in flight
#[derive(Debug, Default)]
pub struct ResourceLocks {
    inflight: DashMap<String, &'static str>,
}

impl ResourceLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `id` for `operation`, failing with `Conflict` if it is held
    pub fn try_acquire(
        self: &Arc<Self>,
        kind: ResourceKind,
        id: &str,
        operation: &'static str,
    ) -> Result<ResourceGuard> {
        match self.inflight.entry(id.to_string()) {
            Entry::Occupied(held) => Err(Error::Conflict {
                kind: kind.to_string(),
                id: id.to_string(),
                operation: held.get().to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(operation);
                debug!("Acquired {} lock on {}/{}", operation, kind, id);
                Ok(ResourceGuard {
                    locks: Arc::clone(self),
                    id: id.to_string(),
                })
            }
        }
    }

    /// Operation currently holding `id`, if any
    pub fn holder(&self, id: &str) -> Option<&'static str> {
        self.inflight.get(id).map(|op| *op)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

/// Releases the resource id when dropped
#[derive(Debug)]
pub struct ResourceGuard {
    locks: Arc<ResourceLocks>,
    id: String,
}

impl ResourceGuard {
    pub fn resource_id(&self) -> &str {
        &self.id
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.locks.inflight.remove(&self.id);
    }
}

//! Ledger Events
//!
//! Events emitted by the ledger so pollers can react to status changes
//! instead of re-reading records in a loop.

use crate::domain::model::ResourceKind;
use serde::{Deserialize, Serialize};

/// Events emitted by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    /// A record was written for the first time
    Created {
        kind: ResourceKind,
        id: String,
        status: String,
    },

    /// A record's status changed
    StatusChanged {
        kind: ResourceKind,
        id: String,
        from: String,
        to: String,
    },

    /// A record was removed
    Deleted { kind: ResourceKind, id: String },
}

impl LedgerEvent {
    /// Get the resource ID associated with this event
    pub fn resource_id(&self) -> &str {
        match self {
            LedgerEvent::Created { id, .. } => id,
            LedgerEvent::StatusChanged { id, .. } => id,
            LedgerEvent::Deleted { id, .. } => id,
        }
    }

    /// Get the resource kind associated with this event
    pub fn kind(&self) -> ResourceKind {
        match self {
            LedgerEvent::Created { kind, .. } => *kind,
            LedgerEvent::StatusChanged { kind, .. } => *kind,
            LedgerEvent::Deleted { kind, .. } => *kind,
        }
    }

    /// Status the resource ended up in, `None` once deleted
    pub fn current_status(&self) -> Option<&str> {
        match self {
            LedgerEvent::Created { status, .. } => Some(status),
            LedgerEvent::StatusChanged { to, .. } => Some(to),
            LedgerEvent::Deleted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let event = LedgerEvent::StatusChanged {
            kind: ResourceKind::Volume,
            id: "vol-1".to_string(),
            from: "creating".to_string(),
            to: "available".to_string(),
        };
        assert_eq!(event.resource_id(), "vol-1");
        assert_eq!(event.kind(), ResourceKind::Volume);
        assert_eq!(event.current_status(), Some("available"));

        let event = LedgerEvent::Deleted {
            kind: ResourceKind::Snapshot,
            id: "snap-1".to_string(),
        };
        assert_eq!(event.current_status(), None);
    }
}

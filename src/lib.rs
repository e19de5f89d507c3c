//! SDS Control Plane
//!
//! Resource lifecycle orchestration for a software-defined storage
//! controller, plus cross-cluster block replication.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         REST API (axum)                              │
//! ├──────────────────────────────┬───────────────────────────────────────┤
//! │       Request Intake         │        Replication Service            │
//! │  (validate, ledger, accept)  │   (state machine, blocking calls)     │
//! ├──────────────┬───────────────┼───────────────────────────────────────┤
//! │  Rollback    │  Dispatcher   │      Replication Orchestrator         │
//! │ (extend pre- │ (direct dock  │  (ordered rbd command sequences,      │
//! │  conditions) │  / mediated)  │   settle delays, step reports)        │
//! ├──────────────┴───────────────┼───────────────────────────────────────┤
//! │   Executor clients (HTTP)    │   Remote transport (ssh + sshpass)    │
//! ├──────────────────────────────┴───────────────────────────────────────┤
//! │            Resource Ledger  +  per-resource lock table               │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: intake, dispatch, rollback, replication service and API
//! - [`replication`]: Ceph RBD mirroring command sequences and transport
//! - [`ledger`]: in-memory resource ledger, events and locks
//! - [`domain`]: records, operation descriptors and ports
//! - [`config`]: YAML deployment configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod replication;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{ControlPlaneConfig, ExecutorSettings};

pub use controlplane::{
    Accepted, ApiServer, ApiServerConfig, DispatchPolicy, Dispatcher, ExecutorFactory,
    OperationOutcome, OperationRunner, ReplicationService, RequestIntake, RestRouter,
    RollbackCoordinator, RoutingConfig,
};

pub use domain::model::{
    AttachmentResource, CallerContext, ReplicationResource, ReplicationState, ResourceKind,
    ResourceStatus, SnapshotResource, VolumeResource,
};

pub use domain::ports::{
    ExecutorClient, ExecutorConnector, Ledger, PasswordDecrypter, RemoteSession,
    RemoteTransport,
};

pub use error::{Error, ErrorKind, Result};

pub use ledger::{InMemoryLedger, LedgerEvent, ResourceLocks};

pub use replication::{
    AesGcmPasswordCipher, PlaintextPassword, ReplicationConfig, ReplicationOrchestrator,
    SshTransport,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

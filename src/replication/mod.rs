//! Cross-cluster block replication
//!
//! Ceph RBD mirroring between one primary and one secondary cluster,
//! driven over shell sessions to each cluster host.

pub mod commands;
pub mod config;
pub mod credentials;
pub mod orchestrator;
pub mod transport;

pub use commands::{CommandPlanner, PlannedStep, Side};
pub use config::{ClusterEndpoint, ReplicationConfig, SshConfig, StepPolicy};
pub use credentials::{AesGcmPasswordCipher, PlaintextPassword};
pub use orchestrator::*;
pub use transport::SshTransport;

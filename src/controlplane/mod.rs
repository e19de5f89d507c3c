//! Control Plane Module
//!
//! Request intake, dispatch to remote executors, extend rollback, tracked
//! background operations and the ledger-backed replication service.

pub mod api;
pub mod dispatcher;
pub mod executor;
pub mod intake;
pub mod replication;
pub mod rollback;
pub mod tasks;

pub use api::*;
pub use dispatcher::*;
pub use executor::*;
pub use intake::*;
pub use replication::*;
pub use rollback::*;
pub use tasks::*;

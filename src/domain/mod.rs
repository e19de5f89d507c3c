//! Domain layer - Resource model and port definitions
//!
//! This module defines the ledger records and the core traits (ports) that
//! adapters implement, following hexagonal architecture principles.

pub mod model;
pub mod options;
pub mod ports;

pub use model::*;
pub use options::*;
pub use ports::*;

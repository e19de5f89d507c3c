//! Resource Ledger
//!
//! The single source of truth for resource records and their status,
//! plus the per-resource lock table that serialises mutating operations.

pub mod events;
pub mod locks;
pub mod memory;

pub use events::*;
pub use locks::*;
pub use memory::*;

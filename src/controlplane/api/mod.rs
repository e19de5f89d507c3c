//! API Module
//!
//! REST surface of the control plane.

pub mod server;
pub mod rest;

pub use server::*;
pub use rest::*;

//! Remote Executor Clients
//!
//! Concrete connect/invoke/close clients for dock agents and the mediating
//! controller.

pub mod http;

pub use http::*;

use crate::domain::ports::ExecutorConnectorRef;
use std::sync::Arc;
use std::time::Duration;

/// Factory for executor connectors
pub struct ExecutorFactory;

impl ExecutorFactory {
    /// HTTP connector with the given per-request timeout
    pub fn http(request_timeout: Duration) -> ExecutorConnectorRef {
        Arc::new(HttpExecutorConnector::new(HttpExecutorConfig { request_timeout }))
    }
}

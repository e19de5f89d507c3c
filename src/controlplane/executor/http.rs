//! HTTP/JSON executor client
//!
//! Talks to a dock agent or the mediating controller over a small JSON API.
//! A client is connected for exactly one operation and then closed.

use crate::domain::options::*;
use crate::domain::ports::{ExecutorClient, ExecutorConnector, ExecutorKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Settings shared by every executor client
#[derive(Debug, Clone)]
pub struct HttpExecutorConfig {
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for HttpExecutorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Creates HTTP executor clients
#[derive(Debug, Clone, Default)]
pub struct HttpExecutorConnector {
    config: HttpExecutorConfig,
}

impl HttpExecutorConnector {
    pub fn new(config: HttpExecutorConfig) -> Self {
        Self { config }
    }
}

impl ExecutorConnector for HttpExecutorConnector {
    fn new_client(&self, kind: ExecutorKind) -> Box<dyn ExecutorClient> {
        Box::new(HttpExecutorClient::new(kind, self.config.clone()))
    }
}

// =============================================================================
// Client
// =============================================================================

struct Connection {
    client: Client,
    base: String,
}

/// JSON client for one executor endpoint
pub struct HttpExecutorClient {
    kind: ExecutorKind,
    config: HttpExecutorConfig,
    conn: Option<Connection>,
}

impl HttpExecutorClient {
    pub fn new(kind: ExecutorKind, config: HttpExecutorConfig) -> Self {
        Self {
            kind,
            config,
            conn: None,
        }
    }

    fn prefix(&self) -> &'static str {
        match self.kind {
            ExecutorKind::Dock => "/v1/dock",
            ExecutorKind::Controller => "/v1/controller",
        }
    }

    async fn call<T: Serialize + Sync>(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: &T,
    ) -> Result<ExecutorReply> {
        let conn = self.conn.as_ref().ok_or(Error::ExecutorNotConnected)?;
        let url = format!("{}{}{}", conn.base, self.prefix(), path);
        debug!("{} {} ({})", method, url, operation);

        let response = conn
            .client
            .request(method, &url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    Error::ExecutorConnect {
                        endpoint: conn.base.clone(),
                        reason: e.to_string(),
                    }
                } else {
                    Error::ExecutorHttp(e)
                }
            })?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(Error::ExecutorOperation {
                operation: operation.to_string(),
                reason: format!("status {}: {}", status, String::from_utf8_lossy(&bytes).trim()),
            });
        }
        if bytes.is_empty() {
            return Ok(ExecutorReply::default());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Accept `host:port` as well as full URLs
fn normalize_endpoint(endpoint: &str) -> Result<String> {
    let endpoint = endpoint.trim();
    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };
    let url = Url::parse(&with_scheme).map_err(|e| Error::ExecutorConnect {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    if url.host_str().is_none() {
        return Err(Error::ExecutorConnect {
            endpoint: endpoint.to_string(),
            reason: "endpoint has no host".into(),
        });
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

#[async_trait]
impl ExecutorClient for HttpExecutorClient {
    async fn connect(&mut self, endpoint: &str) -> Result<()> {
        let base = normalize_endpoint(endpoint)?;
        let client = Client::builder()
            .timeout(self.config.request_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| Error::ExecutorConnect {
                endpoint: base.clone(),
                reason: e.to_string(),
            })?;
        debug!("Connected {} client to {}", self.kind, base);
        self.conn = Some(Connection { client, base });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.conn = None;
        Ok(())
    }

    async fn create_volume(&self, opts: &CreateVolumeOpts) -> Result<ExecutorReply> {
        self.call("create_volume", Method::POST, "/volumes", opts)
            .await
    }

    async fn extend_volume(&self, opts: &ExtendVolumeOpts) -> Result<ExecutorReply> {
        let path = format!("/volumes/{}/extend", opts.id);
        self.call("extend_volume", Method::POST, &path, opts).await
    }

    async fn delete_volume(&self, opts: &DeleteVolumeOpts) -> Result<ExecutorReply> {
        let path = format!("/volumes/{}", opts.id);
        self.call("delete_volume", Method::DELETE, &path, opts).await
    }

    async fn create_volume_attachment(
        &self,
        opts: &CreateVolumeAttachmentOpts,
    ) -> Result<ExecutorReply> {
        self.call("create_volume_attachment", Method::POST, "/attachments", opts)
            .await
    }

    async fn delete_volume_attachment(
        &self,
        opts: &DeleteVolumeAttachmentOpts,
    ) -> Result<ExecutorReply> {
        let path = format!("/attachments/{}", opts.id);
        self.call("delete_volume_attachment", Method::DELETE, &path, opts)
            .await
    }

    async fn create_volume_snapshot(
        &self,
        opts: &CreateVolumeSnapshotOpts,
    ) -> Result<ExecutorReply> {
        self.call("create_volume_snapshot", Method::POST, "/snapshots", opts)
            .await
    }

    async fn delete_volume_snapshot(
        &self,
        opts: &DeleteVolumeSnapshotOpts,
    ) -> Result<ExecutorReply> {
        let path = format!("/snapshots/{}", opts.id);
        self.call("delete_volume_snapshot", Method::DELETE, &path, opts)
            .await
    }
}

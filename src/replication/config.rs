//! Replication configuration
//!
//! Describes the two clusters taking part in block mirroring, the
//! credentials used to reach them, and how step failures are handled.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a multi-step sequence reacts to a failed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepPolicy {
    /// Record the failure and keep going
    BestEffort,
    /// Stop at the first failure and return it
    AbortOnFirstFailure,
}

/// One cluster taking part in replication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEndpoint {
    /// Address peers use to reach this cluster (key exchange target)
    pub host: String,
    /// `host:port` the control plane dials for a session
    pub dial_addr: String,
    /// Ceph cluster name (selects `/etc/ceph/<name>.conf`)
    pub cluster_name: String,
}

/// SSH client settings for the shell transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SshConfig {
    pub ssh_bin: String,
    pub sshpass_bin: String,
    pub connect_timeout_secs: u64,
    pub strict_host_key_checking: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            ssh_bin: "ssh".to_string(),
            sshpass_bin: "sshpass".to_string(),
            connect_timeout_secs: 10,
            strict_host_key_checking: false,
        }
    }
}

/// Configuration for the replication orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationConfig {
    pub primary: ClusterEndpoint,
    pub secondary: ClusterEndpoint,
    pub username: String,
    /// Password as stored at rest
    pub password: String,
    /// When false the stored password is used verbatim
    #[serde(default = "default_true")]
    pub password_encrypted: bool,
    /// Environment variable holding the base64 AES-256 key
    #[serde(default = "default_credential_key_env")]
    pub credential_key_env: String,
    /// Directory used to exchange keyrings and configs between hosts
    #[serde(default = "default_file_path")]
    pub file_path: String,
    #[serde(default = "default_rbd_pool")]
    pub rbd_pool: String,
    /// Prefix turning a volume id into a backend image name
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,
    /// Pause between ordered failover steps
    #[serde(default = "default_settle_interval_secs")]
    pub settle_interval_secs: u64,
    #[serde(default = "default_create_policy")]
    pub create_policy: StepPolicy,
    #[serde(default = "default_delete_policy")]
    pub delete_policy: StepPolicy,
    #[serde(default)]
    pub ssh: SshConfig,
}

fn default_true() -> bool {
    true
}

fn default_credential_key_env() -> String {
    "SDS_CREDENTIAL_KEY".to_string()
}

fn default_file_path() -> String {
    "/etc/ceph/".to_string()
}

fn default_rbd_pool() -> String {
    "rbd".to_string()
}

fn default_image_prefix() -> String {
    "volume-".to_string()
}

fn default_settle_interval_secs() -> u64 {
    10
}

fn default_create_policy() -> StepPolicy {
    StepPolicy::BestEffort
}

fn default_delete_policy() -> StepPolicy {
    StepPolicy::AbortOnFirstFailure
}

impl ReplicationConfig {
    /// Config for a primary/secondary pair with every other field defaulted
    pub fn new(primary: ClusterEndpoint, secondary: ClusterEndpoint, username: &str) -> Self {
        Self {
            primary,
            secondary,
            username: username.to_string(),
            password: String::new(),
            password_encrypted: default_true(),
            credential_key_env: default_credential_key_env(),
            file_path: default_file_path(),
            rbd_pool: default_rbd_pool(),
            image_prefix: default_image_prefix(),
            settle_interval_secs: default_settle_interval_secs(),
            create_policy: default_create_policy(),
            delete_policy: default_delete_policy(),
            ssh: SshConfig::default(),
        }
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_secs(self.settle_interval_secs)
    }

    /// Backend image name for a volume id
    pub fn image_name(&self, volume_id: &str) -> String {
        format!("{}{}", self.image_prefix, volume_id)
    }

    /// Reject configurations that cannot describe two distinct clusters
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("primary.host", &self.primary.host),
            ("primary.dialAddr", &self.primary.dial_addr),
            ("secondary.host", &self.secondary.host),
            ("secondary.dialAddr", &self.secondary.dial_addr),
            ("username", &self.username),
            ("rbdPool", &self.rbd_pool),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Configuration(format!(
                    "replication.{} must not be empty",
                    field
                )));
            }
        }
        if self.primary.host == self.secondary.host {
            return Err(Error::Configuration(
                "replication primary and secondary hosts must differ".into(),
            ));
        }
        if self.primary.cluster_name == self.secondary.cluster_name {
            return Err(Error::Configuration(
                "replication primary and secondary cluster names must differ".into(),
            ));
        }
        if !self.file_path.ends_with('/') {
            return Err(Error::Configuration(
                "replication.filePath must end with '/'".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ReplicationConfig {
        ReplicationConfig::new(
            ClusterEndpoint {
                host: "10.0.0.1".into(),
                dial_addr: "10.0.0.1:22".into(),
                cluster_name: "ceph".into(),
            },
            ClusterEndpoint {
                host: "10.0.1.1".into(),
                dial_addr: "10.0.1.1:22".into(),
                cluster_name: "remote".into(),
            },
            "root",
        )
    }

    #[test]
    fn test_defaults_from_yaml() {
        let yaml = r#"
primary: { host: 10.0.0.1, dialAddr: "10.0.0.1:22", clusterName: ceph }
secondary: { host: 10.0.1.1, dialAddr: "10.0.1.1:22", clusterName: remote }
username: root
password: c2VjcmV0
"#;
        let config: ReplicationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.settle_interval(), Duration::from_secs(10));
        assert_eq!(config.create_policy, StepPolicy::BestEffort);
        assert_eq!(config.delete_policy, StepPolicy::AbortOnFirstFailure);
        assert!(config.password_encrypted);
        assert_eq!(config.file_path, "/etc/ceph/");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_same_host() {
        let mut config = sample();
        config.secondary.host = config.primary.host.clone();
        assert!(config.validate().is_err());

        let mut config = sample();
        config.username = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_image_name() {
        assert_eq!(sample().image_name("vol-1"), "volume-vol-1");
    }
}

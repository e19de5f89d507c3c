//! Ceph RBD mirroring command plans
//!
//! Builds the ordered command strings each replication operation runs.
//! Commands are built per physical cluster (cluster name, host) while steps
//! are labelled by the role the cluster plays for the volume.

use crate::replication::config::{ClusterEndpoint, ReplicationConfig};
use serde::{Deserialize, Serialize};

/// Role a cluster plays for a replicated volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Primary,
    Secondary,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Primary => write!(f, "primary"),
            Side::Secondary => write!(f, "secondary"),
        }
    }
}

/// A command bound to the side it runs on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub side: Side,
    pub name: &'static str,
    pub command: String,
}

impl PlannedStep {
    fn new(side: Side, name: &'static str, command: String) -> Self {
        Self {
            side,
            name,
            command,
        }
    }
}

/// Builds command plans for a pair of clusters
pub struct CommandPlanner<'a> {
    config: &'a ReplicationConfig,
    primary: &'a ClusterEndpoint,
    secondary: &'a ClusterEndpoint,
}

impl<'a> CommandPlanner<'a> {
    /// `primary`/`secondary` are the clusters currently holding each role
    pub fn new(
        config: &'a ReplicationConfig,
        primary: &'a ClusterEndpoint,
        secondary: &'a ClusterEndpoint,
    ) -> Self {
        Self {
            config,
            primary,
            secondary,
        }
    }

    fn cluster(&self, side: Side) -> &'a ClusterEndpoint {
        match side {
            Side::Primary => self.primary,
            Side::Secondary => self.secondary,
        }
    }

    fn peer(&self, side: Side) -> &'a ClusterEndpoint {
        match side {
            Side::Primary => self.secondary,
            Side::Secondary => self.primary,
        }
    }

    fn image_spec(&self, image: &str) -> String {
        format!("{}/{}", self.config.rbd_pool, image)
    }

    fn keyring_path(&self, cluster: &ClusterEndpoint) -> String {
        format!(
            "{}{}.client.{}.keyring",
            self.config.file_path, cluster.cluster_name, cluster.cluster_name
        )
    }

    fn conf_path(&self, cluster: &ClusterEndpoint) -> String {
        format!("{}{}.conf", self.config.file_path, cluster.cluster_name)
    }

    fn enable_image_features(&self, side: Side, image: &str) -> PlannedStep {
        let cluster = self.cluster(side);
        PlannedStep::new(
            side,
            "enable_image_features",
            format!(
                "rbd --cluster {} feature enable {} exclusive-lock,journaling",
                cluster.cluster_name,
                self.image_spec(image)
            ),
        )
    }

    fn install_mirror_daemon(&self, side: Side) -> PlannedStep {
        PlannedStep::new(
            side,
            "install_mirror_daemon",
            "apt install -y rbd-mirror".to_string(),
        )
    }

    fn create_keyring(&self, side: Side) -> PlannedStep {
        let cluster = self.cluster(side);
        PlannedStep::new(
            side,
            "create_keyring",
            format!(
                "ceph --cluster {name} auth get-or-create client.{name} mon 'allow r' \
                 osd 'allow class-read object_prefix rbd_children, allow rwx pool={pool}' -o {keyring}",
                name = cluster.cluster_name,
                pool = self.config.rbd_pool,
                keyring = self.keyring_path(cluster),
            ),
        )
    }

    fn enable_pool_mirroring(&self, side: Side) -> PlannedStep {
        let cluster = self.cluster(side);
        PlannedStep::new(
            side,
            "enable_pool_mirroring",
            format!(
                "rbd --cluster {} mirror pool enable {} image",
                cluster.cluster_name, self.config.rbd_pool
            ),
        )
    }

    /// The mirror daemon on each cluster needs the peer's keyring and conf
    fn exchange_keys(&self, side: Side) -> PlannedStep {
        let cluster = self.cluster(side);
        let peer = self.peer(side);
        PlannedStep::new(
            side,
            "exchange_keys",
            format!(
                "scp {} {} {}@{}:{}",
                self.keyring_path(cluster),
                self.conf_path(cluster),
                self.config.username,
                peer.host,
                self.config.file_path
            ),
        )
    }

    fn start_mirror_daemon(&self, side: Side) -> PlannedStep {
        PlannedStep::new(
            side,
            "start_mirror_daemon",
            format!(
                "systemctl start ceph-rbd-mirror@{}",
                self.cluster(side).cluster_name
            ),
        )
    }

    fn stop_mirror_daemon(&self, side: Side) -> PlannedStep {
        PlannedStep::new(
            side,
            "stop_mirror_daemon",
            format!(
                "systemctl stop ceph-rbd-mirror@{}",
                self.cluster(side).cluster_name
            ),
        )
    }

    fn add_peer(&self, side: Side) -> PlannedStep {
        let cluster = self.cluster(side);
        let peer = self.peer(side);
        PlannedStep::new(
            side,
            "add_peer",
            format!(
                "rbd --cluster {} mirror pool peer add {} client.{}@{}",
                cluster.cluster_name, self.config.rbd_pool, peer.cluster_name, peer.cluster_name
            ),
        )
    }

    /// Provision mirroring between both clusters for `image`
    pub fn create_plan(&self, image: &str) -> Vec<PlannedStep> {
        vec![
            self.enable_image_features(Side::Primary, image),
            self.install_mirror_daemon(Side::Primary),
            self.install_mirror_daemon(Side::Secondary),
            self.create_keyring(Side::Primary),
            self.create_keyring(Side::Secondary),
            self.enable_pool_mirroring(Side::Primary),
            self.enable_pool_mirroring(Side::Secondary),
            self.exchange_keys(Side::Primary),
            self.exchange_keys(Side::Secondary),
            self.start_mirror_daemon(Side::Primary),
            self.start_mirror_daemon(Side::Secondary),
            self.add_peer(Side::Primary),
            self.add_peer(Side::Secondary),
        ]
    }

    /// Turn on mirroring for one image in its pool
    pub fn enable_plan(&self, image: &str) -> Vec<PlannedStep> {
        vec![PlannedStep::new(
            Side::Primary,
            "enable_image_mirroring",
            format!(
                "rbd --cluster {} mirror image enable {} --pool {}",
                self.primary.cluster_name,
                self.image_spec(image),
                self.config.rbd_pool
            ),
        )]
    }

    /// demote(primary) -> promote(secondary) -> disable(primary) -> snapshot(secondary)
    pub fn disable_plan(&self, image: &str) -> Vec<PlannedStep> {
        let spec = self.image_spec(image);
        vec![
            PlannedStep::new(
                Side::Primary,
                "demote",
                format!(
                    "rbd --cluster {} mirror image demote {}",
                    self.primary.cluster_name, spec
                ),
            ),
            PlannedStep::new(
                Side::Secondary,
                "promote",
                format!(
                    "rbd --cluster {} mirror image promote {}",
                    self.secondary.cluster_name, spec
                ),
            ),
            PlannedStep::new(
                Side::Primary,
                "disable",
                format!(
                    "rbd --cluster {} mirror image disable {} --force",
                    self.primary.cluster_name, spec
                ),
            ),
            PlannedStep::new(
                Side::Secondary,
                "snapshot",
                format!(
                    "rbd --cluster {} snap create {}@{}",
                    self.secondary.cluster_name, spec, image
                ),
            ),
        ]
    }

    /// Stop the mirror daemon on both clusters
    pub fn delete_plan(&self) -> Vec<PlannedStep> {
        vec![
            self.stop_mirror_daemon(Side::Primary),
            self.stop_mirror_daemon(Side::Secondary),
        ]
    }
}

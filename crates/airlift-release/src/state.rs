//! Cluster-side state the engine templates into manifests
//!
//! Registry and git server coordinates plus credentials, written by the
//! cluster initialization flow and read here for placeholder substitution
//! and per-namespace secret provisioning.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Distro marker for deployments with no registry or git server
pub const YOLO_DISTRO: &str = "YOLO";

const REDACTED: &str = "**sanitized**";

/// Airgap state of the target cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterState {
    /// Kubernetes distribution (`YOLO` when no airgap services exist)
    pub distro: String,
    /// Default storage class
    pub storage_class: String,
    /// Image registry coordinates
    pub registry: RegistryInfo,
    /// Git server coordinates
    pub git_server: GitServerInfo,
}

impl ClusterState {
    /// Whether this state describes a stateless YOLO deployment
    pub fn is_yolo(&self) -> bool {
        self.distro == YOLO_DISTRO
    }
}

/// Image registry coordinates and credentials
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryInfo {
    /// Registry address (`host:port`)
    pub address: String,
    /// NodePort the in-cluster registry is exposed on
    pub node_port: u16,
    /// Username with push rights
    pub push_username: String,
    /// Password for [`Self::push_username`]
    pub push_password: String,
    /// Username with pull rights
    pub pull_username: String,
    /// Password for [`Self::pull_username`]
    pub pull_password: String,
}

impl fmt::Debug for RegistryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryInfo")
            .field("address", &self.address)
            .field("node_port", &self.node_port)
            .field("push_username", &self.push_username)
            .field("push_password", &REDACTED)
            .field("pull_username", &self.pull_username)
            .field("pull_password", &REDACTED)
            .finish()
    }
}

/// Git server coordinates and credentials
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitServerInfo {
    /// Git server base URL
    pub address: String,
    /// Username with push rights
    pub push_username: String,
    /// Password for [`Self::push_username`]
    pub push_password: String,
    /// Username with pull rights
    pub pull_username: String,
    /// Password for [`Self::pull_username`]
    pub pull_password: String,
}

impl fmt::Debug for GitServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitServerInfo")
            .field("address", &self.address)
            .field("push_username", &self.push_username)
            .field("push_password", &REDACTED)
            .field("pull_username", &self.pull_username)
            .field("pull_password", &REDACTED)
            .finish()
    }
}

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::resources::common::DEFAULT_IMAGE;

/// PostgreSQL is the Schema for the postgresqls API
///
/// Each entry in `nodes` becomes one repmgr cluster member backed by its own
/// Deployment and Service. The map key is the node's stable identity.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "postgresql.example.com",
    version = "v1",
    kind = "PostgreSQL",
    plural = "postgresqls",
    shortname = "pgsql",
    namespaced,
    status = "PostgreSQLStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".spec.managementState"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgreSQLSpec {
    /// Whether the operator acts on this cluster at all
    #[serde(default)]
    pub management_state: ManagementState,

    /// Desired cluster members keyed by node name
    #[serde(default)]
    pub nodes: BTreeMap<String, PostgreSQLNode>,
}

/// Management mode of a cluster
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ManagementState {
    /// The operator drives the cluster towards its spec
    #[default]
    Managed,
    /// The operator leaves every resource untouched
    Unmanaged,
}

/// A single member of the cluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgreSQLNode {
    /// Container image running PostgreSQL with repmgr
    #[serde(default = "default_image")]
    pub image: String,

    /// Resource requirements for the node's container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Data volume configuration
    #[serde(default)]
    pub storage: StorageSpec,

    /// Failover priority, higher wins. Ties are broken by node name.
    #[serde(default = "default_priority")]
    pub priority: i32,
}

impl Default for PostgreSQLNode {
    fn default() -> Self {
        Self {
            image: default_image(),
            resources: None,
            storage: StorageSpec::default(),
            priority: default_priority(),
        }
    }
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

fn default_priority() -> i32 {
    100
}

/// Resource requirements for a node's container
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// CPU and memory limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    /// CPU and memory requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Storage configuration for a node's data directory
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class for a persistent volume claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Volume size (e.g., "10Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// How a node's data volume is backed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VolumeKind {
    /// Persistent volume claim with the given class and size
    PersistentClaim { storage_class: String, size: String },
    /// emptyDir bounded by a size limit
    BoundedEphemeral { size: String },
    /// emptyDir without a limit
    Ephemeral,
}

impl StorageSpec {
    /// Classify the storage request.
    ///
    /// A claim needs both a class and a size; a size alone only bounds an
    /// ephemeral volume.
    pub fn volume_kind(&self) -> VolumeKind {
        match (&self.storage_class, &self.size) {
            (Some(class), Some(size)) => VolumeKind::PersistentClaim {
                storage_class: class.clone(),
                size: size.clone(),
            },
            (_, Some(size)) => VolumeKind::BoundedEphemeral { size: size.clone() },
            _ => VolumeKind::Ephemeral,
        }
    }
}

/// Observed state of the cluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgreSQLStatus {
    /// Last reconciled state of every node, keyed by node name
    #[serde(default)]
    pub nodes: BTreeMap<String, PostgreSQLNodeStatus>,
}

/// Observed state of a single node
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PostgreSQLNodeStatus {
    pub deployment_name: String,
    pub service_name: String,
    /// Server version, "unknown" when it could not be determined
    pub pg_version: String,
    pub role: NodeRole,
    /// repmgr priority, -1 when unknown
    pub priority: i32,
}

/// Role of a node as reported by the repmgr catalog
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Primary,
    Standby,
    #[default]
    Unknown,
}

impl NodeRole {
    /// Map the `type` column of `repmgr.nodes` onto a role
    pub fn from_repmgr_type(value: &str) -> Self {
        if value == "primary" {
            NodeRole::Primary
        } else {
            NodeRole::Standby
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Standby => write!(f, "standby"),
            NodeRole::Unknown => write!(f, "unknown"),
        }
    }
}

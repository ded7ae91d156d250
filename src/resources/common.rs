//! Common utilities for Kubernetes resource generation
//!
//! Names, labels and constants shared by every generator so that the
//! per-node objects, the routing Services and the label selectors that tie
//! them together always agree.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::PostgreSQL;

/// API version for the PostgreSQL CRD
pub const API_VERSION: &str = "postgresql.example.com/v1";

/// Kind for the PostgreSQL CRD
pub const KIND: &str = "PostgreSQL";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "repmgr-operator";

/// Port PostgreSQL listens on inside every node
pub const POSTGRESQL_PORT: i32 = 5432;

/// Image used when a node does not name one
pub const DEFAULT_IMAGE: &str = "mcyprian/postgresql-10-fedora29";

/// Container entrypoint that starts PostgreSQL and repmgrd
pub const STARTUP_COMMAND: &str = "statefulset-startup";

/// Exec probe used for readiness and liveness
pub const HEALTH_CHECK_COMMAND: &str = "/usr/libexec/check-container";

/// Wrapper that sets up the container environment before running a command
pub const SHELL_ENTRYPOINT: &str = "shell-entrypoint";

/// Mount point of the data volume
pub const PGDATA_PATH: &str = "/var/lib/pgsql/data";

/// Label carrying the owning cluster's name
pub const CLUSTER_LABEL: &str = "cluster-name";

/// Label carrying the node name
pub const NODE_LABEL: &str = "node-name";

/// Generate an owner reference for a PostgreSQL cluster
///
/// Every child object is owned by the cluster so it is garbage collected
/// when the cluster is deleted.
pub fn owner_reference(cluster: &PostgreSQL) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels shared by every object belonging to a cluster
pub fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            "postgresql".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Labels identifying a single node's objects
pub fn node_labels(cluster_name: &str, node_name: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster_name);
    labels.insert(NODE_LABEL.to_string(), node_name.to_string());
    labels
}

/// Selector matching exactly one node's pods
pub fn node_selector(cluster_name: &str, node_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
        (NODE_LABEL.to_string(), node_name.to_string()),
    ])
}

/// Label selector string matching every object of a cluster
pub fn cluster_label_selector(cluster_name: &str) -> String {
    format!("{}={}", CLUSTER_LABEL, cluster_name)
}

/// Label selector string matching one node's objects
pub fn node_label_selector(cluster_name: &str, node_name: &str) -> String {
    format!(
        "{}={},{}={}",
        CLUSTER_LABEL, cluster_name, NODE_LABEL, node_name
    )
}

/// Name of a node's Deployment and Service
pub fn node_resource_name(cluster_name: &str, node_name: &str) -> String {
    format!("{}-{}", cluster_name, node_name)
}

/// Name of the Service that routes to the current primary
pub fn primary_service_name(cluster_name: &str) -> String {
    format!("{}-primary", cluster_name)
}

/// Name of the Service that spreads reads across every node
pub fn replicas_service_name(cluster_name: &str) -> String {
    format!("{}-replicas", cluster_name)
}

/// Name of the generated credentials Secret
pub fn credentials_secret_name(cluster_name: &str) -> String {
    format!("{}-credentials", cluster_name)
}

/// Name of the shared repmgr configuration ConfigMap
pub fn repmgr_config_name(cluster_name: &str) -> String {
    format!("{}-repmgr-conf", cluster_name)
}

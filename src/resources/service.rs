//! Service generation for repmgr clusters
//!
//! Each node gets its own ClusterIP Service, which is also the host repmgr
//! uses to reach it. Two aggregate Services route client traffic:
//! `<cluster>-primary` is pinned to whichever node is currently primary and
//! `<cluster>-replicas` spreads reads over every node of the cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use kube::ResourceExt;

use crate::crd::PostgreSQL;
use crate::resources::common::{
    cluster_labels, node_labels, node_resource_name, node_selector, owner_reference,
    primary_service_name, replicas_service_name, CLUSTER_LABEL, NODE_LABEL, POSTGRESQL_PORT,
};

fn postgresql_port() -> ServicePort {
    ServicePort {
        port: POSTGRESQL_PORT,
        target_port: Some(IntOrString::Int(POSTGRESQL_PORT)),
        name: Some("postgresql".to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn cluster_ip_service(
    cluster: &PostgreSQL,
    name: String,
    labels: BTreeMap<String, String>,
    selector: BTreeMap<String, String>,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cluster.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![postgresql_port()]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the dedicated Service of a single node
pub fn generate_node_service(cluster: &PostgreSQL, node_name: &str) -> Service {
    let cluster_name = cluster.name_any();
    cluster_ip_service(
        cluster,
        node_resource_name(&cluster_name, node_name),
        node_labels(&cluster_name, node_name),
        node_selector(&cluster_name, node_name),
    )
}

/// Generate the read-write Service pointing at `primary_node`
pub fn generate_primary_service(cluster: &PostgreSQL, primary_node: &str) -> Service {
    let cluster_name = cluster.name_any();
    cluster_ip_service(
        cluster,
        primary_service_name(&cluster_name),
        cluster_labels(&cluster_name),
        node_selector(&cluster_name, primary_node),
    )
}

/// Generate the read-only Service spanning every node
pub fn generate_replicas_service(cluster: &PostgreSQL) -> Service {
    let cluster_name = cluster.name_any();
    cluster_ip_service(
        cluster,
        replicas_service_name(&cluster_name),
        cluster_labels(&cluster_name),
        BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster_name.clone())]),
    )
}

/// Point an existing Service's selector at `primary_node`.
///
/// Returns whether the selector changed.
pub fn repoint_selector(service: &mut Service, cluster_name: &str, primary_node: &str) -> bool {
    let selector = node_selector(cluster_name, primary_node);
    let spec = service.spec.get_or_insert_with(ServiceSpec::default);
    if spec.selector.as_ref() == Some(&selector) {
        return false;
    }
    spec.selector = Some(selector);
    true
}

/// The node a primary Service currently routes to
pub fn routed_node(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()?
        .selector
        .as_ref()?
        .get(NODE_LABEL)
        .map(String::as_str)
}

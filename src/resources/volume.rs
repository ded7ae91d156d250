//! Data volume generation for cluster nodes

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Volume, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::core::ObjectMeta;
use kube::ResourceExt;

use crate::crd::{PostgreSQL, StorageSpec, VolumeKind};
use crate::resources::common::{node_labels, node_resource_name, owner_reference};

/// Name of the data volume inside the pod spec
pub const DATA_VOLUME_NAME: &str = "pgdata";

/// Build the data volume for a node
///
/// Persistent storage refers to the claim produced by [`generate_pvc`];
/// the claim itself must be created separately.
pub fn generate_data_volume(cluster_name: &str, node_name: &str, storage: &StorageSpec) -> Volume {
    let mut volume = Volume {
        name: DATA_VOLUME_NAME.to_string(),
        ..Default::default()
    };

    match storage.volume_kind() {
        VolumeKind::PersistentClaim { .. } => {
            volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
                claim_name: node_resource_name(cluster_name, node_name),
                read_only: None,
            });
        }
        VolumeKind::BoundedEphemeral { size } => {
            volume.empty_dir = Some(EmptyDirVolumeSource {
                size_limit: Some(Quantity(size)),
                ..Default::default()
            });
        }
        VolumeKind::Ephemeral => {
            volume.empty_dir = Some(EmptyDirVolumeSource::default());
        }
    }

    volume
}

/// Generate the PersistentVolumeClaim for a node, if its storage needs one
pub fn generate_pvc(
    cluster: &PostgreSQL,
    node_name: &str,
    storage: &StorageSpec,
) -> Option<PersistentVolumeClaim> {
    let VolumeKind::PersistentClaim {
        storage_class,
        size,
    } = storage.volume_kind()
    else {
        return None;
    };

    let cluster_name = cluster.name_any();

    Some(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(node_resource_name(&cluster_name, node_name)),
            namespace: cluster.namespace(),
            labels: Some(node_labels(&cluster_name, node_name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(storage_class),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

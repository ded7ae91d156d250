//! Per-node Deployment generation
//!
//! Every cluster node runs as a single-replica Deployment with the `Recreate`
//! strategy, so at most one pod ever owns the node's data volume.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, ExecAction,
    PodSpec, PodTemplateSpec, Probe, ResourceRequirements as K8sResourceRequirements,
    SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::ObjectMeta;
use kube::ResourceExt;

use crate::crd::{PostgreSQL, PostgreSQLNode, ResourceList, ResourceRequirements};
use crate::resources::common::{
    credentials_secret_name, node_labels, node_resource_name, node_selector, owner_reference,
    repmgr_config_name, HEALTH_CHECK_COMMAND, PGDATA_PATH, POSTGRESQL_PORT, STARTUP_COMMAND,
};
use crate::resources::configmap::REPMGR_CONF_DIR;
use crate::resources::exec::{StartupOperation, CONTAINER_NAME};
use crate::resources::secret::{DATABASE_PASSWORD_KEY, REPMGR_PASSWORD_KEY};
use crate::resources::volume::{generate_data_volume, DATA_VOLUME_NAME};

/// Environment variable carrying the repmgr node id
pub const NODE_ID_ENV: &str = "NODE_ID";

const REPMGR_CONF_VOLUME_NAME: &str = "repmgr-conf";

/// Everything needed to render one node's Deployment
#[derive(Clone, Debug)]
pub struct NodeDeploymentParams<'a> {
    pub node_name: &'a str,
    pub spec: &'a PostgreSQLNode,
    /// repmgr node id, stable across Deployment recreation
    pub node_id: i32,
    pub operation: StartupOperation,
    /// Application database user
    pub database_user: &'a str,
    /// Application database name
    pub database_name: &'a str,
}

/// Generate the Deployment for a cluster node
pub fn generate_deployment(cluster: &PostgreSQL, params: &NodeDeploymentParams<'_>) -> Deployment {
    let cluster_name = cluster.name_any();
    let name = node_resource_name(&cluster_name, params.node_name);
    let labels = node_labels(&cluster_name, params.node_name);

    let pod_spec = PodSpec {
        hostname: Some(name.clone()),
        containers: vec![generate_container(&cluster_name, &name, params)],
        volumes: Some(vec![
            generate_data_volume(&cluster_name, params.node_name, &params.spec.storage),
            Volume {
                name: REPMGR_CONF_VOLUME_NAME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: repmgr_config_name(&cluster_name),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(node_selector(&cluster_name, params.node_name)),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                rolling_update: None,
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn generate_container(cluster_name: &str, host: &str, params: &NodeDeploymentParams<'_>) -> Container {
    let secret_name = credentials_secret_name(cluster_name);

    let env = vec![
        env_value("POSTGRESQL_USER", params.database_user),
        env_secret("POSTGRESQL_PASSWORD", &secret_name, DATABASE_PASSWORD_KEY),
        env_value("POSTGRESQL_DATABASE", params.database_name),
        env_value("ENABLE_REPMGR", "true"),
        env_secret("REPMGR_PASSWORD", &secret_name, REPMGR_PASSWORD_KEY),
        env_value("NODE_NAME", params.node_name),
        env_value(NODE_ID_ENV, &params.node_id.to_string()),
        env_value("NODE_HOST", host),
        env_value("STARTUP_OPERATION", params.operation.as_str()),
    ];

    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(params.spec.image.clone()),
        command: Some(vec![STARTUP_COMMAND.to_string()]),
        ports: Some(vec![ContainerPort {
            container_port: POSTGRESQL_PORT,
            name: Some("postgresql".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(env),
        resources: params.spec.resources.as_ref().map(resource_requirements),
        readiness_probe: Some(health_probe(10, 5)),
        liveness_probe: Some(health_probe(60, 10)),
        volume_mounts: Some(vec![
            VolumeMount {
                name: DATA_VOLUME_NAME.to_string(),
                mount_path: PGDATA_PATH.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: REPMGR_CONF_VOLUME_NAME.to_string(),
                mount_path: REPMGR_CONF_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn env_value(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn env_secret(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

fn health_probe(initial_delay_seconds: i32, period_seconds: i32) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![HEALTH_CHECK_COMMAND.to_string()]),
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(period_seconds),
        timeout_seconds: Some(10),
        ..Default::default()
    }
}

/// Convert the CRD resource requirements into the Kubernetes type
pub fn resource_requirements(resources: &ResourceRequirements) -> K8sResourceRequirements {
    K8sResourceRequirements {
        limits: resources.limits.as_ref().map(quantities),
        requests: resources.requests.as_ref().map(quantities),
        ..Default::default()
    }
}

fn quantities(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

/// Copy the drift-managed fields of `desired` onto `live`.
///
/// Only the container image, container resources and the data volume are
/// reconciled. Returns whether anything changed.
pub fn apply_drift(live: &mut Deployment, desired: &Deployment) -> bool {
    let Some(desired_pod) = pod_spec(desired) else {
        return false;
    };
    let desired_container = desired_pod.containers.first();
    let desired_volume = data_volume(desired_pod).cloned();

    let Some(live_pod) = live
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
    else {
        return false;
    };

    let mut changed = false;

    if let (Some(live_container), Some(desired_container)) =
        (live_pod.containers.first_mut(), desired_container)
    {
        if live_container.image != desired_container.image {
            live_container.image = desired_container.image.clone();
            changed = true;
        }
        if !same_resources(&live_container.resources, &desired_container.resources) {
            live_container.resources = desired_container.resources.clone();
            changed = true;
        }
    }

    if let Some(desired_volume) = desired_volume {
        let volumes = live_pod.volumes.get_or_insert_with(Vec::new);
        match volumes.iter_mut().find(|v| v.name == DATA_VOLUME_NAME) {
            Some(live_volume) if *live_volume == desired_volume => {}
            Some(live_volume) => {
                *live_volume = desired_volume;
                changed = true;
            }
            None => {
                volumes.push(desired_volume);
                changed = true;
            }
        }
    }

    changed
}

/// The API server normalizes absent resources to an empty struct
fn same_resources(
    live: &Option<K8sResourceRequirements>,
    desired: &Option<K8sResourceRequirements>,
) -> bool {
    let empty = K8sResourceRequirements::default();
    let live = live.as_ref().unwrap_or(&empty);
    let desired = desired.as_ref().unwrap_or(&empty);
    same_quantities(&live.limits, &desired.limits)
        && same_quantities(&live.requests, &desired.requests)
}

/// The API server stores quantities in canonical form, so `1000m` comes
/// back as `1`. Compare by value, falling back to the raw text.
fn same_quantities(
    live: &Option<BTreeMap<String, Quantity>>,
    desired: &Option<BTreeMap<String, Quantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let live = live.as_ref().unwrap_or(&empty);
    let desired = desired.as_ref().unwrap_or(&empty);

    live.len() == desired.len()
        && live.iter().all(|(name, value)| {
            desired.get(name).is_some_and(|wanted| {
                value == wanted
                    || matches!(
                        (quantity_millis(value), quantity_millis(wanted)),
                        (Some(a), Some(b)) if a == b
                    )
            })
        })
}

/// Value of a quantity in thousandths of its unit. `None` when the text is
/// not a plain decimal with an optional suffix or the value is not a whole
/// number of thousandths.
fn quantity_millis(quantity: &Quantity) -> Option<i128> {
    let value = quantity.0.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    let mantissa: i128 = format!("{}{}", whole, fraction).parse().ok()?;
    let scale = 10i128.checked_pow(fraction.len() as u32)?;

    let multiplier: i128 = match suffix {
        "m" => 1,
        "" => 1_000,
        "k" => 1_000_000,
        "M" => 1_000_000_000,
        "G" => 1_000_000_000_000,
        "T" => 1_000_000_000_000_000,
        "P" => 1_000_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000_000,
        "Ki" => 1_000 << 10,
        "Mi" => 1_000 << 20,
        "Gi" => 1_000 << 30,
        "Ti" => 1_000 << 40,
        "Pi" => 1_000 << 50,
        "Ei" => 1_000 << 60,
        exponent => {
            let exponent: u32 = exponent.strip_prefix(['e', 'E'])?.parse().ok()?;
            10i128.checked_pow(exponent)?.checked_mul(1_000)?
        }
    };

    let scaled = mantissa.checked_mul(multiplier)?;
    (scaled % scale == 0).then(|| scaled / scale)
}

fn pod_spec(deployment: &Deployment) -> Option<&PodSpec> {
    deployment.spec.as_ref().and_then(|s| s.template.spec.as_ref())
}

fn data_volume(pod: &PodSpec) -> Option<&Volume> {
    pod.volumes
        .as_ref()
        .and_then(|volumes| volumes.iter().find(|v| v.name == DATA_VOLUME_NAME))
}

/// Recover the repmgr node id stored in a Deployment's container env
pub fn node_id_from_deployment(deployment: &Deployment) -> Option<i32> {
    pod_spec(deployment)?
        .containers
        .iter()
        .filter_map(|c| c.env.as_ref())
        .flatten()
        .find(|e| e.name == NODE_ID_ENV)
        .and_then(|e| e.value.as_deref())
        .and_then(|v| v.parse().ok())
}

/// Whether the Deployment reports exactly one ready replica
pub fn is_deployment_ready(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        == Some(1)
}

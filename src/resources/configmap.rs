//! Shared repmgr configuration
//!
//! Every node mounts the same `repmgr.conf` template. Node specific values
//! are left as environment placeholders that the container entrypoint
//! expands from `NODE_ID`, `NODE_NAME` and `NODE_HOST`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ObjectMeta;
use kube::ResourceExt;

use crate::crd::PostgreSQL;
use crate::resources::common::{
    cluster_labels, owner_reference, repmgr_config_name, PGDATA_PATH,
};

/// Key of the configuration file inside the ConfigMap
pub const REPMGR_CONF_KEY: &str = "repmgr.conf";

/// Directory the ConfigMap is mounted at
pub const REPMGR_CONF_DIR: &str = "/app/repmgr";

/// Generate the repmgr configuration ConfigMap
pub fn generate_repmgr_config(cluster: &PostgreSQL) -> ConfigMap {
    let cluster_name = cluster.name_any();

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(repmgr_config_name(&cluster_name)),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(&cluster_name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            REPMGR_CONF_KEY.to_string(),
            repmgr_conf(),
        )])),
        ..Default::default()
    }
}

/// Render the repmgr.conf template
fn repmgr_conf() -> String {
    let conf_path = format!("{}/{}", REPMGR_CONF_DIR, REPMGR_CONF_KEY);
    format!(
        r#"node_id=${{NODE_ID}}
node_name='${{NODE_NAME}}'
conninfo='host=${{NODE_HOST}} user=repmgr dbname=repmgr connect_timeout=2'
data_directory='{PGDATA_PATH}'
use_replication_slots=1
failover=automatic
priority=100
promote_command='repmgr -f {conf_path} standby promote'
follow_command='repmgr -f {conf_path} standby follow --upstream-node-id=%n'
"#
    )
}

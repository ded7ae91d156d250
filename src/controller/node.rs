//! The per-node capability set the cluster pass operates on

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::controller::error::Result;
use crate::crd::{NodeRole, PostgreSQLNode, PostgreSQLNodeStatus};
use crate::resources::repmgr_db::{RepmgrDatabase, UNKNOWN_VERSION};

pub use crate::resources::exec::StartupOperation;

/// What [`Node::update`] had to do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Live resources and catalog already matched the spec
    Unchanged,
    /// The workload was rewritten or the catalog priority changed
    Updated,
    /// The workload was missing and has been created again
    Recreated,
}

/// A single repmgr cluster member and the resources backing it
#[async_trait]
pub trait Node: Send + Sync {
    /// Node name, the key in the cluster spec
    fn name(&self) -> &str;

    /// repmgr node id
    fn id(&self) -> i32;

    /// Whether the id was recovered from the repmgr catalog instead of
    /// freshly allocated. Such nodes rejoin rather than register.
    fn id_recovered(&self) -> bool;

    /// Create the node's resources. Objects that already exist are kept.
    async fn create(&mut self) -> Result<()>;

    /// Reconcile drift between `spec` and the live resources.
    ///
    /// Priority changes are written through `primary_db`, the writable
    /// catalog of the current primary.
    async fn update(
        &mut self,
        spec: &PostgreSQLNode,
        primary_db: Option<&dyn RepmgrDatabase>,
    ) -> Result<UpdateOutcome>;

    /// Release every resource of the node. Already absent objects are fine.
    async fn delete(&mut self) -> Result<()>;

    /// Whether the node's workload reports one ready replica
    async fn is_ready(&self) -> Result<bool>;

    /// Whether the node is a member of the repmgr cluster
    async fn is_registered(&self) -> Result<bool>;

    /// Register the node with repmgr
    async fn register(&self, operation: StartupOperation) -> Result<()>;

    /// Observe version, role and priority
    async fn status(&self) -> PostgreSQLNodeStatus;

    /// The node's own catalog client
    fn database(&self) -> Arc<dyn RepmgrDatabase>;
}

/// Query a node's catalog for its status.
///
/// Failures degrade to "unknown" values rather than errors.
pub async fn observe_status(
    node_name: &str,
    deployment_name: &str,
    service_name: &str,
    db: &dyn RepmgrDatabase,
) -> PostgreSQLNodeStatus {
    let pg_version = match db.version().await {
        Ok(version) => version,
        Err(e) => {
            warn!(node = node_name, error = %e, "Failed to query server version");
            UNKNOWN_VERSION.to_string()
        }
    };

    let (role, priority) = match db.node_info(node_name).await {
        Ok(Some(info)) => (info.role, info.priority),
        Ok(None) => (NodeRole::Unknown, -1),
        Err(e) => {
            warn!(node = node_name, error = %e, "Failed to query node info");
            (NodeRole::Unknown, -1)
        }
    };

    PostgreSQLNodeStatus {
        deployment_name: deployment_name.to_string(),
        service_name: service_name.to_string(),
        pg_version,
        role,
        priority,
    }
}

/// Push `desired` priority into the catalog when it differs.
///
/// The current value is read from the node's own catalog and the write goes
/// to `primary_db`, since a standby's database is read-only. Returns whether
/// an update was issued.
pub async fn sync_priority(
    node_name: &str,
    own_db: &dyn RepmgrDatabase,
    primary_db: &dyn RepmgrDatabase,
    desired: i32,
) -> Result<bool> {
    let Some(info) = own_db.node_info(node_name).await? else {
        return Ok(false);
    };
    if info.priority == desired {
        return Ok(false);
    }

    debug!(
        node = node_name,
        from = info.priority,
        to = desired,
        "Updating repmgr priority"
    );
    primary_db.update_node_priority(node_name, desired).await?;
    Ok(true)
}

//! One reconciliation pass over a repmgr cluster
//!
//! The pass drives the registry towards the desired node set: it makes sure a primary is
//! tracked and routed, picks up failovers reported by the catalog, creates,
//! updates and registers nodes, and removes nodes that left the cluster spec.
//! Per-node problems only mark the pass as not converged; losing the primary
//! or its routing aborts the pass.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::controller::election::select_primary;
use crate::controller::error::Result;
use crate::controller::node::{Node, StartupOperation, UpdateOutcome};
use crate::controller::registry::ClusterRegistry;
use crate::crd::{NodeRole, PostgreSQLNode, PostgreSQLSpec, PostgreSQLStatus};

/// Where nodes come from and how primary traffic is routed
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Build a node that does not exist yet. Nothing is created until
    /// [`Node::create`] is called.
    fn build_node(
        &self,
        name: &str,
        spec: &PostgreSQLNode,
        id: i32,
        operation: StartupOperation,
        id_recovered: bool,
    ) -> Box<dyn Node>;

    /// Nodes whose resources already exist, e.g. after an operator restart
    async fn attach_existing(&self) -> Result<Vec<Box<dyn Node>>>;

    /// Send primary traffic to `node_name`
    async fn route_primary(&self, node_name: &str) -> Result<()>;
}

/// Result of a pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PassOutcome {
    /// The cluster has not converged and should be reconciled again soon
    pub requeue: bool,
    /// Observed status to publish
    pub status: PostgreSQLStatus,
    /// Node promoted by a failover detected during this pass
    pub failover: Option<String>,
    /// Spec nodes observed ready
    pub ready_nodes: usize,
}

/// Runs passes against a cluster's registry
pub struct ClusterReconciler<'a> {
    backend: &'a dyn ClusterBackend,
    registry: &'a mut ClusterRegistry,
}

impl<'a> ClusterReconciler<'a> {
    pub fn new(backend: &'a dyn ClusterBackend, registry: &'a mut ClusterRegistry) -> Self {
        Self { backend, registry }
    }

    /// Run one pass.
    ///
    /// `current` is the persisted status; entries for nodes not observed this
    /// pass are carried over from it.
    pub async fn reconcile(
        &mut self,
        spec: &PostgreSQLSpec,
        current: &PostgreSQLStatus,
    ) -> Result<PassOutcome> {
        let mut converged = true;
        let mut outcome = PassOutcome {
            status: current.clone(),
            ..Default::default()
        };

        self.attach_existing().await;

        if self.registry.primary().is_none() {
            converged &= self.ensure_primary(spec).await?;
        }

        if let Some(primary) = self.registry.primary().map(str::to_string) {
            if self.registry.routed_primary() != Some(primary.as_str()) {
                self.route_primary(&primary).await?;
            }
        }

        // Failover has to be picked up before any registration decision
        let mut ready = BTreeSet::new();
        for name in spec.nodes.keys() {
            let Some(node) = self.registry.get(name) else {
                continue;
            };
            match node.is_ready().await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(node = %name, error = %e, "Failed to check readiness");
                    continue;
                }
            }
            ready.insert(name.clone());

            let status = node.status().await;
            let promoted = status.role == NodeRole::Primary
                && self.registry.primary() != Some(name.as_str());
            outcome.status.nodes.insert(name.clone(), status);

            if promoted {
                info!(node = %name, previous = ?self.registry.primary(), "Failover detected");
                self.registry.set_primary(name);
                self.route_primary(name).await?;
                outcome.failover = Some(name.clone());
            }
        }
        outcome.ready_nodes = ready.len();

        for (name, node_spec) in &spec.nodes {
            if !self.registry.contains(name) {
                match self
                    .create_node(name, node_spec, StartupOperation::StandbyRegister)
                    .await
                {
                    Ok(()) => info!(node = %name, "Created standby node"),
                    Err(e) => warn!(node = %name, error = %e, "Failed to create node"),
                }
                converged = false;
                continue;
            }

            match self.update_node(name, node_spec).await {
                Ok(UpdateOutcome::Unchanged) => {}
                Ok(UpdateOutcome::Updated) => {
                    debug!(node = %name, "Node updated, status is refreshed next pass");
                    converged = false;
                }
                Ok(UpdateOutcome::Recreated) => {
                    converged = false;
                    continue;
                }
                Err(e) => {
                    warn!(node = %name, error = %e, "Failed to update node");
                    converged = false;
                }
            }

            if !ready.contains(name) {
                converged = false;
                continue;
            }

            converged &= self.ensure_registered(name).await;
        }

        if let Some(primary) = self.registry.primary() {
            let observed_primary = outcome
                .status
                .nodes
                .get(primary)
                .is_some_and(|s| s.role == NodeRole::Primary);
            if ready.contains(primary) && !observed_primary {
                debug!(node = primary, "Primary is not yet reported by the catalog");
                converged = false;
            }
        }

        converged &= self.delete_extra_nodes(spec, &mut outcome.status).await;

        // Removing the primary leaves nothing tracked or routed until the
        // next pass elects one
        if self.registry.primary().is_none() || self.registry.routed_primary().is_none() {
            debug!("No routed primary after this pass");
            converged = false;
        }

        outcome
            .status
            .nodes
            .retain(|name, _| spec.nodes.contains_key(name));
        outcome.requeue = !converged;
        Ok(outcome)
    }

    /// Track nodes whose resources survived an operator restart
    async fn attach_existing(&mut self) {
        match self.backend.attach_existing().await {
            Ok(nodes) => {
                for node in nodes {
                    if self.registry.contains(node.name()) {
                        continue;
                    }
                    info!(node = node.name(), id = node.id(), "Attaching existing node");
                    self.registry.insert(node);
                }
            }
            Err(e) => warn!(error = %e, "Failed to look up existing nodes"),
        }
    }

    /// Find or create the primary. Returns whether nothing had to be created.
    async fn ensure_primary(&mut self, spec: &PostgreSQLSpec) -> Result<bool> {
        if let Some(name) = self.discover_primary().await {
            info!(node = %name, "Lost primary node discovered");
            self.registry.set_primary(&name);
            return Ok(true);
        }

        let (name, node_spec) = select_primary(&spec.nodes)?;
        if self.registry.contains(name) {
            info!(node = name, "Adopting tracked node as primary");
            self.registry.set_primary(name);
            return Ok(true);
        }

        info!(node = name, "Creating new primary node");
        self.create_node(name, node_spec, StartupOperation::PrimaryRegister)
            .await?;
        self.registry.set_primary(name);
        Ok(false)
    }

    /// A ready tracked node the catalog reports as primary
    async fn discover_primary(&self) -> Option<String> {
        for (name, node) in self.registry.iter() {
            if !matches!(node.is_ready().await, Ok(true)) {
                continue;
            }
            if node.status().await.role == NodeRole::Primary {
                return Some(name.to_string());
            }
        }
        None
    }

    async fn route_primary(&mut self, name: &str) -> Result<()> {
        info!(node = name, "Routing primary service");
        self.backend.route_primary(name).await?;
        self.registry.set_routed_primary(name);
        Ok(())
    }

    /// Create and track a node.
    ///
    /// A node the primary's catalog already knows keeps its old id and
    /// rejoins instead of registering.
    async fn create_node(
        &mut self,
        name: &str,
        spec: &PostgreSQLNode,
        operation: StartupOperation,
    ) -> Result<()> {
        let known_id = match self.registry.primary_db() {
            Some(db) => match db.node_info(name).await {
                Ok(info) => info.map(|i| i.id),
                Err(e) => {
                    debug!(node = name, error = %e, "Could not look up previous node id");
                    None
                }
            },
            None => None,
        };

        let (id, operation, recovered) = match known_id {
            Some(id) => (id, StartupOperation::NodeRejoin, true),
            None => (self.registry.next_id(), operation, false),
        };

        let mut node = self.backend.build_node(name, spec, id, operation, recovered);
        node.create().await?;
        self.registry.insert(node);
        Ok(())
    }

    async fn update_node(&mut self, name: &str, spec: &PostgreSQLNode) -> Result<UpdateOutcome> {
        let primary_db = self.registry.primary_db();
        let Some(node) = self.registry.get_mut(name) else {
            return Ok(UpdateOutcome::Unchanged);
        };
        let outcome = node.update(spec, primary_db.as_deref()).await?;
        // A recreated node may have taken its id back from the catalog
        let id = node.id();
        self.registry.reserve_id(id);
        Ok(outcome)
    }

    /// Register a ready node if needed. Returns whether it was already registered.
    async fn ensure_registered(&self, name: &str) -> bool {
        let Some(node) = self.registry.get(name) else {
            return false;
        };

        match node.is_registered().await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                warn!(node = name, error = %e, "Failed to check registration");
                return false;
            }
        }

        let operation = if node.id_recovered() {
            StartupOperation::NodeRejoin
        } else if self.registry.primary() == Some(name) {
            StartupOperation::PrimaryRegister
        } else {
            StartupOperation::StandbyRegister
        };

        info!(node = name, %operation, "Registering node");
        if let Err(e) = node.register(operation).await {
            warn!(node = name, error = %e, "Registration failed");
        }
        false
    }

    /// Delete tracked nodes that left the cluster spec.
    ///
    /// Nodes that fail to delete stay tracked. Returns whether every deletion succeeded.
    async fn delete_extra_nodes(
        &mut self,
        spec: &PostgreSQLSpec,
        status: &mut PostgreSQLStatus,
    ) -> bool {
        let mut all_deleted = true;
        let extra: Vec<String> = self
            .registry
            .names()
            .into_iter()
            .filter(|name| !spec.nodes.contains_key(name))
            .collect();

        for name in extra {
            let Some(node) = self.registry.get_mut(&name) else {
                continue;
            };
            info!(node = %name, "Deleting node");
            match node.delete().await {
                Ok(()) => {
                    self.registry.remove(&name);
                    status.nodes.remove(&name);
                }
                Err(e) => {
                    warn!(node = %name, error = %e, "Failed to delete node, will retry");
                    all_deleted = false;
                }
            }
        }

        all_deleted
    }
}

//! In-memory stand-ins for the Kubernetes API, pod exec and the repmgr catalog
//!
//! A [`FakeWorld`] plays the part of one cluster. Every node built through
//! [`FakeBackend`] shares the world's [`Catalog`], so a priority written
//! through one node's database is visible from every other node, the way
//! repmgr replicates its catalog. Mutating calls are appended to the world's
//! call log for the tests to assert on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::core::ObjectMeta;
use repmgr_operator::controller::cluster::ClusterBackend;
use repmgr_operator::controller::error::{Error, Result};
use repmgr_operator::controller::node::{
    observe_status, sync_priority, Node, StartupOperation, UpdateOutcome,
};
use repmgr_operator::controller::status::ClusterStatusApi;
use repmgr_operator::crd::{
    NodeRole, PostgreSQL, PostgreSQLNode, PostgreSQLNodeStatus, PostgreSQLSpec, PostgreSQLStatus,
};
use repmgr_operator::resources::repmgr_db::{DatabaseError, NodeInfo, RepmgrDatabase};

pub const TEST_VERSION: &str = "10.6";

/// Mutating operations observed by the fakes, in call order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Create {
        node: String,
        id: i32,
        operation: StartupOperation,
    },
    UpdateWorkload(String),
    Delete(String),
    Register {
        node: String,
        operation: StartupOperation,
    },
    Route(String),
    PriorityUpdate {
        via: String,
        node: String,
        priority: i32,
    },
}

/// The replicated `repmgr.nodes` table
#[derive(Default)]
pub struct Catalog {
    rows: Mutex<BTreeMap<String, NodeInfo>>,
}

impl Catalog {
    pub fn insert(&self, node: &str, id: i32, role: NodeRole, priority: i32) {
        self.rows
            .lock()
            .unwrap()
            .insert(node.to_string(), NodeInfo { id, role, priority });
    }

    pub fn remove(&self, node: &str) {
        self.rows.lock().unwrap().remove(node);
    }

    pub fn get(&self, node: &str) -> Option<NodeInfo> {
        self.rows.lock().unwrap().get(node).copied()
    }

    pub fn set_role(&self, node: &str, role: NodeRole) {
        if let Some(row) = self.rows.lock().unwrap().get_mut(node) {
            row.role = role;
        }
    }

    fn set_priority(&self, node: &str, priority: i32) -> bool {
        match self.rows.lock().unwrap().get_mut(node) {
            Some(row) => {
                row.priority = priority;
                true
            }
            None => false,
        }
    }
}

/// One node's connection to the catalog
pub struct FakeDatabase {
    owner: String,
    world: Arc<FakeWorld>,
    pub closes: AtomicUsize,
}

#[async_trait]
impl RepmgrDatabase for FakeDatabase {
    async fn version(&self) -> Result<String, DatabaseError> {
        if self.world.database_down.load(Ordering::SeqCst) {
            return Err(DatabaseError::Timeout(std::time::Duration::from_secs(5)));
        }
        Ok(TEST_VERSION.to_string())
    }

    async fn is_registered(&self, node_name: &str) -> Result<bool, DatabaseError> {
        Ok(self.world.catalog.get(node_name).is_some())
    }

    async fn node_info(&self, node_name: &str) -> Result<Option<NodeInfo>, DatabaseError> {
        if self.world.database_down.load(Ordering::SeqCst) {
            return Err(DatabaseError::Timeout(std::time::Duration::from_secs(5)));
        }
        Ok(self.world.catalog.get(node_name))
    }

    async fn update_node_priority(
        &self,
        node_name: &str,
        priority: i32,
    ) -> Result<bool, DatabaseError> {
        self.world.record(Call::PriorityUpdate {
            via: self.owner.clone(),
            node: node_name.to_string(),
            priority,
        });
        Ok(self.world.catalog.set_priority(node_name, priority))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Per-node knobs shared between a test and the node it controls
#[derive(Default)]
pub struct NodeState {
    pub ready: AtomicBool,
    pub fail_delete: AtomicBool,
    pub deleted: AtomicBool,
    /// The node's workload vanished behind the operator's back
    pub lost: AtomicBool,
}

/// The simulated cluster
pub struct FakeWorld {
    pub catalog: Catalog,
    calls: Mutex<Vec<Call>>,
    states: Mutex<BTreeMap<String, Arc<NodeState>>>,
    databases: Mutex<BTreeMap<String, Arc<FakeDatabase>>>,
    /// Nodes whose resources exist before the first pass, with their ids
    existing: Mutex<Vec<(String, i32)>>,
    /// Node names whose creation fails
    fail_create: Mutex<BTreeSet<String>>,
    pub fail_route: AtomicBool,
    pub database_down: AtomicBool,
    /// Whether new nodes report ready right after creation
    pub ready_on_create: AtomicBool,
}

impl FakeWorld {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            catalog: Catalog::default(),
            calls: Mutex::new(Vec::new()),
            states: Mutex::new(BTreeMap::new()),
            databases: Mutex::new(BTreeMap::new()),
            existing: Mutex::new(Vec::new()),
            fail_create: Mutex::new(BTreeSet::new()),
            fail_route: AtomicBool::new(false),
            database_down: AtomicBool::new(false),
            ready_on_create: AtomicBool::new(true),
        })
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    /// Calls recorded so far
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Return and forget the recorded calls
    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn state(&self, node: &str) -> Arc<NodeState> {
        self.states
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_default()
            .clone()
    }

    /// The database client handed to `node`
    pub fn database(self: &Arc<Self>, node: &str) -> Arc<FakeDatabase> {
        self.databases
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_insert_with(|| {
                Arc::new(FakeDatabase {
                    owner: node.to_string(),
                    world: self.clone(),
                    closes: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    pub fn set_ready(&self, node: &str, ready: bool) {
        self.state(node).ready.store(ready, Ordering::SeqCst);
    }

    pub fn fail_create(&self, node: &str) {
        self.fail_create.lock().unwrap().insert(node.to_string());
    }

    /// Pretend `node` was created by an earlier operator process
    pub fn add_existing(&self, node: &str, id: i32) {
        self.existing.lock().unwrap().push((node.to_string(), id));
        self.set_ready(node, true);
    }

    /// Build a node without going through the backend
    pub fn node(
        self: &Arc<Self>,
        name: &str,
        spec: &PostgreSQLNode,
        id: i32,
        operation: StartupOperation,
        id_recovered: bool,
    ) -> Box<dyn Node> {
        Box::new(FakeNode {
            name: name.to_string(),
            spec: spec.clone(),
            id,
            id_recovered,
            operation,
            state: self.state(name),
            db: self.database(name),
            world: self.clone(),
        })
    }
}

pub struct FakeNode {
    name: String,
    spec: PostgreSQLNode,
    id: i32,
    id_recovered: bool,
    operation: StartupOperation,
    state: Arc<NodeState>,
    db: Arc<FakeDatabase>,
    world: Arc<FakeWorld>,
}

#[async_trait]
impl Node for FakeNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> i32 {
        self.id
    }

    fn id_recovered(&self) -> bool {
        self.id_recovered
    }

    async fn create(&mut self) -> Result<()> {
        if self.world.fail_create.lock().unwrap().contains(&self.name) {
            return Err(Error::TransientError(format!(
                "cannot create {}",
                self.name
            )));
        }
        self.world.record(Call::Create {
            node: self.name.clone(),
            id: self.id,
            operation: self.operation,
        });
        self.state.deleted.store(false, Ordering::SeqCst);
        self.state.ready.store(
            self.world.ready_on_create.load(Ordering::SeqCst),
            Ordering::SeqCst,
        );
        Ok(())
    }

    async fn update(
        &mut self,
        spec: &PostgreSQLNode,
        primary_db: Option<&dyn RepmgrDatabase>,
    ) -> Result<UpdateOutcome> {
        if self.state.lost.swap(false, Ordering::SeqCst) {
            self.spec = spec.clone();
            if let Some(primary_db) = primary_db {
                if let Ok(Some(info)) = primary_db.node_info(&self.name).await {
                    self.id = info.id;
                    self.id_recovered = true;
                    self.operation = StartupOperation::NodeRejoin;
                }
            }
            self.create().await?;
            return Ok(UpdateOutcome::Recreated);
        }

        let mut outcome = UpdateOutcome::Unchanged;
        if spec.image != self.spec.image
            || spec.resources != self.spec.resources
            || spec.storage != self.spec.storage
        {
            self.world.record(Call::UpdateWorkload(self.name.clone()));
            outcome = UpdateOutcome::Updated;
        }
        self.spec = spec.clone();

        if self.state.ready.load(Ordering::SeqCst) {
            if let Some(primary_db) = primary_db {
                if sync_priority(&self.name, self.db.as_ref(), primary_db, spec.priority).await? {
                    outcome = UpdateOutcome::Updated;
                }
            }
        }
        Ok(outcome)
    }

    async fn delete(&mut self) -> Result<()> {
        if self.state.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::TransientError(format!(
                "cannot delete {}",
                self.name
            )));
        }
        self.world.record(Call::Delete(self.name.clone()));
        self.state.deleted.store(true, Ordering::SeqCst);
        self.state.ready.store(false, Ordering::SeqCst);
        self.db.close().await;
        Ok(())
    }

    async fn is_ready(&self) -> Result<bool> {
        Ok(self.state.ready.load(Ordering::SeqCst))
    }

    async fn is_registered(&self) -> Result<bool> {
        Ok(self.db.is_registered(&self.name).await?)
    }

    async fn register(&self, operation: StartupOperation) -> Result<()> {
        self.world.record(Call::Register {
            node: self.name.clone(),
            operation,
        });
        let role = match operation {
            StartupOperation::PrimaryRegister => NodeRole::Primary,
            _ => NodeRole::Standby,
        };
        self.world
            .catalog
            .insert(&self.name, self.id, role, self.spec.priority);
        Ok(())
    }

    async fn status(&self) -> PostgreSQLNodeStatus {
        observe_status(
            &self.name,
            &format!("pg-{}", self.name),
            &format!("pg-{}", self.name),
            self.db.as_ref(),
        )
        .await
    }

    fn database(&self) -> Arc<dyn RepmgrDatabase> {
        self.db.clone()
    }
}

/// [`ClusterBackend`] over a [`FakeWorld`]
pub struct FakeBackend {
    pub world: Arc<FakeWorld>,
}

impl FakeBackend {
    pub fn new(world: Arc<FakeWorld>) -> Self {
        Self { world }
    }
}

#[async_trait]
impl ClusterBackend for FakeBackend {
    fn build_node(
        &self,
        name: &str,
        spec: &PostgreSQLNode,
        id: i32,
        operation: StartupOperation,
        id_recovered: bool,
    ) -> Box<dyn Node> {
        self.world.node(name, spec, id, operation, id_recovered)
    }

    async fn attach_existing(&self) -> Result<Vec<Box<dyn Node>>> {
        let existing = self.world.existing.lock().unwrap().clone();
        Ok(existing
            .into_iter()
            .filter(|(name, _)| !self.world.state(name).deleted.load(Ordering::SeqCst))
            .map(|(name, id)| {
                self.world.node(
                    &name,
                    &PostgreSQLNode::default(),
                    id,
                    StartupOperation::StandbyRegister,
                    false,
                )
            })
            .collect())
    }

    async fn route_primary(&self, node_name: &str) -> Result<()> {
        if self.world.fail_route.load(Ordering::SeqCst) {
            return Err(Error::TransientError("service update failed".to_string()));
        }
        self.world.record(Call::Route(node_name.to_string()));
        Ok(())
    }
}

/// Build a spec from `(name, priority)` pairs
pub fn spec_with_priorities(nodes: &[(&str, i32)]) -> PostgreSQLSpec {
    PostgreSQLSpec {
        nodes: nodes
            .iter()
            .map(|(name, priority)| {
                (
                    name.to_string(),
                    PostgreSQLNode {
                        priority: *priority,
                        ..Default::default()
                    },
                )
            })
            .collect(),
        ..Default::default()
    }
}

/// A conflict as returned by the API server for a stale resourceVersion
pub fn conflict_error() -> Error {
    Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified".to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}

/// Status subresource backed by a single in-memory object
pub struct FakeStatusApi {
    object: Mutex<PostgreSQL>,
    conflicts: AtomicU32,
    pub gets: AtomicUsize,
    pub writes: AtomicUsize,
}

impl FakeStatusApi {
    pub fn new(name: &str, status: Option<PostgreSQLStatus>) -> Self {
        let object = PostgreSQL {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: PostgreSQLSpec::default(),
            status,
        };
        Self {
            object: Mutex::new(object),
            conflicts: AtomicU32::new(0),
            gets: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` writes fail with a conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    pub fn status(&self) -> Option<PostgreSQLStatus> {
        self.object.lock().unwrap().status.clone()
    }
}

#[async_trait]
impl ClusterStatusApi for FakeStatusApi {
    async fn get(&self, _name: &str) -> Result<PostgreSQL> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.object.lock().unwrap().clone())
    }

    async fn replace_status(&self, _name: &str, cluster: &PostgreSQL) -> Result<PostgreSQL> {
        let pending = self.conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.conflicts.store(pending - 1, Ordering::SeqCst);
            return Err(conflict_error());
        }

        let mut object = self.object.lock().unwrap();
        if cluster.metadata.resource_version != object.metadata.resource_version {
            return Err(conflict_error());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let version: u64 = object
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        object.status = cluster.status.clone();
        object.metadata.resource_version = Some((version + 1).to_string());
        Ok(object.clone())
    }
}

//! Nodes backed by a Deployment, a Service and a repmgr catalog client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::controller::cluster::ClusterBackend;
use crate::controller::config::OperatorConfig;
use crate::controller::error::{is_already_exists, is_api_code, retry_on_conflict, Error, Result, RetryConfig};
use crate::controller::node::{
    observe_status, sync_priority, Node, StartupOperation, UpdateOutcome,
};
use crate::crd::{PostgreSQL, PostgreSQLNode, PostgreSQLNodeStatus};
use crate::resources::common::{
    cluster_label_selector, credentials_secret_name, node_resource_name, primary_service_name,
    NODE_LABEL, POSTGRESQL_PORT,
};
use crate::resources::deployment::{
    apply_drift, generate_deployment, is_deployment_ready, node_id_from_deployment,
    NodeDeploymentParams,
};
use crate::resources::exec::{
    node_check_command, node_check_passed, register_command, ExecError, PodExecutor,
    RemoteExecutor,
};
use crate::resources::repmgr_db::{RepmgrClient, RepmgrDatabase};
use crate::resources::secret::{secret_value, REPMGR_PASSWORD_KEY};
use crate::resources::service::{generate_node_service, generate_primary_service, repoint_selector};
use crate::resources::volume::generate_pvc;

/// Cluster-wide inputs shared by every node of one cluster
pub struct NodeEnvironment {
    pub client: Client,
    pub cluster: Arc<PostgreSQL>,
    pub namespace: String,
    pub database_user: String,
    pub database_name: String,
    pub repmgr_password: String,
    pub exec_timeout: Duration,
    pub sql_timeout: Duration,
    pub retry: RetryConfig,
}

impl NodeEnvironment {
    /// Gather the environment for `cluster`, reading the repmgr password
    /// from the credentials Secret
    pub async fn load(client: Client, cluster: Arc<PostgreSQL>, config: &OperatorConfig) -> Result<Self> {
        let namespace = cluster
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let secret_name = credentials_secret_name(&cluster.name_any());

        let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
        let secret = secrets
            .get_opt(&secret_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("secret {}", secret_name)))?;
        let repmgr_password = secret_value(&secret, REPMGR_PASSWORD_KEY).ok_or_else(|| {
            Error::NotFound(format!("key {} in secret {}", REPMGR_PASSWORD_KEY, secret_name))
        })?;

        Ok(Self {
            client,
            cluster,
            namespace,
            database_user: config.database_user.clone(),
            database_name: config.database_name.clone(),
            repmgr_password,
            exec_timeout: config.exec_timeout,
            sql_timeout: config.sql_timeout,
            retry: RetryConfig::default(),
        })
    }

    fn cluster_name(&self) -> String {
        self.cluster.name_any()
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Create an object, treating "already exists" as success
async fn create_if_absent<K>(api: &Api<K>, object: &K) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + serde::Serialize + std::fmt::Debug,
{
    match api.create(&PostParams::default(), object).await {
        Ok(_) => Ok(()),
        Err(e) if is_already_exists(&e) => {
            debug!(name = %object.name_any(), "Object already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete an object, treating "not found" as success
async fn delete_if_present<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) if is_api_code(&e, 404) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A cluster member running as a one-replica Deployment
pub struct DeploymentNode {
    name: String,
    /// Spec the node was last created or updated with
    spec: PostgreSQLNode,
    id: i32,
    id_recovered: bool,
    operation: StartupOperation,
    env: Arc<NodeEnvironment>,
    deployments: Api<Deployment>,
    services: Api<Service>,
    db: Arc<dyn RepmgrDatabase>,
    executor: Arc<dyn RemoteExecutor>,
}

impl DeploymentNode {
    pub fn new(
        env: Arc<NodeEnvironment>,
        name: &str,
        spec: PostgreSQLNode,
        id: i32,
        operation: StartupOperation,
        id_recovered: bool,
    ) -> Self {
        let service_name = node_resource_name(&env.cluster_name(), name);
        let db = Arc::new(RepmgrClient::new(
            &service_name,
            POSTGRESQL_PORT as u16,
            &env.repmgr_password,
            env.sql_timeout,
        ));
        let executor = Arc::new(PodExecutor::new(
            env.client.clone(),
            &env.namespace,
            &env.cluster_name(),
            env.exec_timeout,
        ));

        Self {
            name: name.to_string(),
            spec,
            id,
            id_recovered,
            operation,
            deployments: env.api(),
            services: env.api(),
            env,
            db,
            executor,
        }
    }

    /// Wrap a Deployment found in the cluster. Returns `None` when the
    /// Deployment does not carry the labels and env of a managed node.
    pub fn attach(env: Arc<NodeEnvironment>, deployment: &Deployment) -> Option<Self> {
        let name = deployment.labels().get(NODE_LABEL)?.clone();
        let id = node_id_from_deployment(deployment)?;
        let spec = env.cluster.spec.nodes.get(&name).cloned().unwrap_or_default();
        Some(Self::new(
            env,
            &name,
            spec,
            id,
            StartupOperation::StandbyRegister,
            false,
        ))
    }

    fn resource_name(&self) -> String {
        node_resource_name(&self.env.cluster_name(), &self.name)
    }

    fn render(&self, spec: &PostgreSQLNode) -> Deployment {
        generate_deployment(
            &self.env.cluster,
            &NodeDeploymentParams {
                node_name: &self.name,
                spec,
                node_id: self.id,
                operation: self.operation,
                database_user: &self.env.database_user,
                database_name: &self.env.database_name,
            },
        )
    }

    async fn create_resources(&self, spec: &PostgreSQLNode) -> Result<()> {
        if let Some(pvc) = generate_pvc(&self.env.cluster, &self.name, &spec.storage) {
            let pvcs: Api<PersistentVolumeClaim> = self.env.api();
            create_if_absent(&pvcs, &pvc).await?;
        }
        create_if_absent(&self.deployments, &self.render(spec)).await?;
        create_if_absent(
            &self.services,
            &generate_node_service(&self.env.cluster, &self.name),
        )
        .await
    }

    /// Recreate a Deployment that disappeared, keeping the repmgr identity
    async fn recreate(
        &mut self,
        spec: &PostgreSQLNode,
        primary_db: Option<&dyn RepmgrDatabase>,
    ) -> Result<()> {
        if let Some(db) = primary_db {
            match db.node_info(&self.name).await {
                Ok(Some(info)) => {
                    self.id = info.id;
                    self.id_recovered = true;
                    self.operation = StartupOperation::NodeRejoin;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(node = %self.name, error = %e, "Could not recover node id, keeping {}", self.id)
                }
            }
        }

        info!(node = %self.name, id = self.id, "Recreating lost deployment");
        self.create_resources(spec).await
    }
}

#[async_trait]
impl Node for DeploymentNode {
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
        self.create_resources(&self.spec).await
    }

    async fn update(
        &mut self,
        spec: &PostgreSQLNode,
        primary_db: Option<&dyn RepmgrDatabase>,
    ) -> Result<UpdateOutcome> {
        self.spec = spec.clone();
        let name = self.resource_name();
        let Some(live) = self.deployments.get_opt(&name).await? else {
            self.recreate(spec, primary_db).await?;
            return Ok(UpdateOutcome::Recreated);
        };

        let mut outcome = UpdateOutcome::Unchanged;
        let desired = self.render(spec);
        let mut drifted = live.clone();
        if apply_drift(&mut drifted, &desired) {
            info!(node = %self.name, "Updating drifted deployment");
            let deployments = &self.deployments;
            let name = name.as_str();
            let desired = &desired;
            retry_on_conflict(&self.env.retry, || async move {
                let mut current = deployments.get(name).await?;
                if !apply_drift(&mut current, desired) {
                    return Ok(());
                }
                deployments
                    .replace(name, &PostParams::default(), &current)
                    .await?;
                Ok::<_, Error>(())
            })
            .await?;
            outcome = UpdateOutcome::Updated;
        }

        if self.services.get_opt(&name).await?.is_none() {
            create_if_absent(
                &self.services,
                &generate_node_service(&self.env.cluster, &self.name),
            )
            .await?;
        }

        if let Some(primary_db) = primary_db {
            if is_deployment_ready(&live)
                && sync_priority(&self.name, self.db.as_ref(), primary_db, spec.priority).await?
            {
                outcome = UpdateOutcome::Updated;
            }
        }

        Ok(outcome)
    }

    async fn delete(&mut self) -> Result<()> {
        let name = self.resource_name();
        delete_if_present(&self.deployments, &name).await?;
        delete_if_present(&self.services, &name).await?;
        self.db.close().await;
        Ok(())
    }

    async fn is_ready(&self) -> Result<bool> {
        Ok(self
            .deployments
            .get_opt(&self.resource_name())
            .await?
            .is_some_and(|d| is_deployment_ready(&d)))
    }

    async fn is_registered(&self) -> Result<bool> {
        match self.db.is_registered(&self.name).await {
            Ok(registered) => Ok(registered),
            Err(e) => {
                debug!(node = %self.name, error = %e, "Catalog unavailable, falling back to repmgr node check");
                match self.executor.exec(&self.name, node_check_command()).await {
                    Ok(output) => Ok(node_check_passed(&output)),
                    Err(ExecError::CommandFailed { stdout, stderr, .. }) => {
                        debug!(node = %self.name, %stdout, %stderr, "repmgr node check failed");
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn register(&self, operation: StartupOperation) -> Result<()> {
        let output = self
            .executor
            .exec(&self.name, register_command(operation))
            .await?;
        info!(node = %self.name, %operation, stdout = %output.stdout, "repmgr registration executed");
        Ok(())
    }

    async fn status(&self) -> PostgreSQLNodeStatus {
        let name = self.resource_name();
        observe_status(&self.name, &name, &name, self.db.as_ref()).await
    }

    fn database(&self) -> Arc<dyn RepmgrDatabase> {
        self.db.clone()
    }
}

/// [`ClusterBackend`] creating [`DeploymentNode`]s through the Kubernetes API
pub struct KubeBackend {
    env: Arc<NodeEnvironment>,
}

impl KubeBackend {
    pub fn new(env: NodeEnvironment) -> Self {
        Self { env: Arc::new(env) }
    }
}

#[async_trait]
impl ClusterBackend for KubeBackend {
    fn build_node(
        &self,
        name: &str,
        spec: &PostgreSQLNode,
        id: i32,
        operation: StartupOperation,
        id_recovered: bool,
    ) -> Box<dyn Node> {
        Box::new(DeploymentNode::new(
            self.env.clone(),
            name,
            spec.clone(),
            id,
            operation,
            id_recovered,
        ))
    }

    async fn attach_existing(&self) -> Result<Vec<Box<dyn Node>>> {
        let deployments: Api<Deployment> = self.env.api();
        let lp = ListParams::default().labels(&cluster_label_selector(&self.env.cluster_name()));
        let list = deployments.list(&lp).await?;

        Ok(list
            .items
            .iter()
            .filter_map(|d| DeploymentNode::attach(self.env.clone(), d))
            .map(|node| Box::new(node) as Box<dyn Node>)
            .collect())
    }

    async fn route_primary(&self, node_name: &str) -> Result<()> {
        let services: Api<Service> = self.env.api();
        let cluster_name = self.env.cluster_name();
        let name = primary_service_name(&cluster_name);

        let services = &services;
        let name = name.as_str();
        let cluster_name = cluster_name.as_str();
        let cluster = self.env.cluster.as_ref();
        retry_on_conflict(&self.env.retry, || async move {
            match services.get_opt(name).await? {
                None => {
                    services
                        .create(&PostParams::default(), &generate_primary_service(cluster, node_name))
                        .await?;
                }
                Some(mut service) => {
                    if repoint_selector(&mut service, cluster_name, node_name) {
                        services
                            .replace(name, &PostParams::default(), &service)
                            .await?;
                    }
                }
            }
            Ok::<_, Error>(())
        })
        .await
    }
}

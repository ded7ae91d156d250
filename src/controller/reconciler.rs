//! Reconciliation logic for PostgreSQL resources
//!
//! Each pass makes sure the cluster-wide objects exist (credentials, repmgr
//! configuration and the replicas Service), then hands the nodes over to a
//! [`ClusterReconciler`] working on the cluster's registry and finally
//! publishes the observed status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::cluster::ClusterReconciler;
use crate::controller::context::{registry_key, Context};
use crate::controller::deployment_node::{KubeBackend, NodeEnvironment};
use crate::controller::error::{is_already_exists, BackoffConfig, Error, Result, RetryConfig};
use crate::controller::status::{KubeStatusApi, StatusPublisher};
use crate::crd::{ManagementState, PostgreSQL};
use crate::resources::common::{credentials_secret_name, FIELD_MANAGER};
use crate::resources::configmap::generate_repmgr_config;
use crate::resources::secret::generate_credentials_secret;
use crate::resources::service::generate_replicas_service;

/// Finalizer name for cleanup
pub const FINALIZER: &str = "postgresql.example.com/finalizer";

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<PostgreSQL>, ctx: Arc<Context>) -> Result<Action> {
    let ns = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = cluster.name_any();

    debug!("Reconciling PostgreSQL");

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, &ctx, &ns).await;
    }

    if !has_finalizer(&cluster) {
        add_finalizer(&cluster, &ctx, &ns).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if cluster.spec.management_state == ManagementState::Unmanaged {
        debug!("Cluster is unmanaged, skipping");
        return Ok(Action::await_change());
    }

    let start = Instant::now();
    let result = reconcile_cluster(cluster.clone(), &ctx, &ns).await;

    if let Some(health) = &ctx.health_state {
        match &result {
            Ok(_) => health
                .metrics
                .record_reconcile(&ns, &name, start.elapsed().as_secs_f64()),
            Err(_) => health.metrics.record_error(&ns, &name),
        }
    }

    match result {
        Ok(action) => {
            debug!("Reconciliation completed successfully");
            Ok(action)
        }
        Err(e) => {
            error!("Reconciliation failed: {}", e);
            Err(e)
        }
    }
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<PostgreSQL>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    let delay = BackoffConfig::default().delay_for_error(error, 0);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {:?}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

/// Bring the cluster's objects and nodes towards the desired state and publish status
async fn reconcile_cluster(cluster: Arc<PostgreSQL>, ctx: &Context, ns: &str) -> Result<Action> {
    let name = cluster.name_any();

    ensure_secret(&cluster, ctx, ns).await?;
    apply_resource(ctx, ns, &generate_repmgr_config(&cluster)).await?;
    apply_resource(ctx, ns, &generate_replicas_service(&cluster)).await?;

    let env = NodeEnvironment::load(ctx.client.clone(), cluster.clone(), &ctx.config).await?;
    let backend = KubeBackend::new(env);

    let registry = ctx.registry(&registry_key(ns, &name)).await;
    let mut registry = registry.lock().await;

    let current = cluster.status.clone().unwrap_or_default();
    let outcome = ClusterReconciler::new(&backend, &mut *registry)
        .reconcile(&cluster.spec, &current)
        .await?;

    let api: Api<PostgreSQL> = Api::namespaced(ctx.client.clone(), ns);
    let status_api = KubeStatusApi::new(api);
    StatusPublisher::new(&status_api, RetryConfig::default())
        .publish(&name, cluster.status.as_ref(), &outcome.status)
        .await?;

    if let Some(health) = &ctx.health_state {
        health.metrics.set_cluster_nodes(
            ns,
            &name,
            cluster.spec.nodes.len() as i64,
            outcome.ready_nodes as i64,
        );
        if outcome.failover.is_some() {
            health.metrics.record_failover(ns, &name);
        }
    }

    if outcome.requeue {
        debug!(
            ready = outcome.ready_nodes,
            desired = cluster.spec.nodes.len(),
            "Cluster not converged yet"
        );
        Ok(Action::requeue(ctx.config.requeue_interval))
    } else {
        Ok(Action::requeue(ctx.config.resync_interval))
    }
}

/// Create the credentials Secret unless it exists. Existing passwords are
/// never rotated.
async fn ensure_secret(cluster: &PostgreSQL, ctx: &Context, ns: &str) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), ns);
    let secret_name = credentials_secret_name(&cluster.name_any());
    if secrets.get_opt(&secret_name).await?.is_some() {
        return Ok(());
    }

    let secret = generate_credentials_secret(cluster, ctx.config.database_password.as_deref());
    match secrets.create(&PostParams::default(), &secret).await {
        Ok(_) => {
            info!("Created credentials secret {}", secret_name);
            Ok(())
        }
        Err(e) if is_already_exists(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Apply a Kubernetes resource using server-side apply
async fn apply_resource<T>(ctx: &Context, ns: &str, resource: &T) -> Result<()>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + serde::Serialize
        + DeserializeOwned
        + Clone
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(ctx.client.clone(), ns);
    let name = resource.name_any();

    let patch = Patch::Apply(resource);
    let params = PatchParams::apply(FIELD_MANAGER).force();

    api.patch(&name, &params, &patch).await?;
    debug!("Applied resource: {}", name);

    Ok(())
}

/// Check if the finalizer is present
fn has_finalizer(cluster: &PostgreSQL) -> bool {
    cluster
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == FINALIZER))
}

/// Add the finalizer to the resource
async fn add_finalizer(cluster: &PostgreSQL, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<PostgreSQL> = Api::namespaced(ctx.client.clone(), ns);
    let name = cluster.name_any();

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": [FINALIZER]
        }
    });

    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    info!("Added finalizer to {}", name);
    Ok(())
}

/// Handle deletion of the PostgreSQL resource
///
/// Owned objects are garbage collected through their owner references, so
/// only the in-memory registry needs releasing before the finalizer goes.
async fn handle_deletion(cluster: &PostgreSQL, ctx: &Context, ns: &str) -> Result<Action> {
    let name = cluster.name_any();
    info!("Handling deletion of {}", name);

    if let Some(registry) = ctx.remove_registry(&registry_key(ns, &name)).await {
        registry.lock().await.close_all().await;
    }

    if has_finalizer(cluster) {
        let api: Api<PostgreSQL> = Api::namespaced(ctx.client.clone(), ns);

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": null
            }
        });

        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| Error::FinalizerError(e.to_string()))?;

        info!("Removed finalizer from {}", name);
    }

    Ok(Action::await_change())
}

//! Status publishing for PostgreSQL resources
//!
//! The status subresource is written with a read-modify-write cycle that
//! carries the fetched `resourceVersion`, so a concurrent writer causes a
//! conflict that is retried instead of a lost update.

use async_trait::async_trait;
use kube::api::PostParams;
use kube::Api;
use tracing::debug;

use crate::controller::error::{retry_on_conflict, Result, RetryConfig};
use crate::crd::{PostgreSQL, PostgreSQLStatus};

/// Read and replace access to a cluster's status
#[async_trait]
pub trait ClusterStatusApi: Send + Sync {
    /// Fetch the latest version of the cluster object
    async fn get(&self, name: &str) -> Result<PostgreSQL>;

    /// Replace the status subresource. `cluster` carries the resourceVersion
    /// the write is conditional on.
    async fn replace_status(&self, name: &str, cluster: &PostgreSQL) -> Result<PostgreSQL>;
}

/// [`ClusterStatusApi`] backed by the Kubernetes API
pub struct KubeStatusApi {
    api: Api<PostgreSQL>,
}

impl KubeStatusApi {
    pub fn new(api: Api<PostgreSQL>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ClusterStatusApi for KubeStatusApi {
    async fn get(&self, name: &str) -> Result<PostgreSQL> {
        Ok(self.api.get(name).await?)
    }

    async fn replace_status(&self, name: &str, cluster: &PostgreSQL) -> Result<PostgreSQL> {
        let data = serde_json::to_vec(cluster)?;
        Ok(self
            .api
            .replace_status(name, &PostParams::default(), data)
            .await?)
    }
}

/// Persists observed status, skipping writes that would change nothing
pub struct StatusPublisher<'a> {
    api: &'a dyn ClusterStatusApi,
    retry: RetryConfig,
}

impl<'a> StatusPublisher<'a> {
    pub fn new(api: &'a dyn ClusterStatusApi, retry: RetryConfig) -> Self {
        Self { api, retry }
    }

    /// Write `new` as the status of cluster `name` unless it equals `current`.
    ///
    /// Returns whether a write happened. Running out of conflict retries is
    /// an error.
    pub async fn publish(
        &self,
        name: &str,
        current: Option<&PostgreSQLStatus>,
        new: &PostgreSQLStatus,
    ) -> Result<bool> {
        let unchanged = match current {
            Some(current) => current == new,
            None => *new == PostgreSQLStatus::default(),
        };
        if unchanged {
            debug!(cluster = name, "Status unchanged, skipping update");
            return Ok(false);
        }

        let api = self.api;
        retry_on_conflict(&self.retry, || async move {
            let mut cluster = api.get(name).await?;
            cluster.status = Some(new.clone());
            api.replace_status(name, &cluster).await
        })
        .await?;

        debug!(cluster = name, nodes = new.nodes.len(), "Status updated");
        Ok(true)
    }
}

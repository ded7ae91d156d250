use std::collections::HashMap;
use std::sync::Arc;

use kube::Client;
use tokio::sync::Mutex;

use crate::controller::config::OperatorConfig;
use crate::controller::registry::ClusterRegistry;
use crate::health::HealthState;

/// A cluster's registry, locked for the length of a pass
pub type SharedRegistry = Arc<Mutex<ClusterRegistry>>;

/// Shared context for the controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Operator settings
    pub config: OperatorConfig,
    /// Health state for recording metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
    /// Registries keyed by `namespace/name`
    registries: Mutex<HashMap<String, SharedRegistry>>,
}

impl Context {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            config,
            health_state,
            registries: Mutex::new(HashMap::new()),
        }
    }

    /// The registry of a cluster, created empty on first use
    pub async fn registry(&self, key: &str) -> SharedRegistry {
        let mut registries = self.registries.lock().await;
        registries.entry(key.to_string()).or_default().clone()
    }

    /// Forget a cluster's registry
    pub async fn remove_registry(&self, key: &str) -> Option<SharedRegistry> {
        self.registries.lock().await.remove(key)
    }
}

/// Registry key for a cluster
pub fn registry_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

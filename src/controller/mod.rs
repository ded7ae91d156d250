pub mod cluster;
pub mod config;
pub mod context;
pub mod deployment_node;
pub mod election;
pub mod error;
pub mod node;
pub mod reconciler;
pub mod registry;
pub mod status;

pub use cluster::{ClusterBackend, ClusterReconciler, PassOutcome};
pub use config::OperatorConfig;
pub use context::Context;
pub use error::{BackoffConfig, Error, Result, RetryConfig};
pub use node::{Node, StartupOperation, UpdateOutcome};
pub use reconciler::{error_policy, reconcile, FINALIZER};
pub use registry::ClusterRegistry;
pub use status::{ClusterStatusApi, StatusPublisher};

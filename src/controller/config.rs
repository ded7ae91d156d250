//! Operator configuration read from the environment

use std::time::Duration;

use crate::controller::error::{Error, Result};

const DEFAULT_DATABASE_USER: &str = "pguser";
const DEFAULT_DATABASE_NAME: &str = "pgdb";

/// Runtime settings of the operator
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Application user created in every cluster (`POSTGRESQL_USER`)
    pub database_user: String,
    /// Application database created in every cluster (`POSTGRESQL_DATABASE`)
    pub database_name: String,
    /// Fixed application password (`POSTGRESQL_PASSWORD`), generated when unset
    pub database_password: Option<String>,
    /// Bound on a single remote command (`EXEC_TIMEOUT_SECS`)
    pub exec_timeout: Duration,
    /// Bound on a single catalog query (`SQL_TIMEOUT_SECS`)
    pub sql_timeout: Duration,
    /// Requeue delay while a cluster has not converged (`REQUEUE_INTERVAL_SECS`)
    pub requeue_interval: Duration,
    /// Resync delay once a cluster has converged (`RESYNC_INTERVAL_SECS`)
    pub resync_interval: Duration,
    /// Only watch this namespace (`WATCH_NAMESPACE`), cluster-wide when unset
    pub watch_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            database_user: DEFAULT_DATABASE_USER.to_string(),
            database_name: DEFAULT_DATABASE_NAME.to_string(),
            database_password: None,
            exec_timeout: Duration::from_secs(30),
            sql_timeout: Duration::from_secs(5),
            requeue_interval: Duration::from_secs(10),
            resync_interval: Duration::from_secs(300),
            watch_namespace: None,
        }
    }
}

impl OperatorConfig {
    /// Read the configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Ok(Self {
            database_user: get("POSTGRESQL_USER").unwrap_or(defaults.database_user),
            database_name: get("POSTGRESQL_DATABASE").unwrap_or(defaults.database_name),
            database_password: get("POSTGRESQL_PASSWORD"),
            exec_timeout: seconds(&get, "EXEC_TIMEOUT_SECS", defaults.exec_timeout)?,
            sql_timeout: seconds(&get, "SQL_TIMEOUT_SECS", defaults.sql_timeout)?,
            requeue_interval: seconds(&get, "REQUEUE_INTERVAL_SECS", defaults.requeue_interval)?,
            resync_interval: seconds(&get, "RESYNC_INTERVAL_SECS", defaults.resync_interval)?,
            watch_namespace: get("WATCH_NAMESPACE"),
        })
    }
}

fn seconds<F>(get: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                Error::InvalidConfig(format!("{} must be a positive number of seconds, got {:?}", key, value))
            }),
    }
}

//! Client for a node's repmgr catalog
//!
//! Each node gets its own client, connected lazily to the node's Service.
//! A missing `repmgr.nodes` table is the normal state of a node that has not
//! been registered yet, so the catalog queries report it as "not registered"
//! or "no info" rather than as an error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_postgres::NoTls;
use tracing::{debug, trace};

use crate::crd::NodeRole;

const REPMGR_USER: &str = "repmgr";
const REPMGR_DATABASE: &str = "repmgr";

const VERSION_QUERY: &str = "SELECT version()";
const TABLE_EXISTS_QUERY: &str = "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
     WHERE table_schema = 'repmgr' AND table_name = 'nodes')";
const REGISTERED_QUERY: &str = "SELECT COUNT(*) FROM repmgr.nodes WHERE node_name = $1";
const NODE_INFO_QUERY: &str = "SELECT node_id, type, priority FROM repmgr.nodes WHERE node_name = $1";
const UPDATE_PRIORITY_QUERY: &str = "UPDATE repmgr.nodes SET priority = $1 WHERE node_name = $2";

/// Reported when the server version cannot be determined
pub const UNKNOWN_VERSION: &str = "unknown";

/// Errors that can occur while talking to a node's database
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to {host}: {source}")]
    Connection {
        host: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("Query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("Database operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed version banner: {0:?}")]
    MalformedVersion(String),
}

/// A node's row in the repmgr catalog
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// repmgr node id
    pub id: i32,
    pub role: NodeRole,
    pub priority: i32,
}

/// Operations the reconciler needs from a node's repmgr database
#[async_trait]
pub trait RepmgrDatabase: Send + Sync {
    /// Server version number, e.g. "10.6"
    async fn version(&self) -> Result<String, DatabaseError>;

    /// Whether `node_name` has a row in the catalog
    async fn is_registered(&self, node_name: &str) -> Result<bool, DatabaseError>;

    /// The catalog row for `node_name`, `None` if absent or not bootstrapped
    async fn node_info(&self, node_name: &str) -> Result<Option<NodeInfo>, DatabaseError>;

    /// Set the failover priority of `node_name`.
    ///
    /// Returns whether the catalog existed to be updated.
    async fn update_node_priority(&self, node_name: &str, priority: i32) -> Result<bool, DatabaseError>;

    /// Drop the connection. Later calls reconnect.
    async fn close(&self);
}

/// Extract the version number from a `SELECT version()` banner
///
/// "PostgreSQL 10.6 on x86_64-pc-linux-gnu, ..." yields "10.6".
pub fn parse_version_banner(banner: &str) -> Result<String, DatabaseError> {
    let fields: Vec<&str> = banner.split_whitespace().collect();
    if fields.len() <= 2 {
        return Err(DatabaseError::MalformedVersion(banner.to_string()));
    }
    Ok(fields[1].to_string())
}

/// tokio-postgres backed [`RepmgrDatabase`]
pub struct RepmgrClient {
    config: tokio_postgres::Config,
    host: String,
    timeout: Duration,
    client: Mutex<Option<Arc<tokio_postgres::Client>>>,
}

impl RepmgrClient {
    /// Create a client for the node reachable at `host`. No connection is
    /// made until the first query.
    pub fn new(host: &str, port: u16, password: &str, timeout: Duration) -> Self {
        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .user(REPMGR_USER)
            .password(password)
            .dbname(REPMGR_DATABASE)
            .connect_timeout(timeout);

        Self {
            config,
            host: host.to_string(),
            timeout,
            client: Mutex::new(None),
        }
    }

    /// Return the open connection, reconnecting if it was dropped
    async fn connection(&self) -> Result<Arc<tokio_postgres::Client>, DatabaseError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
        }

        let (client, connection) =
            self.config
                .connect(NoTls)
                .await
                .map_err(|source| DatabaseError::Connection {
                    host: self.host.clone(),
                    source,
                })?;

        let host = self.host.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                trace!(host = %host, error = %e, "repmgr connection closed");
            }
        });
        debug!(host = %self.host, "Connected to repmgr database");

        let client = Arc::new(client);
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Bound a database operation by the configured timeout
    async fn timed<T>(
        &self,
        op: impl Future<Output = Result<T, DatabaseError>>,
    ) -> Result<T, DatabaseError> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| DatabaseError::Timeout(self.timeout))?
    }

    async fn nodes_table_exists(&self) -> Result<bool, DatabaseError> {
        let client = self.connection().await?;
        let row = client.query_one(TABLE_EXISTS_QUERY, &[]).await?;
        Ok(row.try_get(0)?)
    }
}

#[async_trait]
impl RepmgrDatabase for RepmgrClient {
    async fn version(&self) -> Result<String, DatabaseError> {
        self.timed(async {
            let client = self.connection().await?;
            let row = client.query_one(VERSION_QUERY, &[]).await?;
            let banner: String = row.try_get(0)?;
            parse_version_banner(&banner)
        })
        .await
    }

    async fn is_registered(&self, node_name: &str) -> Result<bool, DatabaseError> {
        self.timed(async {
            if !self.nodes_table_exists().await? {
                return Ok(false);
            }
            let client = self.connection().await?;
            let row = client.query_one(REGISTERED_QUERY, &[&node_name]).await?;
            let count: i64 = row.try_get(0)?;
            Ok(count > 0)
        })
        .await
    }

    async fn node_info(&self, node_name: &str) -> Result<Option<NodeInfo>, DatabaseError> {
        self.timed(async {
            if !self.nodes_table_exists().await? {
                return Ok(None);
            }
            let client = self.connection().await?;
            let Some(row) = client.query_opt(NODE_INFO_QUERY, &[&node_name]).await? else {
                return Ok(None);
            };
            let node_type: String = row.try_get(1)?;
            Ok(Some(NodeInfo {
                id: row.try_get(0)?,
                role: NodeRole::from_repmgr_type(&node_type),
                priority: row.try_get(2)?,
            }))
        })
        .await
    }

    async fn update_node_priority(&self, node_name: &str, priority: i32) -> Result<bool, DatabaseError> {
        self.timed(async {
            if !self.nodes_table_exists().await? {
                return Ok(false);
            }
            let client = self.connection().await?;
            client
                .execute(UPDATE_PRIORITY_QUERY, &[&priority, &node_name])
                .await?;
            Ok(true)
        })
        .await
    }

    async fn close(&self) {
        if self.client.lock().await.take().is_some() {
            debug!(host = %self.host, "Closed repmgr database connection");
        }
    }
}

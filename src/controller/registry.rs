//! In-memory view of one cluster's managed nodes
//!
//! A registry lives as long as the operator manages the cluster. It is owned
//! by the controller [`Context`](crate::controller::Context), one per cluster,
//! and every pass takes it behind that cluster's lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::controller::node::Node;
use crate::resources::repmgr_db::RepmgrDatabase;

#[derive(Default)]
pub struct ClusterRegistry {
    nodes: BTreeMap<String, Box<dyn Node>>,
    primary: Option<String>,
    /// Node the primary Service was last pointed at
    routed_primary: Option<String>,
    id_sequence: i32,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Node> {
        self.nodes.get(name).map(|n| n.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn Node>> {
        self.nodes.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Track a node. Its id is reserved so it is never handed out again.
    pub fn insert(&mut self, node: Box<dyn Node>) {
        self.reserve_id(node.id());
        self.nodes.insert(node.name().to_string(), node);
    }

    /// Stop tracking a node, clearing the primary and routing references that
    /// point at it
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Node>> {
        if self.primary.as_deref() == Some(name) {
            self.primary = None;
        }
        if self.routed_primary.as_deref() == Some(name) {
            self.routed_primary = None;
        }
        self.nodes.remove(name)
    }

    /// Names of every tracked node, sorted
    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn Node)> {
        self.nodes.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn primary(&self) -> Option<&str> {
        self.primary.as_deref()
    }

    /// Point the primary reference at a tracked node.
    ///
    /// Returns `false` and leaves the reference unchanged if the node is not tracked.
    pub fn set_primary(&mut self, name: &str) -> bool {
        if !self.nodes.contains_key(name) {
            return false;
        }
        self.primary = Some(name.to_string());
        true
    }

    /// The catalog client of the tracked primary
    pub fn primary_db(&self) -> Option<Arc<dyn RepmgrDatabase>> {
        self.primary
            .as_deref()
            .and_then(|name| self.nodes.get(name))
            .map(|node| node.database())
    }

    pub fn routed_primary(&self) -> Option<&str> {
        self.routed_primary.as_deref()
    }

    pub fn set_routed_primary(&mut self, name: &str) {
        self.routed_primary = Some(name.to_string());
    }

    /// Allocate a fresh node id
    pub fn next_id(&mut self) -> i32 {
        self.id_sequence += 1;
        self.id_sequence
    }

    /// Make sure `id` is never allocated again
    pub fn reserve_id(&mut self, id: i32) {
        self.id_sequence = self.id_sequence.max(id);
    }

    pub fn id_sequence(&self) -> i32 {
        self.id_sequence
    }

    /// Close the catalog connection of every tracked node
    pub async fn close_all(&self) {
        for node in self.nodes.values() {
            node.database().close().await;
        }
    }
}

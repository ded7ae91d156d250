//! Unit tests for the per-cluster node registry

use std::sync::atomic::Ordering;

use repmgr_operator::controller::node::StartupOperation;
use repmgr_operator::controller::registry::ClusterRegistry;
use repmgr_operator::crd::PostgreSQLNode;

use crate::common::*;

fn registry_with(world: &std::sync::Arc<FakeWorld>, nodes: &[(&str, i32)]) -> ClusterRegistry {
    let mut registry = ClusterRegistry::new();
    for (name, id) in nodes {
        registry.insert(world.node(
            name,
            &PostgreSQLNode::default(),
            *id,
            StartupOperation::StandbyRegister,
            false,
        ));
    }
    registry
}

#[test]
fn test_ids_are_allocated_in_sequence() {
    let mut registry = ClusterRegistry::new();
    assert_eq!(registry.next_id(), 1);
    assert_eq!(registry.next_id(), 2);
    assert_eq!(registry.id_sequence(), 2);
}

#[test]
fn test_insert_reserves_node_id() {
    let world = FakeWorld::new();
    let mut registry = registry_with(&world, &[("a", 7), ("b", 3)]);

    assert_eq!(registry.id_sequence(), 7);
    assert_eq!(registry.next_id(), 8);
}

#[test]
fn test_set_primary_requires_tracked_node() {
    let world = FakeWorld::new();
    let mut registry = registry_with(&world, &[("a", 1)]);

    assert!(!registry.set_primary("missing"));
    assert_eq!(registry.primary(), None);
    assert!(registry.primary_db().is_none());

    assert!(registry.set_primary("a"));
    assert_eq!(registry.primary(), Some("a"));
    assert!(registry.primary_db().is_some());
}

#[test]
fn test_removing_primary_clears_reference() {
    let world = FakeWorld::new();
    let mut registry = registry_with(&world, &[("a", 1), ("b", 2)]);
    registry.set_primary("a");
    registry.set_routed_primary("a");

    assert!(registry.remove("b").is_some());
    assert_eq!(registry.primary(), Some("a"));
    assert_eq!(registry.routed_primary(), Some("a"));

    assert!(registry.remove("a").is_some());
    assert_eq!(registry.primary(), None);
    assert_eq!(registry.routed_primary(), None);
    assert!(registry.is_empty());
    // Ids of removed nodes are not handed out again
    assert_eq!(registry.next_id(), 3);
}

#[test]
fn test_names_are_sorted() {
    let world = FakeWorld::new();
    let registry = registry_with(&world, &[("c", 1), ("a", 2), ("b", 3)]);

    assert_eq!(registry.names(), vec!["a", "b", "c"]);
    assert_eq!(registry.len(), 3);
}

#[tokio::test]
async fn test_close_all_closes_every_connection() {
    let world = FakeWorld::new();
    let registry = registry_with(&world, &[("a", 1), ("b", 2)]);

    registry.close_all().await;

    assert_eq!(world.database("a").closes.load(Ordering::SeqCst), 1);
    assert_eq!(world.database("b").closes.load(Ordering::SeqCst), 1);
}

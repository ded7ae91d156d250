// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for primary election and manifest generation
//!
//! These tests use proptest to generate random node maps and verify that:
//! 1. Election always picks a node with the highest priority
//! 2. Ties go to the lexicographically first name
//! 3. Generated manifests for arbitrary nodes stay consistent with their names

use std::collections::BTreeMap;

use proptest::prelude::*;

use repmgr_operator::controller::election::select_primary;
use repmgr_operator::crd::{PostgreSQL, PostgreSQLNode, PostgreSQLSpec};
use repmgr_operator::resources::common::node_resource_name;
use repmgr_operator::resources::deployment::{
    generate_deployment, node_id_from_deployment, NodeDeploymentParams,
};
use repmgr_operator::resources::exec::StartupOperation;

fn node_map() -> impl Strategy<Value = BTreeMap<String, PostgreSQLNode>> {
    prop::collection::btree_map("[a-z][a-z0-9-]{0,8}", -5i32..200, 1..8).prop_map(|nodes| {
        nodes
            .into_iter()
            .map(|(name, priority)| {
                (
                    name,
                    PostgreSQLNode {
                        priority,
                        ..Default::default()
                    },
                )
            })
            .collect()
    })
}

fn test_cluster() -> PostgreSQL {
    let mut cluster = PostgreSQL::new("prop", PostgreSQLSpec::default());
    cluster.metadata.namespace = Some("default".to_string());
    cluster.metadata.uid = Some("test-uid-12345".to_string());
    cluster
}

proptest! {
    #[test]
    fn election_picks_highest_priority(nodes in node_map()) {
        let (name, spec) = select_primary(&nodes).unwrap();
        let max = nodes.values().map(|n| n.priority).max().unwrap();

        prop_assert_eq!(spec.priority, max);
        prop_assert_eq!(&nodes[name], spec);
    }

    #[test]
    fn election_tie_break_is_first_name(nodes in node_map()) {
        let (name, _) = select_primary(&nodes).unwrap();
        let max = nodes.values().map(|n| n.priority).max().unwrap();
        let first = nodes
            .iter()
            .filter(|(_, n)| n.priority == max)
            .map(|(k, _)| k.as_str())
            .min()
            .unwrap();

        prop_assert_eq!(name, first);
    }

    #[test]
    fn election_is_deterministic(nodes in node_map()) {
        let first = select_primary(&nodes).unwrap().0.to_string();
        let rebuilt: BTreeMap<String, PostgreSQLNode> =
            nodes.clone().into_iter().rev().collect();

        prop_assert_eq!(select_primary(&rebuilt).unwrap().0, first.as_str());
    }

    #[test]
    fn deployment_carries_node_identity(
        node in "[a-z][a-z0-9-]{0,8}",
        id in 1i32..10_000,
        priority in -5i32..200,
    ) {
        let cluster = test_cluster();
        let spec = PostgreSQLNode { priority, ..Default::default() };
        let deployment = generate_deployment(
            &cluster,
            &NodeDeploymentParams {
                node_name: &node,
                spec: &spec,
                node_id: id,
                operation: StartupOperation::StandbyRegister,
                database_user: "pguser",
                database_name: "pgdb",
            },
        );

        let expected_name = node_resource_name("prop", &node);
        prop_assert_eq!(
            deployment.metadata.name.as_deref(),
            Some(expected_name.as_str())
        );
        prop_assert_eq!(node_id_from_deployment(&deployment), Some(id));
    }
}

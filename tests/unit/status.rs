//! Unit tests for status publishing

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use repmgr_operator::controller::error::{Error, RetryConfig};
use repmgr_operator::controller::status::StatusPublisher;
use repmgr_operator::crd::{NodeRole, PostgreSQLNodeStatus, PostgreSQLStatus};

use crate::common::*;

fn status_with(nodes: &[(&str, NodeRole, i32)]) -> PostgreSQLStatus {
    PostgreSQLStatus {
        nodes: nodes
            .iter()
            .map(|(name, role, priority)| {
                (
                    name.to_string(),
                    PostgreSQLNodeStatus {
                        deployment_name: format!("pg-{}", name),
                        service_name: format!("pg-{}", name),
                        pg_version: TEST_VERSION.to_string(),
                        role: *role,
                        priority: *priority,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>(),
    }
}

#[tokio::test]
async fn test_equal_status_is_not_written() {
    let current = status_with(&[("a", NodeRole::Primary, 100)]);
    let api = FakeStatusApi::new("db", Some(current.clone()));
    let publisher = StatusPublisher::new(&api, RetryConfig::immediate(3));

    let written = publisher
        .publish("db", Some(&current), &current.clone())
        .await
        .unwrap();

    assert!(!written);
    assert_eq!(api.gets.load(Ordering::SeqCst), 0);
    assert_eq!(api.writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_empty_status_on_fresh_cluster_is_not_written() {
    let api = FakeStatusApi::new("db", None);
    let publisher = StatusPublisher::new(&api, RetryConfig::immediate(3));

    let written = publisher
        .publish("db", None, &PostgreSQLStatus::default())
        .await
        .unwrap();

    assert!(!written);
    assert_eq!(api.writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_changed_status_is_written() {
    let current = status_with(&[("a", NodeRole::Primary, 100)]);
    let new = status_with(&[("a", NodeRole::Standby, 100), ("b", NodeRole::Primary, 50)]);
    let api = FakeStatusApi::new("db", Some(current.clone()));
    let publisher = StatusPublisher::new(&api, RetryConfig::immediate(3));

    let written = publisher.publish("db", Some(&current), &new).await.unwrap();

    assert!(written);
    assert_eq!(api.writes.load(Ordering::SeqCst), 1);
    assert_eq!(api.status(), Some(new));
}

#[tokio::test]
async fn test_conflicts_are_retried() {
    let new = status_with(&[("a", NodeRole::Primary, 100)]);
    let api = FakeStatusApi::new("db", None);
    api.inject_conflicts(2);
    let publisher = StatusPublisher::new(&api, RetryConfig::immediate(3));

    let written = publisher.publish("db", None, &new).await.unwrap();

    assert!(written);
    // Every attempt re-reads the object before writing
    assert_eq!(api.gets.load(Ordering::SeqCst), 3);
    assert_eq!(api.writes.load(Ordering::SeqCst), 1);
    assert_eq!(api.status(), Some(new));
}

#[tokio::test]
async fn test_exhausted_retries_are_fatal() {
    let new = status_with(&[("a", NodeRole::Primary, 100)]);
    let api = FakeStatusApi::new("db", None);
    api.inject_conflicts(10);
    let publisher = StatusPublisher::new(&api, RetryConfig::immediate(2));

    let result = publisher.publish("db", None, &new).await;

    assert!(matches!(result, Err(Error::ConflictError { retries: 2, .. })));
    assert_eq!(api.gets.load(Ordering::SeqCst), 3);
    assert_eq!(api.writes.load(Ordering::SeqCst), 0);
    assert_eq!(api.status(), None);
}

//! Recovery stories
//!
//! Each test disrupts one object the operator owns and asserts the operator
//! brings it back within the configured bound.

use std::time::Duration;

use operator_recovery::resource::ResourceKind;

use super::helpers::{scenario, test_runner};

/// Story: the entity operator deployment is deleted
///
/// Expected behavior:
/// - The deployment's pods are gone before recovery polling starts
/// - The operator recreates the deployment under a new uid
/// - The new deployment becomes 1/1 ready within the recovery timeout
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_entity_operator_deployment_is_recreated() {
    let mut runner = test_runner().await.expect("failed to set up runner");
    let target = scenario(&runner, "entity-operator-deletion");
    assert_eq!(target.target().kind, ResourceKind::Deployment);

    let report = runner.run(&target).await.expect("recovery failed");

    assert_ne!(report.outcome.recovered_token, report.outcome.original_token);
    assert!(report.outcome.duration <= Duration::from_secs(runner.config().recovery_timeout_secs));
    assert_eq!(runner.open_operations(), 0);
}

/// Story: the Kafka statefulset is deleted while the operator is paused
///
/// Expected behavior:
/// - The operator is scaled to 0 for the delete and back to 1 afterwards
/// - All broker pods are gone before the operator resumes
/// - A new statefulset appears and all brokers become ready
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_kafka_statefulset_is_recreated_after_operator_resumes() {
    let mut runner = test_runner().await.expect("failed to set up runner");
    let target = scenario(&runner, "kafka-statefulset-deletion");
    assert_eq!(target.target().kind, ResourceKind::StatefulSet);

    let report = runner.run(&target).await.expect("recovery failed");

    assert_ne!(report.outcome.recovered_token, report.outcome.original_token);
    assert!(report.outcome.recovered_at >= report.outcome.started_at);
}

/// Story: the bootstrap service is deleted
///
/// Expected behavior:
/// - The operator recreates the service under a new uid
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_bootstrap_service_is_recreated() {
    let mut runner = test_runner().await.expect("failed to set up runner");
    let target = scenario(&runner, "kafka-service-deletion");

    let report = runner.run(&target).await.expect("recovery failed");

    assert_ne!(report.outcome.recovered_token, report.outcome.original_token);
}

/// Story: brokers are asked for memory no node has, then given a sane request
///
/// Expected behavior:
/// - Every broker pod goes Pending and stays Pending for the stability window
/// - After remediation the same statefulset (same uid) becomes ready
/// - The Kafka custom resource reports Ready
#[tokio::test]
#[ignore = "requires kind cluster with the my-cluster Kafka - run with: cargo test --test kind -- --ignored"]
async fn story_impossible_memory_request_is_remediated_in_place() {
    let mut runner = test_runner().await.expect("failed to set up runner");
    let target = scenario(&runner, "impossible-memory-request");

    let report = runner.run(&target).await.expect("recovery failed");

    assert_eq!(report.outcome.recovered_token, report.outcome.original_token);
    assert_eq!(report.stable, Some(true));
}

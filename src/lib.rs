//! Operator recovery - verifies that a Kubernetes operator restores what it owns
//!
//! The harness disrupts resources an operator manages (deleting them, or making
//! them unschedulable) and then measures how long the operator takes to bring
//! them back to a ready steady state.
//!
//! # Architecture
//!
//! A scenario walks the same path every time:
//! - capture the target's identity (its `metadata.uid`)
//! - start an operation timer
//! - apply the disruption
//! - poll until the operator re-establishes the object and it reports ready
//! - stop the timer and report a [`scenario::RecoveryOutcome`]
//!
//! # Modules
//!
//! - [`resource`] - Resource handles, identity snapshots, readiness states
//! - [`cluster`] - Cluster state/control traits and the kube-rs implementation
//! - [`identity`] - Identity snapshots of managed objects
//! - [`readiness`] - Per-kind readiness evaluation
//! - [`stability`] - Sampling a value to prove it does not change
//! - [`poller`] - Fixed-interval polling and the recovery state machine
//! - [`timer`] - Explicitly keyed operation timing
//! - [`disruption`] - Destructive and degrading actions against the cluster
//! - [`scenario`] - Named recovery scenarios and the sequential runner
//! - [`config`] - Harness configuration
//! - [`telemetry`] - Logging setup
//! - [`cli`] - Command line entry point

#![deny(missing_docs)]

pub mod cli;
pub mod cluster;
pub mod config;
pub mod disruption;
pub mod error;
pub mod identity;
pub mod poller;
pub mod readiness;
pub mod resource;
pub mod scenario;
pub mod stability;
pub mod telemetry;
pub mod timer;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Namespace the recovery cluster is deployed into
pub const DEFAULT_NAMESPACE: &str = "recovery-cluster-test";

/// Name of the Kafka cluster shared by the deletion scenarios
pub const DEFAULT_CLUSTER_NAME: &str = "recovery-cluster";

/// Name of the Kafka cluster created by the impossible memory scenario
pub const DEFAULT_MEMORY_CLUSTER_NAME: &str = "my-cluster";

/// Deployment running the operator under test
pub const DEFAULT_OPERATOR_DEPLOYMENT: &str = "strimzi-cluster-operator";

/// API version of the operator's Kafka custom resource
pub const DEFAULT_KAFKA_API_VERSION: &str = "kafka.strimzi.io/v1beta2";

/// Memory request no node can satisfy, used to force pods into Pending
pub const UNSATISFIABLE_MEMORY: &str = "465458732Gi";

/// Memory request that schedules on any test node
pub const SATISFIABLE_MEMORY: &str = "512Mi";

/// Field manager name used for every patch the harness issues
pub const FIELD_MANAGER: &str = "operator-recovery";

//! Recovery stories against a real cluster
//!
//! # Test Organization
//!
//! - `recovery`: one story per disruption flow. A deployment deleted and
//!   recreated, a statefulset deleted with the operator paused, and a Kafka
//!   cluster made unschedulable and remediated in place.
//!
//! Scenarios share one Kafka cluster, so run them with `--test-threads=1`.

mod helpers;
mod recovery;

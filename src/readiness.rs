//! Per-kind readiness evaluation
//!
//! Readiness is dispatched on the handle's kind: one evaluation function per
//! [`ResourceKind`]. Supporting a new kind means adding a variant and its
//! function here; the poller does not change.
//!
//! Every observation carries the identity token it was computed for, so the
//! poller can refuse to credit readiness of a replaced object to its successor.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::trace;

use crate::cluster::ClusterState;
use crate::resource::{ReadinessState, ResourceHandle, ResourceKind, ResourceStatus};
use crate::{Error, Result};

/// What "ready" means for a particular scenario
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadinessExpectation {
    /// Replica count a Deployment/StatefulSet must be ready at.
    ///
    /// Guards against a workload that is "ready" at the wrong scale. When
    /// unset the object's own desired count is used.
    pub replicas: Option<i32>,
    /// Require at least one ready endpoint behind a Service
    pub require_endpoints: bool,
    /// Keys a ConfigMap must contain
    pub required_keys: BTreeSet<String>,
}

impl ReadinessExpectation {
    /// Object existence (plus the kind's own steady state) is enough
    pub fn exists() -> Self {
        Self::default()
    }

    /// Workload must be ready at exactly `replicas`
    pub fn replicas(replicas: i32) -> Self {
        Self {
            replicas: Some(replicas),
            ..Default::default()
        }
    }

    /// Service must have at least one routable endpoint
    pub fn with_endpoints(mut self) -> Self {
        self.require_endpoints = true;
        self
    }

    /// ConfigMap must contain `keys`
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_keys.extend(keys.into_iter().map(Into::into));
        self
    }
}

/// Readiness together with the identity it was observed for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadinessObservation {
    /// Identity token of the object the status came from
    pub token: Option<String>,
    /// Readiness of that object
    pub state: ReadinessState,
    /// Rendered status, for diagnostics
    pub detail: String,
}

impl ReadinessObservation {
    /// Readiness credited to `token` only; any other identity is NotReady
    pub fn for_identity(&self, token: &str) -> ReadinessState {
        if self.token.as_deref() == Some(token) {
            self.state
        } else {
            ReadinessState::NotReady
        }
    }
}

/// Evaluate readiness of a status observed for `handle`.
///
/// Not-ready is a normal observation. A status of the wrong variant for the
/// handle's kind is a [`Error::StatusMismatch`].
pub fn evaluate(
    handle: &ResourceHandle,
    status: &ResourceStatus,
    expectation: &ReadinessExpectation,
) -> Result<ReadinessState> {
    if matches!(status, ResourceStatus::Absent) {
        return Ok(ReadinessState::NotReady);
    }
    let mismatch = || Error::StatusMismatch {
        handle: handle.clone(),
        status: status.variant_name().to_string(),
    };
    match handle.kind {
        ResourceKind::Deployment | ResourceKind::StatefulSet => match status {
            ResourceStatus::Workload {
                desired_replicas,
                ready_replicas,
                ..
            } => Ok(workload_readiness(
                *desired_replicas,
                *ready_replicas,
                expectation,
            )),
            _ => Err(mismatch()),
        },
        ResourceKind::Service => match status {
            ResourceStatus::Service {
                ready_endpoints, ..
            } => Ok(service_readiness(*ready_endpoints, expectation)),
            _ => Err(mismatch()),
        },
        ResourceKind::ConfigMap => match status {
            ResourceStatus::ConfigMap { keys, .. } => Ok(config_map_readiness(keys, expectation)),
            _ => Err(mismatch()),
        },
    }
}

fn workload_readiness(desired: i32, ready: i32, expectation: &ReadinessExpectation) -> ReadinessState {
    let expected = expectation.replicas.unwrap_or(desired);
    if ready == desired && ready == expected {
        ReadinessState::Ready
    } else if ready > 0 {
        ReadinessState::PartiallyReady
    } else {
        ReadinessState::NotReady
    }
}

fn service_readiness(ready_endpoints: usize, expectation: &ReadinessExpectation) -> ReadinessState {
    if !expectation.require_endpoints || ready_endpoints > 0 {
        ReadinessState::Ready
    } else {
        ReadinessState::NotReady
    }
}

fn config_map_readiness(keys: &BTreeSet<String>, expectation: &ReadinessExpectation) -> ReadinessState {
    if expectation.required_keys.is_subset(keys) {
        ReadinessState::Ready
    } else {
        ReadinessState::NotReady
    }
}

/// Probes the cluster and evaluates readiness for a handle
#[derive(Clone)]
pub struct ReadinessProbe {
    cluster: Arc<dyn ClusterState>,
}

impl ReadinessProbe {
    /// Create a probe over the given cluster view
    pub fn new(cluster: Arc<dyn ClusterState>) -> Self {
        Self { cluster }
    }

    /// Fetch the handle's status and evaluate it
    pub async fn check(
        &self,
        handle: &ResourceHandle,
        expectation: &ReadinessExpectation,
    ) -> Result<ReadinessObservation> {
        let status = self.cluster.get_status(handle).await?;
        let state = evaluate(handle, &status, expectation)?;
        trace!(handle = %handle, status = %status, state = ?state, "Probed readiness");
        Ok(ReadinessObservation {
            token: status.uid().map(str::to_string),
            state,
            detail: status.to_string(),
        })
    }
}

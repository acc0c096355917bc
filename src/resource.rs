//! Addressing and observing managed objects
//!
//! Everything here is a plain value: handles, identity snapshots and the
//! status fields readiness is computed from.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of object the harness knows how to disrupt and probe
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// v1 Service
    Service,
    /// v1 ConfigMap
    ConfigMap,
}

impl ResourceKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Service => "Service",
            ResourceKind::ConfigMap => "ConfigMap",
        }
    }

    /// Whether objects of this kind own pods
    pub fn owns_pods(&self) -> bool {
        matches!(self, ResourceKind::Deployment | ResourceKind::StatefulSet)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a managed object: kind + namespace + name
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Object kind
    pub kind: ResourceKind,
    /// Namespace the object lives in
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ResourceHandle {
    /// Create a handle
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Prefix shared by the names of the pods this object owns
    pub fn pod_prefix(&self) -> String {
        format!("{}-", self.name)
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Point-in-time identity of a handle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    /// Opaque identity token, present iff the object exists
    pub identity_token: Option<String>,
    /// When the snapshot was taken
    pub observed_at: DateTime<Utc>,
}

impl IdentitySnapshot {
    /// Snapshot of an existing object
    pub fn present(token: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            identity_token: Some(token.into()),
            observed_at,
        }
    }

    /// Snapshot of an absent object
    pub fn absent(observed_at: DateTime<Utc>) -> Self {
        Self {
            identity_token: None,
            observed_at,
        }
    }

    /// Whether the object existed when observed
    pub fn exists(&self) -> bool {
        self.identity_token.is_some()
    }

    /// Identity token, if the object existed
    pub fn token(&self) -> Option<&str> {
        self.identity_token.as_deref()
    }

    /// Both snapshots observed the same underlying object
    pub fn same_object(&self, other: &IdentitySnapshot) -> bool {
        match (&self.identity_token, &other.identity_token) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// The object exists under a token other than `original`
    pub fn is_recreation_of(&self, original: &str) -> bool {
        self.token().is_some_and(|token| token != original)
    }
}

/// Readiness of an observed object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadinessState {
    /// Not serving at all (or absent)
    NotReady,
    /// Some but not all replicas are ready
    PartiallyReady,
    /// Steady, fully available state
    Ready,
}

impl ReadinessState {
    /// Only `Ready` counts; `PartiallyReady` never does
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessState::Ready)
    }
}

/// Status fields the readiness probe needs, tagged by kind of object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceStatus {
    /// The object does not exist
    Absent,
    /// Deployment or StatefulSet replica counts
    Workload {
        /// Identity token of the observed object
        uid: String,
        /// Replicas requested by the object's spec
        desired_replicas: i32,
        /// Replicas reported ready by the object's status
        ready_replicas: i32,
    },
    /// Service with its endpoint count
    Service {
        /// Identity token of the observed object
        uid: String,
        /// Number of ready endpoint addresses backing the service
        ready_endpoints: usize,
    },
    /// ConfigMap with its key set
    ConfigMap {
        /// Identity token of the observed object
        uid: String,
        /// Keys present in `data` and `binaryData`
        keys: BTreeSet<String>,
    },
}

impl ResourceStatus {
    /// Identity token of the observed object, if it exists
    pub fn uid(&self) -> Option<&str> {
        match self {
            ResourceStatus::Absent => None,
            ResourceStatus::Workload { uid, .. }
            | ResourceStatus::Service { uid, .. }
            | ResourceStatus::ConfigMap { uid, .. } => Some(uid),
        }
    }

    /// Short name of the variant, for diagnostics
    pub fn variant_name(&self) -> &'static str {
        match self {
            ResourceStatus::Absent => "absent",
            ResourceStatus::Workload { .. } => "workload",
            ResourceStatus::Service { .. } => "service",
            ResourceStatus::ConfigMap { .. } => "configmap",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceStatus::Absent => f.write_str("absent"),
            ResourceStatus::Workload {
                uid,
                desired_replicas,
                ready_replicas,
            } => write!(f, "{uid}: {ready_replicas}/{desired_replicas} ready"),
            ResourceStatus::Service {
                uid,
                ready_endpoints,
            } => write!(f, "{uid}: {ready_endpoints} endpoints"),
            ResourceStatus::ConfigMap { uid, keys } => write!(f, "{uid}: keys {keys:?}"),
        }
    }
}

/// Phase of a single pod, as seen by the harness
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodObservation {
    /// Pod name
    pub name: String,
    /// `status.phase` (Pending, Running, ...)
    pub phase: String,
    /// Whether the pod's Ready condition is True
    pub ready: bool,
}

impl PodObservation {
    /// Whether the pod is waiting to be scheduled
    pub fn is_pending(&self) -> bool {
        self.phase == "Pending"
    }
}

/// Address of the operator's top-level custom resource (e.g. a Kafka)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomResourceRef {
    /// Full API version, e.g. `kafka.strimzi.io/v1beta2`
    pub api_version: String,
    /// Resource kind, e.g. `Kafka`
    pub kind: String,
    /// Namespace the resource lives in
    pub namespace: String,
    /// Resource name
    pub name: String,
    /// Path to the `ResourceRequirements` field within the object
    pub resources_path: Vec<String>,
}

impl CustomResourceRef {
    /// Reference to the broker resources of a Kafka cluster
    pub fn kafka(
        api_version: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: "Kafka".to_string(),
            namespace: namespace.into(),
            name: name.into(),
            resources_path: vec![
                "spec".to_string(),
                "kafka".to_string(),
                "resources".to_string(),
            ],
        }
    }

    /// Split the api version into (group, version). Core types have an empty group.
    pub fn group_version(&self) -> (String, String) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), self.api_version.clone()),
        }
    }

    /// Lowercase plural resource name used in API paths
    pub fn plural(&self) -> String {
        let lower = self.kind.to_lowercase();
        if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
            format!("{}es", lower)
        } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
            format!("{}ies", &lower[..lower.len() - 1])
        } else {
            format!("{}s", lower)
        }
    }
}

impl fmt::Display for CustomResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

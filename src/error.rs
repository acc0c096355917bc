//! Error types for the recovery harness
//!
//! Scenario failures carry enough context (handle, elapsed time, last observed
//! state) to diagnose a failed run from its log line alone.

use std::time::Duration;

use thiserror::Error;

use crate::resource::ResourceHandle;

/// Main error type for harness operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A poll loop or wait exceeded its bound without reaching the required state
    #[error("timed out after {elapsed:?} waiting for {subject} ({state}); last observed: {last}")]
    Timeout {
        /// What was being waited on (usually a resource handle)
        subject: String,
        /// State the wait was in when the bound was exceeded
        state: String,
        /// Time spent before giving up
        elapsed: Duration,
        /// Last observation, for diagnosis
        last: String,
    },

    /// A value that had to stay stable changed inside the stability window
    #[error("unexpected transition of {subject} at sample {index}: {first} -> {observed}")]
    UnexpectedTransition {
        /// What was being sampled
        subject: String,
        /// Zero-based index of the first differing sample
        index: usize,
        /// Value of the first sample
        first: String,
        /// Value of the differing sample
        observed: String,
    },

    /// Readiness was reported for an identity that was already replaced
    #[error("premature readiness of {handle}: ready status belongs to replaced identity {token}")]
    PrematureReadiness {
        /// Resource being recovered
        handle: ResourceHandle,
        /// The stale identity token the status was observed for
        token: String,
    },

    /// The object was recreated while it was expected to be remediated in place
    #[error("identity of {handle} changed during in-place remediation: {original} -> {observed}")]
    IdentityChanged {
        /// Resource being remediated
        handle: ResourceHandle,
        /// Identity token before remediation
        original: String,
        /// Identity token that replaced it
        observed: String,
    },

    /// The collaborator returned a status that does not belong to the handle's kind
    #[error("status mismatch for {handle}: got {status} status")]
    StatusMismatch {
        /// Resource that was probed
        handle: ResourceHandle,
        /// Kind of status that was returned
        status: String,
    },

    /// A scenario could not start because the cluster was not in the expected state
    #[error("precondition failed for {handle}: {message}")]
    Precondition {
        /// Resource the scenario targets
        handle: ResourceHandle,
        /// What was wrong
        message: String,
    },

    /// Misuse of an operation timer entry
    #[error("timer error: {0}")]
    Timer(String),

    /// Invalid argument or configuration value
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a timer error with the given message
    pub fn timer(msg: impl Into<String>) -> Self {
        Self::Timer(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether this error came from talking to the cluster.
    ///
    /// Cluster faults abort only the current poll attempt; the loop tries
    /// again on its next tick until its timeout runs out.
    pub fn is_cluster_fault(&self) -> bool {
        matches!(self, Error::Kube(_))
    }
}

/// A retryable API error, for tests that exercise fault handling
#[cfg(test)]
pub(crate) fn cluster_fault(message: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "ServiceUnavailable".to_string(),
        code: 503,
    }))
}

//! Identity snapshots of managed objects

use std::sync::Arc;

use chrono::Utc;
use tracing::trace;

use crate::cluster::ClusterState;
use crate::resource::{IdentitySnapshot, ResourceHandle};
use crate::Result;

/// Captures which underlying object currently answers to a handle
#[derive(Clone)]
pub struct IdentityTracker {
    cluster: Arc<dyn ClusterState>,
}

impl IdentityTracker {
    /// Create a tracker over the given cluster view
    pub fn new(cluster: Arc<dyn ClusterState>) -> Self {
        Self { cluster }
    }

    /// Snapshot the handle's current identity.
    ///
    /// A missing object yields `exists() == false`; disruption scenarios
    /// produce that on purpose. Only cluster communication faults are errors.
    pub async fn capture(&self, handle: &ResourceHandle) -> Result<IdentitySnapshot> {
        let token = self.cluster.get_identity(handle).await?;
        let observed_at = Utc::now();
        trace!(handle = %handle, token = ?token, "Captured identity");
        Ok(match token {
            Some(token) => IdentitySnapshot::present(token, observed_at),
            None => IdentitySnapshot::absent(observed_at),
        })
    }
}

//! Destructive and degrading actions against the cluster
//!
//! The driver performs a disruption and confirms it took effect. It never
//! decides whether the operator recovered; that is the poller's job.

use std::collections::HashSet;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ResourceRequirements;
use tracing::{info, warn};

use crate::cluster::{ClusterControl, ClusterState};
use crate::poller::{wait_for, PollBudget};
use crate::resource::{CustomResourceRef, ResourceHandle};
use crate::Result;

/// Operator deployment to pause around a delete
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorDeployment {
    /// Namespace of the operator deployment
    pub namespace: String,
    /// Name of the operator deployment
    pub name: String,
}

/// How a delete is carried out
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Scale this deployment to 0 before deleting and back to 1 afterwards.
    ///
    /// Keeps the operator from recreating the object before its pods are gone.
    pub pause_operator: Option<OperatorDeployment>,
    /// Also wait until the pods matching the handle's name prefix at delete
    /// time are gone. Pods created after the delete are not waited on.
    pub await_pod_drain: bool,
}

/// Applies disruptions through the cluster collaborators
#[derive(Clone)]
pub struct DisruptionDriver {
    state: Arc<dyn ClusterState>,
    control: Arc<dyn ClusterControl>,
}

impl DisruptionDriver {
    /// Create a driver
    pub fn new(state: Arc<dyn ClusterState>, control: Arc<dyn ClusterControl>) -> Self {
        Self { state, control }
    }

    /// Delete the object and confirm the deletion is in flight.
    ///
    /// Confirmed once the handle no longer answers with `original_token` (and,
    /// with `await_pod_drain`, once the pods it had at delete time are gone).
    /// A paused operator must have no pods left before the delete is issued,
    /// and is scaled back to 1 whether or not the delete succeeded.
    pub async fn delete(
        &self,
        handle: &ResourceHandle,
        original_token: &str,
        options: &DeleteOptions,
        budget: PollBudget,
    ) -> Result<()> {
        if let Some(operator) = &options.pause_operator {
            self.control
                .scale(&operator.namespace, &operator.name, 0)
                .await?;
            info!(operator = %operator.name, "Operator scaled down");
        }

        let result = async {
            if let Some(operator) = &options.pause_operator {
                self.await_operator_stopped(operator, budget).await?;
            }
            self.delete_and_confirm(handle, original_token, options, budget)
                .await
        }
        .await;

        if let Some(operator) = &options.pause_operator {
            if let Err(e) = self.control.scale(&operator.namespace, &operator.name, 1).await {
                warn!(operator = %operator.name, error = %e, "Failed to resume operator");
                // The delete error, if any, is the more useful one to report
                result?;
                return Err(e);
            }
            info!(operator = %operator.name, "Operator resumed");
        }
        result
    }

    async fn await_operator_stopped(
        &self,
        operator: &OperatorDeployment,
        budget: PollBudget,
    ) -> Result<()> {
        let prefix = format!("{}-", operator.name);
        let prefix = prefix.as_str();
        wait_for(&format!("operator pods {}* stopped", prefix), budget, || async move {
            let pods = self.state.list_pods(&operator.namespace, prefix).await?;
            Ok(pods.is_empty().then_some(()))
        })
        .await?;
        info!(operator = %operator.name, "Operator paused");
        Ok(())
    }

    async fn delete_and_confirm(
        &self,
        handle: &ResourceHandle,
        original_token: &str,
        options: &DeleteOptions,
        budget: PollBudget,
    ) -> Result<()> {
        let prefix = handle.pod_prefix();
        let prefix = prefix.as_str();

        // Pods created after this point belong to the replacement
        let doomed: HashSet<String> = if options.await_pod_drain {
            self.state
                .list_pods(&handle.namespace, prefix)
                .await?
                .into_iter()
                .map(|p| p.name)
                .collect()
        } else {
            HashSet::new()
        };

        self.control.delete(handle).await?;

        wait_for(&format!("deletion of {}", handle), budget, || async move {
            let token = self.state.get_identity(handle).await?;
            Ok((token.as_deref() != Some(original_token)).then_some(()))
        })
        .await?;

        if !doomed.is_empty() {
            let doomed = &doomed;
            wait_for(&format!("pods {}* deleted", prefix), budget, || async move {
                let pods = self.state.list_pods(&handle.namespace, prefix).await?;
                Ok((!pods.iter().any(|p| doomed.contains(&p.name))).then_some(()))
            })
            .await?;
        }

        info!(
            handle = %handle,
            pods = doomed.len(),
            elapsed_ms = budget.elapsed().as_millis() as u64,
            "Deletion confirmed"
        );
        Ok(())
    }

    /// Patch resource requirements that leave the workload unschedulable
    pub async fn degrade(
        &self,
        target: &CustomResourceRef,
        requirements: &ResourceRequirements,
    ) -> Result<()> {
        info!(target = %target, "Degrading resource requirements");
        self.control
            .patch_resource_requirements(target, requirements)
            .await
    }

    /// Patch resource requirements back to something schedulable
    pub async fn remediate(
        &self,
        target: &CustomResourceRef,
        requirements: &ResourceRequirements,
    ) -> Result<()> {
        info!(target = %target, "Remediating resource requirements");
        self.control
            .patch_resource_requirements(target, requirements)
            .await
    }
}

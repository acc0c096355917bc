//! Cluster collaborators
//!
//! The harness never talks to the API server directly. It goes through two
//! narrow traits: [`ClusterState`] for read-only queries and [`ClusterControl`]
//! for the mutations a disruption needs. [`KubeCluster`] implements both on top
//! of kube-rs; tests use the mockall-generated mocks.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, ResourceRequirements, Service};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::resource::{
    CustomResourceRef, PodObservation, ResourceHandle, ResourceKind, ResourceStatus,
};
use crate::{Error, Result, FIELD_MANAGER};

/// Default connection timeout for the kube client
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for the kube client
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only view of cluster state
///
/// Absence is never an error here: a missing object is `None` or
/// [`ResourceStatus::Absent`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterState: Send + Sync {
    /// Identity token (`metadata.uid`) of the object, or `None` if it does not exist
    async fn get_identity(&self, handle: &ResourceHandle) -> Result<Option<String>>;

    /// Status fields readiness is evaluated from
    async fn get_status(&self, handle: &ResourceHandle) -> Result<ResourceStatus>;

    /// Pods in `namespace` whose name starts with `name_prefix`, sorted by name
    async fn list_pods(&self, namespace: &str, name_prefix: &str) -> Result<Vec<PodObservation>>;

    /// Value of the custom resource's `Ready` condition.
    ///
    /// `None` when the resource does not exist or reports no `Ready` condition.
    async fn custom_resource_ready(&self, target: &CustomResourceRef) -> Result<Option<bool>>;
}

/// Mutations a disruption can perform
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterControl: Send + Sync {
    /// Delete the object
    async fn delete(&self, handle: &ResourceHandle) -> Result<()>;

    /// Set the replica count of a deployment
    async fn scale(&self, namespace: &str, deployment: &str, replicas: i32) -> Result<()>;

    /// Replace the resource requirements of a custom resource
    async fn patch_resource_requirements(
        &self,
        target: &CustomResourceRef,
        requirements: &ResourceRequirements,
    ) -> Result<()>;
}

/// Live cluster implementation backed by a kube-rs client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using an explicit kubeconfig, or infer the config when `None`
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let mut config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| Error::config(format!("failed to read kubeconfig: {}", e)))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
            }
            None => Config::infer()
                .await
                .map_err(|e| Error::config(format!("failed to infer config: {}", e)))?,
        };
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

        let client = Client::try_from(config)
            .map_err(|e| Error::config(format!("failed to create client: {}", e)))?;
        Ok(Self::new(client))
    }

    fn dynamic_api(&self, target: &CustomResourceRef) -> Api<DynamicObject> {
        let (group, version) = target.group_version();
        let resource = ApiResource {
            group,
            version,
            api_version: target.api_version.clone(),
            kind: target.kind.clone(),
            plural: target.plural(),
        };
        Api::namespaced_with(self.client.clone(), &target.namespace, &resource)
    }

    async fn workload_status(&self, handle: &ResourceHandle) -> Result<ResourceStatus> {
        let (uid, desired, ready) = match handle.kind {
            ResourceKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &handle.namespace);
                let Some(deployment) = api.get_opt(&handle.name).await? else {
                    return Ok(ResourceStatus::Absent);
                };
                (
                    deployment.uid(),
                    deployment.spec.as_ref().and_then(|s| s.replicas),
                    deployment.status.as_ref().and_then(|s| s.ready_replicas),
                )
            }
            _ => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &handle.namespace);
                let Some(sts) = api.get_opt(&handle.name).await? else {
                    return Ok(ResourceStatus::Absent);
                };
                (
                    sts.uid(),
                    sts.spec.as_ref().and_then(|s| s.replicas),
                    sts.status.as_ref().and_then(|s| s.ready_replicas),
                )
            }
        };

        Ok(match uid {
            Some(uid) => ResourceStatus::Workload {
                uid,
                // Both kinds default spec.replicas to 1
                desired_replicas: desired.unwrap_or(1),
                ready_replicas: ready.unwrap_or(0),
            },
            None => ResourceStatus::Absent,
        })
    }

    async fn service_status(&self, handle: &ResourceHandle) -> Result<ResourceStatus> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &handle.namespace);
        let Some(uid) = services.get_opt(&handle.name).await?.and_then(|s| s.uid()) else {
            return Ok(ResourceStatus::Absent);
        };

        let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), &handle.namespace);
        let ready_endpoints = endpoints
            .get_opt(&handle.name)
            .await?
            .and_then(|ep| ep.subsets)
            .map(|subsets| {
                subsets
                    .iter()
                    .map(|s| s.addresses.as_ref().map_or(0, |a| a.len()))
                    .sum::<usize>()
            })
            .unwrap_or(0);

        Ok(ResourceStatus::Service {
            uid,
            ready_endpoints,
        })
    }

    async fn config_map_status(&self, handle: &ResourceHandle) -> Result<ResourceStatus> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &handle.namespace);
        let Some(cm) = api.get_opt(&handle.name).await? else {
            return Ok(ResourceStatus::Absent);
        };
        let Some(uid) = cm.uid() else {
            return Ok(ResourceStatus::Absent);
        };

        let mut keys = BTreeSet::new();
        if let Some(data) = &cm.data {
            keys.extend(data.keys().cloned());
        }
        if let Some(binary) = &cm.binary_data {
            keys.extend(binary.keys().cloned());
        }
        Ok(ResourceStatus::ConfigMap { uid, keys })
    }
}

#[async_trait]
impl ClusterState for KubeCluster {
    async fn get_identity(&self, handle: &ResourceHandle) -> Result<Option<String>> {
        let ns = &handle.namespace;
        let client = self.client.clone();
        let uid = match handle.kind {
            ResourceKind::Deployment => Api::<Deployment>::namespaced(client, ns)
                .get_opt(&handle.name)
                .await?
                .and_then(|o| o.uid()),
            ResourceKind::StatefulSet => Api::<StatefulSet>::namespaced(client, ns)
                .get_opt(&handle.name)
                .await?
                .and_then(|o| o.uid()),
            ResourceKind::Service => Api::<Service>::namespaced(client, ns)
                .get_opt(&handle.name)
                .await?
                .and_then(|o| o.uid()),
            ResourceKind::ConfigMap => Api::<ConfigMap>::namespaced(client, ns)
                .get_opt(&handle.name)
                .await?
                .and_then(|o| o.uid()),
        };
        Ok(uid)
    }

    async fn get_status(&self, handle: &ResourceHandle) -> Result<ResourceStatus> {
        match handle.kind {
            ResourceKind::Deployment | ResourceKind::StatefulSet => {
                self.workload_status(handle).await
            }
            ResourceKind::Service => self.service_status(handle).await,
            ResourceKind::ConfigMap => self.config_map_status(handle).await,
        }
    }

    async fn list_pods(&self, namespace: &str, name_prefix: &str) -> Result<Vec<PodObservation>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default()).await?;

        let mut observed: Vec<PodObservation> = pods
            .items
            .into_iter()
            .filter(|pod| pod.name_any().starts_with(name_prefix))
            .map(|pod| {
                let status = pod.status.as_ref();
                let phase = status
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_else(|| "Unknown".to_string());
                let ready = status
                    .and_then(|s| s.conditions.as_ref())
                    .map(|conds| {
                        conds
                            .iter()
                            .any(|c| c.type_ == "Ready" && c.status == "True")
                    })
                    .unwrap_or(false);
                PodObservation {
                    name: pod.name_any(),
                    phase,
                    ready,
                }
            })
            .collect();
        observed.sort();
        Ok(observed)
    }

    async fn custom_resource_ready(&self, target: &CustomResourceRef) -> Result<Option<bool>> {
        let Some(obj) = self.dynamic_api(target).get_opt(&target.name).await? else {
            return Ok(None);
        };

        let ready = obj
            .data
            .pointer("/status/conditions")
            .and_then(|c| c.as_array())
            .and_then(|conds| {
                conds
                    .iter()
                    .find(|c| c.get("type").and_then(|t| t.as_str()) == Some("Ready"))
            })
            .and_then(|c| c.get("status").and_then(|s| s.as_str()))
            .map(|status| status == "True");
        Ok(ready)
    }
}

#[async_trait]
impl ClusterControl for KubeCluster {
    async fn delete(&self, handle: &ResourceHandle) -> Result<()> {
        let ns = &handle.namespace;
        let client = self.client.clone();
        let params = DeleteParams::default();
        match handle.kind {
            ResourceKind::Deployment => {
                Api::<Deployment>::namespaced(client, ns)
                    .delete(&handle.name, &params)
                    .await?;
            }
            ResourceKind::StatefulSet => {
                Api::<StatefulSet>::namespaced(client, ns)
                    .delete(&handle.name, &params)
                    .await?;
            }
            ResourceKind::Service => {
                Api::<Service>::namespaced(client, ns)
                    .delete(&handle.name, &params)
                    .await?;
            }
            ResourceKind::ConfigMap => {
                Api::<ConfigMap>::namespaced(client, ns)
                    .delete(&handle.name, &params)
                    .await?;
            }
        }
        info!(handle = %handle, "Deleted");
        Ok(())
    }

    async fn scale(&self, namespace: &str, deployment: &str, replicas: i32) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(
            deployment,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        info!(namespace, deployment, replicas, "Scaled deployment");
        Ok(())
    }

    async fn patch_resource_requirements(
        &self,
        target: &CustomResourceRef,
        requirements: &ResourceRequirements,
    ) -> Result<()> {
        let patch = requirements_patch(&target.resources_path, requirements)?;
        debug!(target = %target, patch = %patch, "Patching resource requirements");
        self.dynamic_api(target)
            .patch(
                &target.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        info!(target = %target, "Patched resource requirements");
        Ok(())
    }
}

/// Build a merge patch that sets `requirements` at `path`.
///
/// Requirement maps are replaced wholesale (`null` for keys that are no
/// longer present would be needed to drop them, and the harness never does).
pub fn requirements_patch(
    path: &[String],
    requirements: &ResourceRequirements,
) -> Result<serde_json::Value> {
    if path.is_empty() {
        return Err(Error::validation("resource requirements path must not be empty"));
    }
    let mut value = serde_json::to_value(requirements)
        .map_err(|e| Error::serialization(format!("resource requirements: {}", e)))?;
    for segment in path.iter().rev() {
        let mut wrapper = serde_json::Map::new();
        wrapper.insert(segment.clone(), value);
        value = serde_json::Value::Object(wrapper);
    }
    Ok(value)
}

/// Resource requirements requesting `memory` and nothing else
pub fn memory_request(memory: &str) -> ResourceRequirements {
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    ResourceRequirements {
        requests: Some([("memory".to_string(), Quantity(memory.to_string()))].into()),
        ..Default::default()
    }
}

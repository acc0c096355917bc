//! Test helpers for live-cluster tests

use std::process::Command;
use std::sync::Arc;

use kube::config::KubeConfigOptions;
use kube::{Client, Config};

use operator_recovery::cluster::KubeCluster;
use operator_recovery::config::HarnessConfig;
use operator_recovery::scenario::{catalog, Scenario, ScenarioRunner};

/// Default name of the kind cluster the tests run against
pub const TEST_CLUSTER_NAME: &str = "recovery-test";

fn cluster_name() -> String {
    std::env::var("RECOVERY_KIND_CLUSTER").unwrap_or_else(|_| TEST_CLUSTER_NAME.to_string())
}

/// Check if a kind cluster with the given name exists
pub fn kind_cluster_exists(name: &str) -> bool {
    let Ok(output) = Command::new("kind").args(["get", "clusters"]).output() else {
        return false;
    };
    let clusters = String::from_utf8_lossy(&output.stdout);
    clusters.lines().any(|line| line.trim() == name)
}

/// Create a Kubernetes client connected to the test cluster
pub async fn create_test_client() -> Result<Client, String> {
    let name = cluster_name();
    if !kind_cluster_exists(&name) {
        return Err(format!("kind cluster '{name}' not found"));
    }

    let config = Config::from_kubeconfig(&KubeConfigOptions {
        context: Some(format!("kind-{name}")),
        ..Default::default()
    })
    .await
    .map_err(|e| format!("failed to load kubeconfig: {e}"))?;

    Client::try_from(config).map_err(|e| format!("failed to create client: {e}"))
}

/// Runner against the test cluster, configured from `RECOVERY_*` variables
pub async fn test_runner() -> Result<ScenarioRunner, String> {
    let config = HarnessConfig::load(None).map_err(|e| e.to_string())?;
    let cluster = Arc::new(KubeCluster::new(create_test_client().await?));
    Ok(ScenarioRunner::new(config, cluster.clone(), cluster))
}

/// Look up a scenario by name in the runner's catalog
pub fn scenario(runner: &ScenarioRunner, name: &str) -> Scenario {
    catalog(runner.config())
        .into_iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("no scenario named {name}"))
}

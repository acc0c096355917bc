//! Harness configuration
//!
//! Layered lowest to highest: built-in defaults, an optional JSON file,
//! `RECOVERY_*` environment variables, then command line flags (applied by
//! the CLI on the loaded value).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    Error, Result, DEFAULT_CLUSTER_NAME, DEFAULT_KAFKA_API_VERSION, DEFAULT_MEMORY_CLUSTER_NAME,
    DEFAULT_NAMESPACE, DEFAULT_OPERATOR_DEPLOYMENT, SATISFIABLE_MEMORY, UNSATISFIABLE_MEMORY,
};

/// Bounds the derived poll interval is clamped to
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Everything a scenario run needs to know about its environment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HarnessConfig {
    /// Namespace the operator and its Kafka clusters live in
    pub namespace: String,
    /// Kafka cluster the deletion scenarios disrupt
    pub cluster_name: String,
    /// Kafka cluster the impossible memory scenario degrades
    pub memory_cluster_name: String,
    /// Deployment running the operator under test
    pub operator_deployment: String,
    /// Broker replicas of both clusters
    pub kafka_replicas: i32,
    /// Zookeeper replicas of the deletion scenario cluster
    pub zookeeper_replicas: i32,
    /// API version of the Kafka custom resource
    pub kafka_api_version: String,
    /// Bound on a whole recovery, counted from the start of the timer
    pub recovery_timeout_secs: u64,
    /// Bound on confirming a deletion (or pods reaching Pending)
    pub deletion_timeout_secs: u64,
    /// Fixed poll interval; derived from the recovery timeout when unset
    pub poll_interval_secs: Option<u64>,
    /// Samples in the Pending stability window
    pub stability_samples: usize,
    /// Seconds between stability samples
    pub stability_interval_secs: u64,
    /// Memory request no node can satisfy
    pub unsatisfiable_memory: String,
    /// Memory request the remediation restores
    pub satisfiable_memory: String,
    /// Kubeconfig to use instead of the inferred one
    pub kubeconfig: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            memory_cluster_name: DEFAULT_MEMORY_CLUSTER_NAME.to_string(),
            operator_deployment: DEFAULT_OPERATOR_DEPLOYMENT.to_string(),
            kafka_replicas: 3,
            zookeeper_replicas: 1,
            kafka_api_version: DEFAULT_KAFKA_API_VERSION.to_string(),
            recovery_timeout_secs: 600,
            deletion_timeout_secs: 300,
            poll_interval_secs: None,
            stability_samples: 12,
            stability_interval_secs: 5,
            unsatisfiable_memory: UNSATISFIABLE_MEMORY.to_string(),
            satisfiable_memory: SATISFIABLE_MEMORY.to_string(),
            kubeconfig: None,
        }
    }
}

impl HarnessConfig {
    /// Load from an optional JSON file, then apply environment overrides and validate.
    ///
    /// An explicit path that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::config(format!("failed to read {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    Error::config(format!("failed to parse {}: {}", path.display(), e))
                })?
            }
            None => Self::default(),
        };
        config.apply_env_overrides_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RECOVERY_*` overrides read through `lookup`
    pub fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("RECOVERY_NAMESPACE") {
            self.namespace = raw;
        }
        if let Some(raw) = lookup("RECOVERY_CLUSTER_NAME") {
            self.cluster_name = raw;
        }
        if let Some(raw) = lookup("RECOVERY_MEMORY_CLUSTER_NAME") {
            self.memory_cluster_name = raw;
        }
        if let Some(raw) = lookup("RECOVERY_OPERATOR_DEPLOYMENT") {
            self.operator_deployment = raw;
        }
        if let Some(raw) = lookup("RECOVERY_KAFKA_API_VERSION") {
            self.kafka_api_version = raw;
        }
        if let Some(raw) = lookup("RECOVERY_KAFKA_REPLICAS") {
            self.kafka_replicas = parse_env("RECOVERY_KAFKA_REPLICAS", &raw)?;
        }
        if let Some(raw) = lookup("RECOVERY_ZOOKEEPER_REPLICAS") {
            self.zookeeper_replicas = parse_env("RECOVERY_ZOOKEEPER_REPLICAS", &raw)?;
        }
        if let Some(raw) = lookup("RECOVERY_TIMEOUT_SECS") {
            self.recovery_timeout_secs = parse_env("RECOVERY_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("RECOVERY_DELETION_TIMEOUT_SECS") {
            self.deletion_timeout_secs = parse_env("RECOVERY_DELETION_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("RECOVERY_POLL_INTERVAL_SECS") {
            self.poll_interval_secs = Some(parse_env("RECOVERY_POLL_INTERVAL_SECS", &raw)?);
        }
        if let Some(raw) = lookup("RECOVERY_STABILITY_SAMPLES") {
            self.stability_samples = parse_env("RECOVERY_STABILITY_SAMPLES", &raw)?;
        }
        if let Some(raw) = lookup("RECOVERY_STABILITY_INTERVAL_SECS") {
            self.stability_interval_secs = parse_env("RECOVERY_STABILITY_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("RECOVERY_KUBECONFIG") {
            self.kubeconfig = Some(PathBuf::from(raw));
        }
        Ok(())
    }

    /// Reject values no run could succeed with
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("namespace", &self.namespace),
            ("clusterName", &self.cluster_name),
            ("memoryClusterName", &self.memory_cluster_name),
            ("operatorDeployment", &self.operator_deployment),
            ("unsatisfiableMemory", &self.unsatisfiable_memory),
            ("satisfiableMemory", &self.satisfiable_memory),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation(format!("{field} must not be empty")));
            }
        }
        if !self.kafka_api_version.contains('/') {
            return Err(Error::validation(format!(
                "kafkaApiVersion must be group/version, got {}",
                self.kafka_api_version
            )));
        }
        if self.kafka_replicas < 1 || self.zookeeper_replicas < 1 {
            return Err(Error::validation("replica counts must be at least 1"));
        }
        if self.recovery_timeout_secs == 0 || self.deletion_timeout_secs == 0 {
            return Err(Error::validation("timeouts must be positive"));
        }
        if let Some(interval) = self.poll_interval_secs {
            if interval == 0 || interval > self.recovery_timeout_secs {
                return Err(Error::validation(format!(
                    "pollIntervalSecs must be in [1, {}], got {}",
                    self.recovery_timeout_secs, interval
                )));
            }
        }
        if self.stability_samples == 0 {
            return Err(Error::validation("stabilitySamples must be at least 1"));
        }
        Ok(())
    }

    /// Bound on a whole recovery
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    /// Bound on confirming a disruption took effect
    pub fn deletion_timeout(&self) -> Duration {
        Duration::from_secs(self.deletion_timeout_secs)
    }

    /// Poll interval: explicit, or a thirtieth of the recovery timeout clamped to [1s, 10s]
    pub fn poll_interval(&self) -> Duration {
        match self.poll_interval_secs {
            Some(secs) => Duration::from_secs(secs),
            None => (self.recovery_timeout() / 30).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL),
        }
    }

    /// Time between stability samples
    pub fn stability_interval(&self) -> Duration {
        Duration::from_secs(self.stability_interval_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::config(format!("{key}={raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl FnMut(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = HarnessConfig::default();
        config.validate().unwrap();
        assert_eq!(config.namespace, "recovery-cluster-test");
        assert_eq!(config.cluster_name, "recovery-cluster");
        assert_eq!(config.stability_samples, 12);
        assert_eq!(config.stability_interval(), Duration::from_secs(5));
    }

    #[rstest]
    #[case::derived_from_timeout(600, None, 10)]
    #[case::clamped_low(15, None, 1)]
    #[case::thirtieth(150, None, 5)]
    #[case::explicit_wins(600, Some(2), 2)]
    fn test_poll_interval(
        #[case] timeout: u64,
        #[case] explicit: Option<u64>,
        #[case] expected: u64,
    ) {
        let config = HarnessConfig {
            recovery_timeout_secs: timeout,
            poll_interval_secs: explicit,
            ..Default::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_secs(expected));
    }

    #[test]
    fn test_file_overrides_defaults_and_keeps_the_rest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "namespace": "kafka", "recoveryTimeoutSecs": 120, "kafkaReplicas": 5 }}"#
        )
        .unwrap();

        let config = HarnessConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.namespace, "kafka");
        assert_eq!(config.recovery_timeout(), Duration::from_secs(120));
        assert_eq!(config.kafka_replicas, 5);
        assert_eq!(config.cluster_name, "recovery-cluster");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = HarnessConfig::load(Some(&dir.path().join("absent.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "namespace: kafka").unwrap();
        assert!(matches!(
            HarnessConfig::load(Some(file.path())),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = HarnessConfig::default();
        config
            .apply_env_overrides_from(env(&[
                ("RECOVERY_NAMESPACE", "other"),
                ("RECOVERY_TIMEOUT_SECS", " 900 "),
                ("RECOVERY_POLL_INTERVAL_SECS", "3"),
                ("RECOVERY_KUBECONFIG", "/tmp/kubeconfig"),
            ]))
            .unwrap();
        assert_eq!(config.namespace, "other");
        assert_eq!(config.recovery_timeout_secs, 900);
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
        assert_eq!(config.kubeconfig, Some(PathBuf::from("/tmp/kubeconfig")));
    }

    #[test]
    fn test_unparseable_env_value_is_an_error() {
        let mut config = HarnessConfig::default();
        let err = config
            .apply_env_overrides_from(env(&[("RECOVERY_KAFKA_REPLICAS", "three")]))
            .unwrap_err();
        assert!(err.to_string().contains("RECOVERY_KAFKA_REPLICAS"));
    }

    #[rstest]
    #[case::empty_namespace(HarnessConfig { namespace: " ".into(), ..Default::default() })]
    #[case::no_replicas(HarnessConfig { kafka_replicas: 0, ..Default::default() })]
    #[case::zero_timeout(HarnessConfig { recovery_timeout_secs: 0, ..Default::default() })]
    #[case::interval_beyond_timeout(HarnessConfig { poll_interval_secs: Some(601), ..Default::default() })]
    #[case::no_samples(HarnessConfig { stability_samples: 0, ..Default::default() })]
    #[case::bad_api_version(HarnessConfig { kafka_api_version: "v1beta2".into(), ..Default::default() })]
    fn test_validate_rejects(#[case] config: HarnessConfig) {
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }
}

//! Named recovery scenarios and the sequential runner
//!
//! Every scenario disrupts one object the operator owns and measures how long
//! the operator takes to bring it back. Two flows exist:
//!
//! - **deletion**: delete the object, wait for a new identity, wait for Ready
//! - **in-place remediation**: make the workload unschedulable, prove it is
//!   stuck, fix the requirements and wait for the *same* object to be Ready
//!
//! Object names follow the operator's naming conventions for a Kafka cluster.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tracing::{info, warn};

use crate::cluster::{memory_request, ClusterControl, ClusterState};
use crate::config::HarnessConfig;
use crate::disruption::{DeleteOptions, DisruptionDriver, OperatorDeployment};
use crate::identity::IdentityTracker;
use crate::poller::{wait_for, CompletionCondition, PollBudget, RecoveryPoller, RecoveryReport};
use crate::readiness::{ReadinessExpectation, ReadinessProbe};
use crate::resource::{CustomResourceRef, IdentitySnapshot, ResourceHandle, ResourceKind};
use crate::stability::StabilityProbe;
use crate::timer::{OperationId, OperationTimer};
use crate::{Error, Result};

/// Suite a scenario belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioTag {
    /// Full regression suite (every scenario)
    Regression,
    /// Short acceptance suite
    Acceptance,
    /// Needs a Kafka bridge deployed
    Bridge,
}

impl ScenarioTag {
    /// Parse a tag name
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "regression" => Ok(ScenarioTag::Regression),
            "acceptance" => Ok(ScenarioTag::Acceptance),
            "bridge" => Ok(ScenarioTag::Bridge),
            other => Err(Error::validation(format!("unknown scenario tag: {other}"))),
        }
    }
}

impl fmt::Display for ScenarioTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioTag::Regression => f.write_str("regression"),
            ScenarioTag::Acceptance => f.write_str("acceptance"),
            ScenarioTag::Bridge => f.write_str("bridge"),
        }
    }
}

/// What a scenario does to its target
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disruption {
    /// Delete the object and wait for a replacement
    Delete {
        /// Object to delete
        handle: ResourceHandle,
        /// Scale the operator to 0 around the delete
        pause_operator: bool,
        /// Wait for the object's pods to be gone before recovery polling
        await_pod_drain: bool,
        /// What Ready means for the replacement
        expectation: ReadinessExpectation,
    },
    /// Request memory no node has, then remediate in place
    ImpossibleMemory {
        /// Custom resource whose requirements are patched
        target: CustomResourceRef,
        /// Workload the requirements apply to
        workload: ResourceHandle,
        /// Replicas the workload must be ready at after remediation
        replicas: i32,
    },
}

/// A named, independently runnable scenario
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scenario {
    /// Unique name, used on the command line
    pub name: String,
    /// Suites the scenario belongs to
    pub tags: Vec<ScenarioTag>,
    /// The disruption and how recovery is judged
    pub disruption: Disruption,
}

impl Scenario {
    /// Whether the scenario belongs to `tag`
    pub fn has_tag(&self, tag: ScenarioTag) -> bool {
        self.tags.contains(&tag)
    }

    /// Primary object the scenario targets
    pub fn target(&self) -> &ResourceHandle {
        match &self.disruption {
            Disruption::Delete { handle, .. } => handle,
            Disruption::ImpossibleMemory { workload, .. } => workload,
        }
    }
}

/// Every scenario the harness knows, in suite order
pub fn catalog(config: &HarnessConfig) -> Vec<Scenario> {
    use ResourceKind::*;
    use ScenarioTag::*;

    let ns = config.namespace.as_str();
    let c = config.cluster_name.as_str();

    let delete = |name: &str,
                  tags: &[ScenarioTag],
                  kind: ResourceKind,
                  object: String,
                  expectation: ReadinessExpectation| {
        let owns_pods = kind.owns_pods();
        Scenario {
            name: name.to_string(),
            tags: tags.to_vec(),
            disruption: Disruption::Delete {
                handle: ResourceHandle::new(kind, ns, object),
                pause_operator: kind == StatefulSet,
                await_pod_drain: owns_pods,
                expectation,
            },
        }
    };

    let mc = config.memory_cluster_name.as_str();
    vec![
        delete(
            "entity-operator-deletion",
            &[Regression],
            Deployment,
            format!("{c}-entity-operator"),
            ReadinessExpectation::replicas(1),
        ),
        delete(
            "kafka-statefulset-deletion",
            &[Regression, Acceptance],
            StatefulSet,
            format!("{c}-kafka"),
            ReadinessExpectation::replicas(config.kafka_replicas),
        ),
        delete(
            "zookeeper-statefulset-deletion",
            &[Regression, Acceptance],
            StatefulSet,
            format!("{c}-zookeeper"),
            ReadinessExpectation::replicas(config.zookeeper_replicas),
        ),
        delete(
            "kafka-service-deletion",
            &[Regression],
            Service,
            format!("{c}-kafka-bootstrap"),
            ReadinessExpectation::exists(),
        ),
        delete(
            "zookeeper-service-deletion",
            &[Regression],
            Service,
            format!("{c}-zookeeper-client"),
            ReadinessExpectation::exists(),
        ),
        delete(
            "kafka-headless-service-deletion",
            &[Regression],
            Service,
            format!("{c}-kafka-brokers"),
            ReadinessExpectation::exists(),
        ),
        delete(
            "zookeeper-headless-service-deletion",
            &[Regression],
            Service,
            format!("{c}-zookeeper-nodes"),
            ReadinessExpectation::exists(),
        ),
        delete(
            "kafka-metrics-config-deletion",
            &[Regression],
            ConfigMap,
            format!("{c}-kafka-config"),
            ReadinessExpectation::exists(),
        ),
        delete(
            "zookeeper-metrics-config-deletion",
            &[Regression],
            ConfigMap,
            format!("{c}-zookeeper-config"),
            ReadinessExpectation::exists(),
        ),
        delete(
            "bridge-deployment-deletion",
            &[Regression, Bridge],
            Deployment,
            format!("{c}-bridge"),
            ReadinessExpectation::exists(),
        ),
        delete(
            "bridge-service-deletion",
            &[Regression, Bridge],
            Service,
            format!("{c}-bridge-service"),
            ReadinessExpectation::exists(),
        ),
        delete(
            "bridge-metrics-config-deletion",
            &[Regression, Bridge],
            ConfigMap,
            format!("{c}-bridge-config"),
            ReadinessExpectation::exists(),
        ),
        Scenario {
            name: "impossible-memory-request".to_string(),
            tags: vec![Regression],
            disruption: Disruption::ImpossibleMemory {
                target: CustomResourceRef::kafka(&config.kafka_api_version, ns, mc),
                workload: ResourceHandle::new(StatefulSet, ns, format!("{mc}-kafka")),
                replicas: config.kafka_replicas,
            },
        },
    ]
}

/// Pick scenarios by name and/or tag.
///
/// With neither, selects nothing unless `all` is set. Unknown names are an error.
pub fn select<'a>(
    scenarios: &'a [Scenario],
    names: &[String],
    tag: Option<ScenarioTag>,
    all: bool,
) -> Result<Vec<&'a Scenario>> {
    for name in names {
        if !scenarios.iter().any(|s| &s.name == name) {
            return Err(Error::validation(format!("unknown scenario: {name}")));
        }
    }
    Ok(scenarios
        .iter()
        .filter(|s| {
            all || names.contains(&s.name) || tag.is_some_and(|t| s.has_tag(t))
        })
        .collect())
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Measured result of one recovery
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecoveryOutcome {
    /// Identity before the disruption
    pub original_token: String,
    /// Identity that reported Ready; equals `original_token` for in-place remediation
    pub recovered_token: String,
    /// When the timer started
    pub started_at: DateTime<Utc>,
    /// `started_at + duration`
    pub recovered_at: DateTime<Utc>,
    /// Timer duration
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

/// Verdict of one scenario run
#[derive(Clone, Debug, Serialize)]
pub struct ScenarioReport {
    /// Scenario name
    pub scenario: String,
    /// Object the verdict is about
    pub target: String,
    /// Timer entry the duration came from
    pub operation_id: OperationId,
    /// Recovery measurement
    pub outcome: RecoveryOutcome,
    /// Final identity snapshot of the recovered object
    pub snapshot: IdentitySnapshot,
    /// Result of the stability window, for scenarios that use one
    pub stable: Option<bool>,
}

/// Runs scenarios one at a time against a cluster
pub struct ScenarioRunner {
    config: HarnessConfig,
    state: Arc<dyn ClusterState>,
    identity: IdentityTracker,
    poller: RecoveryPoller,
    driver: DisruptionDriver,
    timer: OperationTimer,
}

impl ScenarioRunner {
    /// Create a runner over the given collaborators
    pub fn new(
        config: HarnessConfig,
        state: Arc<dyn ClusterState>,
        control: Arc<dyn ClusterControl>,
    ) -> Self {
        let identity = IdentityTracker::new(state.clone());
        let poller = RecoveryPoller::new(identity.clone(), ReadinessProbe::new(state.clone()));
        let driver = DisruptionDriver::new(state.clone(), control);
        Self {
            config,
            state,
            identity,
            poller,
            driver,
            timer: OperationTimer::new(),
        }
    }

    /// Configuration the runner was built with
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run one scenario to a verdict
    pub async fn run(&mut self, scenario: &Scenario) -> Result<ScenarioReport> {
        info!(scenario = %scenario.name, target = %scenario.target(), "Running scenario");
        match &scenario.disruption {
            Disruption::Delete {
                handle,
                pause_operator,
                await_pod_drain,
                expectation,
            } => {
                let options = DeleteOptions {
                    pause_operator: pause_operator.then(|| OperatorDeployment {
                        namespace: self.config.namespace.clone(),
                        name: self.config.operator_deployment.clone(),
                    }),
                    await_pod_drain: *await_pod_drain,
                };
                self.run_deletion(&scenario.name, handle, &options, expectation)
                    .await
            }
            Disruption::ImpossibleMemory {
                target,
                workload,
                replicas,
            } => {
                self.run_impossible_memory(&scenario.name, target, workload, *replicas)
                    .await
            }
        }
    }

    async fn capture_existing(&self, handle: &ResourceHandle) -> Result<String> {
        let snapshot = self.identity.capture(handle).await?;
        snapshot
            .token()
            .map(str::to_string)
            .ok_or_else(|| Error::Precondition {
                handle: handle.clone(),
                message: "object does not exist before the disruption".to_string(),
            })
    }

    async fn run_deletion(
        &mut self,
        name: &str,
        handle: &ResourceHandle,
        options: &DeleteOptions,
        expectation: &ReadinessExpectation,
    ) -> Result<ScenarioReport> {
        let original = self.capture_existing(handle).await?;
        let interval = self.config.poll_interval();

        let op = self.timer.start(name);
        let result = async {
            let started = self.timer.started_instant(op)?;
            self.driver
                .delete(
                    handle,
                    &original,
                    options,
                    PollBudget::starting_now(self.config.deletion_timeout(), interval),
                )
                .await?;

            let budget = PollBudget::since(started, self.config.recovery_timeout(), interval);
            self.poller
                .await_recovery(
                    handle,
                    &CompletionCondition::Recreated {
                        original: original.clone(),
                    },
                    expectation,
                    budget,
                )
                .await
        }
        .await;

        let report = self.conclude(op, handle, result)?;
        self.verdict(name, handle, op, original, report, None)
    }

    async fn run_impossible_memory(
        &mut self,
        name: &str,
        target: &CustomResourceRef,
        workload: &ResourceHandle,
        replicas: i32,
    ) -> Result<ScenarioReport> {
        let interval = self.config.poll_interval();
        let original = self.capture_existing(workload).await?;

        self.driver
            .degrade(target, &memory_request(&self.config.unsatisfiable_memory))
            .await?;

        if let Err(e) = self
            .await_stuck_pending(workload, &original, replicas, interval)
            .await
        {
            self.restore_memory(target).await;
            return Err(e);
        }

        let state = self.state.clone();
        let mut remediated = false;
        let op = self.timer.start(name);
        let result = async {
            let started = self.timer.started_instant(op)?;
            self.driver
                .remediate(target, &memory_request(&self.config.satisfiable_memory))
                .await?;
            remediated = true;

            let budget = PollBudget::since(started, self.config.recovery_timeout(), interval);
            let report = self
                .poller
                .await_recovery(
                    workload,
                    &CompletionCondition::InPlace {
                        original: original.clone(),
                    },
                    &ReadinessExpectation::replicas(replicas),
                    budget,
                )
                .await?;

            wait_for(&format!("{} Ready", target), budget, || {
                let state = state.clone();
                async move { Ok((state.custom_resource_ready(target).await? == Some(true)).then_some(())) }
            })
            .await?;
            Ok::<_, Error>(report)
        }
        .await;

        if result.is_err() && !remediated {
            self.restore_memory(target).await;
        }
        let report = self.conclude(op, workload, result)?;
        if report.recovered_token != original {
            return Err(Error::IdentityChanged {
                handle: workload.clone(),
                original,
                observed: report.recovered_token,
            });
        }
        self.verdict(name, workload, op, original, report, Some(true))
    }

    /// Wait until every replica is Pending, then require the pods and the
    /// workload identity to hold still for the stability window.
    async fn await_stuck_pending(
        &self,
        workload: &ResourceHandle,
        original: &str,
        replicas: i32,
        interval: Duration,
    ) -> Result<()> {
        let state = self.state.clone();
        let identity = self.identity.clone();
        let prefix = workload.pod_prefix();
        let ns = workload.namespace.as_str();
        let prefix_ref = prefix.as_str();

        wait_for(
            &format!("pods {}* Pending", prefix),
            PollBudget::starting_now(self.config.deletion_timeout(), interval),
            || {
                let state = state.clone();
                async move {
                    let pods = state.list_pods(ns, prefix_ref).await?;
                    let all_pending = pods.len() == replicas as usize
                        && pods.iter().all(|p| p.is_pending());
                    Ok(all_pending.then_some(()))
                }
            },
        )
        .await?;

        let probe = StabilityProbe::new(
            self.config.stability_samples,
            self.config.stability_interval(),
        )?;
        let (token, phases) = probe
            .require_stable(&format!("{} and pods {}*", workload, prefix), || {
                let state = state.clone();
                let identity = identity.clone();
                async move {
                    let snapshot = identity.capture(workload).await?;
                    let pods = state.list_pods(ns, prefix_ref).await?;
                    Ok((
                        snapshot.token().map(str::to_string),
                        pods.into_iter().map(|p| p.phase).collect::<Vec<_>>(),
                    ))
                }
            })
            .await?;

        if token.as_deref() != Some(original) {
            return Err(Error::IdentityChanged {
                handle: workload.clone(),
                original: original.to_string(),
                observed: token.unwrap_or_else(|| "<absent>".to_string()),
            });
        }
        info!(pods = ?phases, "Pending pods are stable");
        Ok(())
    }

    /// Best effort: put schedulable requirements back after a failed run
    async fn restore_memory(&self, target: &CustomResourceRef) {
        let requirements = memory_request(&self.config.satisfiable_memory);
        if let Err(e) = self.driver.remediate(target, &requirements).await {
            warn!(target = %target, error = %e, "Failed to restore resource requirements");
        }
    }

    /// Stop the timer and check the bound. On failure the timer entry is dropped.
    fn conclude<T>(&mut self, op: OperationId, handle: &ResourceHandle, result: Result<T>) -> Result<T> {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                warn!(handle = %handle, error = %e, "Scenario failed");
                self.timer.finish(op)?;
                return Err(e);
            }
        };
        let duration = self.timer.stop(op)?;
        let timeout = self.config.recovery_timeout();
        if duration > timeout {
            self.timer.finish(op)?;
            return Err(Error::Timeout {
                subject: handle.to_string(),
                state: "Recovered".to_string(),
                elapsed: duration,
                last: format!("recovered after the {:?} bound", timeout),
            });
        }
        Ok(value)
    }

    fn verdict(
        &mut self,
        name: &str,
        handle: &ResourceHandle,
        op: OperationId,
        original_token: String,
        report: RecoveryReport,
        stable: Option<bool>,
    ) -> Result<ScenarioReport> {
        let duration = self.timer.elapsed(op)?;
        let entry = self.timer.finish(op)?;
        let recovered_at = entry.started_at
            + chrono::Duration::from_std(duration)
                .map_err(|e| Error::timer(format!("duration out of range: {}", e)))?;

        info!(
            scenario = %name,
            handle = %handle,
            original = %original_token,
            recovered = %report.recovered_token,
            elapsed_ms = duration.as_millis() as u64,
            "Scenario recovered"
        );

        Ok(ScenarioReport {
            scenario: name.to_string(),
            target: handle.to_string(),
            operation_id: op,
            outcome: RecoveryOutcome {
                original_token,
                recovered_token: report.recovered_token,
                started_at: entry.started_at,
                recovered_at,
                duration,
            },
            snapshot: report.snapshot,
            stable,
        })
    }

    /// Timer entries still open; zero between runs
    pub fn open_operations(&self) -> usize {
        self.timer.open_entries()
    }
}

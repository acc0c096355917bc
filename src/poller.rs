//! Fixed-interval polling and the recovery state machine
//!
//! [`poll_until`] is the generic primitive: sample until a condition yields a
//! value or the budget runs out. [`RecoveryPoller`] drives the
//! `AwaitingAbsenceOrChange -> AwaitingReady -> Recovered` machine on top of
//! the same budget.
//!
//! Polling uses a constant interval with no backoff. Recovery windows are
//! short and bounded, so a constant interval keeps detection latency low.
//! All time is tokio time, so tests can drive it with a paused clock.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::identity::IdentityTracker;
use crate::readiness::{ReadinessExpectation, ReadinessProbe};
use crate::resource::{IdentitySnapshot, ReadinessState, ResourceHandle};
use crate::{Error, Result};

/// Time bound and sampling interval for a wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollBudget {
    /// When the bound started counting
    pub started: Instant,
    /// Maximum total time, measured from `started`
    pub timeout: Duration,
    /// Sleep between samples
    pub interval: Duration,
}

impl PollBudget {
    /// Budget counting from now
    pub fn starting_now(timeout: Duration, interval: Duration) -> Self {
        Self::since(Instant::now(), timeout, interval)
    }

    /// Budget counting from an earlier instant (e.g. when an operation timer started)
    pub fn since(started: Instant, timeout: Duration, interval: Duration) -> Self {
        Self {
            started,
            timeout,
            interval,
        }
    }

    /// Time spent so far
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Sleep until the next sample is due.
    ///
    /// Returns `false` without sleeping once the timeout has been reached.
    /// The last sleep is shortened so a final sample lands on the deadline.
    pub async fn wait_next(&self) -> bool {
        let elapsed = self.elapsed();
        if elapsed >= self.timeout {
            return false;
        }
        tokio::time::sleep(self.interval.min(self.timeout - elapsed)).await;
        true
    }
}

/// Result of a bounded wait
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The condition produced a value
    Recovered(T),
    /// The budget ran out first
    TimedOut {
        /// Time spent before giving up
        elapsed: Duration,
    },
}

/// Poll `poll_fn` at a fixed interval until it yields a value or the budget runs out.
///
/// `poll_fn` returns `Ok(Some(v))` when done and `Ok(None)` to keep waiting.
/// Cluster faults abort only the current attempt and are retried on the next
/// tick; any other error aborts the wait.
pub async fn poll_until<T, F, Fut>(
    description: &str,
    budget: PollBudget,
    mut poll_fn: F,
) -> Result<PollOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    loop {
        match poll_fn().await {
            Ok(Some(value)) => return Ok(PollOutcome::Recovered(value)),
            Ok(None) => {}
            Err(e) if e.is_cluster_fault() => {
                warn!(error = %e, "Poll error for {}, retrying...", description);
            }
            Err(e) => return Err(e),
        }

        if !budget.wait_next().await {
            return Ok(PollOutcome::TimedOut {
                elapsed: budget.elapsed(),
            });
        }
    }
}

/// Poll until `poll_fn` yields a value, turning a timeout into [`Error::Timeout`]
pub async fn wait_for<T, F, Fut>(description: &str, budget: PollBudget, poll_fn: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    match poll_until(description, budget, poll_fn).await? {
        PollOutcome::Recovered(value) => Ok(value),
        PollOutcome::TimedOut { elapsed } => Err(Error::Timeout {
            subject: description.to_string(),
            state: "waiting".to_string(),
            elapsed,
            last: "condition not met".to_string(),
        }),
    }
}

/// What counts as "the operator re-established the object"
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionCondition {
    /// The object was deleted and must come back under a new identity
    Recreated {
        /// Identity token before the disruption
        original: String,
    },
    /// The object is reconfigured, not replaced; its identity must be preserved
    InPlace {
        /// Identity token that must still answer to the handle
        original: String,
    },
}

impl CompletionCondition {
    /// Identity token before the disruption
    pub fn original(&self) -> &str {
        match self {
            CompletionCondition::Recreated { original } | CompletionCondition::InPlace { original } => {
                original
            }
        }
    }
}

/// States of the recovery state machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryState {
    /// Waiting for the object to be recreated (or, in place, to still be there)
    AwaitingAbsenceOrChange,
    /// The expected identity is present; waiting for it to become Ready
    AwaitingReady {
        /// Identity being waited on
        token: String,
    },
    /// The expected identity reported Ready
    Recovered,
    /// The timeout elapsed first
    TimedOut,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryState::AwaitingAbsenceOrChange => f.write_str("AwaitingAbsenceOrChange"),
            RecoveryState::AwaitingReady { token } => write!(f, "AwaitingReady({token})"),
            RecoveryState::Recovered => f.write_str("Recovered"),
            RecoveryState::TimedOut => f.write_str("TimedOut"),
        }
    }
}

/// Result of a successful recovery wait
#[derive(Clone, Debug)]
pub struct RecoveryReport {
    /// Identity snapshot that reported Ready
    pub snapshot: IdentitySnapshot,
    /// Identity token that reported Ready
    pub recovered_token: String,
    /// When the Ready observation was made
    pub recovered_at: Instant,
    /// Number of samples taken
    pub ticks: u32,
    /// Every state the machine passed through, in order
    pub transitions: Vec<RecoveryState>,
}

/// Mutable state of one recovery wait
struct Machine<'a> {
    handle: &'a ResourceHandle,
    completion: &'a CompletionCondition,
    state: RecoveryState,
    transitions: Vec<RecoveryState>,
    snapshot: Option<IdentitySnapshot>,
    last: String,
}

impl<'a> Machine<'a> {
    fn new(handle: &'a ResourceHandle, completion: &'a CompletionCondition) -> Self {
        Self {
            handle,
            completion,
            state: RecoveryState::AwaitingAbsenceOrChange,
            transitions: vec![RecoveryState::AwaitingAbsenceOrChange],
            snapshot: None,
            last: "no observation yet".to_string(),
        }
    }

    fn transition(&mut self, next: RecoveryState) {
        debug!(handle = %self.handle, from = %self.state, to = %next, "Recovery state transition");
        self.transitions.push(next.clone());
        self.state = next;
    }
}

/// Drives the wait-until-recreated-and-ready state machine
#[derive(Clone)]
pub struct RecoveryPoller {
    identity: IdentityTracker,
    readiness: ReadinessProbe,
}

impl RecoveryPoller {
    /// Create a poller from its two probes
    pub fn new(identity: IdentityTracker, readiness: ReadinessProbe) -> Self {
        Self {
            identity,
            readiness,
        }
    }

    /// Wait until the handle satisfies `completion` and reports Ready.
    ///
    /// Exceeding the budget is [`Error::Timeout`] carrying the state the
    /// machine was stuck in and the last observation. Invoked again on an
    /// already-recovered object with `InPlace` and its current token, this
    /// re-confirms Ready on the first sample.
    pub async fn await_recovery(
        &self,
        handle: &ResourceHandle,
        completion: &CompletionCondition,
        expectation: &ReadinessExpectation,
        budget: PollBudget,
    ) -> Result<RecoveryReport> {
        let mut machine = Machine::new(handle, completion);
        let mut ticks = 0u32;

        loop {
            ticks += 1;
            match self.step(&mut machine, expectation).await {
                Ok(true) => {
                    let recovered_at = Instant::now();
                    let snapshot = machine.snapshot.clone().ok_or_else(|| {
                        Error::validation("recovered without an identity snapshot")
                    })?;
                    let recovered_token = snapshot
                        .token()
                        .ok_or_else(|| Error::validation("recovered snapshot has no token"))?
                        .to_string();
                    info!(
                        handle = %handle,
                        token = %recovered_token,
                        elapsed_ms = budget.elapsed().as_millis() as u64,
                        ticks,
                        "Recovered"
                    );
                    return Ok(RecoveryReport {
                        snapshot,
                        recovered_token,
                        recovered_at,
                        ticks,
                        transitions: machine.transitions,
                    });
                }
                Ok(false) => {}
                Err(e) if e.is_cluster_fault() => {
                    warn!(handle = %handle, error = %e, "Poll error, retrying on next tick");
                    machine.last = format!("cluster error: {}", e);
                }
                Err(e) => return Err(e),
            }

            if !budget.wait_next().await {
                let stuck_in = machine.state.to_string();
                machine.transition(RecoveryState::TimedOut);
                return Err(Error::Timeout {
                    subject: handle.to_string(),
                    state: stuck_in,
                    elapsed: budget.elapsed(),
                    last: machine.last,
                });
            }
        }
    }

    /// One sample. Returns `Ok(true)` once Recovered.
    ///
    /// A transition to AwaitingReady is followed by a readiness check in the
    /// same sample.
    async fn step(
        &self,
        machine: &mut Machine<'_>,
        expectation: &ReadinessExpectation,
    ) -> Result<bool> {
        let handle = machine.handle;

        if machine.state == RecoveryState::AwaitingAbsenceOrChange {
            let snapshot = self.identity.capture(handle).await?;
            machine.last = format!("identity {:?}", snapshot.token());
            let accepted = match (machine.completion, snapshot.token()) {
                (_, None) => None,
                (CompletionCondition::Recreated { original }, Some(token)) => {
                    (token != original.as_str()).then(|| token.to_string())
                }
                (CompletionCondition::InPlace { original }, Some(token)) => {
                    if token != original.as_str() {
                        return Err(Error::IdentityChanged {
                            handle: handle.clone(),
                            original: original.clone(),
                            observed: token.to_string(),
                        });
                    }
                    Some(token.to_string())
                }
            };
            machine.snapshot = Some(snapshot);
            match accepted {
                Some(token) => machine.transition(RecoveryState::AwaitingReady { token }),
                None => return Ok(false),
            }
        }

        let RecoveryState::AwaitingReady { token } = machine.state.clone() else {
            return Ok(machine.state == RecoveryState::Recovered);
        };

        let observation = self.readiness.check(handle, expectation).await?;
        machine.last = observation.detail.clone();

        let original = machine.completion.original();
        if let CompletionCondition::Recreated { .. } = machine.completion {
            if observation.token.as_deref() == Some(original) && observation.state.is_ready() {
                return Err(Error::PrematureReadiness {
                    handle: handle.clone(),
                    token: original.to_string(),
                });
            }
        }

        if observation.token.as_deref() != Some(token.as_str()) {
            // Gone again, or replaced once more; re-establish identity first.
            if let (CompletionCondition::InPlace { original }, Some(observed)) =
                (machine.completion, observation.token.as_deref())
            {
                return Err(Error::IdentityChanged {
                    handle: handle.clone(),
                    original: original.clone(),
                    observed: observed.to_string(),
                });
            }
            machine.transition(RecoveryState::AwaitingAbsenceOrChange);
            return Ok(false);
        }

        match observation.for_identity(&token) {
            ReadinessState::Ready => {
                machine.transition(RecoveryState::Recovered);
                Ok(true)
            }
            state => {
                debug!(handle = %handle, state = ?state, detail = %observation.detail, "Not ready yet");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterState;
    use crate::error::cluster_fault;
    use crate::resource::{ResourceKind, ResourceStatus};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    const INTERVAL: Duration = Duration::from_secs(2);
    const TIMEOUT: Duration = Duration::from_secs(60);

    fn handle() -> ResourceHandle {
        ResourceHandle::new(ResourceKind::StatefulSet, "ns", "cluster-kafka")
    }

    fn workload(uid: &str, ready: i32) -> ResourceStatus {
        ResourceStatus::Workload {
            uid: uid.to_string(),
            desired_replicas: 3,
            ready_replicas: ready,
        }
    }

    /// Mock whose identity and status follow a script, one entry per call.
    /// The last entry repeats once the script is exhausted.
    fn scripted(
        identities: Vec<Option<&'static str>>,
        statuses: Vec<ResourceStatus>,
    ) -> Arc<MockClusterState> {
        let identities = Arc::new(Mutex::new(identities));
        let statuses = Arc::new(Mutex::new(statuses));
        let mut mock = MockClusterState::new();
        mock.expect_get_identity().returning(move |_| {
            let mut ids = identities.lock().unwrap();
            let next = if ids.len() > 1 { ids.remove(0) } else { ids[0] };
            Ok(next.map(str::to_string))
        });
        mock.expect_get_status().returning(move |_| {
            let mut st = statuses.lock().unwrap();
            Ok(if st.len() > 1 { st.remove(0) } else { st[0].clone() })
        });
        Arc::new(mock)
    }

    fn poller(cluster: Arc<MockClusterState>) -> RecoveryPoller {
        RecoveryPoller::new(
            IdentityTracker::new(cluster.clone()),
            ReadinessProbe::new(cluster),
        )
    }

    fn recreated() -> CompletionCondition {
        CompletionCondition::Recreated {
            original: "uid-1".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_returns_value_when_condition_met() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let outcome = poll_until("counter", PollBudget::starting_now(TIMEOUT, INTERVAL), || {
            let c = c.clone();
            async move { Ok((c.fetch_add(1, Ordering::SeqCst) >= 2).then_some(42)) }
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Recovered(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out_at_the_bound() {
        let budget = PollBudget::starting_now(Duration::from_secs(10), Duration::from_secs(3));
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let outcome: PollOutcome<()> = poll_until("never", budget, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })
        .await
        .unwrap();

        // Samples at 0, 3, 6, 9 and a final one on the deadline at 10
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(
            outcome,
            PollOutcome::TimedOut {
                elapsed: Duration::from_secs(10)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_retries_cluster_faults_but_not_others() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let outcome = poll_until("flaky", PollBudget::starting_now(TIMEOUT, INTERVAL), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(cluster_fault("connection reset"))
                } else {
                    Ok(Some("ok"))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(outcome, PollOutcome::Recovered("ok"));

        let err = poll_until::<(), _, _>(
            "fatal",
            PollBudget::starting_now(TIMEOUT, INTERVAL),
            || async { Err(Error::validation("fatal")) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_maps_timeout_to_error() {
        let err = wait_for::<(), _, _>(
            "pods pending",
            PollBudget::starting_now(Duration::from_secs(4), INTERVAL),
            || async { Ok(None) },
        )
        .await
        .unwrap_err();
        match err {
            Error::Timeout { subject, elapsed, .. } => {
                assert_eq!(subject, "pods pending");
                assert_eq!(elapsed, Duration::from_secs(4));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    /// Story: a deleted StatefulSet is absent for a while, then comes back
    /// under a new uid and climbs 0/3 -> 1/3 -> 3/3
    #[tokio::test(start_paused = true)]
    async fn story_recreated_object_recovers_under_new_identity() {
        let cluster = scripted(
            vec![Some("uid-1"), None, None, Some("uid-2")],
            vec![workload("uid-2", 0), workload("uid-2", 1), workload("uid-2", 3)],
        );
        let report = poller(cluster)
            .await_recovery(
                &handle(),
                &recreated(),
                &ReadinessExpectation::replicas(3),
                PollBudget::starting_now(TIMEOUT, INTERVAL),
            )
            .await
            .unwrap();

        assert_eq!(report.recovered_token, "uid-2");
        assert_ne!(report.recovered_token, "uid-1");
        assert_eq!(report.ticks, 6);
        assert_eq!(
            report.transitions,
            vec![
                RecoveryState::AwaitingAbsenceOrChange,
                RecoveryState::AwaitingReady {
                    token: "uid-2".to_string()
                },
                RecoveryState::Recovered,
            ]
        );
    }

    /// Story: the operator never recreates the object; the wait ends with a
    /// checked timeout naming the stuck state
    #[tokio::test(start_paused = true)]
    async fn story_missing_recreation_times_out() {
        let cluster = scripted(vec![None], vec![ResourceStatus::Absent]);
        let err = poller(cluster)
            .await_recovery(
                &handle(),
                &recreated(),
                &ReadinessExpectation::replicas(3),
                PollBudget::starting_now(Duration::from_secs(10), INTERVAL),
            )
            .await
            .unwrap_err();

        match err {
            Error::Timeout {
                state,
                elapsed,
                last,
                ..
            } => {
                assert_eq!(state, "AwaitingAbsenceOrChange");
                assert_eq!(elapsed, Duration::from_secs(10));
                assert_eq!(last, "identity None");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    /// Story: an untouched object (same uid) is never mistaken for a recreated one
    #[tokio::test(start_paused = true)]
    async fn story_untouched_object_is_not_recovery() {
        let cluster = scripted(vec![Some("uid-1")], vec![workload("uid-1", 3)]);
        let err = poller(cluster)
            .await_recovery(
                &handle(),
                &recreated(),
                &ReadinessExpectation::replicas(3),
                PollBudget::starting_now(Duration::from_secs(6), INTERVAL),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    /// Story: the new identity is partially ready when the budget runs out
    #[tokio::test(start_paused = true)]
    async fn story_partial_readiness_times_out_in_awaiting_ready() {
        let cluster = scripted(vec![Some("uid-2")], vec![workload("uid-2", 1)]);
        let err = poller(cluster)
            .await_recovery(
                &handle(),
                &recreated(),
                &ReadinessExpectation::replicas(3),
                PollBudget::starting_now(Duration::from_secs(6), INTERVAL),
            )
            .await
            .unwrap_err();
        match err {
            Error::Timeout { state, last, .. } => {
                assert_eq!(state, "AwaitingReady(uid-2)");
                assert_eq!(last, "uid-2: 1/3 ready");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    /// Story: a lagging read serves the old object's Ready status after the
    /// new identity was seen; that must never count as recovery
    #[tokio::test(start_paused = true)]
    async fn story_stale_ready_status_is_premature_readiness() {
        let cluster = scripted(vec![Some("uid-2")], vec![workload("uid-1", 3)]);
        let err = poller(cluster)
            .await_recovery(
                &handle(),
                &recreated(),
                &ReadinessExpectation::replicas(3),
                PollBudget::starting_now(TIMEOUT, INTERVAL),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PrematureReadiness { ref token, .. } if token == "uid-1"));
    }

    /// Story: the object disappears again between identity and status reads;
    /// the machine drops back and waits for identity again
    #[tokio::test(start_paused = true)]
    async fn story_object_vanishing_again_restarts_identity_wait() {
        let cluster = scripted(
            vec![Some("uid-2"), Some("uid-3")],
            vec![ResourceStatus::Absent, workload("uid-3", 3)],
        );
        let report = poller(cluster)
            .await_recovery(
                &handle(),
                &recreated(),
                &ReadinessExpectation::replicas(3),
                PollBudget::starting_now(TIMEOUT, INTERVAL),
            )
            .await
            .unwrap();

        assert_eq!(report.recovered_token, "uid-3");
        assert_eq!(
            report.transitions,
            vec![
                RecoveryState::AwaitingAbsenceOrChange,
                RecoveryState::AwaitingReady {
                    token: "uid-2".to_string()
                },
                RecoveryState::AwaitingAbsenceOrChange,
                RecoveryState::AwaitingReady {
                    token: "uid-3".to_string()
                },
                RecoveryState::Recovered,
            ]
        );
    }

    /// Story: the broker StatefulSet is patched, not replaced; same uid, and
    /// readiness arrives later
    #[tokio::test(start_paused = true)]
    async fn story_in_place_remediation_keeps_identity() {
        let cluster = scripted(
            vec![Some("uid-1")],
            vec![workload("uid-1", 0), workload("uid-1", 2), workload("uid-1", 3)],
        );
        let report = poller(cluster)
            .await_recovery(
                &handle(),
                &CompletionCondition::InPlace {
                    original: "uid-1".to_string(),
                },
                &ReadinessExpectation::replicas(3),
                PollBudget::starting_now(TIMEOUT, INTERVAL),
            )
            .await
            .unwrap();
        assert_eq!(report.recovered_token, "uid-1");
        assert_eq!(report.ticks, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_place_rejects_recreation() {
        let cluster = scripted(vec![Some("uid-9")], vec![workload("uid-9", 3)]);
        let err = poller(cluster)
            .await_recovery(
                &handle(),
                &CompletionCondition::InPlace {
                    original: "uid-1".to_string(),
                },
                &ReadinessExpectation::replicas(3),
                PollBudget::starting_now(TIMEOUT, INTERVAL),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdentityChanged { ref observed, .. } if observed == "uid-9"));
    }

    /// Story: asking again after recovery, with the now-current uid,
    /// re-confirms Ready on the first sample without sleeping
    #[tokio::test(start_paused = true)]
    async fn story_reconfirming_recovered_object_is_immediate() {
        let cluster = scripted(vec![Some("uid-2")], vec![workload("uid-2", 3)]);
        let poller = poller(cluster);
        let budget = PollBudget::starting_now(TIMEOUT, INTERVAL);
        let completion = CompletionCondition::InPlace {
            original: "uid-2".to_string(),
        };

        let first = poller
            .await_recovery(&handle(), &completion, &ReadinessExpectation::replicas(3), budget)
            .await
            .unwrap();
        let again = poller
            .await_recovery(&handle(), &completion, &ReadinessExpectation::replicas(3), budget)
            .await
            .unwrap();

        assert_eq!(again.ticks, 1);
        assert_eq!(again.transitions, first.transitions);
        assert_eq!(again.recovered_token, "uid-2");
        assert!(budget.elapsed() < INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cluster_faults_do_not_abort_recovery() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut mock = MockClusterState::new();
        mock.expect_get_identity().returning(move |_| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(cluster_fault("connection reset"))
            } else {
                Ok(Some("uid-2".to_string()))
            }
        });
        mock.expect_get_status()
            .returning(|_| Ok(workload("uid-2", 3)));

        let report = poller(Arc::new(mock))
            .await_recovery(
                &handle(),
                &recreated(),
                &ReadinessExpectation::replicas(3),
                PollBudget::starting_now(TIMEOUT, INTERVAL),
            )
            .await
            .unwrap();
        assert_eq!(report.ticks, 2);
    }
}

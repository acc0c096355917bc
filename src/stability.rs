//! Proving that a value stays put
//!
//! Used to assert a resource is durably stuck (e.g. pods Pending because
//! nothing can schedule them) rather than caught mid-flap.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::{Error, Result};

/// One observation inside a stability window
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StabilitySample<T> {
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
    /// Observed value
    pub value: T,
}

/// Samples collected by one stability probe, in order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StabilityWindow<T> {
    /// Samples taken; stops at the first one that differs from the first
    pub samples: Vec<StabilitySample<T>>,
    /// Number of samples the window asked for
    pub requested: usize,
}

impl<T: PartialEq> StabilityWindow<T> {
    /// Index of the first sample that differs from the first one
    pub fn first_change(&self) -> Option<usize> {
        let first = &self.samples.first()?.value;
        self.samples.iter().position(|s| &s.value != first)
    }

    /// All requested samples were taken and every one equals the first
    pub fn is_stable(&self) -> bool {
        self.samples.len() == self.requested && self.first_change().is_none()
    }
}

/// Samples a value repeatedly to confirm it does not change
#[derive(Clone, Copy, Debug)]
pub struct StabilityProbe {
    sample_count: usize,
    interval: Duration,
}

impl StabilityProbe {
    /// Probe taking `sample_count` samples, `interval` apart
    pub fn new(sample_count: usize, interval: Duration) -> Result<Self> {
        if sample_count == 0 {
            return Err(Error::validation("stability window needs at least one sample"));
        }
        Ok(Self {
            sample_count,
            interval,
        })
    }

    /// Total time a full window spans
    pub fn window(&self) -> Duration {
        self.interval * (self.sample_count.saturating_sub(1) as u32)
    }

    /// Take the samples. Stops early at the first value that differs from the first.
    ///
    /// A sample that cannot be taken (cluster fault) aborts the window: a gap
    /// would make the verdict meaningless.
    pub async fn observe_window<T, F, Fut>(&self, mut sample: F) -> Result<StabilityWindow<T>>
    where
        T: PartialEq + Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut window = StabilityWindow {
            samples: Vec::with_capacity(self.sample_count),
            requested: self.sample_count,
        };

        for index in 0..self.sample_count {
            if index > 0 {
                tokio::time::sleep(self.interval).await;
            }
            let value = sample().await?;
            debug!(index, value = ?value, "Stability sample");
            window.samples.push(StabilitySample {
                timestamp: Utc::now(),
                value,
            });
            if window.first_change().is_some() {
                break;
            }
        }
        Ok(window)
    }

    /// True iff every one of the samples equals the first
    pub async fn observe_stability<T, F, Fut>(&self, sample: F) -> Result<bool>
    where
        T: PartialEq + Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        Ok(self.observe_window(sample).await?.is_stable())
    }

    /// Like [`observe_stability`](Self::observe_stability), but a change is
    /// [`Error::UnexpectedTransition`]. Returns the stable value.
    pub async fn require_stable<T, F, Fut>(&self, subject: &str, sample: F) -> Result<T>
    where
        T: PartialEq + Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut window = self.observe_window(sample).await?;
        if let Some(index) = window.first_change() {
            return Err(Error::UnexpectedTransition {
                subject: subject.to_string(),
                index,
                first: format!("{:?}", window.samples[0].value),
                observed: format!("{:?}", window.samples[index].value),
            });
        }
        info!(
            subject,
            samples = window.samples.len(),
            window_secs = self.window().as_secs(),
            "Stable"
        );
        let first = window.samples.swap_remove(0);
        Ok(first.value)
    }
}

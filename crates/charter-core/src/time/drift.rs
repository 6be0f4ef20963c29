//! Advisory clock-drift detection.
//!
//! A drift check never rejects or delays a write. When the writer's clock
//! and the authority clock disagree by more than the threshold, the monitor
//! logs a structured warning and appends an observation to a side channel
//! that can be queried separately from the chain.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::Clock;

/// Default tolerated difference between local and authority timestamps.
pub const DEFAULT_DRIFT_THRESHOLD: Duration = Duration::from_secs(5);

/// A recorded clock discrepancy for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftObservation {
    /// Event the observation refers to.
    pub event_id: String,
    /// Writer clock at draft creation.
    pub local_timestamp_ns: u64,
    /// Store clock at commit.
    pub authority_timestamp_ns: u64,
    /// Absolute difference in seconds.
    pub drift_seconds: f64,
    /// When the observation was made.
    pub logged_at_ns: u64,
}

/// A drift sink failed to persist an observation.
#[derive(Debug, Error)]
#[error("drift sink failure: {message}")]
pub struct DriftSinkError {
    /// Underlying failure.
    pub message: String,
}

/// Append-only destination for drift observations.
pub trait DriftSink: Send + Sync {
    /// Records one observation.
    ///
    /// # Errors
    ///
    /// Returns [`DriftSinkError`] if the observation could not be stored.
    fn record(&self, observation: &DriftObservation) -> Result<(), DriftSinkError>;
}

/// Keeps observations in memory.
#[derive(Debug, Default)]
pub struct MemoryDriftSink {
    observations: Mutex<Vec<DriftObservation>>,
}

impl MemoryDriftSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn observations(&self) -> Vec<DriftObservation> {
        self.observations.lock().unwrap().clone()
    }
}

impl DriftSink for MemoryDriftSink {
    fn record(&self, observation: &DriftObservation) -> Result<(), DriftSinkError> {
        self.observations
            .lock()
            .map_err(|e| DriftSinkError {
                message: e.to_string(),
            })?
            .push(observation.clone());
        Ok(())
    }
}

/// Compares local and authority timestamps against a threshold.
#[derive(Clone)]
pub struct DriftMonitor {
    threshold: Duration,
    sink: Arc<dyn DriftSink>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DriftMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriftMonitor")
            .field("threshold", &self.threshold)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl DriftMonitor {
    /// Creates a monitor writing to `sink` and stamping `logged_at_ns` from
    /// `clock`.
    #[must_use]
    pub fn new(threshold: Duration, sink: Arc<dyn DriftSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold,
            sink,
            clock,
        }
    }

    /// The configured threshold.
    #[must_use]
    pub const fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Checks one event's timestamps.
    ///
    /// Returns the observation when the drift exceeded the threshold. The
    /// observation is returned even if the sink failed. Such failures are
    /// logged and never surfaced, because drift must not become a write
    /// hazard.
    #[allow(clippy::cast_precision_loss)]
    pub fn check_drift(
        &self,
        local_timestamp_ns: u64,
        authority_timestamp_ns: u64,
        event_id: &str,
    ) -> Option<DriftObservation> {
        let drift_ns = authority_timestamp_ns.abs_diff(local_timestamp_ns);
        if u128::from(drift_ns) <= self.threshold.as_nanos() {
            return None;
        }

        let observation = DriftObservation {
            event_id: event_id.to_owned(),
            local_timestamp_ns,
            authority_timestamp_ns,
            drift_seconds: drift_ns as f64 / 1e9,
            logged_at_ns: self.clock.now_ns(),
        };

        warn!(
            event_id = %observation.event_id,
            local_timestamp_ns,
            authority_timestamp_ns,
            drift_seconds = observation.drift_seconds,
            threshold_seconds = self.threshold.as_secs_f64(),
            "clock drift exceeds threshold"
        );

        if let Err(error) = self.sink.record(&observation) {
            warn!(event_id = %observation.event_id, %error, "failed to record drift observation");
        }

        Some(observation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    const SECOND: u64 = 1_000_000_000;

    fn monitor(sink: Arc<MemoryDriftSink>) -> DriftMonitor {
        DriftMonitor::new(
            DEFAULT_DRIFT_THRESHOLD,
            sink,
            Arc::new(ManualClock::new(42 * SECOND)),
        )
    }

    #[test]
    fn test_within_threshold_is_silent() {
        let sink = Arc::new(MemoryDriftSink::new());
        let monitor = monitor(Arc::clone(&sink));

        assert!(monitor.check_drift(100 * SECOND, 105 * SECOND, "e1").is_none());
        assert!(monitor.check_drift(105 * SECOND, 100 * SECOND, "e2").is_none());
        assert!(sink.observations().is_empty());
    }

    #[test]
    fn test_drift_in_either_direction_is_recorded() {
        let sink = Arc::new(MemoryDriftSink::new());
        let monitor = monitor(Arc::clone(&sink));

        let behind = monitor.check_drift(90 * SECOND, 100 * SECOND, "e1").unwrap();
        assert!((behind.drift_seconds - 10.0).abs() < 1e-9);
        assert_eq!(behind.logged_at_ns, 42 * SECOND);

        let ahead = monitor.check_drift(107 * SECOND, 100 * SECOND, "e2").unwrap();
        assert!((ahead.drift_seconds - 7.0).abs() < 1e-9);

        let recorded = sink.observations();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].event_id, "e1");
        assert_eq!(recorded[1].event_id, "e2");
    }

    #[test]
    fn test_sink_failure_is_swallowed() {
        struct FailingSink;
        impl DriftSink for FailingSink {
            fn record(&self, _: &DriftObservation) -> Result<(), DriftSinkError> {
                Err(DriftSinkError {
                    message: "disk full".to_string(),
                })
            }
        }

        let monitor = DriftMonitor::new(
            Duration::from_secs(1),
            Arc::new(FailingSink),
            Arc::new(ManualClock::new(0)),
        );
        assert!(monitor.check_drift(0, 3 * SECOND, "e").is_some());
    }
}

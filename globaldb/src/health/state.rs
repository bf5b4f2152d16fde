//! The health state machine, kept pure: no locks, no I/O, no clock reads.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::HealthTrackerConfig;
use crate::routing::OperationKind;

/// Health of a `(partition, region)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    /// No reason to avoid the pair.
    Healthy,
    /// Suspect after a threshold breach: still usable, but ordered after
    /// healthy candidates. One more qualifying failure trips the breaker;
    /// one success clears the suspicion.
    UnhealthyTentative,
    /// Tripped: excluded from candidate lists (kept only as fallback of
    /// last resort) until a cooldown elapses and a probe succeeds.
    Unhealthy,
}

/// Ring buffer over the most recent request outcomes of one operation
/// class. Only these outcomes feed the failure rate, so a pair that
/// misbehaved long ago stops being penalized once fresh outcomes push the
/// old ones out.
#[derive(Debug, Clone)]
struct RollingWindow {
    /// `true` entries are failures.
    outcomes: VecDeque<bool>,
    failures: usize,
    capacity: usize,
}

impl RollingWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RollingWindow {
            outcomes: VecDeque::with_capacity(capacity),
            failures: 0,
            capacity,
        }
    }

    fn record(&mut self, failed: bool) {
        if self.outcomes.len() == self.capacity {
            if self.outcomes.pop_front() == Some(true) {
                self.failures -= 1;
            }
        }
        self.outcomes.push_back(failed);
        if failed {
            self.failures += 1;
        }
    }

    fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Failed fraction of the window, in percent. 0 for an empty window.
    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.failures as f64 * 100.0 / self.outcomes.len() as f64
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
    }
}

/// Availability verdict for a pair, as computed by [HealthInfo::availability].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Availability {
    /// Healthy: natural preference position.
    Preferred,
    /// Suspect: usable, ordered after the preferred candidates.
    Demoted,
    /// Unhealthy with an elapsed cooldown: this call acquired the single
    /// probe slot.
    ProbeAcquired,
    /// Unhealthy: excluded except as fallback of last resort.
    Blocked,
}

/// A state change worth surfacing in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub(crate) from: HealthStatus,
    pub(crate) to: HealthStatus,
}

/// Mutable health record of a single `(partition, region)` pair.
///
/// Created lazily on the first recorded outcome for the pair and mutated on
/// every completed request. All methods are plain state manipulation; the
/// caller supplies the current time and provides mutual exclusion.
#[derive(Debug, Clone)]
pub(crate) struct HealthInfo {
    status: HealthStatus,
    read_consecutive_failures: u32,
    write_consecutive_failures: u32,
    read_window: RollingWindow,
    write_window: RollingWindow,
    unavailable_since: Option<Instant>,
    cooldown: Duration,
    probe_in_flight: bool,
}

impl HealthInfo {
    pub(crate) fn new(config: &HealthTrackerConfig) -> Self {
        HealthInfo {
            status: HealthStatus::Healthy,
            read_consecutive_failures: 0,
            write_consecutive_failures: 0,
            read_window: RollingWindow::new(config.window_capacity),
            write_window: RollingWindow::new(config.window_capacity),
            unavailable_since: None,
            cooldown: config.initial_cooldown,
            probe_in_flight: false,
        }
    }

    pub(crate) fn status(&self) -> HealthStatus {
        self.status
    }

    /// Records a successful (non-probe) request outcome.
    pub(crate) fn record_success(&mut self, operation: OperationKind) -> Option<Transition> {
        *self.consecutive_mut(operation) = 0;
        self.window_mut(operation).record(false);

        match self.status {
            // The suspicion was backed by the consecutive counter, which
            // this success just reset.
            HealthStatus::UnhealthyTentative => {
                self.unavailable_since = None;
                Some(self.transition_to(HealthStatus::Healthy))
            }
            // Recovery from Unhealthy goes through the probe protocol only.
            _ => None,
        }
    }

    /// Records a failed (non-probe) request outcome and evaluates the
    /// breach conditions for `operation`'s class.
    pub(crate) fn record_failure(
        &mut self,
        operation: OperationKind,
        now: Instant,
        config: &HealthTrackerConfig,
    ) -> Option<Transition> {
        let consecutive = self.consecutive_mut(operation);
        *consecutive = consecutive.saturating_add(1);
        let consecutive = *consecutive;
        self.window_mut(operation).record(true);

        let threshold = match operation {
            OperationKind::Read => config.read_consecutive_failure_threshold,
            OperationKind::Write => config.write_consecutive_failure_threshold,
        };
        let consecutive_breach = consecutive >= threshold;
        let window = self.window(operation);
        let rate_breach = window.len() >= config.min_samples_for_failure_rate
            && window.failure_rate() >= config.failure_rate_threshold;

        match self.status {
            HealthStatus::Healthy if consecutive_breach || rate_breach => {
                self.unavailable_since = Some(now);
                if rate_breach {
                    // A breached failure rate (over enough samples) trips
                    // the breaker outright; the pair passes through the
                    // tentative state within this same event.
                    self.status = HealthStatus::Unhealthy;
                    Some(Transition {
                        from: HealthStatus::Healthy,
                        to: HealthStatus::Unhealthy,
                    })
                } else {
                    Some(self.transition_to(HealthStatus::UnhealthyTentative))
                }
            }
            HealthStatus::UnhealthyTentative if consecutive_breach || rate_breach => {
                self.unavailable_since = Some(now);
                Some(self.transition_to(HealthStatus::Unhealthy))
            }
            _ => None,
        }
    }

    /// Computes the pair's availability; acquires the probe slot when an
    /// Unhealthy pair's cooldown has elapsed and no probe is in flight.
    pub(crate) fn availability(&mut self, now: Instant) -> Availability {
        match self.status {
            HealthStatus::Healthy => Availability::Preferred,
            HealthStatus::UnhealthyTentative => Availability::Demoted,
            HealthStatus::Unhealthy => {
                let Some(since) = self.unavailable_since else {
                    return Availability::Blocked;
                };
                if self.probe_in_flight || now.duration_since(since) < self.cooldown {
                    Availability::Blocked
                } else {
                    self.probe_in_flight = true;
                    Availability::ProbeAcquired
                }
            }
        }
    }

    /// Commits the outcome of the in-flight probe.
    ///
    /// Success resets the pair fully (counters zeroed, windows cleared,
    /// cooldown back to initial). Failure restarts the cooldown, doubled up
    /// to the configured maximum.
    pub(crate) fn complete_probe(
        &mut self,
        success: bool,
        now: Instant,
        config: &HealthTrackerConfig,
    ) -> Option<Transition> {
        if !self.probe_in_flight {
            return None;
        }
        self.probe_in_flight = false;

        if success {
            self.read_consecutive_failures = 0;
            self.write_consecutive_failures = 0;
            self.read_window.clear();
            self.write_window.clear();
            self.unavailable_since = None;
            self.cooldown = config.initial_cooldown;
            Some(self.transition_to(HealthStatus::Healthy))
        } else {
            self.unavailable_since = Some(now);
            self.cooldown = self.cooldown.saturating_mul(2).min(config.max_cooldown);
            None
        }
    }

    /// Releases an unreported probe slot (the probing request was cancelled
    /// or abandoned). No penalty: the pair stays Unhealthy with its
    /// cooldown already elapsed, so the next availability check may probe.
    pub(crate) fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }

    fn consecutive_mut(&mut self, operation: OperationKind) -> &mut u32 {
        match operation {
            OperationKind::Read => &mut self.read_consecutive_failures,
            OperationKind::Write => &mut self.write_consecutive_failures,
        }
    }

    fn window(&self, operation: OperationKind) -> &RollingWindow {
        match operation {
            OperationKind::Read => &self.read_window,
            OperationKind::Write => &self.write_window,
        }
    }

    fn window_mut(&mut self, operation: OperationKind) -> &mut RollingWindow {
        match operation {
            OperationKind::Read => &mut self.read_window,
            OperationKind::Write => &mut self.write_window,
        }
    }

    fn transition_to(&mut self, to: HealthStatus) -> Transition {
        let from = self.status;
        self.status = to;
        Transition { from, to }
    }

    #[cfg(test)]
    pub(crate) fn consecutive_failures(&self, operation: OperationKind) -> u32 {
        match operation {
            OperationKind::Read => self.read_consecutive_failures,
            OperationKind::Write => self.write_consecutive_failures,
        }
    }
}

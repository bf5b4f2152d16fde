//! Concurrent adapter over the pure health state machine.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::HealthTrackerConfig;
use crate::health::state::{Availability, HealthInfo, HealthStatus};
use crate::routing::{OperationKind, PartitionKeyRange};

/// One health record per `(partition, region)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HealthKey {
    partition: PartitionKeyRange,
    region: Arc<str>,
}

#[derive(Debug)]
struct TrackerInner {
    entries: DashMap<HealthKey, HealthInfo>,
    config: HealthTrackerConfig,
}

/// Tracks request outcomes per `(partition, region)` pair and answers
/// whether a pair is currently usable.
///
/// Entries are created lazily on the first recorded outcome and never
/// removed: the map is bounded by the workload's partition cardinality.
/// All state manipulation happens under the map's shard lock, so counter
/// updates and transitions on a pair are atomic with respect to each
/// other, and the probe slot is granted to exactly one caller.
///
/// Cloning is cheap; clones share state.
#[derive(Debug, Clone)]
pub struct PartitionHealthTracker {
    inner: Arc<TrackerInner>,
}

/// Availability of a `(partition, region)` pair for a new request.
#[derive(Debug)]
pub enum RegionAvailability {
    /// Healthy: keep the pair at its natural preference position.
    Available,
    /// Suspect: usable, but ordered after available regions.
    Demoted,
    /// Unhealthy with an elapsed cooldown: the caller holds the pair's
    /// single probe slot and must report the probe's outcome.
    Probe(ProbePermit),
    /// Unhealthy: use only as fallback of last resort.
    Blocked,
}

impl PartitionHealthTracker {
    /// Creates an empty tracker.
    pub fn new(config: HealthTrackerConfig) -> Self {
        PartitionHealthTracker {
            inner: Arc::new(TrackerInner {
                entries: DashMap::new(),
                config,
            }),
        }
    }

    /// Records a successful request against the pair.
    pub fn record_success(
        &self,
        partition: &PartitionKeyRange,
        region: &str,
        operation: OperationKind,
    ) {
        let key = self.key(partition, region);
        let mut entry = self
            .inner
            .entries
            .entry(key)
            .or_insert_with(|| HealthInfo::new(&self.inner.config));
        if let Some(transition) = entry.record_success(operation) {
            info!(
                "Partition {} in region {:?}: {:?} -> {:?} after a successful {:?}",
                partition, region, transition.from, transition.to, operation
            );
        }
    }

    /// Records a failed request against the pair.
    ///
    /// Callers are expected to pre-filter: only failures that signal
    /// region-level trouble belong here (see
    /// [`FailureClass::is_region_signal`](crate::errors::FailureClass::is_region_signal)).
    pub fn record_failure(
        &self,
        partition: &PartitionKeyRange,
        region: &str,
        operation: OperationKind,
    ) {
        let key = self.key(partition, region);
        let mut entry = self
            .inner
            .entries
            .entry(key)
            .or_insert_with(|| HealthInfo::new(&self.inner.config));
        if let Some(transition) =
            entry.record_failure(operation, Instant::now(), &self.inner.config)
        {
            warn!(
                "Partition {} in region {:?}: {:?} -> {:?} after repeated {:?} failures",
                partition, region, transition.from, transition.to, operation
            );
        }
    }

    /// Whether the pair is usable for a new request, and in which role.
    ///
    /// For an Unhealthy pair whose cooldown has elapsed this acquires the
    /// probe slot: the returned [ProbePermit] must be reported or dropped.
    pub fn availability(&self, partition: &PartitionKeyRange, region: &str) -> RegionAvailability {
        let key = self.key(partition, region);
        let Some(mut entry) = self.inner.entries.get_mut(&key) else {
            // Never-seen pairs are healthy by definition.
            return RegionAvailability::Available;
        };
        let verdict = entry.availability(Instant::now());
        drop(entry);

        match verdict {
            Availability::Preferred => RegionAvailability::Available,
            Availability::Demoted => RegionAvailability::Demoted,
            Availability::Blocked => RegionAvailability::Blocked,
            Availability::ProbeAcquired => {
                debug!(
                    "Granting recovery probe for partition {} in region {:?}",
                    partition, region
                );
                RegionAvailability::Probe(ProbePermit {
                    inner: Arc::clone(&self.inner),
                    key,
                    completed: false,
                })
            }
        }
    }

    /// Current status of the pair. Pairs with no recorded outcome are
    /// Healthy.
    pub fn status(&self, partition: &PartitionKeyRange, region: &str) -> HealthStatus {
        self.inner
            .entries
            .get(&self.key(partition, region))
            .map(|entry| entry.status())
            .unwrap_or(HealthStatus::Healthy)
    }

    fn key(&self, partition: &PartitionKeyRange, region: &str) -> HealthKey {
        HealthKey {
            partition: partition.clone(),
            region: Arc::from(region),
        }
    }
}

/// Exclusive permission to send one recovery probe to an Unhealthy pair.
///
/// Report the probe's outcome with [succeeded](Self::succeeded) or
/// [failed](Self::failed). Dropping the permit unreported releases the
/// slot without penalty, so a cancelled or abandoned probing request can
/// never leak the slot into a permanently "in flight" state.
#[derive(Debug)]
pub struct ProbePermit {
    inner: Arc<TrackerInner>,
    key: HealthKey,
    completed: bool,
}

impl ProbePermit {
    /// The probe came back fine: the pair resets fully to Healthy.
    pub fn succeeded(mut self) {
        self.complete(true);
    }

    /// The probe failed: the pair stays Unhealthy and its cooldown
    /// restarts, doubled up to the configured maximum.
    pub fn failed(mut self) {
        self.complete(false);
    }

    fn complete(&mut self, success: bool) {
        self.completed = true;
        let Some(mut entry) = self.inner.entries.get_mut(&self.key) else {
            return;
        };
        match entry.complete_probe(success, Instant::now(), &self.inner.config) {
            Some(transition) => info!(
                "Partition {} in region {:?}: {:?} -> {:?} after a successful probe",
                self.key.partition, self.key.region, transition.from, transition.to
            ),
            None if !success => debug!(
                "Probe failed for partition {} in region {:?}; cooldown restarted",
                self.key.partition, self.key.region
            ),
            None => {}
        }
    }
}

impl Drop for ProbePermit {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(mut entry) = self.inner.entries.get_mut(&self.key) {
            entry.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::test_utils::setup_tracing;

    fn tracker(initial_cooldown: Duration) -> PartitionHealthTracker {
        // min_samples_for_failure_rate of 1 makes a single failure trip the
        // breaker all the way to Unhealthy (rate 100% over one sample).
        PartitionHealthTracker::new(HealthTrackerConfig {
            min_samples_for_failure_rate: 1,
            initial_cooldown,
            ..HealthTrackerConfig::default()
        })
    }

    fn partition() -> PartitionKeyRange {
        PartitionKeyRange::new("coll", "0")
    }

    #[test]
    fn unknown_pairs_are_healthy() {
        setup_tracing();
        let tracker = tracker(Duration::from_secs(60));
        assert_eq!(
            tracker.status(&partition(), "East US"),
            HealthStatus::Healthy
        );
        assert_matches!(
            tracker.availability(&partition(), "East US"),
            RegionAvailability::Available
        );
    }

    #[test]
    fn tripped_pair_is_blocked_until_cooldown() {
        setup_tracing();
        let tracker = tracker(Duration::from_secs(60));
        tracker.record_failure(&partition(), "East US", OperationKind::Write);

        assert_eq!(
            tracker.status(&partition(), "East US"),
            HealthStatus::Unhealthy
        );
        assert_matches!(
            tracker.availability(&partition(), "East US"),
            RegionAvailability::Blocked
        );
        // Other regions and partitions are unaffected.
        assert_matches!(
            tracker.availability(&partition(), "West US"),
            RegionAvailability::Available
        );
        assert_matches!(
            tracker.availability(&PartitionKeyRange::new("coll", "1"), "East US"),
            RegionAvailability::Available
        );
    }

    #[test]
    #[ntest::timeout(10_000)]
    fn exactly_one_concurrent_caller_gets_the_probe() {
        setup_tracing();
        let tracker = tracker(Duration::ZERO);
        tracker.record_failure(&partition(), "East US", OperationKind::Write);

        const CALLERS: usize = 16;
        let barrier = Arc::new(Barrier::new(CALLERS));
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let tracker = tracker.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    tracker.availability(&partition(), "East US")
                })
            })
            .collect();

        // Keep the results (and thus any granted permit) alive until all
        // threads have finished, so a dropped permit cannot free the slot
        // for a later caller mid-test.
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let probes = results
            .iter()
            .filter(|r| matches!(r, RegionAvailability::Probe(_)))
            .count();
        assert_eq!(probes, 1);
    }

    #[test]
    fn dropped_permit_releases_the_slot() {
        setup_tracing();
        let tracker = tracker(Duration::ZERO);
        tracker.record_failure(&partition(), "East US", OperationKind::Write);

        let first = tracker.availability(&partition(), "East US");
        assert_matches!(first, RegionAvailability::Probe(_));
        drop(first);

        assert_matches!(
            tracker.availability(&partition(), "East US"),
            RegionAvailability::Probe(_)
        );
        assert_eq!(
            tracker.status(&partition(), "East US"),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn successful_probe_restores_the_pair() {
        setup_tracing();
        let tracker = tracker(Duration::ZERO);
        tracker.record_failure(&partition(), "East US", OperationKind::Write);

        let RegionAvailability::Probe(permit) = tracker.availability(&partition(), "East US")
        else {
            panic!("expected a probe grant");
        };
        permit.succeeded();

        assert_eq!(
            tracker.status(&partition(), "East US"),
            HealthStatus::Healthy
        );
        assert_matches!(
            tracker.availability(&partition(), "East US"),
            RegionAvailability::Available
        );
    }

    #[test]
    fn failed_probe_restarts_the_cooldown() {
        setup_tracing();
        let tracker = tracker(Duration::from_millis(30));
        tracker.record_failure(&partition(), "East US", OperationKind::Write);

        assert_matches!(
            tracker.availability(&partition(), "East US"),
            RegionAvailability::Blocked
        );
        std::thread::sleep(Duration::from_millis(40));

        let RegionAvailability::Probe(permit) = tracker.availability(&partition(), "East US")
        else {
            panic!("expected a probe grant");
        };
        permit.failed();

        // Cooldown restarted (and doubled): no probe right away.
        assert_matches!(
            tracker.availability(&partition(), "East US"),
            RegionAvailability::Blocked
        );
        std::thread::sleep(Duration::from_millis(80));
        assert_matches!(
            tracker.availability(&partition(), "East US"),
            RegionAvailability::Probe(_)
        );
    }
}

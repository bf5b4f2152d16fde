//! The global endpoint manager: the request dispatcher's sole entry point.
//!
//! Combines the location cache's preference order with partition health
//! into per-request candidate plans, routes transport outcomes back into
//! the health tracker, and keeps the account topology fresh through a
//! background worker. One manager is owned by one client instance; there
//! is no process-wide state, so independent clients in one process have
//! fully isolated health tracking.

use std::sync::Arc;

use futures::future::RemoteHandle;
use futures::FutureExt;
use smallvec::SmallVec;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use url::Url;

use crate::config::{HealthTrackerConfig, RefreshConfig, RoutingConfig};
use crate::errors::{FailureClass, TopologyError};
use crate::health::{PartitionHealthTracker, ProbePermit, RegionAvailability};
use crate::routing::{OperationKind, PartitionKeyRange, RoutingRequest};
use crate::topology::{AccountFetcher, LocationCache, RegionalEndpoint};

mod worker;

use worker::{RefreshRequest, TopologyWorker};

/// A single candidate target within an [EndpointPlan].
#[derive(Debug)]
pub struct EndpointCandidate {
    endpoint: Arc<RegionalEndpoint>,
    probe: Option<ProbePermit>,
}

impl EndpointCandidate {
    /// Base URL to send the attempt to.
    pub fn url(&self) -> &Url {
        self.endpoint.url()
    }

    /// Region of the candidate; `None` for the account default endpoint.
    pub fn region(&self) -> Option<&str> {
        self.endpoint.region()
    }

    /// Whether an attempt against this candidate is the pair's recovery
    /// probe.
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    /// Takes the probe permit, transferring the duty to report the probe's
    /// outcome to the caller.
    pub fn take_probe(&mut self) -> Option<ProbePermit> {
        self.probe.take()
    }
}

/// Ordered candidate endpoints for one request.
///
/// Never empty: the account default endpoint is always present as the
/// final fallback, even when every region is currently Unhealthy. The
/// dispatcher walks the plan front to back, consulting its retry policy
/// between attempts.
#[derive(Debug, Default)]
pub struct EndpointPlan {
    candidates: SmallVec<[EndpointCandidate; 4]>,
}

impl EndpointPlan {
    /// Number of candidates in the plan.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Always `false`; present for iterator-style completeness.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// The most preferred candidate.
    pub fn first(&self) -> &EndpointCandidate {
        &self.candidates[0]
    }

    /// Iterates over the candidates in preference order.
    pub fn iter(&self) -> std::slice::Iter<'_, EndpointCandidate> {
        self.candidates.iter()
    }

    /// Candidate URLs in preference order.
    pub fn urls(&self) -> impl Iterator<Item = &Url> {
        self.candidates.iter().map(EndpointCandidate::url)
    }
}

impl IntoIterator for EndpointPlan {
    type Item = EndpointCandidate;
    type IntoIter = smallvec::IntoIter<[EndpointCandidate; 4]>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.into_iter()
    }
}

impl<'a> IntoIterator for &'a EndpointPlan {
    type Item = &'a EndpointCandidate;
    type IntoIter = std::slice::Iter<'a, EndpointCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.iter()
    }
}

/// Health-aware regional endpoint resolution for one database client.
///
/// All routing state lives behind this facade: the topology snapshot
/// (refreshed in the background), per-endpoint unavailability marks, and
/// the per-(partition, region) circuit breaker.
pub struct GlobalEndpointManager {
    cache: Arc<LocationCache>,
    health: PartitionHealthTracker,
    refresh_channel: mpsc::Sender<RefreshRequest>,
    _worker_handle: RemoteHandle<()>,
}

impl std::fmt::Debug for GlobalEndpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalEndpointManager")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl GlobalEndpointManager {
    /// Creates a manager and starts its background refresh worker.
    ///
    /// Performs an initial topology fetch. An initial fetch failure is not
    /// fatal: the manager starts with the default endpoint only and the
    /// worker keeps retrying.
    pub async fn new(
        fetcher: Arc<dyn AccountFetcher>,
        default_endpoint: Url,
        routing: RoutingConfig,
        health: HealthTrackerConfig,
        refresh: RefreshConfig,
    ) -> Self {
        let cache = Arc::new(LocationCache::new(default_endpoint, routing));
        match fetcher.fetch_account().await {
            Ok(account) => cache.update(&account),
            Err(err) => warn!(
                "Initial account topology fetch failed; starting with the default endpoint only: {}",
                err
            ),
        }

        let (refresh_sender, refresh_receiver) = mpsc::channel(32);
        let worker = TopologyWorker {
            cache: Arc::clone(&cache),
            fetcher,
            refresh_channel: refresh_receiver,
            config: refresh,
        };
        let (fut, worker_handle) = worker.work().remote_handle();
        tokio::spawn(fut);

        GlobalEndpointManager {
            cache,
            health: PartitionHealthTracker::new(health),
            refresh_channel: refresh_sender,
            _worker_handle: worker_handle,
        }
    }

    /// Ordered candidate endpoints for `request`.
    ///
    /// Starts from the location cache's preference order and reorders by
    /// the request's partition health: suspect pairs go behind available
    /// ones, tripped pairs go to the tail as fallback of last resort, and
    /// a tripped pair whose cooldown has elapsed rejoins at its natural
    /// position carrying the probe permit.
    pub fn resolve(&self, request: &RoutingRequest) -> EndpointPlan {
        let ordered = match request.operation {
            OperationKind::Write => self.cache.ordered_write_endpoints(),
            OperationKind::Read => self.cache.ordered_read_endpoints(),
        };

        let mut preferred: SmallVec<[EndpointCandidate; 4]> = SmallVec::new();
        let mut demoted: SmallVec<[EndpointCandidate; 4]> = SmallVec::new();
        let mut blocked: SmallVec<[EndpointCandidate; 4]> = SmallVec::new();

        for endpoint in ordered {
            let availability = match (&request.partition, endpoint.region()) {
                (Some(partition), Some(region)) => self.health.availability(partition, region),
                // Partition-less requests and the default endpoint skip
                // partition health.
                _ => RegionAvailability::Available,
            };
            let (bucket, probe) = match availability {
                RegionAvailability::Available => (&mut preferred, None),
                RegionAvailability::Probe(permit) => (&mut preferred, Some(permit)),
                RegionAvailability::Demoted => (&mut demoted, None),
                RegionAvailability::Blocked => (&mut blocked, None),
            };
            bucket.push(EndpointCandidate { endpoint, probe });
        }

        if request.is_cross_region_retry && preferred.len() > 1 {
            // The head was just tried and failed; let the retry land
            // elsewhere while keeping the head as a later fallback.
            preferred.rotate_left(1);
        }

        let mut candidates = preferred;
        candidates.extend(demoted);
        candidates.extend(blocked);

        let default = self.cache.default_endpoint();
        if !candidates
            .iter()
            .any(|candidate| candidate.url() == default.url())
        {
            candidates.push(EndpointCandidate {
                endpoint: default,
                probe: None,
            });
        }

        EndpointPlan { candidates }
    }

    /// Single highest-preference write endpoint.
    pub fn write_endpoint(&self) -> Arc<RegionalEndpoint> {
        self.cache.write_endpoint()
    }

    /// Single highest-preference read endpoint.
    pub fn read_endpoint(&self) -> Arc<RegionalEndpoint> {
        self.cache.read_endpoint()
    }

    /// Records a successful attempt against `endpoint`.
    ///
    /// Probe outcomes are reported through the [ProbePermit] taken from the
    /// candidate instead.
    pub fn report_success(
        &self,
        endpoint: &Url,
        partition: &PartitionKeyRange,
        operation: OperationKind,
    ) {
        if let Some(region) = self.cache.region_of(endpoint) {
            self.health.record_success(partition, &region, operation);
        }
    }

    /// Records a failed attempt against `endpoint`.
    ///
    /// Only failures that signal region-level trouble count against the
    /// pair's health; application errors leave the breaker untouched.
    pub fn report_failure(
        &self,
        endpoint: &Url,
        partition: &PartitionKeyRange,
        operation: OperationKind,
        failure: FailureClass,
    ) {
        if !failure.is_region_signal() {
            return;
        }
        if let Some(region) = self.cache.region_of(endpoint) {
            self.health.record_failure(partition, &region, operation);
        }
    }

    /// Explicit caller-driven signal that `endpoint` failed a read at the
    /// transport level; demotes it in read preference until the mark
    /// expires.
    pub fn mark_endpoint_unavailable_for_read(&self, endpoint: &Url) {
        self.cache.mark_endpoint_unavailable_for_read(endpoint);
    }

    /// Explicit caller-driven signal that `endpoint` failed a write at the
    /// transport level; demotes it in write preference until the mark
    /// expires.
    pub fn mark_endpoint_unavailable_for_write(&self, endpoint: &Url) {
        self.cache.mark_endpoint_unavailable_for_write(endpoint);
    }

    /// Re-fetches the account topology.
    ///
    /// Unforced refreshes arriving shortly after the previous one are
    /// coalesced into a no-op; `force` always fetches.
    pub async fn refresh_endpoint_list(&self, force: bool) -> Result<(), TopologyError> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.refresh_channel
            .send(RefreshRequest {
                force,
                response_chan: response_sender,
            })
            .await
            .expect("Bug in GlobalEndpointManager::refresh_endpoint_list sending");
        // Other end of this channel is in TopologyWorker, can't be dropped while we have &self with _worker_handle

        response_receiver
            .await
            .expect("Bug in GlobalEndpointManager::refresh_endpoint_list receiving")
        // TopologyWorker always responds
    }

    /// Reacts to a write-forbidden response from `endpoint`: the account's
    /// writable region has moved. Demotes the endpoint for writes and
    /// forces a topology refresh so the next resolution targets the new
    /// write region.
    pub async fn handle_write_forbidden(&self, endpoint: &Url) -> Result<(), TopologyError> {
        debug!(
            "Write forbidden against {}; forcing a topology refresh",
            endpoint
        );
        self.cache.mark_endpoint_unavailable_for_write(endpoint);
        self.refresh_endpoint_list(true).await
    }

    /// The partition health tracker backing this manager.
    pub fn partition_health(&self) -> &PartitionHealthTracker {
        &self.health
    }

    /// The location cache backing this manager.
    pub fn location_cache(&self) -> &LocationCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::errors::FetchError;
    use crate::health::HealthStatus;
    use crate::test_utils::setup_tracing;
    use crate::topology::account::{DatabaseAccount, Region};

    #[derive(Debug, Default)]
    struct MockFetcher {
        account: Mutex<Option<DatabaseAccount>>,
        fetches: AtomicUsize,
    }

    impl MockFetcher {
        fn serving(account: DatabaseAccount) -> Arc<Self> {
            Arc::new(MockFetcher {
                account: Mutex::new(Some(account)),
                fetches: AtomicUsize::new(0),
            })
        }

        fn set_account(&self, account: Option<DatabaseAccount>) {
            *self.account.lock().unwrap() = account;
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AccountFetcher for MockFetcher {
        async fn fetch_account(&self) -> Result<DatabaseAccount, TopologyError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match self.account.lock().unwrap().clone() {
                Some(account) => Ok(account),
                None => Err(FetchError::message("metadata endpoint unreachable").into()),
            }
        }
    }

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    fn region(name: &str) -> Region {
        let host = name.to_lowercase().replace(' ', "");
        Region::new(
            name,
            url(&format!("https://acct-{host}.documents.example.com/")),
        )
    }

    fn account(writable: &[&str], readable: &[&str]) -> DatabaseAccount {
        DatabaseAccount {
            writable_regions: writable.iter().map(|name| region(name)).collect(),
            readable_regions: readable.iter().map(|name| region(name)).collect(),
            enable_multiple_write_locations: writable.len() > 1,
        }
    }

    fn default_endpoint() -> Url {
        url("https://acct.documents.example.com/")
    }

    async fn manager_with(fetcher: Arc<MockFetcher>) -> GlobalEndpointManager {
        GlobalEndpointManager::new(
            fetcher,
            default_endpoint(),
            RoutingConfig {
                use_multiple_write_locations: true,
                ..RoutingConfig::default()
            },
            HealthTrackerConfig {
                min_samples_for_failure_rate: 5,
                ..HealthTrackerConfig::default()
            },
            RefreshConfig::default(),
        )
        .await
    }

    fn partition() -> PartitionKeyRange {
        PartitionKeyRange::new("coll", "0")
    }

    fn plan_regions(plan: &EndpointPlan) -> Vec<Option<&str>> {
        plan.iter().map(|candidate| candidate.region()).collect()
    }

    #[tokio::test]
    async fn plan_follows_preference_order_and_ends_with_the_default() {
        setup_tracing();
        let fetcher = MockFetcher::serving(account(&["A", "B", "C"], &["A", "B", "C"]));
        let manager = manager_with(fetcher).await;

        let plan = manager.resolve(&RoutingRequest::new(OperationKind::Write, partition()));
        assert_eq!(
            plan_regions(&plan),
            vec![Some("A"), Some("B"), Some("C"), None],
        );
        assert_eq!(plan.urls().last().unwrap(), &default_endpoint());
    }

    #[tokio::test]
    async fn tripped_region_moves_to_the_tail_but_stays() {
        setup_tracing();
        let fetcher = MockFetcher::serving(account(&["A", "B", "C"], &["A", "B", "C"]));
        let manager = manager_with(fetcher).await;
        let endpoint_a = region("A").endpoint().clone();

        // 5 consecutive write failures against A for this partition: with
        // ≥5 samples the failure rate is also breached, so the pair trips
        // all the way to Unhealthy.
        for _ in 0..5 {
            manager.report_failure(
                &endpoint_a,
                &partition(),
                OperationKind::Write,
                FailureClass::Unavailable,
            );
        }
        assert_eq!(
            manager.partition_health().status(&partition(), "A"),
            HealthStatus::Unhealthy
        );

        let plan = manager.resolve(&RoutingRequest::new(OperationKind::Write, partition()));
        assert_eq!(
            plan_regions(&plan),
            vec![Some("B"), Some("C"), Some("A"), None],
        );

        // Other partitions are unaffected.
        let other = PartitionKeyRange::new("coll", "1");
        let plan = manager.resolve(&RoutingRequest::new(OperationKind::Write, other));
        assert_eq!(
            plan_regions(&plan),
            vec![Some("A"), Some("B"), Some("C"), None],
        );
    }

    #[tokio::test]
    async fn application_errors_do_not_trip_the_breaker() {
        setup_tracing();
        let fetcher = MockFetcher::serving(account(&["A", "B"], &["A", "B"]));
        let manager = manager_with(fetcher).await;
        let endpoint_a = region("A").endpoint().clone();

        for _ in 0..20 {
            manager.report_failure(
                &endpoint_a,
                &partition(),
                OperationKind::Write,
                FailureClass::Application,
            );
        }
        assert_eq!(
            manager.partition_health().status(&partition(), "A"),
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn partitionless_requests_skip_partition_health() {
        setup_tracing();
        let fetcher = MockFetcher::serving(account(&["A", "B"], &["A", "B"]));
        let manager = manager_with(fetcher).await;
        let endpoint_a = region("A").endpoint().clone();

        for _ in 0..5 {
            manager.report_failure(
                &endpoint_a,
                &partition(),
                OperationKind::Write,
                FailureClass::Unavailable,
            );
        }

        let plan = manager.resolve(&RoutingRequest::without_partition(OperationKind::Write));
        assert_eq!(plan_regions(&plan), vec![Some("A"), Some("B"), None]);
    }

    #[tokio::test]
    async fn cross_region_retry_rotates_the_preferred_group() {
        setup_tracing();
        let fetcher = MockFetcher::serving(account(&["A", "B", "C"], &["A", "B", "C"]));
        let manager = manager_with(fetcher).await;

        let request = RoutingRequest::new(OperationKind::Read, partition()).cross_region_retry();
        let plan = manager.resolve(&request);
        assert_eq!(
            plan_regions(&plan),
            vec![Some("B"), Some("C"), Some("A"), None],
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unforced_refreshes_are_coalesced() {
        setup_tracing();
        let fetcher = MockFetcher::serving(account(&["A"], &["A"]));
        let manager = manager_with(Arc::clone(&fetcher)).await;
        assert_eq!(fetcher.fetch_count(), 1); // initial fetch

        manager.refresh_endpoint_list(false).await.unwrap();
        assert_eq!(fetcher.fetch_count(), 1); // coalesced

        manager.refresh_endpoint_list(true).await.unwrap();
        assert_eq!(fetcher.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn topology_refreshes_periodically() {
        setup_tracing();
        let fetcher = MockFetcher::serving(account(&["A"], &["A"]));
        let manager = manager_with(Arc::clone(&fetcher)).await;
        let initial = fetcher.fetch_count();

        // Sleeping on the paused clock auto-advances through the worker's
        // periodic timer.
        tokio::time::sleep(RefreshConfig::default().refresh_interval * 2).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(fetcher.fetch_count() > initial);
        drop(manager);
    }

    #[tokio::test]
    async fn fetch_failure_keeps_the_last_known_topology() {
        setup_tracing();
        let fetcher = MockFetcher::serving(account(&["A", "B"], &["A", "B"]));
        let manager = manager_with(Arc::clone(&fetcher)).await;
        assert_eq!(manager.write_endpoint().region(), Some("A"));

        fetcher.set_account(None);
        let refreshed = manager.refresh_endpoint_list(true).await;
        assert!(refreshed.is_err());

        // Degraded but defined: the previous topology stays in effect.
        assert_eq!(manager.write_endpoint().region(), Some("A"));
    }

    #[tokio::test]
    async fn write_forbidden_refreshes_and_reroutes_writes() {
        setup_tracing();
        let fetcher = MockFetcher::serving(account(&["A", "B"], &["A", "B"]));
        let manager = manager_with(Arc::clone(&fetcher)).await;
        let endpoint_a = region("A").endpoint().clone();
        assert_eq!(manager.write_endpoint().region(), Some("A"));

        // The service moved the writable region to B.
        fetcher.set_account(Some(account(&["B", "A"], &["A", "B"])));
        manager.handle_write_forbidden(&endpoint_a).await.unwrap();

        assert_eq!(manager.write_endpoint().region(), Some("B"));
    }
}

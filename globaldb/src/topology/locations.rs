//! Preference-ordered endpoint lists computed from account topology.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use arc_swap::ArcSwap;
use itertools::Itertools;
use tracing::{debug, warn};
use url::Url;

use crate::config::RoutingConfig;
use crate::routing::OperationKind;
use crate::topology::account::{DatabaseAccount, Region};

/// An endpoint as it appears in candidate lists: a base URL plus the region
/// it belongs to, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionalEndpoint {
    /// `None` for the account's default (global) endpoint.
    region: Option<Arc<str>>,
    endpoint: Url,
}

impl RegionalEndpoint {
    fn regional(region: Arc<str>, endpoint: Url) -> Self {
        RegionalEndpoint {
            region: Some(region),
            endpoint,
        }
    }

    fn account_default(endpoint: Url) -> Self {
        RegionalEndpoint {
            region: None,
            endpoint,
        }
    }

    /// Region this endpoint belongs to; `None` for the account default.
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Base URL of the endpoint.
    pub fn url(&self) -> &Url {
        &self.endpoint
    }
}

/// Immutable view of the current topology, replaced wholesale on refresh.
#[derive(Debug)]
struct LocationSnapshot {
    /// Write endpoints in preference order, before unavailability demotion.
    write_endpoints: Vec<Arc<RegionalEndpoint>>,
    /// Read endpoints in preference order, before unavailability demotion.
    read_endpoints: Vec<Arc<RegionalEndpoint>>,
    /// Reverse mapping used to attribute transport outcomes to a region.
    region_by_url: HashMap<Url, Arc<str>>,
}

#[derive(Debug, Clone, Copy)]
struct UnavailabilityMark {
    since: Instant,
    read: bool,
    write: bool,
}

impl UnavailabilityMark {
    fn applies_to(&self, operation: OperationKind) -> bool {
        match operation {
            OperationKind::Read => self.read,
            OperationKind::Write => self.write,
        }
    }
}

/// Maps account topology + user preference to ordered endpoint lists.
///
/// The topology snapshot is replaced atomically on [update](Self::update),
/// so concurrent readers never observe a half-updated list. Explicit
/// endpoint-unavailability marks are tracked separately and applied at
/// read time, lapsing after the configured expiry.
///
/// Partition-level health is *not* consulted here; the endpoint manager
/// layers that on top of the preference order this cache computes.
#[derive(Debug)]
pub struct LocationCache {
    config: RoutingConfig,
    default_endpoint: Arc<RegionalEndpoint>,
    snapshot: ArcSwap<LocationSnapshot>,
    unavailable: Mutex<HashMap<Url, UnavailabilityMark>>,
}

impl LocationCache {
    /// Creates a cache that resolves everything to `default_endpoint` until
    /// the first topology update arrives.
    pub fn new(default_endpoint: Url, config: RoutingConfig) -> Self {
        let default_endpoint = Arc::new(RegionalEndpoint::account_default(default_endpoint));
        let initial = LocationSnapshot {
            write_endpoints: vec![Arc::clone(&default_endpoint)],
            read_endpoints: vec![Arc::clone(&default_endpoint)],
            region_by_url: HashMap::new(),
        };
        LocationCache {
            config,
            default_endpoint,
            snapshot: ArcSwap::from_pointee(initial),
            unavailable: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the topology snapshot with one computed from `account`.
    ///
    /// An empty writable or readable list falls back to the account default
    /// endpoint for that operation class: degraded but defined, never an
    /// error.
    pub fn update(&self, account: &DatabaseAccount) {
        // Multi-region writes require both the client opting in and the
        // account being configured for them.
        let multiple_writes = self.config.use_multiple_write_locations
            && account.enable_multiple_write_locations;
        let write_regions: &[Region] = if multiple_writes || account.writable_regions.is_empty() {
            &account.writable_regions
        } else {
            // Single-write accounts only ever write to the first
            // writable region.
            &account.writable_regions[..1]
        };

        let write_endpoints = self.ordered_by_preference(write_regions, multiple_writes);
        let read_endpoints = self.ordered_by_preference(&account.readable_regions, true);

        if account.writable_regions.is_empty() {
            warn!("Account topology reports no writable regions; falling back to the default endpoint for writes");
        }
        if account.readable_regions.is_empty() {
            warn!("Account topology reports no readable regions; falling back to the default endpoint for reads");
        }

        let region_by_url = account
            .writable_regions
            .iter()
            .chain(account.readable_regions.iter())
            .map(|region| (region.endpoint().clone(), Arc::<str>::from(region.name())))
            .collect();

        debug!(
            "Topology updated: write endpoints {:?}, read endpoints {:?}",
            write_endpoints
                .iter()
                .filter_map(|e| e.region())
                .collect::<Vec<_>>(),
            read_endpoints
                .iter()
                .filter_map(|e| e.region())
                .collect::<Vec<_>>(),
        );

        self.snapshot.store(Arc::new(LocationSnapshot {
            write_endpoints,
            read_endpoints,
            region_by_url,
        }));
    }

    /// Single highest-preference write endpoint.
    pub fn write_endpoint(&self) -> Arc<RegionalEndpoint> {
        self.ordered_write_endpoints()
            .into_iter()
            .next()
            .unwrap_or_else(|| Arc::clone(&self.default_endpoint))
    }

    /// Single highest-preference read endpoint.
    pub fn read_endpoint(&self) -> Arc<RegionalEndpoint> {
        self.ordered_read_endpoints()
            .into_iter()
            .next()
            .unwrap_or_else(|| Arc::clone(&self.default_endpoint))
    }

    /// Full preference-ordered write endpoint list. Never empty.
    pub fn ordered_write_endpoints(&self) -> Vec<Arc<RegionalEndpoint>> {
        if !self.config.enable_endpoint_discovery {
            return vec![Arc::clone(&self.default_endpoint)];
        }
        let snapshot = self.snapshot.load();
        self.demote_unavailable(&snapshot.write_endpoints, OperationKind::Write)
    }

    /// Full preference-ordered read endpoint list. Never empty.
    pub fn ordered_read_endpoints(&self) -> Vec<Arc<RegionalEndpoint>> {
        if !self.config.enable_endpoint_discovery {
            return vec![Arc::clone(&self.default_endpoint)];
        }
        let snapshot = self.snapshot.load();
        self.demote_unavailable(&snapshot.read_endpoints, OperationKind::Read)
    }

    /// Records that `endpoint` failed a read at the transport level.
    /// It is demoted in read preference until the mark expires.
    pub fn mark_endpoint_unavailable_for_read(&self, endpoint: &Url) {
        self.mark_endpoint_unavailable(endpoint, OperationKind::Read);
    }

    /// Records that `endpoint` failed a write at the transport level.
    /// It is demoted in write preference until the mark expires.
    pub fn mark_endpoint_unavailable_for_write(&self, endpoint: &Url) {
        self.mark_endpoint_unavailable(endpoint, OperationKind::Write);
    }

    /// Region that `endpoint` belongs to in the current topology.
    pub fn region_of(&self, endpoint: &Url) -> Option<Arc<str>> {
        self.snapshot.load().region_by_url.get(endpoint).cloned()
    }

    /// The account default endpoint, used as the fallback of last resort.
    pub fn default_endpoint(&self) -> Arc<RegionalEndpoint> {
        Arc::clone(&self.default_endpoint)
    }

    fn mark_endpoint_unavailable(&self, endpoint: &Url, operation: OperationKind) {
        debug!(
            "Marking endpoint {} unavailable for {:?} operations",
            endpoint, operation
        );
        let mut marks = self.unavailable.lock().unwrap();
        let mark = marks.entry(endpoint.clone()).or_insert(UnavailabilityMark {
            since: Instant::now(),
            read: false,
            write: false,
        });
        mark.since = Instant::now();
        match operation {
            OperationKind::Read => mark.read = true,
            OperationKind::Write => mark.write = true,
        }
    }

    /// Preference order: user-preferred regions first (in the user's
    /// order, matched case-insensitively), then the remaining regions in
    /// account order. Regions are reordered, never dropped, so every
    /// replica stays reachable as a fallback of last resort.
    fn ordered_by_preference(
        &self,
        regions: &[Region],
        apply_preferences: bool,
    ) -> Vec<Arc<RegionalEndpoint>> {
        if regions.is_empty() {
            return vec![Arc::clone(&self.default_endpoint)];
        }

        let to_endpoint = |region: &Region| {
            Arc::new(RegionalEndpoint::regional(
                Arc::from(region.name()),
                region.endpoint().clone(),
            ))
        };

        let ordered: Vec<Arc<RegionalEndpoint>> =
            if apply_preferences && !self.config.preferred_locations.is_empty() {
                let preferred = self.config.preferred_locations.iter().flat_map(|name| {
                    regions
                        .iter()
                        .filter(move |region| region.name().eq_ignore_ascii_case(name))
                });
                let rest = regions.iter().filter(|region| {
                    !self
                        .config
                        .preferred_locations
                        .iter()
                        .any(|name| region.name().eq_ignore_ascii_case(name))
                });
                preferred.chain(rest).map(to_endpoint).collect()
            } else {
                regions.iter().map(to_endpoint).collect()
            };

        ordered
            .into_iter()
            .unique_by(|endpoint| endpoint.url().clone())
            .collect()
    }

    /// Partitions `ordered` into endpoints without an active unavailability
    /// mark followed by marked ones. Expired marks are dropped here, so a
    /// mark lapses the first time anyone looks after its expiry.
    fn demote_unavailable(
        &self,
        ordered: &[Arc<RegionalEndpoint>],
        operation: OperationKind,
    ) -> Vec<Arc<RegionalEndpoint>> {
        let mut marks = self.unavailable.lock().unwrap();
        marks.retain(|_, mark| mark.since.elapsed() < self.config.endpoint_unavailability_expiry);
        if marks.is_empty() {
            return ordered.to_vec();
        }

        let (available, marked): (Vec<_>, Vec<_>) = ordered.iter().cloned().partition(|endpoint| {
            marks
                .get(endpoint.url())
                .is_none_or(|mark| !mark.applies_to(operation))
        });
        available.into_iter().chain(marked).collect()
    }
}

/// Derives the region-scoped endpoint from an account base endpoint, e.g.
/// `https://acct.documents.example.com` + "East US" →
/// `https://acct-eastus.documents.example.com`.
///
/// Pure and idempotent: applying it to its own output is a no-op, and the
/// host comes out lower-cased regardless of input casing (URL host
/// normalization). Returns the base unchanged when it has no host or the
/// derived host is not a valid host name.
pub fn locational_endpoint(base: &Url, region: &str) -> Url {
    let Some(host) = base.host_str() else {
        return base.clone();
    };

    let suffix: String = region
        .split_whitespace()
        .collect::<String>()
        .to_lowercase();
    if suffix.is_empty() {
        return base.clone();
    }

    let (account, domain) = match host.split_once('.') {
        Some((account, domain)) => (account, Some(domain)),
        None => (host, None),
    };

    // Hosts are already normalized to lowercase by the URL parser, so a
    // plain suffix check suffices for idempotence.
    if account.ends_with(&format!("-{suffix}")) {
        return base.clone();
    }

    let locational_host = match domain {
        Some(domain) => format!("{account}-{suffix}.{domain}"),
        None => format!("{account}-{suffix}"),
    };

    let mut url = base.clone();
    match url.set_host(Some(&locational_host)) {
        Ok(()) => url,
        Err(err) => {
            warn!(
                "Cannot derive locational endpoint for region {:?} from {}: {}",
                region, base, err
            );
            base.clone()
        }
    }
}

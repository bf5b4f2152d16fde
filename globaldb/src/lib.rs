//! Health-aware regional endpoint routing for multi-region document store
//! clients.
//!
//! For a database account replicated across several regions, this crate
//! decides, per request, which regional endpoint to target; tracks
//! per-(partition, region) health across regions; and fails over and
//! recovers automatically under sustained errors. It sits between a
//! client's request dispatcher and its network transport: the transport,
//! serialization and authentication all stay outside.
//!
//! # Overview
//! All activity revolves around the [GlobalEndpointManager]. It is owned by
//! one client instance and combines:
//! * a [LocationCache](topology::LocationCache) translating account
//!   topology + user preference into ordered endpoint lists,
//! * a [PartitionHealthTracker](health::PartitionHealthTracker)
//!   implementing the partition-level circuit breaker,
//! * a background worker keeping the topology fresh.
//!
//! The dispatcher resolves a plan, walks its candidates, and reports every
//! outcome back:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use globaldb::errors::TopologyError;
//! use globaldb::topology::{AccountFetcher, DatabaseAccount};
//! use globaldb::{
//!     GlobalEndpointManager, HealthTrackerConfig, OperationKind, PartitionKeyRange,
//!     RefreshConfig, RoutingConfig, RoutingRequest,
//! };
//!
//! struct MetadataEndpointFetcher;
//!
//! #[async_trait]
//! impl AccountFetcher for MetadataEndpointFetcher {
//!     async fn fetch_account(&self) -> Result<DatabaseAccount, TopologyError> {
//!         // Issue a GET against the account metadata endpoint here and
//!         // parse the response with `DatabaseAccount::from_json`.
//!         # unimplemented!()
//!     }
//! }
//!
//! # async fn example() {
//! let manager = GlobalEndpointManager::new(
//!     Arc::new(MetadataEndpointFetcher),
//!     "https://acct.documents.example.com/".parse().unwrap(),
//!     RoutingConfig::default(),
//!     HealthTrackerConfig::from_env(),
//!     RefreshConfig::default(),
//! )
//! .await;
//!
//! let partition = PartitionKeyRange::new("collection-rid", "0");
//! let request = RoutingRequest::new(OperationKind::Write, partition.clone());
//! for candidate in &manager.resolve(&request) {
//!     // Send the request to candidate.url(), then report the outcome via
//!     // `manager.report_success` / `manager.report_failure` (or through
//!     // the probe permit, if `candidate.is_probe()`).
//! }
//! # }
//! ```
//!
//! The breaker is invisible to users of the client: there is always at
//! least the account default endpoint to target, and no new user-facing
//! error type is ever produced here.

pub mod config;
pub mod errors;
pub mod health;
pub mod manager;
pub mod policies;
pub mod routing;
pub mod topology;

pub use config::{HealthTrackerConfig, RefreshConfig, RoutingConfig};
pub use health::{HealthStatus, PartitionHealthTracker, ProbePermit, RegionAvailability};
pub use manager::{EndpointCandidate, EndpointPlan, GlobalEndpointManager};
pub use policies::{DefaultRetryPolicy, RetryDecision, RetryPolicy, RetrySession};
pub use routing::{OperationKind, PartitionKeyRange, RoutingRequest};
pub use topology::{DatabaseAccount, LocationCache, Region, RegionalEndpoint};

#[cfg(test)]
pub(crate) mod test_utils;

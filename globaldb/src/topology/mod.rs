//! Account topology: which regions exist, where their endpoints are, and
//! in what order a request should prefer them.
//!
//! This includes:
//! - topology metadata as reported by the account metadata endpoint
//!   ([Region], [DatabaseAccount]),
//! - the fetching seam ([AccountFetcher]) behind which the actual transport
//!   lives,
//! - [LocationCache], which turns topology + user preference into ordered
//!   endpoint lists. Its snapshot is replaced atomically on refresh,
//!   preventing any issues arising from mutability, including races.

pub mod account;
pub mod locations;

pub use account::{AccountFetcher, DatabaseAccount, Region};
pub use locations::{locational_endpoint, LocationCache, RegionalEndpoint};

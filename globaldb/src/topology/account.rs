//! Account topology metadata and its wire representation.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::errors::TopologyError;

/// A named replica location of the database account.
///
/// Immutable once constructed; the whole topology is replaced wholesale on
/// refresh rather than patched in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    name: String,
    endpoint: Url,
}

impl Region {
    /// Creates a region from its logical name (e.g. "West US 3") and its
    /// base endpoint URL.
    pub fn new(name: impl Into<String>, endpoint: Url) -> Self {
        Region {
            name: name.into(),
            endpoint,
        }
    }

    /// Logical region name as reported by the service.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base URL of the region's endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Topology of the database account as reported by its metadata endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseAccount {
    /// Regions accepting writes, in account preference order.
    pub writable_regions: Vec<Region>,
    /// Regions serving reads, in account preference order.
    pub readable_regions: Vec<Region>,
    /// Whether the account is configured for multi-region writes.
    pub enable_multiple_write_locations: bool,
}

impl DatabaseAccount {
    /// Parses the JSON document served by the account metadata endpoint.
    ///
    /// A location entry with an unparsable endpoint URL is skipped with a
    /// warning instead of failing the whole refresh; the remaining entries
    /// are still better than keeping a stale topology.
    pub fn from_json(raw: &str) -> Result<Self, TopologyError> {
        let wire: WireAccount = serde_json::from_str(raw)?;
        Ok(DatabaseAccount {
            writable_regions: parse_locations(wire.writable_locations, "writable"),
            readable_regions: parse_locations(wire.readable_locations, "readable"),
            enable_multiple_write_locations: wire.enable_multiple_write_locations,
        })
    }
}

/// Source of account topology metadata.
///
/// The network transport performing the fetch is outside this crate; tests
/// and embedders provide implementations. Fetch failures are non-fatal to
/// the manager: the previous topology stays in effect.
#[async_trait]
pub trait AccountFetcher: Send + Sync {
    /// Fetches the current account topology from the metadata endpoint.
    async fn fetch_account(&self) -> Result<DatabaseAccount, TopologyError>;
}

#[derive(Deserialize)]
struct WireAccount {
    #[serde(default, rename = "writableLocations")]
    writable_locations: Vec<WireLocation>,
    #[serde(default, rename = "readableLocations")]
    readable_locations: Vec<WireLocation>,
    #[serde(default, rename = "enableMultipleWriteLocations")]
    enable_multiple_write_locations: bool,
}

#[derive(Deserialize)]
struct WireLocation {
    name: String,
    #[serde(rename = "databaseAccountEndpoint")]
    database_account_endpoint: String,
}

fn parse_locations(locations: Vec<WireLocation>, kind: &str) -> Vec<Region> {
    locations
        .into_iter()
        .filter_map(|location| match Url::parse(&location.database_account_endpoint) {
            Ok(endpoint) => Some(Region::new(location.name, endpoint)),
            Err(err) => {
                warn!(
                    "Skipping {} location {:?} with invalid endpoint {:?}: {}",
                    kind, location.name, location.database_account_endpoint, err
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_account_metadata_document() {
        let raw = r#"{
            "writableLocations": [
                {"name": "West US 3", "databaseAccountEndpoint": "https://acct-westus3.documents.example.com:443/"}
            ],
            "readableLocations": [
                {"name": "West US 3", "databaseAccountEndpoint": "https://acct-westus3.documents.example.com:443/"},
                {"name": "East US", "databaseAccountEndpoint": "https://acct-eastus.documents.example.com:443/"}
            ],
            "enableMultipleWriteLocations": false
        }"#;

        let account = DatabaseAccount::from_json(raw).unwrap();
        assert_eq!(account.writable_regions.len(), 1);
        assert_eq!(account.writable_regions[0].name(), "West US 3");
        assert_eq!(
            account.readable_regions[1].endpoint().as_str(),
            "https://acct-eastus.documents.example.com/"
        );
        assert!(!account.enable_multiple_write_locations);
    }

    #[test]
    fn missing_location_arrays_mean_empty_topology() {
        let account = DatabaseAccount::from_json("{}").unwrap();
        assert!(account.writable_regions.is_empty());
        assert!(account.readable_regions.is_empty());
    }

    #[test]
    fn invalid_endpoint_entries_are_skipped() {
        let raw = r#"{
            "writableLocations": [
                {"name": "Broken", "databaseAccountEndpoint": "::not-a-url::"},
                {"name": "East US", "databaseAccountEndpoint": "https://acct-eastus.documents.example.com/"}
            ]
        }"#;

        let account = DatabaseAccount::from_json(raw).unwrap();
        assert_eq!(account.writable_regions.len(), 1);
        assert_eq!(account.writable_regions[0].name(), "East US");
    }

    #[test]
    fn malformed_document_is_a_parse_error() {
        assert!(matches!(
            DatabaseAccount::from_json("not json"),
            Err(TopologyError::Parse(_))
        ));
    }
}

//! Error types and failure classification.
//!
//! Failures reported by the transport layer fall into classes that the
//! health tracker treats very differently: a connection reset says
//! something about the region, a "document not found" says nothing at all.
//! Only region-signal failures may ever reach the circuit breaker.

use std::sync::Arc;

use thiserror::Error;

/// Substatus accompanying a 403 response when the targeted endpoint is not
/// the account's current writable region.
pub const SUBSTATUS_WRITE_FORBIDDEN: u32 = 3;

/// Error returned by an account metadata fetch.
///
/// The transport performing the fetch is outside this crate, so its errors
/// arrive type-erased. Cloneable, because refresh results are fanned out to
/// every caller waiting on the same refresh.
#[derive(Error, Debug, Clone)]
#[error(transparent)]
pub struct FetchError(Arc<dyn std::error::Error + Send + Sync>);

impl FetchError {
    /// Wraps an arbitrary transport error.
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        FetchError(Arc::new(err))
    }

    /// Creates a fetch error from a plain message.
    pub fn message(msg: impl Into<String>) -> Self {
        #[derive(Error, Debug)]
        #[error("{0}")]
        struct MessageError(String);

        FetchError(Arc::new(MessageError(msg.into())))
    }
}

/// Failed to obtain or interpret the account topology metadata.
///
/// Topology errors are non-fatal to request dispatch: the manager keeps
/// serving endpoints from the last known good topology (or the account
/// default endpoint if none was ever fetched) and retries on the next
/// refresh tick.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TopologyError {
    /// The account metadata document could not be retrieved.
    #[error("failed to fetch account metadata: {0}")]
    Fetch(#[from] FetchError),

    /// The account metadata document could not be deserialized.
    #[error("failed to parse account metadata: {0}")]
    Parse(Arc<serde_json::Error>),
}

impl From<serde_json::Error> for TopologyError {
    fn from(err: serde_json::Error) -> Self {
        TopologyError::Parse(Arc::new(err))
    }
}

/// Classification of a failed request attempt.
///
/// Only [`FailureClass::is_region_signal`] failures are recorded against
/// `(partition, region)` health; everything else must leave the circuit
/// breaker untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FailureClass {
    /// Transport-level failure: connection refused/reset, TLS failure,
    /// client-side timeout. Counts against region health.
    Transport,
    /// The service or an intermediary signalled regional trouble
    /// (408, 502, 503, 504). Counts against region health.
    Unavailable,
    /// 403 with [`SUBSTATUS_WRITE_FORBIDDEN`]: the targeted endpoint is not
    /// the writable region. Triggers a forced topology refresh instead of a
    /// health penalty.
    WriteForbidden,
    /// Any other application-level error (400, 404, 409, 412, ...).
    /// Says nothing about the region and is never recorded.
    Application,
}

impl FailureClass {
    /// Classifies an HTTP response status (+ optional substatus).
    pub fn from_status(status: u16, sub_status: Option<u32>) -> Self {
        match status {
            403 if sub_status == Some(SUBSTATUS_WRITE_FORBIDDEN) => FailureClass::WriteForbidden,
            408 | 502 | 503 | 504 => FailureClass::Unavailable,
            _ => FailureClass::Application,
        }
    }

    /// Whether this failure should count against `(partition, region)` health.
    pub fn is_region_signal(&self) -> bool {
        matches!(self, FailureClass::Transport | FailureClass::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_of_statuses() {
        assert_eq!(
            FailureClass::from_status(403, Some(SUBSTATUS_WRITE_FORBIDDEN)),
            FailureClass::WriteForbidden
        );
        // 403 without the substatus is an ordinary authorization failure.
        assert_eq!(
            FailureClass::from_status(403, None),
            FailureClass::Application
        );
        for status in [408, 502, 503, 504] {
            assert!(FailureClass::from_status(status, None).is_region_signal());
        }
        for status in [400, 404, 409, 412, 429, 500] {
            assert!(!FailureClass::from_status(status, None).is_region_signal());
        }
    }
}

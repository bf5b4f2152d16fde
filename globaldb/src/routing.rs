//! Request-scoped routing inputs: operation class and partition identity.

use std::fmt;
use std::sync::Arc;

/// Operation class of a request.
///
/// Reads and writes are tracked independently by the health machinery:
/// they have different retry and latency characteristics, so a run of read
/// failures never contributes to the write breaker and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Point reads, queries, feed reads.
    Read,
    /// Document and attachment mutations.
    Write,
}

/// Identity of a physical partition, scoped to its collection.
///
/// Health is tracked per `(partition, region)` pair, so this type is used
/// as part of a composite map key. Equality and hashing cover both
/// identifying fields; the `Arc<str>` internals make clones cheap enough
/// to put in every request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKeyRange {
    collection_rid: Arc<str>,
    range_id: Arc<str>,
}

impl PartitionKeyRange {
    /// Creates a partition identity from the collection resource id and the
    /// partition key range id.
    pub fn new(collection_rid: impl Into<Arc<str>>, range_id: impl Into<Arc<str>>) -> Self {
        PartitionKeyRange {
            collection_rid: collection_rid.into(),
            range_id: range_id.into(),
        }
    }

    /// Resource id of the owning collection.
    pub fn collection_rid(&self) -> &str {
        &self.collection_rid
    }

    /// Partition key range id within the collection.
    pub fn range_id(&self) -> &str {
        &self.range_id
    }
}

impl fmt::Display for PartitionKeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection_rid, self.range_id)
    }
}

/// What the dispatcher tells the manager about the request being routed.
#[derive(Debug, Clone)]
pub struct RoutingRequest {
    /// Operation class, selecting the write or read preference list.
    pub operation: OperationKind,

    /// Partition the request addresses. `None` for requests that are not
    /// partition-scoped (metadata reads); those skip partition-health
    /// reordering entirely.
    pub partition: Option<PartitionKeyRange>,

    /// Set when the dispatcher is retrying after a failure in the most
    /// preferred region; the head of the healthy preference group is
    /// rotated to its tail so the retry lands elsewhere.
    pub is_cross_region_retry: bool,
}

impl RoutingRequest {
    /// A partition-scoped request.
    pub fn new(operation: OperationKind, partition: PartitionKeyRange) -> Self {
        RoutingRequest {
            operation,
            partition: Some(partition),
            is_cross_region_retry: false,
        }
    }

    /// A request without partition scope (account or collection metadata).
    pub fn without_partition(operation: OperationKind) -> Self {
        RoutingRequest {
            operation,
            partition: None,
            is_cross_region_retry: false,
        }
    }

    /// Marks this request as a cross-region retry.
    pub fn cross_region_retry(mut self) -> Self {
        self.is_cross_region_retry = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn partition_identity_covers_both_fields() {
        let a = PartitionKeyRange::new("coll1", "0");
        let b = PartitionKeyRange::new("coll1", "0");
        let c = PartitionKeyRange::new("coll1", "1");
        let d = PartitionKeyRange::new("coll2", "0");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let set: HashSet<_> = [a, b, c, d].into_iter().collect();
        assert_eq!(set.len(), 3);
    }
}

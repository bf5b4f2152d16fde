//! Retry decisions for failed request attempts.
//!
//! The dispatcher owns the retry loop; a retry session only decides, per
//! failed attempt, whether trying again makes sense and against what. The
//! one failure class that involves the endpoint manager directly is
//! write-forbidden: the topology is stale and must be refreshed before the
//! retry, and only a single such retry is allowed per request to bound
//! latency.

use crate::errors::FailureClass;
use crate::routing::OperationKind;

/// Information about a failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptInfo {
    /// Classified failure of the attempt.
    pub failure: FailureClass,
    /// Operation class of the request.
    pub operation: OperationKind,
}

/// What the dispatcher should do with the request after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try the same endpoint again.
    RetrySameEndpoint,
    /// Move on to the next candidate in the plan. When `refresh_topology`
    /// is set, force a topology refresh and re-resolve the plan first.
    RetryNextEndpoint {
        /// Force a topology refresh before re-resolving.
        refresh_topology: bool,
    },
    /// Surface the error to the caller unchanged.
    DontRetry,
}

/// Creates a fresh decision session per request.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// Called for each new request; the session carries per-request retry
    /// bookkeeping.
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Used throughout a single request to decide about its retries.
pub trait RetrySession: Send + Sync {
    /// Called after a failed attempt.
    fn decide(&mut self, attempt: AttemptInfo) -> RetryDecision;

    /// Resets the session for reuse with a new request.
    fn reset(&mut self);
}

/// The default policy.
///
/// - Write-forbidden: force a topology refresh and retry once against the
///   newly resolved write endpoint; a second write-forbidden response is
///   surfaced as a hard error.
/// - Transient region trouble (transport errors, 408/502/503/504): try the
///   next candidate endpoint.
/// - Anything else is an application error and is never retried here.
#[derive(Debug, Clone, Default)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    /// Creates the default policy.
    pub fn new() -> Self {
        DefaultRetryPolicy
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DefaultRetrySession::default())
    }
}

#[derive(Debug, Default)]
struct DefaultRetrySession {
    write_forbidden_retried: bool,
}

impl RetrySession for DefaultRetrySession {
    fn decide(&mut self, attempt: AttemptInfo) -> RetryDecision {
        match attempt.failure {
            FailureClass::WriteForbidden => {
                if self.write_forbidden_retried {
                    RetryDecision::DontRetry
                } else {
                    self.write_forbidden_retried = true;
                    RetryDecision::RetryNextEndpoint {
                        refresh_topology: true,
                    }
                }
            }
            FailureClass::Transport | FailureClass::Unavailable => RetryDecision::RetryNextEndpoint {
                refresh_topology: false,
            },
            FailureClass::Application => RetryDecision::DontRetry,
        }
    }

    fn reset(&mut self) {
        *self = DefaultRetrySession::default();
    }
}

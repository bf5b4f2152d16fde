//! Policies deciding how the dispatcher reacts to failed attempts.

pub mod retry;

pub use retry::{AttemptInfo, DefaultRetryPolicy, RetryDecision, RetryPolicy, RetrySession};

//! Configuration supplied at client construction.
//!
//! Every knob has a default, so an empty configuration is always valid.
//! Health thresholds can additionally be overridden through `GLOBALDB_*`
//! environment variables (see [`HealthTrackerConfig::from_env`]), mirroring
//! how deployments tune the circuit breaker without code changes.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Controls how account topology translates into endpoint preference.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// When `false`, both read and write resolution always return the
    /// originally configured endpoint, regardless of topology. Checked
    /// before anything else in every resolution path.
    pub enable_endpoint_discovery: bool,

    /// User-preferred region names, most preferred first. Regions named
    /// here are moved to the front of the preference order; regions not
    /// named keep their account order behind them.
    pub preferred_locations: Vec<String>,

    /// When `false`, only the account's first writable region accepts
    /// writes and the ordered write list is restricted to it.
    pub use_multiple_write_locations: bool,

    /// How long an explicit endpoint-unavailability mark keeps demoting an
    /// endpoint before it lapses.
    pub endpoint_unavailability_expiry: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        RoutingConfig {
            enable_endpoint_discovery: true,
            preferred_locations: Vec::new(),
            use_multiple_write_locations: false,
            endpoint_unavailability_expiry: Duration::from_secs(300),
        }
    }
}

/// Thresholds governing the per-(partition, region) health state machine.
#[derive(Debug, Clone)]
pub struct HealthTrackerConfig {
    /// Consecutive write failures that trip the breaker. Writes trip
    /// faster than reads.
    pub write_consecutive_failure_threshold: u32,

    /// Consecutive read failures that trip the breaker.
    pub read_consecutive_failure_threshold: u32,

    /// Rolling-window failure rate (percent) at which the breaker trips,
    /// once the window holds at least
    /// [`min_samples_for_failure_rate`](Self::min_samples_for_failure_rate)
    /// outcomes.
    pub failure_rate_threshold: f64,

    /// Minimum number of outcomes in the rolling window before the failure
    /// rate is considered meaningful.
    pub min_samples_for_failure_rate: usize,

    /// Number of most recent outcomes retained per operation class.
    /// Older outcomes fall out of the window and stop counting.
    pub window_capacity: usize,

    /// Cooldown before an Unhealthy pair is allowed its first probe.
    pub initial_cooldown: Duration,

    /// Upper bound for the cooldown after repeated failed probes
    /// (the cooldown doubles on every failed probe).
    pub max_cooldown: Duration,
}

impl Default for HealthTrackerConfig {
    fn default() -> Self {
        HealthTrackerConfig {
            write_consecutive_failure_threshold: 5,
            read_consecutive_failure_threshold: 10,
            failure_rate_threshold: 80.0,
            min_samples_for_failure_rate: 10,
            window_capacity: 100,
            initial_cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(600),
        }
    }
}

impl HealthTrackerConfig {
    /// Defaults overridden by `GLOBALDB_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparsable values are logged
    /// and ignored, never an error.
    pub fn from_env() -> Self {
        let mut config = HealthTrackerConfig::default();
        if let Some(v) = env_override("GLOBALDB_WRITE_CONSECUTIVE_FAILURES") {
            config.write_consecutive_failure_threshold = v;
        }
        if let Some(v) = env_override("GLOBALDB_READ_CONSECUTIVE_FAILURES") {
            config.read_consecutive_failure_threshold = v;
        }
        if let Some(v) = env_override("GLOBALDB_FAILURE_RATE_THRESHOLD") {
            config.failure_rate_threshold = v;
        }
        if let Some(v) = env_override("GLOBALDB_MIN_SAMPLES_FOR_FAILURE_RATE") {
            config.min_samples_for_failure_rate = v;
        }
        if let Some(v) = env_override("GLOBALDB_INITIAL_COOLDOWN_SECS") {
            config.initial_cooldown = Duration::from_secs(v);
        }
        if let Some(v) = env_override("GLOBALDB_MAX_COOLDOWN_SECS") {
            config.max_cooldown = Duration::from_secs(v);
        }
        config
    }
}

/// Scheduling of background topology refreshes.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Interval between periodic topology refreshes.
    pub refresh_interval: Duration,

    /// Unforced on-demand refreshes arriving within this interval of the
    /// previous refresh are coalesced into a no-op.
    pub min_refresh_interval: Duration,

    /// Retry interval used instead of [`refresh_interval`](Self::refresh_interval)
    /// while account metadata fetches keep failing.
    pub failed_refresh_retry_interval: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig {
            refresh_interval: Duration::from_secs(300),
            min_refresh_interval: Duration::from_secs(60),
            failed_refresh_retry_interval: Duration::from_secs(5),
        }
    }
}

fn env_override<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable value {:?} of {}", raw, name);
            None
        }
    }
}

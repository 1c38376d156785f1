//! Runtime configuration for the transport.

use crate::rate_limit::RetryPolicy;
use std::fmt;
use std::time::Duration;

/// Default number of events kept in the offline store.
pub const DEFAULT_MAX_EVENTS: usize = 10;

/// Default number of breadcrumbs kept per event.
pub const DEFAULT_MAX_BREADCRUMBS: usize = 200;

/// Default number of network attempts running at once.
pub const DEFAULT_MAX_CONCURRENT_ATTEMPTS: usize = 4;

/// Default capacity of the worker command channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default upper bound on a single hook invocation.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(2);

/// Process-wide transport settings, readable by every pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Probability that a fresh event is sent at all.
    pub sample_rate: f64,
    /// Maximum number of entries held by the offline store.
    pub max_events: usize,
    /// Maximum number of breadcrumbs attached to one event.
    pub max_breadcrumbs: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            sample_rate: 1.0,
            max_events: DEFAULT_MAX_EVENTS,
            max_breadcrumbs: DEFAULT_MAX_BREADCRUMBS,
        }
    }
}

impl TransportConfig {
    /// Build a config, clamping invalid values.
    ///
    /// Returns the warnings produced while clamping.
    pub fn validated(
        sample_rate: f64,
        max_events: usize,
        max_breadcrumbs: usize,
    ) -> (Self, Vec<ConfigWarning>) {
        let mut warnings = Vec::new();
        let (sample_rate, warning) = validate_sample_rate(sample_rate);
        warnings.extend(warning);
        let (max_events, warning) = validate_max_events(max_events);
        warnings.extend(warning);

        (
            Self {
                sample_rate,
                max_events,
                max_breadcrumbs,
            },
            warnings,
        )
    }
}

/// When the worker starts a drain pass on its own.
///
/// Explicit [`send_all_stored_events`](crate::TransportCoordinator::send_all_stored_events)
/// calls always work regardless of this policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainPolicy {
    /// Drain on a fixed interval.
    pub interval: Option<Duration>,
    /// Drain once right after the worker starts.
    pub on_start: bool,
    /// Drain after any fresh send succeeds.
    pub after_success: bool,
}

/// Everything needed to start a [`TransportCoordinator`](crate::TransportCoordinator).
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub config: TransportConfig,
    /// Upper bound on concurrently running network attempts.
    pub max_concurrent_attempts: usize,
    /// Upper bound on a single hook invocation.
    pub hook_timeout: Duration,
    /// Cooldown growth after failed attempts.
    pub retry: RetryPolicy,
    /// Capacity of the producer -> worker command channel.
    pub channel_capacity: usize,
    pub drain: DrainPolicy,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            config: TransportConfig::default(),
            max_concurrent_attempts: DEFAULT_MAX_CONCURRENT_ATTEMPTS,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            retry: RetryPolicy::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            drain: DrainPolicy::default(),
        }
    }
}

/// A non-fatal configuration problem. The offending value was clamped.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarning {
    SampleRateClamped { requested: f64, applied: f64 },
    MaxEventsClamped { requested: usize, applied: usize },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SampleRateClamped { requested, applied } => write!(
                f,
                "sample rate {requested} is outside [0, 1], using {applied}"
            ),
            Self::MaxEventsClamped { requested, applied } => {
                write!(f, "max events {requested} is below 1, using {applied}")
            }
        }
    }
}

/// Clamp a sample rate into `[0, 1]`.
///
/// NaN has no nearest bound and falls back to `1.0`.
pub fn validate_sample_rate(requested: f64) -> (f64, Option<ConfigWarning>) {
    if requested.is_nan() {
        return (
            1.0,
            Some(ConfigWarning::SampleRateClamped {
                requested,
                applied: 1.0,
            }),
        );
    }
    let applied = requested.clamp(0.0, 1.0);
    if applied != requested {
        (
            applied,
            Some(ConfigWarning::SampleRateClamped { requested, applied }),
        )
    } else {
        (applied, None)
    }
}

/// `max_events` must be at least 1.
pub fn validate_max_events(requested: usize) -> (usize, Option<ConfigWarning>) {
    if requested == 0 {
        (
            1,
            Some(ConfigWarning::MaxEventsClamped {
                requested,
                applied: 1,
            }),
        )
    } else {
        (requested, None)
    }
}

//! Redelivery policy: retry limits, delay computation and logging flags.
//!
//! Attempt semantics: `attempt` counts redeliveries, so the first redelivery is `attempt = 1`.
//! The initial delivery is not a redelivery and never waits.
//!
//! Delay computation, in order:
//! 1. A configured [`DelayPattern`] wins over every other setting.
//! 2. Otherwise the base delay is `redelivery_delay`, multiplied by
//!    `back_off_multiplier^(attempt - 1)` when exponential backoff is on.
//! 3. The result is capped at `maximum_redelivery_delay`.
//! 4. Collision avoidance adds `delay * collision_avoidance_factor * r` with `r` uniform in
//!    `[-1, 1]`; the jittered value stays within `[0, maximum_redelivery_delay]`.
//!
//! ```rust
//! use routeguard::RedeliveryPolicy;
//! use std::time::Duration;
//!
//! let policy = RedeliveryPolicy::builder()
//!     .maximum_redeliveries(3)
//!     .redelivery_delay(Duration::from_millis(100))
//!     .use_exponential_back_off(true)
//!     .back_off_multiplier(2.0)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(policy.delay_for(1), Duration::from_millis(100));
//! assert_eq!(policy.delay_for(2), Duration::from_millis(200));
//! assert_eq!(policy.delay_for(3), Duration::from_millis(400));
//! ```

use crate::error::ConfigError;
use crate::logging::LoggingLevel;
use rand::{rng, Rng};
use std::fmt;
use std::time::Duration;

/// Redelivery limit meaning "retry forever".
pub const UNLIMITED_REDELIVERIES: i32 = -1;

/// Per-attempt delays parsed from `"<attempt>:<millis>;..."`.
///
/// Each group applies from its attempt number onwards until the next group starts; attempts
/// before the first group use no delay. `"1:100;3:1000;5:5000"` waits 100ms for attempts 1-2,
/// 1s for attempts 3-4 and 5s from attempt 5 on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayPattern {
    source: String,
    steps: Vec<(u32, Duration)>,
}

impl DelayPattern {
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidDelayPattern {
            pattern: pattern.to_string(),
            reason,
        };
        let mut steps: Vec<(u32, Duration)> = Vec::new();
        for group in pattern.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let (attempt, millis) = group
                .split_once(':')
                .ok_or_else(|| invalid(format!("group '{group}' is not '<attempt>:<millis>'")))?;
            let attempt: u32 = attempt
                .trim()
                .parse()
                .map_err(|_| invalid(format!("'{attempt}' is not an attempt number")))?;
            let millis: u64 = millis
                .trim()
                .parse()
                .map_err(|_| invalid(format!("'{millis}' is not a delay in milliseconds")))?;
            if let Some((previous, _)) = steps.last() {
                if attempt <= *previous {
                    return Err(invalid(format!(
                        "attempt {attempt} must be greater than the previous group ({previous})"
                    )));
                }
            }
            steps.push((attempt, Duration::from_millis(millis)));
        }
        if steps.is_empty() {
            return Err(invalid("pattern has no groups".to_string()));
        }
        Ok(Self { source: pattern.to_string(), steps })
    }

    /// Delay for the given redelivery attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.steps
            .iter()
            .take_while(|(from, _)| *from <= attempt)
            .last()
            .map(|(_, delay)| *delay)
            .unwrap_or(Duration::ZERO)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for DelayPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Immutable redelivery settings. Build with [`RedeliveryPolicy::builder`] or copy an existing
/// policy with [`RedeliveryPolicy::to_builder`] to derive a variant.
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    maximum_redeliveries: i32,
    redelivery_delay: Duration,
    use_exponential_back_off: bool,
    back_off_multiplier: f64,
    use_collision_avoidance: bool,
    collision_avoidance_factor: f64,
    maximum_redelivery_delay: Duration,
    delay_pattern: Option<DelayPattern>,
    async_delayed_redelivery: bool,
    allow_redelivery_while_stopping: bool,
    retries_exhausted_log_level: LoggingLevel,
    retry_attempted_log_level: LoggingLevel,
    retry_attempted_log_interval: u32,
    log_retry_attempted: bool,
    log_exhausted: bool,
    log_handled: bool,
    log_continued: bool,
    log_exhausted_message_history: bool,
    log_exhausted_message_body: bool,
    log_new_exception: bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay: Duration::from_millis(1000),
            use_exponential_back_off: false,
            back_off_multiplier: 2.0,
            use_collision_avoidance: false,
            collision_avoidance_factor: 0.15,
            maximum_redelivery_delay: Duration::from_secs(60),
            delay_pattern: None,
            async_delayed_redelivery: false,
            allow_redelivery_while_stopping: true,
            retries_exhausted_log_level: LoggingLevel::Error,
            retry_attempted_log_level: LoggingLevel::Debug,
            retry_attempted_log_interval: 1,
            log_retry_attempted: true,
            log_exhausted: true,
            log_handled: false,
            log_continued: false,
            log_exhausted_message_history: false,
            log_exhausted_message_body: false,
            log_new_exception: true,
        }
    }
}

impl RedeliveryPolicy {
    pub fn builder() -> RedeliveryPolicyBuilder {
        RedeliveryPolicyBuilder::new()
    }

    /// Builder seeded with this policy's values.
    pub fn to_builder(&self) -> RedeliveryPolicyBuilder {
        RedeliveryPolicyBuilder { policy: self.clone(), delay_pattern: None }
    }

    /// Delay before redelivery `attempt` (1-based), using the thread-local RNG for jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_for_with_rng(attempt, &mut rng())
    }

    /// Delay computation with an injected RNG (deterministic tests).
    pub fn delay_for_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        if let Some(pattern) = &self.delay_pattern {
            return pattern.delay_for(attempt);
        }

        let base = self.redelivery_delay.as_secs_f64() * 1000.0;
        let mut millis = if self.use_exponential_back_off {
            let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
            base * self.back_off_multiplier.powi(exponent)
        } else {
            base
        };

        let cap = self.maximum_redelivery_delay.as_secs_f64() * 1000.0;
        let capped = self.use_exponential_back_off || self.use_collision_avoidance;
        if capped && cap > 0.0 {
            millis = millis.min(cap);
        }

        if self.use_collision_avoidance && millis > 0.0 {
            let variance: f64 = rng.random_range(-1.0..=1.0);
            millis += millis * self.collision_avoidance_factor * variance;
            if cap > 0.0 {
                millis = millis.min(cap);
            }
        }

        millis_to_duration(millis)
    }

    /// Whether another redelivery is allowed after `attempts` redeliveries were made.
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        match self.maximum_redeliveries {
            UNLIMITED_REDELIVERIES => true,
            max if max <= 0 => false,
            max => attempts < max as u32,
        }
    }

    pub fn maximum_redeliveries(&self) -> i32 {
        self.maximum_redeliveries
    }

    /// The redelivery limit as a count, `None` when unlimited.
    pub fn maximum_redeliveries_bound(&self) -> Option<u32> {
        u32::try_from(self.maximum_redeliveries).ok()
    }

    pub fn redelivery_delay(&self) -> Duration {
        self.redelivery_delay
    }

    pub fn use_exponential_back_off(&self) -> bool {
        self.use_exponential_back_off
    }

    pub fn back_off_multiplier(&self) -> f64 {
        self.back_off_multiplier
    }

    pub fn use_collision_avoidance(&self) -> bool {
        self.use_collision_avoidance
    }

    pub fn collision_avoidance_factor(&self) -> f64 {
        self.collision_avoidance_factor
    }

    pub fn maximum_redelivery_delay(&self) -> Duration {
        self.maximum_redelivery_delay
    }

    pub fn delay_pattern(&self) -> Option<&DelayPattern> {
        self.delay_pattern.as_ref()
    }

    pub fn async_delayed_redelivery(&self) -> bool {
        self.async_delayed_redelivery
    }

    pub fn allow_redelivery_while_stopping(&self) -> bool {
        self.allow_redelivery_while_stopping
    }

    pub fn retries_exhausted_log_level(&self) -> LoggingLevel {
        self.retries_exhausted_log_level
    }

    pub fn retry_attempted_log_level(&self) -> LoggingLevel {
        self.retry_attempted_log_level
    }

    pub fn retry_attempted_log_interval(&self) -> u32 {
        self.retry_attempted_log_interval
    }

    pub fn log_retry_attempted(&self) -> bool {
        self.log_retry_attempted
    }

    pub fn log_exhausted(&self) -> bool {
        self.log_exhausted
    }

    pub fn log_handled(&self) -> bool {
        self.log_handled
    }

    pub fn log_continued(&self) -> bool {
        self.log_continued
    }

    pub fn log_exhausted_message_history(&self) -> bool {
        self.log_exhausted_message_history
    }

    pub fn log_exhausted_message_body(&self) -> bool {
        self.log_exhausted_message_body
    }

    pub fn log_new_exception(&self) -> bool {
        self.log_new_exception
    }
}

fn millis_to_duration(millis: f64) -> Duration {
    if !millis.is_finite() || millis <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(millis / 1000.0).unwrap_or(Duration::MAX)
}

/// Builder for [`RedeliveryPolicy`]; `build` validates every field.
#[derive(Debug, Clone)]
pub struct RedeliveryPolicyBuilder {
    policy: RedeliveryPolicy,
    delay_pattern: Option<String>,
}

impl Default for RedeliveryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RedeliveryPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: RedeliveryPolicy::default(), delay_pattern: None }
    }

    /// `-1` for unlimited, `0` disables redelivery.
    pub fn maximum_redeliveries(mut self, max: i32) -> Self {
        self.policy.maximum_redeliveries = max;
        self
    }

    pub fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.policy.redelivery_delay = delay;
        self
    }

    pub fn use_exponential_back_off(mut self, enabled: bool) -> Self {
        self.policy.use_exponential_back_off = enabled;
        self
    }

    pub fn back_off_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.back_off_multiplier = multiplier;
        self
    }

    pub fn use_collision_avoidance(mut self, enabled: bool) -> Self {
        self.policy.use_collision_avoidance = enabled;
        self
    }

    /// Jitter factor in `[0, 1]`.
    pub fn collision_avoidance_factor(mut self, factor: f64) -> Self {
        self.policy.collision_avoidance_factor = factor;
        self
    }

    pub fn maximum_redelivery_delay(mut self, delay: Duration) -> Self {
        self.policy.maximum_redelivery_delay = delay;
        self
    }

    /// Pattern such as `"1:100;3:1000"`; parsed by `build`.
    pub fn delay_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.delay_pattern = Some(pattern.into());
        self
    }

    pub fn async_delayed_redelivery(mut self, enabled: bool) -> Self {
        self.policy.async_delayed_redelivery = enabled;
        self
    }

    pub fn allow_redelivery_while_stopping(mut self, allowed: bool) -> Self {
        self.policy.allow_redelivery_while_stopping = allowed;
        self
    }

    pub fn retries_exhausted_log_level(mut self, level: LoggingLevel) -> Self {
        self.policy.retries_exhausted_log_level = level;
        self
    }

    pub fn retry_attempted_log_level(mut self, level: LoggingLevel) -> Self {
        self.policy.retry_attempted_log_level = level;
        self
    }

    /// Log only every n-th attempt.
    pub fn retry_attempted_log_interval(mut self, interval: u32) -> Self {
        self.policy.retry_attempted_log_interval = interval;
        self
    }

    pub fn log_retry_attempted(mut self, enabled: bool) -> Self {
        self.policy.log_retry_attempted = enabled;
        self
    }

    pub fn log_exhausted(mut self, enabled: bool) -> Self {
        self.policy.log_exhausted = enabled;
        self
    }

    pub fn log_handled(mut self, enabled: bool) -> Self {
        self.policy.log_handled = enabled;
        self
    }

    pub fn log_continued(mut self, enabled: bool) -> Self {
        self.policy.log_continued = enabled;
        self
    }

    pub fn log_exhausted_message_history(mut self, enabled: bool) -> Self {
        self.policy.log_exhausted_message_history = enabled;
        self
    }

    pub fn log_exhausted_message_body(mut self, enabled: bool) -> Self {
        self.policy.log_exhausted_message_body = enabled;
        self
    }

    pub fn log_new_exception(mut self, enabled: bool) -> Self {
        self.policy.log_new_exception = enabled;
        self
    }

    pub fn build(self) -> Result<RedeliveryPolicy, ConfigError> {
        let mut policy = self.policy;
        if policy.maximum_redeliveries < UNLIMITED_REDELIVERIES {
            return Err(ConfigError::invalid(
                "maximum_redeliveries",
                format!("must be >= -1 (got {})", policy.maximum_redeliveries),
            ));
        }
        if !(policy.back_off_multiplier.is_finite() && policy.back_off_multiplier >= 1.0) {
            return Err(ConfigError::invalid(
                "back_off_multiplier",
                format!("must be >= 1.0 (got {})", policy.back_off_multiplier),
            ));
        }
        if !(0.0..=1.0).contains(&policy.collision_avoidance_factor) {
            return Err(ConfigError::invalid(
                "collision_avoidance_factor",
                format!("must be within [0, 1] (got {})", policy.collision_avoidance_factor),
            ));
        }
        if policy.retry_attempted_log_interval == 0 {
            return Err(ConfigError::invalid("retry_attempted_log_interval", "must be > 0"));
        }
        if let Some(pattern) = self.delay_pattern {
            policy.delay_pattern = Some(DelayPattern::parse(&pattern)?);
        }
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn exponential(max_delay: Duration) -> RedeliveryPolicy {
        RedeliveryPolicy::builder()
            .maximum_redeliveries(10)
            .redelivery_delay(Duration::from_millis(100))
            .use_exponential_back_off(true)
            .back_off_multiplier(2.0)
            .maximum_redelivery_delay(max_delay)
            .build()
            .expect("valid policy")
    }

    #[test]
    fn constant_delay_without_backoff() {
        let policy = RedeliveryPolicy::builder()
            .redelivery_delay(Duration::from_millis(250))
            .build()
            .unwrap();
        for attempt in 1..5 {
            assert_eq!(policy.delay_for(attempt), Duration::from_millis(250));
        }
    }

    #[test]
    fn exponential_backoff_matches_closed_form() {
        let policy = exponential(Duration::from_secs(3600));
        for attempt in 1..=8u32 {
            let expected = 100u64 * 2u64.pow(attempt - 1);
            assert_eq!(policy.delay_for(attempt), Duration::from_millis(expected));
        }
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = exponential(Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(30), Duration::from_millis(500));
    }

    #[test]
    fn collision_avoidance_stays_in_bounds() {
        let policy = RedeliveryPolicy::builder()
            .redelivery_delay(Duration::from_millis(1000))
            .use_collision_avoidance(true)
            .collision_avoidance_factor(0.5)
            .maximum_redelivery_delay(Duration::from_millis(1200))
            .build()
            .unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let delay = policy.delay_for_with_rng(1, &mut rng);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn delay_pattern_overrides_other_settings() {
        let policy = RedeliveryPolicy::builder()
            .redelivery_delay(Duration::from_secs(9))
            .use_exponential_back_off(true)
            .delay_pattern("2:100;4:1000")
            .build()
            .unwrap();
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(100));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(50), Duration::from_millis(1000));
    }

    #[test]
    fn delay_pattern_rejects_garbage() {
        for bad in ["", "abc", "1:x", "3:10;2:20", "1;2"] {
            let err = DelayPattern::parse(bad).expect_err(bad);
            assert!(matches!(err, ConfigError::InvalidDelayPattern { .. }), "{bad}");
        }
    }

    #[test]
    fn zero_redeliveries_never_allows_attempts() {
        let policy = RedeliveryPolicy::default();
        assert_eq!(policy.maximum_redeliveries(), 0);
        assert!(!policy.allows_attempt(0));
    }

    #[test]
    fn unlimited_redeliveries() {
        let policy = RedeliveryPolicy::builder()
            .maximum_redeliveries(UNLIMITED_REDELIVERIES)
            .build()
            .unwrap();
        assert!(policy.allows_attempt(u32::MAX - 1));
        assert_eq!(policy.maximum_redeliveries_bound(), None);
    }

    #[test]
    fn builder_validates() {
        assert!(RedeliveryPolicy::builder().maximum_redeliveries(-2).build().is_err());
        assert!(RedeliveryPolicy::builder().back_off_multiplier(0.5).build().is_err());
        assert!(RedeliveryPolicy::builder().collision_avoidance_factor(1.5).build().is_err());
        assert!(RedeliveryPolicy::builder().retry_attempted_log_interval(0).build().is_err());
    }

    #[test]
    fn to_builder_copies_without_mutating_original() {
        let base = exponential(Duration::from_secs(1));
        let derived = base.to_builder().maximum_redeliveries(1).build().unwrap();
        assert_eq!(base.maximum_redeliveries(), 10);
        assert_eq!(derived.maximum_redeliveries(), 1);
        assert_eq!(derived.redelivery_delay(), base.redelivery_delay());
    }
}

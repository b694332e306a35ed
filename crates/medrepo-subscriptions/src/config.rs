//! Dispatcher timing and capacity settings.

use std::time::Duration;

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Interval between liveness pings on a session
    pub ping_interval: Duration,
    /// Unanswered pings after which a session is torn down
    pub missed_pings: u32,
    /// Lifetime of a binding token
    pub token_ttl: Duration,
    /// Window before expiry in which the client is prompted to refresh
    pub token_grace: Duration,
    /// Interval between repeated refresh prompts inside the grace window
    pub refresh_cadence: Duration,
    /// Bounded delivery queue size per session
    pub queue_capacity: usize,
    /// Consecutive delivery failures before a subscription is set to error
    pub max_delivery_attempts: u32,
    /// Backoff before the first redelivery; doubles per attempt
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(5000),
            missed_pings: 2,
            token_ttl: Duration::from_secs(60 * 60),
            token_grace: Duration::from_secs(5 * 60),
            refresh_cadence: Duration::from_secs(60),
            queue_capacity: 256,
            max_delivery_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            retry_backoff_max: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_missed_pings(mut self, missed: u32) -> Self {
        self.missed_pings = missed;
        self
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn with_token_grace(mut self, grace: Duration) -> Self {
        self.token_grace = grace;
        self
    }

    pub fn with_refresh_cadence(mut self, cadence: Duration) -> Self {
        self.refresh_cadence = cadence;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff = initial;
        self.retry_backoff_max = max;
        self
    }

    /// Offset from issuance at which the first refresh prompt is sent.
    pub fn prompt_after(&self) -> Duration {
        self.token_ttl.saturating_sub(self.token_grace)
    }

    /// Backoff before redelivery number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.retry_backoff_max)
    }

    /// Checks the settings are usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.ping_interval.is_zero() {
            return Err("ping interval must be positive".into());
        }
        if self.missed_pings == 0 {
            return Err("missed pings must be at least 1".into());
        }
        if self.token_grace >= self.token_ttl {
            return Err("token grace must be shorter than the token lifetime".into());
        }
        if self.refresh_cadence.is_zero() {
            return Err("refresh cadence must be positive".into());
        }
        if self.queue_capacity == 0 {
            return Err("queue capacity must be positive".into());
        }
        if self.max_delivery_attempts == 0 {
            return Err("max delivery attempts must be at least 1".into());
        }
        Ok(())
    }
}

//! Retry pacing for the controller and cloud session loops.
//!
//! Both loops sleep [`calculate_backoff`] after every session end, clean
//! close included, and count consecutive short-lived sessions against
//! `max_retries`. A session that stays up for `stable_after` clears the
//! count.

use std::time::Duration;

// ── ReconnectConfig ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Sleep after the first failed session. Default: 1s.
    pub initial_delay: Duration,

    /// Ceiling for the doubled delay, before jitter. Default: 30s.
    pub max_delay: Duration,

    /// Consecutive failed sessions tolerated before the link parks in
    /// `Error`. `None` keeps retrying.
    pub max_retries: Option<u32>,

    /// A session connected at least this long resets the failure count.
    /// Default: 10s.
    pub stable_after: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
            stable_after: Duration::from_secs(10),
        }
    }
}

impl ReconnectConfig {
    /// Default pacing, giving up after `max_retries` failed sessions.
    pub fn bounded(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..Self::default()
        }
    }

    /// True once `attempt` consecutive failures reach `max_retries`.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_retries.is_some_and(|max| attempt >= max)
    }

    /// Whether a session that stayed connected for `uptime` counts as
    /// healthy.
    pub fn is_stable(&self, uptime: Duration) -> bool {
        uptime >= self.stable_after
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Delay before retry number `attempt` (0-based).
///
/// Doubles from `initial_delay`, clamps at `max_delay`, then scales by a
/// factor in `[0.75, 1.25]` derived from the attempt number so agents
/// restarted together drift apart.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt.min(30)).unwrap_or(30);
    let doubled = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let clamped = doubled.min(config.max_delay.as_secs_f64());

    let spread = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    Duration::from_secs_f64((clamped * spread).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_policy_never_gives_up() {
        let config = ReconnectConfig::default();
        assert!(config.max_retries.is_none());
        assert!(!config.exhausted(u32::MAX));
        assert!(config.is_stable(Duration::from_secs(10)));
        assert!(!config.is_stable(Duration::from_secs(9)));
    }

    #[test]
    fn bounded_policy_stops_at_limit() {
        let config = ReconnectConfig::bounded(3);
        assert!(!config.exhausted(2));
        assert!(config.exhausted(3));
    }

    #[test]
    fn first_retry_waits_initial_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(200),
            ..ReconnectConfig::default()
        };
        assert_eq!(calculate_backoff(0, &config), Duration::from_millis(200));
    }

    #[test]
    fn delays_grow_until_clamped() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            ..ReconnectConfig::default()
        };

        let early: Vec<Duration> = (0..3).map(|n| calculate_backoff(n, &config)).collect();
        assert!(early.windows(2).all(|pair| pair[1] > pair[0]), "{early:?}");

        let ceiling = Duration::from_millis(2_500);
        assert!(calculate_backoff(12, &config) <= ceiling);
        assert!(calculate_backoff(u32::MAX, &config) <= ceiling);
    }
}

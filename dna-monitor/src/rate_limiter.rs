use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::types::{RateLimitConfig, RateLimitExceeded};

struct HostState {
    next_slot: Instant,
    backoff_until: Option<Instant>,
    consecutive_failures: u32,
    backoff: ExponentialBackoff,
}

impl HostState {
    fn new(now: Instant, config: &RateLimitConfig) -> Self {
        Self {
            next_slot: now,
            backoff_until: None,
            consecutive_failures: 0,
            // No jitter and no elapsed-time cutoff: the k-th consecutive
            // failure delays by base * 2^(k-1), capped.
            backoff: ExponentialBackoff {
                current_interval: config.backoff_base,
                initial_interval: config.backoff_base,
                randomization_factor: 0.0,
                multiplier: 2.0,
                max_interval: config.backoff_cap,
                max_elapsed_time: None,
                ..Default::default()
            },
        }
    }
}

/// Per-host request spacing with exponential backoff after failures.
///
/// Slots are reserved under the lock, so concurrent callers for one host are
/// handed successive slots rather than racing for the same one.
pub struct HostRateLimiter {
    config: RateLimitConfig,
    hosts: Mutex<HashMap<String, HostState>>,
}

impl HostRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Waits for the next slot of `host`.
    pub async fn acquire(&self, host: &str) -> HostPermit<'_> {
        let start = self.reserve(host, None).unwrap_or_else(|_| Instant::now());
        self.wait_for(host, start).await
    }

    /// Like [`acquire`](Self::acquire) but refuses, without reserving
    /// anything, when the slot would begin after `deadline`.
    pub async fn acquire_until(
        &self,
        host: &str,
        deadline: Instant,
    ) -> Result<HostPermit<'_>, RateLimitExceeded> {
        let start = self.reserve(host, Some(deadline))?;
        Ok(self.wait_for(host, start).await)
    }

    pub fn consecutive_failures(&self, host: &str) -> u32 {
        self.lock()
            .get(host)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    fn reserve(&self, host: &str, deadline: Option<Instant>) -> Result<Instant, RateLimitExceeded> {
        let now = Instant::now();
        let mut hosts = self.lock();
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(now, &self.config));

        let mut start = now.max(state.next_slot);
        if let Some(until) = state.backoff_until {
            start = start.max(until);
        }

        if let Some(deadline) = deadline {
            if start > deadline {
                return Err(RateLimitExceeded {
                    host: host.to_string(),
                    wait: start - now,
                });
            }
        }

        state.next_slot = start + self.config.min_interval;
        Ok(start)
    }

    async fn wait_for(&self, host: &str, start: Instant) -> HostPermit<'_> {
        let now = Instant::now();
        if start > now {
            debug!("Rate limiting {}: waiting {:?}", host, start - now);
            tokio::time::sleep_until(start).await;
        }
        HostPermit {
            limiter: self,
            host: host.to_string(),
        }
    }

    fn record_success(&self, host: &str) {
        if let Some(state) = self.lock().get_mut(host) {
            if state.consecutive_failures > 0 {
                debug!("{} recovered after {} failures", host, state.consecutive_failures);
            }
            state.consecutive_failures = 0;
            state.backoff_until = None;
            state.backoff.reset();
        }
    }

    fn record_failure(&self, host: &str) {
        let cap = self.config.backoff_cap;
        if let Some(state) = self.lock().get_mut(host) {
            state.consecutive_failures += 1;
            let delay = state.backoff.next_backoff().unwrap_or(cap).min(cap);
            state.backoff_until = Some(Instant::now() + delay);
            warn!(
                "{} failed {} times in a row, backing off {:?}",
                host, state.consecutive_failures, delay
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HostState>> {
        self.hosts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Permission to issue one request. Report the outcome with
/// [`success`](Self::success) or [`failure`](Self::failure); dropping the
/// permit unreported leaves the host's backoff state as it was.
#[must_use]
pub struct HostPermit<'a> {
    limiter: &'a HostRateLimiter,
    host: String,
}

impl HostPermit<'_> {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn success(self) {
        self.limiter.record_success(&self.host);
    }

    pub fn failure(self) {
        self.limiter.record_failure(&self.host);
    }
}

/// Limiter key for a URL; unparsable addresses share one bucket.
pub fn host_key(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .unwrap_or_default()
}

impl Default for HostRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> HostRateLimiter {
        HostRateLimiter::new(RateLimitConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_acquires_are_spaced() {
        let limiter = limiter();
        let mut starts = Vec::new();
        for _ in 0..5 {
            let permit = limiter.acquire("example.com").await;
            starts.push(Instant::now());
            permit.success();
        }
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hosts_do_not_share_slots() {
        let limiter = limiter();
        let begin = Instant::now();
        limiter.acquire("a.example.com").await.success();
        limiter.acquire("b.example.com").await.success();
        assert!(Instant::now() - begin < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_after_consecutive_failures() {
        let limiter = limiter();
        for _ in 0..3 {
            limiter.acquire("flaky.example.com").await.failure();
        }
        assert_eq!(limiter.consecutive_failures("flaky.example.com"), 3);

        let after_failures = Instant::now();
        let permit = limiter.acquire("flaky.example.com").await;
        assert!(Instant::now() - after_failures >= Duration::from_secs(4));

        permit.success();
        assert_eq!(limiter.consecutive_failures("flaky.example.com"), 0);

        let after_success = Instant::now();
        limiter.acquire("flaky.example.com").await.success();
        assert!(Instant::now() - after_success <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_capped() {
        let limiter = HostRateLimiter::new(RateLimitConfig {
            backoff_cap: Duration::from_secs(5),
            ..RateLimitConfig::default()
        });
        for _ in 0..6 {
            limiter.acquire("down.example.com").await.failure();
        }
        let before = Instant::now();
        limiter.acquire("down.example.com").await.success();
        assert!(Instant::now() - before <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_until_refuses_past_deadline() {
        let limiter = limiter();
        limiter.acquire("slow.example.com").await.failure();
        limiter.acquire("slow.example.com").await.failure();

        let deadline = Instant::now() + Duration::from_millis(500);
        let refused = limiter.acquire_until("slow.example.com", deadline).await;
        let err = refused.err().unwrap();
        assert_eq!(err.host, "slow.example.com");
        assert!(err.wait > Duration::from_millis(500));

        // Refusal reserves nothing: a later caller with room still gets in.
        let far = Instant::now() + Duration::from_secs(10);
        assert!(limiter.acquire_until("slow.example.com", far).await.is_ok());
    }

    #[test]
    fn test_host_key() {
        assert_eq!(host_key("https://News.Example.com/feed.xml"), "news.example.com");
        assert_eq!(host_key("not a url"), "");
    }
}

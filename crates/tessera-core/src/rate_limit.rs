//! Sliding-window attempt counter with block backoff.
//!
//! Each key (user id, target id) gets its own window. Once more than
//! `max_attempts` land inside `window_ms`, the key is blocked for
//! `block_duration_ms`; every call while blocked is rejected without being
//! recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEvent, AuditLog};
use crate::clock::{secs_until, Clock};
use crate::config::{RateLimitConfig, RateLimitPolicy};
use crate::error::TrustError;

/// Minimum interval between sweeps of idle windows.
const SWEEP_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitWindow {
    pub attempts: VecDeque<u64>,
    pub blocked_until: Option<u64>,
}

pub struct RateLimiter {
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
    inner: Mutex<LimiterInner>,
}

struct LimiterInner {
    windows: HashMap<String, RateLimitWindow>,
    last_sweep_ms: u64,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        Self {
            policy,
            clock,
            inner: Mutex::new(LimiterInner {
                windows: HashMap::new(),
                last_sweep_ms: now,
            }),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Record an attempt for `key`. Returns `false` if the attempt is rejected.
    pub fn check_rate_limit(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        if now.saturating_sub(inner.last_sweep_ms) >= SWEEP_INTERVAL_MS {
            inner.last_sweep_ms = now;
            sweep_windows(&mut inner.windows, &self.policy, now);
        }

        let window = inner.windows.entry(key.to_string()).or_default();
        prune(window, self.policy.window_ms, now);

        match window.blocked_until {
            Some(until) if now < until => return false,
            Some(_) => window.blocked_until = None,
            None => {}
        }

        window.attempts.push_back(now);
        if window.attempts.len() > self.policy.max_attempts as usize {
            window.blocked_until = Some(now.saturating_add(self.policy.block_duration_ms));
            tracing::debug!(key, until = ?window.blocked_until, "rate limit exceeded, blocking");
            return false;
        }
        true
    }

    /// Like [`check_rate_limit`](Self::check_rate_limit) but as a `Result`
    /// carrying the remaining wait.
    pub fn check(&self, key: &str) -> Result<(), TrustError> {
        if self.check_rate_limit(key) {
            Ok(())
        } else {
            Err(TrustError::RateLimited {
                retry_after_secs: self.remaining_secs(key),
            })
        }
    }

    /// Whole seconds until `key` is unblocked, rounded up. Zero if not blocked.
    pub fn remaining_secs(&self, key: &str) -> u64 {
        let now = self.clock.now_ms();
        self.blocked_until(key)
            .map_or(0, |until| secs_until(now, until))
    }

    pub fn blocked_until(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_ms();
        self.inner
            .lock()
            .windows
            .get(key)
            .and_then(|window| window.blocked_until)
            .filter(|until| *until > now)
    }

    pub fn reset(&self, key: &str) {
        self.inner.lock().windows.remove(key);
    }

    /// Drop windows with no recent attempts and no active block.
    pub fn sweep(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.last_sweep_ms = now;
        sweep_windows(&mut inner.windows, &self.policy, now);
    }

    pub fn tracked_keys(&self) -> usize {
        self.inner.lock().windows.len()
    }
}

fn prune(window: &mut RateLimitWindow, window_ms: u64, now: u64) {
    while let Some(&oldest) = window.attempts.front() {
        if now.saturating_sub(oldest) >= window_ms {
            window.attempts.pop_front();
        } else {
            break;
        }
    }
}

fn sweep_windows(windows: &mut HashMap<String, RateLimitWindow>, policy: &RateLimitPolicy, now: u64) {
    windows.retain(|_, window| {
        prune(window, policy.window_ms, now);
        let blocked = window.blocked_until.is_some_and(|until| until > now);
        blocked || !window.attempts.is_empty()
    });
}

/// Operations that share the limiter, each with its own policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RateLimitedAction {
    Search,
    DeviceLink,
    BundleFetch,
}

impl RateLimitedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::DeviceLink => "device_link",
            Self::BundleFetch => "bundle_fetch",
        }
    }
}

/// One limiter per [`RateLimitedAction`]. Rejections are audited.
pub struct RateLimiters {
    search: RateLimiter,
    device_link: RateLimiter,
    bundle_fetch: RateLimiter,
    audit: AuditLog,
}

impl RateLimiters {
    pub fn from_config(config: &RateLimitConfig, clock: Arc<dyn Clock>, audit: AuditLog) -> Self {
        Self {
            search: RateLimiter::new(config.search, clock.clone()),
            device_link: RateLimiter::new(config.device_link, clock.clone()),
            bundle_fetch: RateLimiter::new(config.bundle_fetch, clock),
            audit,
        }
    }

    pub fn get(&self, action: RateLimitedAction) -> &RateLimiter {
        match action {
            RateLimitedAction::Search => &self.search,
            RateLimitedAction::DeviceLink => &self.device_link,
            RateLimitedAction::BundleFetch => &self.bundle_fetch,
        }
    }

    pub fn check(&self, action: RateLimitedAction, key: &str) -> Result<(), TrustError> {
        self.get(action).check(key).inspect_err(|e| {
            self.audit.record(key, AuditEvent::RateLimited, format!("{}: {e}", action.as_str()));
        })
    }

    pub fn sweep(&self) {
        self.search.sweep();
        self.device_link.sweep();
        self.bundle_fetch.sweep();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max_attempts: u32) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let limiter = RateLimiter::new(
            RateLimitPolicy::new(60_000, max_attempts, 300_000),
            clock.clone(),
        );
        (clock, limiter)
    }

    #[test]
    fn fourth_call_blocks() {
        let (clock, limiter) = limiter(3);
        assert!(limiter.check_rate_limit("alice"));
        assert!(limiter.check_rate_limit("alice"));
        assert!(limiter.check_rate_limit("alice"));
        assert!(!limiter.check_rate_limit("alice"));

        let until = limiter.blocked_until("alice").unwrap();
        assert!(until >= clock.now_ms() + 300_000);
        assert_eq!(limiter.remaining_secs("alice"), 300);
    }

    #[test]
    fn blocked_calls_stay_rejected_until_expiry() {
        let (clock, limiter) = limiter(1);
        assert!(limiter.check_rate_limit("k"));
        assert!(!limiter.check_rate_limit("k"));

        clock.advance(Duration::from_secs(299));
        assert!(!limiter.check_rate_limit("k"));
        assert_eq!(limiter.remaining_secs("k"), 1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.remaining_secs("k"), 0);
        assert!(limiter.check_rate_limit("k"));
    }

    #[test]
    fn window_slides() {
        let (clock, limiter) = limiter(2);
        assert!(limiter.check_rate_limit("k"));
        clock.advance(Duration::from_secs(40));
        assert!(limiter.check_rate_limit("k"));
        clock.advance(Duration::from_secs(20));
        // First attempt is now a full window old.
        assert!(limiter.check_rate_limit("k"));
    }

    #[test]
    fn keys_are_independent() {
        let (_clock, limiter) = limiter(1);
        assert!(limiter.check_rate_limit("a"));
        assert!(!limiter.check_rate_limit("a"));
        assert!(limiter.check_rate_limit("b"));

        limiter.reset("a");
        assert!(limiter.check_rate_limit("a"));
    }

    #[test]
    fn sweep_drops_idle_windows() {
        let (clock, limiter) = limiter(5);
        limiter.check_rate_limit("a");
        limiter.check_rate_limit("b");
        assert_eq!(limiter.tracked_keys(), 2);

        clock.advance(Duration::from_secs(61));
        limiter.sweep();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn registry_check_maps_and_audits() {
        let clock = Arc::new(ManualClock::new(0));
        let audit = AuditLog::new(10, clock.clone());
        let config = RateLimitConfig {
            search: RateLimitPolicy::new(60_000, 1, 30_000),
            ..RateLimitConfig::default()
        };
        let limiters = RateLimiters::from_config(&config, clock, audit.clone());

        limiters.check(RateLimitedAction::Search, "alice").unwrap();
        let err = limiters.check(RateLimitedAction::Search, "alice").unwrap_err();
        assert_eq!(err.retry_after_secs(), Some(30));
        limiters.check(RateLimitedAction::DeviceLink, "alice").unwrap();

        let entries = audit.entries_for(AuditEvent::RateLimited);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor, "alice");
    }
}

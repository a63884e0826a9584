//! Per-principal fixed-window rate limiting.
//!
//! Each key owns one window of length `W`. A request inside the window bumps
//! the counter; a request at or after its expiry starts a fresh window with
//! count 1. Windows are created lazily and dropped by [`RateGovernor::sweep`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use reprise_shared::constants::RATE_WARNING_MARGIN;
use reprise_shared::PrincipalId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateKey {
    Principal(PrincipalId),
    /// Independent limiter for one expensive operation.
    Custom(PrincipalId, String),
}

#[derive(Debug, Clone)]
struct Window {
    count: u32,
    expires_at: Instant,
}

impl Window {
    /// A window still holds at the instant it expires.
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed {
        /// Set on the request that leaves exactly the warning margin, with
        /// the number of requests still available.
        warning: Option<u32>,
    },
    Blocked {
        count: u32,
        retry_after_secs: u64,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateStats {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub active_windows: usize,
    pub since: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    windows: HashMap<RateKey, Window>,
    total_requests: u64,
    blocked_requests: u64,
}

impl Inner {
    /// Count one request against `key` and return the window after it.
    fn hit(&mut self, key: RateKey, window: Duration, now: Instant) -> Window {
        let entry = self.windows.entry(key).or_insert(Window {
            count: 0,
            expires_at: now + window,
        });
        if entry.is_expired(now) {
            entry.count = 0;
            entry.expires_at = now + window;
        }
        entry.count += 1;
        entry.clone()
    }
}

#[derive(Clone)]
pub struct RateGovernor {
    inner: Arc<Mutex<Inner>>,
    ceiling: u32,
    window: Duration,
    since: DateTime<Utc>,
}

impl RateGovernor {
    pub fn new(ceiling: u32, window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            ceiling,
            window,
            since: Utc::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn admit(&self, principal: PrincipalId) -> Admission {
        self.admit_at(principal, Instant::now())
    }

    pub fn admit_at(&self, principal: PrincipalId, now: Instant) -> Admission {
        let mut inner = self.lock();
        inner.total_requests += 1;
        let window = inner.hit(RateKey::Principal(principal), self.window, now);

        if window.count > self.ceiling {
            inner.blocked_requests += 1;
            let remaining = window.expires_at.saturating_duration_since(now);
            let retry_after_secs = (remaining.as_secs_f64().ceil() as u64).max(1);
            warn!(principal = %principal, count = window.count, retry_after_secs, "Rate limit exceeded");
            return Admission::Blocked {
                count: window.count,
                retry_after_secs,
            };
        }

        let warn_at = self.ceiling.checked_sub(RATE_WARNING_MARGIN);
        let warning = (warn_at == Some(window.count)).then(|| self.ceiling - window.count);
        Admission::Allowed { warning }
    }

    /// Gate one operation with its own `limit` per `window`, independent of
    /// the per-message ceiling.
    pub fn check_custom(&self, principal: PrincipalId, tag: &str, limit: u32, window: Duration) -> bool {
        self.check_custom_at(principal, tag, limit, window, Instant::now())
    }

    pub fn check_custom_at(
        &self,
        principal: PrincipalId,
        tag: &str,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> bool {
        let mut inner = self.lock();
        let key = RateKey::Custom(principal, tag.to_string());
        let allowed = inner.hit(key, window, now).count <= limit;
        if !allowed {
            debug!(principal = %principal, tag, limit, "Custom rate limit exceeded");
        }
        allowed
    }

    /// Drop expired windows. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let before = inner.windows.len();
        inner.windows.retain(|_, window| !window.is_expired(now));
        let removed = before - inner.windows.len();
        if removed > 0 {
            debug!(removed, active = inner.windows.len(), "Swept expired rate windows");
        }
        removed
    }

    pub fn stats(&self) -> RateStats {
        let inner = self.lock();
        RateStats {
            total_requests: inner.total_requests,
            blocked_requests: inner.blocked_requests,
            active_windows: inner.windows.len(),
            since: self.since,
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_ceiling_then_block_then_reset() {
        let governor = RateGovernor::new(30, MINUTE);
        let alice = PrincipalId(1);
        let start = Instant::now();

        for i in 0..30 {
            let at = start + Duration::from_millis(i * 100);
            assert!(governor.admit_at(alice, at).is_allowed(), "request {i}");
        }

        let blocked = governor.admit_at(alice, start + Duration::from_secs(10));
        assert_eq!(
            blocked,
            Admission::Blocked {
                count: 31,
                retry_after_secs: 50
            }
        );

        // Past expiry the window restarts at 1.
        let after = start + MINUTE + Duration::from_millis(1);
        assert_eq!(governor.admit_at(alice, after), Admission::Allowed { warning: None });

        let stats = governor.stats();
        assert_eq!(stats.total_requests, 32);
        assert_eq!(stats.blocked_requests, 1);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let governor = RateGovernor::new(1, MINUTE);
        let start = Instant::now();
        governor.admit_at(PrincipalId(1), start);

        let almost = start + MINUTE - Duration::from_millis(200);
        assert_eq!(
            governor.admit_at(PrincipalId(1), almost),
            Admission::Blocked {
                count: 2,
                retry_after_secs: 1
            }
        );
    }

    #[test]
    fn test_warning_at_margin() {
        let governor = RateGovernor::new(30, MINUTE);
        let now = Instant::now();
        let warnings: Vec<_> = (1..=30)
            .filter_map(|n| match governor.admit_at(PrincipalId(5), now) {
                Admission::Allowed { warning: Some(left) } => Some((n, left)),
                _ => None,
            })
            .collect();
        assert_eq!(warnings, vec![(25, 5)]);

        // Ceilings below the margin never warn.
        let tiny = RateGovernor::new(3, MINUTE);
        for _ in 0..3 {
            assert_eq!(tiny.admit_at(PrincipalId(5), now), Admission::Allowed { warning: None });
        }
    }

    #[test]
    fn test_principals_are_independent() {
        let governor = RateGovernor::new(2, MINUTE);
        let now = Instant::now();
        governor.admit_at(PrincipalId(1), now);
        governor.admit_at(PrincipalId(1), now);
        assert!(!governor.admit_at(PrincipalId(1), now).is_allowed());
        assert!(governor.admit_at(PrincipalId(2), now).is_allowed());
    }

    #[test]
    fn test_custom_limiter_is_separate() {
        let governor = RateGovernor::new(100, MINUTE);
        let now = Instant::now();
        let bob = PrincipalId(9);

        assert!(governor.check_custom_at(bob, "add", 2, MINUTE, now));
        assert!(governor.check_custom_at(bob, "add", 2, MINUTE, now));
        assert!(!governor.check_custom_at(bob, "add", 2, MINUTE, now));
        assert!(governor.check_custom_at(bob, "restore", 2, MINUTE, now));
        assert!(governor.admit_at(bob, now).is_allowed());
        assert!(governor.check_custom_at(bob, "add", 2, MINUTE, now + MINUTE + Duration::from_millis(1)));
    }

    #[test]
    fn test_window_resets_only_past_expiry() {
        let governor = RateGovernor::new(1, MINUTE);
        let carol = PrincipalId(3);
        let start = Instant::now();
        assert!(governor.admit_at(carol, start).is_allowed());

        assert_eq!(
            governor.admit_at(carol, start + MINUTE),
            Admission::Blocked {
                count: 2,
                retry_after_secs: 1
            }
        );
        assert_eq!(governor.sweep_at(start + MINUTE), 0);

        let past = start + MINUTE + Duration::from_millis(1);
        assert!(governor.admit_at(carol, past).is_allowed());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let governor = RateGovernor::new(10, MINUTE);
        let start = Instant::now();
        governor.admit_at(PrincipalId(1), start);
        governor.admit_at(PrincipalId(2), start + Duration::from_secs(30));
        governor.check_custom_at(PrincipalId(1), "add", 1, Duration::from_secs(5), start);

        assert_eq!(governor.sweep_at(start + Duration::from_secs(10)), 1);
        assert_eq!(governor.sweep_at(start + Duration::from_secs(61)), 1);
        assert_eq!(governor.stats().active_windows, 1);
    }
}

//! Account-bound worker sessions and the pool that drives them.

mod pool;

pub use pool::{PoolConfig, PoolOutcome, PoolReport, TaskFailure, WorkerPool};

use crate::config::{BackoffSettings, RateLimitSettings};
use crate::generation::GenerationClient;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_retry2::strategy::{jitter, ExponentialBackoff};

type HitLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Health of a worker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionHealth {
    Healthy,
    /// Rate limited too often; no dispatch before `until`.
    CoolingDown { until: Instant },
    /// Never dispatched again.
    Dead { reason: String },
}

impl std::fmt::Display for SessionHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionHealth::Healthy => write!(f, "healthy"),
            SessionHealth::CoolingDown { .. } => write!(f, "cooling down"),
            SessionHealth::Dead { reason } => write!(f, "dead ({})", reason),
        }
    }
}

/// Exponential backoff between attempts of a task, with jitter so sessions
/// that fail together do not retry in lockstep.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Growth per attempt, rounded to a whole factor.
    pub multiplier: f64,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &BackoffSettings) -> Self {
        Self {
            base: Duration::from_millis(settings.base_delay_ms),
            max: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
        }
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    ///
    /// Drawn between half of [`BackoffPolicy::ceiling`] and the ceiling.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let floor = ceiling / 2;
        floor + jitter(ceiling - floor)
    }

    /// Un-jittered delay after `attempt`: `base * multiplier^(attempt - 1)`,
    /// capped at `max`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.round().max(1.0) as u64;
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let growth = ExponentialBackoff::from_millis(factor)
            .factor(base_ms)
            .max_delay(self.max);

        std::iter::once(self.base)
            .chain(growth)
            .nth(attempt.saturating_sub(1).min(64) as usize)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// When repeated rate limiting puts a session on cooldown.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl RateLimitPolicy {
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self {
            threshold: settings.threshold.max(1),
            window: Duration::from_secs(settings.window_secs),
            cooldown: Duration::from_secs(settings.cooldown_secs),
        }
    }
}

/// Counters of one session, for reports.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub id: String,
    pub account_id: String,
    pub health: SessionHealth,
    pub completed: u32,
    pub failed: u32,
}

impl RateLimitPolicy {
    /// GCRA limiter that admits `threshold - 1` hits per window. `None` when
    /// a single hit is enough or the window is empty.
    fn hit_limiter(&self) -> Option<HitLimiter> {
        let allowed = NonZeroU32::new(self.threshold.saturating_sub(1))?;
        let quota = Quota::with_period(self.window / allowed.get())?.allow_burst(allowed);
        Some(RateLimiter::direct(quota))
    }
}

struct SessionState {
    health: SessionHealth,
    /// Rate-limit hits since the last cooldown.
    rate_hits: Option<HitLimiter>,
    current: Vec<String>,
    completed: u32,
    failed: u32,
}

/// A generation session bound to one account.
///
/// A session offers `concurrency` dispatch slots that share its health and
/// rate-limit window.
pub struct WorkerSession {
    id: String,
    account_id: String,
    concurrency: usize,
    client: Arc<dyn GenerationClient>,
    state: Mutex<SessionState>,
}

impl WorkerSession {
    pub fn new(
        id: impl Into<String>,
        account_id: impl Into<String>,
        concurrency: usize,
        client: Arc<dyn GenerationClient>,
    ) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            concurrency: concurrency.max(1),
            client,
            state: Mutex::new(SessionState {
                health: SessionHealth::Healthy,
                rate_hits: None,
                current: Vec::new(),
                completed: 0,
                failed: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn client(&self) -> &Arc<dyn GenerationClient> {
        &self.client
    }

    // A poisoned lock only means another slot panicked mid-update; the
    // counters are still usable.
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn health(&self) -> SessionHealth {
        let mut state = self.state();
        if let SessionHealth::CoolingDown { until } = state.health {
            if until <= Instant::now() {
                state.health = SessionHealth::Healthy;
            }
        }
        state.health.clone()
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.health(), SessionHealth::Dead { .. })
    }

    /// End of the current cooldown, if any.
    pub fn cooling_until(&self) -> Option<Instant> {
        match self.health() {
            SessionHealth::CoolingDown { until } => Some(until),
            _ => None,
        }
    }

    pub fn mark_dead(&self, reason: &str) {
        self.state().health = SessionHealth::Dead {
            reason: reason.to_string(),
        };
    }

    /// Count a rate-limit hit. Returns true when the session enters cooldown.
    ///
    /// The session cools down once `threshold` hits land within `window`.
    /// Hits reported while already cooling down are ignored.
    pub fn record_rate_limit(&self, policy: &RateLimitPolicy) -> bool {
        let mut state = self.state();
        if !matches!(state.health, SessionHealth::Healthy) {
            return false;
        }

        let exceeded = if policy.threshold <= 1 {
            true
        } else {
            if state.rate_hits.is_none() {
                state.rate_hits = policy.hit_limiter();
            }
            // An empty window never holds two hits
            state.rate_hits.as_ref().map_or(false, |hits| hits.check().is_err())
        };

        if exceeded {
            state.health = SessionHealth::CoolingDown {
                until: Instant::now() + policy.cooldown,
            };
            state.rate_hits = None;
        }
        exceeded
    }

    fn begin(&self, task_id: &str) {
        self.state().current.push(task_id.to_string());
    }

    fn end(&self, task_id: &str, succeeded: Option<bool>) {
        let mut state = self.state();
        state.current.retain(|t| t != task_id);
        match succeeded {
            Some(true) => state.completed += 1,
            Some(false) => state.failed += 1,
            None => {}
        }
    }

    /// Tasks currently executing on this session.
    pub fn current_tasks(&self) -> Vec<String> {
        self.state().current.clone()
    }

    pub fn stats(&self) -> SessionStats {
        let health = self.health();
        let state = self.state();
        SessionStats {
            id: self.id.clone(),
            account_id: self.account_id.clone(),
            health,
            completed: state.completed,
            failed: state.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClient;

    fn session() -> WorkerSession {
        WorkerSession::new("w1", "acct-a", 1, Arc::new(ScriptedClient::new()))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(2),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        };
        assert_eq!(policy.ceiling(1), Duration::from_secs(2));
        assert_eq!(policy.ceiling(2), Duration::from_secs(4));
        assert_eq!(policy.ceiling(3), Duration::from_secs(8));
        assert_eq!(policy.ceiling(4), Duration::from_secs(10));
        assert_eq!(policy.ceiling(40), Duration::from_secs(10));

        for attempt in [1, 2, 3, 4, 40] {
            let ceiling = policy.ceiling(attempt);
            for _ in 0..20 {
                let delay = policy.delay(attempt);
                assert!(delay >= ceiling / 2 && delay <= ceiling, "{:?} outside {:?}", delay, ceiling);
            }
        }
    }

    #[test]
    fn test_backoff_is_jittered() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(60),
            max: Duration::from_secs(600),
            multiplier: 2.0,
        };
        let delays: std::collections::HashSet<Duration> = (0..20).map(|_| policy.delay(3)).collect();
        assert!(delays.len() > 1);
    }

    #[test]
    fn test_zero_backoff_stays_zero() {
        let policy = BackoffPolicy {
            base: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 2.0,
        };
        assert_eq!(policy.delay(1), Duration::ZERO);
        assert_eq!(policy.delay(7), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_threshold_and_cooldown() {
        let session = session();
        let policy = RateLimitPolicy {
            threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(120),
        };

        assert!(!session.record_rate_limit(&policy));
        assert!(!session.record_rate_limit(&policy));
        assert_eq!(session.health(), SessionHealth::Healthy);
        assert!(session.record_rate_limit(&policy));
        assert!(session.cooling_until().is_some());

        // Hits during the cooldown do not extend it
        let until = session.cooling_until();
        assert!(!session.record_rate_limit(&policy));
        assert_eq!(session.cooling_until(), until);

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(session.health(), SessionHealth::Healthy);
        assert!(!session.record_rate_limit(&policy));
    }

    #[test]
    fn test_rate_limit_hits_leave_the_window() {
        let session = session();
        let policy = RateLimitPolicy {
            threshold: 2,
            window: Duration::from_millis(40),
            cooldown: Duration::from_secs(120),
        };

        assert!(!session.record_rate_limit(&policy));
        std::thread::sleep(Duration::from_millis(80));
        assert!(!session.record_rate_limit(&policy));
        assert!(session.record_rate_limit(&policy));
    }

    #[test]
    fn test_single_hit_threshold() {
        let session = session();
        let policy = RateLimitPolicy {
            threshold: 1,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(5),
        };
        assert!(session.record_rate_limit(&policy));
    }

    #[test]
    fn test_dead_session_counters() {
        let session = session();
        session.begin("s001-image");
        assert_eq!(session.current_tasks(), vec!["s001-image".to_string()]);
        session.end("s001-image", Some(false));
        session.mark_dead("account suspended");

        let stats = session.stats();
        assert!(session.is_dead());
        assert_eq!(stats.failed, 1);
        assert!(stats.health.to_string().contains("suspended"));
        assert!(session.current_tasks().is_empty());
    }
}

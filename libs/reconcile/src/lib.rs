//! Reconciliation loop primitives.
//!
//! Helpers for loops that converge observed state toward desired state:
//!
//! - **Desired state**: what the control plane has decided (running/stopped).
//! - **Observed state**: what the node agent reports for the container.
//! - **Convergence**: issuing idempotent commands until the two agree.
//!
//! # Invariants
//!
//! - Every corrective action is idempotent, so applying the same desired
//!   state twice never produces a second side effect
//! - Retries are bounded; exhausting them escalates instead of looping

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Convergence status for a resource after a reconciliation look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Observed matches desired.
    Converged,

    /// A transition is in flight; nothing to do yet.
    Converging,

    /// Observed drifted from desired and needs correction.
    Diverged,

    /// The observed side could not be read.
    Unknown,
}

/// Exponential backoff for retrying remote commands.
///
/// The first attempt runs immediately; retry `n` (1-based) waits
/// `base * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Retries after the initial attempt.
    pub max_retries: u32,

    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max_retries: DEFAULT_MAX_RETRIES,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based). `None` once retries are
    /// exhausted.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.max_delay))
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Counts repeated drift per resource inside a sliding window.
///
/// The reconciler uses it to stop correcting a server whose drift keeps
/// coming back and escalate it instead. Counts older than the window start
/// over.
#[derive(Debug, Clone)]
pub struct RetryTracker<K> {
    max_retries: u32,
    window: Duration,
    seen: BTreeMap<K, (u32, Instant)>,
}

impl<K: Ord + Clone> RetryTracker<K> {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            seen: BTreeMap::new(),
        }
    }

    /// Count one more failure. Returns true once the budget is spent.
    pub fn record_failure(&mut self, key: &K) -> bool {
        let now = Instant::now();
        let entry = self.seen.entry(key.clone()).or_insert((0, now));
        if now.duration_since(entry.1) > self.window {
            *entry = (0, now);
        }
        entry.0 += 1;
        entry.0 > self.max_retries
    }

    pub fn clear(&mut self, key: &K) {
        self.seen.remove(key);
    }

    /// Drop entries whose window has passed.
    pub fn prune(&mut self) {
        let window = self.window;
        self.seen
            .retain(|_, (_, first)| first.elapsed() <= window);
    }

    pub fn tracked(&self) -> usize {
        self.seen.len()
    }
}

/// Default delay before the first retry of a failed agent command.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Default retries after the first failed agent command.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window for drift corrections.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(600);

//! Process-wide request governor for the upstream API.
//!
//! A fixed trailing window: every admitted request's timestamp is kept in
//! arrival order, and timestamps that have left the window are evicted from
//! the front before each check. The state is in-memory and per process.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::GovernorConfig;

#[derive(Debug)]
pub struct RateGovernor {
    max_requests: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: config.window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decide whether one outbound request may proceed, recording it if so.
    pub fn admit(&self) -> bool {
        self.admit_at(Instant::now())
    }

    pub fn admit_at(&self, now: Instant) -> bool {
        let mut timestamps = self.timestamps.lock().unwrap_or_else(PoisonError::into_inner);
        self.evict(&mut timestamps, now);

        if timestamps.len() >= self.max_requests {
            warn!(
                in_window = timestamps.len(),
                max_requests = self.max_requests,
                "Rate limit exceeded"
            );
            return false;
        }

        timestamps.push_back(now);
        true
    }

    /// Requests currently counted against the window.
    pub fn in_window(&self) -> usize {
        let mut timestamps = self.timestamps.lock().unwrap_or_else(PoisonError::into_inner);
        self.evict(&mut timestamps, Instant::now());
        timestamps.len()
    }

    fn evict(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        // Near process start `now - window` may not be representable; then
        // nothing can be old enough to evict.
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while timestamps.front().is_some_and(|t| *t <= cutoff) {
            timestamps.pop_front();
        }
    }
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

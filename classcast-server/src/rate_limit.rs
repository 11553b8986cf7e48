//! Per-connection command rate limiting.
//!
//! Each (connection, command) pair keeps the instants of its recently
//! admitted events. An event is admitted while fewer than `max_events` fall
//! inside the trailing window. Windows are process-local and vanish with the
//! connection.

use crate::session::ConnectionId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_events: u32,
    pub window_secs: u64,
}

impl RateLimit {
    pub const fn new(max_events: u32, window_secs: u64) -> Self {
        Self {
            max_events,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Debug, Default)]
struct Window {
    /// Admission instants inside the current window, oldest first.
    events: VecDeque<Instant>,
}

impl Window {
    fn evict(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.events.front() {
            if now.duration_since(oldest) >= window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<(ConnectionId, String), Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one event against the sliding window and decides whether it may run.
    ///
    /// At most `max_events` are admitted within any span of `window_secs`.
    pub fn check(&self, connection: ConnectionId, command: &str, limit: RateLimit) -> RateDecision {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry((connection, command.to_string()))
            .or_default();

        window.evict(now, limit.window());

        if window.events.len() >= limit.max_events as usize {
            let retry_after = match window.events.front() {
                Some(&oldest) => (oldest + limit.window()).saturating_duration_since(now),
                None => limit.window(),
            };
            return RateDecision::Limited { retry_after };
        }

        window.events.push_back(now);
        RateDecision::Allowed {
            remaining: limit.max_events - window.events.len() as u32,
        }
    }

    /// Drops every window of a closed connection.
    pub fn forget_connection(&self, connection: ConnectionId) {
        self.windows.retain(|(conn, _), _| *conn != connection);
    }

    /// Drops windows with no event in the last `max_window`.
    pub fn cleanup(&self, max_window: Duration) {
        let now = Instant::now();
        self.windows.retain(|_, w| {
            w.events
                .back()
                .is_some_and(|&last| now.duration_since(last) < max_window)
        });
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

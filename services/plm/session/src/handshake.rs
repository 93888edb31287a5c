//! Verification handshake for modem sessions.
//!
//! After the transport opens, the manager repeatedly sends the `Get IM Info`
//! identity query until the modem answers or the attempt budget runs out.
//!
//! Attempt policy: `max_attempts = N` allows one initial probe plus N
//! retries, so N + 1 probes in total. Each tick sends a probe while the
//! counter is at most N. The tick that finds the counter at N + 1 sends
//! nothing and reports exhaustion, which leaves every probe a full interval
//! to be answered.

use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Outcome of one handshake tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Send probe number `attempt` (1-based)
    Probe {
        /// Probe number
        attempt: u32,
    },
    /// No answer to any probe; the handshake is over
    Exhausted {
        /// Probes that went unanswered
        attempts: u32,
    },
}

/// Bounded-retry identity probe for one session
#[derive(Debug)]
pub struct Handshake {
    interval: Interval,
    max_attempts: u32,
    attempts: u32,
    active: bool,
}

impl Handshake {
    /// Start a handshake; the first tick fires one `period` from now
    pub fn start(period: Duration, max_attempts: u32) -> Self {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            max_attempts,
            attempts: 0,
            active: true,
        }
    }

    /// Probes sent so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait for the next tick. Never completes once the handshake is over.
    pub async fn tick(&mut self) {
        if !self.active {
            return std::future::pending().await;
        }
        self.interval.tick().await;
    }

    /// Advance the attempt counter for a tick that just fired
    pub fn on_tick(&mut self) -> Option<HandshakeStep> {
        if !self.active {
            return None;
        }
        if self.attempts > self.max_attempts {
            self.active = false;
            return Some(HandshakeStep::Exhausted {
                attempts: self.attempts,
            });
        }
        self.attempts += 1;
        Some(HandshakeStep::Probe {
            attempt: self.attempts,
        })
    }

    /// Record a qualifying response. Returns `true` only the first time.
    pub fn succeed(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }
}

//! Verification deadline for freshly opened sessions.
//!
//! Armed when the transport opens and dropped once the session is verified,
//! so it only ever closes sessions that never proved a modem is attached.

use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Sleep};

/// One-shot deadline timer
#[derive(Debug)]
pub struct Watchdog {
    delay: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl Watchdog {
    /// Arm a deadline `delay` from now
    pub fn arm(delay: Duration) -> Self {
        Self {
            delay,
            deadline: Box::pin(sleep(delay)),
        }
    }

    /// Configured delay
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Resolve when the deadline passes
    pub async fn expired(&mut self) {
        self.deadline.as_mut().await
    }
}

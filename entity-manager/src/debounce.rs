//! Dirty-pulse coalescing.
//!
//! Every pulse restarts the window; the scan runs when the window expires
//! with no further pulse. Pulses arriving while a scan is in flight queue
//! on the dirty channel and re-arm the window afterwards, which is the
//! rescan latch: one extra scan, not one per pulse.

use std::future::pending;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};

pub struct Debounce {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Restart the coalescing window.
    pub fn poke(&mut self) {
        self.deadline = Some(Instant::now() + self.window);
    }

    pub fn armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Wait for the window to expire; pending forever while disarmed.
    ///
    /// Cancel-safe: dropping the future (losing a `select!`) keeps the
    /// deadline armed.
    pub async fn expired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => pending().await,
        }
    }
}

//! Power gate for pruning.
//!
//! Some boards only answer probes while the host is powered; their
//! absence is not authoritative until the machine has been observed
//! powered on and a settle window has passed. Power-state reading itself
//! is external: the gate consumes a `watch` channel fed by whoever owns
//! that concern.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Whether an entity's template declared it power-dependent.
pub fn requires_power_on(entity: &Value) -> bool {
    matches!(
        entity.get("PowerState").and_then(Value::as_str),
        Some("On") | Some("BiosPost")
    )
}

pub struct PowerGate {
    power: watch::Receiver<bool>,
    settled: Arc<AtomicBool>,
}

impl PowerGate {
    /// Start the gate. After the first observed power-on, a one-shot
    /// settle timer runs; when it fires, pruning becomes authoritative
    /// and a dirty pulse triggers the cleanup scan.
    pub fn spawn(
        power: watch::Receiver<bool>,
        settle: Duration,
        dirty: mpsc::Sender<()>,
    ) -> Self {
        let settled = Arc::new(AtomicBool::new(false));
        let flag = settled.clone();
        let mut rx = power.clone();
        tokio::spawn(async move {
            loop {
                if *rx.borrow() {
                    break;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
            tokio::time::sleep(settle).await;
            flag.store(true, Ordering::Release);
            info!("Power-on settle window elapsed, pruning is authoritative");
            let _ = dirty.try_send(());
        });

        Self { power, settled }
    }

    pub fn is_power_on(&self) -> bool {
        *self.power.borrow()
    }

    /// May a missing entity be pruned?
    ///
    /// Power-independent entities always may; power-dependent ones only
    /// while the machine is on and the settle window has elapsed.
    pub fn may_prune(&self, requires_power: bool) -> bool {
        !requires_power || (self.is_power_on() && self.settled.load(Ordering::Acquire))
    }
}

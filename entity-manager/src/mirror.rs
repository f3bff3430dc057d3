//! Detector mirror.
//!
//! Keeps the current view of detector objects whose interfaces intersect
//! the probe-interest set, and turns raw bus signals into coarse dirty
//! pulses. The snapshot is re-read in full with a managed-objects call at
//! every scan start, so a transport reconnect heals on the next pulse.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use entity_manager_bus::{BusEvent, DetectorBus};
use entity_manager_common::BusSnapshot;

use crate::error::Result;

pub struct DetectorMirror {
    bus: Arc<dyn DetectorBus>,
    interest: BTreeSet<String>,
    snapshot: BusSnapshot,
}

impl DetectorMirror {
    pub fn new(bus: Arc<dyn DetectorBus>, interest: BTreeSet<String>) -> Self {
        Self {
            bus,
            interest,
            snapshot: BusSnapshot::new(),
        }
    }

    /// Re-read all managed objects, keeping only objects that expose at
    /// least one probe-relevant interface.
    pub async fn refresh(&mut self) -> Result<()> {
        let raw = self.bus.managed_objects().await?;
        let mut filtered = BusSnapshot::new();
        for (service, objects) in raw {
            let relevant: std::collections::BTreeMap<_, _> = objects
                .into_iter()
                .filter(|(_, interfaces)| {
                    interfaces.keys().any(|iface| self.interest.contains(iface))
                })
                .collect();
            if !relevant.is_empty() {
                filtered.insert(service, relevant);
            }
        }
        debug!(
            services = filtered.len(),
            "Detector mirror refreshed"
        );
        self.snapshot = filtered;
        Ok(())
    }

    /// The current immutable view.
    pub fn snapshot(&self) -> &BusSnapshot {
        &self.snapshot
    }

    /// Watch bus signals, forwarding a dirty pulse for every event that
    /// may affect a probe.
    pub fn spawn_watcher(
        bus: Arc<dyn DetectorBus>,
        interest: BTreeSet<String>,
        dirty: mpsc::Sender<()>,
    ) -> JoinHandle<()> {
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if event_is_relevant(&event, &interest) {
                            trace!(?event, "Dirty pulse");
                            let _ = dirty.try_send(());
                        }
                    }
                    // Fell behind: something changed for sure.
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let _ = dirty.try_send(());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn event_is_relevant(event: &BusEvent, interest: &BTreeSet<String>) -> bool {
    match event {
        BusEvent::InterfacesAdded { interfaces, .. }
        | BusEvent::InterfacesRemoved { interfaces, .. } => {
            interfaces.iter().any(|iface| interest.contains(iface))
        }
        // Unique-name connections carry no probe-visible state.
        BusEvent::NameOwnerChanged { name, .. } => !name.starts_with(':'),
        BusEvent::PropertiesChanged { interface, .. } => interest.contains(interface),
    }
}

//! In-memory detector bus.
//!
//! Implements [`DetectorBus`] against a process-local object store so the
//! engine can run without a wire transport: integration tests drive it
//! directly, and transport-less deployments use it as a stand-in until a
//! real connection is wired up.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::broadcast;

use entity_manager_common::{BusSnapshot, InterfaceMap, PropertyValue};

use crate::client::DetectorBus;
use crate::error::{Error, Result};
use crate::events::BusEvent;

/// A recorded property write, for assertions on write-back behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyWrite {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub property: String,
    pub value: PropertyValue,
}

/// Process-local implementation of the detector side of the bus.
pub struct MemoryBus {
    objects: RwLock<BusSnapshot>,
    associations: RwLock<HashMap<String, Vec<String>>>,
    writes: RwLock<Vec<PropertyWrite>>,
    events: broadcast::Sender<BusEvent>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            objects: RwLock::new(BusSnapshot::new()),
            associations: RwLock::new(HashMap::new()),
            writes: RwLock::new(Vec::new()),
            events,
        }
    }

    fn emit(&self, event: BusEvent) {
        // No subscribers is fine; the engine may not be up yet.
        let _ = self.events.send(event);
    }

    /// Publish an object with its interfaces under a service, signalling
    /// `InterfacesAdded`.
    pub fn add_object(&self, service: &str, path: &str, interfaces: InterfaceMap) {
        let names: Vec<String> = interfaces.keys().cloned().collect();
        self.objects
            .write()
            .unwrap()
            .entry(service.to_string())
            .or_default()
            .insert(path.to_string(), interfaces);
        self.emit(BusEvent::InterfacesAdded {
            path: path.to_string(),
            interfaces: names,
        });
    }

    /// Remove an object, signalling `InterfacesRemoved`.
    pub fn remove_object(&self, service: &str, path: &str) {
        let removed = self
            .objects
            .write()
            .unwrap()
            .get_mut(service)
            .and_then(|paths| paths.remove(path));
        if let Some(interfaces) = removed {
            self.emit(BusEvent::InterfacesRemoved {
                path: path.to_string(),
                interfaces: interfaces.keys().cloned().collect(),
            });
        }
    }

    /// Drop a whole service, signalling `NameOwnerChanged` with an empty
    /// new owner.
    pub fn drop_service(&self, service: &str) {
        self.objects.write().unwrap().remove(service);
        self.emit(BusEvent::NameOwnerChanged {
            name: service.to_string(),
            old_owner: ":1.42".to_string(),
            new_owner: String::new(),
        });
    }

    /// Update one property on a stored object, signalling
    /// `PropertiesChanged`.
    pub fn update_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        property: &str,
        value: PropertyValue,
    ) {
        if let Some(props) = self
            .objects
            .write()
            .unwrap()
            .get_mut(service)
            .and_then(|paths| paths.get_mut(path))
            .and_then(|ifaces| ifaces.get_mut(interface))
        {
            props.insert(property.to_string(), value);
        }
        self.emit(BusEvent::PropertiesChanged {
            path: path.to_string(),
            interface: interface.to_string(),
        });
    }

    /// Register the endpoints an association object resolves to.
    pub fn set_association_endpoints(&self, path: &str, endpoints: Vec<String>) {
        self.associations
            .write()
            .unwrap()
            .insert(path.to_string(), endpoints);
    }

    /// All property writes issued through [`DetectorBus::set_property`].
    pub fn recorded_writes(&self) -> Vec<PropertyWrite> {
        self.writes.read().unwrap().clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DetectorBus for MemoryBus {
    async fn managed_objects(&self) -> Result<BusSnapshot> {
        Ok(self.objects.read().unwrap().clone())
    }

    async fn set_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        property: &str,
        value: PropertyValue,
    ) -> Result<()> {
        let exists = self
            .objects
            .read()
            .unwrap()
            .get(service)
            .and_then(|paths| paths.get(path))
            .map(|ifaces| ifaces.contains_key(interface))
            .unwrap_or(false);
        if !exists {
            return Err(Error::Transport(format!(
                "No object {} {} {}",
                service, path, interface
            )));
        }

        self.writes.write().unwrap().push(PropertyWrite {
            service: service.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            property: property.to_string(),
            value: value.clone(),
        });
        self.update_property(service, path, interface, property, value);
        Ok(())
    }

    async fn association_endpoints(&self, path: &str) -> Result<Vec<String>> {
        self.associations
            .read()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("No associated paths found for {}", path)))
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }
}

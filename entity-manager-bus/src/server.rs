//! In-process object server.
//!
//! The server owns the strong references to every published interface and
//! hands out `Arc` handles; the daemon keeps only weak handles in its
//! inventory map so that expired slots can be detected and reused. Method
//! calls and property writes are not executed here: they are routed as
//! [`BusRequest`]s to the engine task, which serializes them behind the
//! same scheduler as scan work.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, oneshot};

use entity_manager_common::{PropertyMap, PropertyValue};

use crate::error::BusFault;

/// Write access of a published property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// A property published on a [`BusInterface`].
#[derive(Debug, Clone)]
pub struct BusProperty {
    pub value: PropertyValue,
    pub access: Access,
    /// JSON pointer into the persisted system configuration backing this
    /// property, when it is configuration-owned.
    pub config_pointer: Option<String>,
}

/// One published interface on one object path.
#[derive(Debug)]
pub struct BusInterface {
    path: String,
    name: String,
    properties: RwLock<BTreeMap<String, BusProperty>>,
    methods: RwLock<BTreeSet<String>>,
    config_pointer: RwLock<Option<String>>,
}

impl BusInterface {
    fn new(path: &str, name: &str) -> Self {
        Self {
            path: path.to_string(),
            name: name.to_string(),
            properties: RwLock::new(BTreeMap::new()),
            methods: RwLock::new(BTreeSet::new()),
            config_pointer: RwLock::new(None),
        }
    }

    /// Object path this interface is published on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a property.
    pub fn register_property(
        &self,
        property: impl Into<String>,
        value: PropertyValue,
        access: Access,
        config_pointer: Option<String>,
    ) {
        self.properties.write().unwrap().insert(
            property.into(),
            BusProperty {
                value,
                access,
                config_pointer,
            },
        );
    }

    /// Publish a method by name. Invocations are routed to the engine.
    pub fn register_method(&self, method: impl Into<String>) {
        self.methods.write().unwrap().insert(method.into());
    }

    /// Look up one property.
    pub fn property(&self, property: &str) -> Option<BusProperty> {
        self.properties.read().unwrap().get(property).cloned()
    }

    /// Snapshot of all properties.
    pub fn properties(&self) -> BTreeMap<String, BusProperty> {
        self.properties.read().unwrap().clone()
    }

    /// Overwrite the stored value of an already-registered property.
    ///
    /// Used by the engine after a successful set; registration metadata is
    /// preserved.
    pub fn set_local(&self, property: &str, value: PropertyValue) {
        if let Some(prop) = self.properties.write().unwrap().get_mut(property) {
            prop.value = value;
        }
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.read().unwrap().contains(method)
    }

    /// Attach the JSON pointer of the configuration slot this whole
    /// interface projects (set for runtime-mutable interfaces, so Delete
    /// and AddObject can find their way back).
    pub fn set_config_pointer(&self, pointer: impl Into<String>) {
        *self.config_pointer.write().unwrap() = Some(pointer.into());
    }

    pub fn config_pointer(&self) -> Option<String> {
        self.config_pointer.read().unwrap().clone()
    }
}

/// A request routed from the bus boundary into the engine task.
#[derive(Debug)]
pub enum BusRequest {
    /// A method invocation on a published interface.
    MethodCall {
        path: String,
        interface: String,
        method: String,
        args: PropertyMap,
        reply: oneshot::Sender<Result<(), BusFault>>,
    },

    /// A property write on a published interface.
    SetProperty {
        path: String,
        interface: String,
        property: String,
        value: PropertyValue,
        reply: oneshot::Sender<Result<(), BusFault>>,
    },
}

/// Registry of everything this daemon publishes on the bus.
#[derive(Clone)]
pub struct ObjectServer {
    objects: Arc<RwLock<HashMap<String, BTreeMap<String, Arc<BusInterface>>>>>,
    requests: mpsc::Sender<BusRequest>,
}

impl ObjectServer {
    /// Create a server and the request stream its callers are routed to.
    pub fn new() -> (Self, mpsc::Receiver<BusRequest>) {
        let (tx, rx) = mpsc::channel(32);
        (
            Self {
                objects: Arc::new(RwLock::new(HashMap::new())),
                requests: tx,
            },
            rx,
        )
    }

    /// Publish an interface on a path, replacing any previous interface of
    /// the same name there.
    pub fn add_interface(&self, path: &str, name: &str) -> Arc<BusInterface> {
        let iface = Arc::new(BusInterface::new(path, name));
        self.objects
            .write()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .insert(name.to_string(), iface.clone());
        iface
    }

    /// Remove a published interface. A handle that is no longer the
    /// registered one (already replaced) is left alone.
    pub fn remove_interface(&self, iface: &Arc<BusInterface>) {
        let mut objects = self.objects.write().unwrap();
        if let Some(ifaces) = objects.get_mut(iface.path()) {
            if ifaces
                .get(iface.name())
                .is_some_and(|current| Arc::ptr_eq(current, iface))
            {
                ifaces.remove(iface.name());
            }
            if ifaces.is_empty() {
                objects.remove(iface.path());
            }
        }
    }

    /// Look up a published interface.
    pub fn lookup(&self, path: &str, name: &str) -> Option<Arc<BusInterface>> {
        self.objects.read().unwrap().get(path)?.get(name).cloned()
    }

    /// Total number of published interfaces.
    pub fn interface_count(&self) -> usize {
        self.objects
            .read()
            .unwrap()
            .values()
            .map(|ifaces| ifaces.len())
            .sum()
    }

    /// Flattened view of everything published: path → interface →
    /// property → value. Used by the transport layer and by tests.
    pub fn published(&self) -> BTreeMap<String, BTreeMap<String, BTreeMap<String, PropertyValue>>> {
        self.objects
            .read()
            .unwrap()
            .iter()
            .map(|(path, ifaces)| {
                (
                    path.clone(),
                    ifaces
                        .iter()
                        .map(|(name, iface)| {
                            (
                                name.clone(),
                                iface
                                    .properties()
                                    .into_iter()
                                    .map(|(prop, p)| (prop, p.value))
                                    .collect(),
                            )
                        })
                        .collect(),
                )
            })
            .collect()
    }

    /// Invoke a method on a published interface and wait for the engine to
    /// run it to completion.
    pub async fn call_method(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: PropertyMap,
    ) -> Result<(), BusFault> {
        let iface = self
            .lookup(path, interface)
            .ok_or_else(|| BusFault::invalid(format!("No interface {} on {}", interface, path)))?;
        if !iface.has_method(method) {
            return Err(BusFault::invalid(format!(
                "No method {} on {}",
                method, interface
            )));
        }

        let (reply, response) = oneshot::channel();
        self.requests
            .send(BusRequest::MethodCall {
                path: path.to_string(),
                interface: interface.to_string(),
                method: method.to_string(),
                args,
                reply,
            })
            .await
            .map_err(|_| BusFault::internal("engine unavailable"))?;
        response
            .await
            .map_err(|_| BusFault::internal("engine dropped request"))?
    }

    /// Write a property on a published interface and wait for the engine
    /// to run the mutation (including any detector write-back) to
    /// completion.
    pub async fn set_property(
        &self,
        path: &str,
        interface: &str,
        property: &str,
        value: PropertyValue,
    ) -> Result<(), BusFault> {
        let iface = self
            .lookup(path, interface)
            .ok_or_else(|| BusFault::invalid(format!("No interface {} on {}", interface, path)))?;
        match iface.property(property) {
            None => {
                return Err(BusFault::invalid(format!(
                    "No property {} on {}",
                    property, interface
                )));
            }
            Some(prop) if prop.access == Access::ReadOnly => {
                return Err(BusFault::invalid(format!(
                    "Property {} is read-only",
                    property
                )));
            }
            Some(_) => {}
        }

        let (reply, response) = oneshot::channel();
        self.requests
            .send(BusRequest::SetProperty {
                path: path.to_string(),
                interface: interface.to_string(),
                property: property.to_string(),
                value,
                reply,
            })
            .await
            .map_err(|_| BusFault::internal("engine unavailable"))?;
        response
            .await
            .map_err(|_| BusFault::internal("engine dropped request"))?
    }
}

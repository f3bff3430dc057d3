//! Engine wiring and the command loop.
//!
//! All mutable state (the system configuration, the inventory map, the
//! power-gate latch, the rescan latch) hangs off [`EntityManager`] and
//! is touched only from its single task. Bus method calls and property
//! writes arrive as [`BusRequest`]s and are serialized behind the same
//! loop as scan work, so callers observe their mutation completed
//! (detector write-back included) when the call returns.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use entity_manager_bus::{BusFault, BusRequest, DetectorBus, ObjectServer};
use entity_manager_common::{EmConfig, PropertyMap, PropertyValue};

use crate::debounce::Debounce;
use crate::error::Result;
use crate::mirror::DetectorMirror;
use crate::persist;
use crate::power::{self, PowerGate};
use crate::projector::{
    self, ADD_OBJECT_IFACE, ENTITY_MANAGER_IFACE, ENTITY_MANAGER_PATH, FRU_IFACE, FRU_SERVICE,
    PROBE_FORWARD, Projector, pointer_unescape,
};
use crate::scan;
use crate::schema::SchemaStore;
use crate::templates::TemplateStore;

pub struct EntityManager {
    config: EmConfig,
    bus: Arc<dyn DetectorBus>,
    server: ObjectServer,
    requests: mpsc::Receiver<BusRequest>,
    dirty_tx: mpsc::Sender<()>,
    dirty_rx: mpsc::Receiver<()>,
    mirror: DetectorMirror,
    templates: TemplateStore,
    schemas: SchemaStore,
    projector: Projector,
    system: Map<String, Value>,
    last_seen: Map<String, Value>,
    gate: PowerGate,
    debounce: Debounce,
    epoch: watch::Sender<u64>,
    watcher: JoinHandle<()>,
}

impl EntityManager {
    /// Assemble the engine. Must run inside a Tokio runtime (spawns the
    /// signal watcher and the power gate). Fails only when the global
    /// schema is unusable.
    pub fn new(
        config: EmConfig,
        bus: Arc<dyn DetectorBus>,
        power: watch::Receiver<bool>,
    ) -> Result<Self> {
        let schemas = SchemaStore::load(&config.paths.schema_dir)?;

        let templates = match TemplateStore::load(
            &config.paths.config_dir,
            &config.paths.host_config_dir,
            Some(&schemas),
        ) {
            Ok(templates) => templates,
            Err(e) => {
                warn!(error = %e, "Could not load configurations");
                TemplateStore::empty()
            }
        };
        let interest = templates.probe_interfaces().clone();

        let (server, requests) = ObjectServer::new();
        let manager = server.add_interface(ENTITY_MANAGER_PATH, ENTITY_MANAGER_IFACE);
        manager.register_method("ReScan");

        let (dirty_tx, dirty_rx) = mpsc::channel(16);
        let watcher = DetectorMirror::spawn_watcher(bus.clone(), interest.clone(), dirty_tx.clone());
        let mirror = DetectorMirror::new(bus.clone(), interest);

        let last_seen = persist::load_last_configuration(&config.paths);
        let gate = PowerGate::spawn(
            power,
            Duration::from_secs(config.timing.settle_secs),
            dirty_tx.clone(),
        );
        let debounce = Debounce::new(Duration::from_secs(config.timing.debounce_secs));
        let projector = Projector::new(server.clone());
        let (epoch, _) = watch::channel(0u64);

        // Initial scan, through the normal debounce path.
        let _ = dirty_tx.try_send(());

        Ok(Self {
            config,
            bus,
            server,
            requests,
            dirty_tx,
            dirty_rx,
            mirror,
            templates,
            schemas,
            projector,
            system: Map::new(),
            last_seen,
            gate,
            debounce,
            epoch,
            watcher,
        })
    }

    /// Handle to the object server, for the transport layer and tests.
    pub fn server(&self) -> ObjectServer {
        self.server.clone()
    }

    /// Completed-scan counter; changes after each scan has been projected.
    pub fn scan_epochs(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    /// Run until Ctrl+C.
    pub async fn run(mut self) -> Result<()> {
        info!("Entity manager running");
        loop {
            tokio::select! {
                _ = self.debounce.expired() => {
                    self.scan_cycle().await;
                }
                pulse = self.dirty_rx.recv() => match pulse {
                    Some(()) => self.debounce.poke(),
                    None => break,
                },
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                _ = signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }
        self.watcher.abort();
        info!("Goodbye!");
        Ok(())
    }

    /// One full scan: snapshot, reconcile, prune, persist, project.
    async fn scan_cycle(&mut self) {
        if self.templates.is_empty() {
            warn!("No templates available, skipping scan");
            return;
        }
        if let Err(e) = self.mirror.refresh().await {
            error!(error = %e, "Unable to read detectors, waiting for the next change");
            return;
        }

        let mut outcome = scan::run_scan(
            &self.templates,
            self.mirror.snapshot(),
            &self.system,
            &self.last_seen,
        );

        for (id, entity) in &outcome.missing {
            if self.gate.may_prune(power::requires_power_on(entity)) {
                self.projector.prune(id, entity);
            } else {
                // Power not seen on yet: absence is not authoritative.
                outcome.configuration.insert(id.clone(), entity.clone());
            }
        }
        self.system = outcome.configuration;

        // Snapshot write-out first, bus mutation second: the persisted
        // file always reflects exactly what is being published.
        if let Err(e) = persist::write_system_configuration(
            &self.config.paths.current_configuration,
            &self.system,
        ) {
            error!(error = %e, "Error writing system configuration");
        }
        self.projector.project(&self.system);

        for id in &outcome.added {
            if let Some(entity) = self.system.get(id) {
                projector::log_device_added(entity);
            }
        }

        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    async fn handle_request(&mut self, request: BusRequest) {
        match request {
            BusRequest::MethodCall {
                path,
                interface,
                method,
                args,
                reply,
            } => {
                let result = self.handle_method(&path, &interface, &method, args).await;
                let _ = reply.send(result);
            }
            BusRequest::SetProperty {
                path,
                interface,
                property,
                value,
                reply,
            } => {
                let result = self.handle_set(&path, &interface, &property, value).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_method(
        &mut self,
        path: &str,
        interface: &str,
        method: &str,
        args: PropertyMap,
    ) -> std::result::Result<(), BusFault> {
        match (interface, method) {
            (ENTITY_MANAGER_IFACE, "ReScan") if path == ENTITY_MANAGER_PATH => {
                let _ = self.dirty_tx.try_send(());
                Ok(())
            }
            (ADD_OBJECT_IFACE, "AddObject") => self.handle_add_object(path, args).await,
            (_, "Delete") => self.handle_delete(path, interface).await,
            _ => Err(BusFault::invalid(format!(
                "No handler for {}.{}",
                interface, method
            ))),
        }
    }

    async fn handle_add_object(
        &mut self,
        path: &str,
        args: PropertyMap,
    ) -> std::result::Result<(), BusFault> {
        let iface = self
            .server
            .lookup(path, ADD_OBJECT_IFACE)
            .ok_or_else(|| BusFault::internal("AddObject interface vanished"))?;
        let pointer = iface
            .config_pointer()
            .ok_or_else(|| BusFault::internal("AddObject without configuration slot"))?;
        let record_id = pointer_unescape(pointer.trim_start_matches('/'));

        let mut new_data = Map::new();
        for (key, value) in args {
            new_data.insert(key, value.to_json());
        }
        let name = new_data
            .get("Name")
            .cloned()
            .ok_or_else(|| BusFault::invalid("AddObject missing Name or Type"))?;
        let object_type = new_data
            .get("Type")
            .cloned()
            .ok_or_else(|| BusFault::invalid("AddObject missing Name or Type"))?;
        let (Some(_), Some(object_type)) = (name.as_str(), object_type.as_str()) else {
            return Err(BusFault::invalid("Type and Name must be a string."));
        };

        // Duplicate check and first reusable (nulled) slot.
        let insert_at = {
            let exposes = self
                .system
                .get(&record_id)
                .and_then(|entity| entity.get("Exposes"))
                .and_then(Value::as_array)
                .ok_or_else(|| BusFault::invalid("Entity must have children."))?;
            let mut slot = None;
            for (index, expose) in exposes.iter().enumerate() {
                if expose.is_null() {
                    slot.get_or_insert(index);
                    continue;
                }
                if expose.get("Name") == Some(&name)
                    && expose.get("Type") == new_data.get("Type")
                {
                    return Err(BusFault::invalid("Field already in JSON, not adding"));
                }
            }
            slot.unwrap_or(exposes.len())
        };

        let item = Value::Object(new_data);
        self.schemas.validate_for_type(object_type, &item)?;

        {
            let exposes = self
                .system
                .get_mut(&record_id)
                .and_then(|entity| entity.get_mut("Exposes"))
                .and_then(Value::as_array_mut)
                .ok_or_else(|| BusFault::internal("Exposes vanished"))?;
            if insert_at < exposes.len() {
                exposes[insert_at] = item.clone();
            } else {
                exposes.push(item.clone());
            }
        }

        persist::write_system_configuration(
            &self.config.paths.current_configuration,
            &self.system,
        )
        .map_err(|e| {
            error!(error = %e, "Error writing json files");
            BusFault::internal("error writing json files")
        })?;

        self.projector
            .publish_runtime_expose(&record_id, path, &pointer, insert_at, &item);
        Ok(())
    }

    async fn handle_delete(
        &mut self,
        path: &str,
        interface: &str,
    ) -> std::result::Result<(), BusFault> {
        let iface = self
            .server
            .lookup(path, interface)
            .ok_or_else(|| BusFault::internal("interface vanished"))?;
        let pointer = iface
            .config_pointer()
            .ok_or_else(|| BusFault::internal("interface has no configuration slot"))?;

        match config_pointer_mut(&mut self.system, &pointer) {
            Some(slot) => *slot = Value::Null,
            None => return Err(BusFault::internal("configuration slot vanished")),
        }

        persist::write_system_configuration(
            &self.config.paths.current_configuration,
            &self.system,
        )
        .map_err(|e| {
            error!(error = %e, "Error writing json files");
            BusFault::internal("error writing json files")
        })?;

        // Removal happens after the method call returns.
        let server = self.server.clone();
        tokio::spawn(async move {
            server.remove_interface(&iface);
        });
        Ok(())
    }

    async fn handle_set(
        &mut self,
        path: &str,
        interface: &str,
        property: &str,
        value: PropertyValue,
    ) -> std::result::Result<(), BusFault> {
        let iface = self
            .server
            .lookup(path, interface)
            .ok_or_else(|| BusFault::internal("interface vanished"))?;
        let registered = iface
            .property(property)
            .ok_or_else(|| BusFault::internal("property vanished"))?;

        let Some(pointer) = registered.config_pointer else {
            // Not configuration-owned (e.g. associations): local only.
            iface.set_local(property, value);
            return Ok(());
        };

        let segments: Vec<String> = pointer
            .split('/')
            .skip(1)
            .map(|s| pointer_unescape(s))
            .collect();
        if let [record, iface_key, prop_key] = segments.as_slice() {
            let source_field = self
                .projector
                .board_name(record)
                .and_then(|name| self.templates.property_mapping(name))
                .and_then(|mapping| mapping.get(iface_key))
                .and_then(|properties| properties.get(prop_key))
                .cloned();
            if let Some(source_field) = source_field {
                // The value lives on the detector; write it back there
                // and let the next scan re-read it.
                return self.write_back(path, &source_field, value).await;
            }
        }

        match config_pointer_mut(&mut self.system, &pointer) {
            Some(slot) => *slot = value.to_json(),
            None => {
                error!(pointer = %pointer, "Error setting json field");
                return Err(BusFault::internal("error setting json field"));
            }
        }
        persist::write_system_configuration(
            &self.config.paths.current_configuration,
            &self.system,
        )
        .map_err(|e| {
            error!(error = %e, "Error setting json file");
            BusFault::internal("error setting json file")
        })?;
        iface.set_local(property, value);
        Ok(())
    }

    /// Push a mapped property to the detector that sourced it, via the
    /// probe association's endpoints.
    async fn write_back(
        &mut self,
        entity_path: &str,
        source_field: &str,
        value: PropertyValue,
    ) -> std::result::Result<(), BusFault> {
        let association_path = format!("{}/{}", entity_path, PROBE_FORWARD);
        let endpoints = match self.bus.association_endpoints(&association_path).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                error!(path = %association_path, error = %e, "No associated paths found");
                return Ok(());
            }
        };
        for endpoint in endpoints {
            if let Err(e) = self
                .bus
                .set_property(FRU_SERVICE, &endpoint, FRU_IFACE, source_field, value.clone())
                .await
            {
                error!(
                    endpoint = %endpoint,
                    property = %source_field,
                    error = %e,
                    "Error setting property on detector"
                );
            }
        }
        Ok(())
    }
}

/// Walk a JSON pointer through the system configuration.
fn config_pointer_mut<'a>(
    system: &'a mut Map<String, Value>,
    pointer: &str,
) -> Option<&'a mut Value> {
    let mut segments = pointer.split('/').skip(1).map(pointer_unescape);
    let first = segments.next()?;
    let mut current = system.get_mut(&first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get_mut(&segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

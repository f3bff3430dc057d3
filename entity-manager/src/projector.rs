//! Bus projection of the system configuration.
//!
//! Every entity becomes one inventory object with its item interfaces,
//! one interface per interface-shaped body key, the `AddObject` method,
//! `Delete` on runtime-writable interfaces, and the association graph.
//! The projector keeps only weak handles to what it publishes; the
//! object server owns the strong references, so expired slots mark
//! removed objects and are reused instead of growing the inventory map.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Weak;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{info, warn};

use entity_manager_bus::{Access, BusInterface, ObjectServer};
use entity_manager_common::PropertyValue;

use crate::topology::{Association, Topology};

pub const ENTITY_MANAGER_SERVICE: &str = "xyz.openbmc_project.EntityManager";
pub const ENTITY_MANAGER_PATH: &str = "/xyz/openbmc_project/EntityManager";
pub const ENTITY_MANAGER_IFACE: &str = "xyz.openbmc_project.EntityManager";
pub const INVENTORY_ROOT: &str = "/xyz/openbmc_project/inventory";
pub const CONFIGURATION_PREFIX: &str = "xyz.openbmc_project.Configuration.";
pub const ADD_OBJECT_IFACE: &str = "xyz.openbmc_project.AddObject";
pub const ASSOCIATION_IFACE: &str = "xyz.openbmc_project.Association.Definitions";
const ITEM_IFACE: &str = "xyz.openbmc_project.Inventory.Item";
const ITEM_IFACE_PREFIX: &str = "xyz.openbmc_project.Inventory.Item.";

pub const FRU_SERVICE: &str = "xyz.openbmc_project.FruDevice";
pub const FRU_IFACE: &str = "xyz.openbmc_project.FruDevice";
/// Forward/reverse names of the association linking an entity back to the
/// detector that matched it.
pub const PROBE_FORWARD: &str = "fruDevice";
const PROBE_REVERSE: &str = "allFru";

/// Interfaces whose properties are writable at all; everything else is
/// read-only regardless of template body.
const SETTABLE_INTERFACES: [&str; 10] = [
    "FanProfile",
    "Pid",
    "Pid.Zone",
    "Stepwise",
    "Thresholds",
    "Polling",
    "VoltageLeakDetector",
    "xyz.openbmc_project.Inventory.Decorator.AssetTag",
    "xyz.openbmc_project.Inventory.Decorator.Asset",
    "xyz.openbmc_project.Common.UUID",
];

static ILLEGAL_MEMBER: Lazy<Regex> = Lazy::new(|| Regex::new("[^A-Za-z0-9_]").unwrap());
static ILLEGAL_PATH: Lazy<Regex> = Lazy::new(|| Regex::new("[^A-Za-z0-9_.]").unwrap());

/// Sanitize a bus member name.
pub fn sanitize_member(name: &str) -> String {
    ILLEGAL_MEMBER.replace_all(name, "_").into_owned()
}

fn sanitize_path_segment(name: &str) -> String {
    ILLEGAL_PATH.replace_all(name, "_").into_owned()
}

fn permission(name: &str) -> Access {
    if SETTABLE_INTERFACES.contains(&name) {
        Access::ReadWrite
    } else {
        Access::ReadOnly
    }
}

/// The entity's sanitized type, defaulting to Chassis.
pub fn board_type(entity: &Value) -> String {
    match entity.get("Type").and_then(Value::as_str) {
        Some(board_type) => sanitize_member(board_type),
        None => "Chassis".to_string(),
    }
}

/// The path leaf of a board: its substituted name, sanitized unless the
/// template opted into a custom name.
pub fn board_dbus_name(entity: &Value) -> String {
    let name = entity
        .get("Name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if entity.get("Custom_Name").and_then(Value::as_bool) == Some(true) {
        name.to_string()
    } else {
        sanitize_member(name)
    }
}

/// The bus path an entity is published on.
pub fn entity_path(entity: &Value) -> String {
    format!(
        "{}/system/{}/{}",
        INVENTORY_ROOT,
        board_type(entity).to_lowercase(),
        board_dbus_name(entity)
    )
}

/// Escape one JSON-pointer segment.
pub fn pointer_escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Unescape one JSON-pointer segment.
pub fn pointer_unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

pub struct Projector {
    server: ObjectServer,
    /// Entity id → weak handles to everything published on its behalf.
    inventory: HashMap<String, Vec<Weak<BusInterface>>>,
    /// Entity id → board name, for resolving write-back mappings.
    records: HashMap<String, String>,
    /// Configuration pointers of exposes added at runtime; they stay
    /// writable across reprojection.
    runtime_writable: HashSet<String>,
    topology: Topology,
}

impl Projector {
    pub fn new(server: ObjectServer) -> Self {
        Self {
            server,
            inventory: HashMap::new(),
            records: HashMap::new(),
            runtime_writable: HashSet::new(),
            topology: Topology::new(),
        }
    }

    /// The board name of a published record.
    pub fn board_name(&self, record_id: &str) -> Option<&String> {
        self.records.get(record_id)
    }

    /// Create an interface, reusing an expired weak slot of this entity
    /// when one exists.
    fn create_interface(
        &mut self,
        path: &str,
        interface: &str,
        record_id: &str,
    ) -> std::sync::Arc<BusInterface> {
        let iface = self.server.add_interface(path, interface);
        let slots = self.inventory.entry(record_id.to_string()).or_default();
        match slots.iter_mut().find(|slot| slot.upgrade().is_none()) {
            Some(slot) => *slot = std::sync::Arc::downgrade(&iface),
            None => slots.push(std::sync::Arc::downgrade(&iface)),
        }
        iface
    }

    /// Publish the simple leaves of a JSON block as interface properties.
    ///
    /// Nested objects are handled by the caller as their own interfaces;
    /// mixed-type arrays have no bus form and are skipped with a log.
    /// Writable interfaces get their numerics widened to double and a
    /// `Delete` method.
    fn populate_interface(
        &self,
        iface: &BusInterface,
        block: &Value,
        pointer: &str,
        access: Access,
    ) {
        let Some(object) = block.as_object() else {
            return;
        };
        for (key, value) in object {
            if key == "Parent_Chassis" || key == ASSOCIATION_IFACE {
                continue;
            }
            if value.is_object() || value.is_null() {
                continue;
            }
            if let Some(items) = value.as_array() {
                if items.is_empty() || items[0].is_object() {
                    continue;
                }
            }
            let Some(value) = PropertyValue::from_json(value) else {
                warn!(property = %key, "Bus format error, skipping property");
                continue;
            };
            let value = match access {
                Access::ReadWrite => value.promote_to_double(),
                Access::ReadOnly => value,
            };
            let prop_pointer = format!("{}/{}", pointer, pointer_escape(key));
            iface.register_property(key.clone(), value, access, Some(prop_pointer));
        }
        if access == Access::ReadWrite {
            iface.register_method("Delete");
            iface.set_config_pointer(pointer);
        }
    }

    /// Project the whole system configuration onto the bus.
    ///
    /// Idempotent: projecting the same configuration again replaces each
    /// published slot with an identical one and adds nothing.
    pub fn project(&mut self, configuration: &Map<String, Value>) {
        self.topology.clear();
        self.records.clear();

        let mut new_boards: BTreeMap<String, String> = BTreeMap::new();
        let mut board_records: BTreeMap<String, String> = BTreeMap::new();
        let mut board_associations: BTreeMap<String, Vec<Association>> = BTreeMap::new();

        for (record_id, entity) in configuration {
            let Some(name) = entity.get("Name").and_then(Value::as_str) else {
                warn!(record = %record_id, "Entity without a Name, not publishing");
                continue;
            };
            self.records.insert(record_id.clone(), name.to_string());

            let board_type = board_type(entity);
            let board_iface_name = format!("{}{}", ITEM_IFACE_PREFIX, board_type);
            let path = entity_path(entity);
            let pointer = format!("/{}", pointer_escape(record_id));

            self.create_interface(&path, ITEM_IFACE, record_id);

            // A body block keyed exactly as the board item interface
            // decorates the board's top level.
            let mut board_values = entity.clone();
            if let Some(block) = entity.get(&board_iface_name).and_then(Value::as_object) {
                for (key, value) in block {
                    board_values[key.as_str()] = value.clone();
                }
            }
            let board_iface = self.create_interface(&path, &board_iface_name, record_id);
            self.populate_interface(&board_iface, &board_values, &pointer, Access::ReadOnly);

            let add_iface = self.create_interface(&path, ADD_OBJECT_IFACE, record_id);
            add_iface.register_method("AddObject");
            add_iface.set_config_pointer(&pointer);

            let mut associations: Vec<Association> = Vec::new();
            if let Some(parent) = board_values.get("Parent_Chassis").and_then(Value::as_str) {
                associations.push((
                    "parent_chassis".to_string(),
                    "all_chassis".to_string(),
                    parent.to_string(),
                ));
            }

            if let Some(board_object) = board_values.as_object() {
                for (prop_name, prop_value) in board_object {
                    if let Some(block) = prop_value.as_object() {
                        if prop_name == ASSOCIATION_IFACE {
                            collect_explicit_associations(block, &mut associations);
                        } else if prop_name != &board_iface_name {
                            let iface = self.create_interface(&path, prop_name, record_id);
                            let block_pointer =
                                format!("{}/{}", pointer, pointer_escape(prop_name));
                            self.populate_interface(
                                &iface,
                                prop_value,
                                &block_pointer,
                                permission(prop_name),
                            );
                        }
                    }
                    if prop_name == "ProbePath" {
                        if let Some(probe_path) = prop_value.as_str() {
                            associations.push((
                                PROBE_FORWARD.to_string(),
                                PROBE_REVERSE.to_string(),
                                probe_path.to_string(),
                            ));
                        }
                    }
                }
            }

            if let Some(exposes) = entity.get("Exposes").and_then(Value::as_array) {
                for (index, item) in exposes.iter().enumerate() {
                    if item.is_null() {
                        // Deleted at runtime; the slot stays for reuse.
                        continue;
                    }
                    if item.get("Status").and_then(Value::as_str) == Some("disabled") {
                        continue;
                    }
                    self.project_expose(record_id, &path, &pointer, index, item);
                    self.topology.add_board(&path, item);
                }
            }

            new_boards.insert(path.clone(), name.to_string());
            board_records.insert(path.clone(), record_id.clone());
            board_associations.insert(path, associations);
        }

        for (path, edges) in self.topology.associations(&new_boards) {
            board_associations.entry(path).or_default().extend(edges);
        }

        for (path, associations) in board_associations {
            if associations.is_empty() {
                continue;
            }
            let record_id = board_records[&path].clone();
            let iface = self.create_interface(&path, ASSOCIATION_IFACE, &record_id);
            iface.register_property(
                "Associations",
                PropertyValue::AssociationArray(associations),
                Access::ReadWrite,
                None,
            );
        }
    }

    /// Publish one exposed sub-entity and its nested sub-interfaces.
    fn project_expose(
        &mut self,
        record_id: &str,
        board_path: &str,
        board_pointer: &str,
        index: usize,
        item: &Value,
    ) {
        let Some(item_name) = item.get("Name").and_then(Value::as_str) else {
            warn!(record = %record_id, "Cannot find name in exposed field");
            return;
        };
        if item.get("Status").and_then(Value::as_str) == Some("disabled") {
            return;
        }
        let item_type = item
            .get("Type")
            .and_then(Value::as_str)
            .map(sanitize_path_segment)
            .unwrap_or_else(|| "unknown".to_string());

        let expose_pointer = format!("{}/Exposes/{}", board_pointer, index);
        let iface_path = format!("{}/{}", board_path, sanitize_member(item_name));
        let access = if self.runtime_writable.contains(&expose_pointer) {
            Access::ReadWrite
        } else {
            permission(&item_type)
        };

        // BMC and system items double as inventory items.
        if item_type == "BMC" {
            let bmc = self.create_interface(
                &iface_path,
                "xyz.openbmc_project.Inventory.Item.Bmc",
                record_id,
            );
            self.populate_interface(&bmc, item, &expose_pointer, access);
        } else if item_type == "System" {
            let system = self.create_interface(
                &iface_path,
                "xyz.openbmc_project.Inventory.Item.System",
                record_id,
            );
            self.populate_interface(&system, item, &expose_pointer, access);
        }

        let iface_name = format!("{}{}", CONFIGURATION_PREFIX, item_type);
        let item_iface = self.create_interface(&iface_path, &iface_name, record_id);
        self.populate_interface(&item_iface, item, &expose_pointer, access);

        let Some(object) = item.as_object() else {
            return;
        };
        for (key, nested) in object {
            let nested_pointer = format!("{}/{}", expose_pointer, pointer_escape(key));
            match nested {
                Value::Object(_) => {
                    let name = format!("{}.{}", iface_name, key);
                    let iface = self.create_interface(&iface_path, &name, record_id);
                    self.populate_interface(&iface, nested, &nested_pointer, permission(key));
                }
                Value::Array(elements) => {
                    if elements.is_empty() || !elements[0].is_object() {
                        continue;
                    }
                    if !elements.iter().all(Value::is_object) {
                        warn!(property = %key, "Bus format error, skipping array");
                        continue;
                    }
                    for (i, element) in elements.iter().enumerate() {
                        let name = format!("{}.{}{}", iface_name, key, i);
                        let iface = self.create_interface(&iface_path, &name, record_id);
                        self.populate_interface(
                            &iface,
                            element,
                            &format!("{}/{}", nested_pointer, i),
                            permission(key),
                        );
                    }
                }
                _ => {}
            }
        }
    }

    /// Publish an expose added at runtime through AddObject. It is
    /// writable by construction and stays so across reprojection.
    pub fn publish_runtime_expose(
        &mut self,
        record_id: &str,
        board_path: &str,
        board_pointer: &str,
        index: usize,
        item: &Value,
    ) {
        let expose_pointer = format!("{}/Exposes/{}", board_pointer, index);
        self.runtime_writable.insert(expose_pointer);
        self.project_expose(record_id, board_path, board_pointer, index, item);
    }

    /// Remove everything published for an entity.
    ///
    /// Safe to call standalone: the projector's own state (inventory
    /// slots, topology, records, writable pointers) is left consistent
    /// without a following [`project`](Self::project).
    pub fn prune(&mut self, record_id: &str, entity: &Value) {
        if let Some(slots) = self.inventory.remove(record_id) {
            for slot in slots {
                if let Some(iface) = slot.upgrade() {
                    self.server.remove_interface(&iface);
                }
            }
        }
        // The scan path reprojects right after pruning and project()
        // rebuilds the topology from scratch; this removal is for the
        // standalone case above.
        self.topology.remove(&entity_path(entity));
        let prefix = format!("/{}/", pointer_escape(record_id));
        self.runtime_writable.retain(|p| !p.starts_with(&prefix));
        self.records.remove(record_id);
        log_device_removed(entity);
    }

    /// Number of live published slots of an entity; expired slots do not
    /// count.
    pub fn live_slots(&self, record_id: &str) -> usize {
        self.inventory
            .get(record_id)
            .map(|slots| slots.iter().filter(|s| s.upgrade().is_some()).count())
            .unwrap_or(0)
    }

    /// Total slots (live and expired) of an entity, for growth checks.
    pub fn total_slots(&self, record_id: &str) -> usize {
        self.inventory
            .get(record_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

fn collect_explicit_associations(
    block: &Map<String, Value>,
    associations: &mut Vec<Association>,
) {
    let Some(items) = block.get("Associations").and_then(Value::as_array) else {
        return;
    };
    for entry in items {
        let triple = entry.as_array().and_then(|a| {
            if a.len() == 3 {
                Some((
                    a[0].as_str()?.to_string(),
                    a[1].as_str()?.to_string(),
                    a[2].as_str()?.to_string(),
                ))
            } else {
                None
            }
        });
        match triple {
            Some(triple) => associations.push(triple),
            None => warn!("Association requires {{forward, backward, path}}"),
        }
    }
}

/// Journal record for a new inventory item.
pub fn log_device_added(entity: &Value) {
    info!(
        name = entity.get("Name").and_then(serde_json::Value::as_str).unwrap_or("?"),
        kind = %board_type(entity),
        "Inventory item added"
    );
}

/// Journal record for a removed inventory item.
pub fn log_device_removed(entity: &Value) {
    info!(
        name = entity.get("Name").and_then(serde_json::Value::as_str).unwrap_or("?"),
        kind = %board_type(entity),
        "Inventory item removed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn configuration(entities: &[(&str, Value)]) -> Map<String, Value> {
        entities
            .iter()
            .map(|(id, e)| (id.to_string(), e.clone()))
            .collect()
    }

    fn board(name: &str) -> Value {
        json!({
            "Name": name,
            "Type": "Chassis",
            "ProbePath": "/xyz/openbmc_project/FruDevice/1",
            "Exposes": [
                {"Name": "Cpu Temp", "Type": "TempSensor", "Address": 83},
                {"Name": "Off", "Type": "TempSensor", "Status": "disabled"}
            ],
            "xyz.openbmc_project.Inventory.Decorator.Asset": {
                "Manufacturer": "Acme",
                "SerialNumber": 42
            }
        })
    }

    #[test]
    fn naming_rules() {
        let entity = json!({"Name": "My Board #1", "Type": "Power Supply"});
        assert_eq!(board_type(&entity), "Power_Supply");
        assert_eq!(board_dbus_name(&entity), "My_Board__1");
        assert_eq!(
            entity_path(&entity),
            "/xyz/openbmc_project/inventory/system/power_supply/My_Board__1"
        );

        let custom = json!({"Name": "keep me", "Custom_Name": true});
        assert_eq!(board_dbus_name(&custom), "keep me");
        assert_eq!(board_type(&custom), "Chassis");
    }

    #[test]
    fn projection_publishes_expected_interfaces() {
        let (server, _rx) = ObjectServer::new();
        let mut projector = Projector::new(server.clone());
        projector.project(&configuration(&[("B", board("B"))]));

        let path = "/xyz/openbmc_project/inventory/system/chassis/B";
        assert!(server.lookup(path, ITEM_IFACE).is_some());
        assert!(server
            .lookup(path, "xyz.openbmc_project.Inventory.Item.Chassis")
            .is_some());
        assert!(server.lookup(path, ADD_OBJECT_IFACE).is_some());

        // Writable decorator interface: numerics widened, Delete present.
        let asset = server
            .lookup(path, "xyz.openbmc_project.Inventory.Decorator.Asset")
            .unwrap();
        assert_eq!(
            asset.property("SerialNumber").unwrap().value,
            PropertyValue::Double(42.0)
        );
        assert_eq!(
            asset.property("Manufacturer").unwrap().access,
            Access::ReadWrite
        );
        assert!(asset.has_method("Delete"));

        // Exposed sub-entity, sanitized leaf; read-only type keeps ints.
        let sensor = server
            .lookup(
                &format!("{}/Cpu_Temp", path),
                "xyz.openbmc_project.Configuration.TempSensor",
            )
            .unwrap();
        assert_eq!(
            sensor.property("Address").unwrap().value,
            PropertyValue::Uint(83)
        );
        assert_eq!(sensor.property("Address").unwrap().access, Access::ReadOnly);

        // Disabled expose not published.
        assert!(server
            .lookup(
                &format!("{}/Off", path),
                "xyz.openbmc_project.Configuration.TempSensor"
            )
            .is_none());

        // ProbePath association back to the detector.
        let assoc = server.lookup(path, ASSOCIATION_IFACE).unwrap();
        match assoc.property("Associations").unwrap().value {
            PropertyValue::AssociationArray(triples) => {
                assert!(triples.contains(&(
                    PROBE_FORWARD.to_string(),
                    PROBE_REVERSE.to_string(),
                    "/xyz/openbmc_project/FruDevice/1".to_string()
                )));
            }
            other => panic!("unexpected associations value: {:?}", other),
        }
    }

    #[test]
    fn reprojection_is_idempotent() {
        let (server, _rx) = ObjectServer::new();
        let mut projector = Projector::new(server.clone());
        let config = configuration(&[("B", board("B"))]);

        projector.project(&config);
        let first = server.published();
        let count = server.interface_count();
        let slots = projector.total_slots("B");

        projector.project(&config);
        assert_eq!(server.published(), first);
        assert_eq!(server.interface_count(), count);
        // Expired slots were reused, not appended.
        assert_eq!(projector.total_slots("B"), slots);
    }

    #[test]
    fn prune_removes_everything_published() {
        let (server, _rx) = ObjectServer::new();
        let mut projector = Projector::new(server.clone());
        let entity = board("B");
        projector.project(&configuration(&[("B", entity.clone())]));
        assert!(server.interface_count() > 0);

        projector.prune("B", &entity);
        assert_eq!(server.interface_count(), 0);
        assert_eq!(projector.live_slots("B"), 0);
    }

    #[test]
    fn parent_chassis_and_explicit_associations() {
        let entity = json!({
            "Name": "Riser",
            "Parent_Chassis": "/xyz/openbmc_project/inventory/system/chassis/Main",
            "xyz.openbmc_project.Association.Definitions": {
                "Associations": [["powering", "powered_by", "/some/psu"]]
            },
            "Exposes": []
        });
        let (server, _rx) = ObjectServer::new();
        let mut projector = Projector::new(server.clone());
        projector.project(&configuration(&[("R", entity)]));

        let assoc = server
            .lookup(
                "/xyz/openbmc_project/inventory/system/chassis/Riser",
                ASSOCIATION_IFACE,
            )
            .unwrap();
        match assoc.property("Associations").unwrap().value {
            PropertyValue::AssociationArray(triples) => {
                assert!(triples.contains(&(
                    "parent_chassis".to_string(),
                    "all_chassis".to_string(),
                    "/xyz/openbmc_project/inventory/system/chassis/Main".to_string()
                )));
                assert!(triples.contains(&(
                    "powering".to_string(),
                    "powered_by".to_string(),
                    "/some/psu".to_string()
                )));
            }
            other => panic!("unexpected associations value: {:?}", other),
        }
    }

    #[test]
    fn topology_edges_attach_to_downstream_board() {
        let backplane = json!({
            "Name": "Backplane",
            "Exposes": [{"Name": "P1", "Type": "BackplanePort"}]
        });
        let drive = json!({
            "Name": "Drive",
            "Exposes": [
                {"Name": "P2", "Type": "DownstreamPort", "ConnectsToType": "BackplanePort"}
            ]
        });
        let (server, _rx) = ObjectServer::new();
        let mut projector = Projector::new(server.clone());
        projector.project(&configuration(&[("BP", backplane), ("D", drive)]));

        let assoc = server
            .lookup(
                "/xyz/openbmc_project/inventory/system/chassis/Drive",
                ASSOCIATION_IFACE,
            )
            .unwrap();
        match assoc.property("Associations").unwrap().value {
            PropertyValue::AssociationArray(triples) => {
                assert_eq!(
                    triples,
                    vec![(
                        "contained_by".to_string(),
                        "containing".to_string(),
                        "/xyz/openbmc_project/inventory/system/chassis/Backplane".to_string()
                    )]
                );
            }
            other => panic!("unexpected associations value: {:?}", other),
        }
    }
}

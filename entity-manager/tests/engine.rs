//! End-to-end tests for the inventory engine: template library and
//! schemas on disk, detectors on an in-process bus, the engine running
//! as it would in production (with zeroed timer windows).

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::time::sleep;

use entity_manager::EntityManager;
use entity_manager_bus::{BusFault, MemoryBus, ObjectServer, PropertyWrite};
use entity_manager_common::{EmConfig, PathsConfig, PropertyMap, PropertyValue, TimingConfig};
use entity_manager_common::object::interfaces;

const FRU: &str = "xyz.openbmc_project.FruDevice";
const ITEM: &str = "xyz.openbmc_project.Inventory.Item";
const ADD_OBJECT: &str = "xyz.openbmc_project.AddObject";
const ASSET: &str = "xyz.openbmc_project.Inventory.Decorator.Asset";
const EM_PATH: &str = "/xyz/openbmc_project/EntityManager";
const EM_IFACE: &str = "xyz.openbmc_project.EntityManager";

struct Harness {
    bus: Arc<MemoryBus>,
    server: ObjectServer,
    epochs: watch::Receiver<u64>,
    power: watch::Sender<bool>,
    paths: PathsConfig,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn start(templates: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let paths = PathsConfig {
            config_dir: root.join("configurations"),
            host_config_dir: root.join("host"),
            schema_dir: root.join("schemas"),
            current_configuration: root.join("var/system.json"),
            last_configuration: root.join("tmp/last.json"),
            version_file: root.join("var/version"),
            os_release: root.join("os-release"),
        };
        fs::create_dir_all(&paths.config_dir).unwrap();
        fs::create_dir_all(&paths.schema_dir).unwrap();
        fs::write(&paths.os_release, "VERSION_ID=\"1.0\"\n").unwrap();
        fs::write(paths.schema_dir.join("global.json"), "{}").unwrap();
        fs::write(
            paths.schema_dir.join("fan.json"),
            r#"{
                "type": "object",
                "required": ["Name", "Type"],
                "properties": { "Type": { "const": "Fan" } }
            }"#,
        )
        .unwrap();
        for (name, content) in templates {
            fs::write(paths.config_dir.join(name), content).unwrap();
        }

        let config = EmConfig {
            paths: paths.clone(),
            timing: TimingConfig {
                debounce_secs: 0,
                settle_secs: 0,
            },
            ..Default::default()
        };

        let bus = Arc::new(MemoryBus::new());
        let (power, power_rx) = watch::channel(false);
        let engine = EntityManager::new(config, bus.clone(), power_rx).unwrap();
        let server = engine.server();
        let epochs = engine.scan_epochs();
        tokio::spawn(engine.run());

        Self {
            bus,
            server,
            epochs,
            power,
            paths,
            _dir: dir,
        }
    }

    /// Wait until at least `n` scans have completed.
    async fn wait_scans(&mut self, n: u64) {
        let mut epochs = self.epochs.clone();
        tokio::time::timeout(Duration::from_secs(5), epochs.wait_for(|&e| e >= n))
            .await
            .expect("timed out waiting for scan")
            .unwrap();
    }

    fn persisted(&self) -> Value {
        serde_json::from_str(&fs::read_to_string(&self.paths.current_configuration).unwrap())
            .unwrap()
    }
}

fn fru_detector(props: &[(&str, &str)]) -> entity_manager_common::InterfaceMap {
    let mut ifaces = interfaces([(FRU, Vec::<(&str, PropertyValue)>::new())]);
    for (k, v) in props {
        ifaces
            .get_mut(FRU)
            .unwrap()
            .insert(k.to_string(), PropertyValue::from(*v));
    }
    ifaces
}

fn args(pairs: &[(&str, PropertyValue)]) -> PropertyMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn true_probe_publishes_one_entity() {
    let mut harness = Harness::start(&[(
        "x.json",
        r#"{"Name": "X", "Probe": "TRUE", "Exposes": []}"#,
    )])
    .await;
    harness.wait_scans(1).await;

    let path = "/xyz/openbmc_project/inventory/system/chassis/X";
    assert!(harness.server.lookup(path, ITEM).is_some());
    assert!(harness
        .server
        .lookup(path, "xyz.openbmc_project.Inventory.Item.Chassis")
        .is_some());

    let persisted = harness.persisted();
    assert_eq!(persisted["X"]["Name"], json!("X"));
}

#[tokio::test]
async fn detector_match_links_back_to_the_detector() {
    let mut harness = Harness::start(&[(
        "board.json",
        &format!(
            r#"{{"Name": "Board", "Probe": "{}({{'PRODUCT_MANUFACTURER': 'Acme'}})"}}"#,
            FRU
        ),
    )])
    .await;

    harness.bus.add_object(
        FRU,
        "/xyz/openbmc_project/FruDevice/1",
        fru_detector(&[("PRODUCT_MANUFACTURER", "Acme")]),
    );
    harness.wait_scans(2).await;

    let path = "/xyz/openbmc_project/inventory/system/chassis/Board";
    let assoc = harness
        .server
        .lookup(path, "xyz.openbmc_project.Association.Definitions")
        .expect("association interface");
    match assoc.property("Associations").unwrap().value {
        PropertyValue::AssociationArray(triples) => {
            assert!(triples.contains(&(
                "fruDevice".to_string(),
                "allFru".to_string(),
                "/xyz/openbmc_project/FruDevice/1".to_string()
            )));
        }
        other => panic!("unexpected associations: {:?}", other),
    }
}

#[tokio::test]
async fn add_object_validates_publishes_and_persists() {
    let mut harness = Harness::start(&[(
        "x.json",
        r#"{"Name": "X", "Probe": "TRUE", "Exposes": []}"#,
    )])
    .await;
    harness.wait_scans(1).await;

    let path = "/xyz/openbmc_project/inventory/system/chassis/X";

    harness
        .server
        .call_method(
            path,
            ADD_OBJECT,
            "AddObject",
            args(&[
                ("Name", PropertyValue::from("Fan0")),
                ("Type", PropertyValue::from("Fan")),
                ("FanSpeed", PropertyValue::from(50u64)),
            ]),
        )
        .await
        .unwrap();

    // Exposes grew by one and survived to disk.
    let persisted = harness.persisted();
    assert_eq!(persisted["X"]["Exposes"][0]["Name"], json!("Fan0"));

    // The new sub-object is published runtime-writable.
    let fan = harness
        .server
        .lookup(
            &format!("{}/Fan0", path),
            "xyz.openbmc_project.Configuration.Fan",
        )
        .expect("fan interface");
    assert!(fan.has_method("Delete"));
    assert_eq!(
        fan.property("FanSpeed").unwrap().value,
        PropertyValue::Double(50.0)
    );

    // Same Name and Type again is client error.
    let err = harness
        .server
        .call_method(
            path,
            ADD_OBJECT,
            "AddObject",
            args(&[
                ("Name", PropertyValue::from("Fan0")),
                ("Type", PropertyValue::from("Fan")),
            ]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusFault::InvalidArgument(_)));

    // A type without a schema cannot be validated: client error, no state
    // change.
    let err = harness
        .server
        .call_method(
            path,
            ADD_OBJECT,
            "AddObject",
            args(&[
                ("Name", PropertyValue::from("Mystery")),
                ("Type", PropertyValue::from("Widget")),
            ]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusFault::InvalidArgument(_)));
    assert_eq!(harness.persisted()["X"]["Exposes"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn delete_nulls_the_slot_and_add_object_reuses_it() {
    let mut harness = Harness::start(&[(
        "x.json",
        r#"{"Name": "X", "Probe": "TRUE", "Exposes": []}"#,
    )])
    .await;
    harness.wait_scans(1).await;

    let path = "/xyz/openbmc_project/inventory/system/chassis/X";
    let fan_path = format!("{}/Fan0", path);
    let fan_iface = "xyz.openbmc_project.Configuration.Fan";

    harness
        .server
        .call_method(
            path,
            ADD_OBJECT,
            "AddObject",
            args(&[
                ("Name", PropertyValue::from("Fan0")),
                ("Type", PropertyValue::from("Fan")),
            ]),
        )
        .await
        .unwrap();

    harness
        .server
        .call_method(&fan_path, fan_iface, "Delete", PropertyMap::new())
        .await
        .unwrap();

    // The slot is nulled immediately; the object disappears asynchronously.
    assert!(harness.persisted()["X"]["Exposes"][0].is_null());
    sleep(Duration::from_millis(50)).await;
    assert!(harness.server.lookup(&fan_path, fan_iface).is_none());

    // The nulled slot is reused instead of growing the array.
    harness
        .server
        .call_method(
            path,
            ADD_OBJECT,
            "AddObject",
            args(&[
                ("Name", PropertyValue::from("Fan1")),
                ("Type", PropertyValue::from("Fan")),
            ]),
        )
        .await
        .unwrap();
    let exposes = harness.persisted()["X"]["Exposes"].clone();
    assert_eq!(exposes.as_array().unwrap().len(), 1);
    assert_eq!(exposes[0]["Name"], json!("Fan1"));
}

#[tokio::test]
async fn writable_property_writes_back_to_the_detector() {
    let mut harness = Harness::start(&[(
        "board.json",
        &format!(
            r#"{{
                "Name": "AsBoard",
                "Probe": "{}({{'PRODUCT_PRODUCT_NAME': 'X'}})",
                "xyz.openbmc_project.Inventory.Decorator.Asset": {{
                    "AssetTag": "$BOARD_ASSET_TAG"
                }}
            }}"#,
            FRU
        ),
    )])
    .await;

    let detector_path = "/xyz/openbmc_project/FruDevice/1";
    harness.bus.add_object(
        FRU,
        detector_path,
        fru_detector(&[("PRODUCT_PRODUCT_NAME", "X"), ("BOARD_ASSET_TAG", "OLD")]),
    );
    harness.wait_scans(2).await;

    let path = "/xyz/openbmc_project/inventory/system/chassis/AsBoard";
    let asset = harness.server.lookup(path, ASSET).expect("asset interface");
    assert_eq!(
        asset.property("AssetTag").unwrap().value,
        PropertyValue::Str("OLD".into())
    );

    harness
        .bus
        .set_association_endpoints(&format!("{}/fruDevice", path), vec![detector_path.into()]);

    let epoch_before = *harness.epochs.borrow();
    harness
        .server
        .set_property(path, ASSET, "AssetTag", PropertyValue::from("NEW"))
        .await
        .unwrap();

    // The set went to the source detector, not the local configuration.
    assert_eq!(
        harness.bus.recorded_writes(),
        vec![PropertyWrite {
            service: FRU.to_string(),
            path: detector_path.to_string(),
            interface: FRU.to_string(),
            property: "BOARD_ASSET_TAG".to_string(),
            value: PropertyValue::Str("NEW".into()),
        }]
    );

    // The detector change pulses a rescan which re-reads NEW.
    harness.wait_scans(epoch_before + 1).await;
    let asset = harness.server.lookup(path, ASSET).expect("asset interface");
    assert_eq!(
        asset.property("AssetTag").unwrap().value,
        PropertyValue::Str("NEW".into())
    );
}

#[tokio::test]
async fn rescan_projects_identically() {
    let mut harness = Harness::start(&[(
        "x.json",
        r#"{
            "Name": "X",
            "Probe": "TRUE",
            "Exposes": [{"Name": "Cpu Temp", "Type": "TempSensor", "Address": 83}]
        }"#,
    )])
    .await;
    harness.wait_scans(1).await;

    let before = harness.server.published();
    let count = harness.server.interface_count();
    let epoch = *harness.epochs.borrow();

    harness
        .server
        .call_method(EM_PATH, EM_IFACE, "ReScan", PropertyMap::new())
        .await
        .unwrap();
    harness.wait_scans(epoch + 1).await;

    assert_eq!(harness.server.published(), before);
    assert_eq!(harness.server.interface_count(), count);
}

#[tokio::test]
async fn power_gate_defers_pruning_until_observed_power_on() {
    let mut harness = Harness::start(&[(
        "board.json",
        &format!(
            r#"{{
                "Name": "PowerBoard",
                "Probe": "{}({{'P': 'x'}})",
                "PowerState": "On"
            }}"#,
            FRU
        ),
    )])
    .await;

    harness
        .bus
        .add_object(FRU, "/d/0", fru_detector(&[("P", "x")]));
    harness.wait_scans(2).await;

    let path = "/xyz/openbmc_project/inventory/system/chassis/PowerBoard";
    assert!(harness.server.lookup(path, ITEM).is_some());

    // Detector disappears while the host has never been seen powered on:
    // absence is not authoritative, the board stays.
    let epoch = *harness.epochs.borrow();
    harness.bus.remove_object(FRU, "/d/0");
    harness.wait_scans(epoch + 1).await;
    assert!(harness.server.lookup(path, ITEM).is_some());
    assert!(harness.persisted().get("PowerBoard P=x index=0").is_some());

    // Power-on observed: after the settle window pruning is authoritative.
    let epoch = *harness.epochs.borrow();
    harness.power.send(true).unwrap();
    harness.wait_scans(epoch + 1).await;
    assert!(harness.server.lookup(path, ITEM).is_none());
    assert!(harness.persisted().get("PowerBoard P=x index=0").is_none());
}

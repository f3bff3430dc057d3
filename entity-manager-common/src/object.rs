//! The managed-object data model shared by the mirror and the bus seam.
//!
//! All maps are ordered so that probe evaluation and scan output are
//! deterministic for a given snapshot (iteration order is part of the
//! engine's contract).

use std::collections::BTreeMap;

use crate::value::PropertyValue;

/// Property name → value, for one interface on one object.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Interface name → properties, for one object path.
pub type InterfaceMap = BTreeMap<String, PropertyMap>;

/// Object path → interfaces, for one bus service.
pub type ManagedObjects = BTreeMap<String, InterfaceMap>;

/// Service name → managed objects: a full snapshot of the detector side
/// of the bus.
pub type BusSnapshot = BTreeMap<String, ManagedObjects>;

/// Build an [`InterfaceMap`] entry from `(interface, [(property, value)])`
/// pairs. Convenience for tests and fixtures.
pub fn interfaces<I, P>(entries: I) -> InterfaceMap
where
    I: IntoIterator<Item = (&'static str, P)>,
    P: IntoIterator<Item = (&'static str, PropertyValue)>,
{
    entries
        .into_iter()
        .map(|(iface, props)| {
            (
                iface.to_string(),
                props
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            )
        })
        .collect()
}

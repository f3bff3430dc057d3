//! Bus signals observed by the daemon.

/// A change notification from the detector side of the bus.
///
/// These map one-to-one onto the object-manager signals the daemon
/// subscribes to. Payloads carry just enough to filter against the
/// probe-interest set; the full state is always re-read with a managed
/// objects call.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A service published new interfaces on a path.
    InterfacesAdded {
        path: String,
        interfaces: Vec<String>,
    },

    /// A service removed interfaces from a path.
    InterfacesRemoved {
        path: String,
        interfaces: Vec<String>,
    },

    /// A well-known or unique name changed owner.
    NameOwnerChanged {
        name: String,
        old_owner: String,
        new_owner: String,
    },

    /// Properties changed on an interface.
    PropertiesChanged { path: String, interface: String },
}

//! Client view of the detector side of the bus.

use async_trait::async_trait;
use tokio::sync::broadcast;

use entity_manager_common::{BusSnapshot, PropertyValue};

use crate::error::Result;
use crate::events::BusEvent;

/// Access to the external detector services on the object bus.
///
/// The wire transport lives behind this trait; the engine only depends on
/// managed-object reads, property writes, the object-mapper association
/// lookup, and the change-signal stream. [`MemoryBus`](crate::MemoryBus)
/// implements it in-process for tests and transport-less deployments.
#[async_trait]
pub trait DetectorBus: Send + Sync + 'static {
    /// Read every managed object of every detector service.
    ///
    /// Issued in full at scan start and after a transport reconnect.
    async fn managed_objects(&self) -> Result<BusSnapshot>;

    /// Set a property on a detector-owned object.
    async fn set_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        property: &str,
        value: PropertyValue,
    ) -> Result<()>;

    /// Resolve the endpoints of an association object via the
    /// object-mapper.
    async fn association_endpoints(&self, path: &str) -> Result<Vec<String>>;

    /// Subscribe to change signals.
    fn subscribe(&self) -> broadcast::Receiver<BusEvent>;
}

//! Entity Manager Bus Seam
//!
//! The object-bus boundary of the inventory daemon:
//!
//! - [`ObjectServer`] - the in-process publication registry; it owns the
//!   strong references to published interfaces and routes method calls and
//!   property writes into the engine task
//! - [`DetectorBus`] - the client trait over the external detector
//!   services (managed-object reads, property write-back, association
//!   lookup, change signals)
//! - [`MemoryBus`] - an in-process [`DetectorBus`] for tests and
//!   transport-less deployments
//!
//! The wire transport itself is an external collaborator and stays behind
//! these seams.

mod client;
mod error;
mod events;
mod memory;
mod server;

pub use client::DetectorBus;
pub use error::{BusFault, Error, Result};
pub use events::BusEvent;
pub use memory::{MemoryBus, PropertyWrite};
pub use server::{Access, BusInterface, BusProperty, BusRequest, ObjectServer};

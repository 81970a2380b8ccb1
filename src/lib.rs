//! vbus - Bus-management core for a virtual block-device driver stack
//!
//! A single logical bus enumerates, owns, and serializes access to a
//! dynamic set of child virtual disks. The host device manager only ever
//! talks to the bus; children never appear to it directly.

// Builders take `self` by value and return it; callers chain them
#![allow(clippy::return_self_not_must_use)]
// Enqueue failures hand the rejected item back inside the error
#![allow(clippy::result_large_err)]

// Core types
pub mod error;
pub mod logging;

// Opaque platform device handles and requests
pub mod device;

// Bus object, registry, work queue, state machine, PnP dispatch
pub mod bus;

// Collaborators
pub mod config;
pub mod disk;
pub mod probe;

pub use bus::{Bus, BusNode, BusState, CustomWorkItem, PnpEvent, PnpMinor};
pub use device::{DeviceHandle, DeviceObject, IoStatus, Irp, MajorFunction, Reply};
pub use error::{BusError, BusResult};

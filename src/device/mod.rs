//! Device Subsystem
//!
//! The opaque side of the bus: platform device handles and the request
//! packets that travel between the host, the bus and its children.
//! - Device objects and handles
//! - I/O request packets and their completion
//!
//! The bus core never dereferences a handle beyond this trait surface.

pub mod irp;
pub mod object;

pub use irp::{Completed, DeviceText, IoStatus, Irp, IrpId, MajorFunction, Reply};
pub use object::{same_device, DeviceHandle, DeviceObject};

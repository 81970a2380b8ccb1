//! Device Objects - Opaque Platform Device Handles
//!
//! Children, the lower device and the bus' own PDO/FDO are all reached
//! through this trait. Concrete backing stores implement it; the bus only
//! forwards requests and asks for relation refreshes.

use std::fmt;
use std::sync::Arc;

use crate::device::irp::{IoStatus, Irp};

// ============================================================================
// Device Object
// ============================================================================

/// A device the bus can hand requests to
pub trait DeviceObject: Send + Sync + fmt::Debug {
    /// Short name, used for logging only
    fn name(&self) -> &str;

    /// I/O entry point
    ///
    /// The device may fill in the request's reply or buffer. The returned
    /// status is what the caller completes the request with.
    fn dispatch(&self, irp: &mut Irp) -> IoStatus {
        let _ = irp;
        IoStatus::NotSupported
    }

    /// Tell the host that this device's bus relations changed
    fn invalidate_relations(&self) {}
}

/// Shared handle to a device object
pub type DeviceHandle = Arc<dyn DeviceObject>;

/// Do two handles refer to the same device object?
pub fn same_device(a: &DeviceHandle, b: &DeviceHandle) -> bool {
    core::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Plain(&'static str);

    impl DeviceObject for Plain {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_default_dispatch_not_supported() {
        let dev = Plain("plain");
        let mut irp = Irp::new(crate::device::MajorFunction::DeviceControl(0x2d1400));
        assert_eq!(dev.dispatch(&mut irp), IoStatus::NotSupported);
        irp.complete(IoStatus::NotSupported);
    }

    #[test]
    fn test_same_device() {
        let a: DeviceHandle = Arc::new(Plain("a"));
        let b: DeviceHandle = Arc::new(Plain("b"));
        let a2 = Arc::clone(&a);
        assert!(same_device(&a, &a2));
        assert!(!same_device(&a, &b));
    }
}

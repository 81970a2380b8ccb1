//! I/O Request Packets - Requests Routed Through the Bus
//!
//! A request is owned by whoever currently holds it. Completing it consumes
//! it and runs the requester's completion routine exactly once. A request
//! that is dropped while still outstanding completes itself as cancelled.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;

use log::warn;

use crate::device::object::DeviceHandle;
use crate::error::BusError;

// ============================================================================
// Completion Status
// ============================================================================

/// Status a request is completed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoStatus {
    /// Success
    #[default]
    Success,
    /// Queued; completion happens later
    Pending,
    /// Cancelled before it ran
    Cancelled,
    /// Not valid for the device's current state
    InvalidDeviceState,
    /// Not handled by this device
    NotSupported,
    /// Device is gone
    NoSuchDevice,
    /// Backing media not available
    NoMediaInDevice,
    /// Allocation failure
    InsufficientResources,
    /// Generic failure
    Unsuccessful,
}

impl IoStatus {
    /// Did the operation succeed (or is it still in flight)?
    pub const fn is_success(self) -> bool {
        matches!(self, IoStatus::Success | IoStatus::Pending)
    }
}

impl From<&BusError> for IoStatus {
    fn from(err: &BusError) -> Self {
        match err {
            BusError::InsufficientResources
            | BusError::ThreadSpawn(_)
            | BusError::UnitNumbersExhausted => IoStatus::InsufficientResources,
            BusError::InvalidTransition { .. } | BusError::NotAcceptingChildren(_) => {
                IoStatus::InvalidDeviceState
            }
            BusError::NodeNotFound => IoStatus::NoSuchDevice,
            BusError::ShuttingDown => IoStatus::Cancelled,
            BusError::NodeAlreadyLinked | BusError::ThreadAlreadyStarted => {
                IoStatus::Unsuccessful
            }
        }
    }
}

// ============================================================================
// Request Kinds
// ============================================================================

/// Device text buffer capacity (matches the host's device ID limit)
pub const MAX_DEVICE_TEXT_LEN: usize = 200;

/// Fixed-capacity device text
pub type DeviceText = heapless::String<MAX_DEVICE_TEXT_LEN>;

/// What a request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorFunction {
    /// Plug and play, with the raw minor code
    Pnp(u8),
    /// Power management
    Power,
    /// WMI / system control
    SystemControl,
    /// Read `length` bytes at byte `offset`
    Read { offset: u64, length: u32 },
    /// Write the request buffer at byte `offset`
    Write { offset: u64 },
    /// Device control code
    DeviceControl(u32),
}

/// Information returned with a completed request
#[derive(Debug, Default)]
pub enum Reply {
    #[default]
    None,
    /// Child devices, in bus order
    Relations(Vec<DeviceHandle>),
    /// Device text or ID
    Text(DeviceText),
    /// Bytes transferred
    Bytes(usize),
}

impl Reply {
    /// Child devices in a relations reply
    pub fn relations(&self) -> Option<&[DeviceHandle]> {
        match self {
            Reply::Relations(list) => Some(list),
            _ => None,
        }
    }
}

// ============================================================================
// I/O Request Packet
// ============================================================================

/// Request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrpId(pub u64);

static NEXT_IRP_ID: AtomicU64 = AtomicU64::new(1);

/// What the requester receives on completion
#[derive(Debug)]
pub struct Completed {
    pub id: IrpId,
    pub status: IoStatus,
    pub reply: Reply,
    pub buffer: Vec<u8>,
}

/// Completion routine
pub type CompletionFn = Box<dyn FnOnce(Completed) + Send>;

/// An I/O request packet
pub struct Irp {
    id: IrpId,
    major: MajorFunction,
    parameter: u32,
    status: IoStatus,
    reply: Reply,
    buffer: Vec<u8>,
    pending: bool,
    completion: Option<CompletionFn>,
}

impl Irp {
    /// Create a request; its status starts as not supported
    pub fn new(major: MajorFunction) -> Self {
        Self {
            id: IrpId(NEXT_IRP_ID.fetch_add(1, Ordering::Relaxed)),
            major,
            parameter: 0,
            status: IoStatus::NotSupported,
            reply: Reply::None,
            buffer: Vec::new(),
            pending: false,
            completion: None,
        }
    }

    /// Create a PnP request
    pub fn pnp(minor: u8) -> Self {
        Self::new(MajorFunction::Pnp(minor))
    }

    /// Set the minor-specific parameter (relation, text or ID type)
    pub fn with_parameter(mut self, parameter: u32) -> Self {
        self.parameter = parameter;
        self
    }

    /// Attach a data buffer
    pub fn with_buffer(mut self, buffer: Vec<u8>) -> Self {
        self.buffer = buffer;
        self
    }

    /// Set the completion routine
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Completed) + Send + 'static,
    {
        self.completion = Some(Box::new(f));
        self
    }

    /// Deliver the completion through a channel
    pub fn with_channel(self) -> (Self, mpsc::Receiver<Completed>) {
        let (tx, rx) = mpsc::channel();
        let irp = self.on_complete(move |done| {
            let _ = tx.send(done);
        });
        (irp, rx)
    }

    pub fn id(&self) -> IrpId {
        self.id
    }

    pub fn major(&self) -> MajorFunction {
        self.major
    }

    /// PnP minor code, if this is a PnP request
    pub fn pnp_minor(&self) -> Option<u8> {
        match self.major {
            MajorFunction::Pnp(minor) => Some(minor),
            _ => None,
        }
    }

    pub fn parameter(&self) -> u32 {
        self.parameter
    }

    pub fn status(&self) -> IoStatus {
        self.status
    }

    pub fn set_status(&mut self, status: IoStatus) {
        self.status = status;
    }

    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub fn set_reply(&mut self, reply: Reply) {
        self.reply = reply;
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    /// Mark the request as queued for later processing
    pub fn mark_pending(&mut self) {
        self.pending = true;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Complete the request, returning the status for convenience
    pub fn complete(mut self, status: IoStatus) -> IoStatus {
        self.finish(status);
        status
    }

    fn finish(&mut self, status: IoStatus) {
        self.status = status;
        if let Some(completion) = self.completion.take() {
            completion(Completed {
                id: self.id,
                status,
                reply: mem::take(&mut self.reply),
                buffer: mem::take(&mut self.buffer),
            });
        }
    }
}

impl Drop for Irp {
    fn drop(&mut self) {
        if self.completion.is_some() {
            warn!("irp {:?} dropped without completion; cancelling", self.id);
            self.finish(IoStatus::Cancelled);
        }
    }
}

impl fmt::Debug for Irp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Irp")
            .field("id", &self.id)
            .field("major", &self.major)
            .field("status", &self.status)
            .field("pending", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irp_ids_unique() {
        let a = Irp::pnp(0);
        let b = Irp::pnp(0);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.pnp_minor(), Some(0));
        assert_eq!(Irp::new(MajorFunction::Power).pnp_minor(), None);
    }

    #[test]
    fn test_complete_runs_once() {
        let (mut irp, rx) = Irp::new(MajorFunction::Read { offset: 0, length: 4 }).with_channel();
        irp.set_reply(Reply::Bytes(4));
        irp.buffer_mut().extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(irp.complete(IoStatus::Success), IoStatus::Success);

        let done = rx.recv().unwrap();
        assert_eq!(done.status, IoStatus::Success);
        assert!(matches!(done.reply, Reply::Bytes(4)));
        assert_eq!(done.buffer, vec![1, 2, 3, 4]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_drop_completes_cancelled() {
        let (irp, rx) = Irp::pnp(0x07).with_channel();
        drop(irp);
        assert_eq!(rx.recv().unwrap().status, IoStatus::Cancelled);
    }

    #[test]
    fn test_status_from_error() {
        assert_eq!(IoStatus::from(&BusError::ShuttingDown), IoStatus::Cancelled);
        assert_eq!(IoStatus::from(&BusError::NodeNotFound), IoStatus::NoSuchDevice);
        assert!(IoStatus::Pending.is_success());
        assert!(!IoStatus::Cancelled.is_success());
    }
}

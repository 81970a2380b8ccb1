//! Bus Subsystem
//!
//! The bus owns a set of child disk devices and is the only thing the host
//! device manager talks to on their behalf.
//! - Child node registry (`node`)
//! - Work queue drained by a dedicated worker (`work`, `thread`)
//! - Device-lifecycle state machine (`state`)
//! - PnP dispatcher (`pnp`)
//!
//! Power and system-control requests are passed straight down to the lower
//! device; everything else is routed here by major function.

pub mod node;
pub mod pnp;
pub mod state;
pub mod thread;
pub mod work;

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::debug;
use spin::Mutex;

use crate::device::{DeviceHandle, IoStatus, Irp, MajorFunction};

pub use node::{remove_node, BusNode, Nodes};
pub use pnp::{PnpMinor, QueryDevTextFn};
pub use state::{BusState, PnpEvent, StateMachine, Transition};
pub use thread::{default_thread, BusThreadFn, WakeSignal};
pub use work::{CustomWorkItem, WorkItem};

use node::Registry;
use work::WorkQueue;

// ============================================================================
// Bus Object
// ============================================================================

/// A bus and everything it owns
///
/// Build one with `Bus::new()` and the `with_*` setters, then share it as
/// `Arc<Bus>`; children and the worker thread refer back to it.
///
/// A started worker holds a strong reference, so the bus is only freed
/// after `shutdown()` has joined it. Dropping the last outside `Arc`
/// without calling `shutdown()` leaves the worker asleep on the wake
/// signal for the life of the process.
pub struct Bus {
    /// Name used for logging and the worker thread
    name: String,

    /// Device we pass requests down to
    lower: Option<DeviceHandle>,

    /// Physical device object the host enumerated us as
    pdo: Option<DeviceHandle>,

    /// Our functional device object
    fdo: Option<DeviceHandle>,

    /// Product-specific device text and ID answers
    query_dev_text: Option<QueryDevTextFn>,

    /// Worker thread routine
    routine: BusThreadFn,

    /// Lifecycle state
    state: StateMachine,

    /// Child nodes by unit number
    registry: Mutex<Registry>,

    /// Live child count, updated under the registry lock
    children: AtomicU32,

    /// Pending work for the worker
    queue: WorkQueue,

    /// Wakes the worker
    signal: WakeSignal,

    /// Worker thread, once started
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Bus {
    /// Create an initialized, unstarted bus
    pub fn new() -> Self {
        Self {
            name: String::from("vbus"),
            lower: None,
            pdo: None,
            fdo: None,
            query_dev_text: None,
            routine: default_thread,
            state: StateMachine::new(),
            registry: Mutex::new(Registry::new()),
            children: AtomicU32::new(0),
            queue: WorkQueue::new(),
            signal: WakeSignal::new(),
            thread: Mutex::new(None),
        }
    }

    /// Create a bus with defaults, ready to share
    pub fn create() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = String::from(name);
        self
    }

    pub fn with_lower_device(mut self, lower: DeviceHandle) -> Self {
        self.lower = Some(lower);
        self
    }

    pub fn with_pdo(mut self, pdo: DeviceHandle) -> Self {
        self.pdo = Some(pdo);
        self
    }

    pub fn with_fdo(mut self, fdo: DeviceHandle) -> Self {
        self.fdo = Some(fdo);
        self
    }

    /// Set the device text / ID routine
    pub fn with_query_dev_text(mut self, f: QueryDevTextFn) -> Self {
        self.query_dev_text = Some(f);
        self
    }

    /// Replace the worker thread routine
    pub fn with_thread(mut self, routine: BusThreadFn) -> Self {
        self.routine = routine;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lower_device(&self) -> Option<&DeviceHandle> {
        self.lower.as_ref()
    }

    pub fn pdo(&self) -> Option<&DeviceHandle> {
        self.pdo.as_ref()
    }

    pub fn fdo(&self) -> Option<&DeviceHandle> {
        self.fdo.as_ref()
    }

    pub fn query_dev_text(&self) -> Option<QueryDevTextFn> {
        self.query_dev_text
    }

    /// Current lifecycle state
    pub fn state(&self) -> BusState {
        self.state.current()
    }

    /// State left by the last transition
    pub fn old_state(&self) -> BusState {
        self.state.old()
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.state
    }

    // ========================================================================
    // Request Routing
    // ========================================================================

    /// Route a request by major function
    ///
    /// This is what the worker runs for forwarded requests. I/O is refused
    /// with `InvalidDeviceState` unless the bus is started.
    pub fn dispatch_request(&self, irp: Irp) -> IoStatus {
        match irp.major() {
            MajorFunction::Pnp(minor) => pnp::dispatch(self, irp, minor),
            MajorFunction::Power => self.power(irp),
            MajorFunction::SystemControl => self.sys_ctl(irp),
            major => {
                let state = self.state();
                if !state.accepts_io() {
                    debug!("{}: {:?} refused in {:?}", self.name, major, state);
                    return irp.complete(IoStatus::InvalidDeviceState);
                }
                debug!("{}: unhandled request {:?}", self.name, major);
                irp.complete(IoStatus::NotSupported)
            }
        }
    }

    /// Power request: pass down, or succeed if there is nothing below
    pub fn power(&self, mut irp: Irp) -> IoStatus {
        match &self.lower {
            Some(lower) => {
                let status = lower.dispatch(&mut irp);
                irp.complete(status)
            }
            None => irp.complete(IoStatus::Success),
        }
    }

    /// System-control request: pass down, or complete as-is
    pub fn sys_ctl(&self, irp: Irp) -> IoStatus {
        self.pass_down(irp)
    }

    /// Hand a request to the lower device, or complete it with its current
    /// status when there is none
    pub(crate) fn pass_down(&self, mut irp: Irp) -> IoStatus {
        match &self.lower {
            Some(lower) => {
                let status = lower.dispatch(&mut irp);
                irp.complete(status)
            }
            None => {
                let status = irp.status();
                irp.complete(status)
            }
        }
    }

    /// Tell the host our child set changed
    fn relations_changed(&self) {
        if self.state() != BusState::Started {
            return;
        }
        if let Some(pdo) = &self.pdo {
            pdo.invalidate_relations();
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Bus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("children", &self.node_count())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

//! PnP Dispatcher - Host Lifecycle Requests
//!
//! Translates PnP minor codes into state-machine transitions and registry
//! operations, writes the reply into the request, and then completes it or
//! passes it down to the lower device.
//!
//! A request whose transition is not valid in the current state is failed
//! here and never reaches the lower device.

use log::{debug, warn};

use crate::bus::state::PnpEvent;
use crate::bus::{Bus, BusState};
use crate::device::{IoStatus, Irp, Reply};

/// Answers device text and ID queries on behalf of the bus owner
pub type QueryDevTextFn = fn(&Bus, &mut Irp) -> IoStatus;

// ============================================================================
// Minor Codes
// ============================================================================

/// PnP minor function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PnpMinor {
    StartDevice = 0x00,
    QueryRemoveDevice = 0x01,
    RemoveDevice = 0x02,
    CancelRemoveDevice = 0x03,
    StopDevice = 0x04,
    QueryStopDevice = 0x05,
    CancelStopDevice = 0x06,
    QueryDeviceRelations = 0x07,
    QueryInterface = 0x08,
    QueryCapabilities = 0x09,
    QueryResources = 0x0A,
    QueryResourceRequirements = 0x0B,
    QueryDeviceText = 0x0C,
    FilterResourceRequirements = 0x0D,
    ReadConfig = 0x0F,
    WriteConfig = 0x10,
    Eject = 0x11,
    SetLock = 0x12,
    QueryId = 0x13,
    QueryPnpDeviceState = 0x14,
    QueryBusInformation = 0x15,
    DeviceUsageNotification = 0x16,
    SurpriseRemoval = 0x17,
}

impl PnpMinor {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        use PnpMinor::*;
        Some(match code {
            0x00 => StartDevice,
            0x01 => QueryRemoveDevice,
            0x02 => RemoveDevice,
            0x03 => CancelRemoveDevice,
            0x04 => StopDevice,
            0x05 => QueryStopDevice,
            0x06 => CancelStopDevice,
            0x07 => QueryDeviceRelations,
            0x08 => QueryInterface,
            0x09 => QueryCapabilities,
            0x0A => QueryResources,
            0x0B => QueryResourceRequirements,
            0x0C => QueryDeviceText,
            0x0D => FilterResourceRequirements,
            0x0F => ReadConfig,
            0x10 => WriteConfig,
            0x11 => Eject,
            0x12 => SetLock,
            0x13 => QueryId,
            0x14 => QueryPnpDeviceState,
            0x15 => QueryBusInformation,
            0x16 => DeviceUsageNotification,
            0x17 => SurpriseRemoval,
            _ => return None,
        })
    }

    /// Lifecycle event carried by this minor, if any
    pub const fn event(self) -> Option<PnpEvent> {
        match self {
            PnpMinor::StartDevice => Some(PnpEvent::Start),
            PnpMinor::QueryStopDevice => Some(PnpEvent::QueryStop),
            PnpMinor::CancelStopDevice => Some(PnpEvent::CancelStop),
            PnpMinor::StopDevice => Some(PnpEvent::Stop),
            PnpMinor::QueryRemoveDevice => Some(PnpEvent::QueryRemove),
            PnpMinor::CancelRemoveDevice => Some(PnpEvent::CancelRemove),
            PnpMinor::RemoveDevice => Some(PnpEvent::Remove),
            PnpMinor::SurpriseRemoval => Some(PnpEvent::SurpriseRemoval),
            _ => None,
        }
    }
}

/// Relation kind in a `QueryDeviceRelations` request parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RelationType {
    Bus = 0,
    Ejection = 1,
    Power = 2,
    Removal = 3,
    TargetDevice = 4,
}

impl RelationType {
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(RelationType::Bus),
            1 => Some(RelationType::Ejection),
            2 => Some(RelationType::Power),
            3 => Some(RelationType::Removal),
            4 => Some(RelationType::TargetDevice),
            _ => None,
        }
    }
}

/// Text kind in a `QueryDeviceText` request parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TextType {
    Description = 0,
    LocationInformation = 1,
}

impl TextType {
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(TextType::Description),
            1 => Some(TextType::LocationInformation),
            _ => None,
        }
    }
}

/// ID kind in a `QueryId` request parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IdType {
    DeviceId = 0,
    HardwareIds = 1,
    CompatibleIds = 2,
    InstanceId = 3,
}

impl IdType {
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(IdType::DeviceId),
            1 => Some(IdType::HardwareIds),
            2 => Some(IdType::CompatibleIds),
            3 => Some(IdType::InstanceId),
            _ => None,
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Handle one PnP request for `bus`
pub fn dispatch(bus: &Bus, mut irp: Irp, minor: u8) -> IoStatus {
    if bus.state() == BusState::Deleted {
        debug!("{}: pnp 0x{:02x} after delete", bus.name(), minor);
        return irp.complete(IoStatus::NoSuchDevice);
    }

    let Some(code) = PnpMinor::from_code(minor) else {
        debug!("{}: unknown pnp minor 0x{:02x}", bus.name(), minor);
        return bus.pass_down(irp);
    };
    debug!("{}: pnp {:?} in {:?}", bus.name(), code, bus.state());

    match code {
        PnpMinor::StartDevice => start(bus, irp),
        PnpMinor::QueryStopDevice
        | PnpMinor::CancelStopDevice
        | PnpMinor::StopDevice
        | PnpMinor::QueryRemoveDevice
        | PnpMinor::CancelRemoveDevice => match code.event() {
            Some(event) => simple_transition(bus, irp, event),
            None => bus.pass_down(irp),
        },
        PnpMinor::SurpriseRemoval => surprise_removal(bus, irp),
        PnpMinor::RemoveDevice => remove(bus, irp),
        PnpMinor::QueryDeviceRelations => query_relations(bus, irp),
        PnpMinor::QueryDeviceText | PnpMinor::QueryId => match bus.query_dev_text() {
            Some(query) => {
                let status = query(bus, &mut irp);
                irp.complete(status)
            }
            None => bus.pass_down(irp),
        },
        PnpMinor::QueryPnpDeviceState => {
            irp.set_status(IoStatus::Success);
            bus.pass_down(irp)
        }
        _ => bus.pass_down(irp),
    }
}

/// Fail a request whose event is not valid now; it is not forwarded
fn reject(bus: &Bus, irp: Irp, event: PnpEvent) -> IoStatus {
    warn!("{}: refusing {:?} in {:?}", bus.name(), event, bus.state());
    irp.complete(IoStatus::InvalidDeviceState)
}

/// The lower device must start first; we only move to `Started` if it did
fn start(bus: &Bus, mut irp: Irp) -> IoStatus {
    if bus.state_machine().check(PnpEvent::Start).is_err() {
        return reject(bus, irp, PnpEvent::Start);
    }

    let status = match bus.lower_device() {
        Some(lower) => {
            irp.set_status(IoStatus::Success);
            lower.dispatch(&mut irp)
        }
        None => IoStatus::Success,
    };
    if status != IoStatus::Success {
        warn!("{}: lower device failed start: {:?}", bus.name(), status);
        return irp.complete(status);
    }

    // Re-checked under the transition lock
    match bus.state_machine().apply(PnpEvent::Start) {
        Ok(_) => irp.complete(IoStatus::Success),
        Err(err) => irp.complete(IoStatus::from(&err)),
    }
}

fn simple_transition(bus: &Bus, mut irp: Irp, event: PnpEvent) -> IoStatus {
    if bus.state_machine().apply(event).is_err() {
        return reject(bus, irp, event);
    }
    irp.set_status(IoStatus::Success);
    bus.pass_down(irp)
}

/// The bus is already gone; drop queued work and children, then tell below
fn surprise_removal(bus: &Bus, mut irp: Irp) -> IoStatus {
    if bus.state_machine().apply(PnpEvent::SurpriseRemoval).is_err() {
        return reject(bus, irp, PnpEvent::SurpriseRemoval);
    }
    bus.close_custom_work();
    let children = bus.remove_children();
    debug!("{}: surprise removal dropped {} child(ren)", bus.name(), children);

    irp.set_status(IoStatus::Success);
    bus.pass_down(irp)
}

/// Final removal: stop the worker, cancel work, remove children, pass down
fn remove(bus: &Bus, mut irp: Irp) -> IoStatus {
    if bus.state_machine().apply(PnpEvent::Remove).is_err() {
        return reject(bus, irp, PnpEvent::Remove);
    }
    bus.request_stop();
    bus.cancel_work_items();
    let children = bus.remove_children();
    debug!("{}: removal dropped {} child(ren)", bus.name(), children);

    irp.set_status(IoStatus::Success);
    bus.pass_down(irp)
}

/// Bus relations are answered from the registry; other kinds go below
fn query_relations(bus: &Bus, mut irp: Irp) -> IoStatus {
    if RelationType::from_code(irp.parameter()) != Some(RelationType::Bus) {
        return bus.pass_down(irp);
    }
    if bus.state().is_removing() {
        return irp.complete(IoStatus::NoSuchDevice);
    }

    let mut relations = Vec::new();
    if relations.try_reserve(bus.node_count() as usize).is_err() {
        return irp.complete(IoStatus::InsufficientResources);
    }
    relations.extend(bus.nodes().map(|node| node.pdo().clone()));
    debug!("{}: reporting {} child(ren)", bus.name(), relations.len());

    irp.set_reply(Reply::Relations(relations));
    irp.set_status(IoStatus::Success);
    bus.pass_down(irp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::{Child, Lower};
    use crate::bus::{BusNode, CustomWorkItem};
    use crate::device::{same_device, DeviceHandle, DeviceText};
    use crate::error::BusError;
    use core::fmt::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn send(bus: &Bus, minor: PnpMinor) -> IoStatus {
        bus.dispatch_request(Irp::pnp(minor.code()))
    }

    fn relations(bus: &Bus) -> (IoStatus, Vec<DeviceHandle>) {
        let (irp, rx) = Irp::pnp(PnpMinor::QueryDeviceRelations.code())
            .with_parameter(RelationType::Bus as u32)
            .with_channel();
        let status = bus.dispatch_request(irp);
        let done = rx.recv().unwrap();
        let list = done.reply.relations().map(<[_]>::to_vec).unwrap_or_default();
        (status, list)
    }

    #[test]
    fn test_minor_codes() {
        for code in 0..=0x17u8 {
            if let Some(minor) = PnpMinor::from_code(code) {
                assert_eq!(minor.code(), code);
            }
        }
        assert_eq!(PnpMinor::from_code(0x0E), None);
        assert_eq!(PnpMinor::from_code(0x18), None);
        assert_eq!(PnpMinor::RemoveDevice.event(), Some(PnpEvent::Remove));
        assert_eq!(PnpMinor::QueryId.event(), None);
    }

    #[test]
    fn test_start_without_lower() {
        let bus = Bus::create();
        assert_eq!(send(&bus, PnpMinor::StartDevice), IoStatus::Success);
        assert_eq!(bus.state(), BusState::Started);
    }

    #[test]
    fn test_start_waits_for_lower() {
        let lower = Arc::new(Lower {
            fail: true,
            ..Lower::default()
        });
        let bus = Arc::new(Bus::new().with_lower_device(lower.clone()));
        assert_eq!(send(&bus, PnpMinor::StartDevice), IoStatus::Unsuccessful);
        assert_eq!(bus.state(), BusState::NotStarted);
        assert_eq!(lower.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_transition_not_forwarded() {
        let lower = Arc::new(Lower::default());
        let bus = Arc::new(Bus::new().with_lower_device(lower.clone()));

        let (irp, rx) = Irp::pnp(PnpMinor::StopDevice.code()).with_channel();
        assert_eq!(bus.dispatch_request(irp), IoStatus::InvalidDeviceState);
        assert_eq!(rx.recv().unwrap().status, IoStatus::InvalidDeviceState);
        assert_eq!(lower.calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.state(), BusState::NotStarted);
    }

    #[test]
    fn test_full_lifecycle() {
        let lower = Arc::new(Lower::default());
        let bus = Arc::new(Bus::new().with_lower_device(lower.clone()));
        for (minor, expected) in [
            (PnpMinor::StartDevice, BusState::Started),
            (PnpMinor::QueryStopDevice, BusState::StopPending),
            (PnpMinor::StopDevice, BusState::Stopped),
            (PnpMinor::QueryRemoveDevice, BusState::RemovePending),
            (PnpMinor::RemoveDevice, BusState::Deleted),
        ] {
            assert_eq!(send(&bus, minor), IoStatus::Success, "{:?}", minor);
            assert_eq!(bus.state(), expected);
        }
        assert_eq!(lower.calls.load(Ordering::SeqCst), 5);
        assert!(bus.is_stopping());
    }

    #[test]
    fn test_cancel_rolls_back() {
        let bus = Bus::create();
        send(&bus, PnpMinor::StartDevice);
        send(&bus, PnpMinor::QueryStopDevice);
        assert_eq!(send(&bus, PnpMinor::CancelStopDevice), IoStatus::Success);
        assert_eq!(bus.state(), BusState::Started);

        send(&bus, PnpMinor::QueryRemoveDevice);
        assert_eq!(send(&bus, PnpMinor::CancelRemoveDevice), IoStatus::Success);
        assert_eq!(bus.state(), BusState::Started);
        assert_eq!(bus.old_state(), BusState::RemovePending);
    }

    #[test]
    fn test_bus_relations_in_registry_order() {
        let bus = Bus::create();
        let nodes: Vec<_> = (0..3)
            .map(|_| BusNode::new(crate::bus::tests::child()))
            .collect();
        for node in &nodes {
            bus.add_node(node).unwrap();
        }
        bus.remove_node(&nodes[1]).unwrap();
        let late = BusNode::new(crate::bus::tests::child());
        assert_eq!(bus.add_node(&late).unwrap(), 3);

        let (status, list) = relations(&bus);
        assert_eq!(status, IoStatus::Success);
        assert_eq!(list.len(), 3);
        assert!(same_device(&list[0], nodes[0].pdo()));
        assert!(same_device(&list[1], nodes[2].pdo()));
        assert!(same_device(&list[2], late.pdo()));
    }

    #[test]
    fn test_other_relations_pass_down() {
        let bus = Bus::create();
        let (irp, rx) = Irp::pnp(PnpMinor::QueryDeviceRelations.code())
            .with_parameter(RelationType::Removal as u32)
            .with_channel();
        assert_eq!(bus.dispatch_request(irp), IoStatus::NotSupported);
        assert!(rx.recv().unwrap().reply.relations().is_none());
    }

    #[test]
    fn test_surprise_removal_drops_work_and_children() {
        let bus = Bus::create();
        send(&bus, PnpMinor::StartDevice);

        let child = Arc::new(Child::default());
        bus.add_node(&BusNode::new(child.clone())).unwrap();

        let cancelled = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let cancelled = Arc::clone(&cancelled);
            let item = CustomWorkItem::new(|| panic!("must not run"))
                .on_cancel(move || {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                });
            bus.enqueue_custom_work_item(item).unwrap();
        }

        assert_eq!(send(&bus, PnpMinor::SurpriseRemoval), IoStatus::Success);
        assert_eq!(bus.state(), BusState::SurpriseRemovePending);
        assert_eq!(cancelled.load(Ordering::SeqCst), 3);
        assert_eq!(child.removed.load(Ordering::SeqCst), 1);
        assert_eq!(bus.node_count(), 0);

        let (status, _) = relations(&bus);
        assert_eq!(status, IoStatus::NoSuchDevice);
        assert_eq!(send(&bus, PnpMinor::RemoveDevice), IoStatus::Success);
        assert_eq!(bus.state(), BusState::Deleted);
    }

    #[test]
    fn test_surprise_removal_refuses_later_work() {
        let bus = Bus::create();
        send(&bus, PnpMinor::StartDevice);
        assert_eq!(send(&bus, PnpMinor::SurpriseRemoval), IoStatus::Success);

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let item = CustomWorkItem::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (err, _item) = bus.enqueue_custom_work_item(item).unwrap_err();
        assert!(matches!(err, BusError::ShuttingDown));
        assert_eq!(bus.process_work_items(), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        // The final remove still arrives through the queue
        let (irp, rx) = Irp::pnp(PnpMinor::RemoveDevice.code()).with_channel();
        bus.enqueue_request(irp).unwrap();
        assert_eq!(bus.process_work_items(), 1);
        assert_eq!(rx.recv().unwrap().status, IoStatus::Success);
        assert_eq!(bus.state(), BusState::Deleted);
    }

    #[test]
    fn test_query_remove_keeps_children() {
        let bus = Bus::create();
        send(&bus, PnpMinor::StartDevice);
        let child = Arc::new(Child::default());
        bus.add_node(&BusNode::new(child.clone())).unwrap();

        send(&bus, PnpMinor::QueryRemoveDevice);
        assert_eq!(bus.node_count(), 1);
        assert_eq!(child.removed.load(Ordering::SeqCst), 0);
        assert!(matches!(
            bus.add_node(&BusNode::new(crate::bus::tests::child())),
            Err(BusError::NotAcceptingChildren(BusState::RemovePending))
        ));
    }

    #[test]
    fn test_remove_refuses_new_work() {
        let bus = Bus::create();
        assert_eq!(send(&bus, PnpMinor::RemoveDevice), IoStatus::Success);
        assert!(bus
            .enqueue_custom_work_item(CustomWorkItem::new(|| {}))
            .is_err());
        assert_eq!(send(&bus, PnpMinor::StartDevice), IoStatus::NoSuchDevice);
    }

    fn describe(bus: &Bus, irp: &mut Irp) -> IoStatus {
        let mut text = DeviceText::new();
        let written = match irp.pnp_minor().and_then(PnpMinor::from_code) {
            Some(PnpMinor::QueryId) => write!(text, "VBUS\\{}", bus.name()),
            _ => write!(text, "{} virtual bus", bus.name()),
        };
        if written.is_err() {
            return IoStatus::InsufficientResources;
        }
        irp.set_reply(Reply::Text(text));
        IoStatus::Success
    }

    #[test]
    fn test_device_text_hook() {
        let bus = Arc::new(Bus::new().with_name("boot").with_query_dev_text(describe));

        let (irp, rx) = Irp::pnp(PnpMinor::QueryDeviceText.code()).with_channel();
        assert_eq!(bus.dispatch_request(irp), IoStatus::Success);
        match rx.recv().unwrap().reply {
            Reply::Text(text) => assert_eq!(text.as_str(), "boot virtual bus"),
            other => panic!("unexpected reply {:?}", other),
        }

        let (irp, rx) = Irp::pnp(PnpMinor::QueryId.code()).with_channel();
        bus.dispatch_request(irp);
        match rx.recv().unwrap().reply {
            Reply::Text(text) => assert_eq!(text.as_str(), "VBUS\\boot"),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_text_without_hook_passes_down() {
        let bus = Bus::create();
        assert_eq!(send(&bus, PnpMinor::QueryDeviceText), IoStatus::NotSupported);
        assert_eq!(send(&bus, PnpMinor::QueryPnpDeviceState), IoStatus::Success);
    }

    #[test]
    fn test_unknown_minor_passes_down() {
        let lower = Arc::new(Lower::default());
        let bus = Arc::new(Bus::new().with_lower_device(lower.clone()));
        assert_eq!(bus.dispatch_request(Irp::pnp(0x42)), IoStatus::Success);
        assert_eq!(lower.calls.load(Ordering::SeqCst), 1);
    }
}

//! Child Node Registry
//!
//! Each child device is bound to its bus by a `BusNode`. The bus keeps its
//! nodes in a map keyed by unit number; unit numbers come from a per-bus
//! counter that never goes backwards, so key order is insertion order and a
//! removed node's number is never handed out again while the bus lives.
//!
//! Nodes hold only a weak reference back to their bus. Enumeration walks by
//! unit number, so a walker holding a node that was removed underneath it
//! still finds that node's successor.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use spin::Mutex;

use crate::bus::pnp::PnpMinor;
use crate::bus::Bus;
use crate::device::{DeviceHandle, Irp};
use crate::error::{BusError, BusResult};

// ============================================================================
// Bus Node
// ============================================================================

/// A child device's membership record
pub struct BusNode {
    /// The child device
    pdo: DeviceHandle,
    /// Unit number relative to the parent bus
    num: AtomicU32,
    /// Parent bus while linked
    bus: Mutex<Option<Weak<Bus>>>,
}

impl BusNode {
    /// Create an unlinked node for a child device
    pub fn new(pdo: DeviceHandle) -> Arc<Self> {
        Arc::new(Self {
            pdo,
            num: AtomicU32::new(0),
            bus: Mutex::new(None),
        })
    }

    /// Unit number assigned when the node was added
    pub fn num(&self) -> u32 {
        self.num.load(Ordering::Acquire)
    }

    /// The child device
    pub fn pdo(&self) -> &DeviceHandle {
        &self.pdo
    }

    /// The bus this node is linked into, if it is still alive
    pub fn bus(&self) -> Option<Arc<Bus>> {
        self.bus.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Is the node currently a member of a live bus?
    pub fn is_linked(&self) -> bool {
        self.bus
            .lock()
            .as_ref()
            .is_some_and(|bus| bus.strong_count() > 0)
    }
}

impl core::fmt::Debug for BusNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BusNode")
            .field("num", &self.num())
            .field("pdo", &self.pdo.name())
            .field("linked", &self.is_linked())
            .finish()
    }
}

/// Remove a node from whichever bus it belongs to
pub fn remove_node(node: &BusNode) -> BusResult<()> {
    let bus = node.bus().ok_or(BusError::NodeNotFound)?;
    bus.remove_node(node)
}

// ============================================================================
// Registry
// ============================================================================

/// Nodes of one bus, by unit number
#[derive(Debug)]
pub(crate) struct Registry {
    nodes: BTreeMap<u32, Arc<BusNode>>,
    /// `None` once every unit number has been handed out
    next_num: Option<u32>,
}

impl Registry {
    pub(crate) const fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            next_num: Some(0),
        }
    }

    fn is_member(&self, node: &BusNode) -> bool {
        self.nodes
            .get(&node.num())
            .is_some_and(|member| core::ptr::eq(Arc::as_ptr(member), node))
    }
}

// ============================================================================
// Registry Operations
// ============================================================================

impl Bus {
    /// Link a node into this bus, returning its unit number
    ///
    /// Children may be added before the bus starts; a bus that is being
    /// removed refuses them.
    pub fn add_node(self: &Arc<Self>, node: &Arc<BusNode>) -> BusResult<u32> {
        let num = {
            let mut registry = self.registry.lock();
            // Removal detaches children under this lock, so the state read
            // here cannot go stale before the insert
            let state = self.state();
            if !state.accepts_children() {
                return Err(BusError::NotAcceptingChildren(state));
            }

            let mut link = node.bus.lock();
            if link.as_ref().is_some_and(|bus| bus.strong_count() > 0) {
                return Err(BusError::NodeAlreadyLinked);
            }

            let num = registry.next_num.ok_or(BusError::UnitNumbersExhausted)?;
            registry.next_num = num.checked_add(1);
            node.num.store(num, Ordering::Release);
            registry.nodes.insert(num, Arc::clone(node));
            *link = Some(Arc::downgrade(self));
            self.children.fetch_add(1, Ordering::AcqRel);
            num
        };

        debug!("{}: added {} as unit {}", self.name, node.pdo.name(), num);
        self.relations_changed();
        Ok(num)
    }

    /// Unlink a node from this bus
    ///
    /// A node that is not a member yields `NodeNotFound` and nothing changes.
    pub fn remove_node(&self, node: &BusNode) -> BusResult<()> {
        let member = {
            let mut registry = self.registry.lock();
            if !registry.is_member(node) {
                return Err(BusError::NodeNotFound);
            }
            let member = registry.nodes.remove(&node.num());
            *node.bus.lock() = None;
            self.children.fetch_sub(1, Ordering::AcqRel);
            member
        };
        drop(member);

        debug!("{}: removed unit {}", self.name, node.num());
        self.relations_changed();
        Ok(())
    }

    /// Successor of `node` in bus order, or the first node for `None`
    pub fn next_node(&self, node: Option<&BusNode>) -> Option<Arc<BusNode>> {
        let registry = self.registry.lock();
        match node {
            None => registry.nodes.values().next().cloned(),
            Some(node) => registry
                .nodes
                .range((Excluded(node.num()), Unbounded))
                .next()
                .map(|(_, next)| Arc::clone(next)),
        }
    }

    /// Walk the children in bus order
    pub fn nodes(&self) -> Nodes<'_> {
        Nodes {
            bus: self,
            current: None,
            done: false,
        }
    }

    /// Snapshot of the child count
    pub fn node_count(&self) -> u32 {
        self.children.load(Ordering::Acquire)
    }

    /// Unlink every child at once
    pub(crate) fn detach_children(&self) -> Vec<Arc<BusNode>> {
        let nodes = {
            let mut registry = self.registry.lock();
            let nodes = core::mem::take(&mut registry.nodes);
            for node in nodes.values() {
                *node.bus.lock() = None;
            }
            self.children.store(0, Ordering::Release);
            nodes
        };
        nodes.into_values().collect()
    }

    /// Detach every child and tell each one to remove itself
    pub(crate) fn remove_children(&self) -> usize {
        let nodes = self.detach_children();
        for node in &nodes {
            let mut irp = Irp::pnp(PnpMinor::RemoveDevice.code());
            let status = node.pdo.dispatch(&mut irp);
            irp.complete(status);
            debug!("{}: unit {} told to remove: {:?}", self.name, node.num(), status);
        }
        nodes.len()
    }
}

/// Iterator over a bus' children, tolerant of concurrent removal
pub struct Nodes<'a> {
    bus: &'a Bus,
    current: Option<Arc<BusNode>>,
    done: bool,
}

impl Iterator for Nodes<'_> {
    type Item = Arc<BusNode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.bus.next_node(self.current.as_deref());
        match &next {
            Some(node) => self.current = Some(Arc::clone(node)),
            None => self.done = true,
        }
        next
    }
}

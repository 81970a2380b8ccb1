//! Work Queue - Deferred Work for the Bus Thread
//!
//! Producers on any thread append items; the bus' worker drains them in
//! FIFO order. The queue lock covers list linkage only. Items always run
//! with the lock released so a slow item never blocks an enqueuer.
//!
//! Once the bus is stopping the queue refuses new items and hands them back
//! to the caller, so nothing queued after shutdown can be lost. After a
//! surprise removal only custom items are refused; forwarded requests still
//! flow so the final remove can reach the bus.

use std::collections::VecDeque;

use log::{debug, warn};
use spin::Mutex;

use crate::bus::Bus;
use crate::device::{IoStatus, Irp};
use crate::error::BusError;

// ============================================================================
// Work Items
// ============================================================================

/// Boxed work routine
pub type WorkFn = Box<dyn FnOnce() + Send>;

/// A caller-supplied routine to run in the bus thread's context
pub struct CustomWorkItem {
    func: WorkFn,
    cancel: Option<WorkFn>,
}

impl CustomWorkItem {
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            func: Box::new(func),
            cancel: None,
        }
    }

    /// Routine to run instead if the item is cancelled
    ///
    /// Without one, a cancelled item is simply released.
    pub fn on_cancel<F>(mut self, cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel = Some(Box::new(cancel));
        self
    }

    fn run(self) {
        (self.func)();
    }

    fn cancel(self) {
        if let Some(cancel) = self.cancel {
            cancel();
        }
    }
}

impl core::fmt::Debug for CustomWorkItem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CustomWorkItem")
            .field("has_cancel", &self.cancel.is_some())
            .finish()
    }
}

/// One unit of queued work
#[derive(Debug)]
pub enum WorkItem {
    /// Caller routine
    Custom(CustomWorkItem),
    /// Request to re-dispatch in bus context
    Request(Irp),
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug)]
struct QueueInner {
    items: VecDeque<WorkItem>,
    stopping: bool,
    custom_closed: bool,
}

/// Lock-protected FIFO of work items
#[derive(Debug)]
pub(crate) struct WorkQueue {
    inner: Mutex<QueueInner>,
}

impl WorkQueue {
    pub(crate) const fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                stopping: false,
                custom_closed: false,
            }),
        }
    }

    fn push_custom(&self, item: CustomWorkItem) -> Result<(), CustomWorkItem> {
        let mut inner = self.inner.lock();
        if inner.stopping || inner.custom_closed {
            return Err(item);
        }
        inner.items.push_back(WorkItem::Custom(item));
        Ok(())
    }

    fn push_request(&self, irp: Irp) -> Result<(), Irp> {
        let mut inner = self.inner.lock();
        if inner.stopping {
            return Err(irp);
        }
        inner.items.push_back(WorkItem::Request(irp));
        Ok(())
    }

    fn pop(&self) -> Option<WorkItem> {
        self.inner.lock().items.pop_front()
    }

    fn take_all(&self) -> VecDeque<WorkItem> {
        core::mem::take(&mut self.inner.lock().items)
    }

    /// Refuse further items; returns whether we were already stopping
    pub(crate) fn stop(&self) -> bool {
        core::mem::replace(&mut self.inner.lock().stopping, true)
    }

    /// Refuse further custom items and take everything queued so far
    fn close_custom(&self) -> VecDeque<WorkItem> {
        let mut inner = self.inner.lock();
        inner.custom_closed = true;
        core::mem::take(&mut inner.items)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.inner.lock().stopping
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().items.len()
    }
}

// ============================================================================
// Bus Work Operations
// ============================================================================

impl Bus {
    /// Queue a routine for the bus thread
    ///
    /// While the bus is stopping, or after a surprise removal, the item is
    /// handed back with `ShuttingDown`; releasing it is then the caller's
    /// business.
    pub fn enqueue_custom_work_item(
        &self,
        item: CustomWorkItem,
    ) -> Result<(), (BusError, CustomWorkItem)> {
        self.queue
            .push_custom(item)
            .map_err(|item| (BusError::ShuttingDown, item))?;
        self.signal.signal();
        Ok(())
    }

    /// Queue a request to be re-dispatched by the bus thread
    ///
    /// On success the request is marked pending. While the bus is stopping
    /// it is handed back with `ShuttingDown`.
    pub fn enqueue_request(&self, mut irp: Irp) -> Result<(), (BusError, Irp)> {
        irp.mark_pending();
        self.queue
            .push_request(irp)
            .map_err(|irp| (BusError::ShuttingDown, irp))?;
        self.signal.signal();
        Ok(())
    }

    /// Run queued items in FIFO order until the queue is empty
    ///
    /// Bus thread routines call this once per wake. If the bus is already
    /// stopping nothing runs; the items are left for `cancel_work_items`.
    /// Returns the number of items run.
    pub fn process_work_items(&self) -> usize {
        if self.queue.is_stopping() {
            return 0;
        }

        let mut ran = 0;
        while let Some(item) = self.queue.pop() {
            match item {
                WorkItem::Custom(item) => item.run(),
                WorkItem::Request(irp) => {
                    let id = irp.id();
                    let status = self.dispatch_request(irp);
                    debug!("{}: forwarded irp {:?} -> {:?}", self.name, id, status);
                }
            }
            ran += 1;
        }
        ran
    }

    /// Drop everything queued without running it
    ///
    /// Custom items get their cancel routine; requests complete as
    /// `Cancelled`. Returns the number of items cancelled.
    pub fn cancel_work_items(&self) -> usize {
        self.cancel_items(self.queue.take_all())
    }

    /// Cancel queued work and refuse custom items from now on
    ///
    /// Forwarded requests are still accepted and run.
    pub(crate) fn close_custom_work(&self) -> usize {
        self.cancel_items(self.queue.close_custom())
    }

    fn cancel_items(&self, items: VecDeque<WorkItem>) -> usize {
        let count = items.len();
        for item in items {
            match item {
                WorkItem::Custom(item) => item.cancel(),
                WorkItem::Request(irp) => {
                    irp.complete(IoStatus::Cancelled);
                }
            }
        }
        if count > 0 {
            warn!("{}: cancelled {} work item(s)", self.name, count);
        }
        count
    }

    /// Number of items waiting
    pub fn pending_work(&self) -> usize {
        self.queue.len()
    }

    /// Has a stop been requested?
    pub fn is_stopping(&self) -> bool {
        self.queue.is_stopping()
    }
}

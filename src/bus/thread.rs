//! Bus Thread - Wake Signal and Worker Loop
//!
//! Every bus has exactly one worker. It sleeps on the wake signal, drains
//! the work queue, and on stop cancels whatever is left before exiting.
//! A custom routine may replace the default loop but must still call
//! `Bus::process_work_items` on every pass.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use log::{error, info};

use crate::bus::Bus;
use crate::error::{BusError, BusResult};

/// A bus thread routine
pub type BusThreadFn = fn(&Arc<Bus>);

// ============================================================================
// Wake Signal
// ============================================================================

/// Auto-reset event: one `wait` consumes one or more `signal`s
#[derive(Debug, Default)]
pub struct WakeSignal {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    pub const fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Set the event and wake the waiter
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        *signaled = true;
        self.cond.notify_one();
    }

    /// Block until signaled, then reset
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        while !*signaled {
            signaled = self
                .cond
                .wait(signaled)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *signaled = false;
    }

    /// Consume a pending signal without blocking
    pub fn try_wait(&self) -> bool {
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        core::mem::replace(&mut *signaled, false)
    }
}

// ============================================================================
// Worker Loop
// ============================================================================

/// The default bus thread routine
pub fn default_thread(bus: &Arc<Bus>) {
    info!("{}: bus thread started", bus.name());
    loop {
        bus.wait_for_work();
        if bus.is_stopping() {
            break;
        }
        bus.process_work_items();
    }
    bus.cancel_work_items();
    info!("{}: bus thread exiting", bus.name());
}

impl Bus {
    /// Block the calling thread until work is signaled
    pub fn wait_for_work(&self) {
        self.signal.wait();
    }

    /// Start the bus' worker thread
    ///
    /// Only one worker may ever be started for a bus.
    pub fn start_thread(self: &Arc<Self>) -> BusResult<()> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Err(BusError::ThreadAlreadyStarted);
        }
        if self.is_stopping() {
            return Err(BusError::ShuttingDown);
        }

        let routine = self.routine;
        let bus = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{}-bus", self.name))
            .spawn(move || routine(&bus))?;
        *slot = Some(handle);
        Ok(())
    }

    /// Has the worker been started?
    pub fn thread_started(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Ask the worker to stop; new work is refused from here on
    pub fn request_stop(&self) {
        if !self.queue.stop() {
            info!("{}: stop requested", self.name);
        }
        self.signal.signal();
    }

    /// Stop the worker, wait for it, and cancel anything still queued
    ///
    /// Safe to call more than once. When called from the worker itself the
    /// join is skipped; the loop exits on its own.
    pub fn shutdown(&self) {
        self.request_stop();

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Put it back so a later shutdown from outside can join
                *self.thread.lock() = Some(handle);
            } else if handle.join().is_err() {
                error!("{}: bus thread panicked", self.name);
            }
        }

        self.cancel_work_items();
    }
}

//! Bus State Machine - Device Lifecycle
//!
//! The bus moves through start/stop/remove states in response to PnP
//! events. Transitions are a pure function of (current, previous, event);
//! the `StateMachine` wrapper applies them atomically and records the
//! state it left so cancel events can roll back.

use log::{info, warn};
use spin::Mutex;

use crate::error::{BusError, BusResult};

// ============================================================================
// States and Events
// ============================================================================

/// Device-lifecycle state of a bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum BusState {
    /// Initial; children may be populated, I/O is rejected
    #[default]
    NotStarted,
    /// Normal operation
    Started,
    /// Host asked whether the bus may stop
    StopPending,
    /// Quiesced; may be restarted
    Stopped,
    /// Host asked whether the bus may be removed
    RemovePending,
    /// Bus vanished without asking
    SurpriseRemovePending,
    /// Terminal
    Deleted,
}

impl BusState {
    /// All states, in declaration order
    pub const ALL: [BusState; 7] = [
        BusState::NotStarted,
        BusState::Started,
        BusState::StopPending,
        BusState::Stopped,
        BusState::RemovePending,
        BusState::SurpriseRemovePending,
        BusState::Deleted,
    ];

    /// Can children be added in this state?
    pub const fn accepts_children(self) -> bool {
        !matches!(
            self,
            BusState::RemovePending | BusState::SurpriseRemovePending | BusState::Deleted
        )
    }

    /// Is the bus processing I/O in this state?
    pub const fn accepts_io(self) -> bool {
        matches!(self, BusState::Started | BusState::StopPending)
    }

    /// Is the bus on its way out?
    pub const fn is_removing(self) -> bool {
        matches!(
            self,
            BusState::RemovePending | BusState::SurpriseRemovePending | BusState::Deleted
        )
    }
}

/// Lifecycle events delivered by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PnpEvent {
    Start,
    QueryStop,
    CancelStop,
    Stop,
    QueryRemove,
    CancelRemove,
    Remove,
    SurpriseRemoval,
}

impl PnpEvent {
    pub const ALL: [PnpEvent; 8] = [
        PnpEvent::Start,
        PnpEvent::QueryStop,
        PnpEvent::CancelStop,
        PnpEvent::Stop,
        PnpEvent::QueryRemove,
        PnpEvent::CancelRemove,
        PnpEvent::Remove,
        PnpEvent::SurpriseRemoval,
    ];
}

// ============================================================================
// Transition Table
// ============================================================================

/// Compute the state `event` leads to
///
/// `previous` is the state recorded by the last transition; cancel events
/// return to it.
pub fn transition(current: BusState, previous: BusState, event: PnpEvent) -> BusResult<BusState> {
    use BusState::*;
    use PnpEvent::*;

    let next = match (current, event) {
        (NotStarted | Stopped, Start) => Started,

        (Started, QueryStop) => StopPending,
        (StopPending, CancelStop) => previous,
        (Started, CancelStop) => Started,
        (StopPending, Stop) => Stopped,

        (Started | Stopped, QueryRemove) => RemovePending,
        (RemovePending, CancelRemove) => previous,
        (Started, CancelRemove) => Started,

        (NotStarted | Started | StopPending | Stopped | RemovePending, SurpriseRemoval) => {
            SurpriseRemovePending
        }

        (NotStarted | RemovePending | SurpriseRemovePending, Remove) => Deleted,

        (state, event) => return Err(BusError::InvalidTransition { state, event }),
    };
    Ok(next)
}

// ============================================================================
// State Machine
// ============================================================================

/// A transition that was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BusState,
    pub to: BusState,
    pub event: PnpEvent,
}

#[derive(Debug, Clone, Copy)]
struct States {
    current: BusState,
    old: BusState,
}

/// Current and previous lifecycle state of one bus
#[derive(Debug)]
pub struct StateMachine {
    states: Mutex<States>,
}

impl StateMachine {
    pub const fn new() -> Self {
        Self {
            states: Mutex::new(States {
                current: BusState::NotStarted,
                old: BusState::NotStarted,
            }),
        }
    }

    /// Current state; may change as soon as this returns
    pub fn current(&self) -> BusState {
        self.states.lock().current
    }

    /// State left by the last transition
    pub fn old(&self) -> BusState {
        self.states.lock().old
    }

    /// Validate `event` without applying it
    pub fn check(&self, event: PnpEvent) -> BusResult<BusState> {
        let states = self.states.lock();
        transition(states.current, states.old, event)
    }

    /// Validate and apply `event`
    ///
    /// On failure the state is left untouched.
    pub fn apply(&self, event: PnpEvent) -> BusResult<Transition> {
        let mut states = self.states.lock();
        match transition(states.current, states.old, event) {
            Ok(to) => {
                let from = states.current;
                states.old = from;
                states.current = to;
                drop(states);
                info!("bus state {:?} -> {:?} on {:?}", from, to, event);
                Ok(Transition { from, to, event })
            }
            Err(err) => {
                drop(states);
                warn!("{}", err);
                Err(err)
            }
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

//! The state machine guarding mutating CA operations.

use std::fmt;
use std::sync::Mutex;
use log::trace;
use crate::commons::error::Error;
use crate::commons::CaResult;
use crate::server::observer::{CaEvent, CaObserver};


//------------ CaState -------------------------------------------------------

/// The state of the CA manager.
///
/// `Uninitialized`, `Initialized` are stable. The others are held only
/// while the corresponding operation runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CaState {
    Uninitialized,
    Initializing,
    Initialized,
    RenewingIntermediate,
    ReconfiguringProvider,
}

impl CaState {
    pub fn as_str(self) -> &'static str {
        match self {
            CaState::Uninitialized => "uninitialized",
            CaState::Initializing => "initializing",
            CaState::Initialized => "initialized",
            CaState::RenewingIntermediate => "renewing-intermediate",
            CaState::ReconfiguringProvider => "reconfiguring-provider",
        }
    }

    /// Checks whether an operation may move from this state to `to`.
    fn check_transition(self, to: CaState) -> CaResult<()> {
        match (self, to) {
            (CaState::Initialized, _) => Ok(()),
            (CaState::Uninitialized, CaState::Initializing) => Ok(()),
            (CaState::Uninitialized, _) => Err(Error::NotInitialized),
            (busy, _) => Err(Error::Busy(busy)),
        }
    }
}

impl fmt::Display for CaState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ StateCell -----------------------------------------------------

/// Holds the current state and hands out transition guards.
pub(super) struct StateCell {
    state: Mutex<CaState>,
}

impl StateCell {
    pub fn new() -> Self {
        StateCell { state: Mutex::new(CaState::Uninitialized) }
    }

    pub fn get(&self) -> CaState {
        *self.state.lock().unwrap()
    }

    /// Moves into a transient state or fails without side effects.
    pub fn transition<'a>(
        &'a self,
        to: CaState,
        observer: &'a dyn CaObserver,
    ) -> CaResult<StateGuard<'a>> {
        let from = {
            let mut state = self.state.lock().unwrap();
            let from = *state;
            from.check_transition(to)?;
            *state = to;
            from
        };
        trace!("CA state {} -> {}", from, to);
        observer.notify(&CaEvent::StateChanged { from, to });
        Ok(StateGuard { cell: self, observer, revert_to: from, done: false })
    }
}


//------------ StateGuard ----------------------------------------------------

/// A transient state held for the duration of an operation.
///
/// Dropping the guard without calling [`StateGuard::complete`] restores the
/// previous stable state.
pub(super) struct StateGuard<'a> {
    cell: &'a StateCell,
    observer: &'a dyn CaObserver,
    revert_to: CaState,
    done: bool,
}

impl StateGuard<'_> {
    /// Finishes the operation successfully, the CA is now initialized.
    pub fn complete(mut self) {
        self.set(CaState::Initialized);
        self.done = true;
    }

    fn set(&self, to: CaState) {
        let from = {
            let mut state = self.cell.state.lock().unwrap();
            let from = *state;
            *state = to;
            from
        };
        trace!("CA state {} -> {}", from, to);
        self.observer.notify(&CaEvent::StateChanged { from, to });
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.set(self.revert_to);
        }
    }
}


//============ Tests =========================================================

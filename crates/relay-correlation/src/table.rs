//! # Callback Table
//!
//! Key to handler mapping shared by API callers and the dispatch loop.
//! The dispatch loop's running flag lives under the same lock as the map,
//! so "table is empty, stop" and "first entry, start" can never interleave
//! into two loops or into a loop stopping with entries present.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::dispatch::DispatchState;
use crate::error::RegistryError;
use crate::handler::SinkHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationKind {
    /// Stays until removed (`sink`).
    Persistent,
    /// Consumed by its first match (`wait_for`).
    OneShot,
}

/// Which envelope field matched a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    Id,
    Event,
}

struct Registration {
    handler: Arc<dyn SinkHandler>,
    kind: RegistrationKind,
    token: u64,
}

#[derive(Default)]
struct TableState {
    entries: HashMap<String, Registration>,
    dispatching: bool,
    next_token: u64,
}

/// Result of a successful registration.
#[derive(Debug, Clone, Copy)]
pub struct Registered {
    /// Identifies this registration; later ones for the same key get another.
    pub token: u64,
    /// The caller must start the dispatch loop.
    pub start_dispatch: bool,
}

/// A registration selected for an envelope.
pub struct Claimed {
    pub key: String,
    pub matched_by: MatchedBy,
    pub kind: RegistrationKind,
    pub handler: Arc<dyn SinkHandler>,
}

pub struct CallbackTable {
    state: Mutex<TableState>,
    dispatch_state: watch::Sender<DispatchState>,
}

impl CallbackTable {
    pub fn new() -> Self {
        let (dispatch_state, _) = watch::channel(DispatchState::Idle);
        Self {
            state: Mutex::new(TableState::default()),
            dispatch_state,
        }
    }

    /// Add a registration. Fails without side effects if `key` is taken.
    pub fn register(
        &self,
        key: &str,
        handler: Arc<dyn SinkHandler>,
        kind: RegistrationKind,
    ) -> Result<Registered, RegistryError> {
        let mut state = self.state.lock();
        if state.entries.contains_key(key) {
            return Err(RegistryError::AlreadyRegistered(key.to_string()));
        }

        state.next_token += 1;
        let token = state.next_token;
        state.entries.insert(
            key.to_string(),
            Registration {
                handler,
                kind,
                token,
            },
        );

        let start_dispatch = !state.dispatching;
        if start_dispatch {
            state.dispatching = true;
            self.dispatch_state.send_replace(DispatchState::Polling);
        }

        Ok(Registered {
            token,
            start_dispatch,
        })
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<dyn SinkHandler>> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|registration| registration.handler.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Remove whatever is registered under `key`. Absent keys are a no-op.
    pub fn remove(&self, key: &str) -> bool {
        self.state.lock().entries.remove(key).is_some()
    }

    /// Remove `key` only if it still holds the registration identified by `token`.
    pub fn remove_registration(&self, key: &str, token: u64) -> bool {
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some(registration) if registration.token == token => {
                state.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Select the handler for an envelope: `id` first, then `event`.
    /// A one-shot match is removed in the same critical section, so a
    /// second envelope with the same id cannot match it again.
    pub fn claim(&self, id: &str, event: &str) -> Option<Claimed> {
        let mut state = self.state.lock();
        let (key, matched_by) = if state.entries.contains_key(id) {
            (id, MatchedBy::Id)
        } else if state.entries.contains_key(event) {
            (event, MatchedBy::Event)
        } else {
            return None;
        };

        let registration = state.entries.get(key)?;
        let kind = registration.kind;
        let handler = match kind {
            RegistrationKind::Persistent => registration.handler.clone(),
            RegistrationKind::OneShot => state.entries.remove(key)?.handler,
        };

        Some(Claimed {
            key: key.to_string(),
            matched_by,
            kind,
            handler,
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Drop every registration. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.entries.len();
        state.entries.clear();
        removed
    }

    pub fn is_dispatching(&self) -> bool {
        self.state.lock().dispatching
    }

    /// Stop dispatching if, and only if, the table is empty.
    pub fn try_stop_dispatch(&self) -> bool {
        let mut state = self.state.lock();
        if !state.entries.is_empty() {
            return false;
        }
        state.dispatching = false;
        self.dispatch_state.send_replace(DispatchState::Idle);
        true
    }

    /// Stop dispatching regardless of table contents (transport failure,
    /// shutdown). The next registration starts a fresh loop.
    pub fn mark_dispatch_stopped(&self) {
        let mut state = self.state.lock();
        state.dispatching = false;
        self.dispatch_state.send_replace(DispatchState::Idle);
    }

    /// Publish a Polling/Receiving transition. Ignored once the loop has
    /// been marked stopped, so a loop that lost ownership cannot overwrite
    /// the state of its successor.
    pub fn set_dispatch_state(&self, next: DispatchState) {
        let state = self.state.lock();
        if state.dispatching {
            self.dispatch_state.send_replace(next);
        }
    }

    pub fn dispatch_state(&self) -> DispatchState {
        *self.dispatch_state.borrow()
    }

    pub fn watch_dispatch_state(&self) -> watch::Receiver<DispatchState> {
        self.dispatch_state.subscribe()
    }
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self::new()
    }
}

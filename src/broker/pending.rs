//! Pending waiter table
//!
//! One slot per correlation id, each holding the sending half of a oneshot
//! channel the `request()` caller awaits. Registering an id that already has a
//! live slot replaces it: the earlier caller's channel closes and it can no
//! longer be resolved.
//!
//! Every slot carries a token unique to its registration so that a caller
//! giving up on its own slot can never evict a newer registration under the
//! same id. [`PendingRequest`] ties a slot to the lifetime of the caller, so
//! a `request()` future dropped before its deadline leaves nothing behind.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::broker::message::Response;

/// How a waiter was settled.
#[derive(Debug)]
pub enum Settled {
    Response(Response),
    /// The connection stopped while the request was outstanding.
    Cancelled,
}

#[derive(Debug)]
pub struct Waiter {
    token: u64,
    sender: oneshot::Sender<Settled>,
}

impl Waiter {
    /// Delivers the outcome. Returns `false` when the caller already went away.
    pub fn settle(self, outcome: Settled) -> bool {
        self.sender.send(outcome).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct WaiterTable {
    next_token: u64,
    slots: HashMap<String, Waiter>,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `correlation_id`, silently replacing any live one.
    pub fn register(&mut self, correlation_id: &str) -> (u64, oneshot::Receiver<Settled>) {
        let (sender, receiver) = oneshot::channel();
        self.next_token += 1;
        let token = self.next_token;
        self.slots
            .insert(correlation_id.to_string(), Waiter { token, sender });
        (token, receiver)
    }

    /// Pops the live waiter for `correlation_id`, if any.
    pub fn take(&mut self, correlation_id: &str) -> Option<Waiter> {
        self.slots.remove(correlation_id)
    }

    /// Removes the slot only if it still belongs to the registration `token`.
    pub fn remove_owned(&mut self, correlation_id: &str, token: u64) -> bool {
        match self.slots.get(correlation_id) {
            Some(waiter) if waiter.token == token => {
                self.slots.remove(correlation_id);
                true
            }
            _ => false,
        }
    }

    pub fn drain(&mut self) -> Vec<Waiter> {
        self.slots.drain().map(|(_, waiter)| waiter).collect()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.slots.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A caller's registration in a [`WaiterTable`]. The slot is removed when
/// this value is dropped, unless it was already taken or replaced.
#[derive(Debug)]
pub struct PendingRequest<'a> {
    table: &'a Mutex<WaiterTable>,
    correlation_id: &'a str,
    token: u64,
    receiver: oneshot::Receiver<Settled>,
}

impl<'a> PendingRequest<'a> {
    pub fn register(table: &'a Mutex<WaiterTable>, correlation_id: &'a str) -> Self {
        let (token, receiver) = table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(correlation_id);
        Self {
            table,
            correlation_id,
            token,
            receiver,
        }
    }

    pub fn receiver(&mut self) -> &mut oneshot::Receiver<Settled> {
        &mut self.receiver
    }

    /// Removes the slot if it still belongs to this registration.
    pub fn release(&self) -> bool {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_owned(self.correlation_id, self.token)
    }

    /// Ends the wait after the deadline. Returns the outcome a resolver
    /// delivered before the slot could be removed, if any.
    pub fn expire(&mut self) -> Option<Settled> {
        if self.release() {
            return None;
        }
        self.receiver.try_recv().ok()
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

//! Matches out-of-band replies to the requests waiting on them.
//!
//! Each request id owns at most one slot. A slot is either a waiter (the
//! caller got there first) or a parked reply (the reply got there first).
//! Whichever of delivery and timeout removes the slot decides the outcome;
//! the other side then finds nothing and backs off.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::RequestId;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::error::McpError;

/// Replies parked without a waiter are capped so a chatty server cannot grow
/// the map without bound.
const MAX_PARKED_REPLIES: usize = 64;
/// Ids that timed out are remembered so a late reply is dropped instead of
/// parked forever.
const MAX_EXPIRED_IDS: usize = 256;

type Outcome = Result<ServerMessage, McpError>;

enum Slot {
    Waiting(oneshot::Sender<Outcome>),
    Parked(ServerMessage),
}

#[derive(Default)]
struct CorrelatorState {
    slots: HashMap<RequestId, Slot>,
    parked_order: VecDeque<RequestId>,
    expired: HashSet<RequestId>,
    expired_order: VecDeque<RequestId>,
    closed: Option<String>,
}

impl CorrelatorState {
    fn remember_expired(&mut self, id: RequestId) {
        if self.expired.insert(id.clone()) {
            self.expired_order.push_back(id);
        }
        while self.expired_order.len() > MAX_EXPIRED_IDS {
            if let Some(oldest) = self.expired_order.pop_front() {
                self.expired.remove(&oldest);
            }
        }
    }

    fn park(&mut self, id: RequestId, message: ServerMessage) -> bool {
        let parked = self
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Parked(_)))
            .count();
        if parked >= MAX_PARKED_REPLIES {
            while let Some(oldest) = self.parked_order.pop_front() {
                if matches!(self.slots.get(&oldest), Some(Slot::Parked(_))) {
                    self.slots.remove(&oldest);
                    warn!(request_id = ?oldest, "Evicting unclaimed MCP reply");
                    break;
                }
            }
        }
        self.parked_order.push_back(id.clone());
        self.slots.insert(id, Slot::Parked(message));
        true
    }

    /// Removes every waiter, leaving parked replies in place.
    fn take_waiters(&mut self) -> Vec<(RequestId, oneshot::Sender<Outcome>)> {
        let waiting: Vec<RequestId> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Waiting(_)))
            .map(|(id, _)| id.clone())
            .collect();
        waiting
            .into_iter()
            .filter_map(|id| match self.slots.remove(&id) {
                Some(Slot::Waiting(sender)) => Some((id, sender)),
                _ => None,
            })
            .collect()
    }
}

fn release(waiters: Vec<(RequestId, oneshot::Sender<Outcome>)>, reason: &str) {
    for (id, sender) in waiters {
        debug!(request_id = ?id, reason, "Releasing pending MCP request");
        let _ = sender.send(Err(McpError::SubscriptionClosed(reason.to_string())));
    }
}

/// Shared registry of pending request ids. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct ResponseCorrelator {
    state: Arc<Mutex<CorrelatorState>>,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CorrelatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the slot for `id` before the request goes out, so a reader
    /// that fails in the meantime still finds the waiter to release.
    pub fn register(&self, id: RequestId) -> Waiter {
        let mut state = self.state();
        let pending = if let Some(reason) = &state.closed {
            Pending::Ready(Err(McpError::SubscriptionClosed(reason.clone())))
        } else {
            match state.slots.remove(&id) {
                Some(Slot::Parked(message)) => {
                    state.parked_order.retain(|parked| parked != &id);
                    Pending::Ready(Ok(message))
                }
                previous => {
                    if let Some(Slot::Waiting(previous)) = previous {
                        // A second waiter for the same id replaces the first,
                        // which is released with an error rather than left
                        // hanging.
                        let _ = previous.send(Err(McpError::Decode(format!(
                            "duplicate wait for request {id:?}"
                        ))));
                    }
                    let (sender, receiver) = oneshot::channel();
                    state.slots.insert(id.clone(), Slot::Waiting(sender));
                    Pending::Receiving(receiver)
                }
            }
        };

        Waiter {
            correlator: self.clone(),
            id,
            pending,
        }
    }

    /// Waits for the reply to `id`, or fails with [`McpError::Timeout`].
    ///
    /// A reply delivered before this call is returned immediately. Exactly one
    /// of reply and timeout is observed.
    pub async fn wait_for(&self, id: RequestId, timeout: Duration) -> Outcome {
        self.register(id).wait(timeout).await
    }

    /// Hands `message` to whoever is waiting for `id`. Returns `false` when
    /// the reply was dropped (late, duplicate, or the correlator is closed).
    pub fn deliver(&self, id: RequestId, message: ServerMessage) -> bool {
        let mut state = self.state();
        if state.closed.is_some() {
            return false;
        }
        if state.expired.remove(&id) {
            state.expired_order.retain(|expired| expired != &id);
            debug!(request_id = ?id, "Dropping late MCP reply");
            return false;
        }
        match state.slots.remove(&id) {
            Some(Slot::Waiting(sender)) => sender.send(Ok(message)).is_ok(),
            Some(Slot::Parked(existing)) => {
                debug!(request_id = ?id, "Dropping duplicate MCP reply");
                state.slots.insert(id, Slot::Parked(existing));
                false
            }
            None => state.park(id, message),
        }
    }

    /// Releases every current waiter with [`McpError::SubscriptionClosed`].
    /// Later waits are still accepted, for a reader that will be restarted.
    pub fn fail_pending(&self, reason: &str) {
        let waiters = self.state().take_waiters();
        release(waiters, reason);
    }

    /// Releases every waiter with [`McpError::SubscriptionClosed`] and rejects
    /// all later waits.
    pub fn close(&self, reason: &str) {
        let mut state = self.state();
        if state.closed.is_none() {
            state.closed = Some(reason.to_string());
        }
        let waiters = state.take_waiters();
        state.slots.clear();
        state.parked_order.clear();
        drop(state);
        release(waiters, reason);
    }

    /// Number of ids with a waiter or a parked reply.
    pub fn pending_len(&self) -> usize {
        self.state().slots.len()
    }
}

enum Pending {
    Ready(Outcome),
    Receiving(oneshot::Receiver<Outcome>),
    Finished,
}

/// One registered wait. Dropping it before it resolves gives up the slot,
/// and a reply arriving afterwards is discarded.
pub struct Waiter {
    correlator: ResponseCorrelator,
    id: RequestId,
    pending: Pending,
}

impl Waiter {
    pub async fn wait(mut self, timeout: Duration) -> Outcome {
        let waited = match &mut self.pending {
            Pending::Receiving(receiver) => tokio::time::timeout(timeout, receiver).await,
            Pending::Ready(_) | Pending::Finished => {
                return match std::mem::replace(&mut self.pending, Pending::Finished) {
                    Pending::Ready(outcome) => outcome,
                    _ => Err(McpError::SubscriptionClosed(
                        "wait already resolved".to_string(),
                    )),
                };
            }
        };

        let outcome = match waited {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::SubscriptionClosed(
                "correlator dropped the waiter".to_string(),
            )),
            Err(_) => self.expire(timeout),
        };
        self.pending = Pending::Finished;
        outcome
    }

    fn expire(&mut self, timeout: Duration) -> Outcome {
        let mut state = self.correlator.state();
        if matches!(state.slots.get(&self.id), Some(Slot::Waiting(_))) {
            state.slots.remove(&self.id);
            state.remember_expired(self.id.clone());
            debug!(request_id = ?self.id, "MCP request timed out");
            return Err(McpError::Timeout(timeout));
        }
        drop(state);

        // Delivery won the race after the timer fired but before the lock was
        // taken; its value is already in the channel.
        match &mut self.pending {
            Pending::Receiving(receiver) => receiver
                .try_recv()
                .unwrap_or(Err(McpError::Timeout(timeout))),
            _ => Err(McpError::Timeout(timeout)),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let Pending::Receiving(receiver) = std::mem::replace(&mut self.pending, Pending::Finished)
        else {
            return;
        };
        drop(receiver);

        let mut state = self.correlator.state();
        let abandoned = matches!(
            state.slots.get(&self.id),
            Some(Slot::Waiting(sender)) if sender.is_closed()
        );
        if abandoned {
            state.slots.remove(&self.id);
            state.remember_expired(self.id.clone());
            debug!(request_id = ?self.id, "Abandoned MCP wait");
        }
    }
}

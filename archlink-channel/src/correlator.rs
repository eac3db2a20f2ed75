//! # Request/Response Correlator
//!
//! Every command gets a unique correlation id embedded in the outbound message.
//! Inbound messages are matched against the outstanding ids first; peers that
//! never echo ids fall back to "oldest transmitted request wins". Whatever
//! matches nothing goes to the unsolicited-update sink on the event bus.
//!
//! Autonomous commands have no waiter but still take their place in the
//! transmission order, so an id-less reply to one is published as unsolicited
//! instead of resolving a later request.
//!
//! Each pending slot resolves at most once. A `system`/`error` reply resolves
//! it with [`ErrorKind::CommandRejected`](crate::ErrorKind::CommandRejected). A caller that stops waiting (drops
//! its [`ResponseSlot`]) removes the slot, so a reply arriving afterwards is
//! treated as unsolicited. The command itself may already be on the wire and
//! the host may still act on it; cancellation never retracts a transmission.

use crate::error::{self, Error, Result};
use crate::message::{Category, Message};
use crate::state::{ChannelEvent, EventBus};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// Resolved ids remembered for duplicate detection
const RECENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An outstanding request awaiting its reply
#[derive(Debug)]
pub struct PendingRequest {
    pub id: CorrelationId,
    pub issued_at: Instant,
    /// `category/type` of the command, for logs
    pub summary: String,
    pub timeout: Duration,
    pub transmitted: bool,
    reply: oneshot::Sender<Result<Message>>,
}

/// How an inbound message was routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Resolved(CorrelationId),
    /// Reply to a request that was already resolved; ignored
    Duplicate(CorrelationId),
    Unsolicited,
}

#[derive(Debug, Default)]
struct Table {
    pending: HashMap<CorrelationId, PendingRequest>,
    /// Transmission order, for peers that do not echo ids
    transmitted: VecDeque<CorrelationId>,
    /// Transmitted commands nobody waits on, with the time they are forgotten
    untracked: HashMap<CorrelationId, Instant>,
    recent: VecDeque<CorrelationId>,
}

impl Table {
    fn take(&mut self, id: &CorrelationId) -> Option<PendingRequest> {
        let request = self.pending.remove(id)?;
        if request.transmitted {
            self.transmitted.retain(|t| t != id);
        }
        Some(request)
    }

    /// True when `id` was an untracked command still holding its place
    fn forget_untracked(&mut self, id: &CorrelationId) -> bool {
        if self.untracked.remove(id).is_none() {
            return false;
        }
        self.transmitted.retain(|t| t != id);
        true
    }

    fn prune_untracked(&mut self) {
        let now = Instant::now();
        let expired: Vec<CorrelationId> = self
            .untracked
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.forget_untracked(&id);
        }
    }

    fn remember(&mut self, id: CorrelationId) {
        if self.recent.len() == RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(id);
    }
}

#[derive(Debug)]
pub struct Correlator {
    table: Mutex<Table>,
    events: EventBus,
    legacy_fallback: bool,
}

impl Correlator {
    pub fn new(events: EventBus, legacy_fallback: bool) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            events,
            legacy_fallback,
        }
    }

    /// Open a slot for `id`. Exactly one slot may exist per id.
    pub fn register(&self, id: CorrelationId, command: &Message, timeout: Duration) -> Result<ResponseSlot<'_>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.lock();
            if table.pending.contains_key(&id) {
                return Err(error::duplicate_request(id.as_str()).with_operation("correlator::register"));
            }
            table.pending.insert(
                id.clone(),
                PendingRequest {
                    id: id.clone(),
                    issued_at: Instant::now(),
                    summary: format!("{}/{}", command.category, command.kind),
                    timeout,
                    transmitted: false,
                    reply: tx,
                },
            );
        }
        Ok(ResponseSlot {
            correlator: self,
            id,
            rx: Some(rx),
            timeout,
        })
    }

    /// Record that the command was handed to the transport. False when nobody
    /// waits any more.
    pub fn mark_transmitted(&self, id: &CorrelationId) -> bool {
        let mut table = self.lock();
        match table.pending.get_mut(id) {
            Some(request) if !request.transmitted => {
                request.transmitted = true;
                table.transmitted.push_back(id.clone());
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Record a command without a waiter in the transmission order. Its place
    /// is released by an id-less reply, a reply echoing its id, or after `ttl`.
    pub fn mark_untracked(&self, id: &CorrelationId, ttl: Duration) {
        let mut table = self.lock();
        table.prune_untracked();
        if table.untracked.insert(id.clone(), Instant::now() + ttl).is_none() {
            table.transmitted.push_back(id.clone());
        }
    }

    /// Undo [`mark_transmitted`](Self::mark_transmitted) or
    /// [`mark_untracked`](Self::mark_untracked) after a failed write
    pub fn clear_transmitted(&self, id: &CorrelationId) {
        let mut table = self.lock();
        if table.forget_untracked(id) {
            return;
        }
        if let Some(request) = table.pending.get_mut(id) {
            request.transmitted = false;
            table.transmitted.retain(|t| t != id);
        }
    }

    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.lock().pending.contains_key(id)
    }

    pub fn outstanding(&self) -> usize {
        self.lock().pending.len()
    }

    /// Route one validated inbound message
    pub fn route(&self, message: Message) -> Routed {
        let mut table = self.lock();

        let matched = match &message.correlation_id {
            Some(raw) => {
                let id = CorrelationId::from(raw.as_str());
                match table.take(&id) {
                    Some(request) => Some(request),
                    None if table.forget_untracked(&id) => None,
                    None if table.recent.contains(&id) => {
                        drop(table);
                        tracing::debug!(correlation_id = %id, "duplicate response ignored");
                        return Routed::Duplicate(id);
                    }
                    None => None,
                }
            }
            None if self.legacy_fallback && !message.is_state_push() => {
                table.prune_untracked();
                match table.transmitted.front().cloned() {
                    Some(oldest) if table.forget_untracked(&oldest) => {
                        tracing::debug!(correlation_id = %oldest, "id-less reply taken as the answer to an untracked command");
                        None
                    }
                    Some(oldest) => table.take(&oldest),
                    None => None,
                }
            }
            None => None,
        };

        let Some(request) = matched else {
            drop(table);
            tracing::debug!(message = %message.describe(), "unsolicited message");
            self.events.publish(ChannelEvent::Unsolicited(message));
            return Routed::Unsolicited;
        };

        let id = request.id.clone();
        table.remember(id.clone());
        drop(table);

        tracing::trace!(
            correlation_id = %id,
            command = %request.summary,
            elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
            "response matched"
        );
        let result = if message.is(Category::System, "error") {
            Err(host_error(&id, &message))
        } else {
            Ok(message)
        };
        if let Err(Ok(message)) = request.reply.send(result) {
            // the waiter went away between take() and send()
            self.events.publish(ChannelEvent::Unsolicited(message));
        }
        Routed::Resolved(id)
    }

    /// Fail a pending request; false when it was no longer pending
    pub fn fail(&self, id: &CorrelationId, err: Error) -> bool {
        let request = self.lock().take(id);
        match request {
            Some(request) => {
                let _ = request.reply.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Drop a slot without answering it
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        self.lock().take(id).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn host_error(id: &CorrelationId, message: &Message) -> Error {
    let reason = message
        .field("message")
        .or_else(|| message.field("reason"))
        .and_then(|v| v.as_str())
        .unwrap_or("rejected by host");
    error::command_rejected(id.as_str(), reason).with_operation("correlator::route")
}

/// The caller's handle on a pending request. Dropping it cancels the wait.
#[derive(Debug)]
pub struct ResponseSlot<'a> {
    correlator: &'a Correlator,
    id: CorrelationId,
    rx: Option<oneshot::Receiver<Result<Message>>>,
    timeout: Duration,
}

impl ResponseSlot<'_> {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Wait for the reply, a delivery failure, or the slot's timeout
    pub async fn wait(mut self) -> Result<Message> {
        let Some(rx) = self.rx.take() else {
            return Err(error::channel_closed("response"));
        };

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(error::channel_closed("response").with_operation("correlator::wait")),
            Err(_) => {
                tracing::debug!(correlation_id = %self.id, timeout_ms = self.timeout.as_millis() as u64, "request timed out");
                Err(error::response_timeout(self.id.as_str(), self.timeout)
                    .with_operation("correlator::wait"))
            }
        }
        // self drops here and removes the slot if it is still pending
    }
}

impl Drop for ResponseSlot<'_> {
    fn drop(&mut self) {
        if self.correlator.cancel(&self.id) {
            tracing::debug!(
                correlation_id = %self.id,
                "request abandoned; a late reply will be treated as unsolicited"
            );
        }
    }
}

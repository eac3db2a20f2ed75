//! # Channel Facade
//!
//! The one object callers hold. Commands flow
//! `send_command` → validator → correlator → queue → drain loop → supervisor,
//! and replies come back through the supervisor's reader into the correlator.
//! Autonomous actions flow `submit_autonomous` → gate → queue and are never
//! awaited.
//!
//! ```ignore
//! let channel = Channel::new(ChannelConfig::load("archlink.toml")?)?;
//! channel.connect().await?;
//! let reply = channel.send_command(Message::architect_request("build a bridge", json!({}))).await?;
//! ```

use crate::codec::{self, Codec};
use crate::config::ChannelConfig;
use crate::correlator::{CorrelationId, Correlator};
use crate::error::{self, ErrorKind, Result};
use crate::gate::{Admission, AutonomousAction, AutonomousGate};
use crate::message::Message;
use crate::queue::{OutboundQueue, QueuedCommand};
use crate::state::{self, ChannelEvent, ConnectionState, EventBus};
use crate::supervisor::{Attempt, Supervisor};
use crate::transport::{Connector, WebSocketConnector};
use crate::validator::{CredentialCheck, Validator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// What happened to an autonomous action
#[derive(Debug, Clone, PartialEq)]
pub enum AutonomousOutcome {
    /// Queued for delivery as this command
    Dispatched(Message),
    /// Withheld; published as [`ChannelEvent::ApprovalRequired`]
    NeedsApproval(AutonomousAction),
}

pub struct ChannelBuilder<C = WebSocketConnector> {
    config: ChannelConfig,
    connector: C,
    credentials: Option<Arc<dyn CredentialCheck>>,
}

impl<C: Connector> ChannelBuilder<C> {
    /// Use another transport
    pub fn connector<D: Connector>(self, connector: D) -> ChannelBuilder<D> {
        ChannelBuilder {
            config: self.config,
            connector,
            credentials: self.credentials,
        }
    }

    /// Check `api_key` on inbound and outbound messages that carry one
    pub fn credentials(mut self, check: Arc<dyn CredentialCheck>) -> Self {
        self.credentials = Some(check);
        self
    }

    pub fn build(self) -> Result<Channel<C>> {
        let config = self.config;
        config.validate()?;

        let mut validator = Validator::new().with_strict_categories(config.strict_categories);
        if let Some(check) = self.credentials {
            validator = validator.with_credentials(check);
        }
        let codec = Codec::new(validator);

        let span = tracing::info_span!("channel", uri = %config.uri);
        let events = EventBus::default();
        let correlator = Arc::new(Correlator::new(events.clone(), config.legacy_correlation));
        let queue = Arc::new(OutboundQueue::new(config.queue_capacity));
        let supervisor = Arc::new(Supervisor::new(
            self.connector,
            config.clone(),
            codec.clone(),
            events.clone(),
            correlator.clone(),
            span.clone(),
        ));

        Ok(Channel {
            inner: Arc::new(Inner {
                gate: AutonomousGate::new(config.critical_actions.iter().cloned()),
                config,
                codec,
                events,
                correlator,
                queue,
                supervisor,
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                span,
            }),
        })
    }
}

struct Inner<C: Connector> {
    config: ChannelConfig,
    codec: Codec,
    gate: AutonomousGate,
    events: EventBus,
    correlator: Arc<Correlator>,
    queue: Arc<OutboundQueue>,
    supervisor: Arc<Supervisor<C>>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    span: tracing::Span,
}

impl<C: Connector> Drop for Inner<C> {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
        self.supervisor.shutdown();
    }
}

/// Resilient command/control channel to one remote host
pub struct Channel<C: Connector = WebSocketConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for Channel<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Channel<WebSocketConnector> {
    /// WebSocket channel without a credential check
    pub fn new(config: ChannelConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: ChannelConfig) -> ChannelBuilder<WebSocketConnector> {
        ChannelBuilder {
            config,
            connector: WebSocketConnector::new(),
            credentials: None,
        }
    }
}

impl<C: Connector> Channel<C> {
    /// Connect and start the session.
    ///
    /// On failure the channel is Faulted and the error is returned; the monitor
    /// keeps retrying in the background either way.
    pub async fn connect(&self) -> Result<()> {
        self.start();
        self.inner
            .supervisor
            .connect(Attempt::Explicit)
            .instrument(self.inner.span.clone())
            .await
    }

    /// Send a command and wait for its reply with the configured timeout
    pub async fn send_command(&self, command: Message) -> Result<Message> {
        let timeout = self.inner.config.response_timeout();
        self.send_command_with_timeout(command, timeout).await
    }

    /// Send a command and wait for its reply.
    ///
    /// Accepted while disconnected; the command waits in the queue. The timer
    /// starts now, not at transmission. Dropping the returned future abandons
    /// the wait but does not retract a command that is already on the wire.
    pub async fn send_command_with_timeout(&self, mut command: Message, timeout: Duration) -> Result<Message> {
        let inner = &self.inner;
        let id = match command.correlation_id.as_deref() {
            Some(id) => CorrelationId::from(id),
            None => CorrelationId::generate(),
        };
        command.correlation_id = Some(id.to_string());

        inner
            .codec
            .validator()
            .validate(&command)
            .map_err(|e| e.with_operation("channel::send_command"))?;

        let slot = inner.correlator.register(id.clone(), &command, timeout)?;
        tracing::debug!(parent: &inner.span, correlation_id = %id, command = %command.describe(), "command submitted");
        inner
            .queue
            .enqueue(QueuedCommand::new(id, command))
            .map_err(|e| e.with_operation("channel::send_command"))?;

        slot.wait().await
    }

    /// Route an action from an unattended loop through the gate
    pub fn submit_autonomous(&self, action: AutonomousAction) -> Result<AutonomousOutcome> {
        let inner = &self.inner;
        match inner.gate.admit(action) {
            Admission::NeedsApproval(action) => {
                tracing::info!(parent: &inner.span, kind = %action.kind, "autonomous action withheld for approval");
                inner.events.publish(ChannelEvent::ApprovalRequired(action.clone()));
                Ok(AutonomousOutcome::NeedsApproval(action))
            }
            Admission::Admitted(action) => {
                let id = CorrelationId::generate();
                let command = action.into_command().with_correlation_id(id.as_str());
                inner
                    .codec
                    .validator()
                    .validate(&command)
                    .map_err(|e| e.with_operation("channel::submit_autonomous"))?;
                inner
                    .queue
                    .enqueue(QueuedCommand::untracked(id, command.clone()))
                    .map_err(|e| e.with_operation("channel::submit_autonomous"))?;
                Ok(AutonomousOutcome::Dispatched(command))
            }
        }
    }

    /// Feed actions from an autonomous decision loop until its sender closes.
    ///
    /// The task keeps the channel alive while it runs.
    pub fn spawn_autonomous(&self, mut actions: mpsc::Receiver<AutonomousAction>) -> Result<JoinHandle<()>> {
        if !self.inner.config.autonomous_mode {
            return Err(error::Error::unsupported("autonomous mode is disabled")
                .with_operation("channel::spawn_autonomous"));
        }
        let channel = self.clone();
        let span = self.inner.span.clone();
        Ok(tokio::spawn(
            async move {
                while let Some(action) = actions.recv().await {
                    let kind = action.kind.clone();
                    if let Err(e) = channel.submit_autonomous(action) {
                        tracing::warn!(%kind, error = %e, "autonomous action not dispatched");
                    }
                }
                tracing::debug!("autonomous source closed");
            }
            .instrument(span),
        ))
    }

    /// Say goodbye and close the link. Queued commands stay queued.
    pub async fn disconnect(&self) {
        self.inner
            .supervisor
            .disconnect()
            .instrument(self.inner.span.clone())
            .await
    }

    pub fn is_connected(&self) -> bool {
        self.inner.supervisor.state().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.supervisor.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.supervisor.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Requests still waiting for a reply
    pub fn outstanding(&self) -> usize {
        self.inner.correlator.outstanding()
    }

    /// Commands not yet delivered to the transport
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Spawn the monitor and the drain loop on first use
    fn start(&self) {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let monitor = tokio::spawn(inner.supervisor.clone().monitor().instrument(inner.span.clone()));
        let drain = tokio::spawn(
            drain(
                inner.queue.clone(),
                inner.correlator.clone(),
                inner.supervisor.clone(),
                inner.events.clone(),
                inner.config.max_delivery_attempts,
                inner.config.response_timeout(),
            )
            .instrument(inner.span.clone()),
        );

        let mut tasks = inner.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.push(monitor);
        tasks.push(drain);
    }
}

/// Single consumer of the outbound queue.
///
/// Takes commands in order and transmits each one only while Connected, one
/// write at a time.
async fn drain<C: Connector>(
    queue: Arc<OutboundQueue>,
    correlator: Arc<Correlator>,
    supervisor: Arc<Supervisor<C>>,
    events: EventBus,
    max_attempts: u32,
    untracked_ttl: Duration,
) {
    let mut state = supervisor.watch();
    loop {
        let item = queue.next().await;
        if !state::wait_connected(&mut state).await {
            return;
        }
        // marked before the write so a fast id-less reply can still match it
        if !item.tracked {
            correlator.mark_untracked(&item.id, untracked_ttl);
        } else if !correlator.mark_transmitted(&item.id) {
            tracing::debug!(correlation_id = %item.id, "dropping abandoned command");
            continue;
        }

        let frame = match codec::encode(&item.command) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(correlation_id = %item.id, error = %e, "command not encodable");
                correlator.clear_transmitted(&item.id);
                correlator.fail(&item.id, e);
                continue;
            }
        };

        match supervisor.transmit(frame).await {
            Ok(()) => {
                tracing::trace!(
                    correlation_id = %item.id,
                    queued_ms = item.enqueued_at.elapsed().as_millis() as u64,
                    "command transmitted"
                );
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => {
                correlator.clear_transmitted(&item.id);
                queue.restore(item);
                tokio::task::yield_now().await;
            }
            Err(e) => {
                correlator.clear_transmitted(&item.id);
                tracing::warn!(correlation_id = %item.id, attempts = item.attempts + 1, error = %e, "transmission failed");
                if let Some(dropped) = queue.requeue(item, max_attempts) {
                    let id = dropped.id;
                    tracing::warn!(correlation_id = %id, attempts = dropped.attempts, "command undeliverable");
                    correlator.fail(&id, error::delivery_exhausted(id.as_str(), dropped.attempts));
                    events.publish(ChannelEvent::DeliveryFailed {
                        correlation_id: id.to_string(),
                        attempts: dropped.attempts,
                    });
                }
            }
        }
    }
}

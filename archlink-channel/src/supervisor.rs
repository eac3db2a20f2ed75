//! # Connection Supervisor
//!
//! Owns the physical link and is the only writer of [`ConnectionState`].
//!
//! ```text
//! Disconnected --connect ok--> Connected --transport error--> Faulted
//!      |                                                        |
//!      +--connect failed--> Faulted <--attempt failed--- Reconnecting <--monitor tick
//! Connected --disconnect()--> Disconnected
//! ```
//!
//! Each established link gets a reader task and a writer task. Both are tagged
//! with the link's generation, so a stale task left over from an earlier link
//! can never fault a newer one. While a session is active the monitor re-runs
//! the connect sequence on a fixed tick whenever the link is down.

use crate::codec::{self, Codec, Inbound};
use crate::config::ChannelConfig;
use crate::correlator::{CorrelationId, Correlator};
use crate::error::{self, Error, Result};
use crate::message::{Category, Message};
use crate::state::{ChannelEvent, ConnectionState, EventBus, StateCell};
use crate::transport::{Connector, Endpoint, FrameSink, FrameStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// After the first failure, only every Nth consecutive failure is logged at WARN
const WARN_EVERY: u64 = 10;

const OUTGOING_BUFFER: usize = 32;

/// Who asked for a connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// A caller; starts (or resumes) the session
    Explicit,
    /// The background monitor
    Monitor,
}

struct Outgoing {
    frame: Vec<u8>,
    done: oneshot::Sender<Result<()>>,
}

struct LinkHandle {
    generation: u64,
    outgoing: mpsc::Sender<Outgoing>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LinkHandle {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

pub struct Supervisor<C> {
    connector: C,
    endpoint: Endpoint,
    config: ChannelConfig,
    codec: Codec,
    state: StateCell,
    events: EventBus,
    correlator: Arc<Correlator>,
    link: Mutex<Option<LinkHandle>>,
    generation: AtomicU64,
    /// Bumped by every disconnect; an attempt that straddles one is discarded
    session: AtomicU64,
    active: AtomicBool,
    attempting: AtomicBool,
    span: tracing::Span,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        connector: C,
        config: ChannelConfig,
        codec: Codec,
        events: EventBus,
        correlator: Arc<Correlator>,
        span: tracing::Span,
    ) -> Self {
        let endpoint = Endpoint {
            uri: config.uri.clone(),
            api_key: config.api_key.clone(),
        };
        Self {
            connector,
            endpoint,
            config,
            codec,
            state: StateCell::new(events.clone()),
            events,
            correlator,
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            session: AtomicU64::new(0),
            active: AtomicBool::new(false),
            attempting: AtomicBool::new(false),
            span,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.watch()
    }

    /// Whether a session is running (connect called, no disconnect since)
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Generation of the current link, 0 before the first one
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Establish the link and complete the handshake.
    ///
    /// Failure leaves the state Faulted; the monitor keeps retrying while the
    /// session is active.
    pub async fn connect(self: &Arc<Self>, attempt: Attempt) -> Result<()> {
        if attempt == Attempt::Explicit {
            self.active.store(true, Ordering::SeqCst);
        }
        if self.state.get().is_connected() {
            return Ok(());
        }
        if self.attempting.swap(true, Ordering::SeqCst) {
            return Err(error::connection_failed(&self.endpoint.uri, "attempt already in progress")
                .with_operation("supervisor::connect"));
        }
        let _attempting = AttemptGuard(&self.attempting);
        let session = self.session.load(Ordering::SeqCst);

        let target = match attempt {
            Attempt::Explicit => ConnectionState::Connecting,
            Attempt::Monitor => ConnectionState::Reconnecting,
        };
        // a disconnect that slipped in since `session` was read wins
        self.state.set_if(target, |_| self.session.load(Ordering::SeqCst) == session);

        let result = match self.establish().await {
            Ok((sink, stream, early)) => self.install(session, sink, stream, early),
            Err(e) => Err(e),
        };

        match result {
            Ok(generation) => {
                tracing::info!(generation, transport = self.connector.name(), "connected");
                Ok(())
            }
            Err(e) => {
                self.state
                    .set_if(ConnectionState::Faulted, |_| self.session.load(Ordering::SeqCst) == session);
                Err(e.with_operation("supervisor::connect"))
            }
        }
    }

    async fn establish(&self) -> Result<(FrameSink, FrameStream, Vec<Vec<u8>>)> {
        let uri = &self.endpoint.uri;
        let link = tokio::time::timeout(self.config.connect_timeout(), self.connector.connect(&self.endpoint))
            .await
            .map_err(|_| error::connection_failed(uri, "connect timed out"))??;
        let (mut sink, mut stream) = (link.sink, link.stream);

        let id = CorrelationId::generate();
        let handshake = Message::handshake(&self.endpoint.api_key).with_correlation_id(id.as_str());
        let frame = codec::encode(&handshake)?;
        tokio::time::timeout(self.config.write_timeout(), sink.send(frame))
            .await
            .map_err(|_| error::connection_failed(uri, "handshake write timed out"))??;

        let handshake_timeout = self.config.handshake_timeout();
        let early = tokio::time::timeout(handshake_timeout, await_ack(&mut stream, &id))
            .await
            .map_err(|_| {
                error::handshake_failed(format!(
                    "no acknowledgement within {}s",
                    handshake_timeout.as_secs()
                ))
            })??;

        Ok((sink, stream, early))
    }

    fn install(
        self: &Arc<Self>,
        session: u64,
        sink: FrameSink,
        stream: FrameStream,
        early: Vec<Vec<u8>>,
    ) -> Result<u64> {
        // held across the spawns so a link that dies at once cannot report
        // before it is installed
        let mut link = self.lock_link();
        if self.session.load(Ordering::SeqCst) != session {
            return Err(error::channel_closed("session").with_context("reason", "disconnected during connect"));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(OUTGOING_BUFFER);
        let writer = tokio::spawn(
            self.clone()
                .write_loop(generation, sink, rx)
                .instrument(self.span.clone()),
        );
        let reader = tokio::spawn(
            self.clone()
                .read_loop(generation, stream, early)
                .instrument(self.span.clone()),
        );

        let handle = LinkHandle {
            generation,
            outgoing: tx,
            reader,
            writer,
        };
        if let Some(stale) = link.replace(handle) {
            stale.abort();
        }
        self.state.set(ConnectionState::Connected);
        Ok(generation)
    }

    async fn write_loop(self: Arc<Self>, generation: u64, mut sink: FrameSink, mut rx: mpsc::Receiver<Outgoing>) {
        let write_timeout = self.config.write_timeout();
        while let Some(out) = rx.recv().await {
            let result = match tokio::time::timeout(write_timeout, sink.send(out.frame)).await {
                Ok(result) => result,
                Err(_) => Err(error::connection_failed(&self.endpoint.uri, "write timed out")),
            };
            let failed = result.is_err();
            if let Err(e) = &result {
                tracing::warn!(generation, error = %e, "transport write failed");
            }
            let _ = out.done.send(result);
            if failed {
                self.link_lost(generation);
                return;
            }
        }
        // sender dropped: the link was torn down
        let _ = tokio::time::timeout(write_timeout, sink.close()).await;
    }

    async fn read_loop(self: Arc<Self>, generation: u64, mut stream: FrameStream, early: Vec<Vec<u8>>) {
        for frame in early {
            self.handle_frame(&frame);
        }
        while let Some(item) = stream.next().await {
            match item {
                Ok(frame) => self.handle_frame(&frame),
                Err(e) => {
                    tracing::warn!(generation, error = %e, "transport read failed");
                    break;
                }
            }
        }
        self.link_lost(generation);
    }

    fn handle_frame(&self, frame: &[u8]) {
        match self.codec.decode_inbound(frame) {
            Ok((message, _)) => {
                self.correlator.route(message);
            }
            Err(Inbound::Invalid(message, err)) => {
                let reason = err.to_string();
                let failed_request = match message.correlation_id.as_deref() {
                    Some(id) => self.correlator.fail(&CorrelationId::from(id), err),
                    None => false,
                };
                if !failed_request {
                    tracing::warn!(message = %message.describe(), %reason, "inbound message rejected");
                    self.events.publish(ChannelEvent::Rejected { reason });
                }
            }
            Err(Inbound::Malformed(err)) => {
                let reason = err.to_string();
                tracing::warn!(%reason, bytes = frame.len(), "malformed inbound frame");
                self.events.publish(ChannelEvent::Rejected { reason });
            }
        }
    }

    /// Called by a link's own tasks when it fails; ignored for stale generations
    fn link_lost(&self, generation: u64) {
        let mut link = self.lock_link();
        if link.as_ref().map(|h| h.generation) != Some(generation) {
            return;
        }
        if let Some(handle) = link.take() {
            handle.abort();
        }
        self.state.set(ConnectionState::Faulted);
        drop(link);
        tracing::warn!(generation, "link lost");
    }

    /// Hand one frame to the current link's writer and wait until it is written.
    ///
    /// `NotConnected` means no write was attempted.
    pub async fn transmit(&self, frame: Vec<u8>) -> Result<()> {
        let outgoing = self
            .lock_link()
            .as_ref()
            .map(|h| h.outgoing.clone())
            .ok_or_else(|| error::not_connected().with_operation("supervisor::transmit"))?;

        let (done, rx) = oneshot::channel();
        outgoing
            .send(Outgoing { frame, done })
            .await
            .map_err(|_| error::not_connected().with_operation("supervisor::transmit"))?;
        rx.await
            .map_err(|_| error::channel_closed("link writer").with_operation("supervisor::transmit"))?
    }

    /// End the session: goodbye (best effort), tear down, Disconnected.
    ///
    /// The monitor stays idle until the next explicit connect.
    pub async fn disconnect(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.session.fetch_add(1, Ordering::SeqCst);

        let handle = self.lock_link().take();
        self.state.set(ConnectionState::Disconnected);

        let Some(handle) = handle else {
            return;
        };
        if let Err(e) = self.say_goodbye(&handle).await {
            tracing::debug!(error = %e, "disconnect message not delivered");
        }
        handle.reader.abort();
        let LinkHandle { outgoing, writer, .. } = handle;
        drop(outgoing);
        if tokio::time::timeout(self.config.write_timeout(), writer).await.is_err() {
            tracing::debug!("writer did not close in time");
        }
        tracing::info!("disconnected");
    }

    async fn say_goodbye(&self, handle: &LinkHandle) -> Result<()> {
        let frame = codec::encode(&Message::disconnect())?;
        let (done, rx) = oneshot::channel();
        handle
            .outgoing
            .send(Outgoing { frame, done })
            .await
            .map_err(|_| error::not_connected())?;
        match tokio::time::timeout(self.config.write_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(error::channel_closed("link writer")),
            Err(_) => Err(error::connection_failed(&self.endpoint.uri, "write timed out")),
        }
    }

    /// Re-run the connect sequence on a fixed tick while the session is
    /// active and the link is down.
    pub async fn monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.reconnect_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut failures: u64 = 0;
        loop {
            ticker.tick().await;
            let state = self.state.get();
            if !self.is_active() || state.is_connected() || state.is_attempting() {
                continue;
            }

            match self.connect(Attempt::Monitor).await {
                Ok(()) => {
                    if failures > 0 {
                        tracing::info!(failures, "reconnected");
                    }
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    if failures == 1 || failures % WARN_EVERY == 0 {
                        tracing::warn!(failures, error = %e, "reconnect failed");
                    } else {
                        tracing::debug!(failures, error = %e, "reconnect failed");
                    }
                }
            }
        }
    }

    /// Synchronous teardown for when the owner goes away; no goodbye is sent
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.session.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.lock_link().take() {
            handle.abort();
        }
        self.state.set(ConnectionState::Disconnected);
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<LinkHandle>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct AttemptGuard<'a>(&'a AtomicBool);

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Read until the host acknowledges the handshake.
///
/// Frames that arrive first are returned so the reader can route them once the
/// link is installed.
async fn await_ack(stream: &mut FrameStream, id: &CorrelationId) -> Result<Vec<Vec<u8>>> {
    let mut early = Vec::new();
    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(e),
            None => return Err(error::handshake_failed("link closed during handshake")),
        };
        let message = match codec::decode(&frame) {
            Ok(message) => message,
            Err(_) => {
                early.push(frame);
                continue;
            }
        };

        if message.category() == Some(Category::System) {
            if message.kind == "error" {
                let reason = message
                    .field("message")
                    .or_else(|| message.field("reason"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("rejected by host");
                return Err(reject(reason));
            }
            if message.kind == "handshake_ack" || message.correlation_id.as_deref() == Some(id.as_str()) {
                return Ok(early);
            }
        }
        early.push(frame);
    }
}

fn reject(reason: &str) -> Error {
    error::handshake_failed(format!("handshake rejected: {}", reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HostEnd, LoopbackConnector, LoopbackHost};
    use crate::validator::Validator;
    use std::time::Duration;
    use tokio_test::assert_err;

    fn supervisor(connector: LoopbackConnector) -> Arc<Supervisor<LoopbackConnector>> {
        let events = EventBus::default();
        let correlator = Arc::new(Correlator::new(events.clone(), true));
        Arc::new(Supervisor::new(
            connector,
            ChannelConfig::new("loopback://host", "k"),
            Codec::new(Validator::new()),
            events,
            correlator,
            tracing::Span::none(),
        ))
    }

    async fn accept(host: &mut LoopbackHost) -> HostEnd {
        let mut end = host.accept().await.unwrap();
        end.accept_handshake().await.unwrap();
        end
    }

    #[tokio::test]
    async fn test_connect_and_handshake() {
        let (connector, mut host) = LoopbackConnector::pair();
        let sup = supervisor(connector);

        let (result, end) = tokio::join!(sup.connect(Attempt::Explicit), accept(&mut host));
        result.unwrap();
        assert_eq!(sup.state(), ConnectionState::Connected);
        assert_eq!(sup.generation(), 1);
        assert_eq!(end.api_key(), "k");
    }

    #[tokio::test]
    async fn test_unreachable_faults() {
        let (connector, host) = LoopbackConnector::pair();
        host.set_reachable(false);
        let sup = supervisor(connector);

        let err = assert_err!(sup.connect(Attempt::Explicit).await);
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectionFailed);
        assert_eq!(sup.state(), ConnectionState::Faulted);
        assert!(sup.is_active());
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let (connector, mut host) = LoopbackConnector::pair();
        let sup = supervisor(connector);

        let refuse = async {
            let mut end = host.accept().await.unwrap();
            end.recv().await.unwrap();
            end.send(&Message::new(Category::System, "error").stamped().with_field("message", "bad key"));
            end
        };
        let (result, _end) = tokio::join!(sup.connect(Attempt::Explicit), refuse);
        let err = assert_err!(result);
        assert_eq!(err.kind(), crate::error::ErrorKind::HandshakeFailed);
        assert!(err.message().contains("bad key"));
        assert_eq!(sup.state(), ConnectionState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let (connector, mut host) = LoopbackConnector::pair();
        let sup = supervisor(connector);

        let silent = async { host.accept().await.unwrap() };
        let (result, _end) = tokio::join!(sup.connect(Attempt::Explicit), silent);
        assert_eq!(assert_err!(result).kind(), crate::error::ErrorKind::HandshakeFailed);
    }

    #[tokio::test]
    async fn test_disconnect_during_attempt_wins() {
        let (connector, mut host) = LoopbackConnector::pair();
        let sup = supervisor(connector);

        let interrupt = async {
            let mut end = host.accept().await.unwrap();
            end.recv().await.unwrap();
            assert_eq!(sup.state(), ConnectionState::Connecting);
            sup.disconnect().await;
            end.close();
        };
        let (result, _) = tokio::join!(sup.connect(Attempt::Explicit), interrupt);
        assert_err!(result);
        assert_eq!(sup.state(), ConnectionState::Disconnected);
        assert!(!sup.is_active());
    }

    #[tokio::test]
    async fn test_transmit_and_link_loss() {
        let (connector, mut host) = LoopbackConnector::pair();
        let sup = supervisor(connector);
        let (result, mut end) = tokio::join!(sup.connect(Attempt::Explicit), accept(&mut host));
        result.unwrap();

        sup.transmit(codec::encode(&Message::disconnect()).unwrap()).await.unwrap();
        assert!(end.recv().await.unwrap().is(Category::System, "disconnect"));

        let mut state = sup.watch();
        end.close();
        state.wait_for(|s| *s == ConnectionState::Faulted).await.unwrap();

        let err = assert_err!(sup.transmit(b"{}".to_vec()).await);
        assert_eq!(err.kind(), crate::error::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_disconnect_sends_goodbye() {
        let (connector, mut host) = LoopbackConnector::pair();
        let sup = supervisor(connector);
        let (result, mut end) = tokio::join!(sup.connect(Attempt::Explicit), accept(&mut host));
        result.unwrap();

        sup.disconnect().await;
        assert_eq!(sup.state(), ConnectionState::Disconnected);
        assert!(!sup.is_active());
        assert!(end.recv().await.unwrap().is(Category::System, "disconnect"));
        assert!(end.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reconnects_when_host_returns() {
        let (connector, mut host) = LoopbackConnector::pair();
        host.set_reachable(false);
        let sup = supervisor(connector);

        assert_err!(sup.connect(Attempt::Explicit).await);
        let monitor = tokio::spawn(sup.clone().monitor());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(sup.state(), ConnectionState::Faulted);
        assert!(host.attempts() >= 3);

        host.set_reachable(true);
        let _end = accept(&mut host).await;
        let mut state = sup.watch();
        state.wait_for(|s| s.is_connected()).await.unwrap();
        monitor.abort();
    }

    #[tokio::test]
    async fn test_stale_generation_ignored() {
        let (connector, mut host) = LoopbackConnector::pair();
        let sup = supervisor(connector);
        let (result, _end) = tokio::join!(sup.connect(Attempt::Explicit), accept(&mut host));
        result.unwrap();

        sup.link_lost(sup.generation() + 7);
        assert_eq!(sup.state(), ConnectionState::Connected);
    }
}

//! Loopback transport - pairs a channel with an in-process fake host
//!
//! Volatile and local, but useful for testing and demos: the host side can
//! refuse connections, read every frame the channel sends, reply, inject
//! unsolicited pushes, or drop the link to simulate a transport failure.

use super::{Connector, Endpoint, Link};
use crate::codec;
use crate::error::{self, Error, Result};
use crate::message::{Category, Message};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Channel side of the loopback pair
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    reachable: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
    accepted: mpsc::UnboundedSender<HostEnd>,
}

/// Host side: accepts every link the connector opens
#[derive(Debug)]
pub struct LoopbackHost {
    reachable: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
    accepted: mpsc::UnboundedReceiver<HostEnd>,
}

impl LoopbackConnector {
    /// Create a connected pair; the host starts reachable
    pub fn pair() -> (LoopbackConnector, LoopbackHost) {
        let reachable = Arc::new(AtomicBool::new(true));
        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            LoopbackConnector {
                reachable: reachable.clone(),
                attempts: attempts.clone(),
                accepted: tx,
            },
            LoopbackHost {
                reachable,
                attempts,
                accepted: rx,
            },
        )
    }
}

impl Connector for LoopbackConnector {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Link> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(error::connection_failed(&endpoint.uri, "connection refused")
                .with_operation("loopback::connect"));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Result<Vec<u8>>>();
        let refusing = Arc::new(AtomicBool::new(false));

        let host_end = HostEnd {
            api_key: endpoint.api_key.clone(),
            frames: out_rx,
            replies: Some(in_tx),
            refusing: refusing.clone(),
        };
        if self.accepted.send(host_end).is_err() {
            return Err(error::connection_failed(&endpoint.uri, "host is gone")
                .with_operation("loopback::connect"));
        }

        let sink = futures_util::sink::unfold(
            (out_tx, refusing),
            |(tx, refusing), frame: Vec<u8>| async move {
                if refusing.load(Ordering::SeqCst) {
                    return Err(error::connection_failed("loopback", "write refused")
                        .with_operation("loopback::send"));
                }
                tx.send(frame).map_err(|_| {
                    error::connection_failed("loopback", "host closed the link")
                        .with_operation("loopback::send")
                })?;
                Ok::<_, Error>((tx, refusing))
            },
        );

        let stream = async_stream::stream! {
            while let Some(item) = in_rx.recv().await {
                yield item;
            }
        };

        Ok(Link::new(sink, stream))
    }
}

impl LoopbackHost {
    /// Refuse or accept future connection attempts
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of connection attempts seen so far, refused ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the next link the channel opens
    pub async fn accept(&mut self) -> Option<HostEnd> {
        self.accepted.recv().await
    }
}

/// The host's end of one link
#[derive(Debug)]
pub struct HostEnd {
    api_key: String,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
    replies: Option<mpsc::UnboundedSender<Result<Vec<u8>>>>,
    refusing: Arc<AtomicBool>,
}

impl HostEnd {
    /// Credential the channel presented when connecting
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub async fn recv_frame(&mut self) -> Option<Vec<u8>> {
        self.frames.recv().await
    }

    /// Next frame decoded as a message; undecodable frames are skipped
    pub async fn recv(&mut self) -> Option<Message> {
        while let Some(frame) = self.frames.recv().await {
            if let Ok(message) = codec::decode(&frame) {
                return Some(message);
            }
        }
        None
    }

    /// Frame already sent by the channel, without waiting
    pub fn try_recv(&mut self) -> Option<Message> {
        while let Ok(frame) = self.frames.try_recv() {
            if let Ok(message) = codec::decode(&frame) {
                return Some(message);
            }
        }
        None
    }

    pub fn send_frame(&self, frame: Vec<u8>) -> bool {
        match &self.replies {
            Some(tx) => tx.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    pub fn send(&self, message: &Message) -> bool {
        match codec::encode(message) {
            Ok(frame) => self.send_frame(frame),
            Err(_) => false,
        }
    }

    /// Deliver a transport error to the channel's receive loop
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        match &self.replies {
            Some(tx) => tx
                .send(Err(error::connection_failed("loopback", reason)))
                .is_ok(),
            None => false,
        }
    }

    /// Wait for the handshake and acknowledge it by echoing its correlation id
    pub async fn accept_handshake(&mut self) -> Option<Message> {
        let handshake = self.recv().await?;
        if !handshake.is(Category::System, "handshake") {
            return None;
        }
        let mut ack = Message::new(Category::System, "handshake_ack").stamped();
        ack.correlation_id = handshake.correlation_id.clone();
        self.send(&ack);
        Some(handshake)
    }

    /// Reply to a command with an architect response echoing its correlation id
    pub fn respond(&self, request: &Message, status: &str) -> bool {
        let mut reply = Message::new(Category::Architect, "response").with_field("status", status);
        reply.correlation_id = request.correlation_id.clone();
        self.send(&reply)
    }

    /// Make every further write from the channel on this link fail
    pub fn refuse_writes(&self) {
        self.refusing.store(true, Ordering::SeqCst);
    }

    /// Stop sending to the channel; its receive loop sees end of stream
    pub fn close(&mut self) {
        self.replies = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use futures_util::{SinkExt, StreamExt};

    fn endpoint() -> Endpoint {
        Endpoint {
            uri: "loopback://host".into(),
            api_key: "k".into(),
        }
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (connector, mut host) = LoopbackConnector::pair();
        let mut link = connector.connect(&endpoint()).await.unwrap();
        let mut end = host.accept().await.unwrap();
        assert_eq!(end.api_key(), "k");

        link.sink.send(codec::encode(&Message::disconnect()).unwrap()).await.unwrap();
        assert!(end.recv().await.unwrap().is(Category::System, "disconnect"));

        assert!(end.send(&Message::disconnect()));
        let frame = link.stream.next().await.unwrap().unwrap();
        assert_eq!(codec::decode(&frame).unwrap().kind, "disconnect");

        end.close();
        assert!(link.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let (connector, host) = LoopbackConnector::pair();
        host.set_reachable(false);

        let err = match connector.connect(&endpoint()).await {
            Ok(_) => panic!("connected to an unreachable host"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert_eq!(host.attempts(), 1);
    }

    #[tokio::test]
    async fn test_refused_writes() {
        let (connector, mut host) = LoopbackConnector::pair();
        let mut link = connector.connect(&endpoint()).await.unwrap();
        let end = host.accept().await.unwrap();

        end.refuse_writes();
        let err = link.sink.send(b"{}".to_vec()).await.unwrap_err();
        assert!(err.message().contains("refused"));
    }

    #[tokio::test]
    async fn test_send_fails_after_host_drops() {
        let (connector, mut host) = LoopbackConnector::pair();
        let mut link = connector.connect(&endpoint()).await.unwrap();
        drop(host.accept().await.unwrap());

        assert!(link.sink.send(b"{}".to_vec()).await.is_err());
    }
}

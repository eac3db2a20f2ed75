//! # Transport Interface
//!
//! The channel never touches sockets directly. A [`Connector`] opens one
//! physical duplex [`Link`]: a frame sink for outbound bytes and a frame
//! stream for inbound bytes. The stream ending or yielding an error means the
//! link is gone.
//!
//! ## Implementations
//! - [`WebSocketConnector`]: production transport over `tokio-tungstenite`
//! - [`LoopbackConnector`]: in-process pairing with a test-controlled host

pub mod loopback;
pub mod websocket;

pub use loopback::{HostEnd, LoopbackConnector, LoopbackHost};
pub use websocket::WebSocketConnector;

use crate::error::{Error, Result};
use futures_core::Stream;
use futures_util::Sink;
use std::future::Future;
use std::pin::Pin;

/// Outbound half of a link
pub type FrameSink = Pin<Box<dyn Sink<Vec<u8>, Error = Error> + Send>>;

/// Inbound half of a link
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// One established physical connection
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Link {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Vec<u8>, Error = Error> + Send + 'static,
        R: Stream<Item = Result<Vec<u8>>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Where to connect and which credential to present
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub uri: String,
    pub api_key: String,
}

/// Opens links to the remote host
pub trait Connector: Send + Sync + 'static {
    /// Transport name for logs (e.g., "websocket", "loopback")
    fn name(&self) -> &str;

    /// Establish a new link. Errors are connection errors.
    fn connect(&self, endpoint: &Endpoint) -> impl Future<Output = Result<Link>> + Send;
}

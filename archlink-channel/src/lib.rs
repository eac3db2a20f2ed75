//! # Archlink Channel
//!
//! Resilient command/control channel between architect agents and a remote
//! game-engine host.
//!
//! ## Core Concepts
//! - **Messages**: JSON envelopes tagged by `category` and `type`, validated at the boundary
//! - **Supervisor**: owns the link, the handshake and the reconnect monitor
//! - **Queue**: commands wait here until the link is up, delivered in order
//! - **Correlator**: pairs every command with exactly one reply
//! - **Gate**: withholds critical actions coming from unattended loops
//! - **Events**: state changes and unsolicited traffic on a broadcast bus

pub mod channel;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod gate;
pub mod memory;
pub mod message;
pub mod queue;
pub mod state;
pub mod supervisor;
pub mod transport;
pub mod validator;

pub use channel::{AutonomousOutcome, Channel, ChannelBuilder};
pub use codec::{decode, encode, Codec, Inbound};
pub use config::ChannelConfig;
pub use correlator::{CorrelationId, Correlator, Routed};
pub use error::{Error, ErrorClass, ErrorKind, ErrorStatus, Result};
pub use gate::{Admission, AutonomousAction, AutonomousGate, DEFAULT_CRITICAL_ACTIONS};
pub use memory::{InMemoryStore, MemoryEntry, MemoryQuery, MemoryStore};
pub use message::{
    ArchitectMessage, Category, EnvironmentMessage, Message, SystemMessage, TypedMessage,
    UiMessage,
};
pub use queue::{OutboundQueue, QueuedCommand};
pub use state::{ChannelEvent, ConnectionState, EventBus};
pub use transport::{
    Connector, Endpoint, HostEnd, Link, LoopbackConnector, LoopbackHost, WebSocketConnector,
};
pub use validator::{AcceptAnyKey, CredentialCheck, SharedKey, ValidationReport, Validator};

//! Error kinds for archlink operations

use std::fmt;

/// The kind of error that occurred.
///
/// This enum categorizes errors to help users write clear error handling logic.
/// Users can match on ErrorKind to decide how to handle specific error cases,
/// or on [`ErrorKind::class`] to branch on the coarse channel taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // =========================================================================
    // General errors
    // =========================================================================
    /// An unexpected error occurred - catch-all for unhandled cases
    Unexpected,

    /// The requested feature or operation is not supported
    Unsupported,

    /// Invalid configuration or parameters
    ConfigInvalid,

    // =========================================================================
    // Connection errors
    // =========================================================================
    /// The transport could not be established or was dropped
    ConnectionFailed,

    /// The transport came up but the host refused or never acknowledged the handshake
    HandshakeFailed,

    /// An operation needed a live link and there was none
    NotConnected,

    /// An internal channel or task ended unexpectedly
    ChannelClosed,

    // =========================================================================
    // Message errors
    // =========================================================================
    /// A message is malformed or misses required fields
    ValidationFailed,

    /// A message carried a credential that did not pass the check
    Unauthenticated,

    /// Serialization/deserialization failed
    SerializationFailed,

    // =========================================================================
    // Exchange errors
    // =========================================================================
    /// No matching response arrived before the deadline
    ResponseTimeout,

    /// The command was dropped after exhausting its delivery attempts
    DeliveryExhausted,

    /// The outbound queue is at capacity
    QueueFull,

    /// A request with the same correlation id is already outstanding
    DuplicateRequest,

    /// The host answered a command with an error reply
    CommandRejected,

    // =========================================================================
    // IO errors
    // =========================================================================
    /// File not found
    FileNotFound,

    /// Permission denied
    PermissionDenied,

    /// IO operation failed
    IoFailed,

    // =========================================================================
    // Parse errors
    // =========================================================================
    /// Failed to parse input
    ParseFailed,

    /// Invalid argument passed to function
    InvalidArgument,
}

/// Coarse error families callers of the channel branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transport unreachable or dropped; the monitor retries
    Connection,
    /// Malformed or unauthenticated message; never retried
    Validation,
    /// No response in time; not retried automatically
    Timeout,
    /// Redelivery cap reached
    DeliveryExhausted,
    /// Everything else
    Other,
}

impl ErrorKind {
    /// Returns the error kind as a static string
    pub fn as_str(&self) -> &'static str {
        match self {
            // General
            ErrorKind::Unexpected => "Unexpected",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::ConfigInvalid => "ConfigInvalid",

            // Connection
            ErrorKind::ConnectionFailed => "ConnectionFailed",
            ErrorKind::HandshakeFailed => "HandshakeFailed",
            ErrorKind::NotConnected => "NotConnected",
            ErrorKind::ChannelClosed => "ChannelClosed",

            // Message
            ErrorKind::ValidationFailed => "ValidationFailed",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::SerializationFailed => "SerializationFailed",

            // Exchange
            ErrorKind::ResponseTimeout => "ResponseTimeout",
            ErrorKind::DeliveryExhausted => "DeliveryExhausted",
            ErrorKind::QueueFull => "QueueFull",
            ErrorKind::DuplicateRequest => "DuplicateRequest",
            ErrorKind::CommandRejected => "CommandRejected",

            // IO
            ErrorKind::FileNotFound => "FileNotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::IoFailed => "IoFailed",

            // Parse
            ErrorKind::ParseFailed => "ParseFailed",
            ErrorKind::InvalidArgument => "InvalidArgument",
        }
    }

    /// Check if this error kind is retryable by default
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionFailed
                | ErrorKind::HandshakeFailed
                | ErrorKind::NotConnected
                | ErrorKind::QueueFull
                | ErrorKind::ResponseTimeout
        )
    }

    /// Map this kind onto the channel's error taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::ConnectionFailed
            | ErrorKind::HandshakeFailed
            | ErrorKind::NotConnected
            | ErrorKind::ChannelClosed => ErrorClass::Connection,
            ErrorKind::ValidationFailed | ErrorKind::Unauthenticated => ErrorClass::Validation,
            ErrorKind::ResponseTimeout => ErrorClass::Timeout,
            ErrorKind::DeliveryExhausted => ErrorClass::DeliveryExhausted,
            _ => ErrorClass::Other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

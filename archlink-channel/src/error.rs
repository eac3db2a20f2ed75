//! Channel error types
//!
//! Re-exports archlink-error and provides channel-specific conveniences.

pub use archlink_error::{Error, ErrorClass, ErrorKind, ErrorStatus, Result};

// =============================================================================
// Channel-specific error constructors
// =============================================================================

/// Create a ConnectionFailed error
pub fn connection_failed(uri: impl Into<String>, reason: impl Into<String>) -> Error {
    Error::connection_failed(uri, reason)
}

/// Create a HandshakeFailed error
pub fn handshake_failed(reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::HandshakeFailed, reason)
}

/// Create a NotConnected error
pub fn not_connected() -> Error {
    Error::not_connected()
}

/// Create a ChannelClosed error
pub fn channel_closed(name: impl Into<String>) -> Error {
    let name = name.into();
    Error::new(ErrorKind::ChannelClosed, format!("channel '{}' closed", name))
        .with_context("channel", name)
}

/// Create a ValidationFailed error
pub fn validation_failed(reason: impl Into<String>) -> Error {
    Error::validation_failed(reason)
}

/// Create a ValidationFailed error listing every missing field
pub fn missing_fields(fields: &[&str]) -> Error {
    let joined = fields.join(", ");
    Error::validation_failed(format!("missing required field(s): {}", joined))
        .with_context("missing", joined)
}

/// Create an Unauthenticated error
pub fn unauthenticated() -> Error {
    Error::new(ErrorKind::Unauthenticated, "invalid authentication")
}

/// Create a SerializationFailed error
pub fn serialization_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::SerializationFailed, message)
}

/// Create a ResponseTimeout error
pub fn response_timeout(correlation_id: impl Into<String>, waited: std::time::Duration) -> Error {
    Error::response_timeout(correlation_id, waited.as_millis())
}

/// Create a DeliveryExhausted error
pub fn delivery_exhausted(correlation_id: impl Into<String>, attempts: u32) -> Error {
    Error::delivery_exhausted(correlation_id, attempts)
}

/// Create a QueueFull error
pub fn queue_full(capacity: usize) -> Error {
    Error::new(ErrorKind::QueueFull, format!("outbound queue is full ({} commands)", capacity))
        .with_context("capacity", capacity.to_string())
}

/// Create a DuplicateRequest error
pub fn duplicate_request(correlation_id: impl Into<String>) -> Error {
    let correlation_id = correlation_id.into();
    Error::new(
        ErrorKind::DuplicateRequest,
        format!("request '{}' is already outstanding", correlation_id),
    )
    .with_context("correlation_id", correlation_id)
}

/// Create a CommandRejected error from the host's reason
pub fn command_rejected(correlation_id: impl Into<String>, reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::CommandRejected, reason).with_context("correlation_id", correlation_id)
}

/// Create a ConfigInvalid error
pub fn config_invalid(message: impl Into<String>) -> Error {
    Error::config_invalid(message)
}

/// Create a ParseFailed error
pub fn parse_error(message: impl Into<String>) -> Error {
    Error::parse_failed(message)
}

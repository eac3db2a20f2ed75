//! # Message Codec
//!
//! JSON framing for [`Message`]s. `encode` and `decode` are lossless for
//! well-formed input; [`Codec`] pairs them with a [`Validator`] so nothing
//! malformed leaves or enters the channel.

use crate::error::{self, Result};
use crate::message::{Message, TypedMessage};
use crate::validator::Validator;

/// Serialize a message into a frame
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| {
        error::serialization_error(e.to_string())
            .with_operation("codec::encode")
            .set_source(e)
    })
}

/// Parse a frame into a message. Anything that is not a JSON object is rejected.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| {
        error::validation_failed(format!("malformed frame: {}", e))
            .with_operation("codec::decode")
            .set_source(e)
    })?;

    if !value.is_object() {
        return Err(error::validation_failed("message must be a JSON object")
            .with_operation("codec::decode"));
    }

    serde_json::from_value(value).map_err(|e| {
        error::validation_failed(format!("malformed message: {}", e))
            .with_operation("codec::decode")
            .set_source(e)
    })
}

/// Validating codec used at the channel boundary
#[derive(Debug, Clone, Default)]
pub struct Codec {
    validator: Validator,
}

impl Codec {
    pub fn new(validator: Validator) -> Self {
        Self { validator }
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Validate an outbound command and serialize it
    pub fn encode_command(&self, command: &Message) -> Result<Vec<u8>> {
        self.validator.validate(command)?;
        encode(command)
    }

    /// Decode an inbound frame and validate it.
    ///
    /// A frame that decodes but fails validation is returned alongside the error
    /// so the caller can still route a rejection by correlation id.
    pub fn decode_inbound(&self, bytes: &[u8]) -> std::result::Result<(Message, TypedMessage), Inbound> {
        let message = decode(bytes).map_err(Inbound::Malformed)?;
        match self.validator.validate(&message) {
            Ok(typed) => Ok((message, typed)),
            Err(err) => Err(Inbound::Invalid(message, err)),
        }
    }
}

/// Why an inbound frame could not be accepted
#[derive(Debug)]
pub enum Inbound {
    /// Not parseable as a message at all
    Malformed(error::Error),
    /// Parsed, but rejected by the validator
    Invalid(Message, error::Error),
}

impl Inbound {
    pub fn into_error(self) -> error::Error {
        match self {
            Inbound::Malformed(e) | Inbound::Invalid(_, e) => e,
        }
    }
}

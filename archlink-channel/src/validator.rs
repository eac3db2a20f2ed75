//! # Message Validator
//!
//! Two passes over every message crossing the channel:
//! 1. structural: `category` and `type` present
//! 2. category-specific: the fields each category requires
//!
//! All missing fields from both passes are reported together. A present
//! `api_key` must pass the configured [`CredentialCheck`]; its absence is not an
//! error since mandatory authentication happens at the handshake.

use crate::error::{self, Result};
use crate::message::{
    ArchitectMessage, Category, EnvironmentMessage, Message, SystemMessage, TypedMessage,
    UiMessage,
};
use serde_json::Value;
use std::sync::Arc;

/// Pluggable credential check for messages that carry an `api_key`
pub trait CredentialCheck: Send + Sync {
    fn verify(&self, api_key: &str) -> bool;
}

/// Accepts any credential
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyKey;

impl CredentialCheck for AcceptAnyKey {
    fn verify(&self, _api_key: &str) -> bool {
        true
    }
}

/// Accepts exactly one shared key
#[derive(Debug, Clone)]
pub struct SharedKey(String);

impl SharedKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl CredentialCheck for SharedKey {
    fn verify(&self, api_key: &str) -> bool {
        self.0 == api_key
    }
}

/// Outcome of [`Validator::report`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct Validator {
    credentials: Arc<dyn CredentialCheck>,
    strict_categories: bool,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("strict_categories", &self.strict_categories)
            .finish_non_exhaustive()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self {
            credentials: Arc::new(AcceptAnyKey),
            strict_categories: false,
        }
    }

    pub fn with_credentials(mut self, check: Arc<dyn CredentialCheck>) -> Self {
        self.credentials = check;
        self
    }

    /// Reject categories outside the four known ones instead of accepting them permissively
    pub fn with_strict_categories(mut self, strict: bool) -> Self {
        self.strict_categories = strict;
        self
    }

    /// Validate a message and return its typed view
    pub fn validate(&self, message: &Message) -> Result<TypedMessage> {
        self.check(message)
            .map_err(|e| e.with_operation("validator::validate"))
    }

    /// Validate without raising, for callers that only want `{valid, reason}`
    pub fn report(&self, message: &Message) -> ValidationReport {
        match self.check(message) {
            Ok(_) => ValidationReport { valid: true, reason: None },
            Err(e) => ValidationReport {
                valid: false,
                reason: Some(e.message().to_string()),
            },
        }
    }

    fn check(&self, message: &Message) -> Result<TypedMessage> {
        let mut missing: Vec<&'static str> = Vec::new();
        if message.category.is_empty() {
            missing.push("category");
        }
        if message.kind.is_empty() {
            missing.push("type");
        }

        let category = message.category();
        if let Some(category) = category {
            missing.extend(required_fields(category, message));
        }

        if !missing.is_empty() {
            return Err(error::missing_fields(&missing)
                .with_context("category", message.category.clone()));
        }

        if let Some(key) = &message.api_key {
            if !self.credentials.verify(key) {
                return Err(error::unauthenticated());
            }
        }

        match category {
            Some(category) => Ok(typed(category, message)),
            None if self.strict_categories => Err(error::validation_failed(format!(
                "invalid message category: {}",
                message.category
            ))
            .with_context("category", message.category.clone())),
            None => Ok(TypedMessage::Other {
                category: message.category.clone(),
                kind: message.kind.clone(),
            }),
        }
    }
}

fn required_fields(category: Category, message: &Message) -> Vec<&'static str> {
    let wanted: &[&'static str] = match category {
        Category::System => &[],
        Category::Environment => &["state_type", "state_data"],
        Category::Ui => &["action", "data"],
        Category::Architect => match message.kind.as_str() {
            "request" => &["message", "metadata"],
            "response" => &["status"],
            "state_update" => &["state"],
            _ => &[],
        },
    };

    let mut missing: Vec<&'static str> = wanted
        .iter()
        .copied()
        .filter(|field| message.field(field).is_none())
        .collect();

    if category == Category::System && message.timestamp.is_none() {
        missing.push("timestamp");
    }
    missing
}

// Only called once required_fields() reported nothing missing.
fn typed(category: Category, message: &Message) -> TypedMessage {
    let get = |key: &str| message.field(key).cloned().unwrap_or(Value::Null);

    match category {
        Category::System => TypedMessage::System(SystemMessage {
            kind: message.kind.clone(),
            timestamp: message.timestamp.clone().unwrap_or_default(),
        }),
        Category::Architect => TypedMessage::Architect(match message.kind.as_str() {
            "request" => ArchitectMessage::Request {
                message: get("message"),
                metadata: get("metadata"),
            },
            "response" => ArchitectMessage::Response { status: get("status") },
            "state_update" => ArchitectMessage::StateUpdate { state: get("state") },
            other => ArchitectMessage::Command { kind: other.to_string() },
        }),
        Category::Environment => TypedMessage::Environment(EnvironmentMessage {
            kind: message.kind.clone(),
            state_type: match get("state_type") {
                Value::String(s) => s,
                other => other.to_string(),
            },
            state_data: get("state_data"),
        }),
        Category::Ui => TypedMessage::Ui(UiMessage {
            kind: message.kind.clone(),
            action: match get("action") {
                Value::String(s) => s,
                other => other.to_string(),
            },
            data: get("data"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn msg(value: Value) -> Message {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_missing_category_and_type() {
        let validator = Validator::new();
        let err = validator.validate(&msg(json!({"content": "hello"}))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert!(err.message().contains("category"));
        assert!(err.message().contains("type"));

        let report = validator.report(&msg(json!({"category": "ui"})));
        assert!(!report.valid);
        assert!(!report.reason.unwrap().is_empty());
    }

    #[test]
    fn test_environment_requires_state_fields() {
        let validator = Validator::new();
        let err = validator
            .validate(&msg(json!({"category": "environment"})))
            .unwrap_err();
        assert!(err.message().contains("state_type"));
        assert!(err.message().contains("state_data"));

        let err = validator
            .validate(&msg(json!({"category": "environment", "type": "state", "state_type": "scene"})))
            .unwrap_err();
        assert_eq!(err.message(), "missing required field(s): state_data");
    }

    #[test]
    fn test_system_requires_timestamp() {
        let validator = Validator::new();
        assert!(validator.validate(&Message::new(Category::System, "ping")).is_err());
        assert!(validator.validate(&Message::disconnect()).is_ok());
    }

    #[test]
    fn test_architect_subtypes() {
        let validator = Validator::new();

        let request = Message::architect_request("build a tower", json!({"agent": "a1"}));
        match validator.validate(&request).unwrap() {
            TypedMessage::Architect(ArchitectMessage::Request { message, .. }) => {
                assert_eq!(message, json!("build a tower"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let response = Message::new(Category::Architect, "response");
        assert!(validator.validate(&response).unwrap_err().message().contains("status"));

        let update = Message::new(Category::Architect, "state_update");
        assert!(validator.validate(&update).unwrap_err().message().contains("state"));

        let action = Message::new(Category::Architect, "place_model");
        assert!(validator.validate(&action).is_ok());
    }

    #[test]
    fn test_ui_requires_action_and_data() {
        let validator = Validator::new();
        let ui = Message::new(Category::Ui, "event").with_field("action", "click");
        assert!(validator.validate(&ui).unwrap_err().message().contains("data"));
    }

    #[test]
    fn test_unknown_category_permissive_by_default() {
        let unknown = msg(json!({"category": "telemetry", "type": "tick"}));

        let typed = Validator::new().validate(&unknown).unwrap();
        assert_eq!(typed.category(), None);

        let err = Validator::new()
            .with_strict_categories(true)
            .validate(&unknown)
            .unwrap_err();
        assert!(err.message().contains("telemetry"));
    }

    #[test]
    fn test_credential_check() {
        let validator = Validator::new().with_credentials(Arc::new(SharedKey::new("good")));

        let err = validator.validate(&Message::handshake("bad")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);

        assert!(validator.validate(&Message::handshake("good")).is_ok());
        // no key at all is fine
        assert!(validator.validate(&Message::disconnect()).is_ok());
    }
}

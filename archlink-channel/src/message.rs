//! # Wire Messages
//!
//! Every frame crossing the channel is a JSON object with a `category` and a
//! `type`, optional `timestamp`, `api_key` and `correlation_id`, plus
//! category-specific fields. [`Message`] is the loose envelope exactly as it
//! travels on the wire; [`TypedMessage`] is the checked view produced by the
//! validator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Message category on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    System,
    Architect,
    Environment,
    Ui,
}

impl Category {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Category::System),
            "architect" => Some(Category::Architect),
            "environment" => Some(Category::Environment),
            "ui" => Some(Category::Ui),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::System => "system",
            Category::Architect => "architect",
            Category::Environment => "environment",
            Category::Ui => "ui",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wire message envelope.
///
/// Missing `category`/`type` decode as empty strings so the validator can
/// report them; unrecognised fields are kept in `fields` and written back
/// unchanged on encode.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub category: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Message {
    pub fn new(category: Category, kind: impl Into<String>) -> Self {
        Self {
            category: category.as_str().to_string(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// `{category: "system", type: "handshake", timestamp, api_key}`
    pub fn handshake(api_key: impl Into<String>) -> Self {
        Self::new(Category::System, "handshake")
            .stamped()
            .with_api_key(api_key)
    }

    /// `{category: "system", type: "disconnect", timestamp}`
    pub fn disconnect() -> Self {
        Self::new(Category::System, "disconnect").stamped()
    }

    /// Architect request carrying a free-form message and its metadata
    pub fn architect_request(message: impl Into<Value>, metadata: Value) -> Self {
        Self::new(Category::Architect, "request")
            .with_field("message", message)
            .with_field("metadata", metadata)
    }

    /// Environment state push
    pub fn environment(kind: impl Into<String>, state_type: impl Into<String>, state_data: Value) -> Self {
        Self::new(Category::Environment, kind)
            .with_field("state_type", state_type.into())
            .with_field("state_data", state_data)
    }

    /// Set the timestamp to now (RFC 3339)
    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(now_iso8601());
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Get a category-specific field
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// The recognised category, if any
    pub fn category(&self) -> Option<Category> {
        Category::parse(&self.category)
    }

    pub fn is(&self, category: Category, kind: &str) -> bool {
        self.category() == Some(category) && self.kind == kind
    }

    /// State pushes are never treated as replies by the legacy heuristic.
    pub fn is_state_push(&self) -> bool {
        self.category() == Some(Category::Environment) || self.kind == "state_update"
    }

    /// The `status` field of a reply, when it is a string
    pub fn status(&self) -> Option<&str> {
        self.field("status").and_then(|v| v.as_str())
    }

    /// Short description for logs, never includes the credential
    pub fn describe(&self) -> String {
        match &self.correlation_id {
            Some(id) => format!("{}/{} [{}]", self.category, self.kind, id),
            None => format!("{}/{}", self.category, self.kind),
        }
    }
}

/// Current time as an ISO-8601 string
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ============================================================================
// Typed view
// ============================================================================

/// A message whose category-specific fields have been checked.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedMessage {
    System(SystemMessage),
    Architect(ArchitectMessage),
    Environment(EnvironmentMessage),
    Ui(UiMessage),
    /// Unrecognised category accepted by the permissive default
    Other { category: String, kind: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemMessage {
    pub kind: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArchitectMessage {
    Request { message: Value, metadata: Value },
    Response { status: Value },
    StateUpdate { state: Value },
    /// Any other architect message type, e.g. an autonomous action
    Command { kind: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentMessage {
    pub kind: String,
    pub state_type: String,
    pub state_data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UiMessage {
    pub kind: String,
    pub action: String,
    pub data: Value,
}

impl TypedMessage {
    pub fn category(&self) -> Option<Category> {
        match self {
            TypedMessage::System(_) => Some(Category::System),
            TypedMessage::Architect(_) => Some(Category::Architect),
            TypedMessage::Environment(_) => Some(Category::Environment),
            TypedMessage::Ui(_) => Some(Category::Ui),
            TypedMessage::Other { .. } => None,
        }
    }
}

//! Autonomous action gate.
//!
//! Actions produced by unattended decision loops pass through [`AutonomousGate::admit`]
//! before they may reach the outbound queue. Kinds in the critical set are
//! always withheld for approval.

use crate::message::{Category, Message};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Action kinds that always need approval unless configured otherwise
pub const DEFAULT_CRITICAL_ACTIONS: [&str; 3] =
    ["delete_environment", "reset_scene", "modify_core_settings"];

/// An action proposed by an autonomous decision loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutonomousAction {
    pub kind: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl AutonomousAction {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameters: Map::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Build the wire command for this action.
    ///
    /// An approved critical action is sent through this by the user-driven path.
    pub fn into_command(self) -> Message {
        Message::new(Category::Architect, self.kind)
            .with_field("parameters", Value::Object(self.parameters))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted(AutonomousAction),
    NeedsApproval(AutonomousAction),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

#[derive(Debug, Clone)]
pub struct AutonomousGate {
    critical: BTreeSet<String>,
}

impl Default for AutonomousGate {
    fn default() -> Self {
        Self::new(DEFAULT_CRITICAL_ACTIONS)
    }
}

impl AutonomousGate {
    pub fn new<I, S>(critical: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            critical: critical.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_critical(&self, kind: &str) -> bool {
        self.critical.contains(kind)
    }

    pub fn admit(&self, action: AutonomousAction) -> Admission {
        if self.is_critical(&action.kind) {
            Admission::NeedsApproval(action)
        } else {
            Admission::Admitted(action)
        }
    }

    pub fn critical_actions(&self) -> impl Iterator<Item = &str> {
        self.critical.iter().map(String::as_str)
    }
}

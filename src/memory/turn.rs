//! Conversation turns and their wire representation
//!
//! A turn serializes as `{"type": "human"|"ai", "data": {"content", "additional_kwargs", "example"}}`.
//! Keys the service does not know about are carried along untouched so a
//! history posted by a client comes back byte-for-byte equivalent.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Speaker of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
}

impl Role {
    /// Prefix used when the turn is rendered into a prompt
    pub fn prefix(&self) -> &'static str {
        match self {
            Role::Human => "Human",
            Role::Ai => "AI",
        }
    }
}

/// Payload of a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnData {
    pub content: String,
    #[serde(default)]
    pub additional_kwargs: Map<String, Value>,
    #[serde(default)]
    pub example: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(rename = "type")]
    pub role: Role,
    pub data: TurnData,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            data: TurnData {
                content: content.into(),
                additional_kwargs: Map::new(),
                example: false,
                extra: Map::new(),
            },
            extra: Map::new(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::new(Role::Human, content)
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self::new(Role::Ai, content)
    }

    pub fn content(&self) -> &str {
        &self.data.content
    }

    /// Number of top-level keys in the serialized record (`type`, `data`, plus unknown keys)
    pub fn field_count(&self) -> usize {
        2 + self.extra.len()
    }

    /// `Human: ...` / `AI: ...` line for prompt rendering
    pub fn render(&self) -> String {
        format!("{}: {}", self.role.prefix(), self.data.content)
    }
}

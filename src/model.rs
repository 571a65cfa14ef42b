//! Shared value types exchanged between the worker and the UI surfaces.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reference to a piece of UI text (a key into the embedding application's
/// localization table). The orchestrator never renders text itself; it only
/// carries references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextRef(String);

impl TextRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TextRef {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Terminal outcome of a worker command, delivered with the stop event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    /// Human-readable detail for failures; `None` on clean success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ActionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Observed state of the persisted store at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStamp {
    pub exists: bool,
    /// Last modification time (epoch millis) when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
    /// Size in bytes when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl StoreStamp {
    pub fn new(exists: bool, modified_at: Option<i64>, size: Option<u64>) -> Self {
        Self {
            exists,
            modified_at,
            size,
        }
    }
}

/// Divergence between the session's last observed store state and what is
/// now persisted externally. Produced by the worker, consumed once by the
/// conflict surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSnapshot {
    pub previous: StoreStamp,
    pub incoming: StoreStamp,
}

/// The user's answer to a store conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Adopt the external state: delegates to the worker's resync operation.
    AcceptExternal,
    /// Keep the in-memory session as-is.
    Ignore,
}

//! Command catalog and dispatch.
//!
//! A [`Command`] is an identifier plus an ordered parameter bag. The
//! identifier determines which parameters are required, and the requirement
//! is checked when the command is built, not when the worker unpacks it.
//! [`dispatch`] delivers a command to the worker's entry point, always
//! stopping any stale outstanding request first so a new dispatch supersedes
//! any prior in-flight command.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, StrongroomError};
use crate::worker::WorkerTransport;

/// Parameter keys shared across the command catalog.
pub mod keys {
    pub const STORE_URI: &str = "store-uri";
    pub const CREDENTIALS: &str = "credentials";
    pub const CREDENTIAL_CACHE: &str = "credential-cache";
    pub const READ_ONLY: &str = "read-only";
    pub const FIX_DUPLICATE_IDS: &str = "fix-duplicate-ids";
    pub const GROUP: &str = "group";
    pub const GROUP_ID: &str = "group-id";
    pub const ENTRY: &str = "entry";
    pub const ENTRY_ID: &str = "entry-id";
    pub const PARENT_ID: &str = "parent-id";
    pub const GROUP_IDS: &str = "group-ids";
    pub const ENTRY_IDS: &str = "entry-ids";
    pub const HISTORY_POSITION: &str = "history-position";
    pub const OLD: &str = "old";
    pub const NEW: &str = "new";
    pub const PERSIST: &str = "persist";
}

/// The fixed catalog of worker command identifiers.
///
/// Wire names are kebab-case (`update-name`, `delete-nodes`, ...). The
/// orchestrator is otherwise schema-agnostic: each identifier declares its
/// required parameter keys and nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandId {
    Create,
    Load,
    Reload,
    AssignCredentials,
    CreateGroup,
    UpdateGroup,
    CreateEntry,
    UpdateEntry,
    CopyNodes,
    MoveNodes,
    DeleteNodes,
    RestoreEntryHistory,
    DeleteEntryHistory,
    UpdateName,
    UpdateDescription,
    UpdateDefaultUsername,
    UpdateColor,
    UpdateCompression,
    UpdateEncryption,
    UpdateKeyDerivation,
    UpdateIterations,
    UpdateMemoryUsage,
    UpdateParallelism,
    UpdateMaxHistoryItems,
    UpdateMaxHistorySize,
    RemoveUnlinkedData,
    Save,
}

impl CommandId {
    /// The identifier's wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandId::Create => "create",
            CommandId::Load => "load",
            CommandId::Reload => "reload",
            CommandId::AssignCredentials => "assign-credentials",
            CommandId::CreateGroup => "create-group",
            CommandId::UpdateGroup => "update-group",
            CommandId::CreateEntry => "create-entry",
            CommandId::UpdateEntry => "update-entry",
            CommandId::CopyNodes => "copy-nodes",
            CommandId::MoveNodes => "move-nodes",
            CommandId::DeleteNodes => "delete-nodes",
            CommandId::RestoreEntryHistory => "restore-entry-history",
            CommandId::DeleteEntryHistory => "delete-entry-history",
            CommandId::UpdateName => "update-name",
            CommandId::UpdateDescription => "update-description",
            CommandId::UpdateDefaultUsername => "update-default-username",
            CommandId::UpdateColor => "update-color",
            CommandId::UpdateCompression => "update-compression",
            CommandId::UpdateEncryption => "update-encryption",
            CommandId::UpdateKeyDerivation => "update-key-derivation",
            CommandId::UpdateIterations => "update-iterations",
            CommandId::UpdateMemoryUsage => "update-memory-usage",
            CommandId::UpdateParallelism => "update-parallelism",
            CommandId::UpdateMaxHistoryItems => "update-max-history-items",
            CommandId::UpdateMaxHistorySize => "update-max-history-size",
            CommandId::RemoveUnlinkedData => "remove-unlinked-data",
            CommandId::Save => "save",
        }
    }

    /// Parameter keys that must be present for this identifier.
    pub fn required_params(&self) -> &'static [&'static str] {
        use keys::*;
        match self {
            CommandId::Create | CommandId::AssignCredentials => &[STORE_URI, CREDENTIALS],
            CommandId::Load => &[STORE_URI, CREDENTIALS, READ_ONLY, FIX_DUPLICATE_IDS],
            CommandId::Reload => &[FIX_DUPLICATE_IDS],
            CommandId::CreateGroup => &[GROUP, PARENT_ID, PERSIST],
            CommandId::UpdateGroup => &[GROUP_ID, GROUP, PERSIST],
            CommandId::CreateEntry => &[ENTRY, PARENT_ID, PERSIST],
            CommandId::UpdateEntry => &[ENTRY_ID, ENTRY, PERSIST],
            CommandId::CopyNodes | CommandId::MoveNodes => {
                &[GROUP_IDS, ENTRY_IDS, PARENT_ID, PERSIST]
            }
            CommandId::DeleteNodes => &[GROUP_IDS, ENTRY_IDS, PERSIST],
            CommandId::RestoreEntryHistory | CommandId::DeleteEntryHistory => {
                &[ENTRY_ID, HISTORY_POSITION, PERSIST]
            }
            CommandId::UpdateName
            | CommandId::UpdateDescription
            | CommandId::UpdateDefaultUsername
            | CommandId::UpdateColor
            | CommandId::UpdateCompression
            | CommandId::UpdateEncryption
            | CommandId::UpdateKeyDerivation
            | CommandId::UpdateIterations
            | CommandId::UpdateMemoryUsage
            | CommandId::UpdateParallelism
            | CommandId::UpdateMaxHistoryItems
            | CommandId::UpdateMaxHistorySize => &[OLD, NEW, PERSIST],
            CommandId::RemoveUnlinkedData | CommandId::Save => &[PERSIST],
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single parameter value.
///
/// Untagged: the wire form of a bag is a plain JSON object, e.g.
/// `{"old": "Vault", "new": "Personal", "persist": true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Text(String),
    /// Identifier lists (node sets).
    List(Vec<String>),
    /// Opaque structured payloads (group/entry bodies, credentials).
    Node(serde_json::Value),
}

/// Insertion-ordered `key -> value` parameter bag.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParamBag {
    entries: Vec<(String, ParamValue)>,
}

impl ParamBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing an earlier value under the same key in
    /// place (insertion order is part of the bag's identity).
    pub fn insert(&mut self, key: impl Into<String>, value: ParamValue) -> &mut Self {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    pub fn text(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.insert(key, ParamValue::Text(value.into()))
    }

    pub fn int(&mut self, key: impl Into<String>, value: i64) -> &mut Self {
        self.insert(key, ParamValue::Int(value))
    }

    pub fn flag(&mut self, key: impl Into<String>, value: bool) -> &mut Self {
        self.insert(key, ParamValue::Bool(value))
    }

    pub fn list(&mut self, key: impl Into<String>, value: Vec<String>) -> &mut Self {
        self.insert(key, ParamValue::List(value))
    }

    pub fn node(&mut self, key: impl Into<String>, value: serde_json::Value) -> &mut Self {
        self.insert(key, ParamValue::Node(value))
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Serialize for ParamBag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ParamBag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct BagVisitor;

        impl<'de> Visitor<'de> for BagVisitor {
            type Value = ParamBag;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a parameter map")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut bag = ParamBag::new();
                while let Some((key, value)) = access.next_entry::<String, ParamValue>()? {
                    bag.insert(key, value);
                }
                Ok(bag)
            }
        }

        deserializer.deserialize_map(BagVisitor)
    }
}

/// A command identifier plus its parameter bag. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "command")]
    id: CommandId,
    params: ParamBag,
}

impl Command {
    /// Build a command, validating the identifier's required parameters.
    ///
    /// # Errors
    ///
    /// Returns `MissingParam` naming the first absent required key.
    pub fn new(id: CommandId, params: ParamBag) -> Result<Self> {
        for key in id.required_params() {
            if !params.contains(key) {
                return Err(StrongroomError::MissingParam { command: id, key });
            }
        }
        Ok(Self { id, params })
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn params(&self) -> &ParamBag {
        &self.params
    }
}

/// Deliver a command to the worker's entry point.
///
/// Any previous outstanding request addressed to the worker is stopped
/// first, so two overlapping commands never collide on the same transport
/// endpoint. Errors from either step are returned to the caller (the
/// [`crate::client::TaskClient`] contains them at the dispatch boundary).
pub fn dispatch<T: WorkerTransport + ?Sized>(transport: &mut T, command: &Command) -> Result<()> {
    transport.stop_current()?;
    transport.start(command)
}

//! Domain model types used throughout idsync.
//!
//! These types bridge the directory clients, the diff engine, the
//! reconciler and the audit store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Attribute tree
// ---------------------------------------------------------------------------

/// A source-native attribute tree.
///
/// Deserializes directly from identity provider JSON, so a SCIM resource can
/// be stored as-is in [`IdentityRecord::raw_attributes`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    /// Look up a key when this value is a map.
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        match self {
            Self::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Look up an element when this value is a list.
    pub fn index(&self, idx: usize) -> Option<&AttributeValue> {
        match self {
            Self::List(items) => items.get(idx),
            _ => None,
        }
    }

    /// Borrow the inner string, if this is a string leaf.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render a scalar leaf as a directory attribute value.
    ///
    /// Empty strings, `Null`, lists and maps yield `None`.
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            Self::String(s) if !s.is_empty() => Some(s.clone()),
            Self::Number(n) => Some(n.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Render this value as zero or more directory attribute values.
    ///
    /// A list of scalars becomes a multi-valued attribute. Maps and nested
    /// lists are not representable and yield nothing.
    pub fn target_values(&self) -> Vec<String> {
        match self {
            Self::List(items) => items.iter().filter_map(Self::scalar_string).collect(),
            other => other.scalar_string().into_iter().collect(),
        }
    }
}

impl From<serde_json::Value> for AttributeValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// Flat target attribute set produced by the mapper: attribute name to one
/// or more values.
pub type TargetAttributes = BTreeMap<String, Vec<String>>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Which directory produced a record snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    /// The authoritative cloud identity provider.
    #[default]
    IdentityProvider,
    /// The local LDAP directory.
    Directory,
}

impl std::fmt::Display for RecordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdentityProvider => write!(f, "identity_provider"),
            Self::Directory => write!(f, "directory"),
        }
    }
}

/// Entity kind, used in logs, error messages and the audit store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Group,
}

impl EntityKind {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// A user snapshot from either directory. `username` is the join key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub display_name: Option<String>,
    #[serde(default)]
    pub group_memberships: BTreeSet<String>,
    pub source: RecordSource,
    #[serde(default)]
    pub raw_attributes: AttributeValue,
}

impl IdentityRecord {
    /// Create a record with only the join key set.
    pub fn new(username: impl Into<String>, source: RecordSource) -> Self {
        let username = username.into();
        Self {
            id: username.clone(),
            username,
            email: None,
            given_name: None,
            family_name: None,
            display_name: None,
            group_memberships: BTreeSet::new(),
            source,
            raw_attributes: AttributeValue::Null,
        }
    }
}

/// A group snapshot from either directory. `name` is the join key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: String,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// Member join keys (usernames).
    #[serde(default)]
    pub members: BTreeSet<String>,
    pub source: RecordSource,
    #[serde(default)]
    pub raw_attributes: AttributeValue,
}

impl GroupRecord {
    /// Create a record with only the join key set.
    pub fn new(name: impl Into<String>, source: RecordSource) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            display_name: None,
            description: None,
            members: BTreeSet::new(),
            source,
            raw_attributes: AttributeValue::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Per-kind counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounters {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Records that matched and needed no change.
    #[serde(default)]
    pub unchanged: u64,
    /// Records whose apply step failed.
    #[serde(default)]
    pub failed: u64,
}

/// Statistics accumulated over one run.
///
/// Owned by the reconciler for the length of the run and passed by mutable
/// reference into every apply step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub users: EntityCounters,
    pub groups: EntityCounters,
    pub errors: Vec<String>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutable counters for one entity kind.
    pub fn counters_mut(&mut self, kind: EntityKind) -> &mut EntityCounters {
        match kind {
            EntityKind::User => &mut self.users,
            EntityKind::Group => &mut self.groups,
        }
    }

    pub fn counters(&self, kind: EntityKind) -> &EntityCounters {
        match kind {
            EntityKind::User => &self.users,
            EntityKind::Group => &self.groups,
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Total records examined across both kinds.
    pub fn total_processed(&self) -> u64 {
        self.users.processed + self.groups.processed
    }

    /// Audit details blob: `{"stats": {"users": .., "groups": ..}, "errors": [..]}`.
    pub fn to_details(&self) -> serde_json::Value {
        serde_json::json!({
            "stats": {
                "users": self.users,
                "groups": self.groups,
            },
            "errors": self.errors,
        })
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialFailure,
    Error,
}

impl RunStatus {
    /// Parse a stored status string. Unknown values read as `Error`.
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "partial_failure" => Self::PartialFailure,
            _ => Self::Error,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::PartialFailure => write!(f, "partial_failure"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Run type key under which audit status is stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    FullSync,
    UsersSync,
    GroupsSync,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullSync => "full_sync",
            Self::UsersSync => "users_sync",
            Self::GroupsSync => "groups_sync",
        }
    }
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Audit records
// ---------------------------------------------------------------------------

/// Latest outcome for one run type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sync_type: String,
    pub last_sync: DateTime<Utc>,
    pub status: RunStatus,
    pub details: serde_json::Value,
}

/// Last-known state of one entity written after a successful apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub kind: EntityKind,
    pub join_key: String,
    pub source_id: String,
    pub source: RecordSource,
    pub attributes: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl EntitySnapshot {
    pub fn from_user(user: &IdentityRecord) -> Self {
        Self {
            kind: EntityKind::User,
            join_key: user.username.clone(),
            source_id: user.id.clone(),
            source: user.source,
            attributes: serde_json::json!({
                "email": user.email,
                "given_name": user.given_name,
                "family_name": user.family_name,
                "display_name": user.display_name,
                "groups": user.group_memberships,
            }),
            updated_at: Utc::now(),
        }
    }

    pub fn from_group(group: &GroupRecord) -> Self {
        Self {
            kind: EntityKind::Group,
            join_key: group.name.clone(),
            source_id: group.id.clone(),
            source: group.source,
            attributes: serde_json::json!({
                "display_name": group.display_name,
                "description": group.description,
                "members": group.members,
            }),
            updated_at: Utc::now(),
        }
    }
}

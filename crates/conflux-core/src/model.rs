use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

const MAX_SEGMENT_LEN: usize = 128;

/// Logical grouping (usually an environment name) that scopes keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        validate_segment(&raw, "namespace")?;
        // `_` prefixed paths are reserved for administrative resources.
        if raw.starts_with('_') {
            return Err(CoreError::invalid(format!(
                "namespace `{raw}` uses the reserved `_` prefix"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Key within a namespace. May contain `/` separated segments (`secrets/db-password`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key(String);

impl Key {
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(CoreError::invalid("key must not be empty"));
        }
        for segment in raw.split('/') {
            validate_segment(segment, "key segment")?;
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_segment(raw: &str, what: &str) -> Result<(), CoreError> {
    if raw.is_empty() {
        return Err(CoreError::invalid(format!("{what} must not be empty")));
    }
    if raw.len() > MAX_SEGMENT_LEN {
        return Err(CoreError::invalid(format!(
            "{what} exceeds {MAX_SEGMENT_LEN} characters"
        )));
    }
    if let Some(bad) = raw
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(CoreError::invalid(format!(
            "{what} `{raw}` contains invalid character `{bad}`"
        )));
    }
    Ok(())
}

macro_rules! string_newtype_conversions {
    ($name:ident) => {
        impl TryFrom<String> for $name {
            type Error = CoreError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                $name::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_newtype_conversions!(Namespace);
string_newtype_conversions!(Key);

/// Identity of a caller, supplied by an external authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(subject: impl Into<String>) -> Result<Self, CoreError> {
        let subject = subject.into();
        if subject.trim().is_empty() {
            return Err(CoreError::invalid("principal must not be empty"));
        }
        Ok(Self(subject))
    }

    /// Principal used for writes the core performs on its own behalf.
    pub fn system(component: &str) -> Self {
        Self(format!("system:{component}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully qualified address of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    pub namespace: Namespace,
    pub key: Key,
}

impl EntryKey {
    pub fn new(namespace: Namespace, key: Key) -> Self {
        Self { namespace, key }
    }

    pub fn parse(namespace: &str, key: &str) -> Result<Self, CoreError> {
        Ok(Self::new(Namespace::new(namespace)?, Key::new(key)?))
    }

    /// Resource path used by policies and audit records: `namespace/key`.
    pub fn resource_path(&self) -> String {
        format!("{}/{}", self.namespace, self.key)
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

/// Per-key version number. Starts at 1 and never skips.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VersionId(pub u64);

impl VersionId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-namespace commit sequence; the consistency token handed to subscribers.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    pub const MAX: Self = Self(u64::MAX);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Revision {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Revision)
            .map_err(|_| CoreError::invalid(format!("invalid consistency token `{s}`")))
    }
}

/// Identifies which master key wrapped a data key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyVersion(pub u32);

impl KeyVersion {
    pub const FIRST: KeyVersion = KeyVersion(1);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for KeyVersion {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim_start_matches('v')
            .parse::<u32>()
            .map(KeyVersion)
            .map_err(|_| CoreError::invalid(format!("invalid key version `{s}`")))
    }
}

/// Envelope-encrypted secret payload. Plaintext never appears here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeCiphertext {
    /// Wrap nonce followed by the data key encrypted under the master key.
    #[serde(with = "b64")]
    pub data_key_ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    pub key_version: KeyVersion,
}

/// Stored value of a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryValue {
    Plain {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    Sealed {
        envelope: EnvelopeCiphertext,
    },
    /// Marks the key deleted; history stays readable by explicit version.
    Tombstone,
}

impl EntryValue {
    pub fn is_secret(&self) -> bool {
        matches!(self, EntryValue::Sealed { .. })
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, EntryValue::Tombstone)
    }

    pub fn key_version(&self) -> Option<KeyVersion> {
        match self {
            EntryValue::Sealed { envelope } => Some(envelope.key_version),
            _ => None,
        }
    }
}

/// One immutable version of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub revision: Revision,
    pub value: EntryValue,
    pub created_at: DateTime<Utc>,
    pub principal: Principal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Which version a read should resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionSelector {
    #[default]
    Latest,
    At(VersionId),
}

impl FromStr for VersionSelector {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.eq_ignore_ascii_case("latest") {
            return Ok(VersionSelector::Latest);
        }
        s.parse::<u64>()
            .map(|v| VersionSelector::At(VersionId(v)))
            .map_err(|_| CoreError::invalid(format!("invalid version selector `{s}`")))
    }
}

/// Operations a policy can permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Rotate,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Read, Action::Write, Action::Rotate];
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Rotate => "rotate",
        })
    }
}

impl FromStr for Action {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(Action::Read),
            "write" => Ok(Action::Write),
            "rotate" => Ok(Action::Rotate),
            other => Err(CoreError::invalid(format!("unknown action `{other}`"))),
        }
    }
}

/// Caller-supplied policy definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySpec {
    pub principal_pattern: String,
    pub resource_pattern: String,
    pub permitted_actions: BTreeSet<Action>,
}

/// Stored policy. `defined_seq` orders definitions for tie breaks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub principal_pattern: String,
    pub resource_pattern: String,
    pub permitted_actions: BTreeSet<Action>,
    pub defined_seq: u64,
    pub defined_at: DateTime<Utc>,
}

/// Subscriber identifier, chosen by the subscribing service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        validate_segment(&raw, "subscriber id")?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscriber_id: SubscriberId,
    pub namespace: Namespace,
    pub last_acked: Revision,
    /// Optional webhook that receives push hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A committed change as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub key: Key,
    pub version_id: VersionId,
    pub revision: Revision,
}

/// Cursor-based page request. The cursor is opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn first(limit: usize) -> Self {
        Self {
            cursor: None,
            limit: Some(limit),
        }
    }

    pub fn after(cursor: impl Into<String>, limit: usize) -> Self {
        Self {
            cursor: Some(cursor.into()),
            limit: Some(limit),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).max(1)
    }

    /// Numeric cursor: items strictly after this position are returned.
    pub fn numeric_cursor(&self) -> Result<u64, CoreError> {
        match &self.cursor {
            None => Ok(0),
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| CoreError::invalid(format!("invalid page cursor `{raw}`"))),
        }
    }
}

/// One page of a finite, restartable listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page; `None` once the listing is exhausted.
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next: None,
        }
    }
}

pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

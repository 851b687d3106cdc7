use thiserror::Error;
use uuid::Uuid;

use crate::model::{KeyVersion, Revision, VersionId};

/// Errors surfaced by the configuration and secrets core.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// The namespace/key has no visible versions.
    #[error("no versions found for {namespace}/{key}")]
    NotFound { namespace: String, key: String },
    /// An explicit version was requested that does not exist or was pruned.
    #[error("version {version} of {namespace}/{key} is not available")]
    VersionNotFound {
        namespace: String,
        key: String,
        version: VersionId,
    },
    /// Authorization refused the request.
    #[error("access denied: {reason}")]
    Denied { reason: String },
    /// Authentication tag check failed; the envelope is corrupt or tampered with.
    #[error("decryption failed: envelope authentication check did not pass")]
    DecryptionFailed,
    /// The envelope references a master key that is unknown or already retired.
    #[error("unknown or retired key version {0}")]
    UnknownKeyVersion(KeyVersion),
    /// An ack arrived behind the recorded position. Benign: acks race.
    #[error("stale ack: requested {requested}, already acknowledged {recorded}")]
    StaleAck {
        requested: Revision,
        recorded: Revision,
    },
    /// Re-encryption did not finish before the grace period expired.
    #[error("rotation incomplete: key {key_version} still referenced by {remaining} version(s)")]
    RotationIncomplete {
        key_version: KeyVersion,
        remaining: usize,
    },
    /// A conditional put lost the race against another writer.
    #[error("{namespace}/{key} moved on: expected latest version {expected}, found {found}")]
    Conflict {
        namespace: String,
        key: String,
        expected: VersionId,
        found: VersionId,
    },
    #[error("subscription {subscriber} on namespace {namespace} not found")]
    SubscriptionNotFound {
        subscriber: String,
        namespace: String,
    },
    #[error("policy {0} not found")]
    PolicyNotFound(Uuid),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("audit append failed: {reason}")]
    Audit { reason: String },
    #[error("storage failure: {reason}")]
    Storage { reason: String },
    #[error("crypto failure: {reason}")]
    Crypto { reason: String },
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Errors the caller can drop on the floor without escalating.
    pub fn is_benign(&self) -> bool {
        matches!(self, CoreError::StaleAck { .. })
    }

    pub fn storage<E: ToString>(err: E) -> Self {
        CoreError::Storage {
            reason: err.to_string(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        CoreError::InvalidInput(reason.into())
    }
}

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;

use crate::error::CoreError;

/// Errors produced by blob persistence implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlobError {
    /// Requested key does not exist.
    #[error("blob not found for key: {key}")]
    NotFound { key: String },
    /// Underlying storage failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

impl From<BlobError> for CoreError {
    fn from(err: BlobError) -> Self {
        CoreError::Storage {
            reason: err.to_string(),
        }
    }
}

/// Durable collection contract used for entries, policies, and subscriptions.
/// Keys are `/` separated paths such as `entries/prod/db/password`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist a value under a key, replacing any existing blob atomically.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), BlobError>;

    /// Retrieve the value for a key.
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    /// Remove a key and its value (idempotent).
    async fn delete(&self, key: &str) -> Result<(), BlobError>;

    /// List keys starting with `prefix`, in lexical order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError>;
}

/// In-memory blob store for tests and ephemeral deployments.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBlobStore {
    inner: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> BlobError {
    BlobError::Storage {
        reason: format!("lock poisoned: {err}"),
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), BlobError> {
        let mut map = self.inner.lock().map_err(poisoned)?;
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let map = self.inner.lock().map_err(poisoned)?;
        map.get(key).cloned().ok_or_else(|| BlobError::NotFound {
            key: key.to_string(),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let mut map = self.inner.lock().map_err(poisoned)?;
        map.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        let map = self.inner.lock().map_err(poisoned)?;
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

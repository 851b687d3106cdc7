use std::{
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use conflux_core::{model::KeyVersion, CoreError};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of master and data keys in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// Lifecycle of a master key version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KeyState {
    /// Used for new seals; at most one version is active.
    Active,
    /// Superseded; still opens envelopes. `retire_after` marks the end of the grace window.
    DecryptOnly {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retire_after: Option<DateTime<Utc>>,
    },
    /// Key bytes destroyed; envelopes wrapped by it can no longer be opened.
    Retired,
}

/// Master key material for one version. Bytes are zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub version: KeyVersion,
    pub state: KeyState,
    pub created_at: DateTime<Utc>,
    /// 256-bit symmetric key; empty once retired.
    pub bytes: Option<Zeroizing<[u8; KEY_SIZE]>>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log key bytes
        f.debug_struct("KeyMaterial")
            .field("version", &self.version)
            .field("state", &self.state)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    pub fn generate(version: KeyVersion) -> Self {
        Self {
            version,
            state: KeyState::Active,
            created_at: Utc::now(),
            bytes: Some(generate_key()),
        }
    }
}

/// Every known master key version, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet {
    pub keys: Vec<KeyMaterial>,
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("generation error: {0}")]
    Generation(String),
}

impl From<KeyError> for CoreError {
    fn from(err: KeyError) -> Self {
        CoreError::Crypto {
            reason: err.to_string(),
        }
    }
}

/// Persists master key sets (OS keychain in production; memory in tests).
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Load the stored key set; empty when nothing was stored yet.
    async fn load(&self) -> Result<KeySet, KeyError>;

    /// Replace the stored key set.
    async fn store(&self, keys: &KeySet) -> Result<(), KeyError>;
}

/// OS keyring-backed provider. Uses the `keyring` crate to store the key set.
pub struct KeyringProvider {
    service: String,
    account: String,
}

impl KeyringProvider {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, KeyError> {
        keyring::Entry::new(&self.service, &self.account).map_err(|e| KeyError::Keyring(e.to_string()))
    }
}

#[async_trait]
impl KeyProvider for KeyringProvider {
    async fn load(&self) -> Result<KeySet, KeyError> {
        // Keyring operations are synchronous; wrap in async for trait compatibility.
        match self.entry()?.get_password() {
            Ok(secret) => decode_key_set(&secret),
            Err(keyring::Error::NoEntry) => Ok(KeySet::default()),
            Err(err) => Err(KeyError::Keyring(err.to_string())),
        }
    }

    async fn store(&self, keys: &KeySet) -> Result<(), KeyError> {
        let encoded = encode_key_set(keys)?;
        self.entry()?
            .set_password(&encoded)
            .map_err(|e| KeyError::Keyring(e.to_string()))
    }
}

/// In-memory key provider for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl KeyProvider for InMemoryKeyProvider {
    async fn load(&self) -> Result<KeySet, KeyError> {
        let guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;
        match guard.as_deref() {
            Some(encoded) => decode_key_set(encoded),
            None => Ok(KeySet::default()),
        }
    }

    async fn store(&self, keys: &KeySet) -> Result<(), KeyError> {
        // Stored encoded, the same way the keyring sees it.
        let encoded = encode_key_set(keys)?;
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;
        *guard = Some(encoded);
        Ok(())
    }
}

pub(crate) fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
    let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(bytes.as_mut());
    bytes
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    version: KeyVersion,
    #[serde(flatten)]
    state: KeyState,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
}

fn encode_key_set(keys: &KeySet) -> Result<String, KeyError> {
    let stored: Vec<StoredKey> = keys
        .keys
        .iter()
        .map(|k| StoredKey {
            version: k.version,
            state: k.state,
            created_at: k.created_at,
            key: k.bytes.as_ref().map(|b| general_purpose::STANDARD.encode(b.as_slice())),
        })
        .collect();
    serde_json::to_string(&stored).map_err(|e| KeyError::Decode(e.to_string()))
}

fn decode_key_set(secret: &str) -> Result<KeySet, KeyError> {
    let stored: Vec<StoredKey> =
        serde_json::from_str(secret).map_err(|e| KeyError::Decode(e.to_string()))?;
    let mut keys = Vec::with_capacity(stored.len());
    for entry in stored {
        let bytes = match entry.key {
            Some(encoded) => Some(decode_key(&encoded)?),
            None => None,
        };
        if bytes.is_none() && entry.state != KeyState::Retired {
            return Err(KeyError::Decode(format!(
                "key {} has no material but is not retired",
                entry.version
            )));
        }
        keys.push(KeyMaterial {
            version: entry.version,
            state: entry.state,
            created_at: entry.created_at,
            bytes,
        });
    }
    keys.sort_by_key(|k| k.version);
    Ok(KeySet { keys })
}

fn decode_key(secret: &str) -> Result<Zeroizing<[u8; KEY_SIZE]>, KeyError> {
    let bytes = Zeroizing::new(
        general_purpose::STANDARD
            .decode(secret)
            .map_err(|e| KeyError::Decode(e.to_string()))?,
    );

    if bytes.len() != KEY_SIZE {
        return Err(KeyError::Decode(format!(
            "expected {KEY_SIZE} bytes, got {}",
            bytes.len()
        )));
    }

    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_provider_round_trips_key_sets() {
        let provider = InMemoryKeyProvider::default();
        assert!(provider.load().await.unwrap().keys.is_empty());

        let mut retired = KeyMaterial::generate(KeyVersion(1));
        retired.state = KeyState::Retired;
        retired.bytes = None;
        let active = KeyMaterial::generate(KeyVersion(2));
        let set = KeySet {
            keys: vec![retired, active],
        };

        provider.store(&set).await.unwrap();
        let loaded = provider.load().await.unwrap();
        assert_eq!(loaded, set);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = decode_key("abcd").expect_err("should reject wrong length");
        assert!(matches!(err, KeyError::Decode(_)));
    }

    #[test]
    fn decode_rejects_missing_material_for_live_keys() {
        let raw = r#"[{"version":1,"state":"active","created_at":"2026-01-01T00:00:00Z"}]"#;
        assert!(matches!(decode_key_set(raw), Err(KeyError::Decode(_))));
    }

    #[test]
    fn debug_output_omits_key_bytes() {
        let material = KeyMaterial::generate(KeyVersion(1));
        let rendered = format!("{material:?}");
        assert!(!rendered.contains("bytes"));
    }
}

//! Envelope encryption for secret values.
//!
//! Each seal draws a fresh data key, encrypts the plaintext with it (AES-256-GCM),
//! and wraps the data key with the master key named by the envelope's key version.
//! The wrap binds the key version as associated data, so relabelling an envelope
//! with another version fails authentication.

use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use chrono::{DateTime, Utc};
use conflux_core::{
    model::{EnvelopeCiphertext, KeyVersion},
    CoreError, CoreResult,
};
use rand::RngCore;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::key_provider::{generate_key, KeyMaterial, KeyProvider, KeySet, KeyState, KEY_SIZE};

/// Size of AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Summary of a master key version, safe to log or return to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    pub version: KeyVersion,
    pub state: KeyState,
    pub created_at: DateTime<Utc>,
}

/// Process-scoped master key state.
///
/// Init with [`MasterKeyring::load`]; keys are refreshed only through
/// [`MasterKeyring::reload`] or the rotation calls. Key bytes are zeroized when
/// the keyring (and every snapshot taken from it) is dropped.
pub struct MasterKeyring {
    provider: Arc<dyn KeyProvider>,
    keys: RwLock<KeySet>,
}

impl MasterKeyring {
    /// Load keys from `provider`, generating the first version when none exist.
    pub async fn load(provider: Arc<dyn KeyProvider>) -> CoreResult<Self> {
        let mut keys = provider.load().await?;
        if keys.keys.is_empty() {
            keys.keys.push(KeyMaterial::generate(KeyVersion::FIRST));
            provider.store(&keys).await?;
            info!(key_version = %KeyVersion::FIRST, "generated initial master key");
        }
        validate(&keys)?;
        Ok(Self {
            provider,
            keys: RwLock::new(keys),
        })
    }

    /// Re-read the key set from the provider.
    pub async fn reload(&self) -> CoreResult<()> {
        let fresh = self.provider.load().await?;
        validate(&fresh)?;
        *self.keys.write().await = fresh;
        debug!("master keys reloaded");
        Ok(())
    }

    pub async fn active_version(&self) -> CoreResult<KeyVersion> {
        let keys = self.keys.read().await;
        active(&keys).map(|k| k.version)
    }

    pub async fn info(&self, version: KeyVersion) -> Option<KeyInfo> {
        let keys = self.keys.read().await;
        keys.keys.iter().find(|k| k.version == version).map(info_of)
    }

    pub async fn list(&self) -> Vec<KeyInfo> {
        self.keys.read().await.keys.iter().map(info_of).collect()
    }

    /// Introduce a new active version. The previous active key becomes decrypt-only.
    #[instrument(skip(self))]
    pub async fn rotate(&self) -> CoreResult<KeyVersion> {
        let mut keys = self.keys.write().await;
        let mut next = keys.clone();
        let current = active(&next)?.version;
        for key in next.keys.iter_mut().filter(|k| k.state == KeyState::Active) {
            key.state = KeyState::DecryptOnly { retire_after: None };
        }
        let version = next
            .keys
            .iter()
            .map(|k| k.version)
            .max()
            .unwrap_or(current)
            .next();
        next.keys.push(KeyMaterial::generate(version));
        self.provider.store(&next).await?;
        *keys = next;
        info!(previous = %current, active = %version, "master key rotated");
        Ok(version)
    }

    /// Open the grace window of a decrypt-only key.
    pub async fn schedule_retirement(
        &self,
        version: KeyVersion,
        retire_after: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.update_state(version, |state| match state {
            KeyState::DecryptOnly { .. } => Ok(KeyState::DecryptOnly {
                retire_after: Some(retire_after),
            }),
            other => Err(CoreError::invalid(format!(
                "key {version} is {other:?}; only decrypt-only keys can be scheduled for retirement"
            ))),
        })
        .await
    }

    /// Destroy a decrypt-only key. Envelopes it wrapped can no longer be opened.
    #[instrument(skip(self))]
    pub async fn retire(&self, version: KeyVersion) -> CoreResult<()> {
        let mut keys = self.keys.write().await;
        let mut next = keys.clone();
        let key = next
            .keys
            .iter_mut()
            .find(|k| k.version == version)
            .ok_or(CoreError::UnknownKeyVersion(version))?;
        match key.state {
            KeyState::DecryptOnly { .. } => {
                key.state = KeyState::Retired;
                key.bytes = None;
            }
            KeyState::Retired => return Ok(()),
            KeyState::Active => {
                return Err(CoreError::invalid(format!(
                    "key {version} is active and cannot be retired"
                )))
            }
        }
        self.provider.store(&next).await?;
        *keys = next;
        warn!(key_version = %version, "master key retired");
        Ok(())
    }

    async fn update_state<F>(&self, version: KeyVersion, f: F) -> CoreResult<()>
    where
        F: FnOnce(KeyState) -> CoreResult<KeyState>,
    {
        let mut keys = self.keys.write().await;
        let mut next = keys.clone();
        let key = next
            .keys
            .iter_mut()
            .find(|k| k.version == version)
            .ok_or(CoreError::UnknownKeyVersion(version))?;
        key.state = f(key.state)?;
        self.provider.store(&next).await?;
        *keys = next;
        Ok(())
    }

    async fn material(&self, version: KeyVersion) -> CoreResult<(KeyState, Zeroizing<[u8; KEY_SIZE]>)> {
        let keys = self.keys.read().await;
        let key = keys
            .keys
            .iter()
            .find(|k| k.version == version)
            .ok_or(CoreError::UnknownKeyVersion(version))?;
        match (&key.state, &key.bytes) {
            (KeyState::Retired, _) | (_, None) => Err(CoreError::UnknownKeyVersion(version)),
            (state, Some(bytes)) => Ok((*state, bytes.clone())),
        }
    }
}

fn info_of(key: &KeyMaterial) -> KeyInfo {
    KeyInfo {
        version: key.version,
        state: key.state,
        created_at: key.created_at,
    }
}

fn active(keys: &KeySet) -> CoreResult<&KeyMaterial> {
    keys.keys
        .iter()
        .find(|k| k.state == KeyState::Active)
        .ok_or_else(|| CoreError::Crypto {
            reason: "no active master key".to_string(),
        })
}

fn validate(keys: &KeySet) -> CoreResult<()> {
    let active = keys
        .keys
        .iter()
        .filter(|k| k.state == KeyState::Active)
        .count();
    if active != 1 {
        return Err(CoreError::Crypto {
            reason: format!("expected exactly one active master key, found {active}"),
        });
    }
    Ok(())
}

/// Seals and opens [`EnvelopeCiphertext`] values. Stateless per call.
#[derive(Clone)]
pub struct EnvelopeManager {
    keyring: Arc<MasterKeyring>,
}

impl EnvelopeManager {
    pub fn new(keyring: Arc<MasterKeyring>) -> Self {
        Self { keyring }
    }

    pub fn keyring(&self) -> &Arc<MasterKeyring> {
        &self.keyring
    }

    /// Seal under the currently active master key.
    pub async fn seal_active(&self, plaintext: &[u8]) -> CoreResult<EnvelopeCiphertext> {
        let version = self.keyring.active_version().await?;
        self.seal(plaintext, version).await
    }

    #[instrument(skip_all, fields(key_version = %key_version, len = plaintext.len()))]
    pub async fn seal(&self, plaintext: &[u8], key_version: KeyVersion) -> CoreResult<EnvelopeCiphertext> {
        let (state, kek) = self.keyring.material(key_version).await?;
        if state != KeyState::Active {
            return Err(CoreError::Crypto {
                reason: format!("key {key_version} is decrypt-only"),
            });
        }

        let dek = generate_key();
        let nonce = generate_nonce();
        let ciphertext = cipher(&dek)
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CoreError::Crypto {
                reason: format!("secret encryption failed: {e}"),
            })?;

        Ok(EnvelopeCiphertext {
            data_key_ciphertext: wrap_dek(&kek, &dek, key_version)?,
            nonce: nonce.to_vec(),
            ciphertext,
            key_version,
        })
    }

    #[instrument(skip_all, fields(key_version = %envelope.key_version))]
    pub async fn open(&self, envelope: &EnvelopeCiphertext) -> CoreResult<Zeroizing<Vec<u8>>> {
        let (_, kek) = self.keyring.material(envelope.key_version).await?;
        let dek = unwrap_dek(&kek, &envelope.data_key_ciphertext, envelope.key_version)?;

        if envelope.nonce.len() != NONCE_SIZE {
            return Err(CoreError::DecryptionFailed);
        }
        cipher(&dek)
            .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| CoreError::DecryptionFailed)
    }

    /// Re-wrap the data key under `target`. Payload nonce and ciphertext are untouched.
    #[instrument(skip_all, fields(from = %envelope.key_version, to = %target))]
    pub async fn rewrap(
        &self,
        envelope: &EnvelopeCiphertext,
        target: KeyVersion,
    ) -> CoreResult<EnvelopeCiphertext> {
        if envelope.key_version == target {
            return Ok(envelope.clone());
        }
        let (_, old_kek) = self.keyring.material(envelope.key_version).await?;
        let (state, new_kek) = self.keyring.material(target).await?;
        if state != KeyState::Active {
            return Err(CoreError::Crypto {
                reason: format!("rewrap target {target} is not the active key"),
            });
        }
        let dek = unwrap_dek(&old_kek, &envelope.data_key_ciphertext, envelope.key_version)?;
        Ok(EnvelopeCiphertext {
            data_key_ciphertext: wrap_dek(&new_kek, &dek, target)?,
            nonce: envelope.nonce.clone(),
            ciphertext: envelope.ciphertext.clone(),
            key_version: target,
        })
    }
}

fn cipher(key: &[u8; KEY_SIZE]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

/// Generate a random 96-bit nonce. Each data key encrypts exactly one payload,
/// so a (key, nonce) pair is never reused.
fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn wrap_aad(version: KeyVersion) -> Vec<u8> {
    format!("conflux/dek/{version}").into_bytes()
}

fn wrap_dek(
    kek: &[u8; KEY_SIZE],
    dek: &[u8; KEY_SIZE],
    version: KeyVersion,
) -> CoreResult<Vec<u8>> {
    let nonce = generate_nonce();
    let aad = wrap_aad(version);
    let wrapped = cipher(kek)
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: dek.as_slice(),
                aad: &aad,
            },
        )
        .map_err(|e| CoreError::Crypto {
            reason: format!("data key wrap failed: {e}"),
        })?;
    let mut out = Vec::with_capacity(NONCE_SIZE + wrapped.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&wrapped);
    Ok(out)
}

fn unwrap_dek(
    kek: &[u8; KEY_SIZE],
    wrapped: &[u8],
    version: KeyVersion,
) -> CoreResult<Zeroizing<[u8; KEY_SIZE]>> {
    if wrapped.len() <= NONCE_SIZE {
        return Err(CoreError::DecryptionFailed);
    }
    let (nonce, body) = wrapped.split_at(NONCE_SIZE);
    let aad = wrap_aad(version);
    let plaintext = Zeroizing::new(
        cipher(kek)
            .decrypt(Nonce::from_slice(nonce), Payload { msg: body, aad: &aad })
            .map_err(|_| CoreError::DecryptionFailed)?,
    );
    if plaintext.len() != KEY_SIZE {
        return Err(CoreError::DecryptionFailed);
    }
    let mut dek = Zeroizing::new([0u8; KEY_SIZE]);
    dek.copy_from_slice(&plaintext);
    Ok(dek)
}

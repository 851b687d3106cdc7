//! Master key rotation.
//!
//! A rotation introduces a new active key, re-seals the latest value of every
//! secret under it, re-wraps the data keys of older versions, and opens a grace
//! window on the previous key. The previous key is retired only once nothing
//! references it and the window has elapsed; until then reads keep working
//! under either key.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use conflux_core::{
    access::KEYS_ADMIN_RESOURCE,
    audit::{AuditAction, AuditLog, AuditRecord},
    model::{EntryKey, EntryValue, KeyVersion, Principal, VersionSelector},
    CoreError, CoreResult,
};
use conflux_storage::{
    envelope::EnvelopeManager, key_provider::KeyState, versioned::VersionedStore,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Rotation progress of a single secret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RotationState {
    #[default]
    Stable,
    /// A re-sealed version under the new key is requested but not yet committed.
    RotationPending { from: KeyVersion },
    /// Older versions are being re-wrapped; `from` is not retired yet.
    ReEncrypting { from: KeyVersion },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationOptions {
    /// How long a superseded key stays decrypt-only before it may be retired.
    pub grace_period: TimeDelta,
    /// Rotate automatically once the active key is older than this.
    pub max_key_age: Option<TimeDelta>,
    /// Period of the background loop.
    pub check_interval: Duration,
}

impl Default for RotationOptions {
    fn default() -> Self {
        Self {
            grace_period: TimeDelta::days(7),
            max_key_age: None,
            check_interval: Duration::from_secs(300),
        }
    }
}

/// Outcome of one master key rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReport {
    pub from: KeyVersion,
    pub to: KeyVersion,
    /// Secrets that received a new version sealed under `to`.
    pub resealed: usize,
    /// Existing versions whose data key was re-wrapped under `to`.
    pub rewrapped: usize,
    /// Versions that could not be re-wrapped; retried by [`RotationScheduler::resume`].
    pub failed: usize,
    pub retire_after: DateTime<Utc>,
}

/// Drives master key rotation and retirement against the store.
pub struct RotationScheduler {
    store: Arc<VersionedStore>,
    envelopes: EnvelopeManager,
    audit: Arc<dyn AuditLog>,
    options: RotationOptions,
    states: StdMutex<HashMap<EntryKey, RotationState>>,
    // One rotation or retirement pass at a time.
    running: Mutex<()>,
}

impl RotationScheduler {
    pub fn new(
        store: Arc<VersionedStore>,
        envelopes: EnvelopeManager,
        audit: Arc<dyn AuditLog>,
        options: RotationOptions,
    ) -> Self {
        Self {
            store,
            envelopes,
            audit,
            options,
            states: StdMutex::new(HashMap::new()),
            running: Mutex::new(()),
        }
    }

    pub fn options(&self) -> RotationOptions {
        self.options
    }

    pub fn state(&self, entry: &EntryKey) -> RotationState {
        self.with_states(|states| states.get(entry).copied().unwrap_or_default())
    }

    /// True when the active key is older than the configured maximum age.
    pub async fn is_due(&self, now: DateTime<Utc>) -> CoreResult<bool> {
        let Some(max_age) = self.options.max_key_age else {
            return Ok(false);
        };
        let keyring = self.envelopes.keyring();
        let active = keyring.active_version().await?;
        Ok(keyring
            .info(active)
            .await
            .is_some_and(|info| info.created_at + max_age <= now))
    }

    /// Rotate to a new master key and move every secret onto it.
    #[instrument(skip_all, fields(principal = %principal))]
    pub async fn rotate_master_key(&self, principal: &Principal) -> CoreResult<RotationReport> {
        let _running = self.running.lock().await;
        let keyring = self.envelopes.keyring();
        let from = keyring.active_version().await?;

        self.audit
            .append(AuditRecord::success(
                principal.clone(),
                AuditAction::KeyRotate,
                KEYS_ADMIN_RESOURCE,
            ))
            .await?;
        let to = keyring.rotate().await?;

        let mut report = RotationReport {
            from,
            to,
            resealed: 0,
            rewrapped: 0,
            failed: 0,
            retire_after: Utc::now() + self.options.grace_period,
        };

        for entry in self.store.secret_entries() {
            self.set_state(&entry, RotationState::RotationPending { from });
            match self.reseal_latest(&entry, to, principal).await {
                Ok(true) => report.resealed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(entry = %entry, error = %err, "re-seal failed; older versions still re-wrapped");
                    report.failed += 1;
                }
            }
            self.set_state(&entry, RotationState::ReEncrypting { from });
        }

        let (rewrapped, failed) = self.rewrap_stragglers(to, principal).await?;
        report.rewrapped += rewrapped;
        report.failed += failed;

        keyring.schedule_retirement(from, report.retire_after).await?;
        info!(
            from = %from,
            to = %to,
            resealed = report.resealed,
            rewrapped = report.rewrapped,
            failed = report.failed,
            retire_after = %report.retire_after,
            "master key rotation finished re-encryption"
        );
        Ok(report)
    }

    /// Re-wrap any version still sealed under a decrypt-only key. Returns how many
    /// versions were moved to the active key.
    ///
    /// A decrypt-only key without a grace window (a rotation interrupted before it
    /// scheduled one) gets a window starting now.
    pub async fn resume(&self, principal: &Principal) -> CoreResult<usize> {
        let _running = self.running.lock().await;
        let keyring = self.envelopes.keyring();
        for key in keyring.list().await {
            if key.state == (KeyState::DecryptOnly { retire_after: None }) {
                let retire_after = Utc::now() + self.options.grace_period;
                keyring.schedule_retirement(key.version, retire_after).await?;
                warn!(
                    key_version = %key.version,
                    retire_after = %retire_after,
                    "decrypt-only key had no grace window; scheduled one"
                );
            }
        }
        let active = keyring.active_version().await?;
        let (rewrapped, failed) = self.rewrap_stragglers(active, principal).await?;
        if failed > 0 {
            warn!(failed, "some versions could not be re-wrapped yet");
        }
        Ok(rewrapped)
    }

    /// Retire `version` once its grace window has elapsed and nothing references it.
    ///
    /// Fails with `RotationIncomplete` (and reports it on the alert path) while
    /// stored versions are still sealed under it; the key stays decrypt-only.
    #[instrument(skip_all, fields(key_version = %version, principal = %principal))]
    pub async fn retire_key(
        &self,
        version: KeyVersion,
        now: DateTime<Utc>,
        principal: &Principal,
    ) -> CoreResult<()> {
        let _running = self.running.lock().await;
        self.retire_locked(version, now, principal).await
    }

    /// Retire every decrypt-only key whose grace window elapsed by `now`.
    ///
    /// Keys that cannot be retired are skipped and the first `RotationIncomplete`
    /// is returned after the others were processed.
    pub async fn retire_expired(
        &self,
        now: DateTime<Utc>,
        principal: &Principal,
    ) -> CoreResult<Vec<KeyVersion>> {
        let _running = self.running.lock().await;
        let mut retired = Vec::new();
        let mut incomplete = None;
        for key in self.envelopes.keyring().list().await {
            let KeyState::DecryptOnly {
                retire_after: Some(at),
            } = key.state
            else {
                continue;
            };
            if at > now {
                continue;
            }
            match self.retire_locked(key.version, now, principal).await {
                Ok(()) => retired.push(key.version),
                Err(err @ CoreError::RotationIncomplete { .. }) => {
                    incomplete.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        match incomplete {
            Some(err) => Err(err),
            None => Ok(retired),
        }
    }

    /// Periodic loop: rotate when due, resume re-encryption, retire expired keys.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let principal = Principal::system("rotation");
        info!(interval = ?self.options.check_interval, "rotation scheduler started");
        let mut ticker = tokio::time::interval(self.options.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(&principal).await,
            }
        }
        info!("rotation scheduler stopped");
    }

    async fn tick(&self, principal: &Principal) {
        match self.is_due(Utc::now()).await {
            Ok(true) => {
                if let Err(err) = self.rotate_master_key(principal).await {
                    warn!(error = %err, "scheduled rotation failed");
                }
            }
            Ok(false) => {}
            Err(err) => warn!(error = %err, "could not check key age"),
        }
        if let Err(err) = self.resume(principal).await {
            warn!(error = %err, "re-encryption pass failed");
        }
        match self.retire_expired(Utc::now(), principal).await {
            Ok(retired) if !retired.is_empty() => debug!(?retired, "expired keys retired"),
            Ok(_) => {}
            // Already reported on the alert path.
            Err(CoreError::RotationIncomplete { .. }) => {}
            Err(err) => warn!(error = %err, "retirement pass failed"),
        }
    }

    async fn retire_locked(
        &self,
        version: KeyVersion,
        now: DateTime<Utc>,
        principal: &Principal,
    ) -> CoreResult<()> {
        let keyring = self.envelopes.keyring();
        let info = keyring
            .info(version)
            .await
            .ok_or(CoreError::UnknownKeyVersion(version))?;
        let retire_after = match info.state {
            KeyState::Retired => return Ok(()),
            KeyState::Active => {
                return Err(CoreError::invalid(format!(
                    "key {version} is active; rotate before retiring it"
                )))
            }
            KeyState::DecryptOnly { retire_after: None } => {
                return Err(CoreError::invalid(format!(
                    "key {version} has no grace window scheduled"
                )))
            }
            KeyState::DecryptOnly {
                retire_after: Some(at),
            } => at,
        };
        if now < retire_after {
            return Err(CoreError::invalid(format!(
                "grace period of key {version} runs until {retire_after}"
            )));
        }

        let remaining = self.store.versions_referencing(version).len();
        if remaining > 0 {
            error!(
                target: "alert",
                key_version = %version,
                remaining,
                "rotation incomplete: grace period expired with versions still sealed under the old key"
            );
            return Err(CoreError::RotationIncomplete {
                key_version: version,
                remaining,
            });
        }

        self.audit
            .append(AuditRecord::success(
                principal.clone(),
                AuditAction::KeyRetire,
                KEYS_ADMIN_RESOURCE,
            ))
            .await?;
        keyring.retire(version).await?;
        self.with_states(|states| {
            states.retain(|_, state| {
                !matches!(state, RotationState::ReEncrypting { from } if *from == version)
            })
        });
        Ok(())
    }

    /// Seal the latest plaintext of `entry` under `to` as a new version.
    /// Returns false when there was nothing to do.
    async fn reseal_latest(
        &self,
        entry: &EntryKey,
        to: KeyVersion,
        principal: &Principal,
    ) -> CoreResult<bool> {
        let latest = match self.store.get(entry, VersionSelector::Latest) {
            Ok(version) => version,
            Err(CoreError::NotFound { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };
        let EntryValue::Sealed { envelope } = &latest.value else {
            return Ok(false);
        };
        if envelope.key_version == to {
            return Ok(false);
        }
        let plaintext = self.envelopes.open(envelope).await?;
        let sealed = self.envelopes.seal(&plaintext, to).await?;
        match self
            .store
            .put_if_latest(
                entry,
                latest.id,
                EntryValue::Sealed { envelope: sealed },
                principal,
                Some(format!("re-sealed under key {to}")),
            )
            .await
        {
            Ok(_) => Ok(true),
            // A newer write landed, sealed under the active key already.
            Err(CoreError::Conflict { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Re-wrap every version sealed under a decrypt-only key onto `to`.
    async fn rewrap_stragglers(
        &self,
        to: KeyVersion,
        principal: &Principal,
    ) -> CoreResult<(usize, usize)> {
        let (mut rewrapped, mut failed) = (0, 0);
        for key in self.envelopes.keyring().list().await {
            if !matches!(key.state, KeyState::DecryptOnly { .. }) {
                continue;
            }
            for (entry, version_id) in self.store.versions_referencing(key.version) {
                let result: CoreResult<()> = async {
                    let version = self.store.get(&entry, VersionSelector::At(version_id))?;
                    let EntryValue::Sealed { envelope } = version.value else {
                        return Ok(());
                    };
                    let rewrapped = self.envelopes.rewrap(&envelope, to).await?;
                    self.store
                        .replace_envelope(&entry, version_id, rewrapped, principal)
                        .await
                }
                .await;
                match result {
                    Ok(()) => rewrapped += 1,
                    // Pruned while we were working: nothing left to protect.
                    Err(CoreError::VersionNotFound { .. }) => {}
                    Err(err) => {
                        warn!(entry = %entry, version = %version_id, error = %err, "re-wrap failed");
                        failed += 1;
                    }
                }
            }
            if rewrapped > 0 {
                debug!(from = %key.version, to = %to, rewrapped, "versions re-wrapped");
            }
        }
        Ok((rewrapped, failed))
    }

    fn set_state(&self, entry: &EntryKey, state: RotationState) {
        self.with_states(|states| {
            states.insert(entry.clone(), state);
        });
    }

    fn with_states<T>(&self, f: impl FnOnce(&mut HashMap<EntryKey, RotationState>) -> T) -> T {
        match self.states.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

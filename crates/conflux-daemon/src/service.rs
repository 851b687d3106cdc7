use std::{fmt, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use conflux_core::{
    access::{
        AccessEvaluator, Decision, PolicyRegistry, AUDIT_ADMIN_RESOURCE, KEYS_ADMIN_RESOURCE,
        POLICY_ADMIN_RESOURCE,
    },
    audit::{AuditAction, AuditFilter, AuditLog, AuditOutcome, AuditRecord},
    blob::BlobStore,
    model::{
        Action, EntryKey, EntryValue, KeyVersion, Namespace, Page, PageRequest, Policy,
        PolicySpec, Principal, Revision, SubscriberId, Subscription, VersionId, VersionSelector,
    },
    CoreError, CoreResult,
};
use conflux_rotation::{RotationOptions, RotationReport, RotationScheduler, RotationState};
use conflux_storage::{
    envelope::{EnvelopeManager, KeyInfo, MasterKeyring},
    key_provider::KeyProvider,
    versioned::{KeySummary, StoreOptions, VersionedStore},
};
use conflux_sync::{CoordinatorOptions, DistributionCoordinator, PollResponse};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

const HEALTH_CHECK_KEY: &str = "health/check";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceOptions {
    pub store: StoreOptions,
    pub coordinator: CoordinatorOptions,
    pub rotation: RotationOptions,
    /// Granted every action on every resource when no policy exists at startup.
    pub bootstrap_admin: Option<Principal>,
}

/// Value supplied by a writer.
#[derive(Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub data: Vec<u8>,
    /// Seal the value before it is stored.
    pub secret: bool,
    pub description: Option<String>,
}

impl PutRequest {
    pub fn plain(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            secret: false,
            description: None,
        }
    }

    pub fn secret(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            secret: true,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl fmt::Debug for PutRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutRequest")
            .field("len", &self.data.len())
            .field("secret", &self.secret)
            .field("description", &self.description)
            .finish()
    }
}

/// A resolved, decrypted version. Plaintext is zeroized on drop.
pub struct EntryRead {
    pub entry: EntryKey,
    pub version: VersionId,
    pub revision: Revision,
    pub secret: bool,
    pub data: Zeroizing<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub principal: Principal,
    pub description: Option<String>,
}

impl fmt::Debug for EntryRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRead")
            .field("entry", &self.entry)
            .field("version", &self.version)
            .field("revision", &self.revision)
            .field("secret", &self.secret)
            .finish_non_exhaustive()
    }
}

/// Version metadata without the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub id: VersionId,
    pub revision: Revision,
    pub created_at: DateTime<Utc>,
    pub principal: Principal,
    pub description: Option<String>,
    pub secret: bool,
    pub deleted: bool,
    pub key_version: Option<KeyVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub active_key: KeyVersion,
    pub key_versions: usize,
}

/// Every component, constructed once and passed explicitly.
///
/// Writes flow authorize -> seal (secrets) -> store commit (audited before it is
/// visible) -> change feed, which wakes pollers and the push dispatcher. Reads flow
/// authorize -> resolve -> open (secrets) -> audit.
pub struct ConfigService {
    policies: Arc<PolicyRegistry>,
    envelopes: EnvelopeManager,
    store: Arc<VersionedStore>,
    audit: Arc<dyn AuditLog>,
    coordinator: Arc<DistributionCoordinator>,
    rotation: Arc<RotationScheduler>,
    blobs: Arc<dyn BlobStore>,
}

impl ConfigService {
    /// Load every component from durable state.
    pub async fn open(
        options: ServiceOptions,
        blobs: Arc<dyn BlobStore>,
        audit: Arc<dyn AuditLog>,
        keys: Arc<dyn KeyProvider>,
    ) -> CoreResult<Self> {
        let keyring = Arc::new(MasterKeyring::load(keys).await?);
        let envelopes = EnvelopeManager::new(keyring);
        let policies = Arc::new(
            PolicyRegistry::load(Arc::new(AccessEvaluator::default()), Arc::clone(&blobs)).await?,
        );
        let store = Arc::new(
            VersionedStore::load(Arc::clone(&blobs), Arc::clone(&audit), options.store).await?,
        );
        let coordinator = Arc::new(
            DistributionCoordinator::load(
                Arc::clone(store.feed()),
                Arc::clone(&blobs),
                options.coordinator,
            )
            .await?,
        );
        let rotation = Arc::new(RotationScheduler::new(
            Arc::clone(&store),
            envelopes.clone(),
            Arc::clone(&audit),
            options.rotation,
        ));

        let service = Self {
            policies,
            envelopes,
            store,
            audit,
            coordinator,
            rotation,
            blobs,
        };
        if let Some(admin) = options.bootstrap_admin {
            service.bootstrap(admin).await?;
        }
        Ok(service)
    }

    async fn bootstrap(&self, admin: Principal) -> CoreResult<()> {
        if !self.policies.list().await.is_empty() {
            return Ok(());
        }
        let system = Principal::system("bootstrap");
        let spec = PolicySpec {
            principal_pattern: admin.to_string(),
            resource_pattern: "*".to_string(),
            permitted_actions: Action::ALL.into_iter().collect(),
        };
        let policy = self
            .audited(
                &system,
                AuditAction::PolicyCreate,
                POLICY_ADMIN_RESOURCE,
                self.policies.create(spec),
            )
            .await?;
        info!(admin = %admin, policy = %policy.id, "bootstrap admin policy created");
        Ok(())
    }

    pub fn store(&self) -> &Arc<VersionedStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<DistributionCoordinator> {
        &self.coordinator
    }

    pub fn rotation(&self) -> &Arc<RotationScheduler> {
        &self.rotation
    }

    pub fn envelopes(&self) -> &EnvelopeManager {
        &self.envelopes
    }

    pub fn audit_log(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    // ---- entries -------------------------------------------------------------

    /// Commit a new version of `entry`, sealing it first when it is a secret.
    #[instrument(skip_all, fields(principal = %principal, entry = %entry, secret = request.secret))]
    pub async fn put(
        &self,
        principal: &Principal,
        entry: &EntryKey,
        request: PutRequest,
    ) -> CoreResult<VersionId> {
        self.authorize(principal, &entry.resource_path(), Action::Write, AuditAction::Write)
            .await?;
        let value = self.encode(&request).await?;
        self.store
            .put(entry, value, principal, request.description)
            .await
    }

    /// Replace a secret's value. Needs the `rotate` permission rather than `write`.
    #[instrument(skip_all, fields(principal = %principal, entry = %entry))]
    pub async fn rotate_secret(
        &self,
        principal: &Principal,
        entry: &EntryKey,
        request: PutRequest,
    ) -> CoreResult<VersionId> {
        self.authorize(principal, &entry.resource_path(), Action::Rotate, AuditAction::Rotate)
            .await?;
        let envelope = self.envelopes.seal_active(&request.data).await?;
        self.store
            .rotate(
                entry,
                EntryValue::Sealed { envelope },
                principal,
                request.description,
            )
            .await
    }

    #[instrument(skip_all, fields(principal = %principal, entry = %entry))]
    pub async fn delete(&self, principal: &Principal, entry: &EntryKey) -> CoreResult<VersionId> {
        self.authorize(principal, &entry.resource_path(), Action::Write, AuditAction::Delete)
            .await?;
        self.store.delete(entry, principal).await
    }

    /// Resolve and decrypt a version. Every outcome after authorization is audited
    /// before it is returned.
    #[instrument(skip_all, fields(principal = %principal, entry = %entry))]
    pub async fn get(
        &self,
        principal: &Principal,
        entry: &EntryKey,
        selector: VersionSelector,
    ) -> CoreResult<EntryRead> {
        let resource = entry.resource_path();
        self.authorize(principal, &resource, Action::Read, AuditAction::Read)
            .await?;

        let result = self.resolve(entry, selector).await;
        let record = match &result {
            Ok(read) => AuditRecord::success(principal.clone(), AuditAction::Read, resource)
                .with_version(read.version),
            Err(err) => {
                if matches!(err, CoreError::DecryptionFailed) {
                    error!(entry = %entry, "stored envelope failed authentication");
                }
                AuditRecord::new(
                    principal.clone(),
                    AuditAction::Read,
                    resource,
                    AuditOutcome::Failed {
                        reason: err.to_string(),
                    },
                )
            }
        };
        self.audit.append(record).await?;
        result
    }

    /// Version metadata of `entry`, oldest first.
    pub async fn list_versions(
        &self,
        principal: &Principal,
        entry: &EntryKey,
        page: &PageRequest,
    ) -> CoreResult<Page<VersionInfo>> {
        let resource = entry.resource_path();
        self.authorize(principal, &resource, Action::Read, AuditAction::Read)
            .await?;
        let versions = self.store.list_versions(entry, page)?;
        self.audit
            .append(AuditRecord::success(principal.clone(), AuditAction::Read, resource))
            .await?;
        Ok(Page {
            items: versions
                .items
                .into_iter()
                .map(|v| VersionInfo {
                    secret: v.value.is_secret(),
                    deleted: v.value.is_tombstone(),
                    key_version: v.value.key_version(),
                    id: v.id,
                    revision: v.revision,
                    created_at: v.created_at,
                    principal: v.principal,
                    description: v.description,
                })
                .collect(),
            next: versions.next,
        })
    }

    /// Live keys of `namespace` the caller may read.
    pub async fn list_keys(
        &self,
        principal: &Principal,
        namespace: &Namespace,
        page: &PageRequest,
    ) -> CoreResult<Page<KeySummary>> {
        let snapshot = self.policies.evaluator().snapshot();
        let mut listing = self.store.list_keys(namespace, page)?;
        listing.items.retain(|summary| {
            snapshot
                .evaluate(principal, &format!("{namespace}/{}", summary.key), Action::Read)
                .is_allowed()
        });
        self.audit
            .append(AuditRecord::success(
                principal.clone(),
                AuditAction::Read,
                namespace_resource(namespace),
            ))
            .await?;
        Ok(listing)
    }

    // ---- distribution --------------------------------------------------------

    pub async fn subscribe(
        &self,
        principal: &Principal,
        subscriber: &SubscriberId,
        namespace: &Namespace,
        endpoint: Option<String>,
    ) -> CoreResult<Subscription> {
        let resource = namespace_resource(namespace);
        self.authorize(principal, &resource, Action::Read, AuditAction::Subscribe)
            .await?;
        self.audited(
            principal,
            AuditAction::Subscribe,
            &resource,
            self.coordinator.subscribe(subscriber, namespace, endpoint),
        )
        .await
    }

    pub async fn unsubscribe(
        &self,
        principal: &Principal,
        subscriber: &SubscriberId,
        namespace: &Namespace,
    ) -> CoreResult<()> {
        let resource = namespace_resource(namespace);
        self.authorize(principal, &resource, Action::Read, AuditAction::Subscribe)
            .await?;
        self.audited(
            principal,
            AuditAction::Subscribe,
            &resource,
            self.coordinator.unsubscribe(subscriber, namespace),
        )
        .await
    }

    /// Long-poll for changes after `since`. Cancel by dropping the future.
    pub async fn poll(
        &self,
        principal: &Principal,
        subscriber: &SubscriberId,
        namespace: &Namespace,
        since: Revision,
        timeout: Option<Duration>,
    ) -> CoreResult<PollResponse> {
        let resource = namespace_resource(namespace);
        self.authorize(principal, &resource, Action::Read, AuditAction::Poll)
            .await?;
        let response = self
            .coordinator
            .poll(subscriber, namespace, since, timeout)
            .await?;
        self.audit
            .append(AuditRecord::success(principal.clone(), AuditAction::Poll, resource))
            .await?;
        Ok(response)
    }

    /// Record that `subscriber` applied everything up to `revision`. A stale ack
    /// is returned as the benign `StaleAck` error and changes nothing.
    pub async fn ack(
        &self,
        principal: &Principal,
        subscriber: &SubscriberId,
        namespace: &Namespace,
        revision: Revision,
    ) -> CoreResult<Subscription> {
        let resource = namespace_resource(namespace);
        self.authorize(principal, &resource, Action::Read, AuditAction::Ack)
            .await?;
        match self.coordinator.ack(subscriber, namespace, revision).await {
            Ok(sub) => {
                self.audit
                    .append(AuditRecord::success(principal.clone(), AuditAction::Ack, resource))
                    .await?;
                Ok(sub)
            }
            Err(err) if err.is_benign() => {
                debug!(subscriber = %subscriber, error = %err, "benign ack race");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    // ---- policy administration -----------------------------------------------

    pub async fn list_policies(&self, principal: &Principal) -> CoreResult<Vec<Policy>> {
        self.authorize(principal, POLICY_ADMIN_RESOURCE, Action::Read, AuditAction::Read)
            .await?;
        Ok(self.policies.list().await)
    }

    pub async fn get_policy(&self, principal: &Principal, id: Uuid) -> CoreResult<Policy> {
        self.authorize(principal, POLICY_ADMIN_RESOURCE, Action::Read, AuditAction::Read)
            .await?;
        self.policies.get(id).await
    }

    pub async fn create_policy(&self, principal: &Principal, spec: PolicySpec) -> CoreResult<Policy> {
        self.authorize(
            principal,
            POLICY_ADMIN_RESOURCE,
            Action::Write,
            AuditAction::PolicyCreate,
        )
        .await?;
        self.audited(
            principal,
            AuditAction::PolicyCreate,
            POLICY_ADMIN_RESOURCE,
            self.policies.create(spec),
        )
        .await
    }

    pub async fn update_policy(
        &self,
        principal: &Principal,
        id: Uuid,
        spec: PolicySpec,
    ) -> CoreResult<Policy> {
        self.authorize(
            principal,
            POLICY_ADMIN_RESOURCE,
            Action::Write,
            AuditAction::PolicyUpdate,
        )
        .await?;
        self.audited(
            principal,
            AuditAction::PolicyUpdate,
            &format!("{POLICY_ADMIN_RESOURCE}/{id}"),
            self.policies.update(id, spec),
        )
        .await
    }

    pub async fn delete_policy(&self, principal: &Principal, id: Uuid) -> CoreResult<Policy> {
        self.authorize(
            principal,
            POLICY_ADMIN_RESOURCE,
            Action::Write,
            AuditAction::PolicyDelete,
        )
        .await?;
        self.audited(
            principal,
            AuditAction::PolicyDelete,
            &format!("{POLICY_ADMIN_RESOURCE}/{id}"),
            self.policies.delete(id),
        )
        .await
    }

    // ---- audit export --------------------------------------------------------

    pub async fn export_audit(
        &self,
        principal: &Principal,
        filter: &AuditFilter,
        page: &PageRequest,
    ) -> CoreResult<Page<AuditRecord>> {
        self.authorize(
            principal,
            AUDIT_ADMIN_RESOURCE,
            Action::Read,
            AuditAction::AuditExport,
        )
        .await?;
        let records = self.audit.query(filter, page).await?;
        self.audit
            .append(AuditRecord::success(
                principal.clone(),
                AuditAction::AuditExport,
                AUDIT_ADMIN_RESOURCE,
            ))
            .await?;
        Ok(records)
    }

    // ---- master keys ---------------------------------------------------------

    pub async fn key_versions(&self, principal: &Principal) -> CoreResult<Vec<KeyInfo>> {
        self.authorize(principal, KEYS_ADMIN_RESOURCE, Action::Read, AuditAction::Read)
            .await?;
        Ok(self.envelopes.keyring().list().await)
    }

    pub async fn rotate_master_key(&self, principal: &Principal) -> CoreResult<RotationReport> {
        self.authorize(
            principal,
            KEYS_ADMIN_RESOURCE,
            Action::Rotate,
            AuditAction::KeyRotate,
        )
        .await?;
        self.rotation.rotate_master_key(principal).await
    }

    /// Retire `version` now. Only succeeds after its grace period, once nothing
    /// references it.
    pub async fn retire_key(&self, principal: &Principal, version: KeyVersion) -> CoreResult<()> {
        self.authorize(
            principal,
            KEYS_ADMIN_RESOURCE,
            Action::Rotate,
            AuditAction::KeyRetire,
        )
        .await?;
        self.rotation.retire_key(version, Utc::now(), principal).await
    }

    pub fn rotation_state(&self, entry: &EntryKey) -> RotationState {
        self.rotation.state(entry)
    }

    /// Seal/open a sample value and round-trip the blob store.
    pub async fn health(&self) -> CoreResult<HealthReport> {
        let sealed = self.envelopes.seal_active(b"ok").await?;
        let opened = self.envelopes.open(&sealed).await?;
        if opened.as_slice() != b"ok" {
            return Err(CoreError::Crypto {
                reason: "envelope check did not round-trip".to_string(),
            });
        }

        self.blobs.put(HEALTH_CHECK_KEY, b"ok").await?;
        let round_trip = self.blobs.get(HEALTH_CHECK_KEY).await?;
        self.blobs.delete(HEALTH_CHECK_KEY).await?;
        if round_trip != b"ok" {
            return Err(CoreError::storage("blob check did not round-trip"));
        }

        let keys = self.envelopes.keyring().list().await;
        Ok(HealthReport {
            active_key: sealed.key_version,
            key_versions: keys.len(),
        })
    }

    // ---- helpers -------------------------------------------------------------

    async fn authorize(
        &self,
        principal: &Principal,
        resource: &str,
        action: Action,
        audit_action: AuditAction,
    ) -> CoreResult<()> {
        match self.policies.evaluator().authorize(principal, resource, action) {
            Decision::Allow { .. } => Ok(()),
            Decision::Deny { reason } => {
                warn!(principal = %principal, resource, action = %action, reason = %reason, "access denied");
                self.audit
                    .append(AuditRecord::new(
                        principal.clone(),
                        audit_action,
                        resource,
                        AuditOutcome::Denied {
                            reason: reason.clone(),
                        },
                    ))
                    .await?;
                Err(CoreError::Denied { reason })
            }
        }
    }

    /// Run `op`, then record its outcome as one audit record.
    ///
    /// The caller only sees success once that record is durable; when the append
    /// fails after `op` succeeded, the audit error is returned.
    async fn audited<T, F>(
        &self,
        principal: &Principal,
        action: AuditAction,
        resource: &str,
        op: F,
    ) -> CoreResult<T>
    where
        F: Future<Output = CoreResult<T>>,
    {
        let result = op.await;
        let outcome = match &result {
            Ok(_) => AuditOutcome::Success,
            Err(err) => AuditOutcome::Failed {
                reason: err.to_string(),
            },
        };
        if let Err(audit_err) = self
            .audit
            .append(AuditRecord::new(principal.clone(), action, resource, outcome))
            .await
        {
            error!(error = %audit_err, succeeded = result.is_ok(), "failed to audit {action}");
            return Err(audit_err);
        }
        result
    }

    async fn encode(&self, request: &PutRequest) -> CoreResult<EntryValue> {
        if request.secret {
            let envelope = self.envelopes.seal_active(&request.data).await?;
            Ok(EntryValue::Sealed { envelope })
        } else {
            Ok(EntryValue::Plain {
                data: request.data.clone(),
            })
        }
    }

    async fn resolve(&self, entry: &EntryKey, selector: VersionSelector) -> CoreResult<EntryRead> {
        let version = self.store.get(entry, selector)?;
        let (data, secret) = match &version.value {
            EntryValue::Plain { data } => (Zeroizing::new(data.clone()), false),
            EntryValue::Sealed { envelope } => (self.envelopes.open(envelope).await?, true),
            EntryValue::Tombstone => {
                return Err(CoreError::NotFound {
                    namespace: entry.namespace.to_string(),
                    key: entry.key.to_string(),
                })
            }
        };
        Ok(EntryRead {
            entry: entry.clone(),
            version: version.id,
            revision: version.revision,
            secret,
            data,
            created_at: version.created_at,
            principal: version.principal,
            description: version.description,
        })
    }
}

fn namespace_resource(namespace: &Namespace) -> String {
    format!("{namespace}/*")
}

//! Deny-by-default access control.
//!
//! Evaluation reads an immutable [`PolicySnapshot`]; policy changes publish a new
//! snapshot and never touch one an in-flight evaluation already holds.

use std::{
    fmt,
    sync::{Arc, RwLock},
};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    blob::{BlobError, BlobStore},
    error::{CoreError, CoreResult},
    model::{Action, Policy, PolicySpec, Principal},
};

const POLICY_PREFIX: &str = "policies/";

/// Resource path guarding policy administration.
pub const POLICY_ADMIN_RESOURCE: &str = "_admin/policies";
/// Resource path guarding audit export.
pub const AUDIT_ADMIN_RESOURCE: &str = "_admin/audit";
/// Resource path guarding master key rotation and retirement.
pub const KEYS_ADMIN_RESOURCE: &str = "_admin/keys";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow { policy: Uuid },
    Deny { reason: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    /// Convert into a result, mapping `Deny` to [`CoreError::Denied`].
    pub fn into_result(self) -> CoreResult<Uuid> {
        match self {
            Decision::Allow { policy } => Ok(policy),
            Decision::Deny { reason } => Err(CoreError::Denied { reason }),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow { policy } => write!(f, "allow (policy {policy})"),
            Decision::Deny { reason } => write!(f, "deny ({reason})"),
        }
    }
}

/// `*` matches any run of characters, including `/`. Everything else is literal.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|b| *b == b'*')
}

/// Specificity of a resource pattern: the number of literal characters.
fn specificity(pattern: &str) -> usize {
    pattern.chars().filter(|c| *c != '*').count()
}

/// Immutable set of active policies.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    policies: Vec<Policy>,
}

impl PolicySnapshot {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self { policies }
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn evaluate(&self, principal: &Principal, resource_path: &str, action: Action) -> Decision {
        let winner = self
            .policies
            .iter()
            .filter(|p| glob_match(&p.principal_pattern, principal.as_str()))
            .filter(|p| glob_match(&p.resource_pattern, resource_path))
            .max_by_key(|p| (specificity(&p.resource_pattern), p.defined_seq));

        match winner {
            None => Decision::Deny {
                reason: format!("no policy grants {principal} access to {resource_path}"),
            },
            Some(policy) if policy.permitted_actions.contains(&action) => Decision::Allow {
                policy: policy.id,
            },
            Some(policy) => Decision::Deny {
                reason: format!(
                    "policy {} on `{}` does not permit {action}",
                    policy.id, policy.resource_pattern
                ),
            },
        }
    }
}

/// Stateless-per-call evaluator over the current policy snapshot.
#[derive(Debug, Default)]
pub struct AccessEvaluator {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl AccessEvaluator {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self {
            current: RwLock::new(Arc::new(PolicySnapshot::new(policies))),
        }
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Publish a new snapshot. Later evaluations observe it immediately.
    pub fn replace(&self, policies: Vec<Policy>) {
        let snapshot = Arc::new(PolicySnapshot::new(policies));
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    #[instrument(skip_all, fields(principal = %principal, resource = resource_path, action = %action))]
    pub fn authorize(&self, principal: &Principal, resource_path: &str, action: Action) -> Decision {
        let decision = self.snapshot().evaluate(principal, resource_path, action);
        debug!(%decision, "authorization evaluated");
        decision
    }
}

fn validate_spec(spec: &PolicySpec) -> CoreResult<()> {
    if spec.principal_pattern.trim().is_empty() {
        return Err(CoreError::invalid("principal pattern must not be empty"));
    }
    if spec.resource_pattern.trim().is_empty() {
        return Err(CoreError::invalid("resource pattern must not be empty"));
    }
    Ok(())
}

struct RegistryState {
    policies: Vec<Policy>,
    next_seq: u64,
}

/// Durable policy CRUD that keeps an [`AccessEvaluator`] in sync.
pub struct PolicyRegistry {
    evaluator: Arc<AccessEvaluator>,
    blobs: Arc<dyn BlobStore>,
    state: Mutex<RegistryState>,
}

impl PolicyRegistry {
    /// Load persisted policies and publish them to `evaluator`.
    pub async fn load(evaluator: Arc<AccessEvaluator>, blobs: Arc<dyn BlobStore>) -> CoreResult<Self> {
        let mut policies = Vec::new();
        for key in blobs.list(POLICY_PREFIX).await? {
            let bytes = blobs.get(&key).await?;
            let policy: Policy = serde_json::from_slice(&bytes).map_err(CoreError::storage)?;
            policies.push(policy);
        }
        policies.sort_by_key(|p| p.defined_seq);
        let next_seq = policies.last().map(|p| p.defined_seq + 1).unwrap_or(1);
        evaluator.replace(policies.clone());
        debug!(count = policies.len(), "policies loaded");

        Ok(Self {
            evaluator,
            blobs,
            state: Mutex::new(RegistryState { policies, next_seq }),
        })
    }

    pub fn evaluator(&self) -> &Arc<AccessEvaluator> {
        &self.evaluator
    }

    pub async fn list(&self) -> Vec<Policy> {
        self.state.lock().await.policies.clone()
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<Policy> {
        let state = self.state.lock().await;
        state
            .policies
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or(CoreError::PolicyNotFound(id))
    }

    #[instrument(skip(self, spec), fields(resource = %spec.resource_pattern))]
    pub async fn create(&self, spec: PolicySpec) -> CoreResult<Policy> {
        validate_spec(&spec)?;
        let mut state = self.state.lock().await;
        let policy = Policy {
            id: Uuid::new_v4(),
            principal_pattern: spec.principal_pattern,
            resource_pattern: spec.resource_pattern,
            permitted_actions: spec.permitted_actions,
            defined_seq: state.next_seq,
            defined_at: Utc::now(),
        };
        self.persist(&policy).await?;
        state.next_seq += 1;
        state.policies.push(policy.clone());
        self.evaluator.replace(state.policies.clone());
        Ok(policy)
    }

    /// Redefine a policy. It counts as the most recent definition afterwards.
    #[instrument(skip(self, spec))]
    pub async fn update(&self, id: Uuid, spec: PolicySpec) -> CoreResult<Policy> {
        validate_spec(&spec)?;
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        let index = state
            .policies
            .iter()
            .position(|p| p.id == id)
            .ok_or(CoreError::PolicyNotFound(id))?;
        let policy = Policy {
            id,
            principal_pattern: spec.principal_pattern,
            resource_pattern: spec.resource_pattern,
            permitted_actions: spec.permitted_actions,
            defined_seq: seq,
            defined_at: Utc::now(),
        };
        self.persist(&policy).await?;
        state.next_seq += 1;
        state.policies[index] = policy.clone();
        self.evaluator.replace(state.policies.clone());
        Ok(policy)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> CoreResult<Policy> {
        let mut state = self.state.lock().await;
        let index = state
            .policies
            .iter()
            .position(|p| p.id == id)
            .ok_or(CoreError::PolicyNotFound(id))?;
        match self.blobs.delete(&policy_key(id)).await {
            Ok(()) | Err(BlobError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        let removed = state.policies.remove(index);
        self.evaluator.replace(state.policies.clone());
        Ok(removed)
    }

    async fn persist(&self, policy: &Policy) -> CoreResult<()> {
        let bytes = serde_json::to_vec(policy).map_err(CoreError::storage)?;
        self.blobs.put(&policy_key(policy.id), &bytes).await?;
        Ok(())
    }
}

fn policy_key(id: Uuid) -> String {
    format!("{POLICY_PREFIX}{id}")
}

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use conflux_core::{
    blob::BlobStore,
    feed::ChangeFeed,
    model::{Change, Namespace, Revision, SubscriberId, Subscription},
    CoreError, CoreResult,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

const SUBSCRIPTION_PREFIX: &str = "subscriptions/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Upper bound on how long a poll waits for new changes.
    pub poll_timeout: Duration,
    /// Maximum number of changes returned by one poll.
    pub max_batch: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(30),
            max_batch: 500,
        }
    }
}

/// Result of a poll. `next_token` is the revision to pass as `since` next time,
/// and the value to ack once the changes are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    pub changes: Vec<Change>,
    pub next_token: Revision,
    /// The poll returned because the timeout elapsed, not because of new data.
    pub timed_out: bool,
}

type SubscriptionKey = (Namespace, SubscriberId);

/// Tracks subscribers per namespace and serves long-poll reads of the change feed.
///
/// Subscriptions only reference versions by revision; entry data stays owned by
/// the store.
pub struct DistributionCoordinator {
    feed: Arc<ChangeFeed>,
    blobs: Arc<dyn BlobStore>,
    subscriptions: Mutex<BTreeMap<SubscriptionKey, Subscription>>,
    options: CoordinatorOptions,
}

impl DistributionCoordinator {
    pub async fn load(
        feed: Arc<ChangeFeed>,
        blobs: Arc<dyn BlobStore>,
        options: CoordinatorOptions,
    ) -> CoreResult<Self> {
        let mut subscriptions = BTreeMap::new();
        for blob_key in blobs.list(SUBSCRIPTION_PREFIX).await? {
            let raw = blobs.get(&blob_key).await?;
            let sub: Subscription = serde_json::from_slice(&raw).map_err(|err| {
                CoreError::storage(format!("corrupt subscription `{blob_key}`: {err}"))
            })?;
            subscriptions.insert((sub.namespace.clone(), sub.subscriber_id.clone()), sub);
        }
        info!(subscriptions = subscriptions.len(), "distribution coordinator loaded");
        for namespace in feed.namespaces() {
            feed.set_floor(&namespace, read_floor(&subscriptions, &namespace));
        }
        Ok(Self {
            feed,
            blobs,
            subscriptions: Mutex::new(subscriptions),
            options,
        })
    }

    pub fn options(&self) -> CoordinatorOptions {
        self.options
    }

    pub fn feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }

    /// Register `subscriber` on `namespace`. Re-subscribing keeps the acked position
    /// and replaces the push endpoint when one is given.
    #[instrument(skip_all, fields(subscriber = %subscriber, namespace = %namespace))]
    pub async fn subscribe(
        &self,
        subscriber: &SubscriberId,
        namespace: &Namespace,
        endpoint: Option<String>,
    ) -> CoreResult<Subscription> {
        let mut subs = self.subscriptions.lock().await;
        let key = (namespace.clone(), subscriber.clone());
        let mut sub = match subs.get(&key) {
            Some(existing) => existing.clone(),
            None => Subscription {
                subscriber_id: subscriber.clone(),
                namespace: namespace.clone(),
                last_acked: Revision::default(),
                endpoint: None,
                created_at: Utc::now(),
            },
        };
        if endpoint.is_some() {
            sub.endpoint = endpoint;
        }
        if subs.get(&key) != Some(&sub) {
            self.persist(&sub).await?;
            subs.insert(key, sub.clone());
            self.feed.set_floor(namespace, read_floor(&subs, namespace));
            debug!("subscription saved");
        }
        Ok(sub)
    }

    #[instrument(skip_all, fields(subscriber = %subscriber, namespace = %namespace))]
    pub async fn unsubscribe(&self, subscriber: &SubscriberId, namespace: &Namespace) -> CoreResult<()> {
        let mut subs = self.subscriptions.lock().await;
        let key = (namespace.clone(), subscriber.clone());
        if !subs.contains_key(&key) {
            return Err(not_subscribed(subscriber, namespace));
        }
        self.blobs.delete(&blob_key(namespace, subscriber)).await?;
        subs.remove(&key);
        self.feed.set_floor(namespace, read_floor(&subs, namespace));
        Ok(())
    }

    pub async fn subscription(
        &self,
        subscriber: &SubscriberId,
        namespace: &Namespace,
    ) -> CoreResult<Subscription> {
        self.subscriptions
            .lock()
            .await
            .get(&(namespace.clone(), subscriber.clone()))
            .cloned()
            .ok_or_else(|| not_subscribed(subscriber, namespace))
    }

    /// Every subscription, ordered by namespace then subscriber.
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.lock().await.values().cloned().collect()
    }

    /// Changes committed after `since`, waiting up to `timeout` (or the configured
    /// poll timeout) when there are none yet.
    ///
    /// `since` is clamped to the subscriber's acked position, so nothing at or
    /// below an acked revision is handed out again. A `since` past the published
    /// head is rejected. No lock is held while waiting; dropping the future cancels
    /// the poll and leaves the subscription untouched.
    #[instrument(skip_all, fields(subscriber = %subscriber, namespace = %namespace, since = %since))]
    pub async fn poll(
        &self,
        subscriber: &SubscriberId,
        namespace: &Namespace,
        since: Revision,
        timeout: Option<Duration>,
    ) -> CoreResult<PollResponse> {
        let acked = self.subscription(subscriber, namespace).await?.last_acked;
        let published = self.feed.head(namespace);
        if since > published {
            return Err(CoreError::invalid(format!(
                "cannot poll from revision {since}; namespace {namespace} is at {published}"
            )));
        }
        let from = since.max(acked);
        let timeout = timeout
            .unwrap_or(self.options.poll_timeout)
            .min(self.options.poll_timeout);

        // Subscribe before reading so a commit between the two is not missed.
        let mut head = self.feed.watch(namespace);
        let changes = self.feed.since(namespace, from, self.options.max_batch);
        if !changes.is_empty() {
            return Ok(response(changes, from, false));
        }

        // A dropped sender means the feed is shutting down; answer like a timeout.
        let advanced = matches!(
            tokio::time::timeout(timeout, head.wait_for(|rev| *rev > from)).await,
            Ok(Ok(_))
        );
        if !advanced {
            debug!("poll timed out");
            return Ok(response(Vec::new(), from, true));
        }
        let changes = self.feed.since(namespace, from, self.options.max_batch);
        Ok(response(changes, from, false))
    }

    /// Advance the subscriber's acked position to `revision`.
    ///
    /// Acking a revision behind the recorded one fails with the benign `StaleAck`
    /// and changes nothing. Acking past the published head is rejected.
    #[instrument(skip_all, fields(subscriber = %subscriber, namespace = %namespace, revision = %revision))]
    pub async fn ack(
        &self,
        subscriber: &SubscriberId,
        namespace: &Namespace,
        revision: Revision,
    ) -> CoreResult<Subscription> {
        let head = self.feed.head(namespace);
        if revision > head {
            return Err(CoreError::invalid(format!(
                "cannot ack revision {revision}; namespace {namespace} is at {head}"
            )));
        }

        let mut subs = self.subscriptions.lock().await;
        let key = (namespace.clone(), subscriber.clone());
        let current = subs
            .get(&key)
            .ok_or_else(|| not_subscribed(subscriber, namespace))?;
        if revision < current.last_acked {
            debug!(recorded = %current.last_acked, "stale ack ignored");
            return Err(CoreError::StaleAck {
                requested: revision,
                recorded: current.last_acked,
            });
        }
        if revision == current.last_acked {
            return Ok(current.clone());
        }

        let mut next = current.clone();
        next.last_acked = revision;
        self.persist(&next).await?;
        subs.insert(key, next.clone());
        self.feed.set_floor(namespace, read_floor(&subs, namespace));
        Ok(next)
    }

    async fn persist(&self, sub: &Subscription) -> CoreResult<()> {
        let bytes = serde_json::to_vec(sub).map_err(CoreError::storage)?;
        self.blobs
            .put(&blob_key(&sub.namespace, &sub.subscriber_id), &bytes)
            .await?;
        Ok(())
    }
}

fn response(changes: Vec<Change>, from: Revision, timed_out: bool) -> PollResponse {
    let next_token = changes.last().map(|c| c.revision).unwrap_or(from);
    PollResponse {
        changes,
        next_token,
        timed_out,
    }
}

/// Lowest acked revision among `namespace`'s subscribers; none left means no
/// reader needs history.
fn read_floor(subs: &BTreeMap<SubscriptionKey, Subscription>, namespace: &Namespace) -> Revision {
    subs.values()
        .filter(|sub| sub.namespace == *namespace)
        .map(|sub| sub.last_acked)
        .min()
        .unwrap_or(Revision::MAX)
}

fn blob_key(namespace: &Namespace, subscriber: &SubscriberId) -> String {
    format!("{SUBSCRIPTION_PREFIX}{namespace}/{subscriber}")
}

fn not_subscribed(subscriber: &SubscriberId, namespace: &Namespace) -> CoreError {
    CoreError::SubscriptionNotFound {
        subscriber: subscriber.to_string(),
        namespace: namespace.to_string(),
    }
}

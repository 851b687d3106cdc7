use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use conflux_core::model::{Change, Namespace, Revision, SubscriberId};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::coordinator::DistributionCoordinator;

/// Push hint sent to a subscriber's webhook. Receivers still poll/ack; a push only
/// says there is something to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotice {
    pub subscriber_id: SubscriberId,
    pub namespace: Namespace,
    pub changes: Vec<Change>,
    pub next_token: Revision,
}

/// Delivery channel for push hints.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, endpoint: &str, notice: &PushNotice) -> Result<()>;
}

/// Drops every notice. Used when push delivery is disabled.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    fn name(&self) -> &'static str {
        "noop"
    }

    #[instrument(skip_all)]
    async fn notify(&self, _endpoint: &str, _notice: &PushNotice) -> Result<()> {
        Ok(())
    }
}

/// POSTs notices as JSON to the subscription's endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers())
            .build()?;
        Ok(Self { client })
    }
}

fn headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static("confluxd"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    #[instrument(skip_all, fields(endpoint = %endpoint, namespace = %notice.namespace, next = %notice.next_token))]
    async fn notify(&self, endpoint: &str, notice: &PushNotice) -> Result<()> {
        self.client
            .post(endpoint)
            .json(notice)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Background task that pushes new changes to subscribers with an endpoint.
///
/// Tracks, per subscription, the last revision it delivered. Failed deliveries are
/// retried on the next tick; delivery never moves the acked position.
pub struct PushDispatcher {
    coordinator: Arc<DistributionCoordinator>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    delivered: HashMap<(Namespace, SubscriberId), Revision>,
}

impl PushDispatcher {
    pub fn new(
        coordinator: Arc<DistributionCoordinator>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            notifier,
            interval,
            delivered: HashMap::new(),
        }
    }

    /// Deliver pending changes once. Returns the number of notices sent.
    ///
    /// Delivery positions of subscriptions that no longer exist are dropped.
    pub async fn dispatch_once(&mut self) -> usize {
        let max_batch = self.coordinator.options().max_batch;
        let subscriptions = self.coordinator.subscriptions().await;
        let live: HashSet<(Namespace, SubscriberId)> = subscriptions
            .iter()
            .map(|sub| (sub.namespace.clone(), sub.subscriber_id.clone()))
            .collect();
        self.delivered.retain(|key, _| live.contains(key));

        let mut sent = 0;
        for sub in subscriptions {
            let Some(endpoint) = sub.endpoint.as_deref() else {
                continue;
            };
            let key = (sub.namespace.clone(), sub.subscriber_id.clone());
            let from = self
                .delivered
                .get(&key)
                .copied()
                .unwrap_or_default()
                .max(sub.last_acked);
            let changes = self.coordinator.feed().since(&sub.namespace, from, max_batch);
            let Some(last) = changes.last().map(|c| c.revision) else {
                continue;
            };
            let notice = PushNotice {
                subscriber_id: sub.subscriber_id.clone(),
                namespace: sub.namespace.clone(),
                changes,
                next_token: last,
            };
            match self.notifier.notify(endpoint, &notice).await {
                Ok(()) => {
                    debug!(subscriber = %sub.subscriber_id, next = %last, "push delivered");
                    self.delivered.insert(key, last);
                    sent += 1;
                }
                Err(err) => {
                    warn!(
                        subscriber = %sub.subscriber_id,
                        notifier = self.notifier.name(),
                        error = %err,
                        "push delivery failed; will retry"
                    );
                }
            }
        }
        sent
    }

    /// Tick until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(notifier = self.notifier.name(), interval = ?self.interval, "push dispatcher started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.dispatch_once().await;
                }
            }
        }
        info!("push dispatcher stopped");
    }
}

//! Distribution of committed changes to subscribed services: long-poll reads with
//! a namespace consistency token, acknowledgements, and webhook push hints.

pub mod coordinator;
pub mod push;

pub use coordinator::{CoordinatorOptions, DistributionCoordinator, PollResponse};
pub use push::{Notifier, PushDispatcher, PushNotice, WebhookNotifier};

//! Post-acceptance webhook contract.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

/// Summary of an accepted message, handed to the notifier after the queue
/// sink has taken ownership of the body.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryNotice {
    pub queue_id: String,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub size: u64,
    pub peer: String,
}

/// Fire-and-forget notification. Implementations own their timeout and
/// retry policy; a failed notification must never affect the SMTP reply.
#[async_trait]
pub trait WebhookNotifier: Send + Sync + fmt::Debug {
    async fn notify(&self, notice: DeliveryNotice);
}

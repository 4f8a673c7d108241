//! Queue sink contract and in-process implementations.
//!
//! The ingest core hands every accepted message to a [`QueueSink`] together
//! with its envelope; ownership of the body transfers with the call. The
//! durable outbound queue lives outside the core; [`MemoryQueue`] and
//! [`TestQueue`] exist for small deployments and tests.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use postern_common::envelope::Envelope;
use thiserror::Error;
use tokio::sync::Notify;

/// Identifier assigned to an accepted message, echoed in the `250 OK`
/// reply and used by downstream delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueId(ulid::Ulid);

impl QueueId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(fmt)
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The sink could not take the message right now; the client may retry.
    #[error("transient queue failure: {0}")]
    Transient(String),

    /// The sink refused the message permanently.
    #[error("permanent queue failure: {0}")]
    Permanent(String),
}

/// A message as handed over by the session: the envelope collected during
/// the transaction plus the fully ingested body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: QueueId,
    pub envelope: Envelope,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait QueueSink: Send + Sync + fmt::Debug {
    /// Take ownership of an accepted message.
    async fn enqueue(&self, envelope: Envelope, body: Vec<u8>) -> Result<QueueId, QueueError>;
}

/// Unbounded in-process queue. Messages accumulate until drained.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    messages: Mutex<Vec<QueuedMessage>>,
}

impl MemoryQueue {
    /// Remove and return everything queued so far.
    ///
    /// # Panics
    /// Panics if the messages mutex is poisoned.
    pub fn drain(&self) -> Vec<QueuedMessage> {
        std::mem::take(
            &mut *self
                .messages
                .lock()
                .expect("MemoryQueue messages mutex poisoned"),
        )
    }

    /// # Panics
    /// Panics if the messages mutex is poisoned.
    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .expect("MemoryQueue messages mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QueueSink for MemoryQueue {
    async fn enqueue(&self, envelope: Envelope, body: Vec<u8>) -> Result<QueueId, QueueError> {
        let id = QueueId::new();
        self.messages
            .lock()
            .map_err(|_| QueueError::Transient("messages mutex poisoned".to_string()))?
            .push(QueuedMessage {
                id: id.clone(),
                envelope,
                body,
            });
        Ok(id)
    }
}

/// Scriptable queue for tests: records every enqueue, can be told to fail,
/// and lets a test wait until a number of messages have arrived.
#[derive(Debug, Clone, Default)]
pub struct TestQueue {
    messages: Arc<Mutex<Vec<QueuedMessage>>>,
    failure: Arc<Mutex<Option<FailureMode>>>,
    notify: Arc<Notify>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureMode {
    Transient,
    Permanent,
}

impl TestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages enqueued so far.
    ///
    /// # Panics
    /// Panics if the messages mutex is poisoned.
    pub fn messages(&self) -> Vec<QueuedMessage> {
        self.messages
            .lock()
            .expect("TestQueue messages mutex poisoned")
            .clone()
    }

    /// # Panics
    /// Panics if the messages mutex is poisoned.
    pub fn message_count(&self) -> usize {
        self.messages
            .lock()
            .expect("TestQueue messages mutex poisoned")
            .len()
    }

    /// Make every subsequent enqueue fail transiently.
    ///
    /// # Panics
    /// Panics if the failure mutex is poisoned.
    pub fn fail_transient(&self) {
        *self.failure.lock().expect("TestQueue failure mutex poisoned") =
            Some(FailureMode::Transient);
    }

    /// Make every subsequent enqueue fail permanently.
    ///
    /// # Panics
    /// Panics if the failure mutex is poisoned.
    pub fn fail_permanent(&self) {
        *self.failure.lock().expect("TestQueue failure mutex poisoned") =
            Some(FailureMode::Permanent);
    }

    /// Wait until at least `expected` messages have been enqueued.
    ///
    /// # Errors
    /// Returns an error if the timeout is reached before the expected count.
    pub async fn wait_for_count(
        &self,
        expected: usize,
        timeout: std::time::Duration,
    ) -> Result<(), tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                // Register before checking so a concurrent notify_waiters
                // between the check and the await cannot be missed.
                notified.as_mut().enable();

                if self.message_count() >= expected {
                    return;
                }
                notified.await;
            }
        })
        .await
    }
}

#[async_trait]
impl QueueSink for TestQueue {
    async fn enqueue(&self, envelope: Envelope, body: Vec<u8>) -> Result<QueueId, QueueError> {
        let failure = *self
            .failure
            .lock()
            .map_err(|_| QueueError::Transient("failure mutex poisoned".to_string()))?;

        match failure {
            Some(FailureMode::Transient) => {
                Err(QueueError::Transient("queue unavailable".to_string()))
            }
            Some(FailureMode::Permanent) => {
                Err(QueueError::Permanent("message refused".to_string()))
            }
            None => {
                let id = QueueId::new();
                self.messages
                    .lock()
                    .map_err(|_| QueueError::Transient("messages mutex poisoned".to_string()))?
                    .push(QueuedMessage {
                        id: id.clone(),
                        envelope,
                        body,
                    });
                self.notify.notify_waiters();
                Ok(id)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use postern_common::envelope::{Envelope, Recipient};

    use super::{MemoryQueue, QueueError, QueueSink, TestQueue};

    fn envelope() -> Envelope {
        let mut envelope = Envelope::default();
        *envelope.sender_mut() = Some("a@x".to_string());
        envelope.push_recipient(Recipient::new("b@y"));
        envelope
    }

    #[tokio::test]
    async fn memory_queue_round_trip() {
        let queue = MemoryQueue::default();

        let id = queue.enqueue(envelope(), b"body".to_vec()).await.unwrap();
        assert_eq!(queue.len(), 1);

        let drained = queue.drain();
        assert!(queue.is_empty());
        assert_eq!(drained[0].id, id);
        assert_eq!(drained[0].body, b"body");
        assert_eq!(drained[0].envelope.sender(), Some("a@x"));
    }

    #[tokio::test]
    async fn queue_ids_are_unique() {
        let queue = MemoryQueue::default();
        let a = queue.enqueue(envelope(), Vec::new()).await.unwrap();
        let b = queue.enqueue(envelope(), Vec::new()).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_queue_failure_modes() {
        let queue = TestQueue::new();

        queue.fail_transient();
        assert!(matches!(
            queue.enqueue(envelope(), Vec::new()).await,
            Err(QueueError::Transient(_))
        ));

        queue.fail_permanent();
        assert!(matches!(
            queue.enqueue(envelope(), Vec::new()).await,
            Err(QueueError::Permanent(_))
        ));

        assert_eq!(queue.message_count(), 0);
    }

    #[tokio::test]
    async fn wait_for_count_sees_concurrent_enqueue() {
        let queue = TestQueue::new();
        let writer = queue.clone();

        let handle = tokio::spawn(async move {
            writer.enqueue(envelope(), b"hello".to_vec()).await.unwrap();
        });

        queue
            .wait_for_count(1, std::time::Duration::from_secs(5))
            .await
            .unwrap();
        handle.await.unwrap();

        assert_eq!(queue.messages()[0].body, b"hello");
    }
}

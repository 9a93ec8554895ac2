//! In-process message queue between ingestion and the rule engine.
//!
//! A bounded `tokio::sync::mpsc` channel carries opaque envelopes. Every
//! [`Delivery`] must be settled with [`Envelope::ack`] or
//! [`Envelope::requeue`]; both consume the delivery, so a message is settled
//! at most once. The consumer only depends on [`MessageSource`] and
//! [`Envelope`], so another transport can be slotted in without touching it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::error::QueueError;

// ---

/// A delivered message awaiting settlement.
pub trait Envelope: Send {
    // ---
    fn payload(&self) -> &[u8];

    fn delivery_tag(&self) -> u64;

    /// How many times this message has been requeued before.
    fn redelivered(&self) -> u32;

    /// Settle the message as done.
    fn ack(self) -> Result<(), QueueError>;

    /// Hand the message back to the queue for another attempt.
    fn requeue(self) -> Result<(), QueueError>;
}

/// An ordered source of deliveries. `None` means the channel is closed.
#[async_trait]
pub trait MessageSource: Send + Sync {
    // ---
    type Delivery: Envelope;

    async fn next(&self) -> Option<Self::Delivery>;

    fn queue_name(&self) -> &str;
}

/// Counters shared by every handle of one queue.
#[derive(Debug, Default)]
pub struct QueueStats {
    // ---
    pub published: AtomicU64,
    pub acked: AtomicU64,
    pub requeued: AtomicU64,
}

#[derive(Debug)]
struct Message {
    tag: u64,
    body: Vec<u8>,
    redelivered: u32,
}

#[derive(Debug)]
struct Shared {
    name: String,
    next_tag: AtomicU64,
    stats: QueueStats,
}

/// Create a queue holding at most `capacity` undelivered messages.
pub fn channel(name: impl Into<String>, capacity: usize) -> (Publisher, Subscription) {
    // ---
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared {
        name: name.into(),
        next_tag: AtomicU64::new(1),
        stats: QueueStats::default(),
    });

    let publisher = Publisher {
        tx: tx.clone(),
        shared: Arc::clone(&shared),
    };
    let subscription = Subscription {
        rx: Arc::new(Mutex::new(rx)),
        requeue_tx: tx.downgrade(),
        shared,
    };
    (publisher, subscription)
}

// ---

/// Sending half. The queue closes once every publisher is dropped.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::Sender<Message>,
    shared: Arc<Shared>,
}

impl Publisher {
    // ---
    /// Enqueue raw bytes, waiting for space. Returns the delivery tag.
    pub async fn publish(&self, body: Vec<u8>) -> Result<u64, QueueError> {
        // ---
        let tag = self.shared.next_tag.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(Message {
                tag,
                body,
                redelivered: 0,
            })
            .await
            .map_err(|_| QueueError::Closed(self.shared.name.clone()))?;

        self.shared.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(tag)
    }

    /// Encode `value` as JSON and enqueue it.
    pub async fn publish_json<T: Serialize>(&self, value: &T) -> Result<u64, QueueError> {
        let body = serde_json::to_vec(value)?;
        self.publish(body).await
    }

    pub fn queue_name(&self) -> &str {
        &self.shared.name
    }
}

// ---

/// Receiving half. Clones share one receiver, so concurrent consumers
/// split the stream between them.
#[derive(Debug, Clone)]
pub struct Subscription {
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    requeue_tx: mpsc::WeakSender<Message>,
    shared: Arc<Shared>,
}

impl Subscription {
    // ---
    pub fn stats(&self) -> &QueueStats {
        &self.shared.stats
    }
}

#[async_trait]
impl MessageSource for Subscription {
    // ---
    type Delivery = Delivery;

    async fn next(&self) -> Option<Delivery> {
        // ---
        let message = self.rx.lock().await.recv().await?;
        Some(Delivery {
            message,
            requeue_tx: self.requeue_tx.clone(),
            shared: Arc::clone(&self.shared),
        })
    }

    fn queue_name(&self) -> &str {
        &self.shared.name
    }
}

/// One message taken off the queue.
#[derive(Debug)]
pub struct Delivery {
    message: Message,
    requeue_tx: mpsc::WeakSender<Message>,
    shared: Arc<Shared>,
}

impl Envelope for Delivery {
    // ---
    fn payload(&self) -> &[u8] {
        &self.message.body
    }

    fn delivery_tag(&self) -> u64 {
        self.message.tag
    }

    fn redelivered(&self) -> u32 {
        self.message.redelivered
    }

    fn ack(self) -> Result<(), QueueError> {
        self.shared.stats.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn requeue(self) -> Result<(), QueueError> {
        // ---
        // Never wait for space here: the caller may be the only consumer
        // draining this queue.
        let tx = self
            .requeue_tx
            .upgrade()
            .ok_or_else(|| QueueError::Closed(self.shared.name.clone()))?;

        let message = Message {
            redelivered: self.message.redelivered.saturating_add(1),
            ..self.message
        };
        tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full(self.shared.name.clone()),
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed(self.shared.name.clone()),
        })?;

        self.shared.stats.requeued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

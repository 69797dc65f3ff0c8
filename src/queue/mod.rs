//! Work queue carrying one message per scheduled tick from the trigger to the
//! job consumer.
//!
//! Delivery is at-least-once with a single message in flight per routing key:
//! while a claimed delivery is neither acked nor past its visibility deadline,
//! `receive` on the same routing key yields nothing. A consumer that dies
//! mid-message therefore blocks its key only until the deadline passes, after
//! which the message is handed out again.

mod consumer;
mod memory;

pub use consumer::{ConsumeOutcome, DeliveryPolicy, JobConsumer, JobHandler};
pub use memory::InMemoryWorkQueue;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload published by a trigger that won its tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkMessage {
    /// Job id the consumer is expected to run.
    pub job: String,
    /// Unix seconds of the tick that produced this message.
    pub triggered_at: i64,
    /// Unique per publish, for tracing duplicates across instances.
    pub trigger_id: String,
    /// `schedule:<instance-id>` of the publisher.
    pub triggered_by: String,
}

impl WorkMessage {
    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

/// One claimed message.
///
/// `delivery_count` counts claims including this one, and also identifies the
/// claim: ack/requeue/dead-letter of a delivery whose message was since
/// reclaimed by another consumer are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    pub routing_key: String,
    pub payload: String,
    pub delivery_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub id: i64,
    pub message_id: i64,
    pub routing_key: String,
    pub payload: String,
    pub delivery_count: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

pub trait WorkQueue: Send + Sync {
    fn publish(&self, routing_key: &str, payload: &str) -> Result<i64>;

    /// Claim the oldest receivable message for `routing_key`, or `None` if the
    /// queue is empty or another delivery for the key is still in flight.
    fn receive(&self, routing_key: &str) -> Result<Option<Delivery>>;

    /// Remove a processed message. `Ok(false)` if the claim is stale.
    fn ack(&self, delivery: &Delivery) -> Result<bool>;

    /// Make the message immediately receivable again.
    fn requeue(&self, delivery: &Delivery) -> Result<bool>;

    /// Like [`WorkQueue::requeue`], but the delivery does not count towards
    /// the message's `delivery_count`. Used when a run was interrupted
    /// rather than failed.
    fn release(&self, delivery: &Delivery) -> Result<bool>;

    /// Move the message out of the queue into the dead-letter list.
    fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<bool>;

    fn dead_letters(&self, routing_key: &str) -> Result<Vec<DeadLetter>>;

    /// Messages still queued for `routing_key`, in flight or not.
    fn pending_count(&self, routing_key: &str) -> Result<usize>;
}

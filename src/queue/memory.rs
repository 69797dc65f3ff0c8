use super::{DeadLetter, Delivery, WorkQueue};
use crate::clock::Clock;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct QueuedMessage {
    id: i64,
    routing_key: String,
    payload: String,
    delivery_count: u32,
    in_flight_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct QueueState {
    next_id: i64,
    next_dead_letter_id: i64,
    messages: Vec<QueuedMessage>,
    dead_letters: Vec<DeadLetter>,
}

/// Single-process work queue with the same delivery semantics as the SQLite
/// backed one.
pub struct InMemoryWorkQueue {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
}

impl InMemoryWorkQueue {
    pub fn new(clock: Arc<dyn Clock>, visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
            visibility_timeout,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut QueueState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("In-memory work queue mutex poisoned"))?;
        Ok(f(&mut state))
    }

    fn claimed(state: &QueueState, delivery: &Delivery) -> Option<usize> {
        state.messages.iter().position(|m| {
            m.id == delivery.id
                && m.delivery_count == delivery.delivery_count
                && m.in_flight_until.is_some()
        })
    }
}

impl WorkQueue for InMemoryWorkQueue {
    fn publish(&self, routing_key: &str, payload: &str) -> Result<i64> {
        self.with_state(|state| {
            state.next_id += 1;
            let id = state.next_id;
            state.messages.push(QueuedMessage {
                id,
                routing_key: routing_key.to_string(),
                payload: payload.to_string(),
                delivery_count: 0,
                in_flight_until: None,
            });
            id
        })
    }

    fn receive(&self, routing_key: &str) -> Result<Option<Delivery>> {
        let now = self.clock.now();
        let deadline = now + chrono::Duration::from_std(self.visibility_timeout)?;
        self.with_state(|state| {
            let busy = state.messages.iter().any(|m| {
                m.routing_key == routing_key
                    && matches!(m.in_flight_until, Some(until) if until > now)
            });
            if busy {
                return None;
            }
            let message = state
                .messages
                .iter_mut()
                .find(|m| m.routing_key == routing_key)?;
            message.delivery_count += 1;
            message.in_flight_until = Some(deadline);
            Some(Delivery {
                id: message.id,
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
                delivery_count: message.delivery_count,
            })
        })
    }

    fn ack(&self, delivery: &Delivery) -> Result<bool> {
        self.with_state(|state| match Self::claimed(state, delivery) {
            Some(index) => {
                state.messages.remove(index);
                true
            }
            None => false,
        })
    }

    fn requeue(&self, delivery: &Delivery) -> Result<bool> {
        self.with_state(|state| match Self::claimed(state, delivery) {
            Some(index) => {
                state.messages[index].in_flight_until = None;
                true
            }
            None => false,
        })
    }

    fn release(&self, delivery: &Delivery) -> Result<bool> {
        self.with_state(|state| match Self::claimed(state, delivery) {
            Some(index) => {
                let message = &mut state.messages[index];
                message.in_flight_until = None;
                message.delivery_count = message.delivery_count.saturating_sub(1);
                true
            }
            None => false,
        })
    }

    fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<bool> {
        let now = self.clock.now();
        self.with_state(|state| match Self::claimed(state, delivery) {
            Some(index) => {
                let message = state.messages.remove(index);
                state.next_dead_letter_id += 1;
                let id = state.next_dead_letter_id;
                state.dead_letters.push(DeadLetter {
                    id,
                    message_id: message.id,
                    routing_key: message.routing_key,
                    payload: message.payload,
                    delivery_count: message.delivery_count,
                    reason: reason.to_string(),
                    dead_lettered_at: now,
                });
                true
            }
            None => false,
        })
    }

    fn dead_letters(&self, routing_key: &str) -> Result<Vec<DeadLetter>> {
        self.with_state(|state| {
            state
                .dead_letters
                .iter()
                .filter(|d| d.routing_key == routing_key)
                .cloned()
                .collect()
        })
    }

    fn pending_count(&self, routing_key: &str) -> Result<usize> {
        self.with_state(|state| {
            state
                .messages
                .iter()
                .filter(|m| m.routing_key == routing_key)
                .count()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn queue() -> (InMemoryWorkQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        ));
        (
            InMemoryWorkQueue::new(clock.clone(), Duration::from_secs(60)),
            clock,
        )
    }

    #[test]
    fn test_single_message_in_flight_per_key() {
        let (queue, _clock) = queue();
        queue.publish("jobs.a", "one").unwrap();
        queue.publish("jobs.a", "two").unwrap();
        queue.publish("jobs.b", "other").unwrap();

        let first = queue.receive("jobs.a").unwrap().unwrap();
        assert_eq!(first.payload, "one");
        assert_eq!(first.delivery_count, 1);
        assert!(queue.receive("jobs.a").unwrap().is_none());
        assert_eq!(queue.receive("jobs.b").unwrap().unwrap().payload, "other");

        assert!(queue.ack(&first).unwrap());
        assert_eq!(queue.receive("jobs.a").unwrap().unwrap().payload, "two");
    }

    #[test]
    fn test_unacked_delivery_is_redelivered_after_visibility_timeout() {
        let (queue, clock) = queue();
        queue.publish("jobs.a", "work").unwrap();

        let first = queue.receive("jobs.a").unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(59));
        assert!(queue.receive("jobs.a").unwrap().is_none());

        clock.advance(chrono::Duration::seconds(2));
        let second = queue.receive("jobs.a").unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.delivery_count, 2);

        // the crashed consumer's late ack must not drop the new claim
        assert!(!queue.ack(&first).unwrap());
        assert_eq!(queue.pending_count("jobs.a").unwrap(), 1);
        assert!(queue.ack(&second).unwrap());
        assert_eq!(queue.pending_count("jobs.a").unwrap(), 0);
    }

    #[test]
    fn test_requeue_and_dead_letter() {
        let (queue, _clock) = queue();
        queue.publish("jobs.a", "work").unwrap();

        let first = queue.receive("jobs.a").unwrap().unwrap();
        assert!(queue.requeue(&first).unwrap());
        let second = queue.receive("jobs.a").unwrap().unwrap();
        assert_eq!(second.delivery_count, 2);

        assert!(queue.dead_letter(&second, "boom").unwrap());
        assert!(queue.receive("jobs.a").unwrap().is_none());

        let dead = queue.dead_letters("jobs.a").unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, second.id);
        assert_eq!(dead[0].delivery_count, 2);
        assert_eq!(dead[0].reason, "boom");
        assert!(queue.dead_letters("jobs.b").unwrap().is_empty());
    }

    #[test]
    fn test_release_gives_the_delivery_back() {
        let (queue, _clock) = queue();
        queue.publish("jobs.a", "work").unwrap();

        let first = queue.receive("jobs.a").unwrap().unwrap();
        assert!(queue.release(&first).unwrap());
        assert!(!queue.release(&first).unwrap());

        let second = queue.receive("jobs.a").unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.delivery_count, 1);
    }
}

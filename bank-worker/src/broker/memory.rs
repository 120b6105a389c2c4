//! In-process broker.
//!
//! All lanes live behind one mutex so every transition is atomic with respect
//! to concurrent workers. Blocked leasers park on a [`Notify`] and are woken on
//! enqueue and retry, or when the next scheduled envelope or lease deadline is
//! due. Nothing survives a restart; use [`super::AmqpBroker`] for durability.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Broker, BrokerError, DeadLetter, LaneStats, Lease};
use crate::task::envelope::add_duration;
use crate::task::{Envelope, TaskId};

/// How long a lease stays valid when no timeout is configured.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Ordering key: eligibility time, then insertion sequence.
type Slot = (DateTime<Utc>, u64);

#[derive(Default)]
struct Lane {
    pending: BTreeMap<Slot, Envelope>,
    scheduled: BTreeMap<Slot, Envelope>,
    in_flight: HashMap<TaskId, InFlight>,
    dead: Vec<DeadLetter>,
}

struct InFlight {
    envelope: Envelope,
    token: u64,
    deadline: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    lanes: HashMap<String, Lane>,
    /// Ids enqueued and not yet acked
    known: HashSet<TaskId>,
    seq: u64,
    next_token: u64,
}

impl State {
    fn next_slot(&mut self, at: DateTime<Utc>) -> Slot {
        self.seq += 1;
        (at, self.seq)
    }

    /// Place an envelope in pending or scheduled depending on `process_at`.
    fn place(&mut self, envelope: Envelope, now: DateTime<Utc>) {
        let slot = self.next_slot(envelope.process_at);
        let lane = self.lanes.entry(envelope.queue.clone()).or_default();
        if envelope.is_due(now) {
            lane.pending.insert(slot, envelope);
        } else {
            lane.scheduled.insert(slot, envelope);
        }
    }

    /// Promote due scheduled envelopes and reclaim expired leases.
    fn maintain(&mut self, now: DateTime<Utc>) -> usize {
        let mut reclaimed = Vec::new();
        for (name, lane) in self.lanes.iter_mut() {
            while let Some(entry) = lane.scheduled.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let (slot, envelope) = entry.remove_entry();
                lane.pending.insert(slot, envelope);
            }

            let expired: Vec<TaskId> = lane
                .in_flight
                .iter()
                .filter(|(_, held)| held.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                if let Some(held) = lane.in_flight.remove(&id) {
                    warn!(
                        task_id = %id,
                        queue = %name,
                        task_type = %held.envelope.task_type,
                        "broker_lease_expired"
                    );
                    reclaimed.push(held.envelope);
                }
            }
        }

        let count = reclaimed.len();
        for envelope in reclaimed {
            let slot = self.next_slot(envelope.process_at);
            self.lanes
                .entry(envelope.queue.clone())
                .or_default()
                .pending
                .insert(slot, envelope);
        }
        count
    }

    fn take(&mut self, queues: &[String], now: DateTime<Utc>, lease_timeout: Duration) -> Option<Lease> {
        for queue in queues {
            let Some(lane) = self.lanes.get_mut(queue) else {
                continue;
            };
            let Some((_, envelope)) = lane.pending.pop_first() else {
                continue;
            };

            self.next_token += 1;
            let lease = Lease {
                envelope: envelope.clone(),
                token: self.next_token,
                deadline: add_duration(now, lease_timeout),
            };
            lane.in_flight.insert(
                envelope.id,
                InFlight {
                    envelope,
                    token: lease.token,
                    deadline: lease.deadline,
                },
            );
            return Some(lease);
        }
        None
    }

    /// Earliest moment something in `queues` may become leasable.
    fn next_wakeup(&self, queues: &[String]) -> Option<DateTime<Utc>> {
        queues
            .iter()
            .filter_map(|queue| self.lanes.get(queue))
            .flat_map(|lane| {
                let scheduled = lane.scheduled.keys().next().map(|slot| slot.0);
                let deadlines = lane.in_flight.values().map(|held| held.deadline);
                scheduled.into_iter().chain(deadlines)
            })
            .min()
    }

    /// Remove the envelope held by `lease`, failing if the lease is stale.
    fn release(&mut self, lease: &Lease) -> Result<Envelope, BrokerError> {
        let id = lease.task_id();
        let lane = self
            .lanes
            .get_mut(&lease.envelope.queue)
            .ok_or(BrokerError::LeaseLost(id))?;
        match lane.in_flight.get(&id) {
            Some(held) if held.token == lease.token => {}
            _ => return Err(BrokerError::LeaseLost(id)),
        }
        lane.in_flight
            .remove(&id)
            .map(|held| held.envelope)
            .ok_or(BrokerError::LeaseLost(id))
    }

    fn bury(&mut self, envelope: Envelope, reason: &str, now: DateTime<Utc>) {
        self.lanes
            .entry(envelope.queue.clone())
            .or_default()
            .dead
            .push(DeadLetter {
                envelope,
                reason: reason.to_string(),
                died_at: now,
            });
    }
}

/// Broker that keeps every lane in process memory.
pub struct MemoryBroker {
    state: Mutex<State>,
    notify: Notify,
    lease_timeout: Duration,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_lease_timeout(DEFAULT_LEASE_TIMEOUT)
    }

    /// Create a broker whose leases expire after `lease_timeout`.
    pub fn with_lease_timeout(lease_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            lease_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, envelope: Envelope) -> Result<TaskId, BrokerError> {
        let id = envelope.id;
        {
            let mut state = self.lock();
            if !state.known.insert(id) {
                return Err(BrokerError::DuplicateTask(id));
            }
            state.place(envelope, Utc::now());
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn lease(&self, queues: &[String], wait: Duration) -> Result<Option<Lease>, BrokerError> {
        let give_up = Instant::now() + wait;

        loop {
            // Register interest before inspecting state so an enqueue between
            // the check and the wait still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_in = {
                let mut state = self.lock();
                let now = Utc::now();
                let reclaimed = state.maintain(now);
                if reclaimed > 0 {
                    debug!(reclaimed = reclaimed, "broker_leases_reclaimed");
                }
                if let Some(lease) = state.take(queues, now, self.lease_timeout) {
                    return Ok(Some(lease));
                }
                state
                    .next_wakeup(queues)
                    .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            };

            let remaining = give_up.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let sleep_for = wake_in
                .map_or(remaining, |wake| wake.min(remaining))
                .max(Duration::from_millis(1));
            let _ = tokio::time::timeout(sleep_for, notified).await;
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let envelope = state.release(lease)?;
        state.known.remove(&envelope.id);
        Ok(())
    }

    /// Envelopes whose retry budget is already spent are dead-lettered
    /// instead, so `retry_count` never exceeds `max_retry`.
    async fn retry(&self, lease: &Lease, error: &str, retry_at: DateTime<Utc>) -> Result<(), BrokerError> {
        {
            let mut state = self.lock();
            let mut envelope = state.release(lease)?;
            let now = Utc::now();
            envelope.last_error = Some(error.to_string());
            if envelope.retries_exhausted() {
                state.bury(envelope, error, now);
                return Ok(());
            }
            envelope.retry_count += 1;
            envelope.process_at = retry_at;
            state.place(envelope, now);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn kill(&self, lease: &Lease, reason: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let envelope = state.release(lease)?;
        state.bury(envelope, reason, Utc::now());
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<LaneStats, BrokerError> {
        let mut state = self.lock();
        state.maintain(Utc::now());
        Ok(state
            .lanes
            .get(queue)
            .map(|lane| LaneStats {
                pending: lane.pending.len(),
                scheduled: lane.scheduled.len(),
                in_flight: lane.in_flight.len(),
                dead: lane.dead.len(),
            })
            .unwrap_or_default())
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BrokerError> {
        let state = self.lock();
        Ok(state
            .lanes
            .get(queue)
            .map(|lane| lane.dead.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NewTask, TaskOptions, QUEUE_CRITICAL, QUEUE_DEFAULT};

    fn lanes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn envelope(options: TaskOptions) -> Envelope {
        NewTask::new("task:test", b"{}".to_vec())
            .with_options(options)
            .into_envelope(Utc::now())
    }

    #[tokio::test]
    async fn test_enqueue_lease_ack() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(envelope(TaskOptions::new())).await.unwrap();

        let lease = broker
            .lease(&lanes(&[QUEUE_DEFAULT]), Duration::from_millis(10))
            .await
            .unwrap()
            .expect("envelope should be leasable");
        assert_eq!(lease.task_id(), id);
        assert_eq!(broker.stats(QUEUE_DEFAULT).await.unwrap().in_flight, 1);

        broker.ack(&lease).await.unwrap();
        assert_eq!(broker.stats(QUEUE_DEFAULT).await.unwrap(), LaneStats::default());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let broker = MemoryBroker::new();
        let env = envelope(TaskOptions::new());
        broker.enqueue(env.clone()).await.unwrap();

        let err = broker.enqueue(env).await.unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateTask(_)));
    }

    #[tokio::test]
    async fn test_lease_times_out_when_empty() {
        let broker = MemoryBroker::new();
        let started = Instant::now();
        let lease = broker
            .lease(&lanes(&[QUEUE_DEFAULT]), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(lease.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_blocked_lease_woken_by_enqueue() {
        let broker = std::sync::Arc::new(MemoryBroker::new());

        let producer = std::sync::Arc::clone(&broker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.enqueue(envelope(TaskOptions::new())).await.unwrap();
        });

        let lease = broker
            .lease(&lanes(&[QUEUE_DEFAULT]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(lease.is_some());
    }

    #[tokio::test]
    async fn test_future_envelope_not_leased_early() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(envelope(TaskOptions::new().process_in(Duration::from_millis(200))))
            .await
            .unwrap();
        assert_eq!(broker.stats(QUEUE_DEFAULT).await.unwrap().scheduled, 1);

        let early = broker
            .lease(&lanes(&[QUEUE_DEFAULT]), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(early.is_none());

        let lease = broker
            .lease(&lanes(&[QUEUE_DEFAULT]), Duration::from_secs(2))
            .await
            .unwrap()
            .expect("envelope becomes eligible");
        assert!(lease.envelope.process_at <= Utc::now());
    }

    #[tokio::test]
    async fn test_expired_lease_redelivered_once() {
        let broker = MemoryBroker::with_lease_timeout(Duration::from_millis(50));
        let id = broker.enqueue(envelope(TaskOptions::new())).await.unwrap();
        let queues = lanes(&[QUEUE_DEFAULT]);

        let abandoned = broker.lease(&queues, Duration::ZERO).await.unwrap().unwrap();

        let second = broker
            .lease(&queues, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("expired lease is redelivered");
        assert_eq!(second.task_id(), id);
        assert_ne!(second.token, abandoned.token);
        assert_eq!(second.envelope.retry_count, 0);

        // The first holder can no longer settle the envelope.
        assert!(matches!(
            broker.ack(&abandoned).await,
            Err(BrokerError::LeaseLost(_))
        ));
        broker.ack(&second).await.unwrap();

        let third = broker.lease(&queues, Duration::from_millis(100)).await.unwrap();
        assert!(third.is_none());
    }

    #[tokio::test]
    async fn test_retry_schedules_with_incremented_count() {
        let broker = MemoryBroker::new();
        broker.enqueue(envelope(TaskOptions::new().max_retry(3))).await.unwrap();
        let queues = lanes(&[QUEUE_DEFAULT]);

        let lease = broker.lease(&queues, Duration::ZERO).await.unwrap().unwrap();
        let retry_at = Utc::now() + chrono::Duration::milliseconds(100);
        broker.retry(&lease, "smtp down", retry_at).await.unwrap();

        let stats = broker.stats(QUEUE_DEFAULT).await.unwrap();
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.in_flight, 0);

        let again = broker
            .lease(&queues, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.envelope.retry_count, 1);
        assert_eq!(again.envelope.last_error.as_deref(), Some("smtp down"));
        assert!(Utc::now() >= retry_at);
    }

    #[tokio::test]
    async fn test_retry_past_budget_dead_letters() {
        let broker = MemoryBroker::new();
        broker.enqueue(envelope(TaskOptions::new().max_retry(0))).await.unwrap();

        let lease = broker
            .lease(&lanes(&[QUEUE_DEFAULT]), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        broker.retry(&lease, "boom", Utc::now()).await.unwrap();

        let stats = broker.stats(QUEUE_DEFAULT).await.unwrap();
        assert_eq!(stats.live(), 0);
        assert_eq!(stats.dead, 1);

        let dead = broker.dead_letters(QUEUE_DEFAULT).await.unwrap();
        assert_eq!(dead[0].envelope.retry_count, 0);
        assert_eq!(dead[0].reason, "boom");
    }

    #[tokio::test]
    async fn test_kill_moves_to_dead_letter() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(envelope(TaskOptions::new())).await.unwrap();

        let lease = broker
            .lease(&lanes(&[QUEUE_DEFAULT]), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        broker.kill(&lease, "no handler").await.unwrap();

        let dead = broker.dead_letters(QUEUE_DEFAULT).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].envelope.id, id);
        assert!(broker
            .lease(&lanes(&[QUEUE_DEFAULT]), Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_lane_order_respected() {
        let broker = MemoryBroker::new();
        broker.enqueue(envelope(TaskOptions::new())).await.unwrap();
        let critical = broker
            .enqueue(envelope(TaskOptions::new().queue(QUEUE_CRITICAL)))
            .await
            .unwrap();

        let lease = broker
            .lease(&lanes(&[QUEUE_CRITICAL, QUEUE_DEFAULT]), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.task_id(), critical);
    }

    #[tokio::test]
    async fn test_unlisted_lane_not_leased() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(envelope(TaskOptions::new().queue(QUEUE_CRITICAL)))
            .await
            .unwrap();

        let lease = broker
            .lease(&lanes(&[QUEUE_DEFAULT]), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(lease.is_none());
    }

    #[tokio::test]
    async fn test_pending_ordered_by_process_at() {
        let broker = MemoryBroker::new();
        let now = Utc::now();
        let later = broker
            .enqueue(envelope(TaskOptions::new().process_at(now - chrono::Duration::seconds(1))))
            .await
            .unwrap();
        let earlier = broker
            .enqueue(envelope(TaskOptions::new().process_at(now - chrono::Duration::seconds(5))))
            .await
            .unwrap();

        let queues = lanes(&[QUEUE_DEFAULT]);
        let first = broker.lease(&queues, Duration::ZERO).await.unwrap().unwrap();
        let second = broker.lease(&queues, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.task_id(), earlier);
        assert_eq!(second.task_id(), later);
    }
}

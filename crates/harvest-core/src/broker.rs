//! In-process broker with the same ack/nack/redelivery semantics as the
//! AMQP broker.
//!
//! Used by the `scrape` CLI command and by tests. Delayed publishes are held
//! by a timer task and become visible when it fires.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::job::Job;
use crate::models::DeadLetter;
use crate::traits::{Broker, Delivery};

#[derive(Debug, Clone)]
struct Message {
    priority: u8,
    seq: u64,
    body: Vec<u8>,
    redelivered: bool,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Message {}

impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Message {
    /// Higher priority first, then FIFO.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A publish as seen by the broker, for inspection in tests.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    pub job_id: String,
    pub retry_count: u32,
    pub delay: Duration,
    pub priority: u8,
}

#[derive(Debug, Default)]
struct BrokerState {
    ready: BinaryHeap<Message>,
    unacked: HashMap<u64, Message>,
    delayed: usize,
    dead_letters: Vec<DeadLetter>,
    rejected: Vec<Vec<u8>>,
    published: Vec<PublishRecord>,
    next_tag: u64,
    next_seq: u64,
    acked: u64,
}

impl BrokerState {
    fn enqueue(&mut self, priority: u8, body: Vec<u8>, redelivered: bool) {
        self.next_seq += 1;
        self.ready.push(Message {
            priority,
            seq: self.next_seq,
            body,
            redelivered,
        });
    }

    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.unacked.is_empty() && self.delayed == 0
    }
}

#[derive(Debug, Default)]
struct MemoryBrokerInner {
    state: Mutex<BrokerState>,
    available: Notify,
    settled: Notify,
    closed: AtomicBool,
}

impl MemoryBrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Recovered from poisoned broker mutex");
            poisoned.into_inner()
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryBrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw body, bypassing job encoding.
    pub fn publish_raw(&self, body: Vec<u8>, priority: u8) {
        self.inner.lock().enqueue(priority.min(9), body, false);
        self.inner.available.notify_one();
    }

    /// Stop handing out deliveries. Pending `receive` calls return `None`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.available.notify_waiters();
    }

    pub fn is_idle(&self) -> bool {
        self.inner.lock().is_idle()
    }

    /// Wait until nothing is ready, unacked or scheduled.
    pub async fn wait_idle(&self) {
        loop {
            let mut settled = pin!(self.inner.settled.notified());
            settled.as_mut().enable();
            if self.is_idle() {
                return;
            }
            settled.await;
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().dead_letters.clone()
    }

    /// Bodies nacked without requeue.
    pub fn rejected(&self) -> Vec<Vec<u8>> {
        self.inner.lock().rejected.clone()
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        self.inner.lock().published.clone()
    }

    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    pub fn unacked_len(&self) -> usize {
        self.inner.lock().unacked.len()
    }

    pub fn acked(&self) -> u64 {
        self.inner.lock().acked
    }

    fn settle(&self) {
        self.inner.settled.notify_waiters();
    }
}

impl Broker for MemoryBroker {
    async fn receive(&self) -> Result<Option<Delivery>, AppError> {
        loop {
            let mut available = pin!(self.inner.available.notified());
            available.as_mut().enable();

            if self.inner.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let delivery = {
                let mut state = self.inner.lock();
                match state.ready.pop() {
                    Some(msg) => {
                        state.next_tag += 1;
                        let tag = state.next_tag;
                        let delivery = Delivery {
                            tag,
                            body: msg.body.clone(),
                            redelivered: msg.redelivered,
                        };
                        state.unacked.insert(tag, msg);
                        Some(delivery)
                    }
                    None => None,
                }
            };
            if let Some(delivery) = delivery {
                return Ok(Some(delivery));
            }

            available.await;
        }
    }

    async fn ack(&self, tag: u64) -> Result<(), AppError> {
        let removed = {
            let mut state = self.inner.lock();
            let removed = state.unacked.remove(&tag);
            if removed.is_some() {
                state.acked += 1;
            }
            removed
        };
        self.settle();
        match removed {
            Some(_) => Ok(()),
            None => Err(AppError::BrokerError(format!("Unknown delivery tag {tag}"))),
        }
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), AppError> {
        let found = {
            let mut state = self.inner.lock();
            match state.unacked.remove(&tag) {
                Some(msg) if requeue => {
                    state.enqueue(msg.priority, msg.body, true);
                    true
                }
                Some(msg) => {
                    state.rejected.push(msg.body);
                    true
                }
                None => false,
            }
        };
        if requeue {
            self.inner.available.notify_one();
        }
        self.settle();
        if found {
            Ok(())
        } else {
            Err(AppError::BrokerError(format!("Unknown delivery tag {tag}")))
        }
    }

    async fn publish(&self, job: &Job, delay: Duration, priority: u8) -> Result<(), AppError> {
        let body = job.to_message()?;
        let priority = priority.min(9);
        {
            let mut state = self.inner.lock();
            state.published.push(PublishRecord {
                job_id: job.id.clone(),
                retry_count: job.retry_count,
                delay,
                priority,
            });
            if delay.is_zero() {
                state.enqueue(priority, body, false);
                drop(state);
                self.inner.available.notify_one();
                return Ok(());
            }
            state.delayed += 1;
        }

        debug!(job_id = %job.id, delay_ms = delay.as_millis() as u64, "Scheduling delayed publish");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = inner.lock();
                state.delayed -= 1;
                state.enqueue(priority, body, false);
            }
            inner.available.notify_one();
            inner.settled.notify_waiters();
        });
        Ok(())
    }

    async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), AppError> {
        self.inner.lock().dead_letters.push(letter.clone());
        self.settle();
        Ok(())
    }

    async fn recover(&self) -> Result<(), AppError> {
        let recovered = {
            let mut state = self.inner.lock();
            let unacked: Vec<Message> = state.unacked.drain().map(|(_, m)| m).collect();
            let count = unacked.len();
            for msg in unacked {
                state.enqueue(msg.priority, msg.body, true);
            }
            count
        };
        if recovered > 0 {
            debug!(recovered, "Requeued unacked deliveries");
            self.inner.available.notify_waiters();
        }
        self.settle();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScrapeError;
    use crate::job::InstitutionType;

    fn job(id: &str) -> Job {
        let mut job = Job::new("https://tech.mit.edu/list", InstitutionType::UsUniversity);
        job.id = id.into();
        job
    }

    async fn next_id(broker: &MemoryBroker) -> (u64, String) {
        let d = broker.receive().await.unwrap().unwrap();
        (d.tag, Job::from_message(&d.body).unwrap().id)
    }

    #[tokio::test]
    async fn test_higher_priority_drains_first() {
        let broker = MemoryBroker::new();
        broker.publish(&job("low"), Duration::ZERO, 1).await.unwrap();
        broker.publish(&job("high"), Duration::ZERO, 9).await.unwrap();
        broker.publish(&job("low-2"), Duration::ZERO, 1).await.unwrap();

        assert_eq!(next_id(&broker).await.1, "high");
        assert_eq!(next_id(&broker).await.1, "low");
        assert_eq!(next_id(&broker).await.1, "low-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_publish_becomes_visible() {
        let broker = MemoryBroker::new();
        broker
            .publish(&job("later"), Duration::from_secs(5), 5)
            .await
            .unwrap();
        assert_eq!(broker.ready_len(), 0);
        assert!(!broker.is_idle());

        let start = tokio::time::Instant::now();
        let (_, id) = next_id(&broker).await;
        assert_eq!(id, "later");
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_ack_and_unknown_tag() {
        let broker = MemoryBroker::new();
        broker.publish(&job("a"), Duration::ZERO, 5).await.unwrap();
        let (tag, _) = next_id(&broker).await;
        assert_eq!(broker.unacked_len(), 1);
        broker.ack(tag).await.unwrap();
        assert!(broker.is_idle());
        assert!(matches!(broker.ack(tag).await, Err(AppError::BrokerError(_))));
    }

    #[tokio::test]
    async fn test_recover_redelivers_unacked() {
        let broker = MemoryBroker::new();
        broker.publish(&job("a"), Duration::ZERO, 5).await.unwrap();
        let first = broker.receive().await.unwrap().unwrap();
        assert!(!first.redelivered);

        broker.recover().await.unwrap();
        let again = broker.receive().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.body, first.body);
        assert_ne!(again.tag, first.tag);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_rejects() {
        let broker = MemoryBroker::new();
        broker.publish(&job("a"), Duration::ZERO, 5).await.unwrap();
        let (tag, _) = next_id(&broker).await;
        broker.nack(tag, false).await.unwrap();
        assert_eq!(broker.rejected().len(), 1);
        assert!(broker.is_idle());
    }

    #[tokio::test]
    async fn test_close_unblocks_receive() {
        let broker = MemoryBroker::new();
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive().await })
        };
        tokio::task::yield_now().await;
        broker.close();
        assert!(waiter.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dead_letters_are_recorded() {
        let broker = MemoryBroker::new();
        let letter = DeadLetter::new(job("x"), ScrapeError::parse("no match"));
        broker.publish_dead_letter(&letter).await.unwrap();
        assert_eq!(broker.dead_letters()[0].job_id(), Some("x"));
    }
}

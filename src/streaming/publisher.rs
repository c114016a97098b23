// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! At-least-once publisher with retry, backoff and a bounded local queue
//!
//! `publish` never waits on the network: records go into a bounded queue and
//! a background task drains it through a [`Transport`], one record in flight
//! at a time. A record leaves the queue only after `deliver` returned `Ok`,
//! which for MQTT means the broker acknowledged the QoS 1 publish. A failure
//! between acknowledgement and removal can cause a duplicate but never a
//! loss (except queue overflow, which drops the oldest record and is counted).
//!
//! The degraded flag clears on the first successful delivery; records still
//! queued behind it drain normally.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{OutboundRecord, PublisherConfig};
use crate::error::{PipelineError, PipelineResult};

/// Downstream channel the publisher delivers to
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand one payload to the channel and wait until it is confirmed.
    /// An error means it may not have been received.
    async fn deliver(&self, topic: &str, payload: &[u8]) -> PipelineResult<()>;
}

struct Queued {
    seq: u64,
    record: OutboundRecord,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Queued>,
    next_seq: u64,
    delivered: u64,
    dropped: u64,
}

struct Shared {
    queue: Mutex<QueueState>,
    notify: Notify,
    degraded: AtomicBool,
}

/// Publisher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherStats {
    pub queued: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub degraded: bool,
}

/// Cloneable handle; all clones feed the same queue
#[derive(Clone)]
pub struct Publisher {
    config: PublisherConfig,
    topic_prefix: String,
    shared: Arc<Shared>,
}

impl Publisher {
    pub fn new(config: PublisherConfig, topic_prefix: &str) -> Self {
        Self {
            config,
            topic_prefix: topic_prefix.to_string(),
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                degraded: AtomicBool::new(false),
            }),
        }
    }

    /// Start the delivery task.
    pub fn spawn(
        &self,
        transport: Arc<dyn Transport>,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let worker = DeliveryWorker {
            config: self.config.clone(),
            topic_prefix: self.topic_prefix.clone(),
            shared: self.shared.clone(),
            transport,
        };
        tokio::spawn(worker.run(shutdown))
    }

    /// Queue a record for delivery without blocking.
    ///
    /// The record is always queued. `Err(DeliveryDegraded)` tells the caller
    /// the channel is currently failing or the queue overflowed.
    pub fn publish(&self, record: OutboundRecord) -> PipelineResult<()> {
        let (queued, dropped, overflowed) = {
            let mut queue = self.shared.queue.lock();
            let overflowed = if queue.items.len() >= self.config.queue_capacity {
                if let Some(oldest) = queue.items.pop_front() {
                    warn!(
                        "Publish queue full, dropping oldest record {}",
                        oldest.record.dedup_key()
                    );
                }
                queue.dropped += 1;
                true
            } else {
                false
            };

            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.items.push_back(Queued { seq, record });
            (queue.items.len(), queue.dropped, overflowed)
        };

        self.shared.notify.notify_one();

        if overflowed {
            self.shared.degraded.store(true, Ordering::SeqCst);
        }
        if overflowed || self.is_degraded() {
            return Err(PipelineError::DeliveryDegraded { queued, dropped });
        }
        Ok(())
    }

    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::SeqCst)
    }

    pub fn backlog(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    /// Wait up to `timeout` for the delivery task to empty the queue.
    /// Returns the records still queued.
    pub async fn flush(&self, timeout: std::time::Duration) -> usize {
        let drained = tokio::time::timeout(timeout, async {
            while self.backlog() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await;
        if drained.is_err() {
            debug!("Flush timed out with {} record(s) queued", self.backlog());
        }
        self.backlog()
    }

    pub fn stats(&self) -> PublisherStats {
        let queue = self.shared.queue.lock();
        PublisherStats {
            queued: queue.items.len(),
            delivered: queue.delivered,
            dropped: queue.dropped,
            degraded: self.is_degraded(),
        }
    }
}

struct DeliveryWorker {
    config: PublisherConfig,
    topic_prefix: String,
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
}

impl DeliveryWorker {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("Publisher delivery task started");

        loop {
            let next = {
                let queue = self.shared.queue.lock();
                queue.items.front().map(|q| (q.seq, q.record.clone()))
            };

            let Some((seq, record)) = next else {
                tokio::select! {
                    _ = self.shared.notify.notified() => {}
                    _ = shutdown.recv() => break,
                }
                continue;
            };

            let payload = match record.encode() {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Dropping unencodable record {}: {}", record.dedup_key(), e);
                    self.remove(seq, false);
                    continue;
                }
            };
            let topic = record.topic(&self.topic_prefix);

            let result = tokio::select! {
                result = self.deliver_with_retry(&topic, &payload) => result,
                _ = shutdown.recv() => break,
            };

            match result {
                Ok(()) => {
                    debug!("Delivered {} to {}", record.dedup_key(), topic);
                    let remaining = self.remove(seq, true);
                    if self.shared.degraded.swap(false, Ordering::SeqCst) {
                        info!("Delivery recovered, {} record(s) still queued", remaining);
                    }
                }
                Err(e) => {
                    if !self.shared.degraded.swap(true, Ordering::SeqCst) {
                        warn!(
                            "Delivery degraded after {} attempts: {}. Queuing locally",
                            self.config.max_attempts, e
                        );
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.degraded_retry()) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }

        let left = self.shared.queue.lock().items.len();
        if left > 0 {
            warn!("Publisher stopping with {} undelivered record(s)", left);
        }
        info!("Publisher delivery task stopped");
    }

    async fn deliver_with_retry(&self, topic: &str, payload: &[u8]) -> PipelineResult<()> {
        let mut backoff = self.config.initial_backoff();
        let mut attempt = 1;

        loop {
            match self.transport.deliver(topic, payload).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.config.max_attempts => return Err(e),
                Err(e) => {
                    debug!("Attempt {} to {} failed: {}, retrying in {:?}", attempt, topic, e, backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_backoff());
                    attempt += 1;
                }
            }
        }
    }

    /// Remove the record if it is still at the head. Returns the records
    /// left behind it.
    fn remove(&self, seq: u64, delivered: bool) -> usize {
        let mut queue = self.shared.queue.lock();
        if queue.items.front().map(|q| q.seq) == Some(seq) {
            queue.items.pop_front();
        }
        if delivered {
            queue.delivered += 1;
        }
        queue.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::SensorReading;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Transport that fails the first `fail_first` attempts, or every attempt
    /// while `down` is set.
    #[derive(Default)]
    struct ScriptedTransport {
        fail_first: AtomicUsize,
        down: AtomicBool,
        attempts: AtomicUsize,
        delivered: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn deliver(&self, topic: &str, payload: &[u8]) -> PipelineResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(PipelineError::Transport("broker unreachable".to_string()));
            }
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(PipelineError::Transport("timeout".to_string()));
            }
            self.delivered.lock().push((topic.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    fn config() -> PublisherConfig {
        PublisherConfig {
            queue_capacity: 8,
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            degraded_retry_ms: 10,
        }
    }

    fn record(minute: i64) -> OutboundRecord {
        let ts = Utc.with_ymd_and_hms(2026, 5, 1, 6, 0, 0).unwrap() + ChronoDuration::minutes(minute);
        OutboundRecord::Reading(SensorReading::new("north", ts, 40.0))
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let transport = Arc::new(ScriptedTransport::default());
        let publisher = Publisher::new(config(), "farm");
        let (_tx, rx) = broadcast::channel(1);
        publisher.spawn(transport.clone(), rx);

        for minute in 0..3 {
            publisher.publish(record(minute)).unwrap();
        }
        wait_for(|| transport.delivered.lock().len() == 3).await;

        let delivered = transport.delivered.lock();
        assert!(delivered.iter().all(|(topic, _)| topic == "farm/north/readings"));
        let first: OutboundRecord = serde_json::from_slice(&delivered[0].1).unwrap();
        assert_eq!(first, record(0));
        let last: OutboundRecord = serde_json::from_slice(&delivered[2].1).unwrap();
        assert_eq!(last, record(2));
        drop(delivered);

        wait_for(|| publisher.backlog() == 0).await;
        assert_eq!(publisher.stats().delivered, 3);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.fail_first.store(2, Ordering::SeqCst);
        let publisher = Publisher::new(config(), "farm");
        let (_tx, rx) = broadcast::channel(1);
        publisher.spawn(transport.clone(), rx);

        publisher.publish(record(0)).unwrap();
        wait_for(|| transport.delivered.lock().len() == 1).await;

        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
        assert!(!publisher.is_degraded());
    }

    #[tokio::test]
    async fn test_sustained_failure_degrades_then_recovers() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.down.store(true, Ordering::SeqCst);
        let publisher = Publisher::new(config(), "farm");
        let (_tx, rx) = broadcast::channel(1);
        publisher.spawn(transport.clone(), rx);

        publisher.publish(record(0)).unwrap();
        wait_for(|| publisher.is_degraded()).await;

        // still accepted locally, but the caller hears about it
        match publisher.publish(record(1)) {
            Err(PipelineError::DeliveryDegraded { queued, dropped }) => {
                assert_eq!(queued, 2);
                assert_eq!(dropped, 0);
            }
            other => panic!("expected degraded, got {:?}", other),
        }

        transport.down.store(false, Ordering::SeqCst);
        wait_for(|| !publisher.is_degraded()).await;
        wait_for(|| publisher.backlog() == 0).await;

        let delivered = transport.delivered.lock();
        assert_eq!(delivered.len(), 2);
        let first: OutboundRecord = serde_json::from_slice(&delivered[0].1).unwrap();
        assert_eq!(first, record(0));
    }

    /// Transport that accepts one record, then stalls until released
    #[derive(Default)]
    struct GatedTransport {
        released: AtomicBool,
        delivered: AtomicUsize,
        gate: Notify,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn deliver(&self, _topic: &str, _payload: &[u8]) -> PipelineResult<()> {
            if self.delivered.load(Ordering::SeqCst) >= 1 && !self.released.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_first_success_clears_degraded_before_backlog_drains() {
        let mut cfg = config();
        cfg.queue_capacity = 2;
        let publisher = Publisher::new(cfg, "farm");

        // overflow while no delivery task runs
        for minute in 0..3 {
            let _ = publisher.publish(record(minute));
        }
        assert!(publisher.is_degraded());

        let transport = Arc::new(GatedTransport::default());
        let (_tx, rx) = broadcast::channel(1);
        publisher.spawn(transport.clone(), rx);

        // one delivered, the next is stuck in flight: already recovered
        wait_for(|| transport.delivered.load(Ordering::SeqCst) == 1).await;
        wait_for(|| !publisher.is_degraded()).await;
        assert_eq!(publisher.backlog(), 1);
        assert!(publisher.publish(record(3)).is_ok());

        transport.released.store(true, Ordering::SeqCst);
        transport.gate.notify_one();
        assert_eq!(publisher.flush(Duration::from_secs(5)).await, 0);
        assert_eq!(publisher.stats().delivered, 3);
    }

    #[test]
    fn test_bounded_queue_drops_oldest() {
        let mut cfg = config();
        cfg.queue_capacity = 2;
        let publisher = Publisher::new(cfg, "farm");

        publisher.publish(record(0)).unwrap();
        publisher.publish(record(1)).unwrap();
        let err = publisher.publish(record(2)).unwrap_err();
        assert!(matches!(err, PipelineError::DeliveryDegraded { queued: 2, dropped: 1 }));

        let stats = publisher.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.dropped, 1);
        assert!(stats.degraded);

        let head = publisher.shared.queue.lock().items.front().map(|q| q.record.clone());
        assert_eq!(head, Some(record(1)));
    }
}

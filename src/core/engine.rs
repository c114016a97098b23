// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Pipeline engine - routes readings to one worker task per field

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{InvalidReason, PipelineError, PipelineResult};
use crate::monitor::Alert;
use crate::sensors::SensorReading;
use crate::streaming::{Deduplicator, OutboundRecord, Publisher};
use crate::valve::ValveCommand;
use super::pipeline::{FieldOutcome, FieldPipeline};
use super::{EventBus, FieldSnapshot, PipelineStats};

const FIELD_QUEUE_DEPTH: usize = 64;
const INGEST_DEDUP_CAPACITY: usize = 4096;

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    decisions: AtomicU64,
    alerts: AtomicU64,
    valve_commands: AtomicU64,
}

/// A reading stamped with the gateway clock at ingest
struct Received {
    reading: SensorReading,
    at: DateTime<Utc>,
}

struct FieldHandle {
    tx: mpsc::Sender<Received>,
    snapshot: watch::Receiver<FieldSnapshot>,
    task: JoinHandle<()>,
}

/// Shared by every field worker
#[derive(Clone)]
struct WorkerContext {
    config: Arc<Config>,
    event_bus: Arc<EventBus>,
    publisher: Publisher,
    history: Option<mpsc::Sender<OutboundRecord>>,
    counters: Arc<Counters>,
}

/// Main AgroWatch engine
pub struct Engine {
    config: Arc<Config>,
    event_bus: Arc<EventBus>,
    publisher: Publisher,
    history: Mutex<Option<mpsc::Sender<OutboundRecord>>>,
    fields: RwLock<HashMap<String, FieldHandle>>,
    dedup: Mutex<Deduplicator>,
    counters: Arc<Counters>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    start_time: Instant,
}

impl Engine {
    pub fn new(config: Arc<Config>, event_bus: Arc<EventBus>, publisher: Publisher) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            event_bus,
            publisher,
            history: Mutex::new(None),
            fields: RwLock::new(HashMap::new()),
            dedup: Mutex::new(Deduplicator::new(INGEST_DEDUP_CAPACITY)),
            counters: Arc::new(Counters::default()),
            running: AtomicBool::new(false),
            shutdown_tx,
            start_time: Instant::now(),
        }
    }

    /// Copy every outbound record to a history writer. Workers wait when it
    /// falls behind. The sender is released by [`Engine::stop`].
    pub fn with_history(self, history: mpsc::Sender<OutboundRecord>) -> Self {
        *self.history.lock() = Some(history);
        self
    }

    pub fn start(&self) {
        info!("Starting AgroWatch engine...");
        self.running.store(true, Ordering::SeqCst);
        self.event_bus.publish_status("engine", "running");
    }

    /// Stop every field worker and wait for them to finish. Open valves are
    /// closed on the way out.
    pub async fn stop(&self) {
        info!("Stopping AgroWatch engine...");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = self
            .fields
            .write()
            .drain()
            .map(|(_, handle)| handle.task)
            .collect();

        for task in tasks {
            if let Err(e) = task.await {
                warn!("Field worker ended abnormally: {}", e);
            }
        }

        // workers held the other clones; the history writer can finish now
        self.history.lock().take();

        self.event_bus.publish_status("engine", "stopped");
        info!("AgroWatch engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Hand a reading to its field worker. Redelivered readings stop here.
    pub async fn ingest(&self, reading: SensorReading) -> PipelineResult<()> {
        if !self.is_running() {
            return Err(PipelineError::NotRunning);
        }
        if reading.field_id.trim().is_empty() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PipelineError::invalid("", InvalidReason::EmptyFieldId));
        }

        let key = format!("{}|{}", reading.field_id, reading.timestamp.timestamp_micros());
        let fresh = self.dedup.lock().insert(key);
        if !fresh {
            debug!("Dropping redelivered reading for {} at {}", reading.field_id, reading.timestamp);
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let field_id = reading.field_id.clone();
        let tx = self.field_sender(&field_id);

        tx.send(Received { reading, at: Utc::now() })
            .await
            .map_err(|_| PipelineError::Transport(format!("worker for field '{}' has stopped", field_id)))
    }

    fn field_sender(&self, field_id: &str) -> mpsc::Sender<Received> {
        if let Some(handle) = self.fields.read().get(field_id) {
            return handle.tx.clone();
        }

        let mut fields = self.fields.write();
        // another ingest may have won the race
        if let Some(handle) = fields.get(field_id) {
            return handle.tx.clone();
        }

        let handle = self.spawn_field(field_id);
        let tx = handle.tx.clone();
        fields.insert(field_id.to_string(), handle);
        tx
    }

    fn spawn_field(&self, field_id: &str) -> FieldHandle {
        info!("Field '{}' seen for the first time, starting worker", field_id);

        let pipeline = FieldPipeline::new(field_id, &self.config);
        let (tx, rx) = mpsc::channel(FIELD_QUEUE_DEPTH);
        let (snapshot_tx, snapshot) = watch::channel(pipeline.snapshot());

        let ctx = WorkerContext {
            config: self.config.clone(),
            event_bus: self.event_bus.clone(),
            publisher: self.publisher.clone(),
            history: self.history.lock().clone(),
            counters: self.counters.clone(),
        };
        let shutdown = self.shutdown_tx.subscribe();

        let task = tokio::spawn(run_field(pipeline, rx, snapshot_tx, ctx, shutdown));

        FieldHandle { tx, snapshot, task }
    }

    pub fn snapshot(&self, field_id: &str) -> Option<FieldSnapshot> {
        self.fields
            .read()
            .get(field_id)
            .map(|handle| handle.snapshot.borrow().clone())
    }

    /// Snapshots of every known field, ordered by field id
    pub fn snapshots(&self) -> Vec<FieldSnapshot> {
        let mut snapshots: Vec<FieldSnapshot> = self
            .fields
            .read()
            .values()
            .map(|handle| handle.snapshot.borrow().clone())
            .collect();
        snapshots.sort_by(|a, b| a.field_id.cmp(&b.field_id));
        snapshots
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            running: self.is_running(),
            fields: self.fields.read().len(),
            readings_accepted: self.counters.accepted.load(Ordering::Relaxed),
            readings_rejected: self.counters.rejected.load(Ordering::Relaxed),
            duplicates_dropped: self.counters.duplicates.load(Ordering::Relaxed),
            decisions: self.counters.decisions.load(Ordering::Relaxed),
            alerts: self.counters.alerts.load(Ordering::Relaxed),
            valve_commands: self.counters.valve_commands.load(Ordering::Relaxed),
            uptime_seconds: self.uptime(),
            publisher: self.publisher.stats(),
        }
    }

    pub fn uptime(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

async fn run_field(
    mut pipeline: FieldPipeline,
    mut rx: mpsc::Receiver<Received>,
    snapshot_tx: watch::Sender<FieldSnapshot>,
    ctx: WorkerContext,
    mut shutdown: broadcast::Receiver<()>,
) {
    let period = ctx.config.monitor.offline_check_interval();
    let mut heartbeat = interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut delivery = DeliveryLog::default();

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(received) = received else { break };
                ctx.handle_reading(&mut pipeline, received, &mut delivery).await;
            }
            _ = heartbeat.tick() => {
                let now = Utc::now();
                for alert in pipeline.check_offline(now) {
                    ctx.emit_alert(alert, &mut delivery).await;
                }
                if let Some(command) = pipeline.check_valve(now) {
                    ctx.emit_valve(command, &mut delivery).await;
                }
            }
            _ = shutdown.recv() => break,
        }

        snapshot_tx.send_replace(pipeline.snapshot());
    }

    if let Some(command) = pipeline.shutdown(Utc::now()) {
        ctx.emit_valve(command, &mut delivery).await;
        snapshot_tx.send_replace(pipeline.snapshot());
    }
    debug!("Field worker for '{}' stopped", pipeline.field_id());
}

/// Tracks whether the degraded warning was already logged
#[derive(Default)]
struct DeliveryLog {
    degraded: bool,
}

impl WorkerContext {
    async fn handle_reading(&self, pipeline: &mut FieldPipeline, received: Received, delivery: &mut DeliveryLog) {
        let field_id = received.reading.field_id.clone();

        match pipeline.process(received.reading, received.at) {
            Ok(Some(outcome)) => self.emit_outcome(outcome, delivery).await,
            Ok(None) => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Discarding reading: {}", e);
                self.event_bus.publish_error(Some(&field_id), &e.to_string());
            }
        }
    }

    async fn emit_outcome(&self, outcome: FieldOutcome, delivery: &mut DeliveryLog) {
        let FieldOutcome { reading, decision, alerts, valve } = outcome;
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        if self.config.streaming.publish_readings {
            self.deliver(OutboundRecord::Reading(reading.clone()), delivery).await;
        } else {
            self.record(OutboundRecord::Reading(reading.clone())).await;
        }
        self.event_bus.publish_reading(reading);

        if decision.is_irrigate() {
            info!(
                "Irrigate {} for {}s (rolling average {:.1}%)",
                decision.field_id,
                decision.duration_secs.unwrap_or_default(),
                decision.rolling_avg_moisture_pct
            );
        }
        self.counters.decisions.fetch_add(1, Ordering::Relaxed);
        self.deliver(OutboundRecord::Decision(decision.clone()), delivery).await;
        self.event_bus.publish_decision(decision);

        for alert in alerts {
            self.emit_alert(alert, delivery).await;
        }
        if let Some(command) = valve {
            self.emit_valve(command, delivery).await;
        }
    }

    async fn emit_alert(&self, alert: Alert, delivery: &mut DeliveryLog) {
        info!("Alert {:?} on {}: {}", alert.kind, alert.field_id, alert.payload.message);
        self.counters.alerts.fetch_add(1, Ordering::Relaxed);
        self.deliver(OutboundRecord::Alert(alert.clone()), delivery).await;
        self.event_bus.publish_alert(alert);
    }

    async fn emit_valve(&self, command: ValveCommand, delivery: &mut DeliveryLog) {
        self.counters.valve_commands.fetch_add(1, Ordering::Relaxed);
        self.deliver(OutboundRecord::Valve(command.clone()), delivery).await;
        self.event_bus.publish_valve(command);
    }

    async fn deliver(&self, record: OutboundRecord, delivery: &mut DeliveryLog) {
        self.record(record.clone()).await;

        match self.publisher.publish(record) {
            Ok(()) => delivery.degraded = false,
            Err(e @ PipelineError::DeliveryDegraded { .. }) => {
                if !delivery.degraded {
                    warn!("{}", e);
                    self.event_bus.publish_status("publisher", "degraded");
                }
                delivery.degraded = true;
            }
            Err(e) => warn!("Could not queue outbound record: {}", e),
        }
    }

    /// Hand the record to the history writer, waiting for room if needed
    async fn record(&self, record: OutboundRecord) {
        if let Some(history) = &self.history {
            if history.send(record).await.is_err() {
                debug!("History writer has stopped");
            }
        }
    }
}

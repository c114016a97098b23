// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Core engine module - orchestrates the per-field pipelines

mod engine;
mod event_bus;
mod pipeline;
mod recorder;

pub use engine::Engine;
pub use event_bus::{EventBus, Event, EventPayload, EventType};
pub use pipeline::{FieldOutcome, FieldPipeline};
pub use recorder::{Recorder, HISTORY_QUEUE_DEPTH};

use crate::decision::Decision;
use crate::monitor::{AlertKind, MonitorState};
use crate::sensors::SensorReading;
use crate::streaming::PublisherStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Read-only view of one field, refreshed after every worker step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub field_id: String,
    pub monitor_state: MonitorState,
    pub rolling_avg_moisture_pct: Option<f64>,
    /// Driest reading still in the window
    pub min_moisture_pct: Option<f64>,
    pub readings_in_window: usize,
    /// Newest sensor timestamp accepted
    pub last_seen: Option<DateTime<Utc>>,
    /// Gateway time the newest reading arrived
    pub last_received: Option<DateTime<Utc>>,
    pub valve_open: bool,
    pub latest_reading: Option<SensorReading>,
    pub last_decision: Option<Decision>,
    pub active_alerts: Vec<AlertKind>,
    pub readings_accepted: u64,
    pub readings_rejected: u64,
}

/// System-wide counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub running: bool,
    pub fields: usize,
    pub readings_accepted: u64,
    pub readings_rejected: u64,
    pub duplicates_dropped: u64,
    pub decisions: u64,
    pub alerts: u64,
    pub valve_commands: u64,
    pub uptime_seconds: u64,
    pub publisher: PublisherStats,
}

// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Event bus for inter-component communication

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::decision::Decision;
use crate::monitor::Alert;
use crate::sensors::SensorReading;
use crate::valve::ValveCommand;

/// Event types in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    SensorReading,
    Decision,
    Alert,
    Valve,
    SystemStatus,
    Error,
}

/// Generic event wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Reading(SensorReading),
    Decision(Decision),
    Alert(Alert),
    Valve(ValveCommand),
    Status { key: String, value: String },
    Error { field_id: Option<String>, message: String },
}

/// Central event bus for pub/sub communication
pub struct EventBus {
    event_tx: broadcast::Sender<Event>,
    alert_tx: broadcast::Sender<Alert>,
    event_counter: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        let (alert_tx, _) = broadcast::channel(capacity);

        Self {
            event_tx,
            alert_tx,
            event_counter: AtomicU64::new(0),
        }
    }

    pub fn publish_reading(&self, reading: SensorReading) {
        self.publish_event(EventType::SensorReading, EventPayload::Reading(reading));
    }

    pub fn publish_decision(&self, decision: Decision) {
        self.publish_event(EventType::Decision, EventPayload::Decision(decision));
    }

    pub fn publish_alert(&self, alert: Alert) {
        let _ = self.alert_tx.send(alert.clone());
        self.publish_event(EventType::Alert, EventPayload::Alert(alert));
    }

    pub fn publish_valve(&self, command: ValveCommand) {
        self.publish_event(EventType::Valve, EventPayload::Valve(command));
    }

    pub fn publish_status(&self, key: &str, value: &str) {
        self.publish_event(
            EventType::SystemStatus,
            EventPayload::Status {
                key: key.to_string(),
                value: value.to_string(),
            },
        );
    }

    pub fn publish_error(&self, field_id: Option<&str>, message: &str) {
        self.publish_event(
            EventType::Error,
            EventPayload::Error {
                field_id: field_id.map(str::to_string),
                message: message.to_string(),
            },
        );
    }

    fn publish_event(&self, event_type: EventType, payload: EventPayload) {
        let id = self.event_counter.fetch_add(1, Ordering::Relaxed);
        let event = Event {
            id,
            event_type,
            timestamp: Utc::now(),
            payload,
        };
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alert_tx.subscribe()
    }

    /// Number of events published so far
    pub fn event_count(&self) -> u64 {
        self.event_counter.load(Ordering::Relaxed)
    }
}

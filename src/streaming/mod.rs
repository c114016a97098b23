// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Streaming module - MQTT transport, at-least-once publisher, deduplication

mod mqtt;
mod publisher;
mod dedup;

pub use mqtt::*;
pub use publisher::*;
pub use dedup::Deduplicator;

use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::Decision;
use crate::error::PipelineResult;
use crate::monitor::Alert;
use crate::sensors::SensorReading;
use crate::valve::ValveCommand;

/// MQTT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Enable MQTT
    pub mqtt_enabled: bool,
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub keep_alive_secs: u64,

    /// How long a QoS 1 publish may wait for the broker's PUBACK
    pub ack_timeout_secs: u64,

    /// First topic level, `farm` gives `farm/<field>/sensors`
    pub topic_prefix: String,

    /// Forward accepted readings downstream as well as decisions and alerts
    pub publish_readings: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            mqtt_enabled: false,
            mqtt_broker: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_client_id: "agrowatch".to_string(),
            mqtt_username: None,
            mqtt_password: None,
            keep_alive_secs: 60,
            ack_timeout_secs: 10,
            topic_prefix: "farm".to_string(),
            publish_readings: true,
        }
    }
}

impl StreamingConfig {
    /// Wildcard subscription for all field sensor topics
    pub fn sensor_subscription(&self) -> String {
        format!("{}/+/sensors", self.topic_prefix)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs.max(1))
    }
}

/// Outbound delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Records held locally while the channel is unavailable
    pub queue_capacity: usize,

    /// Delivery attempts per record before the publisher degrades
    pub max_attempts: u32,

    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,

    /// Pause between retry rounds while degraded
    pub degraded_retry_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 8_000,
            degraded_retry_ms: 30_000,
        }
    }
}

impl PublisherConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn degraded_retry(&self) -> Duration {
        Duration::from_millis(self.degraded_retry_ms)
    }
}

/// A record sent downstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundRecord {
    Reading(SensorReading),
    Decision(Decision),
    Alert(Alert),
    Valve(ValveCommand),
}

impl OutboundRecord {
    pub fn field_id(&self) -> &str {
        match self {
            Self::Reading(r) => &r.field_id,
            Self::Decision(d) => &d.field_id,
            Self::Alert(a) => &a.field_id,
            Self::Valve(v) => &v.field_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Reading(r) => r.timestamp,
            Self::Decision(d) => d.timestamp,
            Self::Alert(a) => a.timestamp,
            Self::Valve(v) => v.timestamp,
        }
    }

    /// Topic under `prefix`, e.g. `farm/north/decisions`
    pub fn topic(&self, prefix: &str) -> String {
        let leaf = match self {
            Self::Reading(_) => "readings",
            Self::Decision(_) => "decisions",
            Self::Alert(_) => "alerts",
            Self::Valve(_) => "actuators/valve",
        };
        format!("{}/{}/{}", prefix, self.field_id(), leaf)
    }

    /// Consumers deduplicate on this key: field, timestamp and record kind.
    pub fn dedup_key(&self) -> String {
        match self {
            Self::Reading(r) => format!("{}|{}|reading", r.field_id, r.timestamp.to_rfc3339()),
            Self::Decision(d) => format!("{}|{}|decision", d.field_id, d.timestamp.to_rfc3339()),
            Self::Alert(a) => format!("alert|{}", a.dedup_key()),
            Self::Valve(v) => format!(
                "{}|{}|valve|{:?}",
                v.field_id,
                v.timestamp.to_rfc3339(),
                v.command
            ),
        }
    }

    /// Wire payload
    pub fn encode(&self) -> PipelineResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

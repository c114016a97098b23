// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! AgroWatch - edge pipeline for field soil sensors
//!
//! Ingests soil and weather readings per field, keeps a short rolling window
//! of recent readings, decides whether each field needs irrigation, raises
//! alerts for dry or silent fields and forwards everything upstream:
//! - Bounded per-field reading windows with rolling-average moisture
//! - Threshold irrigation rules with a rain override
//! - Per-field alert state machine (Normal / Alerting / Offline)
//! - Valve open/close commands with run limits and a cooldown
//! - At-least-once MQTT publishing, confirmed by PUBACK, with a bounded backlog
//! - SQLite history of readings, decisions, alerts and valve commands
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       AgroWatch Engine                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │ MQTT ingress ┐                                               │
//! │ Sensors ─────┴→ ingest → [field worker: Buffer → Decision    │
//! │                            → Monitor → Valve] (per field)    │
//! │          ↓                   ↓                    ↓          │
//! │ ┌─────────────────┐ ┌──────────────────┐ ┌───────────────┐   │
//! │ │    Event Bus    │ │ Recorder (mpsc)  │ │   Publisher   │   │
//! │ └─────────────────┘ │   → SQLite       │ │ (queue+retry) │   │
//! │                     └──────────────────┘ └───────────────┘   │
//! │                                                  ↓           │
//! │                                            MQTT egress       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod buffer;
pub mod config;
pub mod core;
pub mod db;
pub mod decision;
pub mod error;
pub mod monitor;
pub mod sensors;
pub mod streaming;
pub mod valve;

// Re-exports for convenience
pub use buffer::{FieldState, ReadingBuffer};
pub use config::Config;
pub use core::{Engine, EventBus, FieldSnapshot, PipelineStats, Recorder};
pub use db::Database;
pub use decision::{Action, Decision, DecisionEngine};
pub use error::{PipelineError, PipelineResult};
pub use monitor::{Alert, AlertKind, FieldMonitor, MonitorState};
pub use sensors::{SensorManager, SensorReading};
pub use streaming::{MqttClient, OutboundRecord, Publisher};
pub use valve::{ValveCommand, ValveController};

/// AgroWatch version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// AgroWatch name
pub const NAME: &str = "AgroWatch";

/// Build info
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: VERSION.to_string(),
        rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
        target: std::env::consts::ARCH.to_string(),
        os: std::env::consts::OS.to_string(),
    }
}

/// Build information
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Version string
    pub version: String,
    /// Minimum supported Rust version
    pub rust_version: String,
    /// Target architecture
    pub target: String,
    /// Operating system
    pub os: String,
}

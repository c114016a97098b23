// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Pipeline error types

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by the ingestion, decision and delivery pipeline.
///
/// None of these are fatal: every variant is scoped to a single field or a
/// single record and the pipeline keeps running. `NotRunning` is the one
/// exception, raised for input handed over before start or after stop.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid reading for field '{field_id}': {reason}")]
    InvalidReading {
        field_id: String,
        reason: InvalidReason,
    },

    #[error("Delivery degraded: {queued} record(s) queued locally, {dropped} dropped")]
    DeliveryDegraded { queued: usize, dropped: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed payload on '{topic}': {source}")]
    Decode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unexpected topic '{0}'")]
    UnknownTopic(String),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine is not running")]
    NotRunning,
}

/// Why a reading was rejected by the reading buffer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidReason {
    #[error("soil moisture {0}% outside 0-100")]
    MoistureOutOfRange(f64),

    #[error("air humidity {0}% outside 0-100")]
    HumidityOutOfRange(f64),

    #[error("{0} is not a finite number")]
    NonFinite(&'static str),

    #[error("timestamp {timestamp} is older than last seen {last_seen}")]
    Stale {
        timestamp: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    },

    #[error("reading belongs to field '{0}'")]
    WrongField(String),

    #[error("empty field id")]
    EmptyFieldId,
}

impl PipelineError {
    pub fn invalid(field_id: &str, reason: InvalidReason) -> Self {
        Self::InvalidReading {
            field_id: field_id.to_string(),
            reason,
        }
    }

    /// True for errors that only affect the record at hand.
    pub fn is_record_scoped(&self) -> bool {
        matches!(
            self,
            Self::InvalidReading { .. }
                | Self::Decode { .. }
                | Self::UnknownTopic(_)
                | Self::Encode(_)
        )
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

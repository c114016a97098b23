// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Reading buffer - per-field rolling window of recent readings

use std::collections::VecDeque;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{InvalidReason, PipelineError, PipelineResult};
use crate::sensors::SensorReading;

/// Recent history of one field.
///
/// Only [`ReadingBuffer::append`] mutates it; everything else gets a shared
/// reference.
#[derive(Debug, Clone)]
pub struct FieldState {
    pub field_id: String,
    window: VecDeque<SensorReading>,
    capacity: usize,
    pub last_seen: Option<DateTime<Utc>>,
}

impl FieldState {
    fn new(field_id: &str, capacity: usize) -> Self {
        Self {
            field_id: field_id.to_string(),
            window: VecDeque::with_capacity(capacity),
            capacity,
            last_seen: None,
        }
    }

    /// Most recent reading, if any
    pub fn latest(&self) -> Option<&SensorReading> {
        self.window.back()
    }

    /// Readings oldest first
    pub fn readings(&self) -> impl Iterator<Item = &SensorReading> {
        self.window.iter()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mean soil moisture over the window
    pub fn rolling_avg_moisture(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let sum: f64 = self.window.iter().map(|r| r.soil_moisture_pct).sum();
        Some(sum / self.window.len() as f64)
    }

    pub fn min_moisture(&self) -> Option<f64> {
        self.window
            .iter()
            .map(|r| r.soil_moisture_pct)
            .fold(None, |acc, m| Some(acc.map_or(m, |a: f64| a.min(m))))
    }
}

/// Outcome of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// Reading stored; oldest one evicted if the window was full
    New { evicted: bool },
    /// Same timestamp as the last stored reading, ignored
    Duplicate,
}

/// Fixed-capacity reading window for one field
#[derive(Debug, Clone)]
pub struct ReadingBuffer {
    state: FieldState,
}

impl ReadingBuffer {
    pub fn new(field_id: &str, capacity: usize) -> Self {
        Self {
            state: FieldState::new(field_id, capacity.max(1)),
        }
    }

    pub fn field_id(&self) -> &str {
        &self.state.field_id
    }

    pub fn state(&self) -> &FieldState {
        &self.state
    }

    /// Validate and append a reading.
    ///
    /// Readings older than the last one seen are rejected; a redelivery with
    /// the exact last timestamp is reported as [`Appended::Duplicate`].
    pub fn append(&mut self, reading: SensorReading) -> PipelineResult<Appended> {
        reading.validate()?;

        if reading.field_id != self.state.field_id {
            return Err(PipelineError::invalid(
                &self.state.field_id,
                InvalidReason::WrongField(reading.field_id),
            ));
        }

        if let Some(last_seen) = self.state.last_seen {
            if reading.timestamp < last_seen {
                return Err(PipelineError::invalid(
                    &self.state.field_id,
                    InvalidReason::Stale {
                        timestamp: reading.timestamp,
                        last_seen,
                    },
                ));
            }
            if reading.timestamp == last_seen {
                debug!("Duplicate reading for {} at {}", self.state.field_id, last_seen);
                return Ok(Appended::Duplicate);
            }
        }

        let evicted = if self.state.window.len() >= self.state.capacity {
            self.state.window.pop_front();
            true
        } else {
            false
        };

        self.state.last_seen = Some(reading.timestamp);
        self.state.window.push_back(reading);

        Ok(Appended::New { evicted })
    }

    pub fn rolling_avg_moisture(&self) -> Option<f64> {
        self.state.rolling_avg_moisture()
    }
}

// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Per-field pipeline: buffer, decide, monitor, valve - strictly in that order

use chrono::{DateTime, Utc};

use crate::buffer::{Appended, ReadingBuffer};
use crate::config::Config;
use crate::decision::{Decision, DecisionEngine};
use crate::error::PipelineResult;
use crate::monitor::{Alert, FieldMonitor};
use crate::sensors::SensorReading;
use crate::valve::{ValveCommand, ValveController};
use super::FieldSnapshot;

/// Everything produced by one accepted reading
#[derive(Debug, Clone)]
pub struct FieldOutcome {
    pub reading: SensorReading,
    pub decision: Decision,
    pub alerts: Vec<Alert>,
    pub valve: Option<ValveCommand>,
}

/// Single-writer state of one field
pub struct FieldPipeline {
    buffer: ReadingBuffer,
    decisions: DecisionEngine,
    monitor: FieldMonitor,
    valve: ValveController,
    last_decision: Option<Decision>,
    accepted: u64,
    rejected: u64,
}

impl FieldPipeline {
    pub fn new(field_id: &str, config: &Config) -> Self {
        Self {
            buffer: ReadingBuffer::new(field_id, config.buffer.window_capacity),
            decisions: DecisionEngine::new(config.rules.clone()),
            monitor: FieldMonitor::new(field_id, config.monitor.clone()),
            valve: ValveController::new(field_id, config.valve.clone(), &config.rules),
            last_decision: None,
            accepted: 0,
            rejected: 0,
        }
    }

    pub fn field_id(&self) -> &str {
        self.buffer.field_id()
    }

    /// Ingest one reading that arrived at `received_at` on the gateway
    /// clock. `Ok(None)` for a redelivered reading.
    pub fn process(
        &mut self,
        reading: SensorReading,
        received_at: DateTime<Utc>,
    ) -> PipelineResult<Option<FieldOutcome>> {
        match self.buffer.append(reading) {
            Ok(Appended::Duplicate) => return Ok(None),
            Ok(Appended::New { .. }) => self.accepted += 1,
            Err(e) => {
                self.rejected += 1;
                return Err(e);
            }
        }

        let state = self.buffer.state();
        let (Some(reading), Some(decision)) = (state.latest().cloned(), self.decisions.evaluate(state)) else {
            return Ok(None);
        };

        let alerts = self.monitor.observe(&reading, &decision, received_at);
        let valve = self.valve.observe(&reading, &decision, received_at);
        self.last_decision = Some(decision.clone());

        Ok(Some(FieldOutcome {
            reading,
            decision,
            alerts,
            valve,
        }))
    }

    /// Heartbeat check against the given clock
    pub fn check_offline(&mut self, now: DateTime<Utc>) -> Vec<Alert> {
        self.monitor.check_offline(now)
    }

    /// Close a valve left open past the maximum run
    pub fn check_valve(&mut self, now: DateTime<Utc>) -> Option<ValveCommand> {
        self.valve.check_timeout(now)
    }

    /// Close the valve before the worker exits
    pub fn shutdown(&mut self, now: DateTime<Utc>) -> Option<ValveCommand> {
        self.valve.shutdown(now)
    }

    pub fn snapshot(&self) -> FieldSnapshot {
        let state = self.buffer.state();
        FieldSnapshot {
            field_id: state.field_id.clone(),
            monitor_state: self.monitor.state(),
            rolling_avg_moisture_pct: state.rolling_avg_moisture(),
            min_moisture_pct: state.min_moisture(),
            readings_in_window: state.len(),
            last_seen: state.last_seen,
            last_received: self.monitor.last_received(),
            valve_open: self.valve.is_open(),
            latest_reading: state.latest().cloned(),
            last_decision: self.last_decision.clone(),
            active_alerts: self.monitor.active_alerts(),
            readings_accepted: self.accepted,
            readings_rejected: self.rejected,
        }
    }
}

// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Decision module - irrigation rules evaluated against buffered field state

use std::time::Instant;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::buffer::FieldState;
use crate::config::RuleConfig;

/// What the field should do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Irrigate,
    Hold,
}

/// Why the action was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionReason {
    /// Rolling average moisture under the irrigation threshold
    BelowThreshold,
    /// Moisture at or above the threshold
    MoistureAdequate,
    /// Would irrigate, but the latest reading reports rain
    RainOverride,
}

/// Irrigation decision for a field at the time of one reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub field_id: String,
    /// Timestamp of the reading that triggered the evaluation
    pub timestamp: DateTime<Utc>,
    pub action: Action,
    pub reason: DecisionReason,
    pub rolling_avg_moisture_pct: f64,
    /// Recommended watering time, only set for Irrigate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

impl Decision {
    pub fn is_irrigate(&self) -> bool {
        self.action == Action::Irrigate
    }
}

/// Stateless rule evaluator
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    rules: RuleConfig,
}

impl DecisionEngine {
    pub fn new(rules: RuleConfig) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleConfig {
        &self.rules
    }

    /// Evaluate the current field state. `None` when nothing is buffered.
    ///
    /// The rain flag is taken from the newest reading in the window at call
    /// time, never from an earlier evaluation.
    pub fn evaluate(&self, state: &FieldState) -> Option<Decision> {
        let started = Instant::now();

        let latest = state.latest()?;
        let avg = state.rolling_avg_moisture()?;

        let (action, reason) = if avg < self.rules.irrigate_below_pct {
            if latest.rain_detected {
                (Action::Hold, DecisionReason::RainOverride)
            } else {
                (Action::Irrigate, DecisionReason::BelowThreshold)
            }
        } else {
            (Action::Hold, DecisionReason::MoistureAdequate)
        };

        let duration_secs = match action {
            Action::Irrigate => Some(self.irrigation_duration(latest.soil_moisture_pct)),
            Action::Hold => None,
        };

        let decision = Decision {
            field_id: state.field_id.clone(),
            timestamp: latest.timestamp,
            action,
            reason,
            rolling_avg_moisture_pct: avg,
            duration_secs,
        };

        let elapsed = started.elapsed();
        if elapsed > self.rules.decision_budget() {
            warn!(
                "Decision for {} took {:?}, over the {:?} budget",
                state.field_id,
                elapsed,
                self.rules.decision_budget()
            );
        }
        debug!(
            "Decision for {}: {:?} ({:?}, avg {:.1}%)",
            state.field_id, action, reason, avg
        );

        Some(decision)
    }

    /// Watering time proportional to the deficit below target, clamped.
    pub fn irrigation_duration(&self, current_moisture_pct: f64) -> u64 {
        let deficit = (self.rules.target_moisture_pct - current_moisture_pct).max(0.0);
        let secs = (deficit * self.rules.secs_per_deficit_pct) as u64;
        secs.clamp(self.rules.min_duration_secs, self.rules.max_duration_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ReadingBuffer;
    use crate::sensors::SensorReading;
    use chrono::Duration;

    fn at(minute: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-05-01T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::minutes(minute)
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(RuleConfig::default())
    }

    #[test]
    fn test_empty_state_has_no_decision() {
        let buffer = ReadingBuffer::new("north", 5);
        assert!(engine().evaluate(buffer.state()).is_none());
    }

    #[test]
    fn test_drying_sequence_starts_irrigating_below_threshold() {
        let engine = engine();
        let mut buffer = ReadingBuffer::new("north", 5);
        let mut actions = Vec::new();

        for (i, moisture) in [30.0, 28.0, 25.0, 20.0, 18.0].into_iter().enumerate() {
            buffer
                .append(SensorReading::new("north", at(i as i64 * 5), moisture))
                .unwrap();
            let decision = engine.evaluate(buffer.state()).unwrap();
            let below = buffer.rolling_avg_moisture().unwrap() < 30.0;
            assert_eq!(decision.is_irrigate(), below);
            actions.push(decision.action);
        }

        // averages: 30, 29, 27.67, 25.75, 24.2
        assert_eq!(
            actions,
            vec![
                Action::Hold,
                Action::Irrigate,
                Action::Irrigate,
                Action::Irrigate,
                Action::Irrigate
            ]
        );
    }

    #[test]
    fn test_rain_overrides_irrigation() {
        let mut buffer = ReadingBuffer::new("north", 5);
        buffer
            .append(SensorReading::new("north", at(0), 15.0).with_rain(true))
            .unwrap();

        let decision = engine().evaluate(buffer.state()).unwrap();
        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.reason, DecisionReason::RainOverride);
        assert_eq!(decision.duration_secs, None);
    }

    #[test]
    fn test_rain_is_read_from_latest_reading() {
        let engine = engine();
        let mut buffer = ReadingBuffer::new("north", 5);

        buffer
            .append(SensorReading::new("north", at(0), 15.0).with_rain(true))
            .unwrap();
        buffer.append(SensorReading::new("north", at(5), 14.0)).unwrap();
        assert!(engine.evaluate(buffer.state()).unwrap().is_irrigate());

        buffer
            .append(SensorReading::new("north", at(10), 14.0).with_rain(true))
            .unwrap();
        let decision = engine.evaluate(buffer.state()).unwrap();
        assert_eq!(decision.reason, DecisionReason::RainOverride);
        assert_eq!(decision.timestamp, at(10));
    }

    #[test]
    fn test_adequate_moisture_holds() {
        let mut buffer = ReadingBuffer::new("north", 5);
        buffer.append(SensorReading::new("north", at(0), 45.0)).unwrap();

        let decision = engine().evaluate(buffer.state()).unwrap();
        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.reason, DecisionReason::MoistureAdequate);
        assert_eq!(decision.rolling_avg_moisture_pct, 45.0);
    }

    #[test]
    fn test_irrigation_duration_is_clamped() {
        let engine = engine();
        // 25% deficit -> 5 minutes
        assert_eq!(engine.irrigation_duration(25.0), 300);
        // tiny deficit clamps to the minimum
        assert_eq!(engine.irrigation_duration(49.0), 60);
        // huge deficit clamps to the maximum
        assert_eq!(engine.irrigation_duration(0.0), 600);
    }
}

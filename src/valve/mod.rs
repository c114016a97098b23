// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Valve module - turns irrigation decisions into valve commands
//!
//! ```text
//!           Irrigate, cooldown over
//!   Closed ─────────────────────────▶ Open
//!     ▲                                │
//!     └── target reached / max run / rain / shutdown
//! ```
//!
//! Run time and cooldown are measured on the gateway clock at arrival, the
//! same clock the monitor uses for liveness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{RuleConfig, ValveConfig};
use crate::decision::{Action, Decision};
use crate::sensors::SensorReading;

/// Command sent to a field valve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValveAction {
    #[serde(rename = "open_valve")]
    Open,
    #[serde(rename = "close_valve")]
    Close,
}

/// Why the valve was switched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValveReason {
    LowMoisture,
    TargetReached,
    MaxDuration,
    Rain,
    Shutdown,
}

/// Actuator command for one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValveCommand {
    pub field_id: String,
    pub timestamp: DateTime<Utc>,
    pub command: ValveAction,
    pub reason: ValveReason,
    /// Requested run time, set on open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    /// How long the valve was open, set on close
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_duration_secs: Option<u64>,
    pub current_moisture_pct: f64,
    pub target_moisture_pct: f64,
}

impl ValveCommand {
    pub fn is_open(&self) -> bool {
        self.command == ValveAction::Open
    }
}

/// Valve state of one field
#[derive(Debug, Clone)]
pub struct ValveController {
    field_id: String,
    config: ValveConfig,
    target_moisture_pct: f64,
    max_run: chrono::Duration,
    opened_at: Option<DateTime<Utc>>,
    last_closed: Option<DateTime<Utc>>,
    last_moisture: f64,
}

impl ValveController {
    pub fn new(field_id: &str, config: ValveConfig, rules: &RuleConfig) -> Self {
        Self {
            field_id: field_id.to_string(),
            config,
            target_moisture_pct: rules.target_moisture_pct,
            max_run: chrono::Duration::seconds(rules.max_duration_secs as i64),
            opened_at: None,
            last_closed: None,
            last_moisture: 0.0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }

    /// Feed one accepted reading and its decision.
    pub fn observe(
        &mut self,
        reading: &SensorReading,
        decision: &Decision,
        received_at: DateTime<Utc>,
    ) -> Option<ValveCommand> {
        if !self.config.enabled {
            return None;
        }
        self.last_moisture = reading.soil_moisture_pct;
        let ts = reading.timestamp;

        if let Some(opened_at) = self.opened_at {
            let reason = if reading.rain_detected {
                ValveReason::Rain
            } else if reading.soil_moisture_pct >= self.config.close_at_pct {
                ValveReason::TargetReached
            } else if received_at - opened_at > self.max_run {
                ValveReason::MaxDuration
            } else {
                return None;
            };
            return Some(self.close(ts, received_at, reason));
        }

        let (Action::Irrigate, Some(duration)) = (decision.action, decision.duration_secs) else {
            return None;
        };

        if let Some(closed) = self.last_closed {
            let since = received_at - closed;
            if since < self.config.cooldown() {
                debug!(
                    "Valve {} cooling down, {}s since last run",
                    self.field_id,
                    since.num_seconds()
                );
                return None;
            }
        }

        info!(
            "Opening valve {} for {}s at {:.1}% moisture",
            self.field_id, duration, reading.soil_moisture_pct
        );
        self.opened_at = Some(received_at);
        Some(ValveCommand {
            field_id: self.field_id.clone(),
            timestamp: ts,
            command: ValveAction::Open,
            reason: ValveReason::LowMoisture,
            duration_secs: Some(duration),
            actual_duration_secs: None,
            current_moisture_pct: reading.soil_moisture_pct,
            target_moisture_pct: self.target_moisture_pct,
        })
    }

    /// Close a valve that outlived the maximum run without a new reading.
    pub fn check_timeout(&mut self, now: DateTime<Utc>) -> Option<ValveCommand> {
        let opened_at = self.opened_at?;
        if now - opened_at <= self.max_run {
            return None;
        }
        Some(self.close(now, now, ValveReason::MaxDuration))
    }

    /// Close the valve, if open, before the worker exits.
    pub fn shutdown(&mut self, now: DateTime<Utc>) -> Option<ValveCommand> {
        self.opened_at?;
        Some(self.close(now, now, ValveReason::Shutdown))
    }

    fn close(&mut self, ts: DateTime<Utc>, now: DateTime<Utc>, reason: ValveReason) -> ValveCommand {
        let opened_at = self.opened_at.take().unwrap_or(now);
        let ran = (now - opened_at).num_seconds().max(0) as u64;
        self.last_closed = Some(now);

        info!("Closing valve {} after {}s ({:?})", self.field_id, ran, reason);
        ValveCommand {
            field_id: self.field_id.clone(),
            timestamp: ts,
            command: ValveAction::Close,
            reason,
            duration_secs: None,
            actual_duration_secs: Some(ran),
            current_moisture_pct: self.last_moisture,
            target_moisture_pct: self.target_moisture_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DecisionReason;
    use chrono::{Duration, TimeZone};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 6, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn reading(minute: i64, moisture: f64) -> SensorReading {
        SensorReading::new("north", at(minute), moisture)
    }

    fn irrigate(minute: i64) -> Decision {
        Decision {
            field_id: "north".to_string(),
            timestamp: at(minute),
            action: Action::Irrigate,
            reason: DecisionReason::BelowThreshold,
            rolling_avg_moisture_pct: 24.0,
            duration_secs: Some(300),
        }
    }

    fn hold(minute: i64) -> Decision {
        Decision {
            action: Action::Hold,
            reason: DecisionReason::MoistureAdequate,
            duration_secs: None,
            ..irrigate(minute)
        }
    }

    fn valve() -> ValveController {
        ValveController::new("north", ValveConfig::default(), &RuleConfig::default())
    }

    #[test]
    fn test_opens_on_irrigate_and_closes_at_target() {
        let mut valve = valve();
        assert!(valve.observe(&reading(0, 40.0), &hold(0), at(0)).is_none());

        let open = valve.observe(&reading(5, 24.0), &irrigate(5), at(5)).unwrap();
        assert_eq!(open.command, ValveAction::Open);
        assert_eq!(open.reason, ValveReason::LowMoisture);
        assert_eq!(open.duration_secs, Some(300));
        assert_eq!(open.target_moisture_pct, 50.0);
        assert!(valve.is_open());

        // already open: a repeat Irrigate does nothing
        assert!(valve.observe(&reading(6, 30.0), &irrigate(6), at(6)).is_none());
        assert!(valve.observe(&reading(7, 60.0), &hold(7), at(7)).is_none());

        let close = valve.observe(&reading(8, 66.0), &hold(8), at(8)).unwrap();
        assert_eq!(close.command, ValveAction::Close);
        assert_eq!(close.reason, ValveReason::TargetReached);
        assert_eq!(close.actual_duration_secs, Some(180));
        assert_eq!(close.current_moisture_pct, 66.0);
        assert!(!valve.is_open());
    }

    #[test]
    fn test_max_run_closes_on_reading_or_heartbeat() {
        let mut valve = valve();
        valve.observe(&reading(0, 20.0), &irrigate(0), at(0)).unwrap();
        assert!(valve.observe(&reading(10, 22.0), &irrigate(10), at(10)).is_none());

        let close = valve.observe(&reading(11, 23.0), &irrigate(11), at(11)).unwrap();
        assert_eq!(close.reason, ValveReason::MaxDuration);
        assert_eq!(close.actual_duration_secs, Some(660));

        let mut valve = ValveController::new("north", ValveConfig::default(), &RuleConfig::default());
        valve.observe(&reading(0, 20.0), &irrigate(0), at(0)).unwrap();
        assert!(valve.check_timeout(at(10)).is_none());
        let close = valve.check_timeout(at(12)).unwrap();
        assert_eq!(close.reason, ValveReason::MaxDuration);
        assert_eq!(close.timestamp, at(12));
        assert!(valve.check_timeout(at(13)).is_none());
    }

    #[test]
    fn test_cooldown_blocks_reopening() {
        let mut valve = valve();
        valve.observe(&reading(0, 20.0), &irrigate(0), at(0)).unwrap();
        valve.observe(&reading(2, 70.0), &hold(2), at(2)).unwrap();

        assert!(valve.observe(&reading(5, 20.0), &irrigate(5), at(5)).is_none());
        assert!(valve.observe(&reading(16, 20.0), &irrigate(16), at(16)).is_none());

        let open = valve.observe(&reading(17, 20.0), &irrigate(17), at(17)).unwrap();
        assert!(open.is_open());
    }

    #[test]
    fn test_rain_closes_open_valve() {
        let mut valve = valve();
        valve.observe(&reading(0, 20.0), &irrigate(0), at(0)).unwrap();

        let rain = Decision {
            action: Action::Hold,
            reason: DecisionReason::RainOverride,
            duration_secs: None,
            ..irrigate(3)
        };
        let close = valve.observe(&reading(3, 21.0).with_rain(true), &rain, at(3)).unwrap();
        assert_eq!(close.reason, ValveReason::Rain);
        assert!(!valve.is_open());
    }

    #[test]
    fn test_shutdown_closes_only_open_valves() {
        let mut valve = valve();
        assert!(valve.shutdown(at(0)).is_none());

        valve.observe(&reading(0, 20.0), &irrigate(0), at(0)).unwrap();
        let close = valve.shutdown(at(1)).unwrap();
        assert_eq!(close.reason, ValveReason::Shutdown);
        assert_eq!(close.actual_duration_secs, Some(60));
        assert!(valve.shutdown(at(2)).is_none());
    }

    #[test]
    fn test_disabled_valve_never_commands() {
        let config = ValveConfig {
            enabled: false,
            ..ValveConfig::default()
        };
        let mut valve = ValveController::new("north", config, &RuleConfig::default());
        assert!(valve.observe(&reading(0, 10.0), &irrigate(0), at(0)).is_none());
        assert!(!valve.is_open());
    }

    #[test]
    fn test_command_json() {
        let mut valve = valve();
        let open = valve.observe(&reading(0, 24.0), &irrigate(0), at(0)).unwrap();
        let json = serde_json::to_value(&open).unwrap();
        assert_eq!(json["command"], "open_valve");
        assert_eq!(json["reason"], "low_moisture");
        assert_eq!(json["duration_secs"], 300);
        assert!(json.get("actual_duration_secs").is_none());

        let close = valve.shutdown(at(1)).unwrap();
        let json = serde_json::to_value(&close).unwrap();
        assert_eq!(json["command"], "close_valve");
        assert_eq!(json["reason"], "shutdown");
    }
}

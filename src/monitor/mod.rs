// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Alert monitor - per-field alert state machine
//!
//! ```text
//!            2x Irrigate               no reading for 2x cadence
//!   Normal ──────────────▶ Alerting ─────────────────────────▶ Offline
//!     ▲  ◀──────────────────┘  │                                 │
//!     │   moisture > 35%       └────────────▶ Offline            │
//!     └──────────────────── next valid reading ◀─────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::decision::{Action, Decision, DecisionReason};
use crate::sensors::SensorReading;

/// Monitor state of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState {
    Normal,
    Alerting,
    Offline,
}

/// Alert kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    LowMoisture,
    SensorOffline,
    RainOverride,
    HighSoilTemperature,
    LowBattery,
    /// A previously raised condition cleared; see [`AlertPayload::resolves`]
    Resolved,
}

/// Severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolves: Option<AlertKind>,
}

/// Alert event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub field_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub payload: AlertPayload,
}

impl Alert {
    fn new(
        field_id: &str,
        timestamp: DateTime<Utc>,
        kind: AlertKind,
        severity: Severity,
        message: String,
        value: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            field_id: field_id.to_string(),
            timestamp,
            kind,
            payload: AlertPayload {
                severity,
                message,
                value,
                resolves: None,
            },
        }
    }

    fn resolved(field_id: &str, timestamp: DateTime<Utc>, of: AlertKind, value: f64) -> Self {
        let mut alert = Self::new(
            field_id,
            timestamp,
            AlertKind::Resolved,
            Severity::Info,
            format!("{:?} condition resolved", of),
            value,
        );
        alert.payload.resolves = Some(of);
        alert
    }

    /// Identity used by consumers to drop redeliveries.
    pub fn dedup_key(&self) -> String {
        match self.payload.resolves {
            Some(of) => format!("{}|{}|{:?}|{:?}", self.field_id, self.timestamp.to_rfc3339(), self.kind, of),
            None => format!("{}|{}|{:?}", self.field_id, self.timestamp.to_rfc3339(), self.kind),
        }
    }
}

/// Alert state machine for one field
#[derive(Debug, Clone)]
pub struct FieldMonitor {
    field_id: String,
    config: MonitorConfig,
    state: MonitorState,
    consecutive_irrigate: u32,
    // Gateway clock at the last accepted reading; payload timestamps only order readings
    last_received: Option<DateTime<Utc>>,
    last_moisture: Option<f64>,

    // Latched conditions
    rain_override: bool,
    hot_soil: bool,
    low_battery: bool,
}

impl FieldMonitor {
    pub fn new(field_id: &str, config: MonitorConfig) -> Self {
        Self {
            field_id: field_id.to_string(),
            config,
            state: MonitorState::Normal,
            consecutive_irrigate: 0,
            last_received: None,
            last_moisture: None,
            rain_override: false,
            hot_soil: false,
            low_battery: false,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn consecutive_irrigate(&self) -> u32 {
        self.consecutive_irrigate
    }

    /// Gateway time the last accepted reading arrived
    pub fn last_received(&self) -> Option<DateTime<Utc>> {
        self.last_received
    }

    /// Conditions currently raised and not yet resolved
    pub fn active_alerts(&self) -> Vec<AlertKind> {
        let mut active = Vec::new();
        match self.state {
            MonitorState::Alerting => active.push(AlertKind::LowMoisture),
            MonitorState::Offline => active.push(AlertKind::SensorOffline),
            MonitorState::Normal => {}
        }
        if self.rain_override {
            active.push(AlertKind::RainOverride);
        }
        if self.hot_soil {
            active.push(AlertKind::HighSoilTemperature);
        }
        if self.low_battery {
            active.push(AlertKind::LowBattery);
        }
        active
    }

    /// Feed one accepted reading and the decision made for it.
    ///
    /// `received_at` is the gateway clock when the reading arrived. Liveness
    /// is judged on that clock so a sensor with a skewed RTC is neither
    /// flagged offline early nor kept alive after it goes quiet.
    pub fn observe(
        &mut self,
        reading: &SensorReading,
        decision: &Decision,
        received_at: DateTime<Utc>,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let ts = reading.timestamp;
        let moisture = reading.soil_moisture_pct;

        self.last_received = Some(received_at);
        self.last_moisture = Some(moisture);

        if self.state == MonitorState::Offline {
            info!("Field {} back online", self.field_id);
            self.state = MonitorState::Normal;
            self.consecutive_irrigate = 0;
            alerts.push(Alert::resolved(&self.field_id, ts, AlertKind::SensorOffline, moisture));
        }

        match decision.action {
            Action::Irrigate => self.consecutive_irrigate += 1,
            Action::Hold => self.consecutive_irrigate = 0,
        }

        match self.state {
            MonitorState::Normal if self.consecutive_irrigate >= self.config.consecutive_irrigate => {
                self.state = MonitorState::Alerting;
                let severity = if moisture < self.config.critical_moisture_pct {
                    Severity::Critical
                } else {
                    Severity::Warning
                };
                warn!("Field {} alerting: soil moisture {:.1}%", self.field_id, moisture);
                alerts.push(Alert::new(
                    &self.field_id,
                    ts,
                    AlertKind::LowMoisture,
                    severity,
                    format!(
                        "Soil moisture at {:.1}% (rolling average {:.1}%)",
                        moisture, decision.rolling_avg_moisture_pct
                    ),
                    moisture,
                ));
            }
            MonitorState::Alerting if moisture > self.config.exit_above_pct => {
                info!("Field {} recovered: soil moisture {:.1}%", self.field_id, moisture);
                self.state = MonitorState::Normal;
                self.consecutive_irrigate = 0;
                alerts.push(Alert::resolved(&self.field_id, ts, AlertKind::LowMoisture, moisture));
            }
            _ => {}
        }

        let overriding = decision.reason == DecisionReason::RainOverride;
        if overriding && !self.rain_override {
            alerts.push(Alert::new(
                &self.field_id,
                ts,
                AlertKind::RainOverride,
                Severity::Info,
                format!("Irrigation suppressed by rain at {:.1}% soil moisture", moisture),
                moisture,
            ));
        }
        self.rain_override = overriding;

        let hot = reading.soil_temp_c > self.config.high_soil_temp_c;
        if let Some(alert) = self.latch(hot, AlertKind::HighSoilTemperature, ts, reading.soil_temp_c) {
            alerts.push(alert);
        }

        if let Some(volts) = reading.battery_voltage {
            let low = volts < self.config.low_battery_v;
            if let Some(alert) = self.latch(low, AlertKind::LowBattery, ts, volts) {
                alerts.push(alert);
            }
        }

        alerts
    }

    /// Mark the field offline when nothing has arrived for too long.
    ///
    /// An open low-moisture episode is closed with a resolution first, so
    /// every raised condition has a matching `Resolved`.
    pub fn check_offline(&mut self, now: DateTime<Utc>) -> Vec<Alert> {
        let mut alerts = Vec::new();
        if self.state == MonitorState::Offline {
            return alerts;
        }
        let Some(last_received) = self.last_received else {
            return alerts;
        };
        let silent = now - last_received;
        if silent <= self.config.offline_after() {
            return alerts;
        }

        if self.state == MonitorState::Alerting {
            let moisture = self.last_moisture.unwrap_or_default();
            alerts.push(Alert::resolved(&self.field_id, now, AlertKind::LowMoisture, moisture));
        }

        warn!("Field {} offline: no reading for {}s", self.field_id, silent.num_seconds());
        self.state = MonitorState::Offline;
        self.consecutive_irrigate = 0;

        alerts.push(Alert::new(
            &self.field_id,
            now,
            AlertKind::SensorOffline,
            Severity::Critical,
            format!("No data from sensor in {} seconds", silent.num_seconds()),
            silent.num_seconds() as f64,
        ));
        alerts
    }

    fn latch(
        &mut self,
        raised: bool,
        kind: AlertKind,
        ts: DateTime<Utc>,
        value: f64,
    ) -> Option<Alert> {
        let flag = match kind {
            AlertKind::HighSoilTemperature => &mut self.hot_soil,
            AlertKind::LowBattery => &mut self.low_battery,
            _ => return None,
        };

        match (raised, *flag) {
            (true, false) => {
                *flag = true;
                let message = match kind {
                    AlertKind::HighSoilTemperature => format!(
                        "Soil temperature at {:.1}°C (threshold {:.1}°C)",
                        value, self.config.high_soil_temp_c
                    ),
                    _ => format!(
                        "Battery voltage at {:.2}V (threshold {:.2}V)",
                        value, self.config.low_battery_v
                    ),
                };
                Some(Alert::new(&self.field_id, ts, kind, Severity::Warning, message, value))
            }
            (false, true) => {
                *flag = false;
                Some(Alert::resolved(&self.field_id, ts, kind, value))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(minute: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-05-01T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::minutes(minute)
    }

    fn decision(minute: i64, action: Action, reason: DecisionReason) -> Decision {
        Decision {
            field_id: "north".to_string(),
            timestamp: at(minute),
            action,
            reason,
            rolling_avg_moisture_pct: 25.0,
            duration_secs: None,
        }
    }

    fn irrigate(minute: i64) -> Decision {
        decision(minute, Action::Irrigate, DecisionReason::BelowThreshold)
    }

    fn hold(minute: i64) -> Decision {
        decision(minute, Action::Hold, DecisionReason::MoistureAdequate)
    }

    fn reading(minute: i64, moisture: f64) -> SensorReading {
        SensorReading::new("north", at(minute), moisture)
    }

    fn monitor() -> FieldMonitor {
        FieldMonitor::new("north", MonitorConfig::default())
    }

    #[test]
    fn test_two_irrigates_enter_alerting_and_recover_above_hysteresis() {
        let mut monitor = monitor();

        assert!(monitor.observe(&reading(0, 22.0), &irrigate(0), at(0)).is_empty());
        assert_eq!(monitor.state(), MonitorState::Normal);

        let alerts = monitor.observe(&reading(5, 19.0), &irrigate(5), at(5));
        assert_eq!(monitor.state(), MonitorState::Alerting);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowMoisture);
        assert_eq!(alerts[0].payload.severity, Severity::Critical);

        // still dry: no repeat alert
        assert!(monitor.observe(&reading(10, 21.0), &irrigate(10), at(10)).is_empty());

        // between the thresholds: stays alerting
        assert!(monitor.observe(&reading(15, 33.0), &hold(15), at(15)).is_empty());
        assert_eq!(monitor.state(), MonitorState::Alerting);

        let alerts = monitor.observe(&reading(20, 40.0), &hold(20), at(20));
        assert_eq!(monitor.state(), MonitorState::Normal);
        assert_eq!(alerts[0].kind, AlertKind::Resolved);
        assert_eq!(alerts[0].payload.resolves, Some(AlertKind::LowMoisture));
    }

    #[test]
    fn test_hold_resets_consecutive_count() {
        let mut monitor = monitor();
        monitor.observe(&reading(0, 25.0), &irrigate(0), at(0));
        monitor.observe(&reading(5, 31.0), &hold(5), at(5));
        assert_eq!(monitor.consecutive_irrigate(), 0);
        assert!(monitor.observe(&reading(10, 25.0), &irrigate(10), at(10)).is_empty());
        assert_eq!(monitor.state(), MonitorState::Normal);
    }

    #[test]
    fn test_offline_after_silence_and_back_on_next_reading() {
        let mut monitor = monitor();
        assert!(monitor.check_offline(at(0)).is_empty());

        monitor.observe(&reading(0, 45.0), &hold(0), at(0));
        assert!(monitor.check_offline(at(9)).is_empty());
        assert!(monitor.check_offline(at(10)).is_empty());

        let alerts = monitor.check_offline(at(11));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::SensorOffline);
        assert_eq!(alerts[0].payload.value, 660.0);
        assert_eq!(monitor.state(), MonitorState::Offline);

        // only raised once
        assert!(monitor.check_offline(at(20)).is_empty());

        let alerts = monitor.observe(&reading(21, 44.0), &hold(21), at(21));
        assert_eq!(monitor.state(), MonitorState::Normal);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].payload.resolves, Some(AlertKind::SensorOffline));
    }

    #[test]
    fn test_alerting_field_going_offline_resolves_low_moisture() {
        let mut monitor = monitor();
        monitor.observe(&reading(0, 25.0), &irrigate(0), at(0));
        monitor.observe(&reading(5, 24.0), &irrigate(5), at(5));
        assert_eq!(monitor.state(), MonitorState::Alerting);

        let alerts = monitor.check_offline(at(16));
        let kinds: Vec<_> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::Resolved, AlertKind::SensorOffline]);
        assert_eq!(alerts[0].payload.resolves, Some(AlertKind::LowMoisture));
        assert_eq!(alerts[0].payload.value, 24.0);
        assert_eq!(monitor.state(), MonitorState::Offline);
        assert_eq!(monitor.active_alerts(), vec![AlertKind::SensorOffline]);

        // a dry field coming back opens a fresh episode
        monitor.observe(&reading(20, 22.0), &irrigate(20), at(20));
        let alerts = monitor.observe(&reading(25, 21.0), &irrigate(25), at(25));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowMoisture);
    }

    #[test]
    fn test_fast_sensor_clock_does_not_delay_offline() {
        // RTC an hour fast: payload timestamp is far ahead of the gateway
        let mut monitor = monitor();
        monitor.observe(&reading(60, 45.0), &hold(60), at(0));
        assert!(monitor.check_offline(at(5)).is_empty());
        assert_eq!(monitor.last_received(), Some(at(0)));
        assert_eq!(monitor.check_offline(at(11)).len(), 1);
    }

    #[test]
    fn test_slow_sensor_clock_does_not_trip_offline() {
        // RTC thirty minutes slow: fresh arrivals keep the field online
        let mut monitor = monitor();
        monitor.observe(&reading(-30, 45.0), &hold(-30), at(0));
        assert!(monitor.check_offline(at(1)).is_empty());
        monitor.observe(&reading(-25, 45.0), &hold(-25), at(5));
        assert!(monitor.check_offline(at(14)).is_empty());
        assert_eq!(monitor.state(), MonitorState::Normal);
    }

    #[test]
    fn test_rain_override_alert_once_per_episode() {
        let mut monitor = monitor();
        let rain = |m| decision(m, Action::Hold, DecisionReason::RainOverride);

        let alerts = monitor.observe(&reading(0, 15.0).with_rain(true), &rain(0), at(0));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::RainOverride);

        assert!(monitor.observe(&reading(5, 16.0).with_rain(true), &rain(5), at(5)).is_empty());
        assert!(monitor.observe(&reading(10, 17.0), &irrigate(10), at(10)).is_empty());

        let alerts = monitor.observe(&reading(15, 18.0).with_rain(true), &rain(15), at(15));
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn test_latched_temperature_and_battery() {
        let mut monitor = monitor();

        let alerts = monitor.observe(
            &reading(0, 45.0).with_soil_temp(37.0).with_battery(3.1),
            &hold(0),
            at(0),
        );
        let kinds: Vec<_> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::HighSoilTemperature, AlertKind::LowBattery]);

        assert!(monitor
            .observe(&reading(5, 45.0).with_soil_temp(36.0).with_battery(3.2), &hold(5), at(5))
            .is_empty());

        let alerts = monitor.observe(&reading(10, 45.0).with_soil_temp(25.0), &hold(10), at(10));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].payload.resolves, Some(AlertKind::HighSoilTemperature));
        assert_eq!(monitor.active_alerts(), vec![AlertKind::LowBattery]);
    }

    #[test]
    fn test_dedup_key_distinguishes_resolutions() {
        let a = Alert::resolved("north", at(0), AlertKind::LowBattery, 3.6);
        let b = Alert::resolved("north", at(0), AlertKind::SensorOffline, 3.6);
        assert_ne!(a.dedup_key(), b.dedup_key());

        let mut c = a.clone();
        c.id = "redelivered".to_string();
        assert_eq!(a.dedup_key(), c.dedup_key());
    }
}

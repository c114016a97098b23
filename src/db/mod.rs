// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Database module - append-only time-series history
//!
//! Rows are keyed by field and timestamp (plus alert kind), and inserts use
//! `INSERT OR IGNORE`, so a redelivered record is stored once.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{info, debug};

use crate::config::DatabaseConfig;
use crate::decision::Decision;
use crate::monitor::Alert;
use crate::sensors::SensorReading;
use crate::streaming::OutboundRecord;
use crate::valve::ValveCommand;

/// Database manager
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.path)?;

        conn.execute_batch(r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#)?;

        let db = Self::with_connection(conn)?;
        info!("Database opened at {:?}", config.path);
        Ok(db)
    }

    /// Private in-memory store, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.create_tables()?;
        Ok(db)
    }

    /// Create database tables
    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(r#"
            -- Sensor readings
            CREATE TABLE IF NOT EXISTS readings (
                field_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                soil_moisture_pct REAL NOT NULL,
                soil_temp_c REAL NOT NULL,
                air_temp_c REAL NOT NULL,
                air_humidity_pct REAL NOT NULL,
                rain_detected INTEGER NOT NULL,
                device_id TEXT,
                battery_voltage REAL,
                PRIMARY KEY (field_id, ts)
            );

            CREATE INDEX IF NOT EXISTS idx_readings_ts ON readings(ts);

            -- Irrigation decisions
            CREATE TABLE IF NOT EXISTS decisions (
                field_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                action TEXT NOT NULL,
                reason TEXT NOT NULL,
                rolling_avg_moisture_pct REAL NOT NULL,
                duration_secs INTEGER,
                PRIMARY KEY (field_id, ts)
            );

            -- Alerts
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT NOT NULL,
                field_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                resolves TEXT NOT NULL DEFAULT '',
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                value REAL NOT NULL,
                PRIMARY KEY (field_id, ts, kind, resolves)
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_ts ON alerts(ts);

            -- Valve commands
            CREATE TABLE IF NOT EXISTS valve_commands (
                field_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                command TEXT NOT NULL,
                reason TEXT NOT NULL,
                duration_secs INTEGER,
                actual_duration_secs INTEGER,
                moisture_pct REAL NOT NULL,
                PRIMARY KEY (field_id, ts, command)
            );
        "#)?;

        Ok(())
    }

    /// Store any outbound record. Returns false when it was already stored.
    pub fn store_record(&self, record: &OutboundRecord) -> Result<bool> {
        match record {
            OutboundRecord::Reading(r) => self.store_reading(r),
            OutboundRecord::Decision(d) => self.store_decision(d),
            OutboundRecord::Alert(a) => self.store_alert(a),
            OutboundRecord::Valve(v) => self.store_valve_command(v),
        }
    }

    /// Store a sensor reading
    pub fn store_reading(&self, reading: &SensorReading) -> Result<bool> {
        let conn = self.conn.lock();

        let inserted = conn.execute(
            r#"INSERT OR IGNORE INTO readings
               (field_id, ts, timestamp, soil_moisture_pct, soil_temp_c, air_temp_c,
                air_humidity_pct, rain_detected, device_id, battery_voltage)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                reading.field_id,
                reading.timestamp.timestamp_micros(),
                reading.timestamp.to_rfc3339(),
                reading.soil_moisture_pct,
                reading.soil_temp_c,
                reading.air_temp_c,
                reading.air_humidity_pct,
                reading.rain_detected,
                reading.device_id,
                reading.battery_voltage,
            ],
        )?;

        Ok(inserted > 0)
    }

    /// Store a decision
    pub fn store_decision(&self, decision: &Decision) -> Result<bool> {
        let conn = self.conn.lock();

        let inserted = conn.execute(
            r#"INSERT OR IGNORE INTO decisions
               (field_id, ts, timestamp, action, reason, rolling_avg_moisture_pct, duration_secs)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                decision.field_id,
                decision.timestamp.timestamp_micros(),
                decision.timestamp.to_rfc3339(),
                format!("{:?}", decision.action),
                format!("{:?}", decision.reason),
                decision.rolling_avg_moisture_pct,
                decision.duration_secs.map(|s| s as i64),
            ],
        )?;

        Ok(inserted > 0)
    }

    /// Store an alert
    pub fn store_alert(&self, alert: &Alert) -> Result<bool> {
        let conn = self.conn.lock();

        let resolves = alert
            .payload
            .resolves
            .map(|k| format!("{:?}", k))
            .unwrap_or_default();

        let inserted = conn.execute(
            r#"INSERT OR IGNORE INTO alerts
               (id, field_id, ts, timestamp, kind, resolves, severity, message, value)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                alert.id,
                alert.field_id,
                alert.timestamp.timestamp_micros(),
                alert.timestamp.to_rfc3339(),
                format!("{:?}", alert.kind),
                resolves,
                format!("{:?}", alert.payload.severity),
                alert.payload.message,
                alert.payload.value,
            ],
        )?;

        if inserted == 0 {
            debug!("Alert {} already stored", alert.dedup_key());
        }
        Ok(inserted > 0)
    }

    /// Store a valve command
    pub fn store_valve_command(&self, command: &ValveCommand) -> Result<bool> {
        let conn = self.conn.lock();

        let inserted = conn.execute(
            r#"INSERT OR IGNORE INTO valve_commands
               (field_id, ts, timestamp, command, reason, duration_secs, actual_duration_secs, moisture_pct)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                command.field_id,
                command.timestamp.timestamp_micros(),
                command.timestamp.to_rfc3339(),
                format!("{:?}", command.command),
                format!("{:?}", command.reason),
                command.duration_secs.map(|s| s as i64),
                command.actual_duration_secs.map(|s| s as i64),
                command.current_moisture_pct,
            ],
        )?;

        Ok(inserted > 0)
    }

    /// Readings for one field in a time range, oldest first
    pub fn query_readings(
        &self,
        field_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<SensorReading>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            r#"SELECT field_id, timestamp, soil_moisture_pct, soil_temp_c, air_temp_c,
                      air_humidity_pct, rain_detected, device_id, battery_voltage
               FROM readings
               WHERE field_id = ?1 AND ts >= ?2 AND ts <= ?3
               ORDER BY ts ASC LIMIT ?4"#,
        )?;

        let rows = stmt.query_map(
            params![
                field_id,
                start.timestamp_micros(),
                end.timestamp_micros(),
                limit.unwrap_or(1000) as i64
            ],
            reading_from_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Most recent decision stored for a field
    pub fn latest_decision(&self, field_id: &str) -> Result<Option<StoredDecision>> {
        let conn = self.conn.lock();

        let decision = conn
            .query_row(
                r#"SELECT field_id, timestamp, action, reason, rolling_avg_moisture_pct, duration_secs
                   FROM decisions WHERE field_id = ?1 ORDER BY ts DESC LIMIT 1"#,
                params![field_id],
                |row| {
                    Ok(StoredDecision {
                        field_id: row.get(0)?,
                        timestamp: row.get(1)?,
                        action: row.get(2)?,
                        reason: row.get(3)?,
                        rolling_avg_moisture_pct: row.get(4)?,
                        duration_secs: row.get(5)?,
                    })
                },
            )
            .optional()?;

        Ok(decision)
    }

    /// Alerts in a time range, newest first
    pub fn query_alerts(
        &self,
        field_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredAlert>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            r#"SELECT id, field_id, timestamp, kind, resolves, severity, message, value
               FROM alerts
               WHERE ts >= ?1 AND ts <= ?2 AND (?3 IS NULL OR field_id = ?3)
               ORDER BY ts DESC LIMIT ?4"#,
        )?;

        let rows = stmt.query_map(
            params![
                start.timestamp_micros(),
                end.timestamp_micros(),
                field_id,
                limit.unwrap_or(100) as i64
            ],
            |row| {
                let resolves: String = row.get(4)?;
                Ok(StoredAlert {
                    id: row.get(0)?,
                    field_id: row.get(1)?,
                    timestamp: row.get(2)?,
                    kind: row.get(3)?,
                    resolves: (!resolves.is_empty()).then_some(resolves),
                    severity: row.get(5)?,
                    message: row.get(6)?,
                    value: row.get(7)?,
                })
            },
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Get database statistics
    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let conn = self.conn.lock();

        let count = |table: &str| -> Result<usize> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            Ok(n as usize)
        };

        let field_count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT field_id) FROM readings",
            [],
            |row| row.get(0),
        )?;

        Ok(DatabaseStats {
            reading_count: count("readings")?,
            decision_count: count("decisions")?,
            alert_count: count("alerts")?,
            valve_command_count: count("valve_commands")?,
            field_count: field_count as usize,
        })
    }

    /// Delete history older than `retention_days` before `now`
    pub fn cleanup(&self, retention_days: u32, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();

        let cutoff = (now - chrono::Duration::days(retention_days as i64)).timestamp_micros();

        let mut deleted = 0;
        for table in ["readings", "decisions", "alerts", "valve_commands"] {
            deleted += conn.execute(&format!("DELETE FROM {} WHERE ts < ?1", table), params![cutoff])?;
        }

        info!("Cleaned up {} rows older than {} days", deleted, retention_days);
        Ok(deleted)
    }
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<SensorReading> {
    let timestamp: String = row.get(1)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e)))?
        .with_timezone(&Utc);

    Ok(SensorReading {
        field_id: row.get(0)?,
        timestamp,
        soil_moisture_pct: row.get(2)?,
        soil_temp_c: row.get(3)?,
        air_temp_c: row.get(4)?,
        air_humidity_pct: row.get(5)?,
        rain_detected: row.get(6)?,
        device_id: row.get(7)?,
        battery_voltage: row.get(8)?,
    })
}

#[derive(Debug, Clone)]
pub struct StoredDecision {
    pub field_id: String,
    pub timestamp: String,
    pub action: String,
    pub reason: String,
    pub rolling_avg_moisture_pct: f64,
    pub duration_secs: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct StoredAlert {
    pub id: String,
    pub field_id: String,
    pub timestamp: String,
    pub kind: String,
    pub resolves: Option<String>,
    pub severity: String,
    pub message: String,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub reading_count: usize,
    pub decision_count: usize,
    pub alert_count: usize,
    pub valve_command_count: usize,
    pub field_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::decision::{Action, DecisionReason};
    use crate::monitor::FieldMonitor;
    use chrono::{Duration, TimeZone};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 6, 0, 0).unwrap() + Duration::minutes(minute)
    }

    #[test]
    fn test_readings_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let reading = SensorReading::new("north", at(0), 31.5).with_battery(3.8);

        assert!(db.store_reading(&reading).unwrap());
        assert!(!db.store_reading(&reading).unwrap());
        db.store_reading(&SensorReading::new("north", at(5), 30.0)).unwrap();
        db.store_reading(&SensorReading::new("south", at(5), 60.0)).unwrap();

        let stored = db.query_readings("north", at(0), at(10), None).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0], reading);

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.reading_count, 3);
        assert_eq!(stats.field_count, 2);
    }

    #[test]
    fn test_decisions_and_latest() {
        let db = Database::open_in_memory().unwrap();
        for (minute, action) in [(0, Action::Hold), (5, Action::Irrigate)] {
            let decision = Decision {
                field_id: "north".to_string(),
                timestamp: at(minute),
                action,
                reason: DecisionReason::BelowThreshold,
                rolling_avg_moisture_pct: 28.0,
                duration_secs: Some(240),
            };
            db.store_record(&OutboundRecord::Decision(decision)).unwrap();
        }

        let latest = db.latest_decision("north").unwrap().unwrap();
        assert_eq!(latest.action, "Irrigate");
        assert_eq!(latest.duration_secs, Some(240));
        assert!(db.latest_decision("south").unwrap().is_none());
    }

    #[test]
    fn test_redelivered_alert_stored_once() {
        let db = Database::open_in_memory().unwrap();
        let mut monitor = FieldMonitor::new("north", MonitorConfig::default());
        monitor.observe(&SensorReading::new("north", at(0), 40.0), &hold(0), at(0));
        let alert = monitor.check_offline(at(11)).remove(0);

        assert!(db.store_alert(&alert).unwrap());
        let mut again = alert.clone();
        again.id = "redelivered".to_string();
        assert!(!db.store_alert(&again).unwrap());

        let alerts = db.query_alerts(Some("north"), at(0), at(60), None).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "SensorOffline");
        assert_eq!(alerts[0].resolves, None);
        assert!(db.query_alerts(Some("south"), at(0), at(60), None).unwrap().is_empty());
    }

    #[test]
    fn test_valve_commands_open_and_close_stored_once() {
        use crate::config::{RuleConfig, ValveConfig};
        use crate::valve::ValveController;

        let db = Database::open_in_memory().unwrap();
        let mut valve = ValveController::new("north", ValveConfig::default(), &RuleConfig::default());
        let irrigate = Decision {
            action: Action::Irrigate,
            reason: DecisionReason::BelowThreshold,
            duration_secs: Some(300),
            ..hold(0)
        };
        let open = valve
            .observe(&SensorReading::new("north", at(0), 22.0), &irrigate, at(0))
            .unwrap();
        let close = valve.shutdown(at(3)).unwrap();

        let open = OutboundRecord::Valve(open);
        assert!(db.store_record(&open).unwrap());
        assert!(!db.store_record(&open).unwrap());
        assert!(db.store_record(&OutboundRecord::Valve(close)).unwrap());
        assert_eq!(db.get_stats().unwrap().valve_command_count, 2);
    }

    #[test]
    fn test_cleanup_respects_retention() {
        let db = Database::open_in_memory().unwrap();
        db.store_reading(&SensorReading::new("north", at(0), 40.0)).unwrap();
        db.store_reading(&SensorReading::new("north", at(60 * 24 * 10), 40.0)).unwrap();

        let deleted = db.cleanup(5, at(60 * 24 * 10)).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.get_stats().unwrap().reading_count, 1);
    }

    fn hold(minute: i64) -> Decision {
        Decision {
            field_id: "north".to_string(),
            timestamp: at(minute),
            action: Action::Hold,
            reason: DecisionReason::MoistureAdequate,
            rolling_avg_moisture_pct: 40.0,
            duration_secs: None,
        }
    }
}

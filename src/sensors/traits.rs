// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Sensor traits and common types

use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use anyhow::Result;

use crate::error::{InvalidReason, PipelineError, PipelineResult};

/// Sensor operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorStatus {
    Disconnected,
    Connecting,
    Active,
    Error,
}

/// A single soil/air reading from a field sensor.
///
/// Serialized with the key names used on the wire by field devices
/// (`soil_moisture_percent`, `soil_temperature_c`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Empty when the field is taken from the MQTT topic instead
    #[serde(default)]
    pub field_id: String,
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "soil_moisture_percent")]
    pub soil_moisture_pct: f64,
    #[serde(rename = "soil_temperature_c")]
    pub soil_temp_c: f64,
    #[serde(rename = "air_temperature_c")]
    pub air_temp_c: f64,
    #[serde(rename = "air_humidity_percent")]
    pub air_humidity_pct: f64,
    #[serde(default)]
    pub rain_detected: bool,

    // Metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_voltage: Option<f64>,
}

impl SensorReading {
    pub fn new(field_id: &str, timestamp: DateTime<Utc>, soil_moisture_pct: f64) -> Self {
        Self {
            field_id: field_id.to_string(),
            timestamp,
            soil_moisture_pct,
            soil_temp_c: 20.0,
            air_temp_c: 22.0,
            air_humidity_pct: 55.0,
            rain_detected: false,
            device_id: None,
            battery_voltage: None,
        }
    }

    pub fn with_rain(mut self, rain_detected: bool) -> Self {
        self.rain_detected = rain_detected;
        self
    }

    pub fn with_soil_temp(mut self, soil_temp_c: f64) -> Self {
        self.soil_temp_c = soil_temp_c;
        self
    }

    pub fn with_battery(mut self, volts: f64) -> Self {
        self.battery_voltage = Some(volts);
        self
    }

    /// Range and sanity checks that do not depend on field history.
    pub fn validate(&self) -> PipelineResult<()> {
        let invalid = |reason| Err(PipelineError::invalid(&self.field_id, reason));

        if self.field_id.trim().is_empty() {
            return invalid(InvalidReason::EmptyFieldId);
        }
        if !self.soil_moisture_pct.is_finite() {
            return invalid(InvalidReason::NonFinite("soil moisture"));
        }
        if !(0.0..=100.0).contains(&self.soil_moisture_pct) {
            return invalid(InvalidReason::MoistureOutOfRange(self.soil_moisture_pct));
        }
        if !self.air_humidity_pct.is_finite() {
            return invalid(InvalidReason::NonFinite("air humidity"));
        }
        if !(0.0..=100.0).contains(&self.air_humidity_pct) {
            return invalid(InvalidReason::HumidityOutOfRange(self.air_humidity_pct));
        }
        if !self.soil_temp_c.is_finite() {
            return invalid(InvalidReason::NonFinite("soil temperature"));
        }
        if !self.air_temp_c.is_finite() {
            return invalid(InvalidReason::NonFinite("air temperature"));
        }
        if matches!(self.battery_voltage, Some(v) if !v.is_finite()) {
            return invalid(InvalidReason::NonFinite("battery voltage"));
        }
        Ok(())
    }
}

/// Trait for all field sensors
#[async_trait]
pub trait Sensor: Send + Sync {
    /// Get sensor unique identifier
    fn id(&self) -> &str;

    /// Field the sensor is installed in
    fn field_id(&self) -> &str;

    /// Get current status
    fn status(&self) -> SensorStatus;

    /// Connect to sensor hardware
    async fn connect(&mut self) -> Result<()>;

    /// Disconnect from sensor
    async fn disconnect(&mut self) -> Result<()>;

    /// Take one reading
    async fn read(&mut self) -> Result<SensorReading>;

    /// Expected reporting cadence
    fn interval(&self) -> Duration;
}

/// Sensor health metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorHealth {
    pub sensor_id: String,
    pub field_id: String,
    pub status: SensorStatus,
    pub readings_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_reading: Option<DateTime<Utc>>,
    pub battery_voltage: Option<f64>,
}

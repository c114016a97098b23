// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Soil sensor simulator for demo/testing

use std::time::Duration;
use async_trait::async_trait;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::prelude::*;
use rand_distr::{StandardNormal, Uniform};

use super::{Sensor, SensorReading, SensorStatus};
use crate::config::SimulatorConfig;

/// Simulates a field sensor: the soil slowly dries out, rain episodes wet it
/// again, and every reading carries some measurement noise.
pub struct SoilSensorSimulator {
    id: String,
    field_id: String,
    status: SensorStatus,
    interval: Duration,
    rng: StdRng,

    // Simulation state
    moisture: f64,
    rain_probability: f64,
    rain_remaining: u32,
    noise_sd: f64,
}

impl SoilSensorSimulator {
    pub fn new(id: &str, field_id: &str, config: &SimulatorConfig) -> Self {
        Self::with_rng(id, field_id, config, StdRng::from_entropy())
    }

    /// Reproducible simulator
    pub fn with_seed(id: &str, field_id: &str, config: &SimulatorConfig, seed: u64) -> Self {
        Self::with_rng(id, field_id, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(id: &str, field_id: &str, config: &SimulatorConfig, rng: StdRng) -> Self {
        Self {
            id: id.to_string(),
            field_id: field_id.to_string(),
            status: SensorStatus::Disconnected,
            interval: Duration::from_secs(config.interval_secs),
            rng,
            moisture: config.base_moisture_pct,
            rain_probability: config.rain_probability.clamp(0.0, 1.0),
            rain_remaining: 0,
            noise_sd: 1.5,
        }
    }

    /// Advance the soil model by one reporting period.
    pub fn step(&mut self, timestamp: DateTime<Utc>) -> SensorReading {
        if self.rain_remaining == 0 && self.rng.gen::<f64>() < self.rain_probability {
            self.rain_remaining = self.rng.gen_range(2..=6);
        }

        let raining = self.rain_remaining > 0;
        if raining {
            self.rain_remaining -= 1;
            self.moisture += self.rng.gen_range(1.5..4.0);
        } else {
            // evaporation
            self.moisture -= self.rng.gen_range(0.2..1.0);
        }
        self.moisture = self.moisture.clamp(5.0, 95.0);

        let noise: f64 = self.rng.sample(StandardNormal);
        let measured = (self.moisture + noise * self.noise_sd).clamp(0.0, 100.0);
        let humidity = if raining {
            Uniform::new(80.0, 98.0)
        } else {
            Uniform::new(40.0, 70.0)
        };

        SensorReading {
            field_id: self.field_id.clone(),
            timestamp,
            soil_moisture_pct: round_to(measured, 2),
            soil_temp_c: round_to(self.rng.gen_range(18.0..28.0), 1),
            air_temp_c: round_to(self.rng.gen_range(20.0..32.0), 1),
            air_humidity_pct: round_to(self.rng.sample(humidity), 1),
            rain_detected: raining,
            device_id: Some(self.id.clone()),
            battery_voltage: Some(round_to(self.rng.gen_range(3.6..4.2), 2)),
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[async_trait]
impl Sensor for SoilSensorSimulator {
    fn id(&self) -> &str {
        &self.id
    }

    fn field_id(&self) -> &str {
        &self.field_id
    }

    fn status(&self) -> SensorStatus {
        self.status
    }

    async fn connect(&mut self) -> Result<()> {
        self.status = SensorStatus::Active;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.status = SensorStatus::Disconnected;
        Ok(())
    }

    async fn read(&mut self) -> Result<SensorReading> {
        if self.status != SensorStatus::Active {
            return Err(anyhow!("Sensor {} is not connected", self.id));
        }
        Ok(self.step(Utc::now()))
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}

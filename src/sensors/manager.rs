// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Sensor manager - polls local sensors and forwards their readings

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};
use anyhow::Result;
use tracing::{info, warn, error, debug};

use super::{Sensor, SensorReading, SensorStatus, SensorHealth};
use super::simulator::SoilSensorSimulator;
use crate::config::Config;

/// Manages all locally attached sensors
pub struct SensorManager {
    config: Arc<Config>,
    sensors: RwLock<HashMap<String, Box<dyn Sensor>>>,
    health: RwLock<HashMap<String, SensorHealth>>,
    sink: mpsc::Sender<SensorReading>,
}

impl SensorManager {
    /// Readings are sent to `sink`, the same queue MQTT ingress feeds.
    pub async fn new(config: Arc<Config>, sink: mpsc::Sender<SensorReading>, demo_mode: bool) -> Result<Self> {
        let manager = Self {
            config,
            sensors: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            sink,
        };

        if demo_mode {
            manager.add_demo_sensors().await?;
        }

        Ok(manager)
    }

    async fn add_demo_sensors(&self) -> Result<()> {
        info!("Adding simulated soil sensors...");

        let simulator = &self.config.simulator;
        for field_id in &simulator.fields {
            let id = format!("soil-{}", field_id);
            let sensor = SoilSensorSimulator::new(&id, field_id, simulator);
            self.add_sensor(Box::new(sensor)).await?;
        }

        Ok(())
    }

    pub async fn add_sensor(&self, sensor: Box<dyn Sensor>) -> Result<()> {
        let id = sensor.id().to_string();
        let field_id = sensor.field_id().to_string();

        self.health.write().await.insert(id.clone(), SensorHealth {
            sensor_id: id.clone(),
            field_id: field_id.clone(),
            status: SensorStatus::Disconnected,
            readings_count: 0,
            error_count: 0,
            last_error: None,
            last_reading: None,
            battery_voltage: None,
        });
        self.sensors.write().await.insert(id.clone(), sensor);

        info!("Added sensor: {} ({})", id, field_id);
        Ok(())
    }

    pub async fn remove_sensor(&self, id: &str) -> Result<()> {
        if let Some(mut sensor) = self.sensors.write().await.remove(id) {
            sensor.disconnect().await?;
        }
        self.health.write().await.remove(id);

        info!("Removed sensor: {}", id);
        Ok(())
    }

    pub async fn active_count(&self) -> usize {
        let sensors = self.sensors.read().await;
        sensors.values().filter(|s| s.status() == SensorStatus::Active).count()
    }

    pub async fn get_health(&self, id: &str) -> Option<SensorHealth> {
        self.health.read().await.get(id).cloned()
    }

    pub async fn get_all_health(&self) -> Vec<SensorHealth> {
        let mut all: Vec<SensorHealth> = self.health.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        all
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("Starting sensor manager...");
        self.connect_all().await;

        let period = self.poll_period().await;
        debug!("Polling sensors every {:?}", period);
        let mut poll = interval(period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if !self.read_all_sensors().await {
                        info!("Reading sink closed, sensor manager stopping");
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Sensor manager shutting down...");
                    break;
                }
            }
        }

        self.disconnect_all().await;
        Ok(())
    }

    /// Poll as often as the most frequent sensor reports
    pub async fn poll_period(&self) -> Duration {
        let fastest = self.sensors.read().await.values().map(|s| s.interval()).min();
        fastest
            .unwrap_or_else(|| Duration::from_secs(self.config.simulator.interval_secs))
            .max(Duration::from_secs(1))
    }

    async fn connect_all(&self) {
        let mut sensors = self.sensors.write().await;
        let mut health = self.health.write().await;

        for (id, sensor) in sensors.iter_mut() {
            match sensor.connect().await {
                Ok(()) => info!("Connected sensor: {}", id),
                Err(e) => {
                    error!("Failed to connect sensor {}: {}", id, e);
                    if let Some(h) = health.get_mut(id) {
                        h.error_count += 1;
                        h.last_error = Some(e.to_string());
                    }
                }
            }
            if let Some(h) = health.get_mut(id) {
                h.status = sensor.status();
            }
        }
    }

    async fn disconnect_all(&self) {
        let mut sensors = self.sensors.write().await;
        let mut health = self.health.write().await;

        for (id, sensor) in sensors.iter_mut() {
            if let Err(e) = sensor.disconnect().await {
                warn!("Error disconnecting {}: {}", id, e);
            }
            if let Some(h) = health.get_mut(id) {
                h.status = sensor.status();
            }
        }
    }

    /// One polling pass. Returns false once the sink is gone.
    pub async fn read_all_sensors(&self) -> bool {
        let mut readings = Vec::new();
        {
            let mut sensors = self.sensors.write().await;
            let mut health = self.health.write().await;

            for (id, sensor) in sensors.iter_mut() {
                if sensor.status() != SensorStatus::Active {
                    continue;
                }

                match sensor.read().await {
                    Ok(reading) => {
                        if let Some(h) = health.get_mut(id) {
                            h.readings_count += 1;
                            h.last_reading = Some(reading.timestamp);
                            h.battery_voltage = reading.battery_voltage;
                        }
                        readings.push(reading);
                    }
                    Err(e) => {
                        if let Some(h) = health.get_mut(id) {
                            h.error_count += 1;
                            h.last_error = Some(e.to_string());
                        }
                        debug!("Read error for {}: {}", id, e);
                    }
                }
            }
        }

        // locks released before awaiting the sink
        for reading in readings {
            if self.sink.send(reading).await.is_err() {
                return false;
            }
        }
        true
    }
}

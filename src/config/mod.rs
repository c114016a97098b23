// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Configuration module
//!
//! Every threshold the pipeline uses lives here as a named field with a
//! documented default. Values are illustrative agronomy defaults, not
//! contractual; tune them per crop and soil.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::PipelineError;
use crate::streaming::{PublisherConfig, StreamingConfig};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application name
    pub app_name: String,

    /// Data directory
    pub data_dir: PathBuf,

    /// Log level
    pub log_level: String,

    /// Enable demo mode (simulated soil sensors)
    pub demo_mode: bool,

    /// Reading buffer configuration
    pub buffer: BufferConfig,

    /// Irrigation rule configuration
    pub rules: RuleConfig,

    /// Alert monitor configuration
    pub monitor: MonitorConfig,

    /// Irrigation valve control
    pub valve: ValveConfig,

    /// Outbound delivery configuration
    pub publisher: PublisherConfig,

    /// MQTT configuration
    pub streaming: StreamingConfig,

    /// Time-series store configuration
    pub database: DatabaseConfig,

    /// Simulated sensors for demo mode
    pub simulator: SimulatorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: "AgroWatch".to_string(),
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            demo_mode: false,
            buffer: BufferConfig::default(),
            rules: RuleConfig::default(),
            monitor: MonitorConfig::default(),
            valve: ValveConfig::default(),
            publisher: PublisherConfig::default(),
            streaming: StreamingConfig::default(),
            database: DatabaseConfig::default(),
            simulator: SimulatorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load or create default configuration
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();

            // Create parent directories
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            config.save(path)?;
            Ok(config)
        }
    }

    /// Get configuration directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("agrowatch"))
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Get default configuration path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: &str| Err(PipelineError::Config(msg.to_string()));
        let pct = |v: f64| (0.0..=100.0).contains(&v);

        if self.buffer.window_capacity == 0 {
            return fail("buffer.window_capacity must be at least 1");
        }
        if !pct(self.rules.irrigate_below_pct) || !pct(self.rules.target_moisture_pct) {
            return fail("rules thresholds must be percentages");
        }
        if self.rules.min_duration_secs > self.rules.max_duration_secs {
            return fail("rules.min_duration_secs exceeds rules.max_duration_secs");
        }
        if !pct(self.monitor.exit_above_pct) || !pct(self.monitor.critical_moisture_pct) {
            return fail("monitor thresholds must be percentages");
        }
        if self.monitor.exit_above_pct <= self.rules.irrigate_below_pct {
            return fail("monitor.exit_above_pct must be above rules.irrigate_below_pct");
        }
        if self.monitor.consecutive_irrigate == 0 {
            return fail("monitor.consecutive_irrigate must be at least 1");
        }
        if self.monitor.expected_interval_secs == 0 || self.monitor.offline_multiplier == 0 {
            return fail("monitor offline window must be non-zero");
        }
        if !pct(self.valve.close_at_pct) || self.valve.close_at_pct <= self.rules.irrigate_below_pct {
            return fail("valve.close_at_pct must be a percentage above rules.irrigate_below_pct");
        }
        if self.publisher.queue_capacity == 0 || self.publisher.max_attempts == 0 {
            return fail("publisher.queue_capacity and publisher.max_attempts must be non-zero");
        }
        Ok(())
    }
}

/// Reading buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Readings kept per field for the rolling average
    pub window_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            // 30 minutes at a 5-minute cadence
            window_capacity: 6,
        }
    }
}

/// Irrigation rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Irrigate when the rolling average moisture drops below this
    pub irrigate_below_pct: f64,

    /// Moisture level watering aims for
    pub target_moisture_pct: f64,

    /// Shortest recommended watering run
    pub min_duration_secs: u64,

    /// Longest recommended watering run
    pub max_duration_secs: u64,

    /// Seconds of watering per percent of moisture deficit
    pub secs_per_deficit_pct: f64,

    /// Warn when a single evaluation takes longer than this
    pub decision_budget_ms: u64,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            irrigate_below_pct: 30.0,
            target_moisture_pct: 50.0,
            min_duration_secs: 60,
            max_duration_secs: 600,
            // one minute per 5% deficit
            secs_per_deficit_pct: 12.0,
            decision_budget_ms: 1000,
        }
    }
}

impl RuleConfig {
    pub fn decision_budget(&self) -> Duration {
        Duration::from_millis(self.decision_budget_ms)
    }
}

/// Alert monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Consecutive Irrigate decisions before a field starts alerting
    pub consecutive_irrigate: u32,

    /// Latest moisture must exceed this to leave the alerting state
    pub exit_above_pct: f64,

    /// Low moisture alerts below this are critical
    pub critical_moisture_pct: f64,

    /// Expected sensor reporting cadence
    pub expected_interval_secs: u64,

    /// Field goes offline after this many missed intervals
    pub offline_multiplier: u32,

    /// How often workers check for silent sensors
    pub offline_check_interval_secs: u64,

    /// Soil temperature alert threshold
    pub high_soil_temp_c: f64,

    /// Battery voltage alert threshold
    pub low_battery_v: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            consecutive_irrigate: 2,
            exit_above_pct: 35.0,
            critical_moisture_pct: 20.0,
            expected_interval_secs: 300,
            offline_multiplier: 2,
            offline_check_interval_secs: 30,
            high_soil_temp_c: 35.0,
            low_battery_v: 3.3,
        }
    }
}

impl MonitorConfig {
    /// Silence longer than this marks a field offline
    pub fn offline_after(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.expected_interval_secs * self.offline_multiplier as u64) as i64)
    }

    pub fn offline_check_interval(&self) -> Duration {
        Duration::from_secs(self.offline_check_interval_secs.max(1))
    }
}

/// Irrigation valve control
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValveConfig {
    /// Send open/close commands to field valves
    pub enabled: bool,

    /// Close an open valve once moisture reaches this
    pub close_at_pct: f64,

    /// Minimum pause between closing a valve and opening it again
    pub cooldown_secs: u64,
}

impl Default for ValveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            close_at_pct: 65.0,
            cooldown_secs: 900,
        }
    }
}

impl ValveConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Enable database storage
    pub enabled: bool,

    /// Database path
    pub path: PathBuf,

    /// Retention period in days
    pub retention_days: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./data/agrowatch.db"),
            retention_days: 90,
        }
    }
}

/// Simulated field sensors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Field ids, one simulated sensor each
    pub fields: Vec<String>,

    /// Publish interval in seconds
    pub interval_secs: u64,

    /// Starting soil moisture
    pub base_moisture_pct: f64,

    /// Chance per reading that a rain episode starts
    pub rain_probability: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            fields: vec!["field_01".to_string(), "field_02".to_string()],
            interval_secs: 120,
            base_moisture_pct: 45.0,
            rain_probability: 0.05,
        }
    }
}

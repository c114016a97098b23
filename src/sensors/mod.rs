// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Sensor module - reading types, sensor interface and simulation

mod manager;
mod simulator;
mod traits;

pub use manager::SensorManager;
pub use simulator::SoilSensorSimulator;
pub use traits::{Sensor, SensorHealth, SensorReading, SensorStatus};

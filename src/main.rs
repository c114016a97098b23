// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! AgroWatch - edge pipeline for field soil sensors
//!
//! Runs headless on the field gateway:
//! - Subscribes to `farm/+/sensors` and ingests readings per field
//! - Decides irrigation from the rolling moisture average
//! - Raises and resolves low-moisture, offline, rain and battery alerts
//! - Opens and closes field valves
//! - Publishes readings, decisions, alerts and valve commands over MQTT
//! - Keeps a local SQLite history

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn, debug, Level};
use tracing_subscriber::FmtSubscriber;

use agrowatch::{
    core::{Engine, EventBus, Recorder, HISTORY_QUEUE_DEPTH},
    db::Database,
    error::{PipelineError, PipelineResult},
    sensors::{SensorManager, SensorReading},
    streaming::{decode_reading, MqttClient, Publisher, Transport},
    Config, VERSION,
};

/// How long shutdown waits for queued records to reach the broker
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(5);

/// AgroWatch - irrigation decisions and alerts for field soil sensors
#[derive(Parser, Debug)]
#[command(name = "agrowatch")]
#[command(author = "AgroWatch Project")]
#[command(version = VERSION)]
#[command(about = "Edge ingestion, irrigation decision and alerting for field soil sensors")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace-level logging
    #[arg(long)]
    trace: bool,

    /// Demo mode with simulated soil sensors
    #[arg(long)]
    demo: bool,

    /// MQTT broker address (enables MQTT)
    #[arg(long, env = "MQTT_BROKER")]
    mqtt_broker: Option<String>,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT")]
    mqtt_port: Option<u16>,

    /// Data output directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load or create configuration
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_create(&config_path)?;

    // Initialize logging
    let configured_level = config.log_level.parse::<Level>().ok();
    let log_level = if args.trace {
        Level::TRACE
    } else if args.debug {
        Level::DEBUG
    } else {
        configured_level.unwrap_or(Level::INFO)
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(args.debug)
        .with_line_number(args.debug)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("🌱 {} v{} - field sensor edge pipeline", config.app_name, VERSION);
    if configured_level.is_none() {
        warn!("Unknown log_level '{}' in configuration, using info", config.log_level);
    }

    // Override with command line args
    if args.demo {
        config.demo_mode = true;
    }
    if let Some(data_dir) = args.data_dir {
        config.database.path = data_dir.join("agrowatch.db");
        config.data_dir = data_dir;
    }
    if let Some(mqtt) = args.mqtt_broker {
        config.streaming.mqtt_enabled = true;
        config.streaming.mqtt_broker = mqtt;
    }
    if let Some(port) = args.mqtt_port {
        config.streaming.mqtt_port = port;
    }
    config.validate()?;

    info!("Configuration loaded from {:?}", config_path);
    info!("Demo mode: {}", config.demo_mode);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_headless(config))?;

    Ok(())
}

/// Stand-in channel when MQTT is disabled
struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn deliver(&self, topic: &str, payload: &[u8]) -> PipelineResult<()> {
        debug!("{} <- {}", topic, String::from_utf8_lossy(payload));
        Ok(())
    }
}

async fn run_headless(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let (publisher_stop_tx, publisher_stop_rx) = broadcast::channel::<()>(1);
    let event_bus = Arc::new(EventBus::new(1024));

    let mut history = None;
    let recorder_task = if config.database.enabled {
        let db = Database::open(&config.database)?;
        let (recorder, tx) = Recorder::new(db, config.database.retention_days, HISTORY_QUEUE_DEPTH);
        history = Some(tx);
        Some(tokio::spawn(recorder.run()))
    } else {
        info!("History database disabled");
        None
    };

    let publisher = Publisher::new(config.publisher.clone(), &config.streaming.topic_prefix);
    let (ingest_tx, mut ingest_rx) = mpsc::channel::<SensorReading>(1024);

    let mut mqtt = None;
    let transport: Arc<dyn Transport> = if config.streaming.mqtt_enabled {
        let (client, mut inbound) = MqttClient::new(&config.streaming)?;
        let client = Arc::new(client);

        let tx = ingest_tx.clone();
        let prefix = config.streaming.topic_prefix.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                match decode_reading(&message, &prefix) {
                    Ok(reading) => {
                        if tx.send(reading).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping inbound message: {}", e),
                }
            }
        });

        mqtt = Some(client.clone());
        client
    } else {
        info!("MQTT disabled, outbound records are only logged");
        Arc::new(LogTransport)
    };
    // stopped after the engine, so closing valve commands still go out
    let publisher_task = publisher.spawn(transport, publisher_stop_rx);

    let mut engine = Engine::new(config.clone(), event_bus.clone(), publisher.clone());
    if let Some(tx) = history {
        engine = engine.with_history(tx);
    }
    let engine = Arc::new(engine);
    engine.start();

    let ingest_task = {
        let engine = engine.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = ingest_rx.recv() => {
                        let Some(reading) = received else { break };
                        match engine.ingest(reading).await {
                            Ok(()) => {}
                            Err(e) if e.is_record_scoped() => debug!("Reading rejected: {}", e),
                            Err(PipelineError::NotRunning) => break,
                            Err(e) => warn!("Ingest failed: {}", e),
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    };

    let sensor_task = if config.demo_mode {
        let manager = SensorManager::new(config.clone(), ingest_tx.clone(), true).await?;
        let shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move { manager.run(shutdown).await }))
    } else {
        None
    };
    drop(ingest_tx);

    info!("🚀 {} running", config.app_name);
    info!("   Press Ctrl+C to shutdown");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut status = tokio::time::interval(Duration::from_secs(60));
    status.tick().await;

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                break;
            }
            _ = status.tick() => log_status(&engine),
        }
    }

    info!("Shutdown signal received, cleaning up...");
    let _ = shutdown_tx.send(());

    if let Some(task) = sensor_task {
        if let Ok(Err(e)) = task.await {
            warn!("Sensor manager stopped with error: {}", e);
        }
    }
    let _ = ingest_task.await;
    engine.stop().await;

    let backlog = publisher.flush(SHUTDOWN_FLUSH).await;
    let _ = publisher_stop_tx.send(());
    let _ = publisher_task.await;
    if backlog > 0 {
        warn!("{} outbound record(s) were not delivered", backlog);
    }

    if let Some(task) = recorder_task {
        let _ = task.await;
    }
    if let Some(client) = mqtt {
        if let Err(e) = client.disconnect().await {
            debug!("{}", e);
        }
    }

    log_status(&engine);
    info!("{} shutdown complete", config.app_name);

    Ok(())
}

fn log_status(engine: &Engine) {
    let stats = engine.stats();
    info!(
        "fields={} accepted={} rejected={} duplicates={} alerts={} valves={} delivered={} queued={}{}",
        stats.fields,
        stats.readings_accepted,
        stats.readings_rejected,
        stats.duplicates_dropped,
        stats.alerts,
        stats.valve_commands,
        stats.publisher.delivered,
        stats.publisher.queued,
        if stats.publisher.degraded { " (degraded)" } else { "" }
    );

    for field in engine.snapshots() {
        debug!(
            "{}: {:?} avg={:?} min={:?} window={} valve_open={} active={:?}",
            field.field_id,
            field.monitor_state,
            field.rolling_avg_moisture_pct,
            field.min_moisture_pct,
            field.readings_in_window,
            field.valve_open,
            field.active_alerts
        );
    }
}

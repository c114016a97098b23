// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Persists outbound records to the history database
//!
//! Field workers hand every reading, decision, alert and valve command to
//! the recorder over a bounded channel. A full channel makes the worker
//! wait, so a burst slows ingestion down instead of losing history.

use std::time::Duration;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};

use crate::db::Database;
use crate::streaming::OutboundRecord;

const CLEANUP_PERIOD: Duration = Duration::from_secs(3600);

/// Default depth of the history channel
pub const HISTORY_QUEUE_DEPTH: usize = 1024;

/// History writer
pub struct Recorder {
    db: Database,
    records: mpsc::Receiver<OutboundRecord>,
    retention_days: u32,
    stored: u64,
}

impl Recorder {
    /// Create the recorder and the sender that feeds it. The recorder stops
    /// once every sender is dropped and the channel is drained.
    pub fn new(db: Database, retention_days: u32, capacity: usize) -> (Self, mpsc::Sender<OutboundRecord>) {
        let (tx, records) = mpsc::channel(capacity.max(1));
        let recorder = Self {
            db,
            records,
            retention_days,
            stored: 0,
        };
        (recorder, tx)
    }

    pub async fn run(mut self) -> u64 {
        info!("Recorder started (retention {} days)", self.retention_days);
        let mut cleanup = interval_at(Instant::now() + CLEANUP_PERIOD, CLEANUP_PERIOD);

        loop {
            tokio::select! {
                received = self.records.recv() => match received {
                    Some(record) => self.record(&record),
                    None => break,
                },
                _ = cleanup.tick() => {
                    if let Err(e) = self.db.cleanup(self.retention_days, Utc::now()) {
                        error!("History cleanup failed: {}", e);
                    }
                }
            }
        }

        info!("Recorder stopped after storing {} record(s)", self.stored);
        self.stored
    }

    fn record(&mut self, record: &OutboundRecord) {
        match self.db.store_record(record) {
            Ok(true) => self.stored += 1,
            Ok(false) => debug!("Record {} already stored", record.dedup_key()),
            Err(e) => error!("Failed to store record {}: {}", record.dedup_key(), e),
        }
    }
}

// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! MQTT client for inbound sensor data and outbound records

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn, debug};

use super::{StreamingConfig, Transport};
use crate::error::{PipelineError, PipelineResult};
use crate::sensors::SensorReading;

/// MQTT message
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Matches broker PUBACKs to the publish waiting for them.
///
/// rumqttc reports the packet id of a publish only when it is written
/// (`Outgoing::Publish`), in request order. Waiters are queued until their
/// id is known, then parked by id until the broker acknowledges.
#[derive(Default)]
struct AckTracker {
    state: Mutex<AckState>,
}

#[derive(Default)]
struct AckState {
    unassigned: VecDeque<oneshot::Sender<()>>,
    in_flight: HashMap<u16, oneshot::Sender<()>>,
}

impl AckTracker {
    /// Register a publish about to be requested.
    fn expect(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().unassigned.push_back(tx);
        rx
    }

    fn on_outgoing(&self, pkid: u16) {
        let mut state = self.state.lock();
        // waiters that already timed out give up their slot
        while let Some(tx) = state.unassigned.pop_front() {
            if !tx.is_closed() {
                state.in_flight.insert(pkid, tx);
                break;
            }
        }
    }

    fn on_ack(&self, pkid: u16) {
        if let Some(tx) = self.state.lock().in_flight.remove(&pkid) {
            let _ = tx.send(());
        }
    }

    /// Withdraw the newest waiter when its publish never reached the client.
    fn cancel_last(&self) {
        self.state.lock().unassigned.pop_back();
    }

    /// Connection lost: every waiter fails and its record is retried.
    fn fail_all(&self) {
        let mut state = self.state.lock();
        state.unassigned.clear();
        state.in_flight.clear();
    }
}

/// MQTT client wrapper
pub struct MqttClient {
    client: AsyncClient,
    broker: String,
    port: u16,
    connected: Arc<AtomicBool>,
    acks: Arc<AckTracker>,
    ack_timeout: Duration,
}

impl MqttClient {
    /// Create the client and spawn its event loop. Messages on the sensor
    /// subscription arrive on the returned receiver.
    pub fn new(config: &StreamingConfig) -> Result<(Self, mpsc::Receiver<MqttMessage>)> {
        let mut options = MqttOptions::new(
            &config.mqtt_client_id,
            &config.mqtt_broker,
            config.mqtt_port,
        );

        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);

        if let (Some(username), Some(password)) = (&config.mqtt_username, &config.mqtt_password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let connected = Arc::new(AtomicBool::new(false));
        let acks = Arc::new(AckTracker::default());

        let subscription = config.sensor_subscription();
        let resubscriber = client.clone();
        let link = connected.clone();
        let tracker = acks.clone();

        // Spawn eventloop handler
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                        link.store(true, Ordering::SeqCst);
                        // clean session: subscriptions do not survive reconnects
                        if let Err(e) = resubscriber.try_subscribe(&subscription, QoS::AtLeastOnce) {
                            warn!("MQTT subscribe to {} failed: {}", subscription, e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        debug!("MQTT received: {:?}", msg.topic);
                        let message = MqttMessage {
                            topic: msg.topic.clone(),
                            payload: msg.payload.to_vec(),
                        };
                        if inbound_tx.send(message).await.is_err() {
                            debug!("Inbound receiver dropped, stopping MQTT event loop");
                            break;
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => tracker.on_outgoing(pkid),
                    Ok(Event::Incoming(Packet::PubAck(ack))) => tracker.on_ack(ack.pkid),
                    Ok(_) => {}
                    Err(e) => {
                        link.store(false, Ordering::SeqCst);
                        tracker.fail_all();
                        warn!("MQTT error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        info!("MQTT client initialized for {}:{}", config.mqtt_broker, config.mqtt_port);

        Ok((
            Self {
                client,
                broker: config.mqtt_broker.clone(),
                port: config.mqtt_port,
                connected,
                acks,
                ack_timeout: config.ack_timeout(),
            },
            inbound_rx,
        ))
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect()
            .await
            .map_err(|e| anyhow!("MQTT disconnect from {}:{} failed: {}", self.broker, self.port, e))?;

        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MqttClient {
    async fn deliver(&self, topic: &str, payload: &[u8]) -> PipelineResult<()> {
        if !self.is_connected() {
            return Err(PipelineError::Transport(format!(
                "not connected to {}:{}",
                self.broker, self.port
            )));
        }

        let ack = self.acks.expect();
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
        {
            self.acks.cancel_last();
            return Err(PipelineError::Transport(format!("MQTT publish failed: {}", e)));
        }

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PipelineError::Transport(format!(
                "connection to {}:{} lost before PUBACK",
                self.broker, self.port
            ))),
            Err(_) => Err(PipelineError::Transport(format!(
                "no PUBACK for {} within {:?}",
                topic, self.ack_timeout
            ))),
        }
    }
}

/// Field id from a `<prefix>/<field>/sensors` topic
pub fn field_from_topic<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(p), Some(field), Some("sensors"), None) if p == prefix && !field.is_empty() => {
            Some(field)
        }
        _ => None,
    }
}

/// Decode an inbound sensor message. The topic decides the field.
pub fn decode_reading(message: &MqttMessage, prefix: &str) -> PipelineResult<SensorReading> {
    let field_id = field_from_topic(&message.topic, prefix)
        .ok_or_else(|| PipelineError::UnknownTopic(message.topic.clone()))?;

    let mut reading: SensorReading =
        serde_json::from_slice(&message.payload).map_err(|source| PipelineError::Decode {
            topic: message.topic.clone(),
            source,
        })?;

    if !reading.field_id.is_empty() && reading.field_id != field_id {
        debug!(
            "Payload field '{}' differs from topic field '{}', using topic",
            reading.field_id, field_id
        );
    }
    reading.field_id = field_id.to_string();

    Ok(reading)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, payload: &str) -> MqttMessage {
        MqttMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_publish_completes_only_on_matching_puback() {
        let acks = AckTracker::default();
        let mut first = acks.expect();
        let second = acks.expect();

        acks.on_outgoing(7);
        acks.on_outgoing(8);

        // written but unacknowledged is not delivered
        assert!(first.try_recv().is_err());
        acks.on_ack(8);
        assert!(first.try_recv().is_err());
        assert!(second.await.is_ok());

        acks.on_ack(99);
        acks.on_ack(7);
        assert!(first.await.is_ok());
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_publishes() {
        let acks = AckTracker::default();
        let waiting = acks.expect();
        let unwritten = acks.expect();
        acks.on_outgoing(3);

        acks.fail_all();
        assert!(waiting.await.is_err());
        assert!(unwritten.await.is_err());

        // a late ack for a failed publish is ignored
        acks.on_ack(3);
        let next = acks.expect();
        acks.on_outgoing(4);
        acks.on_ack(4);
        assert!(next.await.is_ok());
    }

    #[tokio::test]
    async fn test_timed_out_waiter_does_not_take_next_ack() {
        let acks = AckTracker::default();
        drop(acks.expect());
        let next = acks.expect();
        acks.on_outgoing(5);
        acks.on_ack(5);
        assert!(next.await.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_request_withdraws_waiter() {
        let acks = AckTracker::default();
        let rejected = acks.expect();
        acks.cancel_last();
        assert!(rejected.await.is_err());

        let next = acks.expect();
        acks.on_outgoing(1);
        acks.on_ack(1);
        assert!(next.await.is_ok());
    }

    #[test]
    fn test_field_from_topic() {
        assert_eq!(field_from_topic("farm/field_01/sensors", "farm"), Some("field_01"));
        assert_eq!(field_from_topic("farm/field_01/alerts", "farm"), None);
        assert_eq!(field_from_topic("barn/field_01/sensors", "farm"), None);
        assert_eq!(field_from_topic("farm//sensors", "farm"), None);
        assert_eq!(field_from_topic("farm/a/b/sensors", "farm"), None);
    }

    #[test]
    fn test_decode_uses_topic_field() {
        let msg = message(
            "farm/east/sensors",
            r#"{"field_id":"west","timestamp":"2026-05-01T06:00:00Z",
                "soil_moisture_percent":33.0,"soil_temperature_c":19.0,
                "air_temperature_c":24.0,"air_humidity_percent":50.0,"rain_detected":true}"#,
        );
        let reading = decode_reading(&msg, "farm").unwrap();
        assert_eq!(reading.field_id, "east");
        assert!(reading.rain_detected);
    }

    #[test]
    fn test_decode_errors() {
        let bad_json = message("farm/east/sensors", "{not json");
        assert!(matches!(
            decode_reading(&bad_json, "farm"),
            Err(PipelineError::Decode { .. })
        ));

        let bad_topic = message("farm/east", "{}");
        assert!(matches!(
            decode_reading(&bad_topic, "farm"),
            Err(PipelineError::UnknownTopic(_))
        ));
    }
}

use crate::config::MqttConfig;
use crate::get_id;
use crate::metering_sml::{structs::MeasurementSet, MeasurementSink, SinkError};
use crate::obis_utils::format_obis_pattern;
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{Receiver, Sender};

/// Measurement sets waiting for the broker before new ones are dropped
const QUEUE_DEPTH: usize = 100;

#[derive(Error, Debug)]
pub enum MqttError {
    #[error("Invalid base topic '{0}'")]
    InvalidTopic(String),
    #[error("Unable to serialize metering data: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteringData {
    pub id: String,
    pub meter_name: String,
    pub metered_time: u64,
    pub metered_values: serde_json::Map<String, serde_json::Value>,
    pub obis_codes: serde_json::Map<String, serde_json::Value>,
    pub missing_values: Vec<String>,
}

impl MeteringData {
    pub fn from_measurements(meter_name: &str, set: &MeasurementSet) -> Self {
        let mut metered_values = serde_json::Map::new();
        let mut obis_codes = serde_json::Map::new();

        for reading in set.readings() {
            metered_values.insert(reading.channel.clone(), serde_json::json!(reading.value));
            obis_codes.insert(reading.channel.clone(), serde_json::json!(format_obis_pattern(&reading.obis)));
        }

        MeteringData {
            id: get_id("sml", meter_name),
            meter_name: meter_name.to_string(),
            metered_time: set.metered_time().timestamp().max(0) as u64,
            metered_values,
            obis_codes,
            missing_values: set.missing_channels().iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Topic and payload of every message one measurement set turns into
pub fn build_publications(base_topic: &str, data: &MeteringData) -> Result<Vec<(String, String)>, MqttError> {
    let mut messages = vec![(format!("{}/raw", base_topic), serde_json::to_string(data)?)];
    for (channel, value) in &data.metered_values {
        messages.push((format!("{}/{}", base_topic, channel), value.to_string()));
    }
    Ok(messages)
}

fn validate_base_topic(topic: &str) -> Result<(), MqttError> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(MqttError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

pub struct MqttManager {
    rx: Receiver<MeteringData>,
    client: AsyncClient,
    base_topic: String,
    retain: bool,
}

impl MqttManager {
    /// Connects to the broker in the background and returns the manager
    /// plus the sender the pipeline hands its data to.
    pub fn new(config: &MqttConfig, base_topic: &str) -> Result<(Self, Sender<MeteringData>), MqttError> {
        validate_base_topic(base_topic)?;
        let (mtx, mrx) = tokio::sync::mpsc::channel(QUEUE_DEPTH);

        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let status_topic = format!("{}/status", base_topic);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        mqttoptions.set_last_will(LastWill::new(status_topic.clone(), "offline", QoS::AtLeastOnce, true));
        if let Some(user) = &config.user {
            mqttoptions.set_credentials(user.clone(), config.pass.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        let status_client = client.clone();
        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        let client = status_client.clone();
                        let topic = status_topic.clone();
                        // publishing from inside the eventloop task would deadlock once the queue is full
                        tokio::spawn(async move {
                            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, true, "online").await {
                                error!("Unable to publish status: {}", e);
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok((MqttManager {
            rx: mrx,
            client,
            base_topic: base_topic.to_string(),
            retain: config.retain,
        }, mtx))
    }

    /// Publishes everything received until all senders are dropped.
    pub async fn start_thread(&mut self) {
        while let Some(data) = self.rx.recv().await {
            debug!("Metering data received: {}", data.id);

            let messages = match build_publications(&self.base_topic, &data) {
                Ok(messages) => messages,
                Err(e) => {
                    error!("Dropping {}: {}", data.id, e);
                    continue;
                }
            };

            for (topic, payload) in messages {
                if let Err(e) = self.client.publish(topic, QoS::AtLeastOnce, self.retain, payload).await {
                    error!("Error sending: {}", e);
                }
            }
        }

        info!("All publishers are gone, MQTT thread exits");
    }
}

/// Hands measurement sets to the `MqttManager` without waiting for the broker
pub struct MqttPublisher {
    sender: Sender<MeteringData>,
    meter_name: String,
}

impl MqttPublisher {
    pub fn new(sender: Sender<MeteringData>, meter_name: &str) -> Self {
        Self { sender, meter_name: meter_name.to_string() }
    }
}

impl MeasurementSink for MqttPublisher {
    fn name(&self) -> &str {
        "MQTT"
    }

    fn deliver(&mut self, set: &MeasurementSet) -> Result<(), SinkError> {
        let data = MeteringData::from_measurements(&self.meter_name, set);
        match self.sender.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SinkError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(SinkError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_sml::structs::{ChannelRole, Reading};
    use chrono::{TimeZone, Utc};

    fn reading(channel: &str, obis: &str, value: f64, present: bool) -> Reading {
        Reading {
            channel: channel.to_string(),
            obis: obis.to_string(),
            role: ChannelRole::Instant,
            raw: value as i64,
            value,
            present,
        }
    }

    fn sample_set() -> MeasurementSet {
        let time = Utc.with_ymd_and_hms(2024, 2, 9, 12, 30, 0).unwrap();
        MeasurementSet::new(time, vec![
            reading("total_energy_consumed", "070100010800ff", 123.4567, true),
            reading("current_power", "070100100700ff", -350.0, true),
            reading("active_power_l1", "070100240700ff", 0.0, false),
        ])
    }

    #[test]
    fn test_metering_data_from_measurements() {
        let data = MeteringData::from_measurements("keller", &sample_set());

        assert_eq!(data.meter_name, "keller");
        assert!(data.id.starts_with("sml-keller-"));
        assert_eq!(data.metered_time, 1707481800);
        assert_eq!(data.metered_values["total_energy_consumed"], serde_json::json!(123.4567));
        assert_eq!(data.obis_codes["current_power"], serde_json::json!("1-0:16.7.0*255"));
        assert_eq!(data.missing_values, vec!["active_power_l1"]);
    }

    #[test]
    fn test_build_publications() {
        let data = MeteringData::from_measurements("keller", &sample_set());
        let messages = build_publications("sml2mqtt/keller", &data).unwrap();

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].0, "sml2mqtt/keller/raw");
        let decoded: MeteringData = serde_json::from_str(&messages[0].1).unwrap();
        assert_eq!(decoded, data);

        assert!(messages.contains(&("sml2mqtt/keller/total_energy_consumed".to_string(), "123.4567".to_string())));
        assert!(messages.contains(&("sml2mqtt/keller/current_power".to_string(), "-350.0".to_string())));
        assert!(messages.contains(&("sml2mqtt/keller/active_power_l1".to_string(), "0.0".to_string())));
    }

    #[test]
    fn test_base_topic_validation() {
        assert!(validate_base_topic("sml2mqtt/keller").is_ok());
        assert!(matches!(validate_base_topic(""), Err(MqttError::InvalidTopic(_))));
        assert!(matches!(validate_base_topic("sml2mqtt/+"), Err(MqttError::InvalidTopic(_))));
        assert!(matches!(validate_base_topic("sml2mqtt/#"), Err(MqttError::InvalidTopic(_))));
    }

    #[test]
    fn test_publisher_queue() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let mut publisher = MqttPublisher::new(tx, "keller");
        let set = sample_set();

        publisher.deliver(&set).unwrap();
        assert!(matches!(publisher.deliver(&set), Err(SinkError::QueueFull)));

        let data = rx.try_recv().unwrap();
        assert_eq!(data.meter_name, "keller");

        drop(rx);
        assert!(matches!(publisher.deliver(&set), Err(SinkError::Disconnected)));
    }
}

//! Reads SML telegrams pushed by German smart meters over their optical
//! interface and forwards the decoded registers to MQTT and local CSV files.
//!
//! The pipeline is `FrameReader` (synchronisation), CRC16/X25 validation
//! and `ObisExtractor` (pattern search plus fixed offsets), driven by
//! `SmlManager`.

pub mod config;
pub mod metering_sml;
pub mod mqtt;
pub mod obis_utils;
pub mod storage;

// Re-export common types for easier access
pub use config::Config;
pub use metering_sml::SmlManager;
pub use metering_sml::parser::ObisExtractor;
pub use metering_sml::reader::FrameReader;
pub use mqtt::{MeteringData, MqttManager, MqttPublisher};
pub use storage::SplitStorage;

pub fn get_unix_ts() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

pub fn get_id(protocol: &str, meter_name: &str) -> String {
    format!("{}-{}-{}", protocol, meter_name, get_unix_ts())
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// SML escape sequence opening every telegram
pub const SML_START_SEQUENCE: [u8; 8] = [0x1B, 0x1B, 0x1B, 0x1B, 0x01, 0x01, 0x01, 0x01];

/// Bytes at the end of a telegram carrying the CRC16/X25 checksum
pub const SML_CHECKSUM_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterModel {
    IskraMt681,    // Iskraemeco MT681, 456 byte telegrams
    EmhEhzb,       // EMH eHZ-B, 760 byte telegrams
    Custom,        // Table supplied by the configuration
}

impl MeterModel {
    pub fn name(&self) -> &'static str {
        match self {
            MeterModel::IskraMt681 => "iskra_mt681",
            MeterModel::EmhEhzb => "emh_ehzb",
            MeterModel::Custom => "custom",
        }
    }
}

/// What a channel measures, used to route readings to the time-series stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    Consumption,   // energy drawn from the grid (1.8.x)
    FeedIn,        // energy delivered to the grid (2.8.x)
    Power,         // signed active power, negative while feeding in
    Instant,       // voltage, current and friends; published only
}

/// How to treat an OBIS pattern found at the very first hex digit.
///
/// The logger this crate replaces could not tell "found at 0" from
/// "not found" and reported both as a zero reading. `TreatAsAbsent`
/// keeps that behaviour, `Accept` decodes the field normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMatchPolicy {
    #[default]
    TreatAsAbsent,
    Accept,
}

fn offset_spec_divisor_default() -> f64 { 1.0 }
fn offset_spec_role_default() -> ChannelRole { ChannelRole::Instant }

/// Locates one measurement inside the hex representation of a telegram.
///
/// `byte_offset` and `digit_length` are both counted in hex digits,
/// the offset relative to the first digit of `obis_pattern`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetSpec {
    pub channel: String,
    pub obis_pattern: String,
    pub byte_offset: usize,
    pub digit_length: usize,
    #[serde(default="offset_spec_divisor_default")]
    pub divisor: f64,
    #[serde(default="offset_spec_role_default")]
    pub role: ChannelRole,
}

impl OffsetSpec {
    pub fn new(channel: &str, obis_pattern: &str, byte_offset: usize, digit_length: usize, divisor: f64, role: ChannelRole) -> Self {
        OffsetSpec {
            channel: channel.to_string(),
            obis_pattern: obis_pattern.to_string(),
            byte_offset,
            digit_length,
            divisor,
            role,
        }
    }
}

/// One complete telegram as captured from the transport, start sequence included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTelegram {
    data: Vec<u8>,
}

impl RawTelegram {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A telegram whose checksum matched. Only the validator hands these out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidTelegram {
    data: Vec<u8>,
}

impl ValidTelegram {
    pub(super) fn from_checked(telegram: RawTelegram) -> Self {
        Self { data: telegram.data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Lowercase hex digits, two per byte, in byte order
    pub fn to_hex(&self) -> String {
        hex::encode(&self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub channel: String,
    pub obis: String,
    pub role: ChannelRole,
    pub raw: i64,
    pub value: f64,
    /// false when the pattern was not found; `raw` and `value` are zero then
    pub present: bool,
}

/// Decoded readings of one validated telegram, in table order.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSet {
    metered_time: DateTime<Utc>,
    readings: Vec<Reading>,
}

impl MeasurementSet {
    pub(crate) fn new(metered_time: DateTime<Utc>, readings: Vec<Reading>) -> Self {
        Self { metered_time, readings }
    }

    pub fn metered_time(&self) -> DateTime<Utc> {
        self.metered_time
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn get(&self, channel: &str) -> Option<&Reading> {
        self.readings.iter().find(|r| r.channel == channel)
    }

    pub fn by_role(&self, role: ChannelRole) -> impl Iterator<Item = &Reading> {
        self.readings.iter().filter(move |r| r.role == role)
    }

    pub fn missing_channels(&self) -> Vec<&str> {
        self.readings.iter()
            .filter(|r| !r.present)
            .map(|r| r.channel.as_str())
            .collect()
    }
}

use super::structs::*;
use super::utils::hex_to_signed_int;
use crate::obis_utils::format_obis_pattern;
use chrono::Utc;
use log::{debug, warn};

/// Pulls the configured channels out of validated telegrams.
///
/// Telegrams are not decoded as SML lists. Each channel is found by
/// searching its OBIS pattern in the hex digits of the telegram and
/// reading a fixed number of digits at a fixed distance behind it.
pub struct ObisExtractor<'a> {
    channels: &'a [OffsetSpec],
    start_match: StartMatchPolicy,
}

impl<'a> ObisExtractor<'a> {
    pub fn new(channels: &'a [OffsetSpec], start_match: StartMatchPolicy) -> Self {
        Self { channels, start_match }
    }

    pub fn channels(&self) -> &'a [OffsetSpec] {
        self.channels
    }

    pub fn extract(&self, telegram: &ValidTelegram) -> MeasurementSet {
        self.extract_from_hex(&telegram.to_hex())
    }

    pub(crate) fn extract_from_hex(&self, data_hex: &str) -> MeasurementSet {
        let readings = self.channels.iter()
            .map(|spec| self.read_channel(data_hex, spec))
            .collect();
        MeasurementSet::new(Utc::now(), readings)
    }

    fn read_channel(&self, data_hex: &str, spec: &OffsetSpec) -> Reading {
        let raw = parse_obis_value(data_hex, spec, self.start_match);
        if raw.is_none() {
            debug!("{} ({}) not present in telegram, reporting 0",
                   spec.channel, format_obis_pattern(&spec.obis_pattern));
        }

        let present = raw.is_some();
        let raw = raw.unwrap_or(0);
        Reading {
            channel: spec.channel.clone(),
            obis: spec.obis_pattern.clone(),
            role: spec.role,
            raw,
            value: raw as f64 / spec.divisor,
            present,
        }
    }
}

/// Digit index of the first occurrence of `obis_pattern`
pub fn locate_obis(data_hex: &str, obis_pattern: &str, start_match: StartMatchPolicy) -> Option<usize> {
    match data_hex.find(obis_pattern) {
        Some(0) if start_match == StartMatchPolicy::TreatAsAbsent => None,
        position => position,
    }
}

pub fn parse_obis_value(data_hex: &str, spec: &OffsetSpec, start_match: StartMatchPolicy) -> Option<i64> {
    let position = locate_obis(data_hex, &spec.obis_pattern, start_match)?;
    let field = position.checked_add(spec.byte_offset)
        .and_then(|start| Some(start..start.checked_add(spec.digit_length)?))
        .and_then(|range| data_hex.get(range));

    let Some(field) = field else {
        debug!("Field of {} at {} + {} digits runs past the end of the telegram ({} digits)",
               spec.channel, position, spec.byte_offset, data_hex.len());
        return None;
    };

    match hex_to_signed_int(field) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Unable to decode {} from '{}': {}", spec.channel, field, e);
            None
        }
    }
}

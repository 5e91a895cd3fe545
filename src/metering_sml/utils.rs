use super::structs::*;
use super::SmlError;
use crc16::{State, X_25};
use log::debug;

/// Widest field we can decode, 16 hex digits make an i64
pub const MAX_FIELD_DIGITS: usize = 16;

pub fn crc16_x25(data: &[u8]) -> u16 {
    State::<X_25>::calculate(data)
}

/* The checksum trails the telegram, high byte first */
pub fn transmitted_checksum(data: &[u8]) -> Option<u16> {
    if data.len() < SML_CHECKSUM_LEN {
        return None;
    }
    let n = data.len();
    Some(u16::from_be_bytes([data[n - 2], data[n - 1]]))
}

/// Checks the trailing CRC16/X25 and turns the telegram into a `ValidTelegram`.
///
/// The checksum covers every byte but the last two. A mismatch drops the
/// whole telegram, nothing of it must reach the extractor.
pub fn validate_telegram(telegram: RawTelegram) -> Result<ValidTelegram, SmlError> {
    let data = telegram.as_bytes();
    if data.len() <= SML_CHECKSUM_LEN {
        return Err(SmlError::TelegramTooShort(data.len()));
    }

    let payload = &data[..data.len() - SML_CHECKSUM_LEN];
    let calculated = crc16_x25(payload);
    let transmitted = transmitted_checksum(data).ok_or(SmlError::TelegramTooShort(data.len()))?;

    debug!("SML checksum validation: transmitted=0x{:04X}, calculated=0x{:04X}",
           transmitted, calculated);

    if calculated != transmitted {
        return Err(SmlError::ChecksumMismatch { calculated, transmitted });
    }

    Ok(ValidTelegram::from_checked(telegram))
}

/// Decodes a big-endian two's-complement field of 1 to 16 hex digits.
///
/// The field is `4 * hex.len()` bits wide, so `"ffffffff"` is -1 while
/// `"00000000ffffffff"` is 4294967295.
pub fn hex_to_signed_int(hex: &str) -> Result<i64, SmlError> {
    let digits = hex.len();
    if digits == 0 || digits > MAX_FIELD_DIGITS {
        return Err(SmlError::InvalidFieldWidth(digits));
    }
    /* from_str_radix would accept a leading '+' */
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(SmlError::InvalidHex(hex.to_string()));
    }

    let unsigned = u64::from_str_radix(hex, 16)
        .map_err(|_| SmlError::InvalidHex(hex.to_string()))?;

    // shift the sign bit of the field into bit 63 and back to sign extend
    let shift = (64 - 4 * digits) as u32;
    Ok(((unsigned << shift) as i64) >> shift)
}

//! # Heart Rate Measurement Decoder
//!
//! Decodes Heart Rate Measurement (0x2A37) notification payloads.
//!
//! ## Wire Format
//! - byte 0: flags
//! - bytes 1..: BPM as `u8`, or `u16` little-endian when flag bit 0 is set
//! - optional energy-expended and RR-interval fields follow; their values are
//!   ignored, but their presence must agree with the flags
//!
//! Reserved flag bits (5..7) are ignored.
//!
//! Decoding is pure. `decode_at` takes the sample's timestamp explicitly so it
//! can be tested deterministically; `decode` stamps the current instant.

use std::time::Instant;
use bitflags::bitflags;
use uuid::Uuid;
use crate::error::DecodeError;

/// Heart Rate Service (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Heart Rate Measurement characteristic (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MeasurementFlags: u8 {
        const VALUE_U16 = 1 << 0;
        const CONTACT_SUPPORTED = 1 << 1;
        const CONTACT_DETECTED = 1 << 2;
        const ENERGY_EXPENDED = 1 << 3;
        const RR_INTERVALS = 1 << 4;
    }
}

/// One decoded heart-rate notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub bpm: u16,
    /// `None` when the sensor does not report skin contact
    pub contact_detected: Option<bool>,
    pub timestamp: Instant,
}

/// Decode a payload, stamping it with the current instant
pub fn decode(payload: &[u8]) -> Result<Sample, DecodeError> {
    decode_at(payload, Instant::now())
}

pub fn decode_at(payload: &[u8], timestamp: Instant) -> Result<Sample, DecodeError> {
    if payload.len() < 2 {
        return Err(DecodeError::TooShort);
    }

    let raw = payload[0];
    let flags = MeasurementFlags::from_bits_truncate(raw);
    if flags.bits() != raw {
        log::debug!("Ignoring reserved flag bits {:#04x}", raw & !MeasurementFlags::all().bits());
    }

    let (bpm, value_len) = if flags.contains(MeasurementFlags::VALUE_U16) {
        let bytes = payload.get(1..3).ok_or(DecodeError::TooShort)?;
        (u16::from_le_bytes([bytes[0], bytes[1]]), 2)
    } else {
        (u16::from(payload[1]), 1)
    };

    let mut trailing = payload.len() - 1 - value_len;
    if flags.contains(MeasurementFlags::ENERGY_EXPENDED) {
        trailing = trailing.checked_sub(2).ok_or(DecodeError::MalformedFlags(raw))?;
    }
    // RR intervals are u16 each, at least one when flagged.
    if flags.contains(MeasurementFlags::RR_INTERVALS) && (trailing == 0 || trailing % 2 != 0) {
        return Err(DecodeError::MalformedFlags(raw));
    }

    let contact_detected = flags
        .contains(MeasurementFlags::CONTACT_SUPPORTED)
        .then(|| flags.contains(MeasurementFlags::CONTACT_DETECTED));

    Ok(Sample {
        bpm,
        contact_detected,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bpm(payload: &[u8]) -> u16 {
        decode(payload).expect("payload should decode").bpm
    }

    #[test]
    fn test_eight_bit_value_is_second_byte() {
        for value in 0..=u8::MAX {
            assert_eq!(bpm(&[0x00, value]), u16::from(value));
        }
    }

    #[test]
    fn test_sixteen_bit_value_is_little_endian() {
        for value in [0u16, 40, 255, 256, 300, 0x1234, u16::MAX] {
            let [lo, hi] = value.to_le_bytes();
            assert_eq!(bpm(&[0x01, lo, hi]), value);
        }
    }

    #[test]
    fn test_short_payloads_are_rejected() {
        assert_eq!(decode(&[]), Err(DecodeError::TooShort));
        assert_eq!(decode(&[0x00]), Err(DecodeError::TooShort));
        assert_eq!(decode(&[0x01, 0x28]), Err(DecodeError::TooShort));
    }

    #[test]
    fn test_reserved_bits_are_ignored() {
        assert_eq!(bpm(&[0x20, 0x3C]), 60);
        assert_eq!(bpm(&[0x80, 0x3C]), 60);
        let sample = decode(&[0xE3, 0x2C, 0x01]).unwrap();
        assert_eq!(sample.bpm, 300);
        assert_eq!(sample.contact_detected, Some(false));
    }

    #[test]
    fn test_flags_disagreeing_with_length_are_malformed() {
        // energy expended flagged, one byte present
        assert_eq!(decode(&[0x08, 0x3C, 0x10]), Err(DecodeError::MalformedFlags(0x08)));
        // RR intervals flagged, none present
        assert_eq!(decode(&[0x10, 0x3C]), Err(DecodeError::MalformedFlags(0x10)));
        // RR intervals flagged, odd byte count
        assert_eq!(
            decode(&[0x10, 0x3C, 0x20, 0x03, 0x10]),
            Err(DecodeError::MalformedFlags(0x10))
        );
    }

    #[test]
    fn test_contact_only_reported_when_supported() {
        assert_eq!(decode(&[0x00, 60]).unwrap().contact_detected, None);
        assert_eq!(decode(&[0x04, 60]).unwrap().contact_detected, None);
        assert_eq!(decode(&[0x02, 60]).unwrap().contact_detected, Some(false));
        assert_eq!(decode(&[0x06, 60]).unwrap().contact_detected, Some(true));
    }

    #[test]
    fn test_trailing_fields_are_ignored() {
        // energy expended + two RR intervals
        let payload = [0x19, 0x48, 0x00, 0x10, 0x27, 0x20, 0x03, 0x10, 0x03];
        assert_eq!(bpm(&payload), 72);
    }

    #[test]
    fn test_decode_at_uses_given_timestamp() {
        let at = Instant::now();
        let sample = decode_at(&[0x00, 0x3C], at).unwrap();
        assert_eq!(sample.timestamp, at);
        assert_eq!(sample.bpm, 60);
    }

    #[test]
    fn test_measurement_uuid() {
        assert_eq!(
            HEART_RATE_MEASUREMENT_UUID.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
    }
}

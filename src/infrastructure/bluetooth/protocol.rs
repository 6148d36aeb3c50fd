//! Sensor Wire Protocol
//!
//! Fixed binary layouts exchanged with the wearable sensors: the batched
//! telemetry frame they notify, and the sync packet we write back.

use crate::domain::errors::DecodeError;
use crate::domain::models::{ImuReading, Vec3};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Sensor BLE Service UUID (ESP32 firmware default)
pub const SERVICE_UUID: &str = "4fafc201-1fb5-459e-8fcc-c5c9c331914b";

/// Telemetry / sync characteristic UUID
pub const DATA_CHAR_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26a8";

/// Token every sensor puts in its advertised name
pub const DEVICE_NAME_MARKER: &str = "esp32";

/// Bytes per IMU record
pub const READING_SIZE: usize = 44;

/// Records batched into one notification
pub const READINGS_PER_FRAME: usize = 5;

/// Exact telemetry frame length
pub const FRAME_SIZE: usize = READING_SIZE * READINGS_PER_FRAME;

/// Exact sync packet length
pub const SYNC_PACKET_SIZE: usize = 4;

/// Decode a 220-byte telemetry notification
///
/// # Frame Structure (220 bytes)
///
/// Five consecutive 44-byte records, each:
///
/// ```text
/// [0-3]   : Timestamp (u32 little-endian, milliseconds)
/// [4-15]  : Accel X/Y/Z (f32 little-endian, g)
/// [16-27] : Gyro X/Y/Z (f32 little-endian, deg/s)
/// [28-39] : Mag X/Y/Z (f32 little-endian)
/// [40-43] : Temperature (f32 little-endian, °C)
/// ```
///
/// Any other length is rejected as a whole; there are no partial results.
pub fn decode_telemetry_frame(
    bytes: &[u8],
) -> Result<[ImuReading; READINGS_PER_FRAME], DecodeError> {
    if bytes.len() != FRAME_SIZE {
        return Err(DecodeError::UnexpectedLength {
            expected: FRAME_SIZE,
            actual: bytes.len(),
        });
    }

    let mut readings = [ImuReading::default(); READINGS_PER_FRAME];
    for (reading, chunk) in readings.iter_mut().zip(bytes.chunks_exact(READING_SIZE)) {
        *reading = decode_record(chunk);
    }
    Ok(readings)
}

/// Decode a single 44-byte record
pub fn decode_reading(record: &[u8; READING_SIZE]) -> ImuReading {
    decode_record(record)
}

// Caller guarantees `record.len() == READING_SIZE`
fn decode_record(record: &[u8]) -> ImuReading {
    let u32_at = |offset: usize| {
        u32::from_le_bytes([
            record[offset],
            record[offset + 1],
            record[offset + 2],
            record[offset + 3],
        ])
    };
    let f32_at = |offset: usize| f32::from_bits(u32_at(offset));
    let vec3_at = |offset: usize| Vec3::new(f32_at(offset), f32_at(offset + 4), f32_at(offset + 8));

    ImuReading {
        timestamp_ms: u32_at(0),
        accel: vec3_at(4),
        gyro: vec3_at(16),
        mag: vec3_at(28),
        temperature_c: f32_at(40),
    }
}

/// Encode a single reading into its 44-byte record
pub fn encode_reading(reading: &ImuReading) -> [u8; READING_SIZE] {
    let mut record = [0u8; READING_SIZE];
    let fields = [
        reading.accel.x,
        reading.accel.y,
        reading.accel.z,
        reading.gyro.x,
        reading.gyro.y,
        reading.gyro.z,
        reading.mag.x,
        reading.mag.y,
        reading.mag.z,
        reading.temperature_c,
    ];

    record[0..4].copy_from_slice(&reading.timestamp_ms.to_le_bytes());
    for (i, value) in fields.iter().enumerate() {
        let offset = 4 + i * 4;
        record[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
    record
}

/// Encode five readings into a telemetry frame, as the sensor firmware does
pub fn encode_telemetry_frame(readings: &[ImuReading; READINGS_PER_FRAME]) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    for (chunk, reading) in frame.chunks_exact_mut(READING_SIZE).zip(readings) {
        chunk.copy_from_slice(&encode_reading(reading));
    }
    frame
}

/// Encode a sync packet.
///
/// Only the low 32 bits of the timestamp are sent (modulo 2^32); the sensor
/// clock wraps every ~49.7 days.
pub fn encode_sync_packet(timestamp_ms: u64) -> [u8; SYNC_PACKET_SIZE] {
    (timestamp_ms as u32).to_le_bytes()
}

/// Base64 form of a payload, for transports that take text payloads
pub fn payload_base64(payload: &[u8]) -> String {
    STANDARD.encode(payload)
}

/// Lowercase hex dump for raw data logging
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reading(seed: u32) -> ImuReading {
        let s = seed as f32;
        ImuReading {
            timestamp_ms: 1000 + seed,
            accel: Vec3::new(0.01 * s, -0.98, 0.125),
            gyro: Vec3::new(12.5, -3.25 * s, 0.0),
            mag: Vec3::new(31.0, -14.5, 42.0 + s),
            temperature_c: 36.6,
        }
    }

    #[test]
    fn test_rejects_wrong_lengths() {
        for len in [0usize, 1, 4, 44, 219, 221, 440] {
            let bytes = vec![0u8; len];
            assert_eq!(
                decode_telemetry_frame(&bytes),
                Err(DecodeError::UnexpectedLength {
                    expected: 220,
                    actual: len
                })
            );
        }
    }

    #[test]
    fn test_zero_frame_decodes_to_zero_readings() {
        let readings = decode_telemetry_frame(&[0u8; FRAME_SIZE]).unwrap();
        assert_eq!(readings.len(), 5);
        for reading in readings {
            assert_eq!(reading.timestamp_ms, 0);
            assert_eq!(reading.accel, Vec3::default());
            assert_eq!(reading.gyro, Vec3::default());
            assert_eq!(reading.mag, Vec3::default());
            assert_eq!(reading.temperature_c, 0.0);
        }
    }

    #[test]
    fn test_field_offsets() {
        let mut record = [0u8; READING_SIZE];
        record[0..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        record[8..12].copy_from_slice(&(-1.0f32).to_le_bytes()); // accel.y
        record[24..28].copy_from_slice(&250.0f32.to_le_bytes()); // gyro.z
        record[28..32].copy_from_slice(&0.5f32.to_le_bytes()); // mag.x
        record[40..44].copy_from_slice(&21.5f32.to_le_bytes());

        let reading = decode_reading(&record);
        assert_eq!(reading.timestamp_ms, 0xDEADBEEF);
        assert_eq!(reading.accel, Vec3::new(0.0, -1.0, 0.0));
        assert_eq!(reading.gyro, Vec3::new(0.0, 0.0, 250.0));
        assert_eq!(reading.mag, Vec3::new(0.5, 0.0, 0.0));
        assert_eq!(reading.temperature_c, 21.5);
    }

    #[test]
    fn test_record_round_trip_is_bit_exact() {
        let mut reading = sample_reading(7);
        reading.gyro.z = f32::from_bits(0x0000_0001); // subnormal
        reading.mag.y = -0.0;

        let decoded = decode_reading(&encode_reading(&reading));
        assert_eq!(decoded.timestamp_ms, reading.timestamp_ms);
        assert_eq!(decoded.gyro.z.to_bits(), reading.gyro.z.to_bits());
        assert_eq!(decoded.mag.y.to_bits(), reading.mag.y.to_bits());
        assert_eq!(decoded, reading);
    }

    #[test]
    fn test_frame_preserves_record_order() {
        let readings = [0, 1, 2, 3, 4].map(sample_reading);
        let frame = encode_telemetry_frame(&readings);
        assert_eq!(frame.len(), 220);

        let decoded = decode_telemetry_frame(&frame).unwrap();
        let timestamps: Vec<u32> = decoded.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(timestamps, vec![1000, 1001, 1002, 1003, 1004]);
        assert_eq!(decoded, readings);
    }

    #[test]
    fn test_sync_packet_truncates_to_u32() {
        assert_eq!(encode_sync_packet(4_294_967_296 + 1000), encode_sync_packet(1000));
        assert_eq!(encode_sync_packet(1000), [0xE8, 0x03, 0x00, 0x00]);
        assert_eq!(encode_sync_packet(u64::MAX), [0xFF; 4]);
    }

    #[test]
    fn test_payload_text_forms() {
        assert_eq!(payload_base64(&encode_sync_packet(1000)), "6AMAAA==");
        assert_eq!(hex_dump(&[0x00, 0xAB, 0x10]), "00ab10");
    }
}

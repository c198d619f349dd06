//! HeatFlow Peripheral Protocol
//!
//! GATT identifiers and the binary frames exchanged with the sensor.

use crate::domain::error::FrameError;
use crate::domain::models::{AdsConfigFrame, AdsValueFrame, SensorCommand};
use tracing::trace;
use uuid::Uuid;

/// Expand a 16-bit Bluetooth SIG short id into its full UUID
/// (`0000xxxx-0000-1000-8000-00805f9b34fb`).
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Expand a vendor short id into the HEVS base (`0000xxxx-cafe-025a-1700-556f41535653`).
pub const fn vendor_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_cafe_025a_1700_556f_4153_5653)
}

/// Battery service (adopted)
pub const SERVICE_BATTERY: Uuid = sig_uuid(0x180F);
pub const CHAR_BATTERY_LEVEL: Uuid = sig_uuid(0x2A19);

/// Device information service (adopted)
pub const SERVICE_DEVICE_INFORMATION: Uuid = sig_uuid(0x180A);
pub const CHAR_MANUFACTURER_NAME: Uuid = sig_uuid(0x2A29);
pub const CHAR_MODEL_NUMBER: Uuid = sig_uuid(0x2A24);
pub const CHAR_SERIAL_NUMBER: Uuid = sig_uuid(0x2A25);
pub const CHAR_HARDWARE_REVISION: Uuid = sig_uuid(0x2A27);
pub const CHAR_FIRMWARE_REVISION: Uuid = sig_uuid(0x2A26);
pub const CHAR_SOFTWARE_REVISION: Uuid = sig_uuid(0x2A28);

/// Monitor HeatFlow service (vendor)
pub const SERVICE_SENSOR: Uuid = vendor_uuid(0x1011);
/// ADS values, notify only
pub const CHAR_ADS_VALUES: Uuid = vendor_uuid(0x1031);
/// ADS configuration, write with response
pub const CHAR_ADS_CONFIGURATION: Uuid = vendor_uuid(0x1041);
/// Measurement command, write with response
pub const CHAR_COMMAND: Uuid = vendor_uuid(0x1051);

/// ATT error raised when the link must be bonded first
pub const GATT_INSUFFICIENT_AUTHORIZATION: u8 = 0x08;

pub const ADS_VALUES_SIZE: usize = 5;
pub const ADS_CONFIGURATION_SIZE: usize = 3;
pub const COMMAND_SIZE: usize = 1;

/// Encoder/decoder for the three payload shapes of the sensor service.
///
/// # Frame Layouts
///
/// ```text
/// ADS values (5 bytes)
/// [0]     : bit 0     channel
///           bits 1-3  mux
///           bits 4-6  pga
///           bit 7     raw is a float
/// [1-4]   : raw value (i32 little-endian)
///
/// ADS configuration (3 bytes)
/// [0]     : index (i8)
/// [1-2]   : config register (i16 little-endian)
///
/// Command (1 byte)
/// [0]     : command code 0..=4
/// ```
pub struct FrameCodec;

impl FrameCodec {
    pub fn decode_ads_values(bytes: &[u8]) -> Result<AdsValueFrame, FrameError> {
        if bytes.len() != ADS_VALUES_SIZE {
            return Err(FrameError::Size {
                expected: ADS_VALUES_SIZE,
                actual: bytes.len(),
            });
        }

        trace!("ADS values frame: {:02X?}", bytes);

        let header = bytes[0];
        Ok(AdsValueFrame {
            channel: (header & 0x01) as i8,
            mux: ((header >> 1) & 0x07) as i8,
            pga: ((header >> 4) & 0x07) as i8,
            is_float: (header >> 7) & 0x01 == 1,
            raw: Some(i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]])),
        })
    }

    pub fn decode_ads_config(bytes: &[u8]) -> Result<AdsConfigFrame, FrameError> {
        if bytes.len() != ADS_CONFIGURATION_SIZE {
            return Err(FrameError::Size {
                expected: ADS_CONFIGURATION_SIZE,
                actual: bytes.len(),
            });
        }

        Ok(AdsConfigFrame {
            index: bytes[0] as i8,
            config: i16::from_le_bytes([bytes[1], bytes[2]]),
        })
    }

    pub fn encode_ads_config(frame: &AdsConfigFrame) -> [u8; ADS_CONFIGURATION_SIZE] {
        let config = frame.config.to_le_bytes();
        [frame.index as u8, config[0], config[1]]
    }

    pub fn encode_command(command: SensorCommand) -> [u8; COMMAND_SIZE] {
        [command.code()]
    }

    pub fn decode_command(bytes: &[u8]) -> Result<SensorCommand, FrameError> {
        match bytes {
            [code] => SensorCommand::try_from(*code),
            _ => Err(FrameError::Size {
                expected: COMMAND_SIZE,
                actual: bytes.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_expansion() {
        assert_eq!(
            SERVICE_BATTERY.to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            SERVICE_SENSOR.to_string(),
            "00001011-cafe-025a-1700-556f41535653"
        );
    }

    #[test]
    fn test_decode_ads_values_header_bits() {
        let frame = FrameCodec::decode_ads_values(&[0x83, 0x01, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(frame.channel, 1);
        assert_eq!(frame.mux, 1);
        assert_eq!(frame.pga, 0);
        assert!(frame.is_float);
        assert_eq!(frame.raw, Some(1));
    }

    #[test]
    fn test_decode_ads_values_full_fields() {
        // 0b0101_1110: channel 0, mux 7, pga 5, integer
        let frame = FrameCodec::decode_ads_values(&[0x5E, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        assert_eq!(frame.channel, 0);
        assert_eq!(frame.mux, 7);
        assert_eq!(frame.pga, 5);
        assert!(!frame.is_float);
        assert_eq!(frame.raw, Some(-1));
    }

    #[test]
    fn test_decode_ads_values_rejects_every_other_length() {
        let buffer = [0x83u8; 16];
        for len in (0..=16).filter(|&len| len != ADS_VALUES_SIZE) {
            let err = FrameCodec::decode_ads_values(&buffer[..len]).unwrap_err();
            assert_eq!(
                err,
                FrameError::Size {
                    expected: 5,
                    actual: len
                }
            );
        }
    }

    #[test]
    fn test_decode_ads_config() {
        let frame = FrameCodec::decode_ads_config(&[0xFF, 0x34, 0x82]).unwrap();
        assert_eq!(frame.index, -1);
        assert_eq!(frame.config, i16::from_le_bytes([0x34, 0x82]));

        assert!(FrameCodec::decode_ads_config(&[0x01, 0x02]).is_err());
        assert!(FrameCodec::decode_ads_config(&[0x01, 0x02, 0x03, 0x04]).is_err());
    }

    #[test]
    fn test_encode_ads_config_layout() {
        let bytes = FrameCodec::encode_ads_config(&AdsConfigFrame {
            index: 1,
            config: 0x0483,
        });
        assert_eq!(bytes, [0x01, 0x83, 0x04]);
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(FrameCodec::encode_command(SensorCommand::Stop), [0x00]);
        assert_eq!(FrameCodec::encode_command(SensorCommand::Temperature), [0x04]);
        assert_eq!(
            FrameCodec::decode_command(&[0x02]),
            Ok(SensorCommand::SingleAdc)
        );
        assert!(FrameCodec::decode_command(&[]).is_err());
    }
}

//! MIYA frame structure, command resolution and permissive decoding

use crate::crc;
use crate::types::{FunctionCode, ProtocolError};

/// Header byte of every standard frame (and of address queries)
pub const HEADER: u8 = 0xC7;
/// Header byte of an address response
pub const ADDRESS_RESPONSE_HEADER: u8 = 0xAA;
/// Marker at offset 2 of a 7-byte address query
pub const ADDRESS_QUERY_MARKER: u8 = 0xAA;
/// Declared length of a standard frame: every byte before the CRC
pub const PAYLOAD_LEN: u8 = 0x12;
/// Bytes covered by the CRC
pub const CRC_OFFSET: usize = PAYLOAD_LEN as usize;
/// Standard command/status frame size
pub const STANDARD_FRAME_LEN: usize = CRC_OFFSET + 2;
/// Address management frame size
pub const SHORT_FRAME_LEN: usize = 7;

/// Byte offsets within a standard frame
pub mod offset {
    pub const HEADER: usize = 0;
    pub const LENGTH: usize = 1;
    pub const ADDRESS: usize = 2;
    pub const FUNCTION: usize = 3;
    pub const ADDRESS_REPEAT: usize = 4;
    pub const POWER: usize = 5;
    pub const FAN_IN: usize = 6;
    pub const FAN_OUT: usize = 7;
    pub const NEGATIVE_ION: usize = 8;
    pub const SLEEP_MODE: usize = 9;
    pub const AUTO_MANUAL: usize = 10;
    pub const UV_STERILIZATION: usize = 11;
    pub const INNER_CYCLE: usize = 12;
    pub const AUXILIARY_HEAT: usize = 13;
    pub const BYPASS: usize = 14;
    pub const TIMER: usize = 15;
    pub const RESERVED_1: usize = 16;
    pub const RESERVED_2: usize = 17;
    pub const CRC_HI: usize = 18;
    pub const CRC_LO: usize = 19;
}

/// Bind a command template to a device address
///
/// Copies the first 18 bytes of `template`, writes `device_addr` at
/// offsets 2 and 4, and appends the big-endian CRC16. Anything after the
/// 18th byte (a zeroed or stale CRC) is ignored.
pub fn resolve_command(
    template: &[u8],
    device_addr: u8,
) -> Result<[u8; STANDARD_FRAME_LEN], ProtocolError> {
    if template.len() < CRC_OFFSET {
        return Err(ProtocolError::Validation(format!(
            "command template must be at least {CRC_OFFSET} bytes, got {}",
            template.len()
        )));
    }

    let mut frame = [0u8; STANDARD_FRAME_LEN];
    frame[..CRC_OFFSET].copy_from_slice(&template[..CRC_OFFSET]);
    frame[offset::ADDRESS] = device_addr;
    frame[offset::ADDRESS_REPEAT] = device_addr;

    let crc = crc::crc16_bytes(&frame[..CRC_OFFSET]);
    frame[CRC_OFFSET..].copy_from_slice(&crc);
    Ok(frame)
}

/// Classify and decode a received frame
///
/// Never fails: traffic that does not match a known shape comes back as
/// [`FrameView::Unrecognized`] so the caller can log it and move on.
#[must_use]
pub fn decode_frame(raw: &[u8]) -> FrameView {
    match (raw.len(), raw.first().copied()) {
        (STANDARD_FRAME_LEN, Some(HEADER)) => {
            let mut bytes = [0u8; STANDARD_FRAME_LEN];
            bytes.copy_from_slice(raw);
            FrameView::Standard(StandardFrame { bytes })
        }
        (STANDARD_FRAME_LEN, Some(header)) => FrameView::Unrecognized {
            reason: format!("unknown header {header:#04X} on {STANDARD_FRAME_LEN}-byte frame"),
        },
        (SHORT_FRAME_LEN, Some(ADDRESS_RESPONSE_HEADER)) => FrameView::AddressResponse {
            address: raw[3],
        },
        (SHORT_FRAME_LEN, Some(HEADER)) if raw[2] == ADDRESS_QUERY_MARKER => {
            FrameView::AddressQuery { parameter: raw[3] }
        }
        (SHORT_FRAME_LEN, Some(header)) => FrameView::Unrecognized {
            reason: format!("unknown address management frame (header {header:#04X})"),
        },
        (len, _) => FrameView::Unrecognized {
            reason: format!("unexpected frame length {len}"),
        },
    }
}

/// Decoded view of a received frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameView {
    /// 20-byte query response or control acknowledgement
    Standard(StandardFrame),
    /// 7-byte address response carrying the device's bus address
    AddressResponse { address: u8 },
    /// 7-byte address query (usually our own broadcast echoed back)
    AddressQuery { parameter: u8 },
    /// Anything else
    Unrecognized { reason: String },
}

impl FrameView {
    #[must_use]
    pub fn as_standard(&self) -> Option<&StandardFrame> {
        match self {
            FrameView::Standard(frame) => Some(frame),
            _ => None,
        }
    }

    /// Short human-readable classification for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            FrameView::Standard(frame) => match frame.function() {
                FunctionCode::Query => "status query",
                FunctionCode::Control => "status set (control)",
                FunctionCode::Other(_) => "unknown control frame",
            },
            FrameView::AddressResponse { .. } => "address response",
            FrameView::AddressQuery { .. } => "address query",
            FrameView::Unrecognized { .. } => "unrecognized",
        }
    }
}

/// A 20-byte standard frame
///
/// Field accessors return raw bytes; the semantic mapping lives in
/// [`crate::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardFrame {
    bytes: [u8; STANDARD_FRAME_LEN],
}

impl StandardFrame {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; STANDARD_FRAME_LEN] {
        &self.bytes
    }

    #[must_use]
    pub fn byte(&self, offset: usize) -> u8 {
        self.bytes[offset]
    }

    #[must_use]
    pub fn header(&self) -> u8 {
        self.bytes[offset::HEADER]
    }

    #[must_use]
    pub fn length(&self) -> u8 {
        self.bytes[offset::LENGTH]
    }

    #[must_use]
    pub fn address(&self) -> u8 {
        self.bytes[offset::ADDRESS]
    }

    #[must_use]
    pub fn function(&self) -> FunctionCode {
        FunctionCode::from(self.bytes[offset::FUNCTION])
    }

    #[must_use]
    pub fn address_repeat(&self) -> u8 {
        self.bytes[offset::ADDRESS_REPEAT]
    }

    #[must_use]
    pub fn power(&self) -> u8 {
        self.bytes[offset::POWER]
    }

    #[must_use]
    pub fn fan_in(&self) -> u8 {
        self.bytes[offset::FAN_IN]
    }

    #[must_use]
    pub fn fan_out(&self) -> u8 {
        self.bytes[offset::FAN_OUT]
    }

    #[must_use]
    pub fn negative_ion(&self) -> u8 {
        self.bytes[offset::NEGATIVE_ION]
    }

    #[must_use]
    pub fn sleep_mode(&self) -> u8 {
        self.bytes[offset::SLEEP_MODE]
    }

    #[must_use]
    pub fn auto_manual(&self) -> u8 {
        self.bytes[offset::AUTO_MANUAL]
    }

    #[must_use]
    pub fn uv_sterilization(&self) -> u8 {
        self.bytes[offset::UV_STERILIZATION]
    }

    #[must_use]
    pub fn inner_cycle(&self) -> u8 {
        self.bytes[offset::INNER_CYCLE]
    }

    #[must_use]
    pub fn auxiliary_heat(&self) -> u8 {
        self.bytes[offset::AUXILIARY_HEAT]
    }

    #[must_use]
    pub fn bypass(&self) -> u8 {
        self.bytes[offset::BYPASS]
    }

    #[must_use]
    pub fn timer(&self) -> u8 {
        self.bytes[offset::TIMER]
    }

    #[must_use]
    pub fn reserved(&self) -> [u8; 2] {
        [self.bytes[offset::RESERVED_1], self.bytes[offset::RESERVED_2]]
    }

    /// CRC carried in the frame
    #[must_use]
    pub fn crc(&self) -> u16 {
        u16::from_be_bytes([self.bytes[offset::CRC_HI], self.bytes[offset::CRC_LO]])
    }

    /// CRC computed over the first 18 bytes
    #[must_use]
    pub fn expected_crc(&self) -> u16 {
        crc::crc16(&self.bytes[..CRC_OFFSET])
    }

    #[must_use]
    pub fn crc_valid(&self) -> bool {
        self.crc() == self.expected_crc()
    }

    #[must_use]
    pub fn address_consistent(&self) -> bool {
        self.address() == self.address_repeat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hexfmt::decode_hex;

    const QUERY_TEMPLATE: [u8; 18] = [
        0xC7, 0x12, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00,
    ];

    #[test]
    fn test_resolve_known_frame() {
        let frame = resolve_command(&QUERY_TEMPLATE, 0x01).unwrap();
        assert_eq!(
            frame.to_vec(),
            decode_hex("C7 12 01 01 01 00 00 00 00 00 00 00 00 00 00 00 00 00 AE 29").unwrap()
        );
    }

    #[test]
    fn test_resolve_template_too_short() {
        let result = resolve_command(&QUERY_TEMPLATE[..17], 0x01);
        assert!(matches!(result, Err(ProtocolError::Validation(_))));
    }

    #[test]
    fn test_resolve_ignores_stale_crc() {
        let mut with_crc = QUERY_TEMPLATE.to_vec();
        with_crc.extend_from_slice(&[0xDE, 0xAD]);
        assert_eq!(
            resolve_command(&with_crc, 0x05).unwrap(),
            resolve_command(&QUERY_TEMPLATE, 0x05).unwrap()
        );
    }

    #[test]
    fn test_resolve_is_address_injective_and_idempotent() {
        let mut seen = std::collections::HashSet::new();
        for addr in 0..=u8::MAX {
            let first = resolve_command(&QUERY_TEMPLATE, addr).unwrap();
            assert_eq!(first, resolve_command(&QUERY_TEMPLATE, addr).unwrap());
            assert!(seen.insert(first));

            let view = decode_frame(&first);
            let frame = view.as_standard().expect("standard frame");
            assert_eq!(frame.address(), addr);
            assert_eq!(frame.address_repeat(), addr);
            assert!(frame.crc_valid());
        }
    }

    #[test]
    fn test_decode_standard_fields() {
        let raw =
            decode_hex("C7 12 01 01 01 02 03 03 01 01 01 01 01 01 01 01 00 00 8C 2B").unwrap();
        let view = decode_frame(&raw);
        let frame = view.as_standard().unwrap();
        assert_eq!(frame.header(), HEADER);
        assert_eq!(frame.length(), PAYLOAD_LEN);
        assert_eq!(frame.function(), FunctionCode::Query);
        assert_eq!(frame.power(), 0x02);
        assert_eq!((frame.fan_in(), frame.fan_out()), (0x03, 0x03));
        assert_eq!(frame.auto_manual(), 0x01);
        assert_eq!(frame.reserved(), [0x00, 0x00]);
        assert!(frame.crc_valid());
        assert!(frame.address_consistent());
        assert_eq!(view.kind(), "status query");
    }

    #[test]
    fn test_decode_flags_bad_crc_but_still_decodes() {
        let raw =
            decode_hex("C7 12 01 01 01 02 03 03 01 01 01 01 01 01 01 01 00 00 AD DD").unwrap();
        let view = decode_frame(&raw);
        let frame = view.as_standard().unwrap();
        assert!(!frame.crc_valid());
        assert_eq!(frame.crc(), 0xADDD);
        assert_eq!(frame.expected_crc(), 0x8C2B);
        assert_eq!(frame.fan_in(), 0x03);
    }

    #[test]
    fn test_decode_short_frames() {
        assert_eq!(
            decode_frame(&[0xAA, 0x07, 0x00, 0x01, 0x00, 0x00, 0x00]),
            FrameView::AddressResponse { address: 0x01 }
        );
        assert_eq!(
            decode_frame(&[0xC7, 0x07, 0xAA, 0x03, 0x00, 0x00, 0x00]),
            FrameView::AddressQuery { parameter: 0x03 }
        );
        assert!(matches!(
            decode_frame(&[0xC7, 0x07, 0x01, 0x03, 0x00, 0x00, 0x00]),
            FrameView::Unrecognized { .. }
        ));
    }

    #[test]
    fn test_decode_unrecognized() {
        assert!(matches!(decode_frame(&[]), FrameView::Unrecognized { .. }));
        assert!(matches!(
            decode_frame(&[0xC7, 0x12, 0x01]),
            FrameView::Unrecognized { .. }
        ));
        let mut wrong_header = resolve_command(&QUERY_TEMPLATE, 1).unwrap();
        wrong_header[0] = 0xC8;
        assert!(matches!(
            decode_frame(&wrong_header),
            FrameView::Unrecognized { .. }
        ));
    }
}

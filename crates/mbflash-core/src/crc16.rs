//! Modbus-style CRC16 used for image integrity reports.
//!
//! Reflected polynomial 0xA001, initial value 0xFFFF, no final XOR.

use std::fmt;

use crate::ihex::{Record, RecordPolicy, RecordTypeError, payload_records};

const POLYNOMIAL: u16 = 0xA001;
const INITIAL: u16 = 0xFFFF;

/// A computed CRC16 value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc16(u16);

impl Crc16 {
    pub fn value(&self) -> u16 {
        self.0
    }

    pub fn high(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn low(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

impl fmt::Display for Crc16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HEX 0x{:02x},0x{:02x}, DEC {},{}",
            self.high(),
            self.low(),
            self.high(),
            self.low()
        )
    }
}

/// Incremental CRC16 computation.
#[derive(Debug, Clone)]
pub struct Crc16Hasher {
    crc: u16,
}

impl Crc16Hasher {
    pub fn new() -> Self {
        Self { crc: INITIAL }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.crc ^= u16::from(byte);
            for _ in 0..8 {
                let carry = self.crc & 0x0001 != 0;
                self.crc >>= 1;
                if carry {
                    self.crc ^= POLYNOMIAL;
                }
            }
        }
    }

    pub fn finish(&self) -> Crc16 {
        Crc16(self.crc)
    }
}

impl Default for Crc16Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC16 of a byte buffer.
pub fn crc16(bytes: &[u8]) -> Crc16 {
    let mut hasher = Crc16Hasher::new();
    hasher.update(bytes);
    hasher.finish()
}

/// CRC16 over the concatenated payload of every Data record up to the first
/// end-of-file record.
pub fn image_checksum(records: &[Record], policy: RecordPolicy) -> Result<Crc16, RecordTypeError> {
    let mut hasher = Crc16Hasher::new();
    for record in payload_records(records, policy)? {
        hasher.update(record.data_bytes());
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ihex::{RecordType, fixture};
    use crc::{CRC_16_MODBUS, Crc};

    #[test]
    fn test_known_answers() {
        assert_eq!(crc16(&[]).value(), 0xFFFF);
        assert_eq!(crc16(&[0x01, 0x02]).value(), 0xE181);
        assert_eq!(crc16(b"123456789").value(), 0x4B37);
    }

    #[test]
    fn test_matches_reference_implementation() {
        let reference = Crc::<u16>::new(&CRC_16_MODBUS);
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for len in [1usize, 3, 128, 1000] {
            assert_eq!(crc16(&data[..len]).value(), reference.checksum(&data[..len]));
        }
    }

    #[test]
    fn test_incremental_equals_one_shot() {
        let data: Vec<u8> = (0..200u8).collect();
        let mut hasher = Crc16Hasher::new();
        for chunk in data.chunks(13) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finish(), crc16(&data));
    }

    #[test]
    fn test_high_low_and_report() {
        let crc = crc16(&[0x01, 0x02]);
        assert_eq!(crc.high(), 0xE1);
        assert_eq!(crc.low(), 0x81);
        assert_eq!(crc.to_string(), "HEX 0xe1,0x81, DEC 225,129");
    }

    #[test]
    fn test_image_checksum_ignores_non_payload_records() {
        let image: Vec<u8> = (0..64u8).collect();
        let mut records = fixture::records(0, &image, 16);
        records.insert(
            1,
            Record::new(RecordType::StartLinearAddr, 0, vec![0, 0, 0, 0]).unwrap(),
        );
        // Anything after end-of-file is not part of the image.
        records.push(Record::data(0x100, vec![0xAA; 4]).unwrap());

        let crc = image_checksum(&records, RecordPolicy::Skip).unwrap();
        assert_eq!(crc, crc16(&image));
        assert!(image_checksum(&records, RecordPolicy::Reject).is_err());
    }
}

//! Intel-HEX record decoding.
//!
//! One text line holds one record:
//!
//! ```text
//! :LLAAAATT[DD...]CC
//! ```
//!
//! `LL` is the data byte count, `AAAA` the big-endian load address, `TT` the
//! record type, `DD` the data bytes and `CC` the two's-complement of the sum of
//! every byte before it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Largest payload a single record can describe (the byte count is one byte).
pub const MAX_RECORD_DATA: usize = u8::MAX as usize;

/// Fixed-width fields of a record line, used in error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    ByteCount,
    Address,
    RecordType,
    Data,
    Checksum,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::ByteCount => write!(f, "byte count"),
            Field::Address => write!(f, "address"),
            Field::RecordType => write!(f, "record type"),
            Field::Data => write!(f, "data"),
            Field::Checksum => write!(f, "checksum"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IhexError {
    #[error("missing start code ':'")]
    MissingStartCode,

    #[error("{field} field truncated")]
    Truncated { field: Field },

    #[error("{field} field is not hex: {text:?}")]
    InvalidHex { field: Field, text: String },

    #[error("unknown record type 0x{0:02X}")]
    UnknownRecordType(u8),

    #[error("{0} unexpected characters after checksum")]
    TrailingData(usize),

    #[error("record data too long: {0} bytes")]
    DataTooLong(usize),

    #[error("checksum mismatch: record carries 0x{expected:02X}, computed 0x{computed:02X}")]
    ChecksumMismatch { expected: u8, computed: u8 },
}

impl IhexError {
    /// Whether the line was well-formed but its checksum did not verify.
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, IhexError::ChecksumMismatch { .. })
    }
}

/// A decode failure tied to its (1-based) line in the source text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {source}")]
pub struct LineError {
    pub line: usize,
    #[source]
    pub source: IhexError,
}

/// Record types defined by the Intel-HEX format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
    ExtendedSegmentAddr = 0x02,
    StartSegmentAddr = 0x03,
    ExtendedLinearAddr = 0x04,
    StartLinearAddr = 0x05,
}

impl TryFrom<u8> for RecordType {
    type Error = IhexError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => RecordType::Data,
            0x01 => RecordType::EndOfFile,
            0x02 => RecordType::ExtendedSegmentAddr,
            0x03 => RecordType::StartSegmentAddr,
            0x04 => RecordType::ExtendedLinearAddr,
            0x05 => RecordType::StartLinearAddr,
            other => return Err(IhexError::UnknownRecordType(other)),
        })
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::Data => write!(f, "data"),
            RecordType::EndOfFile => write!(f, "end-of-file"),
            RecordType::ExtendedSegmentAddr => write!(f, "extended segment address"),
            RecordType::StartSegmentAddr => write!(f, "start segment address"),
            RecordType::ExtendedLinearAddr => write!(f, "extended linear address"),
            RecordType::StartLinearAddr => write!(f, "start linear address"),
        }
    }
}

/// One decoded Intel-HEX record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    record_type: RecordType,
    address: u16,
    data: Vec<u8>,
    checksum: u8,
}

impl Record {
    /// Build a record, computing its checksum.
    pub fn new(record_type: RecordType, address: u16, data: Vec<u8>) -> Result<Self, IhexError> {
        if data.len() > MAX_RECORD_DATA {
            return Err(IhexError::DataTooLong(data.len()));
        }
        let checksum = record_checksum(record_type as u8, address, &data);
        Ok(Self {
            record_type,
            address,
            data,
            checksum,
        })
    }

    /// Data record at `address`.
    pub fn data(address: u16, data: Vec<u8>) -> Result<Self, IhexError> {
        Self::new(RecordType::Data, address, data)
    }

    /// The `:00000001FF` terminator.
    pub fn end_of_file() -> Self {
        Self {
            record_type: RecordType::EndOfFile,
            address: 0,
            data: Vec::new(),
            checksum: record_checksum(RecordType::EndOfFile as u8, 0, &[]),
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn data_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} record addr 0x{:04X} size {}",
            self.record_type,
            self.address,
            self.data.len()
        )
    }
}

/// Two's-complement of the byte sum, modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    sum_complement(bytes.iter())
}

fn sum_complement<'a>(bytes: impl Iterator<Item = &'a u8>) -> u8 {
    bytes.fold(0u8, |sum, b| sum.wrapping_add(*b)).wrapping_neg()
}

fn record_checksum(type_byte: u8, address: u16, data: &[u8]) -> u8 {
    let [addr_hi, addr_lo] = address.to_be_bytes();
    let header = [data.len() as u8, addr_hi, addr_lo, type_byte];
    sum_complement(header.iter().chain(data.iter()))
}

/// Reads consecutive two-digit hex bytes from a record line.
struct HexCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> HexCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take_byte(&mut self, field: Field) -> Result<u8, IhexError> {
        let end = self.pos + 2;
        let pair = self
            .bytes
            .get(self.pos..end)
            .ok_or(IhexError::Truncated { field })?;
        let value = hex_digit(pair[0])
            .zip(hex_digit(pair[1]))
            .map(|(hi, lo)| (hi << 4) | lo)
            .ok_or_else(|| IhexError::InvalidHex {
                field,
                text: String::from_utf8_lossy(pair).into_owned(),
            })?;
        self.pos = end;
        Ok(value)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Decode one line of Intel-HEX text.
///
/// Surrounding whitespace (including a CRLF `\r`) is ignored. The checksum is
/// verified before the record type is interpreted.
pub fn decode_line(line: &str) -> Result<Record, IhexError> {
    let rest = line
        .trim()
        .strip_prefix(':')
        .ok_or(IhexError::MissingStartCode)?;
    let mut cursor = HexCursor::new(rest.as_bytes());

    let byte_count = cursor.take_byte(Field::ByteCount)?;
    let address = u16::from_be_bytes([
        cursor.take_byte(Field::Address)?,
        cursor.take_byte(Field::Address)?,
    ]);
    let type_byte = cursor.take_byte(Field::RecordType)?;
    let data = (0..byte_count)
        .map(|_| cursor.take_byte(Field::Data))
        .collect::<Result<Vec<_>, _>>()?;
    let expected = cursor.take_byte(Field::Checksum)?;

    if cursor.remaining() > 0 {
        return Err(IhexError::TrailingData(cursor.remaining()));
    }

    let computed = record_checksum(type_byte, address, &data);
    if computed != expected {
        return Err(IhexError::ChecksumMismatch { expected, computed });
    }

    Ok(Record {
        record_type: RecordType::try_from(type_byte)?,
        address,
        data,
        checksum: expected,
    })
}

/// Decode a whole Intel-HEX text, in file order.
///
/// Blank lines are skipped; the first malformed line aborts decoding.
pub fn decode_file(text: &str) -> Result<Vec<Record>, LineError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            decode_line(line).map_err(|source| LineError {
                line: idx + 1,
                source,
            })
        })
        .collect()
}

/// How records other than Data and EndOfFile are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordPolicy {
    /// Log a warning and ignore the record.
    #[default]
    Skip,
    /// Fail with [`RecordTypeError`].
    Reject,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported {record_type} record at 0x{address:04X}")]
pub struct RecordTypeError {
    pub record_type: RecordType,
    pub address: u16,
}

/// Data records up to the first end-of-file record, filtered by `policy`.
pub fn payload_records(
    records: &[Record],
    policy: RecordPolicy,
) -> Result<Vec<&Record>, RecordTypeError> {
    let mut payload = Vec::with_capacity(records.len());
    for record in records {
        match record.record_type() {
            RecordType::EndOfFile => break,
            RecordType::Data => payload.push(record),
            other => match policy {
                RecordPolicy::Skip => warn!(record = %record, "Skipped non-data record"),
                RecordPolicy::Reject => {
                    return Err(RecordTypeError {
                        record_type: other,
                        address: record.address(),
                    });
                }
            },
        }
    }
    Ok(payload)
}

/// Intel-HEX text for test images, written with the `ihex` crate.
#[cfg(test)]
pub(crate) mod fixture {
    /// `bytes` as Data records of `record_len` bytes from `base`, then EOF.
    pub(crate) fn hex_text(base: u16, bytes: &[u8], record_len: usize) -> String {
        let mut records: Vec<::ihex::Record> = bytes
            .chunks(record_len)
            .enumerate()
            .map(|(i, chunk)| ::ihex::Record::Data {
                offset: base.wrapping_add((i * record_len) as u16),
                value: chunk.to_vec(),
            })
            .collect();
        records.push(::ihex::Record::EndOfFile);
        ::ihex::create_object_file_representation(&records).unwrap()
    }

    /// Decoded records of [`hex_text`].
    pub(crate) fn records(base: u16, bytes: &[u8], record_len: usize) -> Vec<super::Record> {
        super::decode_file(&hex_text(base, bytes, record_len)).unwrap()
    }
}

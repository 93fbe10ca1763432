//! Flash page assembly.
//!
//! Turns the ordered Data records of an image into fixed-size pages aligned to
//! page boundaries. The bootloader only accepts whole pages, so every page
//! produced here is exactly `page_size` bytes.

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::ihex::{Record, RecordPolicy, RecordTypeError, payload_records};

/// Page size of the supported bootloaders (64 words).
pub const DEFAULT_PAGE_SIZE: u16 = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error(transparent)]
    RecordType(#[from] RecordTypeError),

    #[error("page size must be non-zero")]
    InvalidPageSize,

    #[error("first byte at 0x{address:04X} is not on a page boundary")]
    Misaligned { address: u32 },

    #[error("page 0x{base:04X} holds {filled} of {capacity} bytes when the next page starts")]
    PageUnderrun {
        base: u16,
        filled: usize,
        capacity: usize,
    },

    #[error("byte at 0x{address:04X} lies outside page 0x{base:04X}..0x{end:04X}")]
    AddressRange { address: u32, base: u16, end: u32 },

    #[error("byte at 0x{address:04X} does not follow 0x{expected:04X}")]
    Discontiguous { address: u32, expected: u32 },

    #[error("address 0x{address:X} does not fit the 16-bit page address")]
    AddressOverflow { address: u32 },

    #[error("image ends inside page 0x{base:04X} ({filled} of {capacity} bytes)")]
    Length {
        base: u16,
        filled: usize,
        capacity: usize,
    },

    #[error("image contains no data")]
    EmptyImage,
}

/// One flash page: a page-aligned base address and its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashPage {
    capacity: usize,
    base: u16,
    buffer: Vec<u8>,
}

impl FlashPage {
    pub fn new(capacity: u16, base: u16) -> Self {
        Self {
            capacity: usize::from(capacity),
            base,
            buffer: Vec::with_capacity(usize::from(capacity)),
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes accumulated so far.
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_complete(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    /// First address past the page.
    pub fn end(&self) -> u32 {
        u32::from(self.base) + self.capacity as u32
    }

    /// Append the byte located at absolute `address`.
    ///
    /// Bytes must arrive in ascending, gap-free address order.
    pub fn append(&mut self, address: u32, byte: u8) -> Result<(), AssemblyError> {
        if address < u32::from(self.base) || address >= self.end() {
            return Err(AssemblyError::AddressRange {
                address,
                base: self.base,
                end: self.end(),
            });
        }
        let expected = u32::from(self.base) + self.buffer.len() as u32;
        if address != expected {
            return Err(AssemblyError::Discontiguous { address, expected });
        }
        self.buffer.push(byte);
        Ok(())
    }
}

impl fmt::Display for FlashPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page addr 0x{:04X} size {}/{}",
            self.base,
            self.buffer.len(),
            self.capacity
        )
    }
}

/// Incremental page builder.
#[derive(Debug)]
pub struct PageAssembler {
    page_size: u16,
    pages: Vec<FlashPage>,
}

impl PageAssembler {
    pub fn new(page_size: u16) -> Result<Self, AssemblyError> {
        if page_size == 0 {
            return Err(AssemblyError::InvalidPageSize);
        }
        Ok(Self {
            page_size,
            pages: Vec::new(),
        })
    }

    /// Feed one byte at absolute `address`.
    pub fn push(&mut self, address: u32, byte: u8) -> Result<(), AssemblyError> {
        if address % u32::from(self.page_size) == 0 {
            if let Some(prev) = self.pages.last()
                && !prev.is_complete()
            {
                return Err(AssemblyError::PageUnderrun {
                    base: prev.base(),
                    filled: prev.size(),
                    capacity: prev.capacity(),
                });
            }
            let base =
                u16::try_from(address).map_err(|_| AssemblyError::AddressOverflow { address })?;
            debug!(base = %format!("0x{:04X}", base), "Starting flash page");
            self.pages.push(FlashPage::new(self.page_size, base));
        }

        let page = self
            .pages
            .last_mut()
            .ok_or(AssemblyError::Misaligned { address })?;
        page.append(address, byte)
    }

    /// Feed every byte of a Data record.
    pub fn push_record(&mut self, record: &Record) -> Result<(), AssemblyError> {
        let start = u32::from(record.address());
        for (offset, &byte) in record.data_bytes().iter().enumerate() {
            self.push(start + offset as u32, byte)?;
        }
        Ok(())
    }

    /// Close assembly, requiring the last page to be complete.
    pub fn finish(self) -> Result<Vec<FlashPage>, AssemblyError> {
        match self.pages.last() {
            None => Err(AssemblyError::EmptyImage),
            Some(last) if !last.is_complete() => Err(AssemblyError::Length {
                base: last.base(),
                filled: last.size(),
                capacity: last.capacity(),
            }),
            Some(_) => Ok(self.pages),
        }
    }
}

/// Assemble the Data records of an image into complete flash pages.
pub fn assemble(
    records: &[Record],
    page_size: u16,
    policy: RecordPolicy,
) -> Result<Vec<FlashPage>, AssemblyError> {
    let mut assembler = PageAssembler::new(page_size)?;
    for record in payload_records(records, policy)? {
        assembler.push_record(record)?;
    }
    assembler.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ihex::{RecordType, fixture};

    fn data(address: u16, len: usize, fill: u8) -> Record {
        Record::data(address, vec![fill; len]).unwrap()
    }

    #[test]
    fn test_two_contiguous_pages() {
        let image: Vec<u8> = (0..256u16).map(|i| i as u8).collect();
        let records = fixture::records(0x0000, &image, 16);

        let pages = assemble(&records, 128, RecordPolicy::Skip).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].base(), 0x0000);
        assert_eq!(pages[1].base(), 0x0080);
        assert!(pages.iter().all(FlashPage::is_complete));
        assert_eq!(pages[0].data(), &image[..128]);
        assert_eq!(pages[1].data(), &image[128..]);
    }

    #[test]
    fn test_record_spanning_page_boundary() {
        let records = vec![data(0x0000, 0x70, 1), data(0x0070, 0x20, 2), data(0x0090, 0x70, 3)];
        let pages = assemble(&records, 128, RecordPolicy::Skip).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].data()[0x6F], 1);
        assert_eq!(pages[0].data()[0x7F], 2);
        assert_eq!(pages[1].data()[0x0F], 2);
        assert_eq!(pages[1].data()[0x10], 3);
    }

    #[test]
    fn test_third_page_before_second_is_full() {
        let records = vec![data(0x0000, 128, 0), data(0x0080, 64, 0), data(0x0100, 16, 0)];
        let err = assemble(&records, 128, RecordPolicy::Skip).unwrap_err();
        assert_eq!(
            err,
            AssemblyError::PageUnderrun {
                base: 0x0080,
                filled: 64,
                capacity: 128
            }
        );
    }

    #[test]
    fn test_byte_outside_current_page() {
        let records = vec![data(0x0000, 16, 0), data(0x0090, 16, 0)];
        let err = assemble(&records, 128, RecordPolicy::Skip).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::AddressRange {
                address: 0x90,
                base: 0,
                end: 0x80
            }
        ));
    }

    #[test]
    fn test_gap_inside_page() {
        let records = vec![data(0x0000, 16, 0), data(0x0020, 16, 0)];
        let err = assemble(&records, 128, RecordPolicy::Skip).unwrap_err();
        assert_eq!(
            err,
            AssemblyError::Discontiguous {
                address: 0x20,
                expected: 0x10
            }
        );
    }

    #[test]
    fn test_unaligned_start() {
        let records = vec![data(0x0010, 16, 0)];
        let err = assemble(&records, 128, RecordPolicy::Skip).unwrap_err();
        assert_eq!(err, AssemblyError::Misaligned { address: 0x10 });
    }

    #[test]
    fn test_truncated_image() {
        let records = vec![data(0x0000, 100, 0), Record::end_of_file()];
        let err = assemble(&records, 128, RecordPolicy::Skip).unwrap_err();
        assert_eq!(
            err,
            AssemblyError::Length {
                base: 0,
                filled: 100,
                capacity: 128
            }
        );
    }

    #[test]
    fn test_empty_image() {
        let records = vec![Record::end_of_file()];
        assert_eq!(
            assemble(&records, 128, RecordPolicy::Skip),
            Err(AssemblyError::EmptyImage)
        );
    }

    #[test]
    fn test_page_past_16_bit_space() {
        let records = vec![data(0xFF80, 0x90, 0)];
        let err = assemble(&records, 128, RecordPolicy::Skip).unwrap_err();
        assert_eq!(err, AssemblyError::AddressOverflow { address: 0x10000 });
    }

    #[test]
    fn test_zero_page_size() {
        assert_eq!(
            assemble(&[], 0, RecordPolicy::Skip),
            Err(AssemblyError::InvalidPageSize)
        );
    }

    #[test]
    fn test_record_policy_is_honoured() {
        let records = vec![
            Record::new(RecordType::ExtendedSegmentAddr, 0, vec![0, 0]).unwrap(),
            data(0x0000, 128, 0),
            Record::end_of_file(),
        ];
        assert_eq!(assemble(&records, 128, RecordPolicy::Skip).unwrap().len(), 1);
        assert!(matches!(
            assemble(&records, 128, RecordPolicy::Reject),
            Err(AssemblyError::RecordType(_))
        ));
    }

    #[test]
    fn test_end_of_file_stops_assembly() {
        let records = vec![data(0x0000, 128, 0), Record::end_of_file(), data(0x0080, 8, 0)];
        assert_eq!(assemble(&records, 128, RecordPolicy::Skip).unwrap().len(), 1);
    }
}

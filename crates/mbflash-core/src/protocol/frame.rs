//! Request and reply frame schema.
//!
//! A request batch is serialized as one JSON array; each element is an
//! object with the keys `slave`, `fcode`, `addr`, `count` and the optional
//! `value` and `timeout_ms`. Replies use the same keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unknown function code {0}")]
pub struct UnknownFunctionCode(pub u8);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("slave id must be 1..=255")]
pub struct InvalidSlaveId;

/// Register protocol function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FunctionCode {
    ReadHoldingRegisters,
    WriteRegister,
    WriteMultiRegister,
    ReadBytes,
    WriteBytes,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadHoldingRegisters => FCODE_READ_HOLDING_REGISTERS,
            FunctionCode::WriteRegister => FCODE_WRITE_REGISTER,
            FunctionCode::WriteMultiRegister => FCODE_WRITE_MULTI_REGISTER,
            FunctionCode::ReadBytes => FCODE_READ_BYTES,
            FunctionCode::WriteBytes => FCODE_WRITE_BYTES,
        }
    }

    /// Whether the reply to this function carries a `value`.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadBytes
        )
    }
}

impl From<FunctionCode> for u8 {
    fn from(function: FunctionCode) -> Self {
        function.code()
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = UnknownFunctionCode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            FCODE_READ_HOLDING_REGISTERS => FunctionCode::ReadHoldingRegisters,
            FCODE_WRITE_REGISTER => FunctionCode::WriteRegister,
            FCODE_WRITE_MULTI_REGISTER => FunctionCode::WriteMultiRegister,
            FCODE_READ_BYTES => FunctionCode::ReadBytes,
            FCODE_WRITE_BYTES => FunctionCode::WriteBytes,
            other => return Err(UnknownFunctionCode(other)),
        })
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionCode::ReadHoldingRegisters => write!(f, "read-holding-registers"),
            FunctionCode::WriteRegister => write!(f, "write-register"),
            FunctionCode::WriteMultiRegister => write!(f, "write-multi-register"),
            FunctionCode::ReadBytes => write!(f, "read-bytes"),
            FunctionCode::WriteBytes => write!(f, "write-bytes"),
        }
    }
}

/// Device id on the bus; 0 (broadcast) is never a valid target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub struct SlaveId(u8);

impl SlaveId {
    pub fn new(id: u8) -> Option<Self> {
        (id != 0).then_some(Self(id))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl From<SlaveId> for u8 {
    fn from(slave: SlaveId) -> Self {
        slave.0
    }
}

impl TryFrom<u8> for SlaveId {
    type Error = InvalidSlaveId;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidSlaveId)
    }
}

impl fmt::Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One register operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub slave: SlaveId,
    #[serde(rename = "fcode")]
    pub function: FunctionCode,
    #[serde(rename = "addr")]
    pub address: u16,
    pub count: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u32>,
}

impl RequestFrame {
    /// Write `value` at `address`; `count` is the value length.
    pub fn write(slave: SlaveId, function: FunctionCode, address: u16, value: Vec<u8>) -> Self {
        Self {
            slave,
            function,
            address,
            count: value.len() as u16,
            value: Some(value),
            timeout_ms: None,
        }
    }

    /// Read `count` units at `address`.
    pub fn read(slave: SlaveId, function: FunctionCode, address: u16, count: u16) -> Self {
        Self {
            slave,
            function,
            address,
            count,
            value: None,
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: Option<u32>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// One element of a reply batch.
///
/// Only `slave` is mandatory; `value` is present for read operations. Values
/// are kept as wide integers so out-of-range items can be reported instead of
/// failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub slave: u8,
    #[serde(rename = "fcode", default, skip_serializing_if = "Option::is_none")]
    pub function: Option<u8>,
    #[serde(rename = "addr", default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<i64>>,
}

impl ReplyFrame {
    /// Acknowledge `request` without data, as a worker does for writes.
    pub fn echo(request: &RequestFrame) -> Self {
        Self {
            slave: request.slave.get(),
            function: Some(request.function.code()),
            address: Some(request.address),
            count: Some(request.count),
            value: None,
        }
    }

    pub fn with_value(mut self, value: Vec<i64>) -> Self {
        self.value = Some(value);
        self
    }
}

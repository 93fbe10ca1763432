//! Protocol module - register protocol frames, revisions and codec.

pub mod codec;
pub mod constants;
pub mod frame;
pub mod register_map;

pub use codec::{CodecError, ExchangeError, RequestCodec};
pub use constants::*;
pub use frame::{FunctionCode, ReplyFrame, RequestFrame, SlaveId};
pub use register_map::{
    ConfigError, ControlFlag, ControlFlags, Endianness, ProtocolRevision, RegisterMap,
    ReplyConvention,
};

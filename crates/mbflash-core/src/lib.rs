//! mbflash-core: Intel-HEX firmware flashing over a register-protocol
//! bootloader.
//!
//! The firmware image is decoded and cut into flash pages up front; the
//! pages are then written one by one through a broker transport, with the
//! device's own progress counter checked before every page.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Image**: Intel-HEX records (`ihex`), flash pages (`page`), CRC16 (`crc16`)
//! - **Protocol**: Frames, protocol revisions as data, request codec
//! - **Transport**: Broker RPC abstraction (MDP client, mock, device emulator)
//! - **State**: Update phases and per-page protocol steps
//! - **Events**: Observer pattern for front-end decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use mbflash_core::session::{SessionConfig, UpdateSession};
//! use mbflash_core::transport::{Endpoint, MockTransport};
//!
//! let config = SessionConfig::new(
//!     "firmware.hex",
//!     Endpoint::new("tcp://localhost:5555", "rtu"),
//!     1,
//! );
//!
//! let session = UpdateSession::new(config, MockTransport::new());
//! session.run().expect("update failed");
//! ```

pub mod crc16;
pub mod events;
pub mod ihex;
pub mod page;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use crc16::{Crc16, crc16, image_checksum};
pub use events::{LogLevel, NullObserver, TracingObserver, UpdateEvent, UpdateObserver};
pub use ihex::{Record, RecordPolicy, RecordType, decode_file, decode_line};
pub use page::{AssemblyError, DEFAULT_PAGE_SIZE, FlashPage, assemble};
pub use protocol::{ProtocolRevision, RequestCodec, SlaveId};
pub use session::{SessionConfig, UpdateError, UpdateSession, UpdateSummary};
pub use state::UpdatePhase;
pub use transport::{Endpoint, MockTransport, RpcTransport, TransportError};

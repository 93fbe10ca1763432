//! Transport layer module.

pub mod emulator;
#[cfg(feature = "mdp")]
pub mod mdp;
pub mod mock;
pub mod traits;

pub use emulator::{DeviceEmulator, DeviceOp};
#[cfg(feature = "mdp")]
pub use mdp::MdpTransport;
pub use mock::{MockTransport, RecordedCall};
pub use traits::{Endpoint, RpcTransport, TransportError};

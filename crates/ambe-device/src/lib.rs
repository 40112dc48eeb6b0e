//! AMBE device abstractions.
//!
//! Devices come in two flavors distinguished by their ordering contract:
//! [`FifoDevice`] answers requests strictly in submission order (a chip on a
//! local UART), while [`TaggingDevice`] correlates responses by a 32-bit tag
//! (a chip shared through a remote server). Optional capabilities like hard
//! reset are discovered at bind time rather than assumed.

pub mod error;
pub mod manager;
pub mod traits;
pub mod uart;
pub mod uri;

pub use error::{DeviceError, Result};
pub use manager::ChannelManager;
pub use traits::{
    CallbackSlot, Device, FifoCallback, FifoDevice, HardReset, ParityFlag, TaggedCallback,
    TaggingDevice,
};
pub use uart::UartDevice;
pub use uri::DeviceUri;

//! Byte-stream plumbing underneath AMBE devices.
//!
//! Two concerns live here: turning a raw byte stream into whole chip packets
//! with reads that can be interrupted from another thread, and configuring
//! the USB-to-serial adapters the chips sit behind.

pub mod error;
pub mod framed;
pub mod serial;

pub use error::{Result, TransportError};
pub use framed::{send_all, wake_pipe, FrameReceiver, WakeHandle};
pub use serial::SerialPort;

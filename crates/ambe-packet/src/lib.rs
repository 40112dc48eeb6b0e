//! Framed packet codec for DVSI AMBE vocoder chips.
//!
//! Every message exchanged with the chip is framed with:
//! - A 1-byte start marker (0x61) for stream synchronization
//! - A 2-byte big-endian payload length
//! - A 1-byte packet type (control / channel / speech)
//! - A sequence of typed fields
//! - An optional 2-byte XOR parity trailer
//!
//! All multi-byte integers on the wire are big-endian; the chip side is a
//! big-endian DSP. Parsing never reinterprets raw buffers as structs — every
//! field is read through bounds-checked accessors.

pub mod error;
pub mod field;
pub mod packet;

pub use error::{PacketError, Result};
pub use field::{channel_field, channel_of, FieldKind, ModeFlags, PacketType};
pub use packet::{FieldReader, Packet, HEADER_SIZE, PARITY_SIZE, START_BYTE};

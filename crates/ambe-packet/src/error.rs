use crate::field::PacketType;

/// Errors that can occur while encoding or decoding AMBE packets.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// The buffer is shorter than a packet header.
    #[error("packet too short ({len} bytes, header needs {min})")]
    TooShort { len: usize, min: usize },

    /// The first byte is not the 0x61 start marker.
    #[error("invalid start byte 0x{byte:02x} (expected 0x61)")]
    InvalidStartByte { byte: u8 },

    /// The header length field disagrees with the actual payload length.
    #[error("declared payload length {declared} does not match actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// The packet type byte is not control, channel, or speech.
    #[error("unknown packet type 0x{byte:02x}")]
    UnknownPacketType { byte: u8 },

    /// A parity trailer was expected but the last field is not one.
    #[error("missing parity field at end of packet")]
    MissingParityField,

    /// The stored parity byte does not match the recomputed XOR.
    #[error("parity mismatch (stored 0x{stored:02x}, computed 0x{computed:02x})")]
    ParityMismatch { stored: u8, computed: u8 },

    /// The packet carries no parity trailer.
    #[error("packet has no parity field")]
    NoParity,

    /// A channel selector outside the chip's range.
    #[error("invalid channel number {channel} (chip has channels 0-2)")]
    InvalidChannel { channel: u8 },

    /// A field payload exceeds what its count byte can describe.
    #[error("{what} count {count} exceeds field maximum {max}")]
    FieldTooLarge {
        what: &'static str,
        count: usize,
        max: usize,
    },

    /// The payload ended inside a field.
    #[error("packet payload truncated while reading {what}")]
    Truncated { what: &'static str },

    /// A response field of a different type than the request implies.
    #[error("unexpected field type 0x{found:02x} (expected 0x{expected:02x})")]
    UnexpectedField { expected: u8, found: u8 },

    /// Typed accessor called on the wrong packet type.
    #[error("wrong packet type {found:?} (expected {expected:?})")]
    WrongPacketType {
        expected: PacketType,
        found: PacketType,
    },
}

pub type Result<T> = std::result::Result<T, PacketError>;

use crate::error::{PacketError, Result};

/// Packet type carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Device and channel configuration requests and their status responses.
    Control = 0x00,
    /// Compressed AMBE channel bits.
    Channel = 0x01,
    /// Linear PCM speech samples.
    Speech = 0x02,
}

impl PacketType {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(PacketType::Control),
            0x01 => Ok(PacketType::Channel),
            0x02 => Ok(PacketType::Speech),
            byte => Err(PacketError::UnknownPacketType { byte }),
        }
    }
}

/// Field type tags defined by the chip's serial protocol.
///
/// The full catalogue is listed even though the driver only builds requests
/// for a subset; responses may reference any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldKind {
    /// Speech samples (count byte + 16-bit big-endian samples).
    Spchd = 0x00,
    /// AMBE channel bits (bit count byte + packed bytes).
    Chand = 0x01,
    /// Encoder cmode flags for the current channel.
    EcMode = 0x05,
    /// Decoder cmode flags for the current channel.
    DcMode = 0x06,
    /// Select a rate from the built-in table for the current channel.
    RateT = 0x09,
    /// Select a custom rate for the current channel.
    RateP = 0x0a,
    /// Initialize encoder and/or decoder for the current channel.
    Init = 0x0b,
    /// Enable or disable low-power mode.
    LowPower = 0x10,
    /// Set the format of output channel packets.
    ChanFmt = 0x15,
    /// Set the format of output speech packets.
    SpchFmt = 0x16,
    /// Per-packet parity trailer.
    Parity = 0x2f,
    /// Query product identification.
    ProdId = 0x30,
    /// Query product version string.
    VerString = 0x31,
    /// Companding on/off and a-law/µ-law selection.
    Compand = 0x32,
    /// Reset the device using the hardware configuration pins.
    Reset = 0x33,
    /// Reset the device with software configuration.
    ResetSoftCfg = 0x34,
    /// Enter the lowest power mode.
    Halt = 0x35,
    /// Query configuration pin state at power-up or reset.
    GetCfg = 0x36,
    /// Query current configuration pin state.
    ReadCfg = 0x37,
    /// Device is ready to receive packets.
    Ready = 0x39,
    /// Enable (default) or disable parity trailers.
    ParityMode = 0x3f,
    /// Subsequent fields target channel 0.
    Channel0 = 0x40,
    /// Subsequent fields target channel 1.
    Channel1 = 0x41,
    /// Subsequent fields target channel 2.
    Channel2 = 0x42,
    /// Delay the next control field (microseconds).
    DelayNUs = 0x49,
    /// Delay the next control field (nanoseconds).
    DelayNNs = 0x4a,
    /// Input/output gain between +90 and -90 dB.
    Gain = 0x4b,
    /// Flow control thresholds.
    RtsThresh = 0x4e,
}

impl FieldKind {
    pub const fn byte(self) -> u8 {
        self as u8
    }
}

/// Field tag selecting the given chip channel.
pub fn channel_field(channel: u8) -> Result<FieldKind> {
    match channel {
        0 => Ok(FieldKind::Channel0),
        1 => Ok(FieldKind::Channel1),
        2 => Ok(FieldKind::Channel2),
        channel => Err(PacketError::InvalidChannel { channel }),
    }
}

/// Channel index for a channel selector tag, if the byte is one.
pub fn channel_of(byte: u8) -> Option<u8> {
    match byte {
        0x40..=0x42 => Some(byte - 0x40),
        _ => None,
    }
}

/// Encoder/decoder cmode flags carried by ECMODE and DCMODE fields.
///
/// Packed one flag per low bit into the field's single parameter byte; see
/// DESIGN.md for how this layout was chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeFlags {
    /// Noise suppression enable.
    pub noise_suppression: bool,
    /// Compand select (a-law when set).
    pub compand_select: bool,
    /// Compand enable.
    pub compand_enable: bool,
    /// Discontinuous transmit enable.
    pub dtx_enable: bool,
    /// Tone detection enable.
    pub tone_detect: bool,
    /// Tone send enable.
    pub tone_send: bool,
}

impl ModeFlags {
    pub fn bits(self) -> u8 {
        (self.noise_suppression as u8)
            | (self.compand_select as u8) << 1
            | (self.compand_enable as u8) << 2
            | (self.dtx_enable as u8) << 3
            | (self.tone_detect as u8) << 4
            | (self.tone_send as u8) << 5
    }
}

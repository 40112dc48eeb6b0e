use bytes::{BufMut, BytesMut};

use crate::error::{PacketError, Result};
use crate::field::{channel_field, channel_of, FieldKind, ModeFlags, PacketType};

/// Start-of-packet marker.
pub const START_BYTE: u8 = 0x61;

/// Frame header: start byte (1) + payload length (2, BE) + packet type (1).
pub const HEADER_SIZE: usize = 4;

/// Parity trailer: field tag (1) + XOR value (1).
pub const PARITY_SIZE: usize = 2;

/// Maximum number of 16-bit samples a SPCHD field can carry.
const MAX_SAMPLES: usize = 255;

/// Maximum number of bits a CHAND field can carry.
const MAX_BITS: usize = 255;

/// XOR over every byte except the start marker and the parity value itself.
fn parity_of(frame: &[u8]) -> u8 {
    frame[1..frame.len() - 1].iter().fold(0, |acc, b| acc ^ b)
}

/// A single framed packet, either under construction or decoded off the wire.
///
/// Construction appends typed fields and is sealed by [`Packet::finalize`],
/// which fixes the header length and the optional parity trailer. Decoded
/// packets expose their contents only through bounds-checked accessors.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: BytesMut,
    has_parity: bool,
}

impl Packet {
    /// Start building a packet of the given type.
    pub fn new(kind: PacketType) -> Self {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 16);
        buf.put_u8(START_BYTE);
        buf.put_u16(0);
        buf.put_u8(kind as u8);
        Packet {
            buf,
            has_parity: false,
        }
    }

    /// Decode a packet received off the wire.
    ///
    /// The parity trailer, when expected, is validated before anything else
    /// so a corrupted packet fails fast. `check_parity` controls whether the
    /// XOR value is actually recomputed; responses to reset requests are
    /// accepted without it.
    pub fn parse(bytes: &[u8], expect_parity: bool, check_parity: bool) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::TooShort {
                len: bytes.len(),
                min: HEADER_SIZE,
            });
        }

        if expect_parity {
            if bytes.len() < HEADER_SIZE + PARITY_SIZE {
                return Err(PacketError::TooShort {
                    len: bytes.len(),
                    min: HEADER_SIZE + PARITY_SIZE,
                });
            }
            if bytes[bytes.len() - PARITY_SIZE] != FieldKind::Parity.byte() {
                return Err(PacketError::MissingParityField);
            }
            if check_parity {
                let stored = bytes[bytes.len() - 1];
                let computed = parity_of(bytes);
                if stored != computed {
                    return Err(PacketError::ParityMismatch { stored, computed });
                }
            }
        }

        if bytes[0] != START_BYTE {
            return Err(PacketError::InvalidStartByte { byte: bytes[0] });
        }

        let declared = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
        let actual = bytes.len() - HEADER_SIZE;
        if declared != actual {
            return Err(PacketError::LengthMismatch { declared, actual });
        }

        PacketType::from_byte(bytes[3])?;

        Ok(Packet {
            buf: BytesMut::from(bytes),
            has_parity: expect_parity,
        })
    }

    /// Packet type from the header.
    pub fn kind(&self) -> PacketType {
        // The type byte is validated in parse() and fixed in new().
        PacketType::from_byte(self.buf[3]).expect("packet type already validated")
    }

    /// Payload bytes, excluding the header and any parity trailer.
    pub fn payload(&self) -> &[u8] {
        let end = self.buf.len() - if self.has_parity { PARITY_SIZE } else { 0 };
        &self.buf[HEADER_SIZE..end]
    }

    /// Payload length, excluding any parity trailer.
    pub fn payload_len(&self) -> usize {
        self.payload().len()
    }

    /// The complete frame as it appears on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Whether the packet carries a parity trailer.
    pub fn has_parity(&self) -> bool {
        self.has_parity
    }

    /// The channel this packet targets.
    ///
    /// A packet addresses a channel if and only if the first payload field is
    /// a channel selector. Packets for the device as a whole (e.g. RESET)
    /// return `None`. A packet could in principle carry selectors for several
    /// channels; this driver never builds such packets, and the first
    /// selector wins.
    pub fn channel(&self) -> Option<u8> {
        self.payload().first().copied().and_then(channel_of)
    }

    /// Append a field tag followed by arbitrary payload bytes.
    ///
    /// The typed appenders below cover every request this driver sends;
    /// this is the escape hatch for response construction (chip simulators,
    /// tests) and fields with no dedicated constructor.
    pub fn append_bytes(&mut self, kind: FieldKind, payload: &[u8]) {
        self.buf.put_u8(kind.byte());
        self.buf.put_slice(payload);
    }

    /// Append a field that carries no payload (PRODID, RESET, READY, ...).
    pub fn append_field(&mut self, kind: FieldKind) {
        self.append_bytes(kind, &[]);
    }

    /// Append a channel selector.
    pub fn append_channel(&mut self, channel: u8) -> Result<()> {
        let kind = channel_field(channel)?;
        self.append_field(kind);
        Ok(())
    }

    /// Append a RATET table index.
    pub fn append_rate_index(&mut self, index: u8) {
        self.append_bytes(FieldKind::RateT, &[index]);
    }

    /// Append six RATEP rate control words.
    pub fn append_rate_words(&mut self, rcw: &[u16; 6]) {
        self.buf.put_u8(FieldKind::RateP.byte());
        for word in rcw {
            self.buf.put_u16(*word);
        }
    }

    /// Append an INIT field for the encoder and/or decoder.
    pub fn append_init(&mut self, encoder: bool, decoder: bool) {
        let params = (decoder as u8) << 1 | encoder as u8;
        self.append_bytes(FieldKind::Init, &[params]);
    }

    /// Append a COMPAND field.
    pub fn append_compand(&mut self, enabled: bool, alaw: bool) {
        let param = (alaw as u8) << 1 | enabled as u8;
        self.append_bytes(FieldKind::Compand, &[param]);
    }

    /// Append a PARITYMODE field.
    pub fn append_parity_mode(&mut self, enabled: bool) {
        self.append_bytes(FieldKind::ParityMode, &[enabled as u8]);
    }

    /// Append an ECMODE or DCMODE field.
    pub fn append_mode(&mut self, kind: FieldKind, flags: ModeFlags) {
        self.append_bytes(kind, &[flags.bits()]);
    }

    /// Append a SPCHD field with the given samples, converted to big-endian.
    pub fn append_samples(&mut self, samples: &[i16]) -> Result<()> {
        if samples.len() > MAX_SAMPLES {
            return Err(PacketError::FieldTooLarge {
                what: "sample",
                count: samples.len(),
                max: MAX_SAMPLES,
            });
        }
        self.buf.put_u8(FieldKind::Spchd.byte());
        self.buf.put_u8(samples.len() as u8);
        for sample in samples {
            self.buf.put_i16(*sample);
        }
        Ok(())
    }

    /// Append a CHAND field carrying `bits` compressed bits.
    ///
    /// `data` must hold at least `ceil(bits / 8)` bytes; extra bytes are
    /// ignored.
    pub fn append_bits(&mut self, data: &[u8], bits: usize) -> Result<()> {
        if bits > MAX_BITS {
            return Err(PacketError::FieldTooLarge {
                what: "bit",
                count: bits,
                max: MAX_BITS,
            });
        }
        let bytes = bits.div_ceil(8);
        if data.len() < bytes {
            return Err(PacketError::Truncated { what: "CHAND data" });
        }
        self.buf.put_u8(FieldKind::Chand.byte());
        self.buf.put_u8(bits as u8);
        self.buf.put_slice(&data[..bytes]);
        Ok(())
    }

    /// Seal the packet: fix the header length and the parity trailer.
    ///
    /// With `with_parity` the trailer is appended (or recomputed if already
    /// present); without it any existing trailer is removed. Returns the
    /// wire bytes.
    pub fn finalize(&mut self, with_parity: bool) -> &[u8] {
        if self.has_parity && !with_parity {
            self.buf.truncate(self.buf.len() - PARITY_SIZE);
            self.has_parity = false;
        } else if !self.has_parity && with_parity {
            self.buf.put_u8(FieldKind::Parity.byte());
            self.buf.put_u8(0);
            self.has_parity = true;
        }

        let len = (self.buf.len() - HEADER_SIZE) as u16;
        self.buf[1..3].copy_from_slice(&len.to_be_bytes());

        if self.has_parity {
            let value = parity_of(&self.buf);
            let last = self.buf.len() - 1;
            self.buf[last] = value;
        }
        &self.buf
    }

    /// Verify the parity trailer of a finalized or received packet.
    pub fn verify_parity(&self) -> Result<()> {
        if !self.has_parity {
            return Err(PacketError::NoParity);
        }
        let stored = self.buf[self.buf.len() - 1];
        let computed = parity_of(&self.buf);
        if stored != computed {
            return Err(PacketError::ParityMismatch { stored, computed });
        }
        Ok(())
    }

    /// Decode the samples of a SPEECH packet (channel selector + SPCHD).
    ///
    /// Samples are converted from the chip's big-endian representation.
    pub fn samples(&self) -> Result<Vec<i16>> {
        if self.kind() != PacketType::Speech {
            return Err(PacketError::WrongPacketType {
                expected: PacketType::Speech,
                found: self.kind(),
            });
        }
        let payload = self.payload();
        let rest = Self::expect_channel_selector(payload)?;
        if rest.first() != Some(&FieldKind::Spchd.byte()) {
            return Err(PacketError::UnexpectedField {
                expected: FieldKind::Spchd.byte(),
                found: rest.first().copied().unwrap_or(0xff),
            });
        }
        let count = *rest.get(1).ok_or(PacketError::Truncated { what: "SPCHD" })? as usize;
        let data = rest
            .get(2..2 + count * 2)
            .ok_or(PacketError::Truncated { what: "SPCHD data" })?;
        Ok(data
            .chunks_exact(2)
            .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Decode the compressed bits of a CHANNEL packet (selector + CHAND).
    ///
    /// Returns the packed bytes and the bit count.
    pub fn bits(&self) -> Result<(&[u8], usize)> {
        if self.kind() != PacketType::Channel {
            return Err(PacketError::WrongPacketType {
                expected: PacketType::Channel,
                found: self.kind(),
            });
        }
        let payload = self.payload();
        let rest = Self::expect_channel_selector(payload)?;
        if rest.first() != Some(&FieldKind::Chand.byte()) {
            return Err(PacketError::UnexpectedField {
                expected: FieldKind::Chand.byte(),
                found: rest.first().copied().unwrap_or(0xff),
            });
        }
        let count = *rest.get(1).ok_or(PacketError::Truncated { what: "CHAND" })? as usize;
        let bytes = count.div_ceil(8);
        let data = rest
            .get(2..2 + bytes)
            .ok_or(PacketError::Truncated { what: "CHAND data" })?;
        Ok((data, count))
    }

    fn expect_channel_selector(payload: &[u8]) -> Result<&[u8]> {
        match payload.first() {
            Some(&byte) if channel_of(byte).is_some() => Ok(&payload[1..]),
            Some(&byte) => Err(PacketError::UnexpectedField {
                expected: FieldKind::Channel0.byte(),
                found: byte,
            }),
            None => Err(PacketError::Truncated {
                what: "channel selector",
            }),
        }
    }
}

/// Cursor over a packet payload for walking response fields in order.
#[derive(Debug)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub fn new(packet: &'a Packet) -> Self {
        FieldReader {
            buf: packet.payload(),
        }
    }

    /// Consume a field tag, failing if it is not the expected one.
    pub fn expect(&mut self, kind: FieldKind) -> Result<()> {
        match self.buf.first() {
            Some(&byte) if byte == kind.byte() => {
                self.buf = &self.buf[1..];
                Ok(())
            }
            Some(&byte) => Err(PacketError::UnexpectedField {
                expected: kind.byte(),
                found: byte,
            }),
            None => Err(PacketError::Truncated { what: "field tag" }),
        }
    }

    /// Consume one byte.
    pub fn u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .first()
            .ok_or(PacketError::Truncated { what: "field byte" })?;
        self.buf = &self.buf[1..];
        Ok(byte)
    }

    /// Consume a field tag followed by its status byte.
    pub fn status(&mut self, kind: FieldKind) -> Result<u8> {
        self.expect(kind)?;
        self.u8()
    }

    /// Consume the remaining payload as a string, stopping at the first NUL.
    ///
    /// Responses are not guaranteed to be NUL-terminated; the read is bounded
    /// by the payload either way.
    pub fn string(&mut self) -> String {
        let end = self.buf.iter().position(|&b| b == 0).unwrap_or(self.buf.len());
        let value = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf = &[];
        value
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prodid_request_with_parity_matches_wire() {
        let mut packet = Packet::new(PacketType::Control);
        packet.append_field(FieldKind::ProdId);
        let bytes = packet.finalize(true).to_vec();
        assert_eq!(bytes, [0x61, 0x00, 0x03, 0x00, 0x30, 0x2f, 0x1c]);
    }

    #[test]
    fn rate_request_on_channel_2_matches_wire() {
        let mut packet = Packet::new(PacketType::Control);
        packet.append_channel(2).unwrap();
        packet.append_rate_index(33);
        let bytes = packet.finalize(false).to_vec();
        assert_eq!(bytes, [0x61, 0x00, 0x03, 0x00, 0x42, 0x09, 0x21]);
    }

    #[test]
    fn build_parse_round_trip_with_parity() {
        let mut packet = Packet::new(PacketType::Control);
        packet.append_channel(1).unwrap();
        packet.append_rate_words(&[0x0558, 0x086b, 0x1030, 0x0000, 0x0000, 0x0190]);
        let wire = packet.finalize(true).to_vec();

        let parsed = Packet::parse(&wire, true, true).unwrap();
        assert_eq!(parsed.kind(), PacketType::Control);
        assert_eq!(parsed.channel(), Some(1));
        assert_eq!(parsed.payload(), &wire[HEADER_SIZE..wire.len() - PARITY_SIZE]);
        parsed.verify_parity().unwrap();
    }

    #[test]
    fn finalize_toggles_parity_both_ways() {
        let mut packet = Packet::new(PacketType::Control);
        packet.append_field(FieldKind::Reset);
        let with = packet.finalize(true).to_vec();
        assert_eq!(with.len(), HEADER_SIZE + 1 + PARITY_SIZE);

        let without = packet.finalize(false).to_vec();
        assert_eq!(without, [0x61, 0x00, 0x01, 0x00, 0x33]);

        // Re-enabling recomputes the same trailer.
        assert_eq!(packet.finalize(true), &with[..]);
    }

    #[test]
    fn parse_rejects_corruption() {
        let mut packet = Packet::new(PacketType::Control);
        packet.append_field(FieldKind::ProdId);
        let wire = packet.finalize(true).to_vec();

        let mut bad_start = wire.clone();
        bad_start[0] = 0x62;
        assert!(matches!(
            Packet::parse(&bad_start, true, true),
            Err(PacketError::InvalidStartByte { byte: 0x62 })
        ));

        let mut bad_len = wire.clone();
        bad_len[2] = 0x09;
        // Parity covers the length bytes, so the parity check trips first.
        assert!(matches!(
            Packet::parse(&bad_len, true, true),
            Err(PacketError::ParityMismatch { .. })
        ));
        assert!(matches!(
            Packet::parse(&bad_len, true, false),
            Err(PacketError::LengthMismatch { .. })
        ));

        let mut bad_type = wire.clone();
        bad_type[3] = 0x07;
        assert!(matches!(
            Packet::parse(&bad_type, true, false),
            Err(PacketError::UnknownPacketType { byte: 0x07 })
        ));

        let mut bad_parity = wire.clone();
        let last = bad_parity.len() - 1;
        bad_parity[last] ^= 0xff;
        assert!(matches!(
            Packet::parse(&bad_parity, true, true),
            Err(PacketError::ParityMismatch { .. })
        ));
        // Parity validation can be skipped while the trailer is still required.
        Packet::parse(&bad_parity, true, false).unwrap();

        assert!(matches!(
            Packet::parse(&wire[..3], true, true),
            Err(PacketError::TooShort { .. })
        ));
    }

    #[test]
    fn speech_samples_round_trip_big_endian() {
        let samples: Vec<i16> = (0..160).map(|i| i * 17 - 1000).collect();
        let mut packet = Packet::new(PacketType::Speech);
        packet.append_channel(0).unwrap();
        packet.append_samples(&samples).unwrap();
        let wire = packet.finalize(false).to_vec();

        // Sample words are big-endian on the wire.
        assert_eq!(wire[HEADER_SIZE], 0x40);
        assert_eq!(wire[HEADER_SIZE + 1], 0x00);
        assert_eq!(wire[HEADER_SIZE + 2], 160);
        let first = i16::from_be_bytes([wire[HEADER_SIZE + 3], wire[HEADER_SIZE + 4]]);
        assert_eq!(first, samples[0]);

        let parsed = Packet::parse(&wire, false, false).unwrap();
        assert_eq!(parsed.samples().unwrap(), samples);
    }

    #[test]
    fn channel_bits_round_trip() {
        let data = [0xde, 0xad, 0xbe, 0xef, 0x01];
        let mut packet = Packet::new(PacketType::Channel);
        packet.append_channel(2).unwrap();
        packet.append_bits(&data, 33).unwrap();
        let wire = packet.finalize(true).to_vec();

        let parsed = Packet::parse(&wire, true, true).unwrap();
        let (bits, count) = parsed.bits().unwrap();
        assert_eq!(count, 33);
        assert_eq!(bits, &data[..]);
    }

    #[test]
    fn typed_accessors_check_packet_type() {
        let mut packet = Packet::new(PacketType::Speech);
        packet.append_channel(0).unwrap();
        packet.append_samples(&[0; 4]).unwrap();
        packet.finalize(false);

        assert!(matches!(
            packet.bits(),
            Err(PacketError::WrongPacketType { .. })
        ));

        let mut control = Packet::new(PacketType::Control);
        control.append_field(FieldKind::Reset);
        control.finalize(false);
        assert!(matches!(
            control.samples(),
            Err(PacketError::WrongPacketType { .. })
        ));
    }

    #[test]
    fn oversized_fields_rejected() {
        let mut packet = Packet::new(PacketType::Speech);
        assert!(matches!(
            packet.append_samples(&[0i16; 256]),
            Err(PacketError::FieldTooLarge { .. })
        ));

        let mut packet = Packet::new(PacketType::Channel);
        assert!(matches!(
            packet.append_bits(&[0u8; 2], 300),
            Err(PacketError::FieldTooLarge { .. })
        ));
        assert!(matches!(
            packet.append_bits(&[0u8; 2], 24),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn device_packets_have_no_channel() {
        let mut packet = Packet::new(PacketType::Control);
        packet.append_field(FieldKind::Reset);
        packet.finalize(false);
        assert_eq!(packet.channel(), None);
    }

    #[test]
    fn field_reader_walks_status_fields() {
        // Response to a RATET request on channel 2: channel status then
        // command status.
        let mut response = Packet::new(PacketType::Control);
        response.append_bytes(FieldKind::Channel2, &[0]);
        response.append_bytes(FieldKind::RateT, &[0]);
        response.finalize(false);

        let mut fields = FieldReader::new(&response);
        assert_eq!(fields.status(FieldKind::Channel2).unwrap(), 0);
        assert_eq!(fields.status(FieldKind::RateT).unwrap(), 0);
        assert!(fields.remaining().is_empty());
    }

    #[test]
    fn field_reader_reads_bounded_strings() {
        let mut response = Packet::new(PacketType::Control);
        response.append_bytes(FieldKind::ProdId, b"AMBE3003\0garbage");
        response.finalize(false);

        let mut fields = FieldReader::new(&response);
        fields.expect(FieldKind::ProdId).unwrap();
        assert_eq!(fields.string(), "AMBE3003");

        // A missing terminator yields the rest of the payload.
        let mut response = Packet::new(PacketType::Control);
        response.append_bytes(FieldKind::VerString, b"V120");
        response.finalize(false);
        let mut fields = FieldReader::new(&response);
        fields.expect(FieldKind::VerString).unwrap();
        assert_eq!(fields.string(), "V120");
    }
}

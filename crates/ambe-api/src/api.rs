use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use ambe_device::{DeviceError, FifoCallback, FifoDevice, ParityFlag, TaggingDevice};
use ambe_packet::{channel_field, FieldKind, FieldReader, ModeFlags, Packet, PacketType};
use ambe_sched::{PendingResponse, Scheduler};
use tracing::debug;

use crate::error::{ApiError, Result};
use crate::rate::Rate;

/// How long to wait for the READY packet after a hardware reset.
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Zero padding sent before a soft reset: enough to flush any half-received
/// packet out of the chip's input path.
const SOFT_RESET_ZEROS: usize = 3_500;
const SOFT_RESET_CHUNK: usize = 10;

/// The device a scheduler is bound to, by ordering contract.
enum Binding {
    Fifo(Arc<dyn FifoDevice>),
    Tagged(Arc<dyn TaggingDevice>),
}

/// Chip API façade over a device and its scheduler.
///
/// Control-plane calls block until the chip confirms. The data plane
/// (compress / decompress) returns futures so callers can keep several
/// requests in flight per channel.
///
/// `reset` and `parity_mode` reconfigure shared wire state and must not run
/// concurrently with other requests; everything else may be called from any
/// number of threads.
pub struct Api {
    binding: Binding,
    scheduler: Arc<dyn Scheduler>,
    parity: ParityFlag,
    check_parity: bool,
}

impl Api {
    /// Bind to a local order-preserving device (UART chip).
    pub fn over_fifo(device: Arc<dyn FifoDevice>, scheduler: Arc<dyn Scheduler>) -> Self {
        let parity = device.parity();
        Api {
            binding: Binding::Fifo(device),
            scheduler,
            parity,
            check_parity: true,
        }
    }

    /// Bind to a remote tagged device (shared chip server).
    pub fn over_tagged(device: Arc<dyn TaggingDevice>, scheduler: Arc<dyn Scheduler>) -> Self {
        let parity = device.parity();
        Api {
            binding: Binding::Tagged(device),
            scheduler,
            parity,
            check_parity: true,
        }
    }

    /// Disable response parity verification (the trailer is still parsed).
    pub fn without_parity_checks(mut self) -> Self {
        self.check_parity = false;
        self
    }

    fn finalized(&self, mut packet: Packet) -> Packet {
        packet.finalize(self.parity.get());
        packet
    }

    /// Submit a control request and verify the response parity.
    fn transact(&self, packet: Packet) -> Result<Packet> {
        let response = self.scheduler.submit(packet).wait()?;
        if self.check_parity && self.parity.get() {
            response.verify_parity()?;
        }
        Ok(response)
    }

    /// Parse a `[command status]` control response.
    fn expect_status(response: &Packet, command: &'static str, kind: FieldKind) -> Result<()> {
        let mut fields = FieldReader::new(response);
        let status = fields.status(kind)?;
        if status != 0 {
            return Err(ApiError::CommandFailed {
                command,
                channel: None,
                status,
            });
        }
        Ok(())
    }

    /// Parse a `[channel status][command status]` control response.
    ///
    /// Multi-channel chips acknowledge the channel selector itself before
    /// the command's own status.
    fn expect_channel_status(
        response: &Packet,
        command: &'static str,
        channel: u8,
        kind: FieldKind,
    ) -> Result<()> {
        let mut fields = FieldReader::new(response);
        let select = fields.status(channel_field(channel)?)?;
        if select != 0 {
            return Err(ApiError::ChannelSelectFailed {
                channel,
                status: select,
            });
        }
        let status = fields.status(kind)?;
        if status != 0 {
            return Err(ApiError::CommandFailed {
                command,
                channel: Some(channel),
                status,
            });
        }
        Ok(())
    }

    /// Product identification string (e.g. "AMBE3003").
    pub fn prodid(&self) -> Result<String> {
        let mut request = Packet::new(PacketType::Control);
        request.append_field(FieldKind::ProdId);
        let response = self.transact(self.finalized(request))?;

        let mut fields = FieldReader::new(&response);
        fields.expect(FieldKind::ProdId)?;
        Ok(fields.string())
    }

    /// Firmware version string.
    pub fn verstring(&self) -> Result<String> {
        let mut request = Packet::new(PacketType::Control);
        request.append_field(FieldKind::VerString);
        let response = self.transact(self.finalized(request))?;

        let mut fields = FieldReader::new(&response);
        fields.expect(FieldKind::VerString)?;
        Ok(fields.string())
    }

    /// Reset the chip and wait for it to report ready.
    ///
    /// A hard reset drives the UART break line (local devices that support
    /// it only); a soft reset flushes the chip's input path with zeros and
    /// sends a RESET packet. Either way the chip comes back with parity
    /// enabled, its power-on default.
    pub fn reset(&self, hard: bool) -> Result<()> {
        if hard {
            self.hard_reset()?;
        } else {
            self.soft_reset()?;
        }
        self.parity.set(true);
        Ok(())
    }

    fn hard_reset(&self) -> Result<()> {
        let Binding::Fifo(device) = &self.binding else {
            return Err(ApiError::Device(DeviceError::HardResetUnsupported));
        };
        let reset_line = device
            .hard_reset()
            .ok_or(DeviceError::HardResetUnsupported)?;

        // Divert the receive path to a callback that drops everything except
        // a valid READY packet. Parity is not checked on it: the chip has
        // just rebooted into its default state.
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let watcher: FifoCallback = Arc::new(move |bytes: &[u8]| {
            let Ok(packet) = Packet::parse(bytes, true, false) else {
                return;
            };
            if FieldReader::new(&packet).expect(FieldKind::Ready).is_ok() {
                let _ = ready_tx.send(());
            }
        });
        let previous = device.set_callback(Some(watcher));

        let outcome = reset_line
            .reset()
            .map_err(ApiError::from)
            .and_then(|()| ready_rx.recv_timeout(READY_TIMEOUT).map_err(|_| ApiError::ResetTimeout));

        // Restore the diverted receive path no matter how the reset went.
        device.set_callback(previous);
        outcome?;
        debug!("hardware reset complete");
        Ok(())
    }

    fn soft_reset(&self) -> Result<()> {
        // Terminate any partially transferred packet before the RESET so the
        // chip's framing layer is in a known state. Only possible with raw
        // access to the stream; a remote server flushes on its own side.
        if let Binding::Fifo(device) = &self.binding {
            let zeros = [0u8; SOFT_RESET_CHUNK];
            for _ in 0..SOFT_RESET_ZEROS {
                device.send(&zeros)?;
            }
        }

        // Parity is forced on for the RESET packet itself so the reset works
        // no matter which state the chip is stuck in.
        let mut request = Packet::new(PacketType::Control);
        request.append_field(FieldKind::Reset);
        request.finalize(true);

        // Parity of the READY response is deliberately not verified.
        let response = self.scheduler.submit(request).wait()?;
        let mut fields = FieldReader::new(&response);
        fields.expect(FieldKind::Ready)?;
        debug!("soft reset complete");
        Ok(())
    }

    /// Enable or disable parity trailers, on the chip and locally.
    ///
    /// The local setting flips before the request is sent: the chip applies
    /// the new mode starting with the response to this very request. Must
    /// not run concurrently with any other request.
    pub fn parity_mode(&self, enabled: bool) -> Result<()> {
        let mut request = Packet::new(PacketType::Control);
        request.append_parity_mode(enabled);
        // The request itself still travels under the old setting.
        let request = self.finalized(request);

        self.parity.set(enabled);
        let response = self.scheduler.submit(request).wait()?;
        if self.check_parity && self.parity.get() {
            response.verify_parity()?;
        }
        Self::expect_status(&response, "PARITYMODE", FieldKind::ParityMode)
    }

    /// Configure companding (a-law / µ-law) for the whole chip.
    pub fn compand(&self, enabled: bool, alaw: bool) -> Result<()> {
        let mut request = Packet::new(PacketType::Control);
        request.append_compand(enabled, alaw);
        let response = self.transact(self.finalized(request))?;
        Self::expect_status(&response, "COMPAND", FieldKind::Compand)
    }

    /// Encoder cmode flags for one channel.
    pub fn ecmode(&self, channel: u8, flags: ModeFlags) -> Result<()> {
        self.set_mode(channel, "ECMODE", FieldKind::EcMode, flags)
    }

    /// Decoder cmode flags for one channel.
    pub fn dcmode(&self, channel: u8, flags: ModeFlags) -> Result<()> {
        self.set_mode(channel, "DCMODE", FieldKind::DcMode, flags)
    }

    fn set_mode(
        &self,
        channel: u8,
        command: &'static str,
        kind: FieldKind,
        flags: ModeFlags,
    ) -> Result<()> {
        let mut request = Packet::new(PacketType::Control);
        request.append_channel(channel)?;
        request.append_mode(kind, flags);
        let response = self.transact(self.finalized(request))?;
        Self::expect_channel_status(&response, command, channel, kind)
    }

    /// Select a rate-table entry for one channel.
    pub fn ratet(&self, channel: u8, index: u8) -> Result<()> {
        let mut request = Packet::new(PacketType::Control);
        request.append_channel(channel)?;
        request.append_rate_index(index);
        let response = self.transact(self.finalized(request))?;
        Self::expect_channel_status(&response, "RATET", channel, FieldKind::RateT)
    }

    /// Program custom rate control words for one channel.
    pub fn ratep(&self, channel: u8, rcw: &[u16; 6]) -> Result<()> {
        let mut request = Packet::new(PacketType::Control);
        request.append_channel(channel)?;
        request.append_rate_words(rcw);
        let response = self.transact(self.finalized(request))?;
        Self::expect_channel_status(&response, "RATEP", channel, FieldKind::RateP)
    }

    /// Apply a [`Rate`] to one channel.
    pub fn rate(&self, channel: u8, rate: &Rate) -> Result<()> {
        match rate {
            Rate::Table(index) => self.ratet(channel, *index),
            Rate::Custom(rcw) => self.ratep(channel, rcw),
        }
    }

    /// Initialize the encoder and/or decoder of one channel.
    pub fn init(&self, channel: u8, encoder: bool, decoder: bool) -> Result<()> {
        let mut request = Packet::new(PacketType::Control);
        request.append_channel(channel)?;
        request.append_init(encoder, decoder);
        let response = self.transact(self.finalized(request))?;
        Self::expect_channel_status(&response, "INIT", channel, FieldKind::Init)
    }

    /// Compress one frame of speech samples on the given channel.
    ///
    /// Samples are host-endian; the codec converts to the chip's byte order.
    /// The future resolves with a CHANNEL packet; decode it with
    /// [`AmbeFrame::from_response`](crate::audio::AmbeFrame::from_response).
    pub fn compress(&self, channel: u8, samples: &[i16]) -> Result<PendingResponse> {
        let mut request = Packet::new(PacketType::Speech);
        request.append_channel(channel)?;
        request.append_samples(samples)?;
        Ok(self.scheduler.submit(self.finalized(request)))
    }

    /// Decompress one frame of AMBE bits on the given channel.
    ///
    /// The future resolves with a SPEECH packet; decode it with
    /// [`Packet::samples`].
    pub fn decompress(&self, channel: u8, bits: &[u8], count: usize) -> Result<PendingResponse> {
        let mut request = Packet::new(PacketType::Channel);
        request.append_channel(channel)?;
        request.append_bits(bits, count)?;
        Ok(self.scheduler.submit(self.finalized(request)))
    }
}

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ambe_transport::{wake_pipe, FrameReceiver, SerialPort, WakeHandle};
use tracing::{debug, error, warn};

use crate::error::{DeviceError, Result};
use crate::traits::{CallbackSlot, Device, FifoCallback, FifoDevice, HardReset, ParityFlag};

/// A chip behind a USB-to-serial adapter.
///
/// The UART preserves ordering in both directions, so this is a
/// [`FifoDevice`]. One receiver thread per started device reassembles
/// packets and hands them to the registered callback.
pub struct UartDevice {
    path: PathBuf,
    baud: u32,
    channel_count: usize,
    supports_hard_reset: bool,
    parity: ParityFlag,
    callback: Arc<CallbackSlot<FifoCallback>>,
    io: Mutex<Option<UartIo>>,
}

struct UartIo {
    port: SerialPort,
    wake: WakeHandle,
    receiver: Option<JoinHandle<()>>,
}

impl UartDevice {
    /// DVSI USB-3003: three channels, hard reset via UART break.
    pub fn usb3003(path: impl AsRef<Path>) -> Self {
        Self::new(path, 921_600, 3, true)
    }

    /// DVSI USB-3000: one channel, no hard reset line.
    pub fn usb3000(path: impl AsRef<Path>) -> Self {
        Self::new(path, 460_800, 1, false)
    }

    fn new(path: impl AsRef<Path>, baud: u32, channel_count: usize, hard_reset: bool) -> Self {
        UartDevice {
            path: path.as_ref().to_path_buf(),
            baud,
            channel_count,
            supports_hard_reset: hard_reset,
            parity: ParityFlag::default(),
            callback: Arc::new(CallbackSlot::new()),
            io: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Device for UartDevice {
    fn start(&self) -> Result<()> {
        let mut io = self.io.lock().unwrap();
        if io.is_some() {
            return Err(DeviceError::AlreadyStarted);
        }

        let port = SerialPort::open(&self.path, self.baud)?;
        let (wake, wake_rx) = wake_pipe()?;
        let reader = port.reader()?;

        let callback = self.callback.clone();
        let path = self.path.clone();
        let receiver = std::thread::Builder::new()
            .name("ambe-uart-rx".into())
            .spawn(move || {
                let mut frames = FrameReceiver::new(reader, wake_rx);
                loop {
                    match frames.read_packet() {
                        Ok(Some(frame)) => {
                            if let Some(callback) = callback.get() {
                                callback(&frame);
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            // Fatal for the device; the serial protocol has
                            // no recovery short of a reset.
                            error!(?path, error = %err, "packet receiver terminated");
                            break;
                        }
                    }
                }
            })
            .map_err(DeviceError::Spawn)?;

        debug!(path = ?self.path, baud = self.baud, "uart device started");
        *io = Some(UartIo {
            port,
            wake,
            receiver: Some(receiver),
        });
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let Some(mut io) = self.io.lock().unwrap().take() else {
            return Ok(());
        };

        if let Err(err) = io.wake.wake() {
            warn!(path = ?self.path, error = %err, "failed to wake receiver thread");
        }
        if let Some(receiver) = io.receiver.take() {
            if receiver.join().is_err() {
                warn!(path = ?self.path, "receiver thread panicked");
            }
        }
        debug!(path = ?self.path, "uart device stopped");
        Ok(())
    }

    fn channels(&self) -> usize {
        self.channel_count
    }

    fn parity(&self) -> ParityFlag {
        self.parity.clone()
    }
}

impl FifoDevice for UartDevice {
    fn set_callback(&self, callback: Option<FifoCallback>) -> Option<FifoCallback> {
        self.callback.set(callback)
    }

    fn send(&self, packet: &[u8]) -> Result<()> {
        let io = self.io.lock().unwrap();
        let io = io.as_ref().ok_or(DeviceError::NotStarted)?;
        io.port.send(packet)?;
        Ok(())
    }

    fn hard_reset(&self) -> Option<&dyn HardReset> {
        self.supports_hard_reset.then_some(self as &dyn HardReset)
    }
}

impl HardReset for UartDevice {
    fn reset(&self) -> Result<()> {
        let io = self.io.lock().unwrap();
        let io = io.as_ref().ok_or(DeviceError::NotStarted)?;

        // Drop anything queued in either direction, then signal a break on
        // the line. The chip answers with READY through the receive path.
        io.port.flush_io()?;
        io.port.send_break()?;
        Ok(())
    }
}

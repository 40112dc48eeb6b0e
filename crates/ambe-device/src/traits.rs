use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// Receive callback for order-preserving devices. Invoked with the raw frame
/// bytes of each packet, on the device's receiver thread.
pub type FifoCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Receive callback for tagging devices. Invoked with the correlation tag
/// and the raw frame bytes, on the device's receiver thread.
pub type TaggedCallback = Arc<dyn Fn(u32, &[u8]) + Send + Sync>;

/// Whether packets on the wire currently carry parity trailers.
///
/// The flag is shared between a device and the API layer: the API flips it
/// when it issues PARITYMODE so that the response to that very request is
/// already parsed under the new setting.
#[derive(Debug, Clone)]
pub struct ParityFlag(Arc<AtomicBool>);

impl ParityFlag {
    pub fn new(enabled: bool) -> Self {
        ParityFlag(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

impl Default for ParityFlag {
    /// Parity is the chip's power-on default.
    fn default() -> Self {
        ParityFlag::new(true)
    }
}

/// Single-slot receive callback registration.
///
/// Setting a callback returns the previous one, which lets the hard-reset
/// protocol temporarily divert the receive path and restore it afterward.
pub struct CallbackSlot<T>(Mutex<Option<T>>);

impl<T: Clone> CallbackSlot<T> {
    pub fn new() -> Self {
        CallbackSlot(Mutex::new(None))
    }

    /// Swap the registered callback, returning the previous one.
    pub fn set(&self, callback: Option<T>) -> Option<T> {
        std::mem::replace(&mut self.0.lock().unwrap(), callback)
    }

    /// Clone the current callback for invocation outside the lock.
    pub fn get(&self) -> Option<T> {
        self.0.lock().unwrap().clone()
    }
}

impl<T: Clone> Default for CallbackSlot<T> {
    fn default() -> Self {
        CallbackSlot::new()
    }
}

/// Base capability shared by every AMBE device.
///
/// A device is created stopped. `start` opens the transport and spawns the
/// receiver thread; `stop` cancels the receiver, joins it, and releases the
/// transport. Stopping an already-stopped device is a no-op.
pub trait Device: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;

    /// Number of codec channels the hardware provides.
    fn channels(&self) -> usize;

    /// The shared parity setting for this device's wire traffic.
    fn parity(&self) -> ParityFlag;
}

/// Hardware reset line, provided only by devices that can drive one.
pub trait HardReset: Send + Sync {
    /// Reset the chip. Blocks while the reset is signalled; the READY packet
    /// that follows arrives through the normal receive path.
    fn reset(&self) -> Result<()>;
}

/// A device whose responses arrive in exactly the order requests were sent.
pub trait FifoDevice: Device {
    /// Swap the receive callback, returning the previous one. The callback
    /// runs on the device's receiver thread.
    fn set_callback(&self, callback: Option<FifoCallback>) -> Option<FifoCallback>;

    /// Write one packet to the device. Blocking, and not reentrant: callers
    /// must serialize sends themselves.
    fn send(&self, packet: &[u8]) -> Result<()>;

    /// The hard-reset capability, when the hardware has one.
    fn hard_reset(&self) -> Option<&dyn HardReset> {
        None
    }
}

/// A device that correlates requests and responses by tag.
///
/// Remote servers reorder requests from different clients for fairness, so
/// order preservation cannot be assumed; the tag travels with each message
/// in both directions instead.
pub trait TaggingDevice: Device {
    /// Swap the receive callback, returning the previous one. The callback
    /// runs on the device's receiver thread.
    fn set_callback(&self, callback: Option<TaggedCallback>) -> Option<TaggedCallback>;

    /// Write one tagged packet to the device. Blocking, and not reentrant.
    fn send(&self, tag: u32, packet: &[u8]) -> Result<()>;
}

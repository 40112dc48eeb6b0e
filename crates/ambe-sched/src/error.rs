use std::time::Duration;

/// Errors delivered to request callbacks and futures.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The request could not be written to the device.
    #[error("device error: {0}")]
    Device(#[from] ambe_device::DeviceError),

    /// The response failed to decode.
    #[error("packet error: {0}")]
    Packet(#[from] ambe_packet::PacketError),

    /// The scheduler stopped before a response arrived.
    #[error("scheduler stopped")]
    Stopped,

    /// The bounded wait on a future elapsed. The in-flight request is not
    /// cancelled; the caller merely stops waiting.
    #[error("no response within {timeout:?}")]
    Timeout { timeout: Duration },

    /// More channels requested than the scheduler supports.
    #[error("invalid number of channels {channels} (max {max})")]
    InvalidChannelCount { channels: usize, max: usize },

    /// Start was called on a running scheduler.
    #[error("scheduler already started")]
    AlreadyStarted,

    /// Failed to spawn the worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

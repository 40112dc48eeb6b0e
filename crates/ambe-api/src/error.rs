/// Errors surfaced by the chip API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request never made it through the scheduler, or the response did
    /// not decode.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] ambe_sched::SchedulerError),

    /// A direct device operation failed.
    #[error("device error: {0}")]
    Device(#[from] ambe_device::DeviceError),

    /// A response payload did not have the expected shape.
    #[error("packet error: {0}")]
    Packet(#[from] ambe_packet::PacketError),

    /// The chip answered a command with a non-zero status.
    #[error("{command} request failed with status {status} (channel {channel:?})")]
    CommandFailed {
        command: &'static str,
        channel: Option<u8>,
        status: u8,
    },

    /// The chip rejected the channel selector itself.
    #[error("channel {channel} selection failed with status {status}")]
    ChannelSelectFailed { channel: u8, status: u8 },

    /// A rate string that is neither a table index nor six rate words.
    #[error("invalid AMBE rate '{value}'")]
    InvalidRate { value: String },

    /// No READY packet arrived after a hardware reset.
    #[error("device did not report ready after reset")]
    ResetTimeout,
}

pub type Result<T> = std::result::Result<T, ApiError>;

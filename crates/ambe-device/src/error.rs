/// Errors that can occur while operating an AMBE device.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The underlying byte stream failed.
    #[error("transport error: {0}")]
    Transport(#[from] ambe_transport::TransportError),

    /// An operation that requires a running device was called before start.
    #[error("device not started")]
    NotStarted,

    /// Start was called on a device that is already running.
    #[error("device already started")]
    AlreadyStarted,

    /// A device URI that does not parse or names an unknown scheme.
    #[error("invalid device URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: &'static str },

    /// Every channel on every registered chip is in use.
    #[error("no free channel left")]
    NoFreeChannel,

    /// A chip id that was never registered.
    #[error("unknown device '{id}'")]
    UnknownDevice { id: String },

    /// A chip id registered twice.
    #[error("device '{id}' already registered")]
    AlreadyRegistered { id: String },

    /// A channel index outside the device's range.
    #[error("device '{id}' has no channel {channel}")]
    InvalidChannel { id: String, channel: usize },

    /// Hard reset requested on hardware that cannot do it.
    #[error("device does not support hard reset")]
    HardResetUnsupported,

    /// The remote peer broke the session protocol.
    #[error("remote protocol error: {0}")]
    Protocol(String),

    /// Failed to spawn the receiver thread.
    #[error("failed to spawn receiver thread: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

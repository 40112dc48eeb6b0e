use std::path::PathBuf;

/// Errors that can occur in the byte-stream transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// An I/O error on the underlying stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream reached end-of-file.
    #[error("byte stream closed")]
    Closed,

    /// A system call (poll, termios, ioctl) failed.
    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    /// The requested baud rate has no termios constant.
    #[error("unsupported baud rate {baud}")]
    UnsupportedBaud { baud: u32 },

    /// Another process holds the serial port lock.
    #[error("serial port {path} is locked by another process")]
    PortBusy { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, TransportError>;

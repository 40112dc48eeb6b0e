use std::fmt;
use std::io;

use ambe_api::ApiError;
use ambe_device::DeviceError;
use ambe_sched::SchedulerError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => FAILURE,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn device_error(context: &str, err: DeviceError) -> CliError {
    let code = match &err {
        DeviceError::Transport(_) | DeviceError::Protocol(_) => TRANSPORT_ERROR,
        DeviceError::InvalidUri { .. } => USAGE,
        DeviceError::NoFreeChannel => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn scheduler_error(context: &str, err: SchedulerError) -> CliError {
    let code = match &err {
        SchedulerError::Device(_) => TRANSPORT_ERROR,
        SchedulerError::Timeout { .. } => TIMEOUT,
        SchedulerError::Packet(_) => DATA_INVALID,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn api_error(context: &str, err: ApiError) -> CliError {
    match err {
        ApiError::Device(err) => device_error(context, err),
        ApiError::Scheduler(err) => scheduler_error(context, err),
        ApiError::InvalidRate { .. } => CliError::new(USAGE, format!("{context}: invalid rate")),
        ApiError::Packet(err) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

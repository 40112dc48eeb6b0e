//! C bindings for transcoding through a remote AMBE server.
//!
//! The surface mirrors the blocking call-per-frame style C clients expect:
//! open a handle against a `tcp:` URI, compress and decompress one frame at
//! a time with a per-call deadline, close the handle. Only remote devices
//! are supported here; a process that owns local hardware should use the
//! Rust API directly.
//!
//! Return codes: `0` success, `-1` deadline elapsed (the request stays in
//! flight; the caller just stops waiting), `-2` any other failure.

use std::ffi::{c_char, c_int, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use ambe_api::{AmbeFrame, Api, Rate};
use ambe_device::{Device, DeviceUri};
use ambe_remote::RemoteDevice;
use ambe_sched::{FifoScheduler, Scheduler, SchedulerError};
use tracing::error;

pub const AMBE_OK: c_int = 0;
pub const AMBE_TIMEOUT: c_int = -1;
pub const AMBE_ERROR: c_int = -2;

/// An open remote transcoding session.
pub struct AmbeClient {
    device: Arc<RemoteDevice>,
    scheduler: Arc<FifoScheduler>,
    api: Api,
    channel: u8,
    deadline: Duration,
}

impl AmbeClient {
    fn open(uri: &str, rate: &str, deadline_ms: c_int) -> Result<AmbeClient, String> {
        let rate: Rate = rate.parse().map_err(|err| format!("{err}"))?;
        let DeviceUri::Tcp { authority } =
            DeviceUri::parse(uri).map_err(|err| format!("{err}"))?
        else {
            return Err(format!("only tcp: devices are supported, got '{uri}'"));
        };

        let device = Arc::new(RemoteDevice::new(authority));
        device.start().map_err(|err| format!("{err}"))?;

        let scheduler = Arc::new(FifoScheduler::new(device.clone()));
        if let Err(err) = scheduler.start() {
            let _ = device.stop();
            return Err(format!("{err}"));
        }

        let channel = device.channel().unwrap_or(0);
        let api = Api::over_tagged(device.clone(), scheduler.clone());

        let configured = api
            .rate(channel, &rate)
            .and_then(|()| api.init(channel, true, true));
        if let Err(err) = configured {
            let _ = scheduler.stop();
            let _ = device.stop();
            return Err(format!("{err}"));
        }

        Ok(AmbeClient {
            device,
            scheduler,
            api,
            channel,
            deadline: Duration::from_millis(deadline_ms.max(0) as u64),
        })
    }

    fn close(&self) {
        if let Err(err) = self.scheduler.stop() {
            error!(error = %err, "scheduler stop failed");
        }
        if let Err(err) = self.device.stop() {
            error!(error = %err, "device stop failed");
        }
    }
}

/// # Safety
///
/// `uri` and `rate` must be valid NUL-terminated C strings. Returns NULL on
/// failure.
#[no_mangle]
pub unsafe extern "C" fn ambe_open(
    uri: *const c_char,
    rate: *const c_char,
    deadline_ms: c_int,
) -> *mut AmbeClient {
    let result = catch_unwind(|| {
        if uri.is_null() || rate.is_null() {
            return std::ptr::null_mut();
        }
        let uri = CStr::from_ptr(uri).to_string_lossy();
        let rate = CStr::from_ptr(rate).to_string_lossy();

        match AmbeClient::open(&uri, &rate, deadline_ms) {
            Ok(client) => Box::into_raw(Box::new(client)),
            Err(message) => {
                error!(%uri, "ambe_open failed: {message}");
                std::ptr::null_mut()
            }
        }
    });
    result.unwrap_or(std::ptr::null_mut())
}

/// # Safety
///
/// `client` must be NULL or a pointer returned by [`ambe_open`]; it is
/// invalid after this call.
#[no_mangle]
pub unsafe extern "C" fn ambe_close(client: *mut AmbeClient) {
    if client.is_null() {
        return;
    }
    let client = Box::from_raw(client);
    let _ = catch_unwind(AssertUnwindSafe(|| client.close()));
}

/// Compress one frame of speech samples.
///
/// On entry `*bit_count` is the capacity of `bits` in bits; on success it
/// holds the number of compressed bits written.
///
/// # Safety
///
/// `client` must come from [`ambe_open`]. `samples` must point to
/// `sample_count` samples, `bits` to at least `ceil(*bit_count / 8)`
/// writable bytes, and `bit_count` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn ambe_compress(
    bits: *mut u8,
    bit_count: *mut usize,
    client: *mut AmbeClient,
    samples: *const i16,
    sample_count: usize,
) -> c_int {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if bits.is_null() || bit_count.is_null() || client.is_null() || samples.is_null() {
            return AMBE_ERROR;
        }
        let client = &*client;
        let samples = std::slice::from_raw_parts(samples, sample_count);

        let pending = match client.api.compress(client.channel, samples) {
            Ok(pending) => pending,
            Err(err) => {
                error!(error = %err, "compress submit failed");
                return AMBE_ERROR;
            }
        };

        let response = match pending.wait_timeout(client.deadline) {
            Ok(response) => response,
            Err(SchedulerError::Timeout { .. }) => return AMBE_TIMEOUT,
            Err(err) => {
                error!(error = %err, "compress failed");
                return AMBE_ERROR;
            }
        };

        let frame = match AmbeFrame::from_response(&response) {
            Ok(frame) => frame,
            Err(err) => {
                error!(error = %err, "compress response malformed");
                return AMBE_ERROR;
            }
        };

        if *bit_count < frame.bits() {
            error!(
                capacity = *bit_count,
                needed = frame.bits(),
                "bit buffer too small"
            );
            return AMBE_ERROR;
        }
        std::ptr::copy_nonoverlapping(frame.data().as_ptr(), bits, frame.data().len());
        *bit_count = frame.bits();
        AMBE_OK
    }));
    result.unwrap_or(AMBE_ERROR)
}

/// Decompress one frame of AMBE bits.
///
/// On entry `*sample_count` is the capacity of `samples`; on success it
/// holds the number of samples written.
///
/// # Safety
///
/// `client` must come from [`ambe_open`]. `bits` must point to
/// `ceil(bit_count / 8)` bytes, `samples` to `*sample_count` writable
/// samples, and `sample_count` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn ambe_decompress(
    samples: *mut i16,
    sample_count: *mut usize,
    client: *mut AmbeClient,
    bits: *const u8,
    bit_count: usize,
) -> c_int {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if samples.is_null() || sample_count.is_null() || client.is_null() || bits.is_null() {
            return AMBE_ERROR;
        }
        let client = &*client;
        let bits = std::slice::from_raw_parts(bits, AmbeFrame::byte_len(bit_count));

        let pending = match client.api.decompress(client.channel, bits, bit_count) {
            Ok(pending) => pending,
            Err(err) => {
                error!(error = %err, "decompress submit failed");
                return AMBE_ERROR;
            }
        };

        let response = match pending.wait_timeout(client.deadline) {
            Ok(response) => response,
            Err(SchedulerError::Timeout { .. }) => return AMBE_TIMEOUT,
            Err(err) => {
                error!(error = %err, "decompress failed");
                return AMBE_ERROR;
            }
        };

        let decoded = match response.samples() {
            Ok(decoded) => decoded,
            Err(err) => {
                error!(error = %err, "decompress response malformed");
                return AMBE_ERROR;
            }
        };

        if *sample_count < decoded.len() {
            error!(
                capacity = *sample_count,
                needed = decoded.len(),
                "sample buffer too small"
            );
            return AMBE_ERROR;
        }
        std::ptr::copy_nonoverlapping(decoded.as_ptr(), samples, decoded.len());
        *sample_count = decoded.len();
        AMBE_OK
    }));
    result.unwrap_or(AMBE_ERROR)
}

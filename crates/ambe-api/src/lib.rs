//! High-level interface to AMBE vocoder chips.
//!
//! The [`Api`] façade builds requests, submits them through a scheduler, and
//! parses the responses. Control-plane operations (reset, rates, modes) are
//! synchronous; the data plane (compress / decompress) returns futures so
//! callers can pipeline the chip's cores.

pub mod api;
pub mod audio;
pub mod error;
pub mod rate;

pub use api::Api;
pub use audio::{AmbeFrame, FRAME_DURATION_MS, FRAME_SIZE, SAMPLE_RATE};
pub use error::{ApiError, Result};
pub use rate::Rate;

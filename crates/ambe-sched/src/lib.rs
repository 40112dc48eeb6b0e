//! Request scheduling for AMBE vocoder chips.
//!
//! The chip answers every request but carries no correlation data, so
//! responses can only be matched to requests by order (FIFO transports) or
//! by an out-of-band tag (remote transports). A scheduler owns that
//! matching: callers submit finalized packets and receive the response via
//! callback or future.
//!
//! [`FifoScheduler`] is the trivial case over a tagging transport.
//! [`MultiQueueScheduler`] shapes traffic to the chip itself: it keeps every
//! CPU core busy while never overcommitting the chip's four-slot input
//! buffer.

pub mod error;
pub mod fifo;
pub mod multiqueue;

use std::sync::mpsc;
use std::time::Duration;

use ambe_packet::Packet;

pub use error::{Result, SchedulerError};
pub use fifo::FifoScheduler;
pub use multiqueue::MultiQueueScheduler;

/// Resolved exactly once with the response (or the failure) of a request.
pub type ResponseCallback = Box<dyn FnOnce(Result<Packet>) + Send>;

/// An AMBE request scheduler.
///
/// Submission is non-blocking: the actual device write happens behind the
/// scenes, and the callback fires on an internal thread once the chip
/// responds. Packets must be finalized before submission; the scheduler
/// sends their bytes verbatim.
pub trait Scheduler: Send + Sync {
    /// Subscribe to the device and start any worker thread.
    fn start(&self) -> Result<()>;

    /// Drain outstanding requests, waiting for the chip to answer each, then
    /// unsubscribe from the device. Idempotent.
    fn stop(&self) -> Result<()>;

    /// Submit a request; `callback` is invoked exactly once with the
    /// response or with the reason it will never come.
    ///
    /// Not usable for the few chip requests that produce no response.
    fn submit_async(&self, packet: Packet, callback: ResponseCallback);

    /// Submit a request and receive the response through a future.
    fn submit(&self, packet: Packet) -> PendingResponse {
        let (tx, rx) = mpsc::channel();
        self.submit_async(
            packet,
            Box::new(move |response| {
                // The caller may have stopped waiting; that is not an error.
                let _ = tx.send(response);
            }),
        );
        PendingResponse { rx }
    }
}

/// The pending response to a submitted request.
///
/// Waiting blocks the calling thread. Timing out does not cancel the
/// in-flight request — the chip will still process it; the caller just
/// stops listening.
#[derive(Debug)]
pub struct PendingResponse {
    rx: mpsc::Receiver<Result<Packet>>,
}

impl PendingResponse {
    /// Block until the response arrives.
    pub fn wait(self) -> Result<Packet> {
        match self.rx.recv() {
            Ok(response) => response,
            Err(mpsc::RecvError) => Err(SchedulerError::Stopped),
        }
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Packet> {
        match self.rx.recv_timeout(timeout) {
            Ok(response) => response,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(SchedulerError::Timeout { timeout }),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SchedulerError::Stopped),
        }
    }
}

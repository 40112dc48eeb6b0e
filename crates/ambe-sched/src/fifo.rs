use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use ambe_device::{ParityFlag, TaggingDevice};
use ambe_packet::Packet;
use tracing::warn;

use crate::error::{Result, SchedulerError};
use crate::{ResponseCallback, Scheduler};

/// The simplest possible scheduler, for transports that carry tags.
///
/// Each submission gets the next tag and goes straight to the device; the
/// response comes back with the same tag and is matched through a map. The
/// transport is free to reorder responses — a remote server interleaving
/// several clients will.
pub struct FifoScheduler {
    device: Arc<dyn TaggingDevice>,
    inner: Arc<Inner>,
}

struct Inner {
    parity: ParityFlag,
    state: Mutex<State>,
    drained: Condvar,
}

#[derive(Default)]
struct State {
    next_tag: u32,
    pending: HashMap<u32, ResponseCallback>,
    quit: bool,
}

impl FifoScheduler {
    pub fn new(device: Arc<dyn TaggingDevice>) -> Self {
        let parity = device.parity();
        FifoScheduler {
            device,
            inner: Arc::new(Inner {
                parity,
                state: Mutex::new(State::default()),
                drained: Condvar::new(),
            }),
        }
    }
}

impl Scheduler for FifoScheduler {
    fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.quit = false;
            state.next_tag = 0;
        }
        let inner = self.inner.clone();
        self.device.set_callback(Some(Arc::new(move |tag, bytes| {
            inner.on_receive(tag, bytes);
        })));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.pending.is_empty() {
                // Wait for the receive path to resolve everything that is
                // already on the wire.
                state.quit = true;
                while !state.pending.is_empty() {
                    state = self.inner.drained.wait(state).unwrap();
                }
            } else {
                state.quit = true;
            }
        }
        self.device.set_callback(None);
        Ok(())
    }

    fn submit_async(&self, packet: Packet, callback: ResponseCallback) {
        // The device send is quick (it hands the bytes to the stream), so
        // holding the lock across it keeps tag order and wire order equal.
        let mut state = self.inner.state.lock().unwrap();
        if state.quit {
            drop(state);
            callback(Err(SchedulerError::Stopped));
            return;
        }

        state.next_tag = state.next_tag.wrapping_add(1);
        let tag = state.next_tag;

        match self.device.send(tag, packet.as_bytes()) {
            Ok(()) => {
                state.pending.insert(tag, callback);
            }
            Err(err) => {
                drop(state);
                callback(Err(err.into()));
            }
        }
    }
}

impl Inner {
    /// Runs on the device's receiver thread.
    ///
    /// The callback is invoked under the scheduler lock so that stop cannot
    /// return while a response is still being delivered. Callbacks must not
    /// call back into the scheduler.
    fn on_receive(&self, tag: u32, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let Some(callback) = state.pending.remove(&tag) else {
            warn!(tag, "dropping response with unknown tag");
            return;
        };

        callback(Packet::parse(bytes, self.parity.get(), false).map_err(Into::into));

        if state.quit && state.pending.is_empty() {
            self.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use ambe_device::{CallbackSlot, Device, DeviceError, TaggedCallback};
    use ambe_packet::PacketType;

    use super::*;

    /// Echoes every request back after a small pseudo-random delay, out of
    /// order on purpose: responses funnel through a channel consumed by one
    /// responder thread per device, but the delay is applied before
    /// enqueueing, so arrival order scrambles under concurrency.
    struct EchoTaggingDevice {
        parity: ParityFlag,
        callback: Arc<CallbackSlot<TaggedCallback>>,
        responder: Mutex<Option<Responder>>,
        fail_sends: bool,
    }

    struct Responder {
        tx: mpsc::Sender<(u32, Vec<u8>)>,
        thread: thread::JoinHandle<()>,
    }

    impl EchoTaggingDevice {
        fn new(fail_sends: bool) -> Self {
            EchoTaggingDevice {
                parity: ParityFlag::default(),
                callback: Arc::new(CallbackSlot::new()),
                responder: Mutex::new(None),
                fail_sends,
            }
        }
    }

    impl Device for EchoTaggingDevice {
        fn start(&self) -> ambe_device::Result<()> {
            Ok(())
        }

        fn stop(&self) -> ambe_device::Result<()> {
            Ok(())
        }

        fn channels(&self) -> usize {
            1
        }

        fn parity(&self) -> ParityFlag {
            self.parity.clone()
        }
    }

    impl TaggingDevice for EchoTaggingDevice {
        fn set_callback(&self, callback: Option<TaggedCallback>) -> Option<TaggedCallback> {
            self.callback.set(callback)
        }

        fn send(&self, tag: u32, packet: &[u8]) -> ambe_device::Result<()> {
            if self.fail_sends {
                return Err(DeviceError::NotStarted);
            }
            let responder = self.responder.lock().unwrap();
            responder
                .as_ref()
                .expect("responder running")
                .tx
                .send((tag, packet.to_vec()))
                .unwrap();
            Ok(())
        }
    }

    fn start_responder(device: &Arc<EchoTaggingDevice>) {
        let (tx, rx) = mpsc::channel::<(u32, Vec<u8>)>();
        let callback_slot = device.callback.clone();
        let thread = thread::spawn(move || {
            while let Ok((tag, bytes)) = rx.recv() {
                // Deterministic pseudo-random delay up to 100 µs.
                let jitter = (tag.wrapping_mul(2_654_435_761) % 100) as u64;
                thread::sleep(Duration::from_micros(jitter));
                if let Some(callback) = callback_slot.get() {
                    callback(tag, &bytes);
                }
            }
        });
        *device.responder.lock().unwrap() = Some(Responder { tx, thread });
    }

    fn stop_responder(device: &Arc<EchoTaggingDevice>) {
        if let Some(responder) = device.responder.lock().unwrap().take() {
            drop(responder.tx);
            responder.thread.join().unwrap();
        }
    }

    fn request_packet(marker: [u16; 3]) -> Packet {
        let mut packet = Packet::new(PacketType::Control);
        packet.append_rate_words(&[marker[0], marker[1], marker[2], 0, 0, 0]);
        packet.finalize(true);
        packet
    }

    #[test]
    fn concurrent_submitters_get_their_own_responses() {
        const THREADS: u16 = 4;
        const PER_THREAD: u16 = 2_500;

        let device = Arc::new(EchoTaggingDevice::new(false));
        start_responder(&device);

        let scheduler = Arc::new(FifoScheduler::new(device.clone()));
        scheduler.start().unwrap();

        let workers: Vec<_> = (0..THREADS)
            .map(|thread_id| {
                let scheduler = scheduler.clone();
                thread::spawn(move || {
                    for seq in 0..PER_THREAD {
                        let mut request = request_packet([thread_id, seq, seq ^ 0x5aa5]);
                        let wire = request.finalize(true).to_vec();
                        let response = scheduler.submit(request).wait().unwrap();
                        // The echo carries the exact request bytes back.
                        assert_eq!(response.as_bytes(), &wire[..]);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        scheduler.stop().unwrap();
        stop_responder(&device);
    }

    #[test]
    fn stop_waits_for_outstanding_requests() {
        let device = Arc::new(EchoTaggingDevice::new(false));
        start_responder(&device);

        let scheduler = FifoScheduler::new(device.clone());
        scheduler.start().unwrap();

        let resolved = Arc::new(AtomicU32::new(0));
        for seq in 0..64u16 {
            let resolved = resolved.clone();
            scheduler.submit_async(
                request_packet([9, seq, 0]),
                Box::new(move |response| {
                    response.unwrap();
                    resolved.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        scheduler.stop().unwrap();
        assert_eq!(resolved.load(Ordering::SeqCst), 64);

        stop_responder(&device);
    }

    #[test]
    fn failed_send_resolves_callback_with_error() {
        let device = Arc::new(EchoTaggingDevice::new(true));
        let scheduler = FifoScheduler::new(device.clone());
        scheduler.start().unwrap();

        let response = scheduler.submit(request_packet([0, 0, 0])).wait();
        assert!(matches!(response, Err(SchedulerError::Device(_))));

        // Nothing is outstanding, so stop must not block.
        scheduler.stop().unwrap();
    }

    #[test]
    fn submit_after_stop_is_rejected() {
        let device = Arc::new(EchoTaggingDevice::new(false));
        start_responder(&device);

        let scheduler = FifoScheduler::new(device.clone());
        scheduler.start().unwrap();
        scheduler.stop().unwrap();

        let response = scheduler.submit(request_packet([1, 2, 3])).wait();
        assert!(matches!(response, Err(SchedulerError::Stopped)));

        stop_responder(&device);
    }

    #[test]
    fn unknown_tags_are_dropped() {
        let device = Arc::new(EchoTaggingDevice::new(false));
        let scheduler = FifoScheduler::new(device.clone());
        scheduler.start().unwrap();

        // Fire the receive path with a tag nobody asked about.
        let callback = device.callback.get().unwrap();
        callback(42, &[0x61, 0x00, 0x00, 0x00]);

        scheduler.stop().unwrap();
    }

    #[test]
    fn wait_timeout_leaves_request_in_flight() {
        let device = Arc::new(EchoTaggingDevice::new(false));
        // No responder: responses never arrive.
        let (tx, _rx) = mpsc::channel();
        *device.responder.lock().unwrap() = Some(Responder {
            tx,
            thread: thread::spawn(|| {}),
        });

        let scheduler = FifoScheduler::new(device.clone());
        scheduler.start().unwrap();

        let pending = scheduler.submit(request_packet([7, 7, 7]));
        let outcome = pending.wait_timeout(Duration::from_millis(10));
        assert!(matches!(outcome, Err(SchedulerError::Timeout { .. })));
    }
}

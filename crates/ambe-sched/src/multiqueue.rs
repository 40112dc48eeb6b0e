use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ambe_device::{FifoDevice, ParityFlag};
use ambe_packet::{Packet, PacketType};
use tracing::{error, warn};

use crate::error::{Result, SchedulerError};
use crate::{ResponseCallback, Scheduler};

/// Queues per chip channel: one for the compressor, one for the decompressor
/// (each channel has two CPU cores).
const QUEUES_PER_CHANNEL: usize = 2;

/// The largest chip this scheduler knows how to drive.
const MAX_CHANNELS: usize = 3;

/// Packets the chip's input buffer can hold beyond the per-core pipelines:
/// two SPEECH and two CHANNEL slots.
const INPUT_BUFFER_SLOTS: usize = 4;

/// Per-core in-flight budget: one packet being processed, one waiting in the
/// input buffer.
const PER_QUEUE_LIMIT: usize = 2;

/// Traffic shaper for multi-channel AMBE chips (USB-3000, USB-3003).
///
/// The chip runs two CPU cores per channel and buffers at most four extra
/// packets. This scheduler keeps one queue per core plus one for
/// device-wide control requests, admits packets only while the chip has
/// room, and round-robins the cores so no producer can starve the others.
/// Because the underlying device is FIFO, the oldest outstanding request
/// always matches the next response.
pub struct MultiQueueScheduler {
    device: Arc<dyn FifoDevice>,
    channels: usize,
    worker: Mutex<Option<WorkerHandle>>,
}

struct WorkerHandle {
    tx: Sender<WorkerMessage>,
    thread: JoinHandle<()>,
}

enum WorkerMessage {
    /// A new request with its response callback.
    Submit(Packet, ResponseCallback),
    /// Raw bytes of a response received from the device.
    Response(Vec<u8>),
    /// Drain everything, acknowledge, and exit.
    Stop(Sender<()>),
}

impl MultiQueueScheduler {
    pub fn new(device: Arc<dyn FifoDevice>, channels: usize) -> Result<Self> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(SchedulerError::InvalidChannelCount {
                channels,
                max: MAX_CHANNELS,
            });
        }
        Ok(MultiQueueScheduler {
            device,
            channels,
            worker: Mutex::new(None),
        })
    }
}

impl Scheduler for MultiQueueScheduler {
    fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::channel();

        // The device's receiver thread forwards responses into the worker's
        // mailbox; all scheduling state stays on the worker thread.
        let response_tx = tx.clone();
        self.device.set_callback(Some(Arc::new(move |bytes| {
            let _ = response_tx.send(WorkerMessage::Response(bytes.to_vec()));
        })));

        let mut state = Worker::new(self.device.clone(), self.channels);
        let thread = std::thread::Builder::new()
            .name("ambe-sched".into())
            .spawn(move || state.run(rx))
            .map_err(SchedulerError::Spawn)?;

        *worker = Some(WorkerHandle { tx, thread });
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let Some(WorkerHandle { tx, thread }) = self.worker.lock().unwrap().take() else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = mpsc::channel();
        if tx.send(WorkerMessage::Stop(ack_tx)).is_ok() {
            // The ack arrives once every queued and submitted request has
            // been answered. A worker that died early drops the ack sender.
            let _ = ack_rx.recv();
        }
        if thread.join().is_err() {
            warn!("scheduler worker panicked");
        }
        self.device.set_callback(None);
        Ok(())
    }

    fn submit_async(&self, packet: Packet, callback: ResponseCallback) {
        let worker = self.worker.lock().unwrap();
        let Some(handle) = worker.as_ref() else {
            drop(worker);
            callback(Err(SchedulerError::Stopped));
            return;
        };

        if let Err(returned) = handle.tx.send(WorkerMessage::Submit(packet, callback)) {
            drop(worker);
            if let WorkerMessage::Submit(_, callback) = returned.0 {
                callback(Err(SchedulerError::Stopped));
            }
        }
    }
}

/// One request owned by the worker: the packet, and the callback until the
/// response arrives.
struct State {
    packet: Packet,
    callback: Option<ResponseCallback>,
}

struct Worker {
    device: Arc<dyn FifoDevice>,
    parity: ParityFlag,
    channels: usize,

    /// Device-wide control requests, dispatched ahead of channel work.
    device_queue: VecDeque<State>,
    /// One queue per (channel, type class).
    channel_queues: Vec<VecDeque<State>>,
    /// Sent to the chip, response not yet received. FIFO by construction.
    submitted: VecDeque<State>,

    /// In-flight counts per type class (0 = speech/control, 1 = channel),
    /// counting only requests routed through channel queues.
    submitted_by_class: [usize; QUEUES_PER_CHANNEL],
    /// In-flight counts per channel queue.
    submitted_by_queue: Vec<usize>,

    /// Requests waiting in any queue.
    queued: usize,
    /// Round-robin cursor over the channel queues.
    next: usize,
}

impl Worker {
    fn new(device: Arc<dyn FifoDevice>, channels: usize) -> Self {
        let parity = device.parity();
        let queues = channels * QUEUES_PER_CHANNEL;
        Worker {
            device,
            parity,
            channels,
            device_queue: VecDeque::new(),
            channel_queues: (0..queues).map(|_| VecDeque::new()).collect(),
            submitted: VecDeque::new(),
            submitted_by_class: [0; QUEUES_PER_CHANNEL],
            submitted_by_queue: vec![0; queues],
            queued: 0,
            next: 0,
        }
    }

    /// Type class of a request: CHANNEL packets compete for the chip's two
    /// channel-data slots; SPEECH and CONTROL packets for the other two
    /// (control packets are processed immediately and never keep a core
    /// busy, so they share the speech class).
    fn class_of(packet: &Packet) -> usize {
        match packet.kind() {
            PacketType::Channel => 1,
            PacketType::Speech | PacketType::Control => 0,
        }
    }

    /// The channel queue a request belongs to, or `None` for device-wide
    /// requests (no channel selector at the head of the payload).
    fn queue_index(&self, packet: &Packet) -> Option<usize> {
        packet
            .channel()
            .map(|channel| channel as usize * QUEUES_PER_CHANNEL + Self::class_of(packet))
    }

    /// Whether the chip can accept this request right now.
    fn can_send(&self, packet: &Packet) -> bool {
        // One packet can be processing on each core, plus four buffered.
        if self.submitted.len() >= self.channel_queues.len() + INPUT_BUFFER_SLOTS {
            return false;
        }

        // The buffer holds two packets of each class; with one more
        // processing per channel, at most channels + 2 of a class can be
        // outstanding.
        if self.submitted_by_class[Self::class_of(packet)] >= self.channels + 2 {
            return false;
        }

        // The class and total checks overcommit when a channel runs dry;
        // cap each core at one processing plus one buffered.
        if let Some(queue) = self.queue_index(packet) {
            if self.submitted_by_queue[queue] >= PER_QUEUE_LIMIT {
                return false;
            }
        }

        true
    }

    fn run(&mut self, rx: Receiver<WorkerMessage>) {
        let mut quit = false;
        let mut stop_ack: Option<Sender<()>> = None;

        while !quit || self.queued > 0 || !self.submitted.is_empty() {
            let message = match rx.recv() {
                Ok(message) => message,
                // The scheduler handle was dropped without stop().
                Err(_) => break,
            };

            match message {
                WorkerMessage::Stop(ack) => {
                    quit = true;
                    stop_ack = Some(ack);
                }
                WorkerMessage::Submit(packet, callback) => {
                    let state = State {
                        packet,
                        callback: Some(callback),
                    };
                    match self.queue_index(&state.packet) {
                        None => self.device_queue.push_back(state),
                        Some(queue) => self.channel_queues[queue].push_back(state),
                    }
                    self.queued += 1;
                }
                WorkerMessage::Response(bytes) => self.deliver(&bytes),
            }

            if !self.dispatch() {
                self.fail_all();
                break;
            }
        }

        if let Some(ack) = stop_ack {
            let _ = ack.send(());
        }
    }

    /// Match a response to the oldest outstanding request.
    fn deliver(&mut self, bytes: &[u8]) {
        let Some(mut state) = self.submitted.pop_front() else {
            warn!("dropping response with no outstanding request");
            return;
        };

        if let Some(queue) = self.queue_index(&state.packet) {
            self.submitted_by_class[Self::class_of(&state.packet)] -= 1;
            self.submitted_by_queue[queue] -= 1;
        }

        if let Some(callback) = state.callback.take() {
            callback(Packet::parse(bytes, self.parity.get(), false).map_err(Into::into));
        }
    }

    /// Move admissible requests from the queues to the device.
    ///
    /// Returns false when the device write failed; the worker is done then.
    fn dispatch(&mut self) -> bool {
        // Device-wide control requests jump the line: they are answered
        // immediately by the chip and unblock whoever is reconfiguring it.
        while self
            .device_queue
            .front()
            .is_some_and(|state| self.can_send(&state.packet))
        {
            let state = self.device_queue.pop_front().unwrap();
            self.queued -= 1;
            if !self.write(state, None) {
                return false;
            }
        }

        // Round-robin over the channel queues. A successful send restarts
        // the sweep so queues unblocked by the freed budget are served
        // within the same wake-up.
        let queues = self.channel_queues.len();
        let mut sweep = 0;
        while sweep < queues && self.queued > 0 {
            let queue = self.next;
            self.next = (self.next + 1) % queues;

            let admissible = self.channel_queues[queue]
                .front()
                .is_some_and(|state| self.can_send(&state.packet));
            if admissible {
                let state = self.channel_queues[queue].pop_front().unwrap();
                self.queued -= 1;
                if !self.write(state, Some(queue)) {
                    return false;
                }
                sweep = 1;
            } else {
                sweep += 1;
            }
        }

        true
    }

    /// Write one request to the device and account for it.
    fn write(&mut self, mut state: State, queue: Option<usize>) -> bool {
        match self.device.send(state.packet.as_bytes()) {
            Ok(()) => {
                if let Some(queue) = queue {
                    self.submitted_by_class[Self::class_of(&state.packet)] += 1;
                    self.submitted_by_queue[queue] += 1;
                }
                self.submitted.push_back(state);
                true
            }
            Err(err) => {
                error!(error = %err, "device write failed; scheduler terminating");
                if let Some(callback) = state.callback.take() {
                    callback(Err(err.into()));
                }
                false
            }
        }
    }

    /// Resolve every remaining callback after a fatal device error.
    fn fail_all(&mut self) {
        let drained = self
            .device_queue
            .drain(..)
            .chain(self.channel_queues.iter_mut().flat_map(|q| q.drain(..)))
            .chain(self.submitted.drain(..));
        for mut state in drained {
            if let Some(callback) = state.callback.take() {
                callback(Err(SchedulerError::Stopped));
            }
        }
        self.queued = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use ambe_device::{CallbackSlot, Device, DeviceError, FifoCallback};
    use ambe_packet::FieldKind;

    use super::*;

    /// A mock chip: answers each request in FIFO order after a short delay,
    /// and records how far the scheduler ever overcommitted it.
    struct MockChip {
        parity: ParityFlag,
        callback: Arc<CallbackSlot<FifoCallback>>,
        pipe: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
        stats: Arc<ChipStats>,
        fail_sends: bool,
    }

    #[derive(Default)]
    struct ChipStats {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        per_queue: [AtomicUsize; 6],
        max_per_queue: [AtomicUsize; 6],
        responded: AtomicUsize,
    }

    impl ChipStats {
        fn queue_of(frame: &[u8]) -> Option<usize> {
            let channel = match frame.get(4).copied() {
                Some(byte @ 0x40..=0x42) => (byte - 0x40) as usize,
                _ => return None,
            };
            let class = if frame[3] == 0x01 { 1 } else { 0 };
            Some(channel * 2 + class)
        }

        fn record_send(&self, frame: &[u8]) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(queue) = Self::queue_of(frame) {
                let now = self.per_queue[queue].fetch_add(1, Ordering::SeqCst) + 1;
                self.max_per_queue[queue].fetch_max(now, Ordering::SeqCst);
            }
        }

        fn record_response(&self, frame: &[u8]) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some(queue) = Self::queue_of(frame) {
                self.per_queue[queue].fetch_sub(1, Ordering::SeqCst);
            }
            self.responded.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl MockChip {
        fn new(fail_sends: bool) -> Arc<Self> {
            Arc::new(MockChip {
                parity: ParityFlag::new(false),
                callback: Arc::new(CallbackSlot::new()),
                pipe: Mutex::new(None),
                stats: Arc::new(ChipStats::default()),
                fail_sends,
            })
        }

        /// Spawn the FIFO responder; returns a guard channel owner.
        fn power_on(self: &Arc<Self>, delay: Duration) -> thread::JoinHandle<()> {
            let (tx, rx) = mpsc::channel::<Vec<u8>>();
            *self.pipe.lock().unwrap() = Some(tx);

            let stats = self.stats.clone();
            let callback_slot = self.callback.clone();
            thread::spawn(move || {
                while let Ok(frame) = rx.recv() {
                    thread::sleep(delay);
                    stats.record_response(&frame);
                    if let Some(callback) = callback_slot.get() {
                        // Echo the request as its own response.
                        callback(&frame);
                    }
                }
            })
        }

        fn power_off(&self) {
            self.pipe.lock().unwrap().take();
        }
    }

    impl Device for MockChip {
        fn start(&self) -> ambe_device::Result<()> {
            Ok(())
        }

        fn stop(&self) -> ambe_device::Result<()> {
            Ok(())
        }

        fn channels(&self) -> usize {
            3
        }

        fn parity(&self) -> ParityFlag {
            self.parity.clone()
        }
    }

    impl FifoDevice for MockChip {
        fn set_callback(&self, callback: Option<FifoCallback>) -> Option<FifoCallback> {
            self.callback.set(callback)
        }

        fn send(&self, packet: &[u8]) -> ambe_device::Result<()> {
            if self.fail_sends {
                return Err(DeviceError::NotStarted);
            }
            self.stats.record_send(packet);
            self.pipe
                .lock()
                .unwrap()
                .as_ref()
                .expect("chip powered on")
                .send(packet.to_vec())
                .unwrap();
            Ok(())
        }
    }

    fn speech_request(channel: u8, seq: i16) -> Packet {
        let mut packet = Packet::new(PacketType::Speech);
        packet.append_channel(channel).unwrap();
        packet.append_samples(&[seq, seq, seq, seq]).unwrap();
        packet.finalize(false);
        packet
    }

    fn channel_request(channel: u8, seq: u8) -> Packet {
        let mut packet = Packet::new(PacketType::Channel);
        packet.append_channel(channel).unwrap();
        packet.append_bits(&[seq, seq], 16).unwrap();
        packet.finalize(false);
        packet
    }

    fn control_request(kind: FieldKind) -> Packet {
        let mut packet = Packet::new(PacketType::Control);
        packet.append_field(kind);
        packet.finalize(false);
        packet
    }

    #[test]
    fn admission_bounds_hold_under_load() {
        let chip = MockChip::new(false);
        let responder = chip.power_on(Duration::from_millis(1));

        let scheduler = MultiQueueScheduler::new(chip.clone(), 3).unwrap();
        scheduler.start().unwrap();

        let mut pending = Vec::new();
        for i in 0..100u8 {
            let channel = i % 3;
            let packet = if i % 2 == 0 {
                speech_request(channel, i as i16)
            } else {
                channel_request(channel, i)
            };
            pending.push(scheduler.submit(packet));
        }

        for response in pending {
            response.wait().unwrap();
        }
        scheduler.stop().unwrap();
        chip.power_off();
        responder.join().unwrap();

        // 3 channels: at most 3*2+4 packets in flight, at most 2 per core.
        assert_eq!(chip.stats.responded.load(Ordering::SeqCst), 100);
        assert!(chip.stats.max_in_flight.load(Ordering::SeqCst) <= 10);
        for queue in &chip.stats.max_per_queue {
            assert!(queue.load(Ordering::SeqCst) <= 2);
        }
    }

    #[test]
    fn responses_arrive_in_submission_order_per_queue() {
        let chip = MockChip::new(false);
        let responder = chip.power_on(Duration::from_micros(100));

        let scheduler = MultiQueueScheduler::new(chip.clone(), 1).unwrap();
        scheduler.start().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for seq in 0..32i16 {
            let order = order.clone();
            scheduler.submit_async(
                speech_request(0, seq),
                Box::new(move |response| {
                    let response = response.unwrap();
                    order.lock().unwrap().push(response.samples().unwrap()[0]);
                }),
            );
        }

        scheduler.stop().unwrap();
        chip.power_off();
        responder.join().unwrap();

        let order = order.lock().unwrap();
        assert_eq!(*order, (0..32).collect::<Vec<i16>>());
    }

    #[test]
    fn device_requests_are_served_and_answered() {
        let chip = MockChip::new(false);
        let responder = chip.power_on(Duration::from_micros(50));

        let scheduler = MultiQueueScheduler::new(chip.clone(), 3).unwrap();
        scheduler.start().unwrap();

        // Mix device-wide control with channel traffic.
        let mut pending = Vec::new();
        for i in 0..10u8 {
            pending.push(scheduler.submit(speech_request(i % 3, i as i16)));
            pending.push(scheduler.submit(control_request(FieldKind::ProdId)));
        }
        for response in pending {
            response.wait().unwrap();
        }

        scheduler.stop().unwrap();
        chip.power_off();
        responder.join().unwrap();
        assert_eq!(chip.stats.responded.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn stop_drains_all_outstanding_work() {
        let chip = MockChip::new(false);
        let responder = chip.power_on(Duration::from_micros(200));

        let scheduler = MultiQueueScheduler::new(chip.clone(), 3).unwrap();
        scheduler.start().unwrap();

        let resolved = Arc::new(AtomicUsize::new(0));
        for i in 0..50u8 {
            let resolved = resolved.clone();
            scheduler.submit_async(
                channel_request(i % 3, i),
                Box::new(move |response| {
                    response.unwrap();
                    resolved.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        scheduler.stop().unwrap();
        assert_eq!(resolved.load(Ordering::SeqCst), 50);

        // Stop is idempotent, and submissions after it fail cleanly.
        scheduler.stop().unwrap();
        let late = scheduler.submit(channel_request(0, 0)).wait();
        assert!(matches!(late, Err(SchedulerError::Stopped)));

        chip.power_off();
        responder.join().unwrap();
    }

    #[test]
    fn device_write_failure_fails_pending_requests() {
        let chip = MockChip::new(true);
        let scheduler = MultiQueueScheduler::new(chip.clone(), 3).unwrap();
        scheduler.start().unwrap();

        let first = scheduler.submit(speech_request(0, 1));
        let outcome = first.wait();
        assert!(matches!(
            outcome,
            Err(SchedulerError::Device(_)) | Err(SchedulerError::Stopped)
        ));

        scheduler.stop().unwrap();
    }

    #[test]
    fn rejects_impossible_channel_counts() {
        let chip = MockChip::new(false);
        assert!(matches!(
            MultiQueueScheduler::new(chip.clone(), 0),
            Err(SchedulerError::InvalidChannelCount { .. })
        ));
        assert!(matches!(
            MultiQueueScheduler::new(chip, 4),
            Err(SchedulerError::InvalidChannelCount { .. })
        ));
    }
}

use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};

use ambe_device::{ChannelManager, ParityFlag};
use ambe_packet::Packet;
use ambe_sched::Scheduler;
use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::session::SessionMessage;
use crate::wire::{read_frame, write_frame, CONTROL_TAG};

/// One chip shared by the server: its scheduler, parity state, and the
/// channel lease bookkeeping.
pub struct SharedChip {
    id: String,
    scheduler: Arc<dyn Scheduler>,
    parity: ParityFlag,
    manager: ChannelManager,
}

impl SharedChip {
    pub fn new(
        id: impl Into<String>,
        scheduler: Arc<dyn Scheduler>,
        parity: ParityFlag,
        channels: usize,
    ) -> ambe_device::Result<Self> {
        let id = id.into();
        let manager = ChannelManager::new();
        manager.add(&id, channels)?;
        Ok(SharedChip {
            id,
            scheduler,
            parity,
            manager,
        })
    }
}

/// Accept client sessions forever, one thread per connection.
pub fn serve(listener: TcpListener, chip: Arc<SharedChip>) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "AMBE sharing server listening");
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let chip = chip.clone();
                let spawned = std::thread::Builder::new()
                    .name("ambe-session".into())
                    .spawn(move || {
                        if let Err(err) = session(stream, &chip) {
                            warn!(%peer, error = %err, "session ended with error");
                        }
                    });
                if let Err(err) = spawned {
                    warn!(%peer, error = %err, "failed to spawn session thread");
                }
            }
            Err(err) => warn!(error = %err, "accept failed"),
        }
    }
}

/// Drive one client session to completion.
///
/// The session leases a channel (or reports busy), announces it together
/// with the chip's parity setting, then forwards tagged requests into the
/// shared scheduler. Responses are written back from scheduler callbacks; a
/// write that fails because the client is already gone is logged and
/// dropped — the reader side notices the closed socket and releases the
/// channel.
pub fn session(mut stream: TcpStream, chip: &SharedChip) -> crate::error::Result<()> {
    let _ = stream.set_nodelay(true);

    let (device_id, channel) = match chip.manager.acquire() {
        Ok(lease) => lease,
        Err(err) => {
            let busy = SessionMessage::Busy {
                reason: err.to_string(),
            }
            .encode()?;
            write_frame(&mut stream, CONTROL_TAG, &busy)?;
            return Ok(());
        }
    };
    debug!(chip = %chip.id, channel, "session leased channel");

    let outcome = serve_leased(&mut stream, chip, channel);
    chip.manager
        .release(&device_id, channel)
        .unwrap_or_else(|err| warn!(error = %err, "channel release failed"));
    debug!(chip = %chip.id, channel, "session released channel");
    outcome
}

fn serve_leased(
    stream: &mut TcpStream,
    chip: &SharedChip,
    channel: usize,
) -> crate::error::Result<()> {
    let hello = SessionMessage::Hello {
        channel: channel as u8,
        uses_parity: chip.parity.get(),
    }
    .encode()?;
    write_frame(stream, CONTROL_TAG, &hello)?;

    let writer = Arc::new(Mutex::new(stream.try_clone()?));
    let mut buf = BytesMut::new();

    loop {
        let frame = match read_frame(stream, &mut buf) {
            Ok(frame) => frame,
            Err(RemoteError::ConnectionClosed) => return Ok(()),
            Err(err) => return Err(err),
        };

        if frame.tag == CONTROL_TAG {
            match SessionMessage::decode(&frame.payload)? {
                SessionMessage::Ping { seq } => {
                    let pong = SessionMessage::Pong { seq }.encode()?;
                    let mut writer = writer.lock().unwrap();
                    write_frame(&mut *writer, CONTROL_TAG, &pong)?;
                }
                other => {
                    return Err(RemoteError::Protocol(format!(
                        "unexpected session message {other:?}"
                    )));
                }
            }
            continue;
        }

        // A malformed packet means the client and server disagree about the
        // stream state; there is no way to keep multiplexing after that.
        let packet = Packet::parse(&frame.payload, chip.parity.get(), false)
            .map_err(|err| RemoteError::Protocol(err.to_string()))?;

        let tag = frame.tag;
        let writer = writer.clone();
        chip.scheduler.submit_async(
            packet,
            Box::new(move |response| {
                // An empty payload tells the client the request failed.
                let payload = match &response {
                    Ok(packet) => packet.as_bytes().to_vec(),
                    Err(err) => {
                        warn!(tag, error = %err, "request failed on shared chip");
                        Vec::new()
                    }
                };
                let mut writer = writer.lock().unwrap();
                if let Err(err) = write_frame(&mut *writer, tag, &payload) {
                    warn!(tag, error = %err, "dropping response for closed session");
                }
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use ambe_device::{CallbackSlot, Device, FifoCallback, FifoDevice};
    use ambe_packet::PacketType;
    use ambe_sched::{FifoScheduler, MultiQueueScheduler, Scheduler};

    use super::*;
    use crate::client::RemoteDevice;

    /// Minimal chip stand-in: echoes requests in FIFO order off a thread.
    struct LoopChip {
        parity: ParityFlag,
        callback: Arc<CallbackSlot<FifoCallback>>,
        pipe: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    }

    impl LoopChip {
        fn new() -> Arc<Self> {
            Arc::new(LoopChip {
                parity: ParityFlag::new(false),
                callback: Arc::new(CallbackSlot::new()),
                pipe: Mutex::new(None),
            })
        }

        fn power_on(self: &Arc<Self>) {
            let (tx, rx) = mpsc::channel::<Vec<u8>>();
            *self.pipe.lock().unwrap() = Some(tx);
            let callback_slot = self.callback.clone();
            let _ = thread::spawn(move || {
                while let Ok(frame) = rx.recv() {
                    thread::sleep(Duration::from_micros(100));
                    if let Some(callback) = callback_slot.get() {
                        callback(&frame);
                    }
                }
            });
        }
    }

    impl Device for LoopChip {
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

    impl FifoDevice for LoopChip {
        fn set_callback(&self, callback: Option<FifoCallback>) -> Option<FifoCallback> {
            self.callback.set(callback)
        }

        fn send(&self, packet: &[u8]) -> ambe_device::Result<()> {
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

    fn start_server(channels: usize) -> (std::net::SocketAddr, Arc<dyn Scheduler>) {
        let chip = LoopChip::new();
        chip.power_on();
        let scheduler: Arc<dyn Scheduler> =
            Arc::new(MultiQueueScheduler::new(chip.clone(), 3).unwrap());
        scheduler.start().unwrap();

        let shared = Arc::new(
            SharedChip::new("test-chip", scheduler.clone(), chip.parity(), channels).unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _ = thread::spawn(move || {
            let _ = serve(listener, shared);
        });
        (addr, scheduler)
    }

    fn request(seq: i16) -> Packet {
        let mut packet = Packet::new(PacketType::Speech);
        packet.append_channel(0).unwrap();
        packet.append_samples(&[seq; 8]).unwrap();
        packet.finalize(false);
        packet
    }

    #[test]
    fn end_to_end_echo_through_shared_chip() {
        let (addr, server_scheduler) = start_server(3);

        let device = Arc::new(RemoteDevice::new(addr.to_string()));
        device.start().unwrap();
        assert!(device.channel().is_some());
        // The server announced the chip's parity setting.
        assert!(!device.parity().get());

        let scheduler = FifoScheduler::new(device.clone());
        scheduler.start().unwrap();

        let mut pending = Vec::new();
        for seq in 0..24i16 {
            pending.push((seq, scheduler.submit(request(seq))));
        }
        for (seq, response) in pending {
            let packet = response.wait().unwrap();
            assert_eq!(packet.samples().unwrap(), vec![seq; 8]);
        }

        scheduler.stop().unwrap();
        device.stop().unwrap();
        server_scheduler.stop().unwrap();
    }

    #[test]
    fn server_reports_busy_when_channels_run_out() {
        let (addr, _scheduler) = start_server(1);

        let first = Arc::new(RemoteDevice::new(addr.to_string()));
        first.start().unwrap();

        let second = Arc::new(RemoteDevice::new(addr.to_string()));
        let err = second.start().unwrap_err();
        assert!(matches!(err, ambe_device::DeviceError::NoFreeChannel));

        // Releasing the lease frees the channel for the next client.
        first.stop().unwrap();
        // The server needs a moment to notice the closed socket.
        for _ in 0..50 {
            if second.start().is_ok() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(second.channel().is_some());
        second.stop().unwrap();
    }

    #[test]
    fn ping_round_trips() {
        let (addr, _scheduler) = start_server(3);

        let device = Arc::new(RemoteDevice::new(addr.to_string()));
        device.start().unwrap();
        device.ping(1, Duration::from_secs(2)).unwrap();
        device.ping(2, Duration::from_secs(2)).unwrap();
        device.stop().unwrap();
    }

    #[test]
    fn out_of_order_completion_is_correlated_by_tag() {
        let (addr, _scheduler) = start_server(3);

        let device = Arc::new(RemoteDevice::new(addr.to_string()));
        device.start().unwrap();
        let scheduler = Arc::new(FifoScheduler::new(device.clone()));
        scheduler.start().unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let scheduler = scheduler.clone();
                let done = done.clone();
                thread::spawn(move || {
                    for i in 0..32 {
                        let seq = (worker * 100 + i) as i16;
                        let packet = scheduler.submit(request(seq)).wait().unwrap();
                        assert_eq!(packet.samples().unwrap(), vec![seq; 8]);
                        done.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 128);

        scheduler.stop().unwrap();
        device.stop().unwrap();
    }

    #[test]
    fn control_frames_reject_non_ping_messages() {
        let (addr, _scheduler) = start_server(3);

        let mut stream = TcpStream::connect(addr).unwrap();
        let mut buf = BytesMut::new();
        // Swallow the hello.
        let hello = read_frame(&mut stream, &mut buf).unwrap();
        assert_eq!(hello.tag, CONTROL_TAG);

        // A client must not send hello; the server hangs up.
        let bogus = SessionMessage::Hello {
            channel: 0,
            uses_parity: true,
        }
        .encode()
        .unwrap();
        write_frame(&mut stream, CONTROL_TAG, &bogus).unwrap();

        let outcome = read_frame(&mut stream, &mut buf);
        assert!(matches!(outcome, Err(RemoteError::ConnectionClosed)));
    }

    #[test]
    fn failed_requests_come_back_as_empty_frames() {
        // A chip whose scheduler is stopped: every submit fails, so the
        // session answers with empty payloads and the client surfaces a
        // parse error.
        let chip = LoopChip::new();
        chip.power_on();
        let scheduler: Arc<dyn Scheduler> =
            Arc::new(MultiQueueScheduler::new(chip.clone(), 3).unwrap());
        // Deliberately never started.
        let shared = Arc::new(
            SharedChip::new("dead-chip", scheduler, chip.parity(), 3).unwrap(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _ = thread::spawn(move || {
            let _ = serve(listener, shared);
        });

        let device = Arc::new(RemoteDevice::new(addr.to_string()));
        device.start().unwrap();
        let scheduler = FifoScheduler::new(device.clone());
        scheduler.start().unwrap();

        let outcome = scheduler.submit(request(5)).wait();
        assert!(outcome.is_err());

        scheduler.stop().unwrap();
        device.stop().unwrap();
    }
}

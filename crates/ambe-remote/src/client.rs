use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use ambe_device::{
    CallbackSlot, Device, DeviceError, ParityFlag, TaggedCallback, TaggingDevice,
};
use bytes::BytesMut;
use tracing::{debug, error, warn};

use crate::error::RemoteError;
use crate::session::SessionMessage;
use crate::wire::{read_frame, write_frame, CONTROL_TAG};

/// A leased channel on a remote chip, as a tagging device.
///
/// On start the client connects, receives the server's hello (assigned
/// channel and parity setting), and spawns a receiver thread. The server
/// multiplexes several clients onto one chip, so responses come back in
/// whatever order the chip scheduler produced them — correlation is by tag.
pub struct RemoteDevice {
    authority: String,
    parity: ParityFlag,
    callback: Arc<CallbackSlot<TaggedCallback>>,
    pong: Arc<PongState>,
    io: Mutex<Option<RemoteIo>>,
    channel: Mutex<Option<u8>>,
}

struct RemoteIo {
    stream: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    terminating: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PongState {
    latest: Mutex<u64>,
    arrived: Condvar,
}

impl RemoteDevice {
    pub fn new(authority: impl Into<String>) -> Self {
        RemoteDevice {
            authority: authority.into(),
            parity: ParityFlag::default(),
            callback: Arc::new(CallbackSlot::new()),
            pong: Arc::new(PongState::default()),
            io: Mutex::new(None),
            channel: Mutex::new(None),
        }
    }

    /// The chip channel the server assigned, once started.
    pub fn channel(&self) -> Option<u8> {
        *self.channel.lock().unwrap()
    }

    /// Round-trip a ping through the server's control path.
    pub fn ping(&self, seq: u64, timeout: Duration) -> ambe_device::Result<()> {
        {
            let io = self.io.lock().unwrap();
            let io = io.as_ref().ok_or(DeviceError::NotStarted)?;
            let message = SessionMessage::Ping { seq }
                .encode()
                .map_err(|err| DeviceError::Protocol(err.to_string()))?;
            let mut writer = io.writer.lock().unwrap();
            write_frame(&mut *writer, CONTROL_TAG, &message)
                .map_err(|err| DeviceError::Protocol(err.to_string()))?;
        }

        let mut latest = self.pong.latest.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while *latest < seq {
            let remaining = deadline
                .checked_duration_since(std::time::Instant::now())
                .ok_or_else(|| DeviceError::Protocol("ping timed out".to_string()))?;
            let (guard, _) = self.pong.arrived.wait_timeout(latest, remaining).unwrap();
            latest = guard;
        }
        Ok(())
    }
}

impl Device for RemoteDevice {
    fn start(&self) -> ambe_device::Result<()> {
        let mut io = self.io.lock().unwrap();
        if io.is_some() {
            return Err(DeviceError::AlreadyStarted);
        }

        let mut stream = TcpStream::connect(&self.authority)
            .map_err(|err| DeviceError::Transport(err.into()))?;
        // Requests are single small packets; never wait to coalesce them.
        let _ = stream.set_nodelay(true);

        // The server speaks first: hello with our lease, or busy.
        let mut buf = BytesMut::new();
        let hello = read_frame(&mut stream, &mut buf)
            .map_err(|err| DeviceError::Protocol(err.to_string()))?;
        if hello.tag != CONTROL_TAG {
            return Err(DeviceError::Protocol(format!(
                "expected hello on control tag, got tag {}",
                hello.tag
            )));
        }
        match SessionMessage::decode(&hello.payload)
            .map_err(|err| DeviceError::Protocol(err.to_string()))?
        {
            SessionMessage::Hello {
                channel,
                uses_parity,
            } => {
                self.parity.set(uses_parity);
                *self.channel.lock().unwrap() = Some(channel);
                debug!(authority = %self.authority, channel, uses_parity, "session established");
            }
            SessionMessage::Busy { reason } => {
                warn!(authority = %self.authority, %reason, "server has no free channel");
                return Err(DeviceError::NoFreeChannel);
            }
            other => {
                return Err(DeviceError::Protocol(format!(
                    "unexpected session message {other:?}"
                )));
            }
        }

        let writer = Arc::new(Mutex::new(
            stream
                .try_clone()
                .map_err(|err| DeviceError::Transport(err.into()))?,
        ));
        let terminating = Arc::new(AtomicBool::new(false));

        let receiver = {
            let mut reader = stream
                .try_clone()
                .map_err(|err| DeviceError::Transport(err.into()))?;
            let callback = self.callback.clone();
            let pong = self.pong.clone();
            let terminating = terminating.clone();
            let authority = self.authority.clone();
            std::thread::Builder::new()
                .name("ambe-remote-rx".into())
                .spawn(move || loop {
                    match read_frame(&mut reader, &mut buf) {
                        Ok(frame) if frame.tag == CONTROL_TAG => {
                            match SessionMessage::decode(&frame.payload) {
                                Ok(SessionMessage::Pong { seq }) => {
                                    let mut latest = pong.latest.lock().unwrap();
                                    *latest = (*latest).max(seq);
                                    pong.arrived.notify_all();
                                }
                                Ok(other) => {
                                    warn!(?other, "unexpected control message")
                                }
                                Err(err) => warn!(error = %err, "bad control message"),
                            }
                        }
                        Ok(frame) => {
                            if let Some(callback) = callback.get() {
                                callback(frame.tag, &frame.payload);
                            }
                        }
                        Err(RemoteError::ConnectionClosed) => {
                            // Reconnecting would mean a fresh channel lease;
                            // let the application decide that.
                            if !terminating.load(Ordering::SeqCst) {
                                error!(%authority, "lost connection to server");
                            }
                            break;
                        }
                        Err(err) => {
                            error!(%authority, error = %err, "receiver terminated");
                            break;
                        }
                    }
                })
                .map_err(DeviceError::Spawn)?
        };

        *io = Some(RemoteIo {
            stream,
            writer,
            terminating,
            receiver: Some(receiver),
        });
        Ok(())
    }

    fn stop(&self) -> ambe_device::Result<()> {
        let Some(mut io) = self.io.lock().unwrap().take() else {
            return Ok(());
        };

        io.terminating.store(true, Ordering::SeqCst);
        // Shutting the socket down unblocks the receiver's read.
        if let Err(err) = io.stream.shutdown(Shutdown::Both) {
            warn!(authority = %self.authority, error = %err, "socket shutdown failed");
        }
        if let Some(receiver) = io.receiver.take() {
            if receiver.join().is_err() {
                warn!(authority = %self.authority, "receiver thread panicked");
            }
        }
        debug!(authority = %self.authority, "session closed");
        Ok(())
    }

    /// A session leases exactly one channel on the remote chip.
    fn channels(&self) -> usize {
        1
    }

    fn parity(&self) -> ParityFlag {
        self.parity.clone()
    }
}

impl TaggingDevice for RemoteDevice {
    fn set_callback(&self, callback: Option<TaggedCallback>) -> Option<TaggedCallback> {
        self.callback.set(callback)
    }

    fn send(&self, tag: u32, packet: &[u8]) -> ambe_device::Result<()> {
        let io = self.io.lock().unwrap();
        let io = io.as_ref().ok_or(DeviceError::NotStarted)?;
        let mut writer = io.writer.lock().unwrap();
        write_frame(&mut *writer, tag, packet).map_err(|err| match err {
            RemoteError::Io(io) => DeviceError::Transport(io.into()),
            other => DeviceError::Protocol(other.to_string()),
        })
    }
}

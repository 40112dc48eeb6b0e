use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, OwnedFd};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use tracing::trace;

use crate::error::{Result, TransportError};

/// Start-of-packet marker, shared with the packet codec.
const START_BYTE: u8 = 0x61;

/// Frame header size: start byte + 16-bit length + type byte.
const HEADER_SIZE: usize = 4;

/// Create the pipe used to interrupt a blocked [`FrameReceiver`].
///
/// The write end goes to whoever calls stop; the read end is polled by the
/// receiver next to its data source.
pub fn wake_pipe() -> Result<(WakeHandle, OwnedFd)> {
    let (read, write) = nix::unistd::pipe()?;
    Ok((WakeHandle(File::from(write)), read))
}

/// Write end of a receiver's cancellation pipe.
#[derive(Debug)]
pub struct WakeHandle(File);

impl WakeHandle {
    /// Wake the receiver; its next (or current) read returns cancelled.
    pub fn wake(&self) -> Result<()> {
        (&self.0).write_all(b"Q")?;
        Ok(())
    }
}

/// Reassembles whole chip packets from a byte stream.
///
/// Reads block on a two-way poll over the data source and the wake pipe, so
/// a receiver parked on a silent stream can be stopped from another thread.
/// Bytes that arrive where a start marker is expected are discarded until
/// the stream resynchronizes.
#[derive(Debug)]
pub struct FrameReceiver<S> {
    source: S,
    wake: OwnedFd,
}

impl<S: Read + AsFd> FrameReceiver<S> {
    pub fn new(source: S, wake: OwnedFd) -> Self {
        FrameReceiver { source, wake }
    }

    /// Read the next whole packet.
    ///
    /// Returns `Ok(None)` when the wake pipe fires. The packet is returned
    /// as raw frame bytes, header included; validation is the codec's job.
    pub fn read_packet(&mut self) -> Result<Option<Vec<u8>>> {
        let mut frame = Vec::with_capacity(64);

        // Hunt for the start marker byte by byte, then read the rest of the
        // fixed-size header to learn the payload length.
        let mut discarded = 0usize;
        loop {
            let mut byte = [0u8; 1];
            if !self.fill(&mut byte)? {
                return Ok(None);
            }
            if byte[0] == START_BYTE {
                frame.push(byte[0]);
                break;
            }
            discarded += 1;
        }
        if discarded > 0 {
            trace!(discarded, "discarded bytes while resynchronizing");
        }

        let mut header_rest = [0u8; HEADER_SIZE - 1];
        if !self.fill(&mut header_rest)? {
            return Ok(None);
        }
        frame.extend_from_slice(&header_rest);

        let payload_len = u16::from_be_bytes([frame[1], frame[2]]) as usize;
        frame.resize(HEADER_SIZE + payload_len, 0);
        if !self.fill(&mut frame[HEADER_SIZE..])? {
            return Ok(None);
        }

        Ok(Some(frame))
    }

    /// Fill `buf` completely, or report cancellation.
    fn fill(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut done = 0;
        while done < buf.len() {
            if !self.wait_readable()? {
                return Ok(false);
            }
            match self.source.read(&mut buf[done..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => done += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
        Ok(true)
    }

    /// Block until the source has data or the wake pipe fires.
    ///
    /// The wake pipe wins when both are ready: stop requests must not race
    /// against a firehose of input.
    fn wait_readable(&self) -> Result<bool> {
        loop {
            let mut fds = [
                PollFd::new(self.source.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.wake.as_fd(), PollFlags::POLLIN),
            ];
            match nix::poll::poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(TransportError::Sys(err)),
            }
            if fds[1].any() == Some(true) {
                return Ok(false);
            }
            if fds[0].any() == Some(true) {
                return Ok(true);
            }
        }
    }
}

/// Write all bytes to a stream, retrying interrupted and short writes.
pub fn send_all<W: Write>(stream: &mut W, bytes: &[u8]) -> Result<()> {
    let mut offset = 0;
    while offset < bytes.len() {
        match stream.write(&bytes[offset..]) {
            Ok(0) => return Err(TransportError::Closed),
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
    loop {
        match stream.flush() {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
}

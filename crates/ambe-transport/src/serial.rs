use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices,
};
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::framed::send_all;

/// A serial port configured for the chip's framing: raw mode, 8N1, hardware
/// flow control, and (on FTDI adapters) the low-latency receive path.
///
/// The port is exclusively locked on open; a second process opening the same
/// device fails instead of interleaving packets.
#[derive(Debug)]
pub struct SerialPort {
    file: File,
    path: PathBuf,
}

impl SerialPort {
    pub fn open(path: impl AsRef<Path>, baud: u32) -> Result<SerialPort> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, baud, "opening serial port");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_SYNC)
            .open(&path)?;

        lock_exclusive(&file, &path)?;

        let port = SerialPort { file, path };
        port.configure(baud)?;

        if let Err(err) = set_low_latency(port.file.as_raw_fd(), true) {
            warn!(path = ?port.path, error = %err, "low-latency mode unavailable");
        }

        // USB-to-serial adapters buffer on both sides of the USB hop; give
        // in-flight bytes a moment to land before flushing, since tcflush
        // alone cannot reach the adapter's internal buffers.
        std::thread::sleep(Duration::from_millis(1));
        port.flush_io()?;

        Ok(port)
    }

    fn configure(&self, baud: u32) -> Result<()> {
        let mut tty = termios::tcgetattr(&self.file)?;

        termios::cfsetspeed(&mut tty, baud_rate(baud)?)?;

        // Raw (non-canonical) mode, 8 data bits, no parity bit, one stop
        // bit, hardware flow control, no modem lines.
        tty.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
        tty.control_flags &= !ControlFlags::CSIZE;
        tty.control_flags |= ControlFlags::CS8;
        tty.control_flags &= !(ControlFlags::PARENB | ControlFlags::CSTOPB);
        tty.control_flags |= ControlFlags::CRTSCTS;

        tty.input_flags &= !(InputFlags::IGNBRK
            | InputFlags::BRKINT
            | InputFlags::IGNPAR
            | InputFlags::PARMRK
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON
            | InputFlags::IXOFF);

        tty.output_flags &= !OutputFlags::OPOST;

        tty.local_flags &= !(LocalFlags::ICANON
            | LocalFlags::ECHO
            | LocalFlags::ECHONL
            | LocalFlags::ISIG
            | LocalFlags::IEXTEN);

        // Deliver bytes as soon as they arrive.
        tty.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        tty.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(&self.file, SetArg::TCSANOW, &tty)?;
        Ok(())
    }

    /// Clone the file handle for a dedicated reader thread.
    pub fn reader(&self) -> Result<File> {
        Ok(self.file.try_clone()?)
    }

    /// Write a full packet to the port.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        send_all(&mut &self.file, bytes)
    }

    /// Discard anything buffered in either direction.
    pub fn flush_io(&self) -> Result<()> {
        termios::tcflush(&self.file, FlushArg::TCIOFLUSH)?;
        Ok(())
    }

    /// Signal a UART break; USB-3003 chips hard-reset on it.
    pub fn send_break(&self) -> Result<()> {
        termios::tcsendbreak(&self.file, 0)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for SerialPort {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Write for &SerialPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&self.file).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (&self.file).flush()
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        if let Err(err) = set_low_latency(self.file.as_raw_fd(), false) {
            debug!(path = ?self.path, error = %err, "could not restore latency mode");
        }
    }
}

fn baud_rate(baud: u32) -> Result<BaudRate> {
    match baud {
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115200 => Ok(BaudRate::B115200),
        230400 => Ok(BaudRate::B230400),
        460800 => Ok(BaudRate::B460800),
        921600 => Ok(BaudRate::B921600),
        baud => Err(TransportError::UnsupportedBaud { baud }),
    }
}

/// Take an advisory write lock on the whole device node.
fn lock_exclusive(file: &File, path: &Path) -> Result<()> {
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = libc::F_WRLCK as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;

    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EAGAIN) => Err(TransportError::PortBusy {
                path: path.to_path_buf(),
            }),
            _ => Err(TransportError::Io(err)),
        };
    }
    Ok(())
}

/// Toggle the FTDI low-latency receive mode.
///
/// FT232 adapters batch incoming bytes for ~16 ms by default; the driver's
/// low-latency flag drops that to 1 ms, which matters when every exchange
/// with the chip is a small request/response pair.
#[cfg(target_os = "linux")]
fn set_low_latency(fd: std::os::fd::RawFd, enabled: bool) -> std::io::Result<()> {
    const TIOCGSERIAL: libc::c_ulong = 0x541e;
    const TIOCSSERIAL: libc::c_ulong = 0x541f;
    const ASYNC_LOW_LATENCY: libc::c_int = 0x2000;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct SerialStruct {
        type_: libc::c_int,
        line: libc::c_int,
        port: libc::c_uint,
        irq: libc::c_int,
        flags: libc::c_int,
        xmit_fifo_size: libc::c_int,
        custom_divisor: libc::c_int,
        baud_base: libc::c_int,
        close_delay: libc::c_ushort,
        io_type: libc::c_char,
        reserved_char: [libc::c_char; 1],
        hub6: libc::c_int,
        closing_wait: libc::c_ushort,
        closing_wait2: libc::c_ushort,
        iomem_base: *mut libc::c_uchar,
        iomem_reg_shift: libc::c_ushort,
        port_high: libc::c_uint,
        iomap_base: libc::c_ulong,
    }

    let mut serial: SerialStruct = unsafe { std::mem::zeroed() };
    // SAFETY: fd is an open tty descriptor and `serial` is a valid writable
    // serial_struct for the duration of both calls.
    unsafe {
        if libc::ioctl(fd, TIOCGSERIAL, &mut serial) < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if enabled {
            serial.flags |= ASYNC_LOW_LATENCY;
        } else {
            serial.flags &= !ASYNC_LOW_LATENCY;
        }
        if libc::ioctl(fd, TIOCSSERIAL, &serial) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_low_latency(_fd: std::os::fd::RawFd, _enabled: bool) -> std::io::Result<()> {
    Ok(())
}

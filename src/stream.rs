//! Byte-oriented duplex streams over character devices.
//!
//! A [`PortStream`] opens a tty in exclusive mode, configures raw 115200 8N1
//! termios, and spawns a dedicated reader thread that owns the descriptor and
//! forwards inbound bytes into an `mpsc` channel. The async side never does
//! blocking serial I/O. The descriptor lives in an `OwnedFd`, so it is
//! released on every exit path — normal close, error, or drop.
//!
//! The [`ByteStream`]/[`StreamOpener`] traits are the seam between the daemon
//! and the raw serial layer: the command queue and prober are written against
//! the traits, not the tty.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::port::PortInfo;

/// Read buffer size (AT responses are small).
const READ_BUF_SIZE: usize = 1024;

/// Depth of the inbound byte channel.
const STREAM_CHANNEL_DEPTH: usize = 64;

/// Events emitted by a stream to its single subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A chunk of inbound bytes.
    Data(Vec<u8>),
    /// EOF or descriptor error; the kernel removes the node when hardware
    /// vanishes. No further events follow.
    Disconnected,
}

/// Writable half of a duplex byte stream.
pub trait ByteStream: Send + 'static {
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
    /// Stop the reader and release the descriptor. Idempotent.
    fn close(&mut self);
}

/// Opens the byte stream for a port. The daemon uses [`TtyOpener`]; tests
/// substitute scripted streams.
pub trait StreamOpener: Send + Sync {
    fn open(&self, port: &PortInfo) -> Result<(Box<dyn ByteStream>, mpsc::Receiver<StreamEvent>)>;
}

/// Helper to get a `BorrowedFd` from a `RawFd` for nix termios calls.
///
/// # Safety
/// The caller must ensure `fd` is a valid open file descriptor.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// Exclusive-mode serial stream over a tty character device.
pub struct PortStream {
    fd: Arc<OwnedFd>,
    shutdown: Arc<AtomicBool>,
    device: String,
}

impl PortStream {
    /// Open `device`, claim it exclusively, configure termios, and spawn the
    /// reader thread. Returns the writable handle and the inbound channel.
    pub fn open(device: &str) -> Result<(Self, mpsc::Receiver<StreamEvent>)> {
        let raw = fcntl::open(
            device,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| Error::Io(format!("open {device}: {e}")))?;

        // From here on the OwnedFd guarantees close on every path.
        // SAFETY: raw is a freshly opened, otherwise unowned descriptor.
        let fd = Arc::new(unsafe { OwnedFd::from_raw_fd(raw) });

        // Exclusive mode — further opens of the node fail with EBUSY.
        // SAFETY: fd is valid for the duration of the call.
        if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCEXCL) } != 0 {
            return Err(Error::Io(format!(
                "TIOCEXCL {device}: {}",
                std::io::Error::last_os_error()
            )));
        }

        // Clear O_NONBLOCK now that we have the fd — the reader thread wants
        // blocking reads with the VTIME timeout.
        let flags = fcntl::fcntl(fd.as_raw_fd(), fcntl::FcntlArg::F_GETFL)
            .map_err(|e| Error::Io(format!("F_GETFL: {e}")))?;
        let mut oflags = OFlag::from_bits_truncate(flags);
        oflags.remove(OFlag::O_NONBLOCK);
        fcntl::fcntl(fd.as_raw_fd(), fcntl::FcntlArg::F_SETFL(oflags))
            .map_err(|e| Error::Io(format!("F_SETFL: {e}")))?;

        configure_termios(fd.as_raw_fd())?;

        // Flush any stale data before the first command.
        termios::tcflush(fd.as_fd(), termios::FlushArg::TCIOFLUSH)
            .map_err(|e| Error::Io(format!("tcflush: {e}")))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);

        let reader_fd = Arc::clone(&fd);
        let reader_stop = Arc::clone(&shutdown);
        let dev_name = device.to_string();
        std::thread::Builder::new()
            .name(format!("port-{dev_name}"))
            .spawn(move || reader_thread(&reader_fd, &reader_stop, &tx, &dev_name))
            .map_err(|e| Error::Io(format!("spawn reader thread: {e}")))?;

        debug!("Port {device}: opened exclusive (115200 8N1)");

        Ok((
            Self {
                fd,
                shutdown,
                device: device.to_string(),
            },
            rx,
        ))
    }
}

impl ByteStream for PortStream {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Io(format!("{}: stream closed", self.device)));
        }
        unistd::write(self.fd.as_fd(), bytes)
            .map_err(|e| Error::Io(format!("write {}: {e}", self.device)))?;
        Ok(())
    }

    fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for PortStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Default opener: real tty streams via the port's device file.
pub struct TtyOpener;

impl StreamOpener for TtyOpener {
    fn open(&self, port: &PortInfo) -> Result<(Box<dyn ByteStream>, mpsc::Receiver<StreamEvent>)> {
        let devfile = port
            .devfile
            .as_deref()
            .ok_or_else(|| Error::UnsupportedPort(format!("{}: no device file", port.key())))?;
        let (stream, rx) = PortStream::open(devfile)?;
        Ok((Box::new(stream), rx))
    }
}

/// Configure termios: raw mode, 115200 baud, 8N1, no flow control.
/// VMIN=0, VTIME=1 → reads return after 100ms of silence.
fn configure_termios(fd: RawFd) -> Result<()> {
    // SAFETY: fd is valid — caller just opened it.
    let borrowed = unsafe { borrow_fd(fd) };

    let mut tio =
        termios::tcgetattr(borrowed).map_err(|e| Error::Io(format!("tcgetattr: {e}")))?;

    termios::cfmakeraw(&mut tio);

    termios::cfsetispeed(&mut tio, termios::BaudRate::B115200)
        .map_err(|e| Error::Io(format!("cfsetispeed: {e}")))?;
    termios::cfsetospeed(&mut tio, termios::BaudRate::B115200)
        .map_err(|e| Error::Io(format!("cfsetospeed: {e}")))?;

    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio)
        .map_err(|e| Error::Io(format!("tcsetattr: {e}")))?;

    Ok(())
}

/// Blocking reader: forwards inbound bytes until shutdown, EOF, or error.
/// VMIN=0/VTIME=1 makes read return every 100ms when idle, which doubles as
/// the shutdown poll interval.
fn reader_thread(
    fd: &OwnedFd,
    stop: &AtomicBool,
    tx: &mpsc::Sender<StreamEvent>,
    device: &str,
) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        if stop.load(Ordering::SeqCst) {
            debug!("Port {device}: reader stopping");
            return;
        }
        match unistd::read(fd.as_raw_fd(), &mut buf) {
            // VTIME expired with no data.
            Ok(0) | Err(nix::errno::Errno::EAGAIN) => {}
            Ok(n) => {
                if tx.blocking_send(StreamEvent::Data(buf[..n].to_vec())).is_err() {
                    // Subscriber gone — stream is being torn down.
                    return;
                }
            }
            Err(e) => {
                warn!("Port {device}: read failed ({e}), disconnected");
                let _ = tx.blocking_send(StreamEvent::Disconnected);
                return;
            }
        }
    }
}

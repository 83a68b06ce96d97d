//! Raw named-pipe plumbing.
//!
//! Every pipe end the server or a client holds is a [`PipeHandle`]: an owned
//! file descriptor with close-once semantics. Close-once matters because the
//! administrative-signal path closes a session's descriptors while the owning
//! worker thread may still be using them; the second close must be a no-op
//! rather than a double-close of a possibly recycled descriptor.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use libc::{c_int, c_void};
use nix::sys::stat::Mode;
use nix::unistd;

/// Monotonic source of handle identifiers. The OS recycles descriptor
/// numbers, so subscriber bookkeeping keys off these instead.
static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// An owned pipe (or file) descriptor with close-once semantics.
#[derive(Debug)]
pub struct PipeHandle {
    id: u64,
    fd: RawFd,
    closed: AtomicBool,
}

impl PipeHandle {
    /// Creates a FIFO at `path` with mode `0640`.
    pub fn create_fifo(path: &Path) -> io::Result<()> {
        unistd::mkfifo(path, Mode::from_bits_truncate(0o640)).map_err(io::Error::from)
    }

    /// Opens `path` for reading. For a FIFO this blocks until a writer shows
    /// up; a signal delivered meanwhile surfaces as `EINTR`.
    pub fn open_read(path: &Path) -> io::Result<PipeHandle> {
        Self::open(path, libc::O_RDONLY | libc::O_CLOEXEC)
    }

    /// Opens `path` for writing. For a FIFO this blocks until a reader shows
    /// up.
    pub fn open_write(path: &Path) -> io::Result<PipeHandle> {
        Self::open(path, libc::O_WRONLY | libc::O_CLOEXEC)
    }

    /// Opens `path` for writing without blocking. On a FIFO with no reader
    /// this fails with `ENXIO` instead of waiting.
    pub(crate) fn open_write_nonblock(path: &Path) -> io::Result<PipeHandle> {
        Self::open(path, libc::O_WRONLY | libc::O_NONBLOCK | libc::O_CLOEXEC)
    }

    fn open(path: &Path, flags: c_int) -> io::Result<PipeHandle> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
        let fd = unsafe { libc::open(cpath.as_ptr(), flags) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(PipeHandle::from_fd(fd))
    }

    fn from_fd(fd: RawFd) -> PipeHandle {
        PipeHandle {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            fd,
            closed: AtomicBool::new(false),
        }
    }

    /// Stable identifier of this handle, unique for the process lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the descriptor. Safe to call from several threads; only the
    /// first call closes. Subsequent reads and writes fail with `EBADF`.
    pub fn close(&self) {
        let already_closed = self.closed.swap(true, Ordering::SeqCst);
        if !already_closed {
            unsafe {
                libc::close(self.fd);
            }
        }
    }

    fn raw_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let rc = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    fn raw_write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let rc = unsafe { libc::write(self.fd, buf.as_ptr() as *const c_void, buf.len()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    /// Reads exactly `buf.len()` bytes.
    ///
    /// Returns `Ok(false)` on end-of-input at a frame boundary. An EOF in the
    /// middle of a frame is an `UnexpectedEof` error. `EINTR` before the
    /// first byte is returned to the caller so it can service its signal
    /// flags; mid-frame interruptions are retried to finish the frame.
    pub fn read_exact(&self, buf: &mut [u8]) -> io::Result<bool> {
        let mut done = 0;
        while done < buf.len() {
            match self.raw_read(&mut buf[done..]) {
                Ok(0) => {
                    if done == 0 {
                        return Ok(false);
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "pipe closed in the middle of a frame",
                    ));
                }
                Ok(n) => done += n,
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => {
                    if done == 0 {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    /// Writes all of `buf`, retrying on `EINTR` and short writes.
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut done = 0;
        while done < buf.len() {
            match self.raw_write(&buf[done..]) {
                Ok(n) => done += n,
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl AsRawFd for PipeHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for PipeHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Removes `path` if it exists; a missing file is not an error.
pub(crate) fn unlink_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

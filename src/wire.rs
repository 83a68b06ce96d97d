//! Wire formats shared by the server, the session layer and clients.
//!
//! Everything on a pipe travels as a fixed-width frame so the receiving side
//! can issue a single blocking read per record: the connect frame on the
//! intake pipe, the one-byte request opcodes (plus a padded key) on the
//! request pipe, the two-byte acks on the response pipe and the notification
//! frames on the notification pipe.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use memchr::memchr;
use num_enum::TryFromPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Maximum key length in bytes.
pub const MAX_KEY: usize = 40;

/// Maximum value length in bytes.
pub const MAX_VAL: usize = 40;

/// Maximum length of a client pipe path inside a connect frame.
pub const MAX_PIPE_PATH: usize = 40;

/// Value delivered in a notification frame when the key was removed.
pub const DELETED_SENTINEL: &str = "DELETED";

/// Value printed by `READ` for a key that is not in the store.
pub const KVS_ERROR: &str = "KVSERROR";

/// Value printed by `DELETE` for a key that was not in the store.
pub const KVS_MISSING: &str = "KVSMISSING";

/// Session opcodes. Carried on the wire as the ASCII digits `'1'..='4'`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Connection request on the intake pipe.
    Connect = 1,
    /// Orderly end of a session.
    Disconnect = 2,
    /// Subscribe to change notifications for one key.
    Subscribe = 3,
    /// Drop a previous subscription.
    Unsubscribe = 4,
}

impl Opcode {
    /// The ASCII byte this opcode travels as.
    pub fn to_wire(self) -> u8 {
        b'0' + self as u8
    }

    /// Decodes an ASCII opcode byte, `None` for anything out of range.
    pub fn from_wire(byte: u8) -> Option<Opcode> {
        Opcode::try_from(byte.wrapping_sub(b'0')).ok()
    }
}

/// Size of a connect frame: opcode byte plus three padded pipe paths.
pub const CONNECT_FRAME_SIZE: usize = 1 + 3 * MAX_PIPE_PATH;

/// Connection frame read from the intake pipe.
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ConnectFrame {
    /// Must equal [`Opcode::Connect`] on the wire.
    pub opcode: u8,
    /// NUL-padded path of the client's request pipe.
    pub request_path: [u8; MAX_PIPE_PATH],
    /// NUL-padded path of the client's response pipe.
    pub response_path: [u8; MAX_PIPE_PATH],
    /// NUL-padded path of the client's notification pipe.
    pub notification_path: [u8; MAX_PIPE_PATH],
}

impl ConnectFrame {
    /// Builds a connect frame from the three client pipe paths.
    ///
    /// # Errors
    /// Fails with `InvalidInput` when a path is empty or longer than
    /// [`MAX_PIPE_PATH`] bytes.
    pub fn new(request: &Path, response: &Path, notification: &Path) -> io::Result<ConnectFrame> {
        let mut frame = ConnectFrame {
            opcode: Opcode::Connect.to_wire(),
            request_path: [0; MAX_PIPE_PATH],
            response_path: [0; MAX_PIPE_PATH],
            notification_path: [0; MAX_PIPE_PATH],
        };
        encode_path(&mut frame.request_path, request)?;
        encode_path(&mut frame.response_path, response)?;
        encode_path(&mut frame.notification_path, notification)?;
        Ok(frame)
    }

    /// The request-pipe path carried by this frame.
    pub fn request_path(&self) -> io::Result<&str> {
        field_str(&self.request_path)
    }

    /// The response-pipe path carried by this frame.
    pub fn response_path(&self) -> io::Result<&str> {
        field_str(&self.response_path)
    }

    /// The notification-pipe path carried by this frame.
    pub fn notification_path(&self) -> io::Result<&str> {
        field_str(&self.notification_path)
    }
}

/// Size of a notification frame: padded key plus padded value.
pub const NOTIFICATION_FRAME_SIZE: usize = (MAX_KEY + 1) + (MAX_VAL + 1);

/// Notification frame pushed to subscriber pipes on every committed mutation.
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct NotificationFrame {
    /// NUL-padded key.
    pub key: [u8; MAX_KEY + 1],
    /// NUL-padded value, or the [`DELETED_SENTINEL`] on removal.
    pub value: [u8; MAX_VAL + 1],
}

impl NotificationFrame {
    /// Frame announcing that `key` now holds `value`.
    pub fn update(key: &str, value: &str) -> NotificationFrame {
        let mut frame = NotificationFrame {
            key: [0; MAX_KEY + 1],
            value: [0; MAX_VAL + 1],
        };
        pad(&mut frame.key, key.as_bytes());
        pad(&mut frame.value, value.as_bytes());
        frame
    }

    /// Frame announcing that `key` was removed.
    pub fn deleted(key: &str) -> NotificationFrame {
        NotificationFrame::update(key, DELETED_SENTINEL)
    }

    /// The key carried by this frame.
    pub fn key(&self) -> io::Result<&str> {
        field_str(&self.key)
    }

    /// The value carried by this frame.
    pub fn value(&self) -> io::Result<&str> {
        field_str(&self.value)
    }
}

/// Copies `src` into `dst`, leaving the tail NUL-padded. `src` must fit; key
/// and value lengths are validated before any frame is built.
fn pad(dst: &mut [u8], src: &[u8]) {
    debug_assert!(src.len() <= dst.len());
    dst[..src.len()].copy_from_slice(src);
}

fn encode_path(dst: &mut [u8], path: &Path) -> io::Result<()> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() || bytes.len() > dst.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "pipe path {} must be between 1 and {} bytes",
                path.display(),
                dst.len()
            ),
        ));
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Returns the NUL-terminated UTF-8 string at the start of a padded field.
pub fn field_str(field: &[u8]) -> io::Result<&str> {
    let end = memchr(0, field).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame field is not valid UTF-8"))
}

//! Client-side connection API.
//!
//! A client creates its three FIFOs, registers them with the server through
//! the intake pipe, then talks over the request/response pair while change
//! notifications arrive on the third pipe.
//!
//! The connection keeps a local subscription ledger: a duplicate subscribe
//! or one past [`MAX_CLIENT_SUBSCRIPTIONS`] is refused before anything is
//! sent, an unsubscribe for a key that was never subscribed likewise, and a
//! `DELETED` notification frees the key's slot when the reader consumes it.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use zerocopy::IntoBytes;

use crate::channel::{PipeHandle, unlink_if_exists};
use crate::signal;
use crate::wire::{
    self, ConnectFrame, DELETED_SENTINEL, MAX_KEY, NOTIFICATION_FRAME_SIZE, Opcode,
};

/// Maximum number of concurrent subscriptions one client keeps.
pub const MAX_CLIENT_SUBSCRIPTIONS: usize = 10;

/// One decoded notification frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notification {
    /// The mutated key.
    pub key: String,
    /// Its new value, or [`DELETED_SENTINEL`] when the key was removed.
    pub value: String,
}

impl Notification {
    /// Whether this notification announces a removal.
    pub fn is_delete(&self) -> bool {
        self.value == DELETED_SENTINEL
    }
}

/// Result of a [`ClientConnection::subscribe`] call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscribeOutcome {
    /// The server confirmed the subscription.
    Subscribed,
    /// The server reported the key does not exist.
    KeyMissing,
    /// The key is already in the local ledger; nothing was sent.
    AlreadySubscribed,
    /// The local subscription limit is reached; nothing was sent.
    LimitReached,
}

/// Result of a [`ClientConnection::unsubscribe`] call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnsubscribeOutcome {
    /// The server confirmed the removal.
    Unsubscribed,
    /// The server reported the key does not exist.
    KeyMissing,
    /// The local ledger has no subscriptions at all; nothing was sent.
    NoSubscriptions,
    /// The key is not in the local ledger; nothing was sent.
    NotSubscribed,
}

/// Blocking reader over a session's notification pipe. Cloneable so a
/// dedicated thread can drain it while the owner keeps issuing requests.
#[derive(Clone, Debug)]
pub struct NotificationReader {
    pipe: Arc<PipeHandle>,
    subscriptions: Arc<Mutex<Vec<String>>>,
}

impl NotificationReader {
    /// Blocks for the next notification; `None` once the server closes the
    /// pipe. A `DELETED` frame also drops the key from the local
    /// subscription ledger, freeing its slot.
    ///
    /// # Errors
    /// Fails on malformed frames or pipe errors other than end-of-input.
    pub fn next(&self) -> io::Result<Option<Notification>> {
        let mut buf = [0u8; NOTIFICATION_FRAME_SIZE];
        if !self.pipe.read_exact(&mut buf)? {
            return Ok(None);
        }
        let (key, value) = buf.split_at(MAX_KEY + 1);
        let notification = Notification {
            key: wire::field_str(key)?.to_string(),
            value: wire::field_str(value)?.to_string(),
        };
        if notification.is_delete() {
            self.subscriptions
                .lock()
                .retain(|subscribed| *subscribed != notification.key);
        }
        Ok(Some(notification))
    }
}

/// An established session with the server.
#[derive(Debug)]
pub struct ClientConnection {
    request: PipeHandle,
    response: PipeHandle,
    notification: Arc<PipeHandle>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    paths: [PathBuf; 3],
}

impl ClientConnection {
    /// Creates the three client FIFOs, registers with the server through
    /// `server_path` and completes the connect handshake.
    ///
    /// # Errors
    /// Fails when the pipes cannot be created, the server is unreachable, or
    /// the server acks the connect with a failure status.
    pub fn connect(
        request_path: &Path,
        response_path: &Path,
        notification_path: &Path,
        server_path: &Path,
    ) -> io::Result<ClientConnection> {
        signal::ignore_sigpipe();
        let paths = [
            request_path.to_path_buf(),
            response_path.to_path_buf(),
            notification_path.to_path_buf(),
        ];
        match Self::connect_inner(&paths, server_path) {
            Ok(connection) => Ok(connection),
            Err(err) => {
                unlink_pipes(&paths);
                Err(err)
            }
        }
    }

    fn connect_inner(paths: &[PathBuf; 3], server_path: &Path) -> io::Result<ClientConnection> {
        for path in paths {
            unlink_if_exists(path)?;
            PipeHandle::create_fifo(path)?;
        }

        let server = PipeHandle::open_write(server_path)?;
        let frame = ConnectFrame::new(&paths[0], &paths[1], &paths[2])?;
        server.write_all(frame.as_bytes())?;
        drop(server);

        // Complement of the server-side order (response, request,
        // notification) — both sides must agree or the opens deadlock.
        let response = PipeHandle::open_read(&paths[1])?;
        let request = PipeHandle::open_write(&paths[0])?;
        let notification = Arc::new(PipeHandle::open_read(&paths[2])?);

        let mut ack = [0u8; 2];
        if !response.read_exact(&mut ack)? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the response pipe during connect",
            ));
        }
        println!("Server returned {} for operation: connect.", ack[1] as char);
        if ack[1] != b'0' {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "server rejected the connection",
            ));
        }

        Ok(ClientConnection {
            request,
            response,
            notification,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            paths: paths.clone(),
        })
    }

    /// A reader for this session's notification pipe. The reader shares the
    /// connection's subscription ledger so removals it observes free their
    /// slots.
    pub fn notifications(&self) -> NotificationReader {
        NotificationReader {
            pipe: Arc::clone(&self.notification),
            subscriptions: Arc::clone(&self.subscriptions),
        }
    }

    /// Subscribes to change notifications for `key`. Duplicates and
    /// subscriptions past [`MAX_CLIENT_SUBSCRIPTIONS`] are refused locally
    /// without touching the server.
    ///
    /// # Errors
    /// Fails when the session pipes are broken.
    pub fn subscribe(&self, key: &str) -> io::Result<SubscribeOutcome> {
        {
            let subscriptions = self.subscriptions.lock();
            if subscriptions.iter().any(|subscribed| subscribed == key) {
                return Ok(SubscribeOutcome::AlreadySubscribed);
            }
            if subscriptions.len() == MAX_CLIENT_SUBSCRIPTIONS {
                return Ok(SubscribeOutcome::LimitReached);
            }
        }
        let ack = self.key_request(Opcode::Subscribe, key)?;
        println!(
            "Server returned {} for operation: subscribe.",
            ack[1] as char
        );
        if ack[1] == b'1' {
            self.subscriptions.lock().push(key.to_string());
            Ok(SubscribeOutcome::Subscribed)
        } else {
            Ok(SubscribeOutcome::KeyMissing)
        }
    }

    /// Drops the subscription on `key`. Keys the ledger never recorded are
    /// refused locally without touching the server.
    ///
    /// # Errors
    /// Fails when the session pipes are broken.
    pub fn unsubscribe(&self, key: &str) -> io::Result<UnsubscribeOutcome> {
        {
            let subscriptions = self.subscriptions.lock();
            if subscriptions.is_empty() {
                return Ok(UnsubscribeOutcome::NoSubscriptions);
            }
            if !subscriptions.iter().any(|subscribed| subscribed == key) {
                return Ok(UnsubscribeOutcome::NotSubscribed);
            }
        }
        let ack = self.key_request(Opcode::Unsubscribe, key)?;
        println!(
            "Server returned {} for operation: unsubscribe.",
            ack[1] as char
        );
        if ack[1] == b'0' {
            self.subscriptions.lock().retain(|subscribed| subscribed != key);
            Ok(UnsubscribeOutcome::Unsubscribed)
        } else {
            Ok(UnsubscribeOutcome::KeyMissing)
        }
    }

    /// Ends the session, waiting for the server's ack.
    ///
    /// # Errors
    /// Fails when the session pipes are already broken; the local pipes are
    /// removed either way.
    pub fn disconnect(self) -> io::Result<()> {
        self.request.write_all(&[Opcode::Disconnect.to_wire()])?;
        let mut ack = [0u8; 2];
        if !self.response.read_exact(&mut ack)? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the response pipe during disconnect",
            ));
        }
        println!(
            "Server returned {} for operation: disconnect.",
            ack[1] as char
        );
        Ok(())
    }

    fn key_request(&self, op: Opcode, key: &str) -> io::Result<[u8; 2]> {
        if key.is_empty() || key.len() > MAX_KEY {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("key must be between 1 and {MAX_KEY} bytes"),
            ));
        }
        let mut frame = [0u8; 1 + MAX_KEY];
        frame[0] = op.to_wire();
        frame[1..1 + key.len()].copy_from_slice(key.as_bytes());
        self.request.write_all(&frame)?;

        let mut ack = [0u8; 2];
        if !self.response.read_exact(&mut ack)? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the response pipe",
            ));
        }
        Ok(ack)
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        unlink_pipes(&self.paths);
    }
}

fn unlink_pipes(paths: &[PathBuf; 3]) {
    for path in paths {
        if let Err(err) = unlink_if_exists(path) {
            warn!("failed to remove client pipe {}: {}", path.display(), err);
        }
    }
}

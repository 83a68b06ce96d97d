//! Concurrent in-memory key/value store with a publish/subscribe facility,
//! served over local named pipes.
//!
//! Two independent surfaces drive the store. A batch job engine executes
//! command scripts from a directory of `.job` files across a worker pool,
//! producing `.out` result files and non-blocking `.bck` snapshots. A session
//! layer accepts client connections over named pipes — one request, one
//! response and one notification pipe per client — serving subscribe and
//! unsubscribe requests and pushing fixed-width change frames to
//! subscribers.
//!
//! The interesting parts are the concurrency structure: per-bucket
//! reader/writer locks with a total acquisition order for multi-key batches,
//! a global mode gate that keeps point operations consistent with full-table
//! listings, a classic two-semaphore bounded ring between the single
//! connection acceptor and the session worker pool, and best-effort
//! cross-thread fan-out of change events to client pipes.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod backup;
mod channel;
mod client;
mod jobs;
mod notify;
mod ops;
mod parser;
mod session;
/// Process signal plumbing used by the server and client binaries.
pub mod signal;
mod store;
mod sync;
mod wire;

pub use crate::backup::BackupScheduler;
pub use crate::channel::PipeHandle;
pub use crate::client::{
    ClientConnection, MAX_CLIENT_SUBSCRIPTIONS, Notification, NotificationReader,
    SubscribeOutcome, UnsubscribeOutcome,
};
pub use crate::jobs::run_jobs;
pub use crate::notify::Notifier;
pub use crate::ops::{Kvs, MAX_BATCH};
pub use crate::parser::{Command, parse_line};
pub use crate::session::{MAX_SESSIONS, SessionServer, StopHandle};
pub use crate::store::{BUCKET_COUNT, Store, SubscriberSet};
pub use crate::wire::{
    CONNECT_FRAME_SIZE, ConnectFrame, DELETED_SENTINEL, KVS_ERROR, KVS_MISSING, MAX_KEY,
    MAX_PIPE_PATH, MAX_VAL, NOTIFICATION_FRAME_SIZE, NotificationFrame, Opcode, field_str,
};

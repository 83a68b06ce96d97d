//! Session intake and per-client command loops.
//!
//! One acceptor thread reads fixed-width connect frames from the intake FIFO
//! into a bounded ring; a fixed pool of session workers consumes the ring,
//! opens the three per-client pipes and serves subscribe/unsubscribe requests
//! until the client disconnects. The administrative signal is serviced by the
//! acceptor between frames: it force-closes every active session's pipes and
//! clears all subscriptions without killing the workers.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use zerocopy::FromBytes;

use crate::channel::{PipeHandle, unlink_if_exists};
use crate::ops::Kvs;
use crate::signal;
use crate::sync::Semaphore;
use crate::wire::{self, CONNECT_FRAME_SIZE, ConnectFrame, MAX_KEY, Opcode};

/// Maximum number of concurrent client sessions.
pub const MAX_SESSIONS: usize = 8;

/// Bounded connect-frame ring shared by the acceptor and the session
/// workers: two counting semaphores plus a mutex over the head/tail indices.
/// The acceptor is the only producer.
struct ConnectionQueue {
    capacity: usize,
    slots_free: Semaphore,
    items_ready: Semaphore,
    inner: Mutex<QueueInner>,
    closed: AtomicBool,
}

struct QueueInner {
    frames: Vec<Option<ConnectFrame>>,
    head: usize,
    tail: usize,
}

impl ConnectionQueue {
    fn new(capacity: usize) -> ConnectionQueue {
        ConnectionQueue {
            capacity,
            slots_free: Semaphore::new(capacity),
            items_ready: Semaphore::new(0),
            inner: Mutex::new(QueueInner {
                frames: (0..capacity).map(|_| None).collect(),
                head: 0,
                tail: 0,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Takes a free slot before the acceptor blocks reading the next frame,
    /// so a full ring pushes back on the intake pipe instead of dropping
    /// connects.
    fn reserve(&self) {
        self.slots_free.acquire();
    }

    /// Returns a reservation that did not turn into a frame.
    fn cancel_reservation(&self) {
        self.slots_free.release();
    }

    /// Stores a frame into the slot reserved by [`reserve`](Self::reserve).
    fn push_reserved(&self, frame: ConnectFrame) {
        {
            let mut inner = self.inner.lock();
            let tail = inner.tail;
            inner.frames[tail] = Some(frame);
            inner.tail = (tail + 1) % self.capacity;
        }
        self.items_ready.release();
    }

    /// Blocks for the next frame; `None` once the queue is closed *and*
    /// drained. A frame that was already queued when the queue closed is
    /// still delivered — its client is blocked in the connect handshake and
    /// must be served, not stranded.
    fn pop(&self) -> Option<ConnectFrame> {
        self.items_ready.acquire();
        let frame = {
            let mut inner = self.inner.lock();
            let head = inner.head;
            match inner.frames[head].take() {
                Some(frame) => {
                    inner.head = (head + 1) % self.capacity;
                    Some(frame)
                }
                // An empty slot means the permit was one of the wake-up
                // permits from close(): every real permit has a frame behind
                // it.
                None => None,
            }
        };
        if frame.is_some() {
            self.slots_free.release();
        }
        frame
    }

    /// Wakes every consumer. Queued frames are handed out before any
    /// consumer observes the close.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.capacity {
            self.items_ready.release();
        }
    }
}

/// The handle triple owned by an active session.
struct SessionPipes {
    request: Arc<PipeHandle>,
    response: Arc<PipeHandle>,
    notification: Arc<PipeHandle>,
}

impl SessionPipes {
    fn close_all(&self) {
        self.request.close();
        self.response.close();
        self.notification.close();
    }
}

/// Per-slot pipe registry. The mutex is what keeps the signal path's
/// force-close mutually exclusive with the owning worker installing or
/// clearing the handles.
#[derive(Default)]
struct SessionSlot {
    pipes: Mutex<Option<SessionPipes>>,
}

impl SessionSlot {
    fn install(&self, pipes: SessionPipes) {
        *self.pipes.lock() = Some(pipes);
    }

    /// Worker-side cleanup at session end.
    fn clear(&self) {
        if let Some(pipes) = self.pipes.lock().take() {
            pipes.close_all();
        }
    }

    /// Signal-side close. The handles stay installed so the owning worker
    /// still runs its own cleanup; close-once makes the second close a no-op.
    fn force_close(&self) {
        if let Some(pipes) = self.pipes.lock().as_ref() {
            pipes.close_all();
        }
    }
}

/// The session multiplexer: the intake acceptor plus [`MAX_SESSIONS`]
/// workers.
pub struct SessionServer {
    kvs: Arc<Kvs>,
    queue: Arc<ConnectionQueue>,
    slots: Arc<Vec<SessionSlot>>,
    intake_path: PathBuf,
    closing: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

/// Lets another thread ask a running [`SessionServer`] to wind down.
#[derive(Clone, Debug)]
pub struct StopHandle {
    closing: Arc<AtomicBool>,
    intake_path: PathBuf,
}

impl StopHandle {
    /// Requests shutdown and nudges the acceptor out of its blocking open or
    /// read on the intake pipe.
    pub fn stop(&self) {
        self.closing.store(true, Ordering::Release);
        // Opening (and immediately dropping) the write side pairs with a
        // reader blocked in open and EOFs a reader blocked in read.
        let _ = PipeHandle::open_write_nonblock(&self.intake_path);
    }
}

impl std::fmt::Debug for SessionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServer")
            .field("intake_path", &self.intake_path)
            .field("workers", &self.workers.len())
            .field("closing", &self.closing)
            .finish()
    }
}

impl SessionServer {
    /// Replaces any stale intake FIFO at `intake_path` with a fresh one and
    /// starts the session worker pool.
    ///
    /// # Errors
    /// Fails when the FIFO cannot be created or a worker cannot be spawned.
    pub fn bind(kvs: Arc<Kvs>, intake_path: &Path) -> io::Result<SessionServer> {
        unlink_if_exists(intake_path)?;
        PipeHandle::create_fifo(intake_path)?;

        let queue = Arc::new(ConnectionQueue::new(MAX_SESSIONS));
        let slots: Arc<Vec<SessionSlot>> =
            Arc::new((0..MAX_SESSIONS).map(|_| SessionSlot::default()).collect());

        let mut workers = Vec::with_capacity(MAX_SESSIONS);
        for slot_id in 0..MAX_SESSIONS {
            let kvs = Arc::clone(&kvs);
            let queue = Arc::clone(&queue);
            let slots = Arc::clone(&slots);
            workers.push(
                thread::Builder::new()
                    .name(format!("session-worker-{slot_id}"))
                    .spawn(move || worker_main(slot_id, &kvs, &queue, &slots))?,
            );
        }

        Ok(SessionServer {
            kvs,
            queue,
            slots,
            intake_path: intake_path.to_path_buf(),
            closing: Arc::new(AtomicBool::new(false)),
            workers,
        })
    }

    /// A handle that can stop this server from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            closing: Arc::clone(&self.closing),
            intake_path: self.intake_path.clone(),
        }
    }

    /// Runs the acceptor loop on the calling thread until shutdown is
    /// requested, then drains the worker pool and removes the intake FIFO.
    ///
    /// # Errors
    /// Returns the error that stopped the acceptor, if any.
    pub fn run(mut self) -> io::Result<()> {
        info!(
            "serving sessions on {} ({} workers)",
            self.intake_path.display(),
            MAX_SESSIONS
        );
        let result = self.accept_loop();
        self.queue.close();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        let _ = unlink_if_exists(&self.intake_path);
        info!("session layer stopped");
        result
    }

    fn should_stop(&self) -> bool {
        self.closing.load(Ordering::Acquire) || signal::shutdown_requested()
    }

    fn accept_loop(&self) -> io::Result<()> {
        let mut intake: Option<PipeHandle> = None;
        loop {
            if self.should_stop() {
                return Ok(());
            }
            if signal::take_subscription_reset() {
                self.reset_subscriptions();
            }
            if intake.is_none() {
                match PipeHandle::open_read(&self.intake_path) {
                    Ok(pipe) => intake = Some(pipe),
                    Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                    Err(err) => return Err(err),
                }
            }
            let pipe = intake.as_ref().expect("intake pipe is open");

            self.queue.reserve();
            if self.should_stop() {
                self.queue.cancel_reservation();
                return Ok(());
            }

            let mut buf = [0u8; CONNECT_FRAME_SIZE];
            match pipe.read_exact(&mut buf) {
                Ok(true) => match ConnectFrame::read_from_bytes(&buf[..]).ok() {
                    Some(frame) if Opcode::from_wire(frame.opcode) == Some(Opcode::Connect) => {
                        debug!("queued a connection request");
                        self.queue.push_reserved(frame);
                    }
                    Some(frame) => {
                        warn!("intake: unexpected opcode byte {:#04x}", frame.opcode);
                        self.queue.cancel_reservation();
                    }
                    None => self.queue.cancel_reservation(),
                },
                // All writers closed the intake pipe; reopen for the next
                // client unless we are shutting down.
                Ok(false) => {
                    self.queue.cancel_reservation();
                    intake = None;
                }
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => {
                    self.queue.cancel_reservation();
                }
                Err(err) => {
                    self.queue.cancel_reservation();
                    error!("failed to read from the intake pipe: {err}");
                    return Err(err);
                }
            }
        }
    }

    /// The administrative sweep: status line, close every active session's
    /// pipes so the owning worker observes end-of-input, clear every
    /// subscriber set.
    fn reset_subscriptions(&self) {
        println!("Subscription reset requested: closing client pipes.");
        for slot in self.slots.iter() {
            slot.force_close();
        }
        self.kvs.store().clear_all_subscribers();
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        self.queue.close();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_main(
    slot_id: usize,
    kvs: &Arc<Kvs>,
    queue: &ConnectionQueue,
    slots: &[SessionSlot],
) {
    signal::block_in_worker();
    while let Some(frame) = queue.pop() {
        if let Err(err) = serve_session(kvs, &slots[slot_id], &frame) {
            warn!("session worker {slot_id}: {err}");
        }
    }
    debug!("session worker {slot_id} exiting");
}

/// One full `Idle → Connected → Draining → Idle` pass.
fn serve_session(kvs: &Arc<Kvs>, slot: &SessionSlot, frame: &ConnectFrame) -> io::Result<()> {
    let request_path = frame.request_path()?.to_string();
    let response_path = frame.response_path()?.to_string();
    let notification_path = frame.notification_path()?.to_string();
    let client_id = client_id_from_path(&request_path);

    // Open order matters: the client opens response for reading first, then
    // request for writing, then notification for reading. Named pipes block
    // in open until both ends arrive, so any other order here deadlocks the
    // connect handshake.
    let response = match PipeHandle::open_write(Path::new(&response_path)) {
        Ok(pipe) => Arc::new(pipe),
        Err(err) => {
            warn!("client {client_id}: failed to open the response pipe: {err}");
            return Ok(());
        }
    };
    let request = match PipeHandle::open_read(Path::new(&request_path)) {
        Ok(pipe) => Arc::new(pipe),
        Err(err) => {
            warn!("client {client_id}: failed to open the request pipe: {err}");
            let _ = response.write_all(&[Opcode::Connect.to_wire(), b'1']);
            return Ok(());
        }
    };
    let notification = match PipeHandle::open_write(Path::new(&notification_path)) {
        Ok(pipe) => Arc::new(pipe),
        Err(err) => {
            warn!("client {client_id}: failed to open the notification pipe: {err}");
            let _ = response.write_all(&[Opcode::Connect.to_wire(), b'1']);
            return Ok(());
        }
    };
    response.write_all(&[Opcode::Connect.to_wire(), b'0'])?;

    slot.install(SessionPipes {
        request: Arc::clone(&request),
        response: Arc::clone(&response),
        notification: Arc::clone(&notification),
    });
    println!("Connected client {client_id}.");

    let result = command_loop(kvs, &client_id, &request, &response, &notification);

    println!("Disconnected client {client_id}.");
    kvs.store().drop_subscriber_everywhere(notification.id());
    slot.clear();
    result
}

fn command_loop(
    kvs: &Kvs,
    client_id: &str,
    request: &Arc<PipeHandle>,
    response: &Arc<PipeHandle>,
    notification: &Arc<PipeHandle>,
) -> io::Result<()> {
    let mut opcode_buf = [0u8; 1];
    loop {
        match request.read_exact(&mut opcode_buf) {
            Ok(true) => {}
            // Zero-byte read: the client closed its end.
            Ok(false) => return Ok(()),
            // Bad descriptor: the administrative signal closed our end.
            Err(err) if is_session_teardown(&err) => return Ok(()),
            Err(err) => return Err(err),
        }
        let echoed = opcode_buf[0];
        match Opcode::from_wire(echoed) {
            Some(Opcode::Disconnect) => {
                if let Err(err) = response.write_all(&[echoed, b'0']) {
                    warn!("client {client_id}: failed to ack the disconnect: {err}");
                }
                return Ok(());
            }
            Some(Opcode::Subscribe) => {
                let Some(key) = read_key(request)? else {
                    return Ok(());
                };
                let subscribed = kvs.subscribe(&key, notification);
                // Inverted polarity, kept for wire compatibility: '1' means
                // the subscription took.
                let status = if subscribed { b'1' } else { b'0' };
                response.write_all(&[echoed, status])?;
            }
            Some(Opcode::Unsubscribe) => {
                let Some(key) = read_key(request)? else {
                    return Ok(());
                };
                let removed = kvs.unsubscribe(&key, notification.id());
                let status = if removed { b'0' } else { b'1' };
                response.write_all(&[echoed, status])?;
            }
            _ => {
                warn!("client {client_id}: unknown opcode byte {echoed:#04x}");
                return Ok(());
            }
        }
    }
}

/// Reads the NUL-padded key that follows a subscribe/unsubscribe opcode.
/// `None` when the client disappeared instead.
fn read_key(request: &PipeHandle) -> io::Result<Option<String>> {
    let mut buf = [0u8; MAX_KEY];
    match request.read_exact(&mut buf) {
        Ok(true) => Ok(Some(wire::field_str(&buf)?.to_string())),
        Ok(false) => Ok(None),
        Err(err) if is_session_teardown(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

fn is_session_teardown(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EBADF) | Some(libc::EPIPE))
}

/// The client identifier is the request-pipe file name minus its `req`
/// prefix.
fn client_id_from_path(path: &str) -> String {
    let name = Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path);
    name.strip_prefix("req").unwrap_or(name).to_string()
}

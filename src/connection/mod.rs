//! Connection layer: one receiver thread, one sender thread, and
//! request/response correlation over a single framed stream socket.
//!
//! Both sides of a session use the same shape. The receiver thread reads
//! frames and either resolves an outstanding [`Command`] (replies) or hands
//! the envelope to the side's [`InboundHandler`] (requests). The sender
//! thread drains a condvar-guarded queue and is the only long-lived writer;
//! ad-hoc synchronous sends share the same write lock, so frames never
//! interleave.

pub mod command;

pub use command::Command;

use crate::error::Error;
use crate::proto::codec::{read_frame, write_frame};
use crate::proto::{Announce, Body, Envelope, ErrorCode, Reply, PROTO_ID, Version};
use crate::{gl_debug, gl_info, gl_warn};
use command::Resolver;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::transport::{Endpoint, Transport};

/// How long [`Connection::establish`] waits for the announce verdict.
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a connection ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer hung up cleanly at a frame boundary.
    Normal,
    /// Transport or protocol failure mid-session.
    Disconnect,
    /// Local close requested.
    Local,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Normal => f.write_str("peer disconnected"),
            CloseReason::Disconnect => f.write_str("connection lost"),
            CloseReason::Local => f.write_str("closed locally"),
        }
    }
}

/// Receives inbound requests on the receiver thread.
///
/// A returned envelope is sent back synchronously. Handlers that need
/// multi-step ordered output (the aggregated function-call snapshot) write
/// through the [`Handle`] themselves and return `None`.
pub trait InboundHandler: Send + Sync + 'static {
    fn handle(&self, conn: &Handle, envelope: Envelope) -> Result<Option<Envelope>, Error>;
}

struct Shared {
    /// Set once the connection is marked for termination.
    end: AtomicBool,
    /// Set once the announce handshake succeeded.
    verified: AtomicBool,
    /// Write half. Lock scope is one whole frame.
    writer: Mutex<Transport>,
    /// Async outbound queue, drained by the sender thread.
    queue: Mutex<VecDeque<Envelope>>,
    queue_cv: Condvar,
    /// Outstanding request id -> resolver.
    outstanding: Mutex<HashMap<u64, Resolver>>,
    close_hook: Mutex<Option<Box<dyn FnOnce(CloseReason) + Send>>>,
    peer: String,
}

impl Shared {
    fn send_sync(&self, envelope: &Envelope) -> Result<(), Error> {
        let mut writer = self.writer.lock().expect("poisoned write half");
        write_frame(&mut *writer, envelope)
    }

    fn mark_end(&self) {
        self.end.store(true, Ordering::SeqCst);
        self.queue_cv.notify_all();
    }

    /// Fail every outstanding command: no waiter may block forever.
    fn drain_outstanding(&self, reason: CloseReason) {
        let resolvers: Vec<Resolver> = {
            let mut outstanding = self.outstanding.lock().expect("poisoned correlation map");
            outstanding.drain().map(|(_, r)| r).collect()
        };
        for resolver in resolvers {
            let _ = resolver.resolve(Err(Error::ConnectionClosed(reason)));
        }
    }

    fn fire_close_hook(&self, reason: CloseReason) {
        let hook = self.close_hook.lock().expect("poisoned close hook").take();
        if let Some(hook) = hook {
            hook(reason);
        }
    }
}

/// Cheap cloneable handle onto a live connection. Given to inbound
/// handlers; safe to hold from any thread.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Write one frame now, ordered against all other writes.
    pub fn send_sync(&self, envelope: &Envelope) -> Result<(), Error> {
        self.shared.send_sync(envelope)
    }

    /// Queue a frame for the sender thread. Never blocks the caller.
    pub fn send_async(&self, envelope: Envelope) -> Result<(), Error> {
        if self.is_ended() {
            return Err(Error::ConnectionClosed(CloseReason::Local));
        }
        let mut queue = self.shared.queue.lock().expect("poisoned send queue");
        queue.push_back(envelope);
        self.shared.queue_cv.notify_one();
        Ok(())
    }

    /// Mark the connection for termination. The receiver loop exits after
    /// the current frame, the sender after draining its queue.
    pub fn end_connection(&self) {
        self.shared.mark_end();
    }

    pub fn is_ended(&self) -> bool {
        self.shared.end.load(Ordering::SeqCst)
    }

    pub fn set_verified(&self) {
        self.shared.verified.store(true, Ordering::SeqCst);
    }

    pub fn is_verified(&self) -> bool {
        self.shared.verified.load(Ordering::SeqCst)
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }
}

/// A live framed connection. Owns its transport and both service threads.
pub struct Connection {
    shared: Arc<Shared>,
    receiver: Option<JoinHandle<()>>,
    sender: Option<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl Connection {
    /// Connect to a listening peer.
    pub fn connect<H: InboundHandler>(endpoint: &Endpoint, handler: H) -> Result<Self, Error> {
        let transport = Transport::connect(endpoint)?;
        Self::over(transport, handler)
    }

    /// Run a connection over an already-open transport (the accept side).
    pub fn over<H: InboundHandler>(transport: Transport, handler: H) -> Result<Self, Error> {
        let read_half = transport.try_clone()?;
        let peer = transport.peer().to_string();

        let shared = Arc::new(Shared {
            end: AtomicBool::new(false),
            verified: AtomicBool::new(false),
            writer: Mutex::new(transport),
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            outstanding: Mutex::new(HashMap::new()),
            close_hook: Mutex::new(None),
            peer,
        });

        let receiver = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("gldbg-recv".to_string())
                .spawn(move || receiver_loop(shared, read_half, handler))?
        };
        let sender = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("gldbg-send".to_string())
                .spawn(move || sender_loop(shared))?
        };

        Ok(Self {
            shared,
            receiver: Some(receiver),
            sender: Some(sender),
            next_id: AtomicU64::new(1),
        })
    }

    /// Install a callback fired exactly once when the receiver loop ends,
    /// with the close reason.
    pub fn on_close<F: FnOnce(CloseReason) + Send + 'static>(&self, hook: F) {
        *self.shared.close_hook.lock().expect("poisoned close hook") = Some(Box::new(hook));
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Perform the announce round-trip. On success the connection is
    /// verified and the server's welcome string is returned.
    pub fn establish(&self, client_name: impl Into<String>) -> Result<String, Error> {
        let announce = Body::Announce(Announce {
            id: PROTO_ID,
            client_name: client_name.into(),
            version: Version::current(),
        });
        let reply = self.request(announce)?.wait_timeout(ESTABLISH_TIMEOUT)?;
        match reply.error {
            ErrorCode::None => {
                self.shared.verified.store(true, Ordering::SeqCst);
                gl_info!(target: "connection", "session established: {}", reply.message);
                Ok(reply.message)
            }
            code => Err(Error::Rejected(format!("{code:?}: {}", reply.message))),
        }
    }

    /// Send a request asynchronously; the returned [`Command`] resolves
    /// when the matching reply arrives or the connection dies.
    pub fn request(&self, body: Body) -> Result<Command, Error> {
        if self.shared.end.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed(CloseReason::Local));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (command, resolver) = Command::new(id);
        self.shared
            .outstanding
            .lock()
            .expect("poisoned correlation map")
            .insert(id, resolver);

        let result = self.handle().send_async(Envelope::new(id, body));
        if result.is_err() {
            // never leak a waiter: pull the entry back out and fail it
            if let Some(resolver) = self
                .shared
                .outstanding
                .lock()
                .expect("poisoned correlation map")
                .remove(&id)
            {
                let _ = resolver.resolve(Err(Error::ConnectionClosed(CloseReason::Local)));
            }
        }
        result.map(|_| command)
    }

    /// Request and block until the reply arrives.
    pub fn request_sync(&self, body: Body, timeout: Duration) -> Result<Reply, Error> {
        self.request(body)?.wait_timeout(timeout)
    }

    /// Send a request that expects no reply. The id is still unique and
    /// strictly increasing, but no resolver is registered for it.
    pub fn notify(&self, body: Body) -> Result<(), Error> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handle().send_async(Envelope::new(id, body))
    }

    pub fn is_ended(&self) -> bool {
        self.shared.end.load(Ordering::SeqCst)
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Tear the connection down: mark end, wake both threads through a
    /// socket shutdown, join them, and fail all outstanding commands.
    pub fn close(&mut self) {
        self.shared.mark_end();
        self.shared
            .writer
            .lock()
            .expect("poisoned write half")
            .shutdown();

        if let Some(sender) = self.sender.take() {
            let _ = sender.join();
        }
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.join();
        }

        self.shared.drain_outstanding(CloseReason::Local);
        self.shared.fire_close_hook(CloseReason::Local);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn receiver_loop<H: InboundHandler>(shared: Arc<Shared>, mut read_half: Transport, handler: H) {
    let handle = Handle {
        shared: Arc::clone(&shared),
    };

    let reason = loop {
        if shared.end.load(Ordering::SeqCst) {
            break CloseReason::Local;
        }

        let envelope = match read_frame(&mut read_half) {
            Ok(envelope) => envelope,
            Err(Error::RecvTimeout) => continue,
            Err(Error::ConnectionClosed(CloseReason::Normal)) => {
                // a local shutdown also reads as EOF; report it as such
                if shared.end.load(Ordering::SeqCst) {
                    break CloseReason::Local;
                }
                break CloseReason::Normal;
            }
            Err(e) => {
                if shared.end.load(Ordering::SeqCst) {
                    // failure caused by a local shutdown, not the peer
                    break CloseReason::Local;
                }
                gl_warn!(target: "connection", "receive failed on {}: {e}", shared.peer);
                break CloseReason::Disconnect;
            }
        };

        gl_debug!(
            target: "connection",
            "<- {} (id {}) from {}",
            envelope.body.kind(),
            envelope.id,
            shared.peer
        );

        // replies correlate to outstanding requests; the NOTIFY_ID pseudo-id
        // marks fire-and-forget notifications, which go to the handler
        if let Body::Reply(ref reply) = envelope.body {
            if envelope.id != crate::proto::NOTIFY_ID {
                let resolver = shared
                    .outstanding
                    .lock()
                    .expect("poisoned correlation map")
                    .remove(&envelope.id);
                match resolver {
                    Some(resolver) => {
                        let _ = resolver.resolve(Ok(reply.clone()));
                    }
                    // protocol error, but not worth killing the receiver over
                    None => {
                        let e = Error::UnknownRequest(envelope.id);
                        gl_warn!(target: "connection", "{e} (peer {})", shared.peer);
                    }
                }
                continue;
            }
        }

        let request_id = envelope.id;
        match handler.handle(&handle, envelope) {
            Ok(Some(response)) => {
                if let Err(e) = shared.send_sync(&response) {
                    gl_warn!(target: "connection", "response send failed: {e}");
                    break CloseReason::Disconnect;
                }
            }
            Ok(None) => {}
            Err(e) => {
                gl_warn!(target: "connection", "handler failed for request {request_id}: {e}");
                let reply = Envelope::reply_to(
                    request_id,
                    Reply::error(ErrorCode::Generic, e.to_string()),
                );
                if shared.send_sync(&reply).is_err() {
                    break CloseReason::Disconnect;
                }
                if e.is_fatal() {
                    break CloseReason::Disconnect;
                }
            }
        }
    };

    gl_debug!(target: "connection", "receiver for {} done: {reason}", shared.peer);

    shared.mark_end();
    shared.drain_outstanding(reason);
    shared.fire_close_hook(reason);
}

fn sender_loop(shared: Arc<Shared>) {
    loop {
        let envelope = {
            let mut queue = shared.queue.lock().expect("poisoned send queue");
            loop {
                if let Some(envelope) = queue.pop_front() {
                    break Some(envelope);
                }
                if shared.end.load(Ordering::SeqCst) {
                    break None;
                }
                queue = shared
                    .queue_cv
                    .wait(queue)
                    .expect("poisoned send queue");
            }
        };

        let Some(envelope) = envelope else {
            // end requested and the queue is drained
            return;
        };

        gl_debug!(
            target: "connection",
            "-> {} (id {}) to {}",
            envelope.body.kind(),
            envelope.id,
            shared.peer
        );

        if let Err(e) = shared.send_sync(&envelope) {
            if !shared.end.load(Ordering::SeqCst) {
                gl_warn!(target: "connection", "async send failed on {}: {e}", shared.peer);
            }
            shared.mark_end();
            return;
        }
    }
}

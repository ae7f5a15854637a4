//! Connection multiplexer.
//!
//! A [`Connection`] multiplexes one long-lived duplex byte stream among
//! many concurrent callers. Callers build a [`Request`], submit it with
//! [`exec`](Connection::exec) and await their response; the connection
//! pipelines staged requests, fuses contiguous ones into single socket
//! writes, and delivers responses strictly in submission order. Server
//! pushes bypass the request queue and are drained with
//! [`receive`](Connection::receive).
//!
//! The long-running [`run`](Connection::run) operation owns the socket:
//! it performs the RESP3 handshake and then drives the reader, writer and
//! health checker until the first failure. Reconnection policy lives above
//! this crate: install a fresh stream with
//! [`reset_stream`](Connection::reset_stream) and call `run` again.
//!
//! ```no_run
//! # async fn demo() -> redmux::RedmuxResult<()> {
//! use redmux::{Connection, Endpoint, Request, Timeouts, Value};
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:6379").await?;
//! let conn = Connection::with_stream(stream);
//!
//! let mut req = Request::new();
//! req.push("PING", &[]);
//!
//! let endpoint = Endpoint::new("127.0.0.1", "6379");
//! let run = conn.run(&endpoint, Timeouts::default());
//! let exec = conn.exec(&req, Value::<String>::new());
//! let (exec_result, _exit) = tokio::join!(exec, run);
//! let (pong, _bytes) = exec_result?;
//! assert_eq!(pong.into_inner(), "PONG");
//! # Ok(())
//! # }
//! ```

pub mod health;
pub mod queue;
pub mod reader;
pub mod run;
pub mod writer;

pub use run::RunExit;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;

use crate::adapter::{NodeSink, ResponseAdapter};
use crate::core::error::{RedmuxError, RedmuxResult};
use crate::resp3::{OwnedNode, Request};
use queue::{QueuedEntry, RequestQueue};

/// Default read chunk; adapter hints below this shrink reads further.
pub(crate) const DEFAULT_READ_CHUNK: usize = 4096;

/// Maximum bytes buffered ahead of the parser.
const MAX_READ_BUFFER: usize = 512 * 1024 * 1024;

/// Push channel capacity; the reader additionally waits for each frame's
/// acknowledgement, so undrained pushes stall it.
const PUSH_CHANNEL_CAPACITY: usize = 1;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No stream installed or run not started.
    Disconnected,
    /// Handshake complete; requests flow.
    Connected,
    /// Run is tearing down.
    Draining,
    /// Run has terminated.
    Dead,
}

/// Cancellable operation categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// The long-running `run` supervisor.
    Run,
    /// Pending `exec` submissions that are not yet written.
    Exec,
    /// Pending `receive` calls.
    Receive,
    /// All of the above.
    All,
}

/// A parsed push frame travelling from the reader to `receive`.
pub(crate) struct PushFrame {
    pub nodes: Vec<OwnedNode>,
    pub read_size: usize,
    /// The reader waits on this before reading further frames.
    pub ack: oneshot::Sender<()>,
}

/// State shared between the caller surface and the run-time tasks.
pub(crate) struct Shared {
    pub queue: Mutex<RequestQueue>,
    pub writer_wake: Notify,
    pub status: Mutex<Status>,
    pub last_read: Mutex<Instant>,
    pub push_tx: mpsc::Sender<PushFrame>,
    pub stop_tx: watch::Sender<u64>,
    pub run_active: AtomicBool,
    pub receive_cancel: Notify,
    pub active_receives: AtomicUsize,
}

/// A multiplexed RESP3 client connection.
///
/// Generic over the byte stream; anything satisfying the tokio read/write
/// traits works, so TLS-wrapped transports plug in unchanged.
pub struct Connection<S> {
    shared: Arc<Shared>,
    stream: Mutex<Option<S>>,
    push_rx: tokio::sync::Mutex<mpsc::Receiver<PushFrame>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a connection with no stream installed.
    pub fn new() -> Self {
        let (push_tx, push_rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let (stop_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(RequestQueue::new()),
                writer_wake: Notify::new(),
                status: Mutex::new(Status::Disconnected),
                last_read: Mutex::new(Instant::now()),
                push_tx,
                stop_tx,
                run_active: AtomicBool::new(false),
                receive_cancel: Notify::new(),
                active_receives: AtomicUsize::new(0),
            }),
            stream: Mutex::new(None),
            push_rx: tokio::sync::Mutex::new(push_rx),
        }
    }

    /// Create a connection with a stream already installed.
    pub fn with_stream(stream: S) -> Self {
        let conn = Self::new();
        conn.reset_stream(stream);
        conn
    }

    /// Install a fresh byte stream after a run has completed.
    ///
    /// Used by external reconnect loops between `run` calls.
    pub fn reset_stream(&self, stream: S) {
        *self.stream.lock() = Some(stream);
        *self.shared.status.lock() = Status::Disconnected;
    }

    /// Current lifecycle state.
    pub fn status(&self) -> Status {
        *self.shared.status.lock()
    }

    /// Execute a request, returning the adapter and the number of response
    /// bytes consumed.
    ///
    /// Concurrent calls are queued and complete in submission order. A
    /// request whose commands expect no response (subscribe family)
    /// completes as soon as it has been written.
    ///
    /// Dropping the returned future while the request is still staged
    /// withdraws it; once written, the request runs to completion on the
    /// wire and the result is discarded.
    pub async fn exec<A>(&self, req: &Request, adapter: A) -> RedmuxResult<(A, usize)>
    where
        A: ResponseAdapter + Send + 'static,
    {
        if req.command_count() == 0 {
            return Err(RedmuxError::EmptyRequest);
        }
        let expected = req.expected_responses();
        let supported = adapter.supported_response_size();
        if expected > supported {
            return Err(RedmuxError::IncompatibleAdapter {
                expected,
                supported,
            });
        }
        if req.config().cancel_if_not_connected && self.status() != Status::Connected {
            return Err(RedmuxError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.shared.queue.lock();
            queue.push(QueuedEntry::new(req, Box::new(adapter), tx));
        }
        self.shared.writer_wake.notify_one();

        let (any, read_size) = rx.await.map_err(|_| RedmuxError::ConnectionLost)??;
        let adapter = any.downcast::<A>().map_err(|_| RedmuxError::Internal {
            message: "response adapter type mismatch".to_string(),
        })?;
        Ok((*adapter, read_size))
    }

    /// Receive one server push, feeding its node events to the sink.
    ///
    /// Users expecting pushes (pub/sub, invalidation) should call this in a
    /// loop: the reader does not advance past an unconsumed push, and a
    /// connection left undrained eventually fails with `IdleTimeout`.
    pub async fn receive<A>(&self, mut sink: A) -> RedmuxResult<(A, usize)>
    where
        A: NodeSink,
    {
        self.shared.active_receives.fetch_add(1, Ordering::Relaxed);
        let _guard = ReceiveGuard(&self.shared.active_receives);

        let mut rx = self.push_rx.lock().await;
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    return Err(RedmuxError::Cancelled);
                };
                let mut result = Ok(());
                for node in &frame.nodes {
                    result = sink.on_node(&node.as_node());
                    if result.is_err() {
                        break;
                    }
                }
                let _ = frame.ack.send(());
                result?;
                Ok((sink, frame.read_size))
            }
            _ = self.shared.receive_cancel.notified() => Err(RedmuxError::Cancelled),
        }
    }

    /// Cancel pending operations of the given category.
    ///
    /// Returns the number of operations cancelled. Exec cancellation only
    /// affects requests that have not been written; a written request's
    /// bytes are on the wire and its completion still arrives.
    pub fn cancel(&self, op: Operation) -> usize {
        match op {
            Operation::Exec => self.shared.queue.lock().cancel_staged(),
            Operation::Run => {
                if self.shared.run_active.load(Ordering::Relaxed) {
                    self.shared.stop_tx.send_modify(|g| *g += 1);
                    1
                } else {
                    0
                }
            }
            Operation::Receive => {
                let pending = self.shared.active_receives.load(Ordering::Relaxed);
                self.shared.receive_cancel.notify_waiters();
                pending
            }
            Operation::All => {
                self.cancel(Operation::Exec)
                    + self.cancel(Operation::Run)
                    + self.cancel(Operation::Receive)
            }
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn take_stream(&self) -> Option<S> {
        self.stream.lock().take()
    }
}

impl<S> Default for Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

struct ReceiveGuard<'a>(&'a AtomicUsize);

impl Drop for ReceiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Read buffer supporting peek-prefix / consume-prefix without copying
/// payloads out.
#[derive(Debug)]
pub(crate) struct ReadBuffer {
    buffer: BytesMut,
    max_size: usize,
}

impl ReadBuffer {
    pub fn new(capacity: usize, max_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            max_size,
        }
    }

    /// Append data, guarding against unbounded growth.
    pub fn extend(&mut self, data: &[u8]) -> RedmuxResult<()> {
        if self.buffer.len() + data.len() > self.max_size {
            return Err(RedmuxError::IncompatibleSize(self.buffer.len() + data.len()));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn consume(&mut self, count: usize) {
        let _ = self.buffer.split_to(count);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new(64 * 1024, MAX_READ_BUFFER)
    }
}

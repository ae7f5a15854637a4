//! Run supervisor.
//!
//! `run` owns the installed byte stream for its whole lifetime: it
//! performs the RESP3 handshake, then drives the reader, writer and the
//! two health loops as sibling tasks and completes when the first of them
//! fails. Teardown applies the per-request connection-loss policy to
//! everything still queued and reports how many callers were failed.

use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};

use super::health::{idle_task, ping_task};
use super::reader::reader_task;
use super::writer::writer_task;
use super::{Connection, ReadBuffer, Status, DEFAULT_READ_CHUNK};
use crate::core::config::{Endpoint, Timeouts};
use crate::core::error::{RedmuxError, RedmuxResult};
use crate::resp3::{Kind, Node, OwnedNode, Parser, Request};

/// Outcome of a completed run.
///
/// A run never completes without an error: even an orderly `QUIT` ends in
/// [`RedmuxError::Eof`] when the server closes the stream.
#[derive(Debug)]
pub struct RunExit {
    /// The first error raised by the handshake or one of the sibling
    /// tasks.
    pub error: RedmuxError,

    /// Number of queued requests failed during teardown.
    pub cancelled_requests: usize,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Establish the RESP3 session on the installed stream and service
    /// requests until the connection fails.
    ///
    /// The stream must have been installed by
    /// [`with_stream`](Connection::with_stream) or
    /// [`reset_stream`](Connection::reset_stream); `host` and `port` of
    /// the endpoint are informational here (dialing happens outside the
    /// core), while credentials and role drive the handshake.
    pub async fn run(&self, endpoint: &Endpoint, timeouts: Timeouts) -> RunExit {
        let Some(mut stream) = self.take_stream() else {
            return RunExit {
                error: RedmuxError::NotConnected,
                cancelled_requests: 0,
            };
        };

        let shared = self.shared().clone();
        shared
            .run_active
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let mut stop_rx = shared.stop_tx.subscribe();
        let mut buf = ReadBuffer::default();

        let handshake_result = tokio::select! {
            result = tokio::time::timeout(
                timeouts.resp3_handshake,
                handshake(&mut stream, &mut buf, endpoint),
            ) => match result {
                Err(_) => Err(RedmuxError::Resp3HandshakeTimeout),
                Ok(inner) => inner,
            },
            _ = stop_rx.changed() => Err(RedmuxError::Cancelled),
        };
        if let Err(error) = handshake_result {
            tracing::debug!(error = %error, "handshake failed");
            return self.finish(error);
        }

        *shared.status.lock() = Status::Connected;
        *shared.last_read.lock() = tokio::time::Instant::now();
        tracing::debug!(host = %endpoint.host, port = %endpoint.port, "connection established");

        let (mut read_half, mut write_half) = tokio::io::split(stream);
        // Requests may have queued up while disconnected.
        shared.writer_wake.notify_one();

        let error = tokio::select! {
            res = reader_task(&shared, &mut read_half, &mut buf) => {
                res.err().unwrap_or(RedmuxError::Cancelled)
            }
            res = writer_task(&shared, &mut write_half) => {
                res.err().unwrap_or(RedmuxError::Cancelled)
            }
            res = ping_task(self, timeouts.ping_interval) => {
                res.err().unwrap_or(RedmuxError::Cancelled)
            }
            res = idle_task(&shared, timeouts.ping_interval) => {
                res.err().unwrap_or(RedmuxError::Cancelled)
            }
            _ = stop_rx.changed() => RedmuxError::Cancelled,
        };

        self.finish(error)
    }

    /// Tear the connection down and account for failed callers.
    fn finish(&self, error: RedmuxError) -> RunExit {
        let shared = self.shared();
        *shared.status.lock() = Status::Draining;
        let cancelled_requests = shared.queue.lock().teardown();
        *shared.status.lock() = Status::Dead;
        shared
            .run_active
            .store(false, std::sync::atomic::Ordering::Relaxed);
        tracing::debug!(error = %error, cancelled_requests, "run terminated");
        RunExit {
            error,
            cancelled_requests,
        }
    }
}

/// Send `HELLO 3` (with credentials when present) and validate the reply.
async fn handshake<S>(
    stream: &mut S,
    buf: &mut ReadBuffer,
    endpoint: &Endpoint,
) -> RedmuxResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut req = Request::new();
    match (&endpoint.username, &endpoint.password) {
        (Some(user), Some(pass)) => req.push("HELLO", &[&"3", &"AUTH", user, pass]),
        _ => req.push("HELLO", &[&"3"]),
    }
    stream.write_all(req.payload()).await?;
    stream.flush().await?;

    let mut parser = Parser::new();
    let mut nodes: Vec<OwnedNode> = Vec::new();
    loop {
        let step = parser.consume(buf.data(), &mut |node: &Node<'_>| {
            nodes.push(node.to_owned());
            Ok(())
        })?;
        match step {
            Some(n) => {
                buf.consume(n);
                if parser.done() {
                    break;
                }
            }
            None => {
                let mut tmp = [0u8; DEFAULT_READ_CHUNK];
                let n = stream.read(&mut tmp).await?;
                if n == 0 {
                    return Err(RedmuxError::UnexpectedEof);
                }
                buf.extend(&tmp[..n])?;
            }
        }
    }

    check_hello_reply(&nodes, endpoint)
}

/// Validate the HELLO reply: not an error, a RESP3 map, protocol version
/// 3, and (when asserted) the expected server role.
fn check_hello_reply(nodes: &[OwnedNode], endpoint: &Endpoint) -> RedmuxResult<()> {
    let Some(root) = nodes.first() else {
        return Err(RedmuxError::HandshakeFailed);
    };
    if nodes.len() == 1
        && matches!(
            root.kind,
            Kind::SimpleError | Kind::BlobError | Kind::Null
        )
    {
        return Err(RedmuxError::HandshakeFailed);
    }
    if root.kind != Kind::Map {
        return Err(RedmuxError::HandshakeFailed);
    }

    match field_value(nodes, b"proto") {
        Some(value) if value.payload.as_ref() == b"3" => {}
        _ => return Err(RedmuxError::HandshakeFailed),
    }

    if let Some(role) = endpoint.role.as_deref().filter(|r| !r.is_empty()) {
        match field_value(nodes, b"role") {
            Some(value) if value.payload.as_ref() == role.as_bytes() => {}
            _ => return Err(RedmuxError::UnexpectedServerRole),
        }
    }
    Ok(())
}

/// Look up a top-level field of the reply map by key.
///
/// The map's direct children alternate key/value at depth 1 (an aggregate
/// value contributes one depth-1 header node; its children sit deeper), so
/// only the even slots are field names. A value that happens to equal a
/// key name must not match.
fn field_value<'a>(nodes: &'a [OwnedNode], key: &[u8]) -> Option<&'a OwnedNode> {
    let mut children = nodes.iter().skip(1).filter(|n| n.depth == 1);
    while let Some(field) = children.next() {
        let value = children.next()?;
        if field.payload.as_ref() == key {
            return Some(value);
        }
    }
    None
}

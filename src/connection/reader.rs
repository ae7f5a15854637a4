//! Reader task.
//!
//! Reads frames off the socket and dispatches them: push frames go to the
//! push channel (with a rendezvous acknowledgement so an undrained push
//! stalls the reader), everything else feeds the adapter of the written
//! entry at the queue head, one top-level element at a time. Pushes may
//! interleave between the responses of a single pipelined request.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::queue::QueuedEntry;
use super::{PushFrame, ReadBuffer, Shared, DEFAULT_READ_CHUNK};
use crate::adapter::ErasedAdapter;
use crate::core::error::{RedmuxError, RedmuxResult};
use crate::resp3::{Node, OwnedNode, Parser};

/// Run the read loop until the transport fails or the protocol is
/// violated. Like the writer, this future only completes with an error;
/// a clean peer shutdown surfaces as [`RedmuxError::Eof`].
pub(crate) async fn reader_task<R>(
    shared: &Shared,
    stream: &mut R,
    buf: &mut ReadBuffer,
) -> RedmuxResult<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        if buf.is_empty() {
            fill(shared, stream, buf, DEFAULT_READ_CHUNK).await?;
        }

        if peek_is_push(buf) {
            let (nodes, read_size) = read_push(shared, stream, buf).await?;
            deliver_push(shared, nodes, read_size).await?;
            continue;
        }

        let head = shared.queue.lock().checkout_written_head();
        let Some(entry) = head else {
            // A reply-typed frame with nobody waiting for it: the stream
            // can no longer be matched to callers.
            return Err(RedmuxError::UnsolicitedResponse);
        };
        consume_entry_responses(shared, stream, buf, entry).await?;
    }
}

/// Drive the head entry's adapter until all its responses are consumed.
///
/// On failure the entry is returned to the queue front so the teardown
/// policy decides its fate.
async fn consume_entry_responses<R>(
    shared: &Shared,
    stream: &mut R,
    buf: &mut ReadBuffer,
    mut entry: QueuedEntry,
) -> RedmuxResult<()>
where
    R: AsyncRead + Unpin,
{
    while entry.remaining > 0 {
        let step = next_entry_step(shared, stream, buf, &mut entry).await;
        match step {
            Ok(()) => {}
            Err(err) => {
                shared.queue.lock().return_head(entry);
                return Err(err);
            }
        }
    }

    tracing::trace!(
        responses = entry.expected,
        bytes = entry.read_size,
        "request completed"
    );
    entry.complete();

    let drained = {
        let queue = shared.queue.lock();
        queue.written_responses() == 0
    };
    if drained {
        // The batch is fully consumed; a paused writer may resume.
        shared.writer_wake.notify_one();
    }
    Ok(())
}

/// Consume one frame addressed to the entry: either an interleaved push or
/// the entry's next top-level response.
async fn next_entry_step<R>(
    shared: &Shared,
    stream: &mut R,
    buf: &mut ReadBuffer,
    entry: &mut QueuedEntry,
) -> RedmuxResult<()>
where
    R: AsyncRead + Unpin,
{
    if buf.is_empty() {
        fill_mid_frame(shared, stream, buf, DEFAULT_READ_CHUNK).await?;
    }

    if peek_is_push(buf) {
        let (nodes, read_size) = read_push(shared, stream, buf).await?;
        deliver_push(shared, nodes, read_size).await?;
        return Ok(());
    }

    let consumed = read_one_response(shared, stream, buf, entry).await?;
    entry.read_size += consumed;
    entry.remaining -= 1;
    entry.response_index += 1;
    shared.queue.lock().consumed_written_response();
    Ok(())
}

/// Parse one top-level response through the entry's adapter.
async fn read_one_response<R>(
    shared: &Shared,
    stream: &mut R,
    buf: &mut ReadBuffer,
    entry: &mut QueuedEntry,
) -> RedmuxResult<usize>
where
    R: AsyncRead + Unpin,
{
    let mut parser = Parser::new();
    let mut consumed = 0;
    let index = entry.response_index;

    loop {
        let adapter = &mut entry.adapter;
        let step = parser.consume(buf.data(), &mut |node: &Node<'_>| {
            adapter.on_node(index, node)
        })?;
        match step {
            Some(n) => {
                buf.consume(n);
                consumed += n;
                if parser.done() {
                    break;
                }
            }
            None => {
                let hint = entry.adapter.max_read_size(index, buf.len());
                fill_mid_frame(shared, stream, buf, hint).await?;
            }
        }
    }

    // The first adapter error fails the request; the connection and the
    // wire position stay intact.
    if let Some(err) = parser.take_sink_error() {
        entry.sink_error.get_or_insert(err);
    }
    Ok(consumed)
}

/// Parse a whole push subtree into owned nodes.
async fn read_push<R>(
    shared: &Shared,
    stream: &mut R,
    buf: &mut ReadBuffer,
) -> RedmuxResult<(Vec<OwnedNode>, usize)>
where
    R: AsyncRead + Unpin,
{
    let mut parser = Parser::new();
    let mut nodes = Vec::new();
    let mut consumed = 0;

    loop {
        let step = parser.consume(buf.data(), &mut |node: &Node<'_>| {
            nodes.push(node.to_owned());
            Ok(())
        })?;
        match step {
            Some(n) => {
                buf.consume(n);
                consumed += n;
                if parser.done() {
                    break;
                }
            }
            None => fill_mid_frame(shared, stream, buf, DEFAULT_READ_CHUNK).await?,
        }
    }
    Ok((nodes, consumed))
}

/// Hand a push frame to the channel and wait for the consumer to take it.
///
/// The wait is the backpressure mechanism: with no `receive` in flight the
/// reader stops here, data stops arriving, and the idle checker eventually
/// fails the connection.
async fn deliver_push(
    shared: &Shared,
    nodes: Vec<OwnedNode>,
    read_size: usize,
) -> RedmuxResult<()> {
    tracing::trace!(nodes = nodes.len(), bytes = read_size, "routing push frame");
    let (ack_tx, ack_rx) = oneshot::channel();
    shared
        .push_tx
        .send(PushFrame {
            nodes,
            read_size,
            ack: ack_tx,
        })
        .await
        .map_err(|_| RedmuxError::Cancelled)?;
    // A consumer that drops the frame without acking still consumed it.
    let _ = ack_rx.await;
    Ok(())
}

fn peek_is_push(buf: &ReadBuffer) -> bool {
    buf.data().first() == Some(&b'>')
}

async fn fill<R>(
    shared: &Shared,
    stream: &mut R,
    buf: &mut ReadBuffer,
    hint: usize,
) -> RedmuxResult<()>
where
    R: AsyncRead + Unpin,
{
    read_some(shared, stream, buf, hint, false).await
}

async fn fill_mid_frame<R>(
    shared: &Shared,
    stream: &mut R,
    buf: &mut ReadBuffer,
    hint: usize,
) -> RedmuxResult<()>
where
    R: AsyncRead + Unpin,
{
    read_some(shared, stream, buf, hint, true).await
}

/// Read at most one chunk into the buffer, classifying EOF by position.
async fn read_some<R>(
    shared: &Shared,
    stream: &mut R,
    buf: &mut ReadBuffer,
    hint: usize,
    mid_frame: bool,
) -> RedmuxResult<()>
where
    R: AsyncRead + Unpin,
{
    let chunk = hint.clamp(1, DEFAULT_READ_CHUNK);
    let mut tmp = vec![0u8; chunk];
    let n = stream.read(&mut tmp).await?;
    if n == 0 {
        return Err(if mid_frame || !buf.is_empty() {
            RedmuxError::UnexpectedEof
        } else {
            RedmuxError::Eof
        });
    }
    buf.extend(&tmp[..n])?;
    *shared.last_read.lock() = Instant::now();
    Ok(())
}

//! Writer task.
//!
//! Drains the coalescible staged prefix of the request queue into single
//! socket writes. Writes are gated while responses are outstanding; the
//! reader wakes the writer once a batch has been fully consumed, and
//! `exec` wakes it on every submission.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::Shared;
use crate::core::error::RedmuxResult;

/// Run the write loop until the transport fails.
///
/// Completion of the returned future only ever carries an error; on
/// success the loop keeps waiting for more staged requests.
pub(crate) async fn writer_task<W>(shared: &Shared, stream: &mut W) -> RedmuxResult<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let batch = {
            let mut queue = shared.queue.lock();
            queue.purge_abandoned_staged();
            queue.collect_writable()
        };

        let Some(batch) = batch else {
            shared.writer_wake.notified().await;
            continue;
        };

        stream.write_all(&batch.payload).await?;
        stream.flush().await?;
        tracing::trace!(
            bytes = batch.payload.len(),
            requests = batch.entry_count,
            "wrote request batch"
        );

        let completed = {
            let mut queue = shared.queue.lock();
            queue.mark_written(batch.entry_count)
        };
        // Requests that expect no response are done once written.
        for entry in completed {
            entry.complete();
        }
    }
}

//! Connection health checking.
//!
//! Two cooperating loops, both paced by the configured ping interval:
//!
//! - the ping loop submits an internal `PING` through the regular request
//!   queue and awaits its completion, so a healthy connection always has
//!   traffic;
//! - the idle loop watches the last-read timestamp and fails the
//!   connection when nothing arrived for twice the interval.
//!
//! The ping loop deliberately has no timeout of its own: when the server
//! stops answering, the idle loop is the watchdog that ends the run.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{Connection, Shared};
use crate::adapter::Ignore;
use crate::core::error::{RedmuxError, RedmuxResult};
use crate::resp3::Request;

/// Periodically submit `PING` and await the reply.
///
/// Per-request failures (a server error reply, loss of the connection
/// while tearing down) do not end the loop; the failing component reports
/// the run error itself.
pub(crate) async fn ping_task<S>(
    conn: &Connection<S>,
    interval: Duration,
) -> RedmuxResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut req = Request::new();
    loop {
        tokio::time::sleep(interval).await;
        req.clear();
        req.push("PING", &[]);
        if let Err(err) = conn.exec(&req, Ignore).await {
            tracing::trace!(error = %err, "health ping failed");
        }
    }
}

/// Fail the connection when no data arrives within twice the interval.
pub(crate) async fn idle_task(shared: &Shared, interval: Duration) -> RedmuxResult<()> {
    let window = interval * 2;
    loop {
        tokio::time::sleep(window).await;
        let last_read = *shared.last_read.lock();
        if last_read.elapsed() > window {
            tracing::debug!("no data within idle window, terminating");
            return Err(RedmuxError::IdleTimeout);
        }
    }
}

//! Common test utilities.
//!
//! This module contains shared helpers for integration tests: a scripted
//! server end for `tokio::io::duplex` pairs and a stream wrapper that
//! records individual write calls. Import with `mod common;` in test
//! files.

#![allow(dead_code)]

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

/// Install a tracing subscriber for debugging test runs.
///
/// Call at the top of a failing test and run with `RUST_LOG=trace`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// A canonical HELLO reply advertising protocol 3 and the master role.
pub fn hello_reply() -> Vec<u8> {
    b"%3\r\n\
      $6\r\nserver\r\n$5\r\nredis\r\n\
      $5\r\nproto\r\n:3\r\n\
      $4\r\nrole\r\n$6\r\nmaster\r\n"
        .to_vec()
}

/// A subscribe-confirmation push frame for channel `ch`.
pub fn subscribe_push() -> Vec<u8> {
    b">3\r\n$9\r\nsubscribe\r\n$2\r\nch\r\n:1\r\n".to_vec()
}

/// Read from the stream until the collected bytes contain `needle`,
/// returning everything read so far.
pub async fn read_until<S>(stream: &mut S, needle: &[u8]) -> Vec<u8>
where
    S: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if collected
            .windows(needle.len().max(1))
            .any(|w| w == needle)
        {
            return collected;
        }
        let n = stream.read(&mut chunk).await.expect("server read failed");
        assert!(n > 0, "peer closed while waiting for {:?}", needle);
        collected.extend_from_slice(&chunk[..n]);
    }
}

/// Read exactly `len` bytes.
pub async fn read_exact_len<S>(stream: &mut S, len: usize) -> Vec<u8>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.expect("server read_exact");
    buf
}

/// Answer the client's HELLO with a healthy RESP3 reply.
pub async fn serve_hello(stream: &mut DuplexStream) {
    serve_hello_with(stream, &hello_reply()).await;
}

/// Answer the client's HELLO with the given bytes.
pub async fn serve_hello_with(stream: &mut DuplexStream, reply: &[u8]) {
    // The HELLO pipeline ends with the protocol version argument.
    read_until(stream, b"$5\r\nHELLO\r\n$1\r\n3\r\n").await;
    stream.write_all(reply).await.expect("server write failed");
}

/// Keep consuming bytes until the peer goes away.
pub async fn drain<S>(stream: &mut S)
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// Stream wrapper recording the payload of every completed write call.
///
/// Used to observe coalescing: one fused batch must surface as one
/// underlying write.
pub struct RecordingStream<S> {
    inner: S,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl<S> RecordingStream<S> {
    pub fn new(inner: S) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let writes = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                inner,
                writes: writes.clone(),
            },
            writes,
        )
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RecordingStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RecordingStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            self.writes.lock().unwrap().push(buf[..*n].to_vec());
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

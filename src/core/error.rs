//! Error types and classification.
//!
//! redmux distinguishes errors that are fatal to the connection (framing
//! violations, handshake failures, timeouts detected by the health checker)
//! from errors that terminate a single request (server error replies,
//! adapter conversion failures, cancellation). The fatal kinds are the ones
//! `Connection::run` completes with; per-request kinds are returned by
//! `Connection::exec` while the connection keeps running.

use thiserror::Error;

use crate::adapter::AdapterError;

/// Errors surfaced by the client core.
#[derive(Debug, Error)]
pub enum RedmuxError {
    /// A byte that does not map to any RESP3 type prefix.
    ///
    /// Fatal: the stream framing can no longer be trusted.
    #[error("unknown RESP3 type byte: 0x{0:02x}")]
    UnknownType(u8),

    /// A header field that should be a length or integer is not one.
    #[error("cannot parse field as a number")]
    NotANumber,

    /// A declared aggregate or blob size exceeds the protocol limits.
    #[error("declared size is incompatible: {0}")]
    IncompatibleSize(usize),

    /// Aggregate nesting deeper than the supported maximum.
    #[error("response exceeds maximum nesting depth")]
    NestingTooDeep,

    /// A header field that must not be empty was empty.
    #[error("empty field in RESP3 header")]
    EmptyField,

    /// A boolean element carried something other than `t` or `f`.
    #[error("unexpected boolean value")]
    UnexpectedBoolValue,

    /// The peer closed the stream in the middle of a frame.
    #[error("unexpected end of stream inside a frame")]
    UnexpectedEof,

    /// The peer closed the stream at a frame boundary.
    #[error("end of stream")]
    Eof,

    /// Name resolution did not finish in time (reported by external dialers).
    #[error("resolve timeout")]
    ResolveTimeout,

    /// TCP connect did not finish in time (reported by external dialers).
    #[error("connect timeout")]
    ConnectTimeout,

    /// TLS handshake did not finish in time (reported by external dialers).
    #[error("ssl handshake timeout")]
    SslHandshakeTimeout,

    /// The RESP3 HELLO exchange did not finish in time.
    #[error("resp3 handshake timeout")]
    Resp3HandshakeTimeout,

    /// The server rejected HELLO or did not negotiate protocol version 3.
    #[error("resp3 handshake failed")]
    HandshakeFailed,

    /// The server role does not match the one asserted in the endpoint.
    #[error("unexpected server role")]
    UnexpectedServerRole,

    /// No data arrived within twice the ping interval.
    #[error("idle timeout")]
    IdleTimeout,

    /// A request did not complete within its deadline.
    #[error("exec timeout")]
    ExecTimeout,

    /// A non-push frame arrived while no request was awaiting a response.
    #[error("unsolicited response")]
    UnsolicitedResponse,

    /// Submitted with `cancel_if_not_connected` while disconnected, or no
    /// stream is installed.
    #[error("not connected")]
    NotConnected,

    /// The operation was cancelled before completion.
    #[error("cancelled")]
    Cancelled,

    /// The connection died before the response arrived.
    #[error("connection lost")]
    ConnectionLost,

    /// A request with no commands was submitted.
    #[error("request contains no commands")]
    EmptyRequest,

    /// The adapter supports fewer responses than the request expects.
    #[error("adapter supports {supported} responses, request expects {expected}")]
    IncompatibleAdapter { expected: usize, supported: usize },

    /// Internal invariant violation.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Transport failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Per-request adapter or server-reported failure.
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl RedmuxError {
    /// Check whether this error terminates the connection.
    ///
    /// Non-fatal errors fail a single request; `run` keeps going.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Adapter(_)
                | Self::Cancelled
                | Self::NotConnected
                | Self::ConnectionLost
                | Self::EmptyRequest
                | Self::IncompatibleAdapter { .. }
                | Self::ExecTimeout
                | Self::Internal { .. }
        )
    }
}

/// Result type using RedmuxError.
pub type RedmuxResult<T> = Result<T, RedmuxError>;

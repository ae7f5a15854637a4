//! redmux - Multiplexing RESP3 client core.
//!
//! redmux multiplexes a single long-lived connection to a RESP3 server
//! (Redis and compatibles) among many independent concurrent callers. It
//! pipelines their commands for throughput, fuses contiguous requests into
//! single socket writes, delivers per-caller responses in strict FIFO
//! order, and routes server-initiated push frames (pub/sub messages,
//! invalidations) to a separate receive channel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Concurrent Callers                       │
//! │        exec(request, adapter)   │   receive(push adapter)       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Request Queue                           │
//! │       staged → written → done  │  coalescing  │  FIFO order     │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Writer  │  Reader  │  Health Checker               │
//! │      (spawned by the run supervisor, first failure wins)        │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  RESP3 Parser / Tokenizer                       │
//! │      incremental node events → caller-supplied adapters         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transport establishment (DNS, TCP, TLS) is out of scope: the core
//! consumes any already-opened stream implementing the tokio read/write
//! traits. Reconnection policy also lives above this crate; see
//! [`Connection::reset_stream`].
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Endpoint, timeouts, TOML configuration
//! - [`core::error`] - Error types and classification
//!
//! ## Protocol
//! - [`resp3`] - RESP3 kinds, nodes, tokenizer and incremental parser
//! - [`resp3::request`] - Command pipeline builder
//!
//! ## Adapters
//! - [`adapter`] - Response adapter protocol and built-in sinks
//!
//! ## Connection
//! - [`connection`] - Multiplexer, request queue, reader/writer tasks,
//!   health checking and the run supervisor
//!
//! # Key Invariants
//!
//! - **FIFO**: submission order = write order = completion order
//! - **ONE-WRITER**: at most one writer and one reader task per connection
//! - **PUSH-ORDER**: push frames are delivered in server emission order
//! - **WRITE-THEN-READ**: a request is marked written strictly before any
//!   of its responses is consumed

// Core infrastructure
pub mod core;

// RESP3 protocol layer
pub mod resp3;

// Response adapters
pub mod adapter;

// Connection multiplexer
pub mod connection;

// Re-exports for convenience
pub use crate::core::config::{ClientConfig, Endpoint, Timeouts, TimeoutsConfig};
pub use crate::core::error::{RedmuxError, RedmuxResult};
pub use adapter::{
    AdapterError, FromBulk, Ignore, Members, NodeDump, NodeSink, Optional, Pairs, ResponseAdapter,
    Seq, Value,
};
pub use connection::{Connection, Operation, RunExit, Status};
pub use resp3::{Kind, Node, OwnedNode, Request, RequestConfig, ToBulk};

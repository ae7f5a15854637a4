//! Response adapter protocol.
//!
//! Adapters are sinks for parser node events: the reader streams each
//! response tree into the adapter of the request at the queue head, and the
//! adapter folds the events into its destination without the core ever
//! materializing an intermediate tree.
//!
//! Two traits split the protocol:
//! - [`NodeSink`] consumes the events of **one** response element.
//! - [`ResponseAdapter`] covers a whole pipelined request: the reader tags
//!   each event with the index of the top-level response it belongs to.
//!   Every [`NodeSink`] is a [`ResponseAdapter`] that routes all responses
//!   to itself; tuples of sinks route the k-th response to the k-th sink.
//!
//! Server error frames (`simple_error`, `blob_error`) surface as
//! [`AdapterError::Server`]. They fail the owning request only; the
//! connection keeps running.

pub mod sinks;
pub mod tuple;

pub use sinks::{FromBulk, Members, Optional, Pairs, Seq, Value};

use bytes::Bytes;
use thiserror::Error;

use crate::resp3::{Kind, Node, OwnedNode};

/// Errors produced while folding node events into a destination.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// The server replied with an error frame.
    #[error("server error: {}", String::from_utf8_lossy(message))]
    Server {
        /// Raw error payload as sent by the server.
        message: Bytes,
    },

    /// Got RESP3 null where a value was required.
    #[error("unexpected null")]
    Null,

    /// Expected a scalar element but got an aggregate.
    #[error("expected a scalar, got {found}")]
    ExpectedScalar { found: Kind },

    /// Expected an aggregate element but got a scalar.
    #[error("expected an aggregate")]
    ExpectedAggregate,

    /// Expected a map-shaped aggregate.
    #[error("expected a map, got {found}")]
    ExpectedMap { found: Kind },

    /// Expected a set aggregate.
    #[error("expected a set, got {found}")]
    ExpectedSet { found: Kind },

    /// Payload is not a parsable integer.
    #[error("payload is not a number")]
    NotANumber,

    /// Payload is not a parsable double.
    #[error("payload is not a double")]
    NotADouble,

    /// Payload is not valid UTF-8.
    #[error("payload is not valid utf-8")]
    InvalidUtf8,

    /// Response shape does not match the adapter.
    #[error("response count incompatible with adapter")]
    IncompatibleSize,
}

impl AdapterError {
    /// Map server-reported error kinds, as every typed sink does.
    pub(crate) fn check_frame(node: &Node<'_>) -> Result<(), AdapterError> {
        match node.kind {
            Kind::SimpleError | Kind::BlobError => Err(AdapterError::Server {
                message: Bytes::copy_from_slice(node.payload),
            }),
            _ => Ok(()),
        }
    }
}

/// Sink for the node events of one response element.
pub trait NodeSink {
    /// Consume one pre-order node event.
    fn on_node(&mut self, node: &Node<'_>) -> Result<(), AdapterError>;

    /// Flow-control hint: the most bytes worth reading next, given the
    /// current buffer fill.
    fn max_read_size(&self, _buffered: usize) -> usize {
        usize::MAX
    }
}

/// Adapter for a whole pipelined request.
pub trait ResponseAdapter {
    /// Consume one node event of the `index`-th top-level response.
    fn on_node(&mut self, index: usize, node: &Node<'_>) -> Result<(), AdapterError>;

    /// Number of top-level responses this adapter can route.
    ///
    /// Checked against the request at submit time so mis-sized tuple
    /// adapters fail fast.
    fn supported_response_size(&self) -> usize;

    /// Flow-control hint for the `index`-th response.
    fn max_read_size(&self, index: usize, buffered: usize) -> usize;
}

impl<S: NodeSink> ResponseAdapter for S {
    fn on_node(&mut self, _index: usize, node: &Node<'_>) -> Result<(), AdapterError> {
        NodeSink::on_node(self, node)
    }

    fn supported_response_size(&self) -> usize {
        usize::MAX
    }

    fn max_read_size(&self, _index: usize, buffered: usize) -> usize {
        NodeSink::max_read_size(self, buffered)
    }
}

/// Adapter that discards responses.
///
/// Error frames are still reported, so a fire-and-forget request learns
/// when the server rejected it. Inside a tuple, `Ignore` skips one
/// response.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ignore;

impl NodeSink for Ignore {
    fn on_node(&mut self, node: &Node<'_>) -> Result<(), AdapterError> {
        AdapterError::check_frame(node)
    }
}

/// Lossless adapter: records every node event as an owned record.
///
/// The resulting sequence is the pre-order traversal of the response tree,
/// including attributes and error frames.
#[derive(Debug, Default)]
pub struct NodeDump {
    nodes: Vec<OwnedNode>,
}

impl NodeDump {
    /// Create an empty dump.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events in arrival order.
    pub fn nodes(&self) -> &[OwnedNode] {
        &self.nodes
    }

    /// Extract the recorded events.
    pub fn into_nodes(self) -> Vec<OwnedNode> {
        self.nodes
    }
}

impl NodeSink for NodeDump {
    fn on_node(&mut self, node: &Node<'_>) -> Result<(), AdapterError> {
        self.nodes.push(node.to_owned());
        Ok(())
    }
}

/// Object-safe adapter facade used by the request queue.
///
/// The queue erases the concrete adapter type; `exec` recovers it through
/// `into_any` once the entry completes.
pub(crate) trait ErasedAdapter: Send {
    fn on_node(&mut self, index: usize, node: &Node<'_>) -> Result<(), AdapterError>;

    fn max_read_size(&self, index: usize, buffered: usize) -> usize;

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any + Send>;
}

impl<A> ErasedAdapter for A
where
    A: ResponseAdapter + Send + 'static,
{
    fn on_node(&mut self, index: usize, node: &Node<'_>) -> Result<(), AdapterError> {
        ResponseAdapter::on_node(self, index, node)
    }

    fn max_read_size(&self, index: usize, buffered: usize) -> usize {
        ResponseAdapter::max_read_size(self, index, buffered)
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any + Send> {
        self
    }
}

//! Tuple adapters for pipelined requests.
//!
//! A tuple of sinks adapts a request whose commands expect exactly as many
//! responses: the k-th top-level response is routed to the k-th sink. Use
//! [`Ignore`](super::Ignore) in a position to skip that response.
//!
//! The queue checks `supported_response_size` against the request at
//! submit time, so a mis-sized tuple fails before anything is written.

use super::{AdapterError, NodeSink, ResponseAdapter};
use crate::resp3::Node;

macro_rules! one {
    ($name:ident) => {
        1usize
    };
}

macro_rules! impl_tuple_adapter {
    ($($name:ident => $idx:tt),+) => {
        impl<$($name: NodeSink),+> ResponseAdapter for ($($name,)+) {
            fn on_node(&mut self, index: usize, node: &Node<'_>) -> Result<(), AdapterError> {
                match index {
                    $($idx => self.$idx.on_node(node),)+
                    _ => Err(AdapterError::IncompatibleSize),
                }
            }

            fn supported_response_size(&self) -> usize {
                0usize $(+ one!($name))+
            }

            fn max_read_size(&self, index: usize, buffered: usize) -> usize {
                match index {
                    $($idx => self.$idx.max_read_size(buffered),)+
                    _ => usize::MAX,
                }
            }
        }
    };
}

impl_tuple_adapter!(A0 => 0);
impl_tuple_adapter!(A0 => 0, A1 => 1);
impl_tuple_adapter!(A0 => 0, A1 => 1, A2 => 2);
impl_tuple_adapter!(A0 => 0, A1 => 1, A2 => 2, A3 => 3);
impl_tuple_adapter!(A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4);
impl_tuple_adapter!(A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4, A5 => 5);
impl_tuple_adapter!(A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4, A5 => 5, A6 => 6);
impl_tuple_adapter!(A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4, A5 => 5, A6 => 6, A7 => 7);

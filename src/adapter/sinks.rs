//! Built-in sinks for common destination shapes.
//!
//! Each sink owns its destination and is recovered from `exec` once the
//! request completes. Conversions from raw payload bytes go through
//! [`FromBulk`], which users can implement for their own types.

use std::collections::{BTreeMap, BTreeSet};

use super::{AdapterError, NodeSink};
use crate::resp3::{Kind, Node};

/// Conversion from one bulk payload into a destination value.
pub trait FromBulk: Sized + Default {
    /// Parse a payload into a fresh value.
    fn from_bulk(payload: &[u8]) -> Result<Self, AdapterError>;

    /// Fold a payload into an existing value.
    ///
    /// The default replaces; string-like types append instead so streamed
    /// string chunks accumulate.
    fn merge_bulk(&mut self, payload: &[u8]) -> Result<(), AdapterError> {
        *self = Self::from_bulk(payload)?;
        Ok(())
    }
}

impl FromBulk for String {
    fn from_bulk(payload: &[u8]) -> Result<Self, AdapterError> {
        std::str::from_utf8(payload)
            .map(str::to_owned)
            .map_err(|_| AdapterError::InvalidUtf8)
    }

    fn merge_bulk(&mut self, payload: &[u8]) -> Result<(), AdapterError> {
        let chunk = std::str::from_utf8(payload).map_err(|_| AdapterError::InvalidUtf8)?;
        self.push_str(chunk);
        Ok(())
    }
}

impl FromBulk for Vec<u8> {
    fn from_bulk(payload: &[u8]) -> Result<Self, AdapterError> {
        Ok(payload.to_vec())
    }

    fn merge_bulk(&mut self, payload: &[u8]) -> Result<(), AdapterError> {
        self.extend_from_slice(payload);
        Ok(())
    }
}

impl FromBulk for bool {
    fn from_bulk(payload: &[u8]) -> Result<Self, AdapterError> {
        Ok(payload == b"t")
    }
}

impl FromBulk for f64 {
    fn from_bulk(payload: &[u8]) -> Result<Self, AdapterError> {
        std::str::from_utf8(payload)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(AdapterError::NotADouble)
    }
}

macro_rules! from_bulk_integer {
    ($($ty:ty),+) => {
        $(
            impl FromBulk for $ty {
                fn from_bulk(payload: &[u8]) -> Result<Self, AdapterError> {
                    std::str::from_utf8(payload)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or(AdapterError::NotANumber)
                }
            }
        )+
    };
}

from_bulk_integer!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

/// Scalar sink: parses a single non-null scalar response.
#[derive(Debug, Default)]
pub struct Value<T: FromBulk> {
    value: T,
}

impl<T: FromBulk> Value<T> {
    /// Create an empty scalar sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the collected value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Extract the collected value.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T: FromBulk> NodeSink for Value<T> {
    fn on_node(&mut self, node: &Node<'_>) -> Result<(), AdapterError> {
        AdapterError::check_frame(node)?;
        if node.kind == Kind::Null {
            return Err(AdapterError::Null);
        }
        if node.kind.is_aggregate() {
            return Err(AdapterError::ExpectedScalar { found: node.kind });
        }
        self.value.merge_bulk(node.payload)
    }
}

/// Wraps another sink; a null response leaves the destination empty.
#[derive(Debug, Default)]
pub struct Optional<A> {
    inner: A,
    engaged: bool,
}

impl<A: Default> Optional<A> {
    /// Create a disengaged optional sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped sink, if any non-null node arrived.
    pub fn into_inner(self) -> Option<A> {
        self.engaged.then_some(self.inner)
    }
}

impl<A: NodeSink> NodeSink for Optional<A> {
    fn on_node(&mut self, node: &Node<'_>) -> Result<(), AdapterError> {
        if node.kind == Kind::Null {
            return Ok(());
        }
        self.engaged = true;
        self.inner.on_node(node)
    }

    fn max_read_size(&self, buffered: usize) -> usize {
        self.inner.max_read_size(buffered)
    }
}

/// Sequence sink: folds an array (nested aggregates flattened) into a
/// vector.
#[derive(Debug, Default)]
pub struct Seq<T: FromBulk> {
    items: Vec<T>,
}

impl<T: FromBulk> Seq<T> {
    /// Create an empty sequence sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the collected items.
    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Extract the collected items.
    pub fn into_inner(self) -> Vec<T> {
        self.items
    }
}

impl<T: FromBulk> NodeSink for Seq<T> {
    fn on_node(&mut self, node: &Node<'_>) -> Result<(), AdapterError> {
        AdapterError::check_frame(node)?;
        if node.kind == Kind::Null {
            return Err(AdapterError::Null);
        }
        if node.kind.is_aggregate() {
            // Size known up front: reserve the flattened extent.
            self.items
                .reserve(node.aggregate_size * node.kind.multiplicity());
            return Ok(());
        }
        let mut item = T::default();
        item.merge_bulk(node.payload)?;
        self.items.push(item);
        Ok(())
    }
}

/// Map sink: interprets the children of a map pairwise.
#[derive(Debug, Default)]
pub struct Pairs<K: FromBulk + Ord, V: FromBulk> {
    entries: BTreeMap<K, V>,
    pending_key: Option<K>,
}

impl<K: FromBulk + Ord, V: FromBulk> Pairs<K, V> {
    /// Create an empty map sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the collected entries.
    pub fn entries(&self) -> &BTreeMap<K, V> {
        &self.entries
    }

    /// Extract the collected entries.
    pub fn into_inner(self) -> BTreeMap<K, V> {
        self.entries
    }
}

impl<K: FromBulk + Ord, V: FromBulk> NodeSink for Pairs<K, V> {
    fn on_node(&mut self, node: &Node<'_>) -> Result<(), AdapterError> {
        AdapterError::check_frame(node)?;
        if node.kind == Kind::Null {
            return Err(AdapterError::Null);
        }
        if node.kind.is_aggregate() {
            if node.kind.multiplicity() != 2 {
                return Err(AdapterError::ExpectedMap { found: node.kind });
            }
            return Ok(());
        }
        if node.depth < 1 {
            return Err(AdapterError::ExpectedMap { found: node.kind });
        }
        match self.pending_key.take() {
            None => {
                self.pending_key = Some(K::from_bulk(node.payload)?);
            }
            Some(key) => {
                self.entries.insert(key, V::from_bulk(node.payload)?);
            }
        }
        Ok(())
    }
}

/// Set sink: inserts deduplicated members.
#[derive(Debug, Default)]
pub struct Members<T: FromBulk + Ord> {
    members: BTreeSet<T>,
}

impl<T: FromBulk + Ord> Members<T> {
    /// Create an empty set sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the collected members.
    pub fn members(&self) -> &BTreeSet<T> {
        &self.members
    }

    /// Extract the collected members.
    pub fn into_inner(self) -> BTreeSet<T> {
        self.members
    }
}

impl<T: FromBulk + Ord> NodeSink for Members<T> {
    fn on_node(&mut self, node: &Node<'_>) -> Result<(), AdapterError> {
        AdapterError::check_frame(node)?;
        if node.kind == Kind::Null {
            return Err(AdapterError::Null);
        }
        if node.kind.is_aggregate() {
            if node.kind != Kind::Set {
                return Err(AdapterError::ExpectedSet { found: node.kind });
            }
            return Ok(());
        }
        if node.depth < 1 {
            return Err(AdapterError::ExpectedSet { found: node.kind });
        }
        self.members.insert(T::from_bulk(node.payload)?);
        Ok(())
    }
}

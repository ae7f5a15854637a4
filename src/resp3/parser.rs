//! Incremental RESP3 response parser.
//!
//! The parser drives the [`Tokenizer`](super::Tokenizer) and tracks
//! aggregate nesting with an explicit frame stack, emitting one node event
//! per element in pre-order. It never materializes the response tree; the
//! sink callback decides what to keep.
//!
//! A parser instance handles exactly one top-level element. `consume`
//! performs one framing step at a time and reports how many bytes it took,
//! so the caller can release buffer space as it goes and resume after
//! partial reads at any byte boundary.

use super::tokenizer::{Token, Tokenizer};
use super::{Kind, Node, MAX_NESTING_DEPTH};
use crate::adapter::AdapterError;
use crate::core::error::{RedmuxError, RedmuxResult};

/// Sentinel child count for frames closed by a terminator instead of a
/// declared size.
const STREAMED: usize = usize::MAX;

/// One open aggregate level.
#[derive(Debug)]
struct Frame {
    /// Children still expected; [`STREAMED`] for terminator-closed frames.
    remaining: usize,

    /// Attribute frames annotate the next sibling and do not consume a
    /// child slot of their parent.
    is_attribute: bool,
}

/// Incremental pull parser for one top-level RESP3 element.
#[derive(Debug, Default)]
pub struct Parser {
    tokenizer: Tokenizer,
    stack: Vec<Frame>,
    done: bool,
    sink_error: Option<AdapterError>,
}

impl Parser {
    /// Create a parser for one response element.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the top-level element has been fully consumed.
    pub fn done(&self) -> bool {
        self.done
    }

    /// First error reported by the sink, if any.
    ///
    /// Sink errors do not stop the parse: the remaining bytes of the
    /// element are still consumed so the stream stays in sync, but no
    /// further events are delivered.
    pub fn take_sink_error(&mut self) -> Option<AdapterError> {
        self.sink_error.take()
    }

    /// Perform one framing step from `buf`, feeding the sink.
    ///
    /// Returns the number of bytes consumed, or `Ok(None)` when more input
    /// is needed. Call until [`done`](Self::done) turns true.
    pub fn consume<F>(&mut self, buf: &[u8], sink: &mut F) -> RedmuxResult<Option<usize>>
    where
        F: FnMut(&Node<'_>) -> Result<(), AdapterError>,
    {
        debug_assert!(!self.done);

        let Some((token, consumed)) = self.tokenizer.next(buf)? else {
            return Ok(None);
        };

        match token {
            Token::BlobHeader { .. } => {
                // Payload arrives in a later step.
            }

            Token::Scalar { kind, payload } => {
                self.emit(sink, kind, 1, payload);
                // Streamed chunks are fragments of one logical string, not
                // elements of the enclosing aggregate.
                if kind != Kind::StreamedStringPart {
                    self.element_completed();
                }
            }

            Token::Aggregate { kind, len } => {
                self.emit(sink, kind, len, b"");
                let is_attribute = kind == Kind::Attribute;
                if len == 0 {
                    if !is_attribute {
                        self.element_completed();
                    }
                } else {
                    self.push_frame(len * kind.multiplicity(), is_attribute)?;
                }
            }

            Token::StreamedAggregate { kind } => {
                self.emit(sink, kind, 0, b"");
                self.push_frame(STREAMED, kind == Kind::Attribute)?;
            }

            Token::StreamedStringStart => {
                // No event of its own; the chunks and the terminator carry
                // the data.
                self.push_frame(STREAMED, false)?;
            }

            Token::StreamedStringEnd => {
                self.emit(sink, Kind::StreamedStringPart, 1, b"");
                self.close_streamed_frame();
            }
        }

        Ok(Some(consumed))
    }

    /// Consume a complete element from `buf`, failing on truncated input.
    ///
    /// Returns the total number of bytes consumed.
    pub fn parse_complete<F>(&mut self, buf: &[u8], sink: &mut F) -> RedmuxResult<usize>
    where
        F: FnMut(&Node<'_>) -> Result<(), AdapterError>,
    {
        let mut offset = 0;
        while !self.done {
            match self.consume(&buf[offset..], sink)? {
                Some(n) => offset += n,
                None => return Err(RedmuxError::UnexpectedEof),
            }
        }
        Ok(offset)
    }

    fn emit<F>(&mut self, sink: &mut F, kind: Kind, aggregate_size: usize, payload: &[u8])
    where
        F: FnMut(&Node<'_>) -> Result<(), AdapterError>,
    {
        if self.sink_error.is_some() {
            return;
        }
        let node = Node {
            kind,
            aggregate_size,
            depth: self.stack.len(),
            payload,
        };
        if let Err(err) = sink(&node) {
            self.sink_error = Some(err);
        }
    }

    fn push_frame(&mut self, remaining: usize, is_attribute: bool) -> RedmuxResult<()> {
        if self.stack.len() == MAX_NESTING_DEPTH {
            return Err(RedmuxError::NestingTooDeep);
        }
        self.stack.push(Frame {
            remaining,
            is_attribute,
        });
        Ok(())
    }

    /// Account one completed element and cascade closed frames.
    fn element_completed(&mut self) {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                self.done = true;
                return;
            };
            if frame.remaining == STREAMED {
                // Terminator-closed frames only end via their marker.
                return;
            }
            frame.remaining -= 1;
            if frame.remaining > 0 {
                return;
            }
            match self.stack.pop() {
                Some(closed) if closed.is_attribute => {
                    // Attributes annotate the next sibling; they do not
                    // count against the parent.
                    return;
                }
                _ => {}
            }
        }
    }

    /// Close the innermost terminator-driven frame (LIFO).
    fn close_streamed_frame(&mut self) {
        match self.stack.pop() {
            Some(frame) if frame.is_attribute => {}
            Some(_) => self.element_completed(),
            None => self.done = true,
        }
    }
}

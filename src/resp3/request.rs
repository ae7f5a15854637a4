//! Request builder.
//!
//! A request owns a contiguous buffer holding one or more serialized
//! commands (a pipeline) plus per-request flags that steer queueing and
//! failure behavior. Commands are encoded as RESP3 arrays of blob strings,
//! the only shape the server accepts upstream.
//!
//! Commands of the subscribe family produce no direct reply (the server
//! answers through push frames), so they add nothing to the expected
//! response count; a request made only of them completes as soon as it is
//! written.

/// Per-request behavior flags.
#[derive(Debug, Clone, Copy)]
pub struct RequestConfig {
    /// Allow fusing this request with adjacent staged requests into one
    /// socket write.
    pub coalesce: bool,

    /// Fail the caller with `ConnectionLost` if the connection drops before
    /// the response arrives, instead of waiting for a reconnect.
    pub cancel_on_connection_lost: bool,

    /// Fail immediately with `NotConnected` when submitted while no
    /// connection is established.
    pub cancel_if_not_connected: bool,

    /// If the request was already written when the connection died, keep it
    /// queued and resend it on the next run (at-least-once delivery).
    pub retry: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            coalesce: true,
            cancel_on_connection_lost: true,
            cancel_if_not_connected: false,
            retry: false,
        }
    }
}

/// Serialization of one command argument into bulk strings.
///
/// Implemented for the common string, byte and integer types; key/value
/// pairs contribute two bulks, which makes map-shaped containers usable
/// with [`Request::push_range`].
pub trait ToBulk {
    /// Number of bulk strings this value expands to.
    fn bulk_count(&self) -> usize {
        1
    }

    /// Append the framed bulk string(s) to the buffer.
    fn write_bulk(&self, buf: &mut Vec<u8>);
}

/// Append one framed bulk string.
fn put_bulk(buf: &mut Vec<u8>, data: &[u8]) {
    buf.push(b'$');
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

impl ToBulk for str {
    fn write_bulk(&self, buf: &mut Vec<u8>) {
        put_bulk(buf, self.as_bytes());
    }
}

impl ToBulk for String {
    fn write_bulk(&self, buf: &mut Vec<u8>) {
        put_bulk(buf, self.as_bytes());
    }
}

impl ToBulk for [u8] {
    fn write_bulk(&self, buf: &mut Vec<u8>) {
        put_bulk(buf, self);
    }
}

impl ToBulk for Vec<u8> {
    fn write_bulk(&self, buf: &mut Vec<u8>) {
        put_bulk(buf, self);
    }
}

impl<T: ToBulk + ?Sized> ToBulk for &T {
    fn bulk_count(&self) -> usize {
        (**self).bulk_count()
    }

    fn write_bulk(&self, buf: &mut Vec<u8>) {
        (**self).write_bulk(buf);
    }
}

macro_rules! to_bulk_integer {
    ($($ty:ty),+) => {
        $(
            impl ToBulk for $ty {
                fn write_bulk(&self, buf: &mut Vec<u8>) {
                    put_bulk(buf, self.to_string().as_bytes());
                }
            }
        )+
    };
}

to_bulk_integer!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

impl<K: ToBulk, V: ToBulk> ToBulk for (K, V) {
    fn bulk_count(&self) -> usize {
        self.0.bulk_count() + self.1.bulk_count()
    }

    fn write_bulk(&self, buf: &mut Vec<u8>) {
        self.0.write_bulk(buf);
        self.1.write_bulk(buf);
    }
}

/// A pipeline of commands to execute as one unit.
#[derive(Debug, Default, Clone)]
pub struct Request {
    config: RequestConfig,
    payload: Vec<u8>,
    commands: usize,
    expected_responses: usize,
}

impl Request {
    /// Create an empty request with default flags.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty request with the given flags.
    pub fn with_config(config: RequestConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Request flags.
    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// Mutable request flags.
    pub fn config_mut(&mut self) -> &mut RequestConfig {
        &mut self.config
    }

    /// Append one command with its arguments.
    ///
    /// ```
    /// use redmux::Request;
    ///
    /// let mut req = Request::new();
    /// req.push("PING", &[]);
    /// req.push("SET", &[&"key", &42i64]);
    /// ```
    pub fn push(&mut self, cmd: &str, args: &[&dyn ToBulk]) {
        let bulks = 1 + args.iter().map(|a| a.bulk_count()).sum::<usize>();
        self.put_header(bulks);
        put_bulk(&mut self.payload, cmd.as_bytes());
        for arg in args {
            arg.write_bulk(&mut self.payload);
        }
        self.account(cmd);
    }

    /// Append one command whose arguments come from a sequence.
    ///
    /// `key` is an optional leading argument (e.g. the key of `RPUSH` or
    /// `HSET`); `items` may yield plain values or key/value pairs. An empty
    /// sequence is a no-op, which makes it safe to feed containers
    /// straight through.
    pub fn push_range<I>(&mut self, cmd: &str, key: Option<&str>, items: I)
    where
        I: IntoIterator,
        I::Item: ToBulk,
    {
        let mut bulks = 0;
        let mut scratch = Vec::new();
        for item in items {
            bulks += item.bulk_count();
            item.write_bulk(&mut scratch);
        }
        if bulks == 0 {
            return;
        }

        let total = 1 + usize::from(key.is_some()) + bulks;
        self.put_header(total);
        put_bulk(&mut self.payload, cmd.as_bytes());
        if let Some(key) = key {
            put_bulk(&mut self.payload, key.as_bytes());
        }
        self.payload.extend_from_slice(&scratch);
        self.account(cmd);
    }

    /// Drop all commands, keeping the flags and the allocation.
    pub fn clear(&mut self) {
        self.payload.clear();
        self.commands = 0;
        self.expected_responses = 0;
    }

    /// Number of commands in the pipeline.
    pub fn command_count(&self) -> usize {
        self.commands
    }

    /// Number of top-level responses the server will send.
    pub fn expected_responses(&self) -> usize {
        self.expected_responses
    }

    /// The serialized pipeline.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn put_header(&mut self, bulks: usize) {
        self.payload.push(b'*');
        self.payload
            .extend_from_slice(bulks.to_string().as_bytes());
        self.payload.extend_from_slice(b"\r\n");
    }

    fn account(&mut self, cmd: &str) {
        self.commands += 1;
        if expects_response(cmd) {
            self.expected_responses += 1;
        }
    }
}

/// Whether a command gets a direct reply.
///
/// The subscribe family is answered through push frames only.
fn expects_response(cmd: &str) -> bool {
    !["SUBSCRIBE", "UNSUBSCRIBE", "PSUBSCRIBE"]
        .iter()
        .any(|sub| cmd.eq_ignore_ascii_case(sub))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_encodes_command_array() {
        let mut req = Request::new();
        req.push("PING", &[]);
        assert_eq!(req.payload(), b"*1\r\n$4\r\nPING\r\n");
        assert_eq!(req.command_count(), 1);
        assert_eq!(req.expected_responses(), 1);
    }

    #[test]
    fn test_push_mixed_argument_types() {
        let mut req = Request::new();
        req.push("SET", &[&"key", &42i64]);
        assert_eq!(
            req.payload(),
            b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$2\r\n42\r\n"
        );
    }

    #[test]
    fn test_pipeline_accumulates() {
        let mut req = Request::new();
        req.push("PING", &[]);
        req.push("GET", &[&"k"]);
        assert_eq!(req.command_count(), 2);
        assert_eq!(req.expected_responses(), 2);
        assert!(req.payload().starts_with(b"*1\r\n$4\r\nPING\r\n*2\r\n"));
    }

    #[test]
    fn test_subscribe_family_expects_no_reply() {
        let mut req = Request::new();
        req.push("SUBSCRIBE", &[&"channel"]);
        req.push("psubscribe", &[&"pattern.*"]);
        req.push("UNSUBSCRIBE", &[&"channel"]);
        assert_eq!(req.command_count(), 3);
        assert_eq!(req.expected_responses(), 0);

        req.push("PING", &[]);
        assert_eq!(req.expected_responses(), 1);
    }

    #[test]
    fn test_push_range_sequence() {
        let mut req = Request::new();
        req.push_range("RPUSH", Some("list"), ["a", "b", "c"]);
        assert_eq!(
            req.payload(),
            b"*5\r\n$5\r\nRPUSH\r\n$4\r\nlist\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n"
        );
    }

    #[test]
    fn test_push_range_pairs() {
        let mut req = Request::new();
        req.push_range("HSET", Some("h"), [("f1", "v1"), ("f2", "v2")]);
        // Each pair expands to two bulks: cmd + key + 4 bulks.
        assert!(req.payload().starts_with(b"*6\r\n$4\r\nHSET\r\n"));
    }

    #[test]
    fn test_push_range_empty_is_noop() {
        let mut req = Request::new();
        req.push_range("RPUSH", Some("list"), Vec::<String>::new());
        assert!(req.payload().is_empty());
        assert_eq!(req.command_count(), 0);
    }

    #[test]
    fn test_clear_keeps_config() {
        let mut req = Request::with_config(RequestConfig {
            coalesce: false,
            ..RequestConfig::default()
        });
        req.push("PING", &[]);
        req.clear();
        assert!(req.payload().is_empty());
        assert_eq!(req.expected_responses(), 0);
        assert!(!req.config().coalesce);
    }

    #[test]
    fn test_default_config_flags() {
        let config = RequestConfig::default();
        assert!(config.coalesce);
        assert!(config.cancel_on_connection_lost);
        assert!(!config.cancel_if_not_connected);
        assert!(!config.retry);
    }

    #[test]
    fn test_binary_payload_argument() {
        let mut req = Request::new();
        let blob: Vec<u8> = vec![0, 159, 146, 150];
        req.push("SET", &[&"bin", &blob]);
        let expected_prefix = b"*3\r\n$3\r\nSET\r\n$3\r\nbin\r\n$4\r\n";
        assert!(req.payload().starts_with(expected_prefix));
    }
}

//! Connection multiplexer integration tests.
//!
//! End-to-end scenarios over an in-memory duplex stream with a scripted
//! peer: pipelining, coalescing, push routing, cancellation and failure
//! semantics.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{
    drain, hello_reply, read_exact_len, read_until, serve_hello, serve_hello_with,
    subscribe_push, RecordingStream,
};
use redmux::{
    Connection, Endpoint, Ignore, Kind, NodeDump, Operation, Pairs, RedmuxError, Request,
    RequestConfig, RunExit, Status, Timeouts, Value,
};
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

fn endpoint() -> Endpoint {
    Endpoint::new("localhost", "6379")
}

fn ping_request() -> Request {
    let mut req = Request::new();
    req.push("PING", &[]);
    req
}

/// S1: a single PING round trip delivers one simple-string node and leaves
/// the connection connected.
#[tokio::test]
async fn ping_round_trip() {
    let (client, mut server) = duplex(1 << 16);
    let conn = Connection::with_stream(client);

    tokio::spawn(async move {
        serve_hello(&mut server).await;
        read_until(&mut server, b"PING\r\n").await;
        server.write_all(b"+PONG\r\n").await.unwrap();
        drain(&mut server).await;
    });

    let req = ping_request();
    let logic = async {
        let (dump, read_size) = conn.exec(&req, NodeDump::new()).await.unwrap();
        let nodes = dump.into_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind, Kind::SimpleString);
        assert_eq!(nodes[0].payload.as_ref(), b"PONG");
        assert_eq!(nodes[0].depth, 0);
        assert_eq!(read_size, 7);
        assert_eq!(conn.status(), Status::Connected);
        assert_eq!(conn.cancel(Operation::Run), 1);
    };

    let __ep = endpoint();
    let (exit, ()) = tokio::join!(conn.run(&__ep, Timeouts::default()), logic);
    assert!(matches!(exit.error, RedmuxError::Cancelled));
    assert_eq!(conn.status(), Status::Dead);
}

/// S2: PING + SUBSCRIBE + QUIT pipelined as one request; the subscribe
/// confirmation is a push routed around the queue, the tuple adapter gets
/// PONG and the QUIT acknowledgement, and the run ends with EOF.
#[tokio::test]
async fn pipeline_with_interleaved_push() {
    let (client, mut server) = duplex(1 << 16);
    let conn = Connection::with_stream(client);

    tokio::spawn(async move {
        serve_hello(&mut server).await;
        read_until(&mut server, b"QUIT\r\n").await;
        server.write_all(b"+PONG\r\n").await.unwrap();
        server.write_all(&subscribe_push()).await.unwrap();
        server.write_all(b"+OK\r\n").await.unwrap();
        // QUIT: the server closes the stream.
    });

    let mut req = Request::new();
    req.push("PING", &[]);
    req.push("SUBSCRIBE", &[&"ch"]);
    req.push("QUIT", &[]);
    assert_eq!(req.expected_responses(), 2);

    let exec = async {
        let ((pong, quit), _) = conn
            .exec(&req, (Value::<String>::new(), Value::<String>::new()))
            .await
            .unwrap();
        (pong.into_inner(), quit.into_inner())
    };
    let receive = async {
        let (dump, _) = conn.receive(NodeDump::new()).await.unwrap();
        dump.into_nodes()
    };

    let __ep = endpoint();
    let (exit, (pong, quit), push_nodes) =
        tokio::join!(conn.run(&__ep, Timeouts::default()), exec, receive);

    assert_eq!(pong, "PONG");
    assert_eq!(quit, "OK");
    assert_eq!(push_nodes.len(), 4);
    assert_eq!(push_nodes[0].kind, Kind::Push);
    assert_eq!(push_nodes[0].aggregate_size, 3);
    assert_eq!(push_nodes[1].payload.as_ref(), b"subscribe");
    assert!(matches!(exit.error, RedmuxError::Eof));
    assert_eq!(exit.cancelled_requests, 0);
}

/// S3: a subscriber that never drains the push channel stalls the reader,
/// and the run fails with an idle timeout.
#[tokio::test(start_paused = true)]
async fn subscribe_without_receiver_times_out() {
    let (client, mut server) = duplex(1 << 16);
    let conn = Connection::with_stream(client);

    tokio::spawn(async move {
        serve_hello(&mut server).await;
        read_until(&mut server, b"SUBSCRIBE\r\n$2\r\nch\r\n").await;
        server.write_all(&subscribe_push()).await.unwrap();
        // Swallow health pings without ever answering.
        drain(&mut server).await;
    });

    let mut req = Request::new();
    req.push("SUBSCRIBE", &[&"ch"]);

    let logic = async {
        // A push-only request completes as soon as it is written.
        let (_, read_size) = conn.exec(&req, Ignore).await.unwrap();
        assert_eq!(read_size, 0);
    };

    let __ep = endpoint();
    let (exit, ()) = tokio::join!(conn.run(&__ep, Timeouts::default()), logic);
    assert!(matches!(exit.error, RedmuxError::IdleTimeout));
}

/// S4: cancelling the middle of three staged requests removes it without
/// leaving a gap on the wire.
#[tokio::test]
async fn cancel_staged_middle_request() {
    let (client, mut server) = duplex(1 << 16);
    let conn = Connection::with_stream(client);

    let make = |text: &str| {
        let mut req = Request::new();
        req.push("ECHO", &[&text]);
        req
    };
    let req1 = make("one");
    let req2 = make("two");
    let req3 = make("three");
    let mut expected_wire = req1.payload().to_vec();
    expected_wire.extend_from_slice(req3.payload());

    let wire_len = expected_wire.len();
    let server_task = tokio::spawn(async move {
        serve_hello(&mut server).await;
        let wire = read_exact_len(&mut server, wire_len).await;
        server.write_all(b"+one\r\n+three\r\n").await.unwrap();
        drain(&mut server).await;
        wire
    });

    // Enqueue all three in order, then abandon the middle one while it is
    // still staged.
    let mut f1 = Box::pin(conn.exec(&req1, Value::<String>::new()));
    assert!(tokio::time::timeout(Duration::ZERO, f1.as_mut())
        .await
        .is_err());
    let mut f2 = Box::pin(conn.exec(&req2, Value::<String>::new()));
    assert!(tokio::time::timeout(Duration::ZERO, f2.as_mut())
        .await
        .is_err());
    let mut f3 = Box::pin(conn.exec(&req3, Value::<String>::new()));
    assert!(tokio::time::timeout(Duration::ZERO, f3.as_mut())
        .await
        .is_err());
    drop(f2);

    let logic = async {
        let (r1, r3) = tokio::join!(f1, f3);
        assert_eq!(r1.unwrap().0.into_inner(), "one");
        assert_eq!(r3.unwrap().0.into_inner(), "three");
        conn.cancel(Operation::Run);
    };

    let __ep = endpoint();
    let (exit, ()) = tokio::join!(conn.run(&__ep, Timeouts::default()), logic);
    assert!(matches!(exit.error, RedmuxError::Cancelled));

    // The wire saw exactly request one followed by request three.
    let wire = server_task.await.unwrap();
    assert_eq!(wire, expected_wire);
}

/// S5: the server answers the first request and closes; the second caller
/// is failed by the loss policy and the run reports EOF plus one
/// cancelled request.
#[tokio::test]
async fn half_answered_pipeline_on_close() {
    let (client, mut server) = duplex(1 << 16);
    let conn = Connection::with_stream(client);

    tokio::spawn(async move {
        serve_hello(&mut server).await;
        // Both requests coalesce into one write.
        read_until(&mut server, b"PING\r\n*1\r\n$4\r\nPING\r\n").await;
        server.write_all(b"+PONG\r\n").await.unwrap();
        // Close without answering the second request.
    });

    let req1 = ping_request();
    let req2 = ping_request();
    let logic = async {
        let (r1, r2) = tokio::join!(
            conn.exec(&req1, Value::<String>::new()),
            conn.exec(&req2, Value::<String>::new()),
        );
        assert_eq!(r1.unwrap().0.into_inner(), "PONG");
        assert!(matches!(r2, Err(RedmuxError::ConnectionLost)));
    };

    let __ep = endpoint();
    let (exit, ()) = tokio::join!(conn.run(&__ep, Timeouts::default()), logic);
    assert!(matches!(exit.error, RedmuxError::Eof));
    assert_eq!(exit.cancelled_requests, 1);
}

/// S6: HGETALL with three field/value pairs lands in a map adapter, and
/// the same reply dumped as nodes shows one map header plus six children.
#[tokio::test]
async fn hgetall_into_map_adapter() {
    let reply: &[u8] =
        b"%3\r\n$2\r\nf1\r\n$2\r\nv1\r\n$2\r\nf2\r\n$2\r\nv2\r\n$2\r\nf3\r\n$2\r\nv3\r\n";

    let (client, mut server) = duplex(1 << 16);
    let conn = Connection::with_stream(client);

    tokio::spawn(async move {
        serve_hello(&mut server).await;
        read_until(&mut server, b"HGETALL\r\n$3\r\nkey\r\n").await;
        server.write_all(reply).await.unwrap();
        read_until(&mut server, b"HGETALL\r\n$3\r\nkey\r\n").await;
        server.write_all(reply).await.unwrap();
        drain(&mut server).await;
    });

    let mut req = Request::new();
    req.push("HGETALL", &[&"key"]);

    let logic = async {
        let (pairs, _) = conn
            .exec(&req, Pairs::<String, String>::new())
            .await
            .unwrap();
        let entries = pairs.into_inner();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries["f1"], "v1");
        assert_eq!(entries["f2"], "v2");
        assert_eq!(entries["f3"], "v3");

        let (dump, _) = conn.exec(&req, NodeDump::new()).await.unwrap();
        let nodes = dump.into_nodes();
        assert_eq!(nodes.len(), 7);
        assert_eq!(nodes[0].kind, Kind::Map);
        assert_eq!(nodes[0].aggregate_size, 3);
        assert_eq!(nodes[0].depth, 0);
        assert!(nodes[1..]
            .iter()
            .all(|n| n.kind == Kind::BlobString && n.depth == 1));

        conn.cancel(Operation::Run);
    };

    let __ep = endpoint();
    let (exit, ()) = tokio::join!(conn.run(&__ep, Timeouts::default()), logic);
    assert!(matches!(exit.error, RedmuxError::Cancelled));
}

/// Queue invariant: completion order equals submission order.
#[tokio::test]
async fn fifo_completion_order() {
    let (client, mut server) = duplex(1 << 16);
    let conn = Connection::with_stream(client);

    tokio::spawn(async move {
        serve_hello(&mut server).await;
        // The last submission carries the marker argument "e".
        read_until(&mut server, b"$1\r\ne\r\n").await;
        server
            .write_all(b"+a\r\n+b\r\n+c\r\n+d\r\n+e\r\n")
            .await
            .unwrap();
        drain(&mut server).await;
    });

    let order = Arc::new(Mutex::new(Vec::new()));
    let completed = |i: usize| {
        let order = order.clone();
        let conn = &conn;
        async move {
            let marker = ["a", "b", "c", "d", "e"][i];
            let mut req = Request::new();
            req.push("ECHO", &[&marker]);
            let (value, _) = conn.exec(&req, Value::<String>::new()).await.unwrap();
            assert_eq!(value.into_inner(), marker);
            order.lock().unwrap().push(i);
        }
    };

    let logic = async {
        tokio::join!(
            completed(0),
            completed(1),
            completed(2),
            completed(3),
            completed(4)
        );
        conn.cancel(Operation::Run);
    };

    let __ep = endpoint();
    let (_, ()) = tokio::join!(conn.run(&__ep, Timeouts::default()), logic);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

/// Queue invariant: contiguous coalescible submissions become exactly one
/// underlying write of the concatenated payloads.
#[tokio::test]
async fn coalescing_produces_single_write() {
    let (client, mut server) = duplex(1 << 20);
    let (recording, writes) = RecordingStream::new(client);
    let conn = Connection::with_stream(recording);

    tokio::spawn(async move {
        serve_hello(&mut server).await;
        read_until(&mut server, b"$1\r\nc\r\n").await;
        server.write_all(b"+a\r\n+b\r\n+c\r\n").await.unwrap();
        drain(&mut server).await;
    });

    let make = |marker: &str| {
        let mut req = Request::new();
        req.push("ECHO", &[&marker]);
        req
    };
    let reqs = [make("a"), make("b"), make("c")];
    let mut fused = Vec::new();
    for req in &reqs {
        fused.extend_from_slice(req.payload());
    }

    let logic = async {
        let (r1, r2, r3) = tokio::join!(
            conn.exec(&reqs[0], Value::<String>::new()),
            conn.exec(&reqs[1], Value::<String>::new()),
            conn.exec(&reqs[2], Value::<String>::new()),
        );
        r1.unwrap();
        r2.unwrap();
        r3.unwrap();
        conn.cancel(Operation::Run);
    };

    let __ep = endpoint();
    tokio::join!(conn.run(&__ep, Timeouts::default()), logic);

    let writes = writes.lock().unwrap();
    // First write is the HELLO, second is the fused batch.
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1], fused);
}

/// Queue invariant: cancelling a written request is ignored and its
/// completion still arrives.
#[tokio::test]
async fn written_then_cancel_is_idempotent() {
    let (client, mut server) = duplex(1 << 16);
    let conn = Connection::with_stream(client);

    let (written_tx, written_rx) = tokio::sync::oneshot::channel();
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        serve_hello(&mut server).await;
        read_until(&mut server, b"PING\r\n").await;
        written_tx.send(()).unwrap();
        reply_rx.await.unwrap();
        server.write_all(b"+PONG\r\n").await.unwrap();
        drain(&mut server).await;
    });

    let req = ping_request();
    let logic = async {
        let exec = conn.exec(&req, Value::<String>::new());
        let cancel = async {
            written_rx.await.unwrap();
            // Nothing is staged anymore; the written entry is untouched.
            assert_eq!(conn.cancel(Operation::Exec), 0);
            reply_tx.send(()).unwrap();
        };
        let (result, ()) = tokio::join!(exec, cancel);
        assert_eq!(result.unwrap().0.into_inner(), "PONG");
        conn.cancel(Operation::Run);
    };

    let __ep = endpoint();
    tokio::join!(conn.run(&__ep, Timeouts::default()), logic);
}

/// Cancelling staged requests before any run fails them with `Cancelled`.
#[tokio::test]
async fn cancel_staged_before_run() {
    let conn: Connection<DuplexStream> = Connection::new();
    let req = ping_request();

    let mut fut = Box::pin(conn.exec(&req, Ignore));
    assert!(tokio::time::timeout(Duration::ZERO, fut.as_mut())
        .await
        .is_err());

    assert_eq!(conn.cancel(Operation::Exec), 1);
    assert!(matches!(fut.await, Err(RedmuxError::Cancelled)));
}

/// `cancel_if_not_connected` fails fast while disconnected, and `run`
/// without an installed stream reports `NotConnected`.
#[tokio::test]
async fn not_connected_semantics() {
    let conn: Connection<DuplexStream> = Connection::new();

    let mut req = ping_request();
    req.config_mut().cancel_if_not_connected = true;
    assert!(matches!(
        conn.exec(&req, Ignore).await,
        Err(RedmuxError::NotConnected)
    ));

    let RunExit { error, .. } = conn.run(&endpoint(), Timeouts::default()).await;
    assert!(matches!(error, RedmuxError::NotConnected));
}

/// Submit-time validation: empty requests and undersized tuple adapters
/// are rejected before anything is queued.
#[tokio::test]
async fn submit_time_validation() {
    let conn: Connection<DuplexStream> = Connection::new();

    let empty = Request::new();
    assert!(matches!(
        conn.exec(&empty, Ignore).await,
        Err(RedmuxError::EmptyRequest)
    ));

    let mut req = Request::new();
    req.push("PING", &[]);
    req.push("PING", &[]);
    let result = conn.exec(&req, (Value::<String>::new(),)).await;
    assert!(matches!(
        result,
        Err(RedmuxError::IncompatibleAdapter {
            expected: 2,
            supported: 1,
        })
    ));
}

/// A server error reply fails only the owning request; the connection
/// keeps serving the next one.
#[tokio::test]
async fn server_error_is_per_request() {
    let (client, mut server) = duplex(1 << 16);
    let conn = Connection::with_stream(client);

    tokio::spawn(async move {
        serve_hello(&mut server).await;
        read_until(&mut server, b"$1\r\nb\r\n").await;
        server
            .write_all(b"-ERR wrong number of arguments\r\n+b\r\n")
            .await
            .unwrap();
        drain(&mut server).await;
    });

    let make = |marker: &str| {
        let mut req = Request::new();
        req.push("ECHO", &[&marker]);
        req
    };
    let req1 = make("a");
    let req2 = make("b");

    let logic = async {
        let (r1, r2) = tokio::join!(
            conn.exec(&req1, Value::<String>::new()),
            conn.exec(&req2, Value::<String>::new()),
        );
        match r1 {
            Err(RedmuxError::Adapter(err)) => {
                assert!(err.to_string().contains("wrong number of arguments"));
            }
            other => panic!("expected a server error, got {other:?}"),
        }
        assert_eq!(r2.unwrap().0.into_inner(), "b");
        assert_eq!(conn.status(), Status::Connected);
        conn.cancel(Operation::Run);
    };

    let __ep = endpoint();
    tokio::join!(conn.run(&__ep, Timeouts::default()), logic);
}

/// A retryable written request survives a dead connection and is resent
/// on the next run against a fresh stream.
#[tokio::test]
async fn retry_written_request_across_runs() {
    let (client1, mut server1) = duplex(1 << 16);
    let conn = Connection::with_stream(client1);

    let mut req = Request::with_config(RequestConfig {
        cancel_on_connection_lost: false,
        retry: true,
        ..RequestConfig::default()
    });
    req.push("ECHO", &[&"late"]);

    let mut fut = Box::pin(conn.exec(&req, Value::<String>::new()));
    assert!(tokio::time::timeout(Duration::ZERO, fut.as_mut())
        .await
        .is_err());

    // First run: the server reads the request and dies without answering.
    let server1_task = tokio::spawn(async move {
        serve_hello(&mut server1).await;
        read_until(&mut server1, b"$4\r\nlate\r\n").await;
    });
    let exit = conn.run(&endpoint(), Timeouts::default()).await;
    assert!(matches!(exit.error, RedmuxError::Eof));
    assert_eq!(exit.cancelled_requests, 0);
    server1_task.await.unwrap();

    // Second run: the request is resent and completes.
    let (client2, mut server2) = duplex(1 << 16);
    conn.reset_stream(client2);
    tokio::spawn(async move {
        serve_hello(&mut server2).await;
        read_until(&mut server2, b"$4\r\nlate\r\n").await;
        server2.write_all(b"+late\r\n").await.unwrap();
        drain(&mut server2).await;
    });

    let logic = async {
        let (value, _) = fut.await.unwrap();
        assert_eq!(value.into_inner(), "late");
        conn.cancel(Operation::Run);
    };
    let __ep = endpoint();
    tokio::join!(conn.run(&__ep, Timeouts::default()), logic);
}

/// Handshake rejections: error reply, wrong protocol version, wrong role.
#[tokio::test]
async fn handshake_failures() {
    // The server refuses HELLO.
    let (client, mut server) = duplex(1 << 16);
    let conn = Connection::with_stream(client);
    tokio::spawn(async move {
        serve_hello_with(&mut server, b"-NOPROTO unsupported protocol version\r\n").await;
        drain(&mut server).await;
    });
    let exit = conn.run(&endpoint(), Timeouts::default()).await;
    assert!(matches!(exit.error, RedmuxError::HandshakeFailed));

    // The server negotiates RESP2.
    let (client, mut server) = duplex(1 << 16);
    let conn = Connection::with_stream(client);
    tokio::spawn(async move {
        let downgraded = String::from_utf8(hello_reply())
            .unwrap()
            .replace(":3\r\n", ":2\r\n");
        serve_hello_with(&mut server, downgraded.as_bytes()).await;
        drain(&mut server).await;
    });
    let exit = conn.run(&endpoint(), Timeouts::default()).await;
    assert!(matches!(exit.error, RedmuxError::HandshakeFailed));

    // The server is a master but the endpoint asserts a replica.
    let (client, mut server) = duplex(1 << 16);
    let conn = Connection::with_stream(client);
    tokio::spawn(async move {
        serve_hello(&mut server).await;
        drain(&mut server).await;
    });
    let ep = endpoint().with_role("replica");
    let exit = conn.run(&ep, Timeouts::default()).await;
    assert!(matches!(exit.error, RedmuxError::UnexpectedServerRole));
}

/// An unanswered HELLO trips the handshake timeout.
#[tokio::test(start_paused = true)]
async fn handshake_timeout() {
    let (client, mut server) = duplex(1 << 16);
    let conn = Connection::with_stream(client);
    tokio::spawn(async move {
        drain(&mut server).await;
    });
    let exit = conn.run(&endpoint(), Timeouts::default()).await;
    assert!(matches!(exit.error, RedmuxError::Resp3HandshakeTimeout));
}

/// A reply-typed frame with an empty queue is a protocol violation.
#[tokio::test]
async fn unsolicited_response_fails_connection() {
    let (client, mut server) = duplex(1 << 16);
    let conn = Connection::with_stream(client);
    tokio::spawn(async move {
        serve_hello(&mut server).await;
        server.write_all(b"+SURPRISE\r\n").await.unwrap();
        drain(&mut server).await;
    });
    let exit = conn.run(&endpoint(), Timeouts::default()).await;
    assert!(matches!(exit.error, RedmuxError::UnsolicitedResponse));
}

/// Cancelling receive wakes pending receivers with `Cancelled`.
#[tokio::test]
async fn cancel_pending_receive() {
    let conn: Connection<DuplexStream> = Connection::new();

    let receive = async { conn.receive(NodeDump::new()).await };
    let cancel = async {
        tokio::task::yield_now().await;
        assert_eq!(conn.cancel(Operation::Receive), 1);
    };
    let (result, ()) = tokio::join!(receive, cancel);
    assert!(matches!(result, Err(RedmuxError::Cancelled)));
}

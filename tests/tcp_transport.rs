//! End-to-end scenarios over the TCP backend.

use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use goshawk::{
    Address, Client, Connection, Context, Error, Server, TcpTransport, Transport,
};

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn free_address() -> Address {
    init_tracing();
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Address::new("127.0.0.1", port)
}

/// Start a server with a `String` echo handler and return its address.
fn start_echo_server(transport: &TcpTransport, context: &Context) -> Address {
    let address = free_address();
    let server = transport.server("server");
    let listen_address = address.clone();
    context.block_on(async move {
        server
            .listen(&listen_address, |conn| {
                conn.handler(|message: String| async move { Ok::<String, Error>(message) });
            })
            .await
            .unwrap();
    });
    address
}

#[test]
fn echo() {
    let transport = TcpTransport::new();
    let server_ctx = Context::new("echo-server");
    let client_ctx = Context::new("echo-client");
    let address = start_echo_server(&transport, &server_ctx);

    let client = transport.client("client");
    let response: String = client_ctx.block_on(async move {
        let conn = client.connect(&address).await.unwrap();
        conn.send("Hello world!".to_string()).await.unwrap()
    });
    assert_eq!(response, "Hello world!");

    let transport_ctx = Context::new("echo-shutdown");
    transport_ctx.block_on(async move { transport.close().await });
}

#[test]
fn server_sees_the_client_identifier() {
    let transport = TcpTransport::new();
    let server_ctx = Context::new("peer-id-server");
    let client_ctx = Context::new("peer-id-client");
    let address = free_address();

    let (tx, rx) = std::sync::mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let server = transport.server("server");
    let listen_address = address.clone();
    server_ctx.block_on(async move {
        server
            .listen(&listen_address, move |conn| {
                let _ = tx.lock().unwrap().send(conn.peer_id().map(str::to_owned));
            })
            .await
            .unwrap();
    });

    let client = transport.client("node-42");
    client_ctx.block_on({
        let address = address.clone();
        async move {
            let _conn = client.connect(&address).await.unwrap();
        }
    });

    let peer_id = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(peer_id.as_deref(), Some("node-42"));
}

#[test]
fn unknown_type_fails_the_request() {
    let transport = TcpTransport::new();
    let server_ctx = Context::new("unknown-server");
    let client_ctx = Context::new("unknown-client");
    let address = free_address();

    // No handler registered at all.
    let server = transport.server("server");
    let listen_address = address.clone();
    server_ctx.block_on(async move {
        server.listen(&listen_address, |_conn| {}).await.unwrap();
    });

    let client = transport.client("client");
    let result: Result<i64, Error> = client_ctx.block_on(async move {
        let conn = client.connect(&address).await.unwrap();
        conn.send(7i64).await
    });
    assert!(
        matches!(result, Err(Error::UnknownType(_))),
        "expected UnknownType, got {result:?}"
    );
}

#[test]
fn requests_time_out_without_a_response() {
    let transport = TcpTransport::new();
    let server_ctx = Context::new("timeout-server");
    let client_ctx = Context::new("timeout-client");
    let address = free_address();

    let server = transport.server("server");
    let listen_address = address.clone();
    server_ctx.block_on(async move {
        server
            .listen(&listen_address, |conn| {
                // A handler whose future never completes.
                conn.handler(|_message: String| std::future::pending::<Result<String, Error>>());
            })
            .await
            .unwrap();
    });

    let client = transport.client("client");
    client_ctx.block_on(async move {
        let conn = client.connect(&address).await.unwrap();
        for attempt in 0..3 {
            let started = Instant::now();
            let result: Result<String, Error> = conn.send(format!("attempt-{attempt}")).await;
            let elapsed = started.elapsed();
            assert!(
                matches!(result, Err(Error::Timeout)),
                "attempt {attempt}: expected Timeout, got {result:?}"
            );
            assert!(
                elapsed >= Duration::from_millis(400),
                "attempt {attempt}: timed out too early ({elapsed:?})"
            );
            assert!(
                elapsed <= Duration::from_millis(2000),
                "attempt {attempt}: timed out too late ({elapsed:?})"
            );
        }
    });
}

#[test]
fn close_mid_flight_fails_every_pending_request() {
    let transport = TcpTransport::new();
    let server_ctx = Context::new("midflight-server");
    let client_ctx = Context::new("midflight-client");
    let address = free_address();

    let server = transport.server("server");
    let listen_address = address.clone();
    server_ctx.block_on(async move {
        server
            .listen(&listen_address, |conn| {
                conn.handler(|_message: String| std::future::pending::<Result<String, Error>>());
            })
            .await
            .unwrap();
    });

    let close_count = Arc::new(AtomicUsize::new(0));
    let observed = close_count.clone();
    let client = transport.client("client");
    client_ctx.block_on(async move {
        let conn = client.connect(&address).await.unwrap();
        let _listener = conn.close_listener(move || {
            observed.fetch_add(1, Ordering::Relaxed);
        });

        let futures: Vec<_> = (0..10)
            .map(|i| conn.send::<String, String>(format!("in-flight-{i}")))
            .collect();
        conn.close().await;

        for (i, result) in join_all(futures).await.into_iter().enumerate() {
            assert!(
                matches!(result, Err(Error::Closed)),
                "request {i}: expected Closed, got {result:?}"
            );
        }
    });
    assert_eq!(close_count.load(Ordering::Relaxed), 1);
}

#[test]
fn close_is_idempotent_and_listeners_fire_once() {
    let transport = TcpTransport::new();
    let server_ctx = Context::new("close-server");
    let client_ctx = Context::new("close-client");
    let address = start_echo_server(&transport, &server_ctx);

    let close_count = Arc::new(AtomicUsize::new(0));
    let observed = close_count.clone();
    let client = transport.client("client");
    client_ctx.block_on(async move {
        let conn = client.connect(&address).await.unwrap();
        let _listener = conn.close_listener(move || {
            observed.fetch_add(1, Ordering::Relaxed);
        });

        conn.close().await;
        conn.close().await;
        conn.close().await;

        // Registration after the latch invokes the listener synchronously.
        let late = Arc::new(AtomicUsize::new(0));
        let late_observed = late.clone();
        let _late_listener = conn.close_listener(move || {
            late_observed.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(late.load(Ordering::Relaxed), 1);

        // Sending on a closed connection resolves immediately with Closed.
        let result: Result<String, Error> = conn.send("too late".to_string()).await;
        assert!(matches!(result, Err(Error::Closed)));
    });
    assert_eq!(close_count.load(Ordering::Relaxed), 1);
}

#[test]
fn oversize_frames_are_rejected_without_reaching_the_peer() {
    let transport = TcpTransport::new();
    let server_ctx = Context::new("bound-server");
    let client_ctx = Context::new("bound-client");
    let address = start_echo_server(&transport, &server_ctx);

    let client = transport.client("client");
    client_ctx.block_on(async move {
        let conn = client.connect(&address).await.unwrap();

        let oversize = "x".repeat(40 * 1024);
        let result: Result<String, Error> = conn.send(oversize).await;
        assert!(
            matches!(result, Err(Error::Protocol(_))),
            "expected Protocol, got {result:?}"
        );

        // The channel is unaffected; a legal request still round-trips.
        let response: String = conn.send("still alive".to_string()).await.unwrap();
        assert_eq!(response, "still alive");
    });
}

#[test]
fn handlers_replace_and_remove() {
    let transport = TcpTransport::new();
    let server_ctx = Context::new("replace-server");
    let client_ctx = Context::new("replace-client");
    let address = free_address();

    let server = transport.server("server");
    let listen_address = address.clone();
    let (conn_tx, conn_rx) = std::sync::mpsc::channel();
    let conn_tx = std::sync::Mutex::new(conn_tx);
    server_ctx.block_on(async move {
        server
            .listen(&listen_address, move |conn| {
                conn.handler(|message: String| async move {
                    Ok::<String, Error>(format!("first: {message}"))
                });
                let _ = conn_tx.lock().unwrap().send(conn);
            })
            .await
            .unwrap();
    });

    let client = transport.client("client");
    let client_conn = client_ctx.block_on({
        let address = address.clone();
        async move { client.connect(&address).await.unwrap() }
    });

    let server_conn = conn_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let conn = client_conn.clone();
    let response: String = client_ctx
        .block_on(async move { conn.send("one".to_string()).await.unwrap() });
    assert_eq!(response, "first: one");

    // Re-registration replaces the prior handler.
    let replaced = server_conn.clone();
    server_ctx.block_on(async move {
        replaced.handler(|message: String| async move {
            Ok::<String, Error>(format!("second: {message}"))
        });
    });
    let conn = client_conn.clone();
    let response: String = client_ctx
        .block_on(async move { conn.send("two".to_string()).await.unwrap() });
    assert_eq!(response, "second: two");

    // Removal routes subsequent requests to the unknown-type failure.
    server_ctx.block_on(async move {
        server_conn.remove_handler::<String>();
    });
    let conn = client_conn;
    let result: Result<String, Error> = client_ctx
        .block_on(async move { conn.send("three".to_string()).await });
    assert!(matches!(result, Err(Error::UnknownType(_))));
}

#[test]
fn handlers_run_on_their_registering_context() {
    let transport = TcpTransport::new();
    let server_ctx = Context::new("affinity-server");
    let handler_ctx = Context::new("affinity-handler");
    let client_ctx = Context::new("affinity-client");
    let address = free_address();

    let server = transport.server("server");
    let listen_address = address.clone();
    let (conn_tx, conn_rx) = std::sync::mpsc::channel();
    let conn_tx = std::sync::Mutex::new(conn_tx);
    server_ctx.block_on(async move {
        server
            .listen(&listen_address, move |conn| {
                let _ = conn_tx.lock().unwrap().send(conn);
            })
            .await
            .unwrap();
    });

    let client = transport.client("client");
    let client_conn = client_ctx.block_on({
        let address = address.clone();
        async move { client.connect(&address).await.unwrap() }
    });

    // Register the handler from a context other than the server's; the
    // handler must observe that context at invocation time.
    let server_conn = conn_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let expected = handler_ctx.id();
    handler_ctx.block_on(async move {
        server_conn.handler(move |message: String| async move {
            let observed = Context::current().map(|c| c.id());
            if observed == Some(expected) {
                Ok::<String, Error>(message)
            } else {
                Err(Error::Remote(format!(
                    "handler ran on {observed:?}, expected {expected}"
                )))
            }
        });
    });

    let sender = client_ctx.id();
    let outcome = client_ctx.block_on(async move {
        let response: String = client_conn.send("check".to_string()).await?;
        // The completion resumes on the sending context.
        let resumed = Context::current().map(|c| c.id());
        Ok::<(String, Option<u64>), Error>((response, resumed))
    });
    let (response, resumed) = outcome.unwrap();
    assert_eq!(response, "check");
    assert_eq!(resumed, Some(sender));
}

#[test]
fn concurrent_senders_each_get_their_own_responses() {
    const CONTEXTS: usize = 4;
    const REQUESTS: usize = 1000;
    const WAVE: usize = 100;

    let transport = TcpTransport::new();
    let server_ctx = Context::new("swarm-server");
    let address = start_echo_server(&transport, &server_ctx);

    let workers: Vec<_> = (0..CONTEXTS)
        .map(|worker| {
            let client = transport.client(&format!("client-{worker}"));
            let address = address.clone();
            std::thread::spawn(move || {
                let context = Context::new(format!("swarm-{worker}"));
                let expected = context.id();
                context.block_on(async move {
                    let conn = client.connect(&address).await.unwrap();
                    let mut received = 0usize;
                    for wave in 0..(REQUESTS / WAVE) {
                        let futures: Vec<_> = (0..WAVE)
                            .map(|i| {
                                conn.send::<String, String>(format!(
                                    "w{worker}-{wave}-{i}"
                                ))
                            })
                            .collect();
                        for (i, result) in
                            join_all(futures).await.into_iter().enumerate()
                        {
                            let response = result.unwrap();
                            assert_eq!(response, format!("w{worker}-{wave}-{i}"));
                            assert_eq!(
                                Context::current().map(|c| c.id()),
                                Some(expected),
                                "response resumed off its originating context"
                            );
                            received += 1;
                        }
                    }
                    received
                })
            })
        })
        .collect();

    let total: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert_eq!(total, CONTEXTS * REQUESTS);
}

#[test]
fn send_off_context_is_an_argument_error() {
    let transport = TcpTransport::new();
    let server_ctx = Context::new("offctx-server");
    let client_ctx = Context::new("offctx-client");
    let address = start_echo_server(&transport, &server_ctx);

    let client = transport.client("client");
    let conn = client_ctx.block_on(async move { client.connect(&address).await.unwrap() });

    // This thread is not a context.
    let result: Result<String, Error> =
        futures::executor::block_on(conn.send("nope".to_string()));
    assert!(matches!(result, Err(Error::Argument(_))));
}

#[test]
fn connect_to_a_dead_port_fails_on_the_caller() {
    let transport = TcpTransport::new();
    let client_ctx = Context::new("refused-client");
    let address = free_address();

    let client = transport.client("client");
    let result = client_ctx.block_on(async move { client.connect(&address).await });
    assert!(
        matches!(result, Err(Error::Transport(_))),
        "expected Transport, got {:?}",
        result.err()
    );
}

#[test]
fn listen_is_idempotent_per_server() {
    let transport = TcpTransport::new();
    let server_ctx = Context::new("rebind-server");
    let address = free_address();

    let server = transport.server("server");
    let accepted = Arc::new(AtomicUsize::new(0));
    server_ctx.block_on({
        let server = server.clone();
        let address = address.clone();
        let accepted = accepted.clone();
        async move {
            server
                .listen(&address, move |_conn| {
                    accepted.fetch_add(1, Ordering::Relaxed);
                })
                .await
                .unwrap();
            // Second call completes without a second bind.
            server.listen(&address, |_conn| {}).await.unwrap();
        }
    });

    // The original accept callback stays in force.
    let client_ctx = Context::new("rebind-client");
    let client = transport.client("client");
    client_ctx.block_on(async move {
        let _conn = client.connect(&address).await.unwrap();
    });
    let deadline = Instant::now() + Duration::from_secs(2);
    while accepted.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(accepted.load(Ordering::Relaxed), 1);
}

#[test]
fn bind_conflicts_surface_as_bind_errors() {
    let transport = TcpTransport::new();
    let server_ctx = Context::new("conflict-server");

    // Hold the port with a plain listener.
    let holder = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let address = Address::from(holder.local_addr().unwrap());

    let server = transport.server("server");
    let result = server_ctx.block_on(async move { server.listen(&address, |_conn| {}).await });
    assert!(
        matches!(result, Err(Error::Bind(_))),
        "expected Bind, got {:?}",
        result.err()
    );
}

//! The in-process backend must match the TCP backend's observable
//! behavior, modulo latency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use goshawk::{
    Address, Client, Connection, Context, Error, LocalRegistry, LocalTransport, Server, Transport,
};

fn address(port: u16) -> Address {
    Address::new("127.0.0.1", port)
}

#[test]
fn echo_parity() {
    let transport = LocalTransport::new(LocalRegistry::new());
    let server_ctx = Context::new("local-echo-server");
    let client_ctx = Context::new("local-echo-client");
    let addr = address(5001);

    let server = transport.server("server");
    let listen_address = addr.clone();
    server_ctx.block_on(async move {
        server
            .listen(&listen_address, |conn| {
                conn.handler(|message: String| async move { Ok::<String, Error>(message) });
            })
            .await
            .unwrap();
    });

    let client = transport.client("client");
    let response: String = client_ctx.block_on(async move {
        let conn = client.connect(&addr).await.unwrap();
        conn.send("Hello world!".to_string()).await.unwrap()
    });
    assert_eq!(response, "Hello world!");
}

#[test]
fn missing_handler_is_a_transport_error() {
    let transport = LocalTransport::new(LocalRegistry::new());
    let server_ctx = Context::new("local-nohandler-server");
    let client_ctx = Context::new("local-nohandler-client");
    let addr = address(5002);

    let server = transport.server("server");
    let listen_address = addr.clone();
    server_ctx.block_on(async move {
        server.listen(&listen_address, |_conn| {}).await.unwrap();
    });

    let client = transport.client("client");
    let result: Result<String, Error> = client_ctx.block_on(async move {
        let conn = client.connect(&addr).await.unwrap();
        conn.send("anyone there?".to_string()).await
    });
    assert!(
        matches!(result, Err(Error::Transport(_))),
        "expected Transport, got {result:?}"
    );
}

#[test]
fn connect_without_a_server_is_refused() {
    let transport = LocalTransport::new(LocalRegistry::new());
    let client_ctx = Context::new("local-refused-client");

    let client = transport.client("client");
    let result = client_ctx.block_on(async move { client.connect(&address(5003)).await });
    assert!(
        matches!(result, Err(Error::Transport(_))),
        "expected Transport, got {:?}",
        result.err()
    );
}

#[test]
fn close_notifies_both_ends_once() {
    let transport = LocalTransport::new(LocalRegistry::new());
    let server_ctx = Context::new("local-close-server");
    let client_ctx = Context::new("local-close-client");
    let addr = address(5004);

    let server_closes = Arc::new(AtomicUsize::new(0));
    let server = transport.server("server");
    let listen_address = addr.clone();
    let observed = server_closes.clone();
    server_ctx.block_on(async move {
        server
            .listen(&listen_address, move |conn| {
                let observed = observed.clone();
                let _listener = conn.close_listener(move || {
                    observed.fetch_add(1, Ordering::Relaxed);
                });
            })
            .await
            .unwrap();
    });

    let client_closes = Arc::new(AtomicUsize::new(0));
    let observed = client_closes.clone();
    let client = transport.client("client");
    client_ctx.block_on(async move {
        let conn = client.connect(&addr).await.unwrap();
        let _listener = conn.close_listener(move || {
            observed.fetch_add(1, Ordering::Relaxed);
        });
        conn.close().await;
        conn.close().await;

        let result: Result<String, Error> = conn.send("too late".to_string()).await;
        assert!(matches!(result, Err(Error::Closed)));
    });

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while server_closes.load(Ordering::Relaxed) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(client_closes.load(Ordering::Relaxed), 1);
    assert_eq!(server_closes.load(Ordering::Relaxed), 1);
}

#[test]
fn server_close_removes_the_registry_entry() {
    let registry = LocalRegistry::new();
    let transport = LocalTransport::new(registry.clone());
    let server_ctx = Context::new("local-remove-server");
    let client_ctx = Context::new("local-remove-client");
    let addr = address(5005);

    let server = transport.server("server");
    let listen_address = addr.clone();
    server_ctx.block_on(async move {
        server.listen(&listen_address, |_conn| {}).await.unwrap();
    });

    let closing = transport.server("server");
    server_ctx.block_on(async move { closing.close().await });

    let client = transport.client("client");
    let result = client_ctx.block_on(async move { client.connect(&addr).await });
    assert!(matches!(result, Err(Error::Transport(_))));
}

#[test]
fn handler_failures_come_back_as_remote_errors() {
    let transport = LocalTransport::new(LocalRegistry::new());
    let server_ctx = Context::new("local-fault-server");
    let client_ctx = Context::new("local-fault-client");
    let addr = address(5006);

    let server = transport.server("server");
    let listen_address = addr.clone();
    server_ctx.block_on(async move {
        server
            .listen(&listen_address, |conn| {
                conn.handler(|_message: String| async move {
                    Err::<String, Error>(Error::Remote("refused politely".into()))
                });
            })
            .await
            .unwrap();
    });

    let client = transport.client("client");
    let result: Result<String, Error> = client_ctx.block_on(async move {
        let conn = client.connect(&addr).await.unwrap();
        conn.send("please fail".to_string()).await
    });
    match result {
        Err(Error::Remote(message)) => assert_eq!(message, "refused politely"),
        other => panic!("expected Remote, got {other:?}"),
    }
}

#[test]
fn server_side_connection_carries_the_client_identifier() {
    let transport = LocalTransport::new(LocalRegistry::new());
    let server_ctx = Context::new("local-peer-server");
    let client_ctx = Context::new("local-peer-client");
    let addr = address(5007);

    let (tx, rx) = std::sync::mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let server = transport.server("server");
    let listen_address = addr.clone();
    server_ctx.block_on(async move {
        server
            .listen(&listen_address, move |conn| {
                let _ = tx.lock().unwrap().send(conn.peer_id().map(str::to_owned));
            })
            .await
            .unwrap();
    });

    let client = transport.client("node-7");
    client_ctx.block_on(async move {
        let _conn = client.connect(&addr).await.unwrap();
    });

    let peer_id = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(peer_id.as_deref(), Some("node-7"));
}

#[test]
fn responses_resume_on_the_sending_context() {
    let transport = LocalTransport::new(LocalRegistry::new());
    let server_ctx = Context::new("local-affinity-server");
    let client_ctx = Context::new("local-affinity-client");
    let addr = address(5008);

    let server = transport.server("server");
    let listen_address = addr.clone();
    server_ctx.block_on(async move {
        server
            .listen(&listen_address, |conn| {
                conn.handler(|message: String| async move { Ok::<String, Error>(message) });
            })
            .await
            .unwrap();
    });

    let expected = client_ctx.id();
    let client = transport.client("client");
    let resumed = client_ctx.block_on(async move {
        let conn = client.connect(&addr).await.unwrap();
        let _response: String = conn.send("ping".to_string()).await.unwrap();
        Context::current().map(|c| c.id())
    });
    assert_eq!(resumed, Some(expected));
}

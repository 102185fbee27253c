//! Integration tests for the engine layer.
//!
//! Exercises the full flow over real TCP: polling handshake and message
//! exchange, websocket dial, keep-alive, error responses, and the
//! polling → websocket upgrade under queued traffic.

#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs)]

use std::{net::SocketAddr, sync::OnceLock, time::Duration};

use async_tungstenite::tokio::connect_async;
use futures::{SinkExt, StreamExt};
use strata_engine::{socket::Event, Framing, Options, PacketKind, Parameters, Payload, Server};
use testresult::TestResult;
use tokio::net::TcpListener;
use tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

// ─── Test Server Harness ─────────────────────────────────────────────────────

struct TestServer {
    server: Server,
    address: SocketAddr,
}

impl TestServer {
    async fn start(options: Options) -> Self {
        init_tracing();
        let server = Server::new(options);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local_addr");
        let accept_server = server.clone();
        tokio::spawn(async move { accept_server.serve(listener).await });
        Self { server, address }
    }

    fn http_url(&self, query: &str) -> String {
        if query.is_empty() {
            format!("http://{}/engine.io/", self.address)
        } else {
            format!("http://{}/engine.io/?{query}", self.address)
        }
    }

    fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/engine.io/?{query}", self.address)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let server = self.server.clone();
        tokio::spawn(async move { server.close().await });
    }
}

/// Open a polling session and return its handshake parameters.
async fn polling_handshake(ts: &TestServer, http: &reqwest::Client) -> Parameters {
    let body = http
        .get(ts.http_url("EIO=3&transport=polling&b64=1"))
        .send()
        .await
        .expect("GET")
        .bytes()
        .await
        .expect("body");

    let payload = Payload::decode(&body, Framing::Text).expect("payload");
    let open = &payload.packets[0];
    assert_eq!(open.packet_kind, PacketKind::Open);
    serde_json::from_slice(&open.data).expect("parameters")
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn websocket_handshake_carries_session_parameters() -> TestResult {
    let ts = TestServer::start(Options::default()).await;
    let client = strata_engine::Client::dial(&ts.http_url("")).await?;

    let params = client.parameters();
    assert_eq!(params.ping_interval, 25_000);
    assert_eq!(params.ping_timeout, 5_000);
    assert_eq!(params.upgrades, vec!["websocket".to_owned()]);
    assert_eq!(params.sid.len(), 26);
    assert_eq!(client.sid(), params.sid);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn polling_session_exchanges_messages() -> TestResult {
    let ts = TestServer::start(Options::default()).await;
    let http = reqwest::Client::new();

    let params = polling_handshake(&ts, &http).await;
    let socket = tokio::time::timeout(WAIT, ts.server.accept()).await??;
    assert_eq!(socket.sid(), params.sid);
    let events = socket.events();

    // Client → server.
    let resp = http
        .post(ts.http_url(&format!("EIO=3&transport=polling&sid={}", params.sid)))
        .header("content-type", "text/plain; charset=utf-8")
        .body("6:4hello")
        .send()
        .await?;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await?, "OK");

    let event = tokio::time::timeout(WAIT, events.recv()).await??;
    assert_eq!(
        event,
        Event::Message(strata_engine::MessageKind::Text, b"hello".to_vec())
    );

    // Server → client.
    socket.send(b"back".to_vec()).await?;
    let body = http
        .get(ts.http_url(&format!(
            "EIO=3&transport=polling&sid={}&b64=1",
            params.sid
        )))
        .send()
        .await?
        .bytes()
        .await?;
    assert_eq!(&body[..], b"5:4back");

    Ok(())
}

#[tokio::test]
async fn polling_ping_is_answered_with_matching_pong() -> TestResult {
    let ts = TestServer::start(Options::default()).await;
    let http = reqwest::Client::new();
    let params = polling_handshake(&ts, &http).await;
    let socket = tokio::time::timeout(WAIT, ts.server.accept()).await??;
    let events = socket.events();

    http.post(ts.http_url(&format!("EIO=3&transport=polling&sid={}", params.sid)))
        .header("content-type", "text/plain; charset=utf-8")
        .body("6:2probe")
        .send()
        .await?;

    let event = tokio::time::timeout(WAIT, events.recv()).await??;
    assert_eq!(event, Event::Ping(b"probe".to_vec()));

    let body = http
        .get(ts.http_url(&format!(
            "EIO=3&transport=polling&sid={}&b64=1",
            params.sid
        )))
        .send()
        .await?
        .bytes()
        .await?;
    assert_eq!(&body[..], b"6:3probe");
    Ok(())
}

#[tokio::test]
async fn jsonp_polling_wraps_the_frame() -> TestResult {
    let ts = TestServer::start(Options::default()).await;
    let http = reqwest::Client::new();

    let resp = http
        .get(ts.http_url("EIO=3&transport=polling&j=7"))
        .send()
        .await?;
    assert_eq!(
        resp.headers()["content-type"],
        "text/javascript; charset=UTF-8"
    );
    let text = resp.text().await?;
    assert!(text.starts_with("___eio[7](\""), "got: {text}");
    assert!(text.ends_with("\");"), "got: {text}");
    Ok(())
}

#[tokio::test]
async fn invalid_requests_are_rejected() -> TestResult {
    let ts = TestServer::start(Options::default()).await;
    let http = reqwest::Client::new();

    for query in [
        "EIO=2&transport=polling",  // wrong protocol version
        "EIO=3&transport=carrier",  // unknown transport
        "EIO=3&transport=polling&sid=UNKNOWN", // unknown session
    ] {
        let resp = http.get(ts.http_url(query)).send().await?;
        assert_eq!(resp.status(), 400, "query {query}");
    }

    // Unknown content type on POST.
    let params = polling_handshake(&ts, &http).await;
    let resp = http
        .post(ts.http_url(&format!("EIO=3&transport=polling&sid={}", params.sid)))
        .header("content-type", "application/json")
        .body("{}")
        .send()
        .await?;
    assert_eq!(resp.status(), 400);
    Ok(())
}

#[tokio::test]
async fn upgrade_replays_queued_packets_in_order() -> TestResult {
    let ts = TestServer::start(Options::default()).await;
    let http = reqwest::Client::new();

    let params = polling_handshake(&ts, &http).await;
    let socket = tokio::time::timeout(WAIT, ts.server.accept()).await??;
    let events = socket.events();

    // Queue outbound traffic that nobody is polling for; it sits in the
    // polling transport's out queue and must survive the cut.
    for text in ["one", "two", "three"] {
        socket.send(text.into()).await?;
    }
    // Let the outbound worker push the messages into the transport.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Drive the upgrade dance by hand on a second transport.
    let (mut ws, _) = connect_async(ts.ws_url(&format!(
        "EIO=3&transport=websocket&sid={}",
        params.sid
    )))
    .await?;

    ws.send(Message::text("2probe")).await?;
    let pong = tokio::time::timeout(WAIT, ws.next()).await?.unwrap()?;
    assert_eq!(pong, Message::text("3probe"));

    ws.send(Message::text("5")).await?;

    let mut received = Vec::new();
    while received.len() < 3 {
        let message = tokio::time::timeout(WAIT, ws.next()).await?.unwrap()?;
        match message {
            Message::Text(text) => {
                let bytes = text.as_bytes();
                assert_eq!(bytes[0], b'4', "expected MESSAGE frame, got {text:?}");
                received.push(String::from_utf8(bytes[1..].to_vec())?);
            }
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert_eq!(received, vec!["one", "two", "three"]);

    let event = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await.expect("event") {
                Event::Upgrade => break Event::Upgrade,
                _ => continue,
            }
        }
    })
    .await?;
    assert_eq!(event, Event::Upgrade);
    assert_eq!(socket.transport().await, "websocket");

    // The swapped transport carries new traffic too.
    socket.send(b"after".to_vec()).await?;
    let message = tokio::time::timeout(WAIT, ws.next()).await?.unwrap()?;
    assert_eq!(message, Message::text("4after"));

    // A failed poll on the dead transport is rejected.
    let resp = http
        .get(ts.http_url(&format!(
            "EIO=3&transport=polling&sid={}&b64=1",
            params.sid
        )))
        .send()
        .await?;
    assert_eq!(resp.status(), 400);
    Ok(())
}

#[tokio::test]
async fn probe_failure_leaves_the_session_on_polling() -> TestResult {
    let ts = TestServer::start(Options::default()).await;
    let http = reqwest::Client::new();
    let params = polling_handshake(&ts, &http).await;
    let socket = tokio::time::timeout(WAIT, ts.server.accept()).await??;

    // Open the websocket but send garbage instead of the PING probe.
    let (mut ws, _) = connect_async(ts.ws_url(&format!(
        "EIO=3&transport=websocket&sid={}",
        params.sid
    )))
    .await?;
    ws.send(Message::text("4not-a-probe")).await?;

    // The server closes the new transport and the session stays on polling.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(socket.transport().await, "polling");

    socket.send(b"still-here".to_vec()).await?;
    let body = http
        .get(ts.http_url(&format!(
            "EIO=3&transport=polling&sid={}&b64=1",
            params.sid
        )))
        .send()
        .await?
        .bytes()
        .await?;
    assert_eq!(&body[..], b"11:4still-here");
    Ok(())
}

#[tokio::test]
async fn client_close_tears_down_the_server_session() -> TestResult {
    let ts = TestServer::start(Options::default()).await;
    let client = strata_engine::Client::dial(&ts.http_url("")).await?;
    let _socket = tokio::time::timeout(WAIT, ts.server.accept()).await??;
    assert_eq!(ts.server.sessions().len().await, 1);

    client.close().await;

    tokio::time::timeout(WAIT, async {
        while !ts.server.sessions().is_empty().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn client_pings_keep_a_short_lived_session_alive() -> TestResult {
    // Aggressive keep-alive so liveness is exercised quickly.
    let options = Options::default()
        .with_ping_interval(Duration::from_millis(100))
        .with_ping_timeout(Duration::from_millis(200));
    let ts = TestServer::start(options).await;

    let client = strata_engine::Client::dial(&ts.http_url("")).await?;
    let socket = tokio::time::timeout(WAIT, ts.server.accept()).await??;
    let events = socket.events();

    // Survive several read-timeout windows thanks to the ping loop.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(900);
    let mut pings = 0;
    while tokio::time::Instant::now() < deadline {
        tokio::select! {
            event = events.recv() => {
                match event? {
                    Event::Ping(_) => pings += 1,
                    Event::Close => panic!("session died while client was pinging"),
                    _ => {}
                }
            }
            () = tokio::time::sleep_until(deadline) => break,
        }
    }
    assert!(pings >= 2, "expected several pings, saw {pings}");
    assert!(!socket.is_closed());

    client.close().await;
    Ok(())
}

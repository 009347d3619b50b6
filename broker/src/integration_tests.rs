//! End-to-end tests driving the broker over real loopback `TcpStream`s:
//! a fake agent plays the session side of the wire protocol, a raw HTTP/1.1
//! client plays the external-caller side, and the broker itself runs
//! unmodified inside the test process. No external process is spawned.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use tunnel_wire::{compute_accept_key, read_request_head, write_response_head};

use crate::context::AppState;

/// Starts the broker's router on an ephemeral loopback port and returns
/// its address. The serve task is detached; it outlives each test, which
/// is fine since every test binds its own port.
async fn spawn_broker() -> (std::net::SocketAddr, AppState) {
    let state = AppState::new(Duration::from_secs(30));
    let app = crate::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener has a local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server error");
    });
    (addr, state)
}

/// Sends a raw HTTP/1.1 request and returns `(status, headers_raw, body)`.
async fn send_request(addr: std::net::SocketAddr, request: &str) -> (u16, String, String) {
    let mut stream = TcpStream::connect(addr).await.expect("connect to broker");
    stream.write_all(request.as_bytes()).await.expect("write request");
    read_http_response(&mut stream).await
}

async fn read_http_response(stream: &mut TcpStream) -> (u16, String, String) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.expect("read response");
        assert!(n > 0, "connection closed before a full response head arrived");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let status: u16 = head.lines().next().expect("status line").split_whitespace().nth(1).expect("status code").parse().expect("numeric status");

    let content_length: usize = head
        .lines()
        .find_map(|line| line.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.expect("read body");
        assert!(n > 0, "connection closed before the full body arrived");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    (status, head, String::from_utf8_lossy(&body).to_string())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A fake agent: registers under `subdomain` over its own `TcpStream`,
/// then hands back the split session halves for the test to drive
/// forwarded exchanges with directly.
struct FakeAgent {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: BufWriter<tokio::net::tcp::OwnedWriteHalf>,
}

impl FakeAgent {
    async fn register(addr: std::net::SocketAddr, subdomain: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect as agent");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let request = format!("GET /_tunnel?subdomain={subdomain} HTTP/1.1\r\nHost: broker.test\r\n\r\n");
        write_half.write_all(request.as_bytes()).await.expect("send registration");

        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = reader.read(&mut chunk).await.expect("read registration response");
            assert!(n > 0, "broker closed the connection during registration");
            buf.extend_from_slice(&chunk[..n]);
            if find_subslice(&buf, b"\r\n\r\n").is_some() {
                break;
            }
        }
        assert!(buf.starts_with(b"HTTP/1.1 101"), "expected a 101 Switching Protocols response, got {:?}", String::from_utf8_lossy(&buf));

        Self { reader, writer: BufWriter::new(write_half) }
    }

    /// Mirrors an upgrade request the broker forwards (for the WebSocket
    /// bridge) with a genuine `101`, then echoes back one text frame with
    /// `"echo: "` prefixed, using the raw session frame codec directly.
    async fn mirror_upgrade_and_echo_once(&mut self) {
        let head = read_request_head(&mut self.reader).await.expect("read mirrored upgrade request");
        assert_eq!(head.method, http::Method::GET);

        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::UPGRADE, http::HeaderValue::from_static("websocket"));
        headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("Upgrade"));
        write_response_head(&mut self.writer, http::StatusCode::SWITCHING_PROTOCOLS, &headers).await.expect("write mirrored 101");

        let tunnel_wire::Decoded::Message(msg) = tunnel_wire::decode_message(&mut self.reader).await.expect("decode frame from bridge") else {
            panic!("expected a frame, got a soft timeout");
        };
        assert_eq!(msg.opcode, tunnel_wire::Opcode::Text);
        let mut reply = b"echo: ".to_vec();
        reply.extend_from_slice(&msg.payload);
        tunnel_wire::encode_message(&mut self.writer, tunnel_wire::Opcode::Text, &reply).await.expect("encode echo frame");
    }

    /// Reads one forwarded request head and replies with a fixed 200 body.
    async fn reply_with(&mut self, body: &str) {
        let head = read_request_head(&mut self.reader).await.expect("read forwarded request head");
        let framing = tunnel_wire::request_framing(&head.headers).expect("request framing");
        if let tunnel_wire::BodyFraming::ContentLength(len) = framing {
            let mut discard = vec![0u8; len as usize];
            self.reader.read_exact(&mut discard).await.expect("drain forwarded request body");
        }

        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::CONTENT_LENGTH, body.len().into());
        write_response_head(&mut self.writer, http::StatusCode::OK, &headers).await.expect("write response head");
        self.writer.write_all(body.as_bytes()).await.expect("write response body");
        self.writer.flush().await.expect("flush response");
    }
}

/// Polls the registry directly until the subdomain is backed by a live
/// session, tolerating the brief window between the registration
/// response going out over the wire and `Registry::activate` running.
async fn wait_until_registered(state: &AppState, subdomain: &str) {
    for _ in 0..50 {
        if state.registry.lookup(subdomain).is_some() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("subdomain {subdomain:?} never became reachable");
}

#[tokio::test]
async fn register_then_request_round_trips_through_the_agent() {
    let (addr, state) = spawn_broker().await;
    let mut agent = FakeAgent::register(addr, "alice").await;
    wait_until_registered(&state, "alice").await;

    let client_task = tokio::spawn(async move { send_request(addr, "GET /hello HTTP/1.1\r\nHost: alice.tunnel.test\r\nContent-Length: 0\r\n\r\n").await });

    agent.reply_with("hello from agent").await;

    let (status, _, body) = client_task.await.expect("client task");
    assert_eq!(status, 200);
    assert_eq!(body, "hello from agent");
}

#[tokio::test]
async fn unknown_subdomain_returns_not_found() {
    let (addr, _state) = spawn_broker().await;
    let (status, _, body) = send_request(addr, "GET / HTTP/1.1\r\nHost: nobody.tunnel.test\r\nContent-Length: 0\r\n\r\n").await;
    assert_eq!(status, 404);
    assert_eq!(body, "Tunnel not found\n");
}

#[tokio::test]
async fn a_second_concurrent_request_sees_the_tunnel_as_busy() {
    let (addr, state) = spawn_broker().await;
    let mut agent = FakeAgent::register(addr, "busy").await;
    wait_until_registered(&state, "busy").await;

    let first = tokio::spawn(async move { send_request(addr, "GET /first HTTP/1.1\r\nHost: busy.tunnel.test\r\nContent-Length: 0\r\n\r\n").await });

    // Give the first request time to claim the session before the second
    // one is sent; the agent hasn't read it yet, so the claim is still held.
    sleep(Duration::from_millis(50)).await;

    let (second_status, _, second_body) = send_request(addr, "GET /second HTTP/1.1\r\nHost: busy.tunnel.test\r\nContent-Length: 0\r\n\r\n").await;
    assert_eq!(second_status, 503);
    assert_eq!(second_body, "No available tunnels\n");

    agent.reply_with("ok").await;
    let (first_status, _, first_body) = first.await.expect("first request task");
    assert_eq!(first_status, 200);
    assert_eq!(first_body, "ok");
}

#[tokio::test]
async fn a_disappearing_agent_fails_the_request_and_frees_the_subdomain() {
    let (addr, state) = spawn_broker().await;
    let agent = FakeAgent::register(addr, "ghost").await;
    wait_until_registered(&state, "ghost").await;

    // Drop the agent's connection without ever answering a request.
    drop(agent);

    let (status, _, _) = send_request(addr, "GET / HTTP/1.1\r\nHost: ghost.tunnel.test\r\nContent-Length: 0\r\n\r\n").await;
    assert_eq!(status, 500);

    // The failed exchange unbinds the subdomain; a follow-up request
    // should see it as gone rather than retrying the dead session.
    let (status, _, _) = send_request(addr, "GET / HTTP/1.1\r\nHost: ghost.tunnel.test\r\nContent-Length: 0\r\n\r\n").await;
    assert_eq!(status, 404);
}

/// A masked single-frame text payload, as a genuine RFC 6455 client must
/// send (server-bound frames are always masked).
fn masked_text_frame(payload: &[u8]) -> Vec<u8> {
    let mask = [0x12, 0x34, 0x56, 0x78];
    let mut masked = payload.to_vec();
    for (i, byte) in masked.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    let mut frame = vec![0x80 | 0x1, 0x80 | (payload.len() as u8)];
    assert!(payload.len() < 126, "test helper only handles short payloads");
    frame.extend_from_slice(&mask);
    frame.extend_from_slice(&masked);
    frame
}

/// Parses one unmasked single-frame text message, as the broker always
/// sends toward the external client.
async fn read_unmasked_text_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.expect("read frame header");
    assert_eq!(header[0], 0x80 | 0x1, "expected a final text frame");
    assert_eq!(header[1] & 0x80, 0, "server-to-client frames must not be masked");
    let len = (header[1] & 0x7F) as usize;
    assert!(len < 126, "test helper only handles short payloads");
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.expect("read frame payload");
    payload
}

#[tokio::test]
async fn websocket_traffic_is_bridged_and_echoed_through_the_agent() {
    let (addr, state) = spawn_broker().await;
    let mut agent = FakeAgent::register(addr, "echo").await;
    wait_until_registered(&state, "echo").await;

    let mut client = TcpStream::connect(addr).await.expect("connect as external client");
    let key = "dGhlIHNhbXBsZSBub25jZQ==";
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: echo.tunnel.test\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.expect("send upgrade request");

    let (status, head, _) = read_http_response(&mut client).await;
    assert_eq!(status, 101);
    let expected_accept = compute_accept_key(key);
    assert!(head.to_ascii_lowercase().contains(&format!("sec-websocket-accept: {}", expected_accept.to_ascii_lowercase())));

    let agent_task = tokio::spawn(async move {
        agent.mirror_upgrade_and_echo_once().await;
        agent
    });

    client.write_all(&masked_text_frame(b"hi")).await.expect("send client frame");
    let echoed = read_unmasked_text_frame(&mut client).await;
    assert_eq!(echoed, b"echo: hi");

    agent_task.await.expect("agent task");
}

#![deny(rust_2018_idioms)]

//! Wire-level tests: a real server on an ephemeral port, raw bytes on a
//! socket, exact assertions on what comes back.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use gantry::app::{Receiver, Scope, Sender};
use gantry::{Config, Message, ReceiveEvent, SendEvent, Server, SseEvent};

const WAIT: Duration = Duration::from_secs(5);

async fn test_app(scope: Scope, mut receive: Receiver, send: Sender) -> gantry::Result<()> {
    match scope {
        Scope::Http(ref http) => {
            let path = http.request.path.clone();
            let mut body = Vec::new();
            let mut events = 0usize;
            loop {
                match receive.recv().await? {
                    ReceiveEvent::HttpRequest { body: chunk, more } => {
                        events += 1;
                        body.extend_from_slice(&chunk);
                        if !more {
                            break;
                        }
                    }
                    _ => return Ok(()),
                }
            }
            match path.as_str() {
                "/" => {
                    send.send(SendEvent::response_start(
                        200,
                        vec![(
                            http::header::CONTENT_TYPE,
                            http::HeaderValue::from_static("text/plain"),
                        )],
                    ))
                    .await?;
                    send.send(SendEvent::response_body("Hello", false)).await?;
                }
                "/echo" => {
                    send.send(SendEvent::response_start(
                        200,
                        vec![(
                            http::header::HeaderName::from_static("x-body-events"),
                            http::HeaderValue::from_str(&events.to_string()).unwrap(),
                        )],
                    ))
                    .await?;
                    send.send(SendEvent::response_body(Bytes::from(body), false))
                        .await?;
                }
                "/chunked" => {
                    send.send(SendEvent::response_start(200, vec![])).await?;
                    send.send(SendEvent::response_body("Wiki", true)).await?;
                    send.send(SendEvent::response_body("pedia", true)).await?;
                    send.send(SendEvent::response_body("", false)).await?;
                }
                _ => {
                    send.send(SendEvent::response_start(404, vec![])).await?;
                    send.send(SendEvent::response_body("Not Found", false))
                        .await?;
                }
            }
        }
        Scope::Sse(_) => {
            match receive.recv().await? {
                ReceiveEvent::SseRequest => {}
                _ => return Ok(()),
            }
            send.send(SendEvent::SseStart {
                status: http::StatusCode::OK,
                headers: vec![],
            })
            .await?;
            send.send(SendEvent::SseSend(
                SseEvent::new().event("u").data("p1").id("1"),
            ))
            .await?;
            send.send(SendEvent::SseKeepalive {
                interval: Duration::from_millis(100),
                comment: "ping".to_owned(),
            })
            .await?;
            // hold the stream open until the client goes away
            let _ = receive.recv().await;
        }
        Scope::WebSocket(_) => {
            match receive.recv().await? {
                ReceiveEvent::WebSocketConnect => {}
                _ => return Ok(()),
            }
            send.send(SendEvent::WebSocketAccept {
                subprotocol: None,
                headers: vec![],
            })
            .await?;
            loop {
                match receive.recv().await? {
                    ReceiveEvent::WebSocketReceive(Message::Text(text)) => {
                        send.send(SendEvent::WebSocketSend(Message::Text(text)))
                            .await?;
                    }
                    ReceiveEvent::WebSocketReceive(Message::Binary(data)) => {
                        send.send(SendEvent::WebSocketSend(Message::Binary(data)))
                            .await?;
                    }
                    ReceiveEvent::WebSocketDisconnect { .. } => return Ok(()),
                    _ => {}
                }
            }
        }
        Scope::Lifespan(_) => loop {
            match receive.recv().await? {
                ReceiveEvent::LifespanStartup => {
                    send.send(SendEvent::StartupComplete).await?;
                }
                ReceiveEvent::LifespanShutdown => {
                    send.send(SendEvent::ShutdownComplete).await?;
                    return Ok(());
                }
                _ => return Ok(()),
            }
        },
    }
    Ok(())
}

fn base_config() -> Config {
    Config::new()
        .host("127.0.0.1")
        .port(0)
        .http2(true)
        .lifespan(false)
        .request_timeout(Some(Duration::from_secs(2)))
}

async fn serve(config: Config) -> SocketAddr {
    let _ = pretty_env_logger::try_init();
    let server = Server::bind(config).expect("bind");
    let addr = server.local_addr().expect("addr");
    tokio::spawn(server.serve(test_app));
    addr
}

async fn roundtrip(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(request).await.expect("write");
    let mut response = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut response))
        .await
        .expect("response timed out")
        .expect("read");
    response
}

fn lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .split("\r\n")
        .map(str::to_owned)
        .collect()
}

#[tokio::test]
async fn get_returns_exact_content_length_response() {
    let addr = serve(base_config()).await;
    let raw = roundtrip(
        addr,
        b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;

    let lines = lines(&raw);
    assert_eq!(lines[0], "HTTP/1.1 200 OK");
    assert!(lines.contains(&"content-type: text/plain".to_owned()));
    assert!(lines.contains(&"content-length: 5".to_owned()));
    assert!(raw.ends_with(b"\r\n\r\nHello"));
}

#[tokio::test]
async fn sized_post_is_one_body_event() {
    let addr = serve(base_config()).await;
    let raw = roundtrip(
        addr,
        b"POST /echo HTTP/1.1\r\nHost: x\r\ncontent-length: 11\r\nConnection: close\r\n\r\nhello=world",
    )
    .await;

    let lines = lines(&raw);
    assert_eq!(lines[0], "HTTP/1.1 200 OK");
    // exactly one http.request event carried the whole body
    assert!(lines.contains(&"x-body-events: 1".to_owned()));
    assert!(raw.ends_with(b"hello=world"));
}

#[tokio::test]
async fn chunked_request_body_is_reassembled() {
    let addr = serve(base_config()).await;
    let raw = roundtrip(
        addr,
        b"POST /echo HTTP/1.1\r\nHost: x\r\ntransfer-encoding: chunked\r\nConnection: close\r\n\r\n\
          6\r\nhello=\r\n5\r\nworld\r\n0\r\n\r\n",
    )
    .await;

    assert_eq!(lines(&raw)[0], "HTTP/1.1 200 OK");
    assert!(raw.ends_with(b"hello=world"));
}

#[tokio::test]
async fn streaming_response_is_chunked() {
    let addr = serve(base_config()).await;
    let raw = roundtrip(
        addr,
        b"GET /chunked HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;

    let lines = lines(&raw);
    assert_eq!(lines[0], "HTTP/1.1 200 OK");
    assert!(lines.contains(&"transfer-encoding: chunked".to_owned()));
    let text = String::from_utf8_lossy(&raw);
    assert!(text.ends_with("4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n"));
}

#[tokio::test]
async fn keep_alive_serves_two_requests() {
    let addr = serve(base_config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    for _ in 0..2 {
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut seen = Vec::new();
        // read until the fixed-length body arrives
        while !seen.ends_with(b"Hello") {
            let mut buf = [0u8; 1024];
            let n = timeout(WAIT, stream.read(&mut buf))
                .await
                .expect("timed out")
                .expect("read");
            assert_ne!(n, 0, "connection closed early");
            seen.extend_from_slice(&buf[..n]);
        }
        assert!(seen.starts_with(b"HTTP/1.1 200 OK\r\n"));
    }
}

#[tokio::test]
async fn expect_continue_fires_after_app_receives() {
    let addr = serve(base_config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"POST /echo HTTP/1.1\r\n\
              Host: x\r\n\
              content-length: 5\r\n\
              Expect: 100-continue\r\n\
              Connection: close\r\n\r\n",
        )
        .await
        .unwrap();

    // The interim response arrives once the app asks for the body; the
    // final response cannot come earlier because the body is still unsent.
    let mut interim = Vec::new();
    while !interim.ends_with(b"\r\n\r\n") {
        let mut buf = [0u8; 256];
        let n = timeout(WAIT, stream.read(&mut buf))
            .await
            .expect("no interim response")
            .expect("read");
        assert_ne!(n, 0, "closed before 100 Continue");
        interim.extend_from_slice(&buf[..n]);
    }
    assert!(interim.starts_with(b"HTTP/1.1 100 Continue\r\n"));

    stream.write_all(b"hello").await.unwrap();
    let mut rest = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut rest))
        .await
        .expect("response timed out")
        .expect("read");
    assert!(rest.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(rest.ends_with(b"hello"));
}

#[tokio::test]
async fn smuggling_ambiguity_is_rejected() {
    let addr = serve(base_config()).await;
    let raw = roundtrip(
        addr,
        b"POST /echo HTTP/1.1\r\nHost: x\r\ncontent-length: 5\r\ntransfer-encoding: chunked\r\n\r\n",
    )
    .await;
    assert!(lines(&raw)[0].starts_with("HTTP/1.1 400"));
}

#[tokio::test]
async fn invalid_chunk_size_is_rejected_not_zero() {
    let addr = serve(base_config()).await;
    let raw = roundtrip(
        addr,
        b"POST /echo HTTP/1.1\r\nHost: x\r\ntransfer-encoding: chunked\r\n\r\nxyz\r\n",
    )
    .await;
    assert!(lines(&raw)[0].starts_with("HTTP/1.1 400"));
}

#[tokio::test]
async fn oversize_declared_body_gets_413_immediately() {
    let addr = serve(base_config().max_body_size(16)).await;
    // body bytes intentionally not sent: rejection must come from the
    // declaration alone
    let raw = roundtrip(
        addr,
        b"POST /echo HTTP/1.1\r\nHost: x\r\ncontent-length: 17\r\n\r\n",
    )
    .await;
    assert!(lines(&raw)[0].starts_with("HTTP/1.1 413"));
}

#[tokio::test]
async fn error_responses_are_plain_text() {
    let addr = serve(base_config()).await;
    let raw = roundtrip(addr, b"BAD\r\n\r\n").await;
    let lines = lines(&raw);
    assert!(lines[0].starts_with("HTTP/1.1 400"));
    assert!(lines.contains(&"content-type: text/plain".to_owned()));
}

#[tokio::test]
async fn accept_event_stream_becomes_sse() {
    let addr = serve(base_config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /events HTTP/1.1\r\nHost: x\r\nAccept: text/event-stream\r\n\r\n")
        .await
        .unwrap();

    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let text = String::from_utf8_lossy(&seen).into_owned();
        if text.matches(":ping\n\n").count() >= 2 {
            assert!(text.contains("content-type: text/event-stream"));
            assert!(text.contains("cache-control: no-cache"));
            // the whole event block sits inside one chunk, so it is
            // contiguous on the wire
            assert!(text.contains("event: u\ndata: p1\nid: 1\n\n"));
            break;
        }
        let mut buf = [0u8; 1024];
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let n = timeout(remaining, stream.read(&mut buf))
            .await
            .expect("sse stream stalled")
            .expect("read");
        assert_ne!(n, 0, "server closed the event stream");
        seen.extend_from_slice(&buf[..n]);
    }
}

// ===== WebSocket =====

fn masked_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(payload.len() + 8);
    raw.push(0x80 | opcode);
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    assert!(payload.len() < 126, "test helper handles short frames only");
    raw.push(0x80 | payload.len() as u8);
    raw.extend_from_slice(&mask);
    for (i, b) in payload.iter().enumerate() {
        raw.push(*b ^ mask[i & 3]);
    }
    raw
}

async fn ws_handshake(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\n\
              Host: x\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut buf = [0u8; 512];
        let n = timeout(WAIT, stream.read(&mut buf))
            .await
            .expect("handshake timed out")
            .expect("read");
        assert_ne!(n, 0, "closed during handshake");
        head.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&head);
    assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    // RFC 6455 §1.3 sample value for the key above
    assert!(text.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    stream
}

async fn read_exact_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    timeout(WAIT, stream.read_exact(&mut header))
        .await
        .expect("frame timed out")
        .expect("frame header");
    assert_eq!(header[1] & 0x80, 0, "server frames must not be masked");
    let len = (header[1] & 0x7F) as usize;
    assert!(len < 126, "test helper handles short frames only");
    let mut payload = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut payload))
        .await
        .expect("payload timed out")
        .expect("payload");
    (header[0], payload)
}

#[tokio::test]
async fn websocket_echo_roundtrip() {
    let addr = serve(base_config()).await;
    let mut stream = ws_handshake(addr).await;

    stream
        .write_all(&masked_frame(0x1, b"hello"))
        .await
        .unwrap();
    let (first, payload) = read_exact_frame(&mut stream).await;
    assert_eq!(first, 0x81, "fin + text opcode");
    assert_eq!(payload, b"hello");

    // normal close handshake
    let mut close_payload = BytesMut::new();
    close_payload.put_u16(1000);
    stream
        .write_all(&masked_frame(0x8, &close_payload))
        .await
        .unwrap();
    let (first, payload) = read_exact_frame(&mut stream).await;
    assert_eq!(first, 0x88, "close frame");
    assert_eq!(&payload[..2], &1000u16.to_be_bytes());
}

#[tokio::test]
async fn websocket_invalid_utf8_text_closes_1007() {
    let addr = serve(base_config()).await;
    let mut stream = ws_handshake(addr).await;

    stream
        .write_all(&masked_frame(0x1, &[0xFF, 0xFE]))
        .await
        .unwrap();
    let (first, payload) = read_exact_frame(&mut stream).await;
    assert_eq!(first, 0x88);
    assert_eq!(&payload[..2], &1007u16.to_be_bytes());
}

#[tokio::test]
async fn websocket_one_byte_close_payload_closes_1002() {
    let addr = serve(base_config()).await;
    let mut stream = ws_handshake(addr).await;

    stream.write_all(&masked_frame(0x8, &[0x03])).await.unwrap();
    let (first, payload) = read_exact_frame(&mut stream).await;
    assert_eq!(first, 0x88);
    assert_eq!(&payload[..2], &1002u16.to_be_bytes());
}

#[tokio::test]
async fn websocket_ping_gets_pong() {
    let addr = serve(base_config()).await;
    let mut stream = ws_handshake(addr).await;

    stream
        .write_all(&masked_frame(0x9, b"marco"))
        .await
        .unwrap();
    let (first, payload) = read_exact_frame(&mut stream).await;
    assert_eq!(first, 0x8A, "pong");
    assert_eq!(payload, b"marco");
}

// ===== HTTP/2 (h2c) =====

#[tokio::test]
async fn h2c_preface_negotiates_http2() {
    let addr = serve(base_config()).await;
    let tcp = TcpStream::connect(addr).await.unwrap();
    let (client, conn) = timeout(WAIT, h2::client::handshake(tcp))
        .await
        .expect("handshake timed out")
        .expect("h2 handshake");
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = http::Request::builder()
        .method("GET")
        .uri(format!("http://{}/", addr))
        .body(())
        .unwrap();
    let mut client = timeout(WAIT, client.ready()).await.unwrap().unwrap();
    let (response, _) = client.send_request(request, true).unwrap();
    let response = timeout(WAIT, response).await.unwrap().unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);

    let mut body = response.into_body();
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.unwrap();
        let _ = body.flow_control().release_capacity(chunk.len());
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, b"Hello");
}

#[tokio::test]
async fn h2_data_roundtrip_with_flow_control() {
    let addr = serve(base_config()).await;
    let tcp = TcpStream::connect(addr).await.unwrap();
    let (client, conn) = h2::client::handshake(tcp).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = http::Request::builder()
        .method("POST")
        .uri(format!("http://{}/echo", addr))
        .body(())
        .unwrap();
    let mut client = client.ready().await.unwrap();
    let (response, mut send_body) = client.send_request(request, false).unwrap();
    send_body
        .send_data(Bytes::from_static(b"hello=world"), true)
        .unwrap();

    let response = timeout(WAIT, response).await.unwrap().unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
    let mut body = response.into_body();
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.unwrap();
        let _ = body.flow_control().release_capacity(chunk.len());
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, b"hello=world");
}

#[tokio::test]
async fn h2_plain_connect_is_refused_501() {
    let addr = serve(base_config()).await;
    let tcp = TcpStream::connect(addr).await.unwrap();
    let (client, conn) = h2::client::handshake(tcp).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = http::Request::builder()
        .method("CONNECT")
        .uri(addr.to_string())
        .body(())
        .unwrap();
    let mut client = client.ready().await.unwrap();
    let (response, _) = client.send_request(request, true).unwrap();
    let response = timeout(WAIT, response).await.unwrap().unwrap();
    assert_eq!(response.status(), http::StatusCode::NOT_IMPLEMENTED);
}

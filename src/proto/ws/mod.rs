//! WebSocket termination: handshake, framing, and the per-stream state
//! machine.
//!
//! The same session loop runs over an upgraded HTTP/1.1 socket and over an
//! HTTP/2 Extended CONNECT stream; only the accept/reject response shape
//! differs, and the callers own that part.

pub(crate) mod frame;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, error, trace, warn};

use crate::app::{
    Application, Extensions, Headers, HttpVersion, Message, ReceiveEvent, RequestParts,
    Scheme, Scope, ScopeKind, SendEvent, WebSocketScope,
};
use crate::dispatch;
use crate::error::Error;
use crate::proto::h1::encode;
use crate::proto::h1::parse::RequestHead;
use crate::server::shared::{ConnInfo, Shared};
use crate::server::shutdown::Watch;

use self::frame::OpCode;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// How long to wait for the peer's close frame after we sent ours.
const CLOSE_WAIT: Duration = Duration::from_secs(10);

/// Compute the `Sec-WebSocket-Accept` value for a handshake key.
pub(crate) fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::default();
    sha1.update(key.as_bytes());
    sha1.update(GUID);
    base64::engine::general_purpose::STANDARD.encode(sha1.finalize())
}

/// Knobs the session loop needs from the worker config.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionConfig {
    pub(crate) ping_interval: Option<Duration>,
    pub(crate) pong_timeout: Duration,
    pub(crate) max_message_size: u64,
}

impl SessionConfig {
    pub(crate) fn from_shared<A>(shared: &Shared<A>) -> SessionConfig {
        SessionConfig {
            ping_interval: shared.ws_ping_interval,
            pong_timeout: shared.ws_ping_timeout,
            max_message_size: shared.max_body_size,
        }
    }
}

/// Terminate a WebSocket session on an upgraded HTTP/1.1 connection.
///
/// The app sees `websocket.connect` and must answer with accept (101 goes
/// out) or close (403 goes out). The connection is consumed either way.
pub(crate) async fn serve_h1<R, W, A>(
    rd: R,
    mut wr: W,
    read_buf: BytesMut,
    head: RequestHead,
    shared: Arc<Shared<A>>,
    info: ConnInfo,
    watch: Watch,
) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    A: Application,
{
    let handshake = match head.websocket {
        Some(ref hs) => hs.clone(),
        None => return Ok(()),
    };

    let parts = RequestParts {
        http_version: HttpVersion::H11,
        method: head.method,
        scheme: if info.is_secure() {
            Scheme::Wss
        } else {
            Scheme::Ws
        },
        path: head.path,
        raw_path: head.target,
        query_string: head.query,
        root_path: shared.root_path.clone(),
        headers: head.headers,
        client: info.client,
        server: info.server,
        extensions: Extensions {
            tls: info.tls.clone(),
            http2: None,
        },
        state: shared.state.clone(),
    };
    let scope = Scope::WebSocket(WebSocketScope {
        request: parts,
        subprotocols: handshake.subprotocols.clone(),
    });

    let (receiver, sender, ev_tx, mut send_rx) = crate::app::channel(ScopeKind::WebSocket);
    let app_task = dispatch::spawn(&shared.app, scope, receiver, sender);
    let _ = ev_tx.send(ReceiveEvent::WebSocketConnect).await;

    match connect_reply(&mut send_rx, shared.request_timeout).await {
        ConnectReply::Accept {
            subprotocol,
            headers,
        } => {
            let mut out = BytesMut::with_capacity(256);
            out.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
            out.extend_from_slice(b"upgrade: websocket\r\n");
            out.extend_from_slice(b"connection: Upgrade\r\n");
            out.extend_from_slice(b"sec-websocket-accept: ");
            out.extend_from_slice(accept_key(&handshake.key).as_bytes());
            out.extend_from_slice(b"\r\n");
            if let Some(proto) = subprotocol {
                out.extend_from_slice(b"sec-websocket-protocol: ");
                out.extend_from_slice(proto.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            for (name, value) in &headers {
                out.extend_from_slice(name.as_str().as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\r\n");
            wr.write_all(&out).await.map_err(Error::new_io)?;
            wr.flush().await.map_err(Error::new_io)?;

            let config = SessionConfig::from_shared(&shared);
            session(rd, wr, read_buf, ev_tx, send_rx, app_task, config, watch).await
        }
        ConnectReply::Reject => {
            let raw = encode::error_response(http::StatusCode::FORBIDDEN);
            let _ = wr.write_all(&raw).await;
            let _ = wr.flush().await;
            Ok(())
        }
    }
}

pub(crate) enum ConnectReply {
    Accept {
        subprotocol: Option<String>,
        headers: Headers,
    },
    Reject,
}

/// Wait for the app's answer to `websocket.connect`.
pub(crate) async fn connect_reply(
    send_rx: &mut mpsc::Receiver<SendEvent>,
    deadline: Option<Duration>,
) -> ConnectReply {
    let next = async {
        loop {
            match send_rx.recv().await {
                Some(SendEvent::WebSocketAccept {
                    subprotocol,
                    headers,
                }) => {
                    return ConnectReply::Accept {
                        subprotocol,
                        headers,
                    };
                }
                Some(SendEvent::WebSocketClose { .. }) | None => return ConnectReply::Reject,
                Some(other) => {
                    warn!("event {:?} before websocket.accept; rejecting", other);
                    return ConnectReply::Reject;
                }
            }
        }
    };
    match deadline {
        Some(d) => tokio::time::timeout(d, next)
            .await
            .unwrap_or(ConnectReply::Reject),
        None => next.await,
    }
}

/// Why the session reached its terminal state.
enum Terminal {
    /// Close handshake completed or was initiated locally.
    Closed,
    /// Transport died without a close frame.
    Abnormal,
}

/// The OPEN-state loop: frames in both directions until close.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn session<R, W>(
    mut rd: R,
    mut wr: W,
    mut read_buf: BytesMut,
    ev_tx: mpsc::Sender<ReceiveEvent>,
    mut send_rx: mpsc::Receiver<SendEvent>,
    mut app_task: JoinHandle<crate::Result<()>>,
    config: SessionConfig,
    mut watch: Watch,
) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut inbox: VecDeque<ReceiveEvent> = VecDeque::new();
    let mut frag: Option<(OpCode, BytesMut)> = None;
    let mut out = BytesMut::with_capacity(1024);

    let mut close_sent = false;
    let mut peer_done = false;
    let mut terminal: Option<Terminal> = None;
    let mut app_settled = false;
    let mut sender_closed = false;
    let mut drain_seen = false;

    let mut ping_timer = config.ping_interval.map(|d| {
        let mut t = tokio::time::interval_at(tokio::time::Instant::now() + d, d);
        t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        t
    });
    let mut pong_deadline: Option<Pin<Box<Sleep>>> = None;
    let mut close_deadline: Option<Pin<Box<Sleep>>> = None;

    loop {
        // Frames may already be buffered (e.g. sent together with the
        // handshake); drain them before waiting on the socket.
        while terminal.is_none() && !peer_done && inbox.len() < 8 {
            match frame::parse_frame(&mut read_buf, config.max_message_size) {
                Ok(Some(frame)) => {
                    handle_frame(
                        frame,
                        &mut frag,
                        &mut inbox,
                        &mut out,
                        &mut close_sent,
                        &mut peer_done,
                        &mut terminal,
                        &mut pong_deadline,
                        config.max_message_size,
                    )?;
                }
                Ok(None) => break,
                Err(err) => {
                    protocol_error(&err, &mut inbox, &mut out, &mut close_sent);
                    terminal = Some(Terminal::Closed);
                    peer_done = true;
                    break;
                }
            }
        }
        if !out.is_empty() {
            if wr.write_all(&out).await.is_err() {
                terminal = Some(Terminal::Abnormal);
                peer_done = true;
            }
            let _ = wr.flush().await;
            out.clear();
        }
        if close_sent && terminal.is_some() && close_deadline.is_none() && !peer_done {
            close_deadline = Some(Box::pin(sleep(CLOSE_WAIT)));
        }

        // Done once the wire reached a terminal state and the app future
        // has settled; undelivered events are moot at that point.
        if terminal.is_some() && app_settled {
            return Ok(());
        }

        tokio::select! {
            permit = ev_tx.reserve(), if !inbox.is_empty() => {
                match permit {
                    Ok(permit) => {
                        if let Some(event) = inbox.pop_front() {
                            permit.send(event);
                        }
                    }
                    Err(_) => inbox.clear(),
                }
            }
            read = rd.read_buf(&mut read_buf), if terminal.is_none() && !peer_done && inbox.len() < 8 => {
                match read {
                    Ok(0) => {
                        peer_done = true;
                        if terminal.is_none() {
                            trace!("websocket peer hung up without close");
                            inbox.push_back(ReceiveEvent::WebSocketDisconnect {
                                code: 1006,
                                reason: String::new(),
                            });
                            terminal = Some(Terminal::Abnormal);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!("websocket read error: {}", err);
                        peer_done = true;
                        if terminal.is_none() {
                            inbox.push_back(ReceiveEvent::WebSocketDisconnect {
                                code: 1006,
                                reason: String::new(),
                            });
                            terminal = Some(Terminal::Abnormal);
                        }
                    }
                }
            }
            maybe_ev = send_rx.recv(), if !sender_closed => {
                match maybe_ev {
                    Some(event) => handle_app_event(
                        event,
                        &mut inbox,
                        &mut out,
                        &mut close_sent,
                        &mut terminal,
                    ),
                    None => sender_closed = true,
                }
            }
            joined = &mut app_task, if !app_settled => {
                app_settled = true;
                let close_code = match joined {
                    Ok(Ok(())) => 1000,
                    Ok(Err(ref err)) if err.is_closed() => 1000,
                    Ok(Err(err)) => {
                        error!("websocket application error: {}", err);
                        1011
                    }
                    Err(join_err) => {
                        error!(
                            "websocket application {}",
                            if join_err.is_panic() { "panicked" } else { "canceled" }
                        );
                        1011
                    }
                };
                if terminal.is_none() && !close_sent {
                    frame::write_close(close_code, "", &mut out);
                    close_sent = true;
                    terminal = Some(Terminal::Closed);
                }
            }
            _ = tick(&mut ping_timer), if terminal.is_none() => {
                frame::write_frame(OpCode::Ping, b"", &mut out);
                if pong_deadline.is_none() {
                    pong_deadline = Some(Box::pin(sleep(config.pong_timeout)));
                }
            }
            _ = wait_deadline(&mut pong_deadline) => {
                // peer stopped answering pings
                warn!("websocket keepalive timed out; closing 1011");
                frame::write_close(1011, "keepalive timeout", &mut out);
                close_sent = true;
                inbox.push_back(ReceiveEvent::WebSocketDisconnect {
                    code: 1011,
                    reason: "keepalive timeout".to_owned(),
                });
                terminal = Some(Terminal::Closed);
            }
            _ = wait_deadline(&mut close_deadline) => {
                // peer never confirmed our close; give up
                peer_done = true;
            }
            _ = watch.signaled(), if !drain_seen => {
                drain_seen = true;
                if terminal.is_none() && !close_sent {
                    frame::write_close(1001, "server shutting down", &mut out);
                    close_sent = true;
                    inbox.push_back(ReceiveEvent::WebSocketDisconnect {
                        code: 1001,
                        reason: String::new(),
                    });
                    terminal = Some(Terminal::Closed);
                }
            }
        }
    }
}

/// Apply one inbound frame.
#[allow(clippy::too_many_arguments)]
fn handle_frame(
    frame: frame::Frame,
    frag: &mut Option<(OpCode, BytesMut)>,
    inbox: &mut VecDeque<ReceiveEvent>,
    out: &mut BytesMut,
    close_sent: &mut bool,
    peer_done: &mut bool,
    terminal: &mut Option<Terminal>,
    pong_deadline: &mut Option<Pin<Box<Sleep>>>,
    max_message_size: u64,
) -> crate::Result<()> {
    match frame.opcode {
        OpCode::Ping => {
            frame::write_frame(OpCode::Pong, &frame.payload, out);
        }
        OpCode::Pong => {
            *pong_deadline = None;
        }
        OpCode::Close => {
            *peer_done = true;
            match frame::parse_close(&frame.payload) {
                Ok((code, reason)) => {
                    if !*close_sent {
                        frame::write_close(code, "", out);
                        *close_sent = true;
                    }
                    inbox.push_back(ReceiveEvent::WebSocketDisconnect { code, reason });
                    *terminal = Some(Terminal::Closed);
                }
                Err(err) => {
                    protocol_error(&err, inbox, out, close_sent);
                    *terminal = Some(Terminal::Closed);
                }
            }
        }
        OpCode::Text | OpCode::Binary => {
            if frag.is_some() {
                let err = Error::new_ws(crate::error::Ws::BadFrame);
                protocol_error(&err, inbox, out, close_sent);
                *terminal = Some(Terminal::Closed);
                return Ok(());
            }
            if frame.fin {
                push_message(frame.opcode, frame.payload, inbox, out, close_sent, terminal);
            } else {
                let mut acc = BytesMut::new();
                acc.extend_from_slice(&frame.payload);
                *frag = Some((frame.opcode, acc));
            }
        }
        OpCode::Continuation => {
            let Some((opcode, mut acc)) = frag.take() else {
                let err = Error::new_ws(crate::error::Ws::BadFrame);
                protocol_error(&err, inbox, out, close_sent);
                *terminal = Some(Terminal::Closed);
                return Ok(());
            };
            if acc.len() as u64 + frame.payload.len() as u64 > max_message_size {
                // message too big
                if !*close_sent {
                    frame::write_close(1009, "message too big", out);
                    *close_sent = true;
                }
                inbox.push_back(ReceiveEvent::WebSocketDisconnect {
                    code: 1009,
                    reason: String::new(),
                });
                *terminal = Some(Terminal::Closed);
                return Ok(());
            }
            acc.extend_from_slice(&frame.payload);
            if frame.fin {
                push_message(opcode, acc.freeze(), inbox, out, close_sent, terminal);
            } else {
                *frag = Some((opcode, acc));
            }
        }
    }
    Ok(())
}

/// Queue one complete data message, validating text UTF-8.
fn push_message(
    opcode: OpCode,
    payload: bytes::Bytes,
    inbox: &mut VecDeque<ReceiveEvent>,
    out: &mut BytesMut,
    close_sent: &mut bool,
    terminal: &mut Option<Terminal>,
) {
    let message = match opcode {
        OpCode::Text => match String::from_utf8(payload.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(_) => {
                let err = Error::new_ws(crate::error::Ws::InvalidUtf8);
                protocol_error(&err, inbox, out, close_sent);
                *terminal = Some(Terminal::Closed);
                return;
            }
        },
        _ => Message::Binary(payload),
    };
    inbox.push_back(ReceiveEvent::WebSocketReceive(message));
}

/// Close the session over a protocol violation with the mapped code.
fn protocol_error(
    err: &Error,
    inbox: &mut VecDeque<ReceiveEvent>,
    out: &mut BytesMut,
    close_sent: &mut bool,
) {
    let code = err.ws_close_code();
    debug!("websocket protocol error ({}): {}", code, err);
    if !*close_sent {
        frame::write_close(code, "", out);
        *close_sent = true;
    }
    inbox.push_back(ReceiveEvent::WebSocketDisconnect {
        code,
        reason: String::new(),
    });
}

/// Apply one app event in OPEN/CLOSING state.
fn handle_app_event(
    event: SendEvent,
    inbox: &mut VecDeque<ReceiveEvent>,
    out: &mut BytesMut,
    close_sent: &mut bool,
    terminal: &mut Option<Terminal>,
) {
    if *close_sent {
        // `websocket.close` went out already; late sends vanish quietly.
        trace!("dropping app event after close: {:?}", event);
        return;
    }
    match event {
        SendEvent::WebSocketSend(Message::Text(text)) => {
            frame::write_frame(OpCode::Text, text.as_bytes(), out);
        }
        SendEvent::WebSocketSend(Message::Binary(data)) => {
            frame::write_frame(OpCode::Binary, &data, out);
        }
        SendEvent::WebSocketClose { code, reason } => {
            frame::write_close(code, &reason, out);
            *close_sent = true;
            inbox.push_back(ReceiveEvent::WebSocketDisconnect { code, reason });
            *terminal = Some(Terminal::Closed);
        }
        SendEvent::WebSocketAccept { .. } => {
            debug!("duplicate websocket.accept ignored");
        }
        other => {
            debug!("non-websocket event on websocket scope ignored: {:?}", other);
        }
    }
}

async fn tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => futures_util::future::pending().await,
    }
}

async fn wait_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(timer) => {
            timer.as_mut().await;
            *deadline = None;
        }
        None => futures_util::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        // RFC 6455 §1.3 sample handshake
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }
}

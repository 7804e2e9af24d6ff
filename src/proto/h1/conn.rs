//! The per-connection HTTP/1.1 loop.
//!
//! One task owns the socket. Requests are parsed off the read half; each
//! request becomes one application scope whose send events are framed onto
//! the write half. Keep-alive loops back to head parsing; WebSocket
//! upgrades hand the socket halves to the WebSocket state machine.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant, Sleep};
use tracing::{debug, trace};

use crate::app::{
    Application, DisconnectReason, Extensions, Headers, HttpScope, HttpVersion,
    ReceiveEvent, RequestParts, Scheme, Scope, ScopeKind, SendEvent, SseScope,
};
use crate::dispatch::{self, Disposition};
use crate::error::Error;
use crate::proto::sse;
use crate::proto::ws;
use crate::server::shared::{ConnInfo, Shared};
use crate::server::shutdown::Watch;

use super::decode::{Decoded, Decoder};
use super::encode::{self, Encoder, Mode};
use super::parse::{parse_head, BodyLength, RequestHead};

/// Serve one cleartext-or-TLS-terminated byte stream as HTTP/1.1 until it
/// closes. `initial` holds bytes already consumed from the transport by
/// preface sniffing.
pub(crate) async fn serve<T, A>(
    io: T,
    shared: Arc<Shared<A>>,
    info: ConnInfo,
    mut watch: Watch,
    initial: BytesMut,
) -> crate::Result<()>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
    A: Application,
{
    let (mut rd, mut wr) = tokio::io::split(io);
    let mut read_buf = initial;

    loop {
        let head = match read_head(&mut rd, &mut read_buf, &shared, &mut watch).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(err) if err.is_parse() => {
                let raw = encode::error_response(err.response_status());
                let _ = wr.write_all(&raw).await;
                let _ = wr.flush().await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        trace!("request head: {} {}", head.method, head.path);

        if head.websocket.is_some() {
            // The upgrade consumes the connection either way.
            return ws::serve_h1(rd, wr, read_buf, head, shared, info, watch).await;
        }

        let wants_keep_alive = head.keep_alive && !watch.is_draining();
        match exchange(head, &mut rd, &mut wr, &mut read_buf, &shared, &info, wants_keep_alive)
            .await?
        {
            true => continue,
            false => return Ok(()),
        }
    }
}

/// Read and parse the next request head, honouring the idle timeout and
/// the drain signal (only between requests).
async fn read_head<R, A>(
    rd: &mut R,
    buf: &mut BytesMut,
    shared: &Arc<Shared<A>>,
    watch: &mut Watch,
) -> crate::Result<Option<RequestHead>>
where
    R: AsyncRead + Unpin,
    A: Application,
{
    loop {
        if let Some(head) = parse_head(buf)? {
            return Ok(Some(head));
        }
        let between_requests = buf.is_empty();
        let n = tokio::select! {
            read = read_with_idle(rd, buf, shared.idle_timeout) => read?,
            _ = watch.signaled(), if between_requests => return Ok(None),
        };
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::new_io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid request head",
            )));
        }
    }
}

async fn read_with_idle<R: AsyncRead + Unpin>(
    rd: &mut R,
    buf: &mut BytesMut,
    idle: Option<Duration>,
) -> crate::Result<usize> {
    match idle {
        Some(deadline) => match tokio::time::timeout(deadline, rd.read_buf(buf)).await {
            Ok(read) => read.map_err(Error::new_io),
            Err(_) => Err(Error::new_idle_timeout()),
        },
        None => rd.read_buf(buf).await.map_err(Error::new_io),
    }
}

/// Per-exchange response progress.
struct RespState {
    /// `http.response.start` (or `sse.start`) was received.
    started: bool,
    /// The status line and headers hit the write buffer.
    head_written: bool,
    /// The final body event (and trailers, if declared) was framed.
    ended: bool,
    keep_alive: bool,
    is_head: bool,
    /// Held between `ResponseStart` and the first body event.
    pending: Option<(StatusCode, Headers, bool)>,
    encoder: Option<Encoder>,
}

impl RespState {
    fn new(is_head: bool, keep_alive: bool) -> RespState {
        RespState {
            started: false,
            head_written: false,
            ended: false,
            keep_alive,
            is_head,
            pending: None,
            encoder: None,
        }
    }
}

struct PumpEnd {
    result: crate::Result<()>,
    peer_gone: bool,
}

/// Run one request/response exchange. Returns whether the connection may
/// be reused for another request.
#[allow(clippy::too_many_arguments)]
async fn exchange<R, W, A>(
    head: RequestHead,
    rd: &mut R,
    wr: &mut W,
    read_buf: &mut BytesMut,
    shared: &Arc<Shared<A>>,
    info: &ConnInfo,
    keep_alive: bool,
) -> crate::Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    A: Application,
{
    // Oversize declarations are refused before any body event is built.
    if let BodyLength::Length(n) = head.body {
        if n > shared.max_body_size {
            let raw = encode::error_response(StatusCode::PAYLOAD_TOO_LARGE);
            wr.write_all(&raw).await.map_err(Error::new_io)?;
            wr.flush().await.map_err(Error::new_io)?;
            return Ok(false);
        }
    }

    let is_sse = head.sse;
    let is_head_method = head.method == http::Method::HEAD;
    let kind = if is_sse { ScopeKind::Sse } else { ScopeKind::Http };

    let decoder = match head.body {
        BodyLength::None => Decoder::none(),
        BodyLength::Length(n) => Decoder::length(n),
        BodyLength::Chunked => Decoder::chunked(shared.max_chunk_size),
    };
    let expect_continue = head.expect_continue && !decoder.is_complete();

    let parts = RequestParts {
        http_version: HttpVersion::H11,
        method: head.method,
        scheme: if info.is_secure() {
            Scheme::Https
        } else {
            Scheme::Http
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
    let scope = if is_sse {
        Scope::Sse(SseScope { request: parts })
    } else {
        Scope::Http(HttpScope { request: parts })
    };

    let (mut receiver, sender, ev_tx, mut send_rx) = crate::app::channel(kind);

    // The interim 100 Continue goes out when the app first asks for the
    // body, not as soon as the socket wants bytes.
    let (continue_tx, continue_rx) = oneshot::channel();
    let mut continue_rx = expect_continue.then_some(continue_rx);
    if expect_continue {
        receiver.notify_first_recv(continue_tx);
    }

    let mut app_task = dispatch::spawn(&shared.app, scope, receiver, sender);

    // SSE scopes get a request marker and never see body events; the body
    // (if any) is drained and discarded. HTTP scopes receive the body as
    // http.request events.
    if is_sse {
        let _ = ev_tx.send(ReceiveEvent::SseRequest).await;
    }
    // Held back so `sse.close` can report `server_closed` even though the
    // pump owns the main event sender.
    let ev_hold = is_sse.then(|| ev_tx.clone());

    // keep-alive for SSE never makes sense: the stream is the response.
    let keep_alive = keep_alive && !is_sse;
    let mut resp = RespState::new(is_head_method, keep_alive);
    let mut out = BytesMut::with_capacity(8 * 1024);

    let pump = pump_body(
        rd,
        read_buf,
        decoder,
        ev_tx,
        !is_sse,
        shared.max_body_size,
        is_sse,
    );
    tokio::pin!(pump);

    let mut pump_done = false;
    let mut peer_gone = false;
    let mut sender_gone = false;
    let mut app_settled = false;
    let mut app_joined: Option<Result<crate::Result<()>, tokio::task::JoinError>> = None;
    let mut app_classified = false;
    let mut stall: Option<Pin<Box<Sleep>>> =
        shared.request_timeout.map(|d| Box::pin(sleep(d)));
    let mut keepalive: Option<(tokio::time::Interval, String)> = None;

    loop {
        tokio::select! {
            end = &mut pump, if !pump_done => {
                pump_done = true;
                peer_gone = end.peer_gone;
                if peer_gone {
                    keepalive = None;
                }
                if let Err(err) = end.result {
                    if !resp.head_written {
                        let raw = encode::error_response(err.response_status());
                        let _ = wr.write_all(&raw).await;
                        let _ = wr.flush().await;
                    }
                    debug!("request body error: {}", err);
                    return Ok(false);
                }
            }
            maybe_ev = send_rx.recv(), if !sender_gone => {
                match maybe_ev {
                    Some(event) => {
                        if let Err(err) =
                            handle_event(event, &mut resp, &mut keepalive, &mut out)
                        {
                            return fail_exchange(err, &resp, wr).await;
                        }
                        if resp.started {
                            stall = None;
                        }
                        if !out.is_empty() {
                            wr.write_all(&out).await.map_err(Error::new_io)?;
                            wr.flush().await.map_err(Error::new_io)?;
                            out.clear();
                        }
                        if resp.ended && is_sse {
                            if let Some(tx) = ev_hold.as_ref() {
                                let _ = tx.try_send(ReceiveEvent::SseDisconnect {
                                    reason: DisconnectReason::ServerClosed,
                                });
                            }
                        }
                    }
                    None => sender_gone = true,
                }
            }
            joined = &mut app_task, if !app_settled => {
                app_settled = true;
                app_joined = Some(joined);
            }
            _ = wait_stall(&mut stall) => {
                debug!("request stalled; replying 503");
                let raw = encode::error_response(StatusCode::SERVICE_UNAVAILABLE);
                let _ = wr.write_all(&raw).await;
                let _ = wr.flush().await;
                return Ok(false);
            }
            comment = wait_keepalive(&mut keepalive), if !resp.ended => {
                let mut block = BytesMut::new();
                sse::serialize_comment(&comment, &mut block);
                if let Some(enc) = resp.encoder.as_mut() {
                    enc.encode_body(&block, true, &mut out)?;
                    wr.write_all(&out).await.map_err(Error::new_io)?;
                    wr.flush().await.map_err(Error::new_io)?;
                    out.clear();
                }
            }
            _ = wait_continue(&mut continue_rx) => {
                encode::encode_continue(&mut out);
                wr.write_all(&out).await.map_err(Error::new_io)?;
                wr.flush().await.map_err(Error::new_io)?;
                out.clear();
            }
        }

        if app_settled && sender_gone && !app_classified {
            app_classified = true;
            let joined = app_joined.take().unwrap_or(Ok(Ok(())));
            match dispatch::classify(joined, resp.started, resp.ended) {
                Disposition::Complete => {
                    if !resp.ended {
                        // benign end without a finished response: peer gone
                        return Ok(false);
                    }
                }
                Disposition::ErrorResponse(err) => {
                    return fail_exchange(err, &resp, wr).await;
                }
                Disposition::Abort(err) => {
                    debug!("aborting connection: {}", err);
                    return Ok(false);
                }
            }
        }

        if resp.ended && app_classified {
            if is_sse {
                // An event stream is the whole connection; never reuse it.
                return Ok(false);
            }
            if !pump_done {
                // Drain what's left of the request body so the next
                // request starts on a frame boundary.
                continue;
            }
            if peer_gone {
                return Ok(false);
            }
            return Ok(resp.keep_alive);
        }
    }
}

/// Write the plain-text error response if the wire is still pristine, then
/// close.
async fn fail_exchange<W: AsyncWrite + Unpin>(
    err: Error,
    resp: &RespState,
    wr: &mut W,
) -> crate::Result<bool> {
    debug!("exchange failed: {}", err);
    if !resp.head_written {
        let raw = encode::error_response(err.response_status());
        let _ = wr.write_all(&raw).await;
        let _ = wr.flush().await;
    }
    Ok(false)
}

/// Apply one application event to the response state, framing output into
/// `out`.
fn handle_event(
    event: SendEvent,
    resp: &mut RespState,
    keepalive: &mut Option<(tokio::time::Interval, String)>,
    out: &mut BytesMut,
) -> crate::Result<()> {
    match event {
        SendEvent::ResponseStart {
            status,
            headers,
            trailers,
        } => {
            if resp.started {
                return Err(Error::new_user_unexpected_event("second response.start"));
            }
            resp.started = true;
            resp.pending = Some((status, headers, trailers));
        }
        SendEvent::ResponseBody { body, more } => {
            if resp.ended {
                return Err(Error::new_user_unexpected_event("body after response end"));
            }
            if let Some((status, headers, trailers)) = resp.pending.take() {
                // First body event: framing can now be decided.
                let mode = response_mode(status, &headers, trailers, &body, more)?;
                let mut encoder = Encoder::new(mode, resp.is_head, trailers);
                encoder.encode_head(status, &headers, resp.keep_alive, out);
                resp.head_written = true;
                encoder.encode_body(&body, more, out)?;
                resp.ended = encoder.is_finished();
                resp.encoder = Some(encoder);
            } else {
                let encoder = resp
                    .encoder
                    .as_mut()
                    .ok_or_else(|| Error::new_user_unexpected_event("body before response.start"))?;
                encoder.encode_body(&body, more, out)?;
                resp.ended = encoder.is_finished();
            }
        }
        SendEvent::ResponseTrailers { headers } => {
            let encoder = resp
                .encoder
                .as_mut()
                .ok_or_else(|| Error::new_user_unexpected_event("trailers before body"))?;
            encoder.encode_trailers(&headers, out)?;
            resp.ended = encoder.is_finished();
        }
        SendEvent::SseStart { status, headers } => {
            if resp.started {
                return Err(Error::new_user_unexpected_event("second sse.start"));
            }
            resp.started = true;
            let headers = sse_headers(headers);
            let mut encoder = Encoder::new(Mode::Chunked, resp.is_head, false);
            encoder.encode_head(status, &headers, false, out);
            resp.head_written = true;
            resp.encoder = Some(encoder);
        }
        SendEvent::SseSend(event) => {
            let encoder = sse_encoder(resp)?;
            let mut block = BytesMut::new();
            sse::serialize(&event, &mut block);
            encoder.encode_body(&block, true, out)?;
        }
        SendEvent::SseComment(comment) => {
            let encoder = sse_encoder(resp)?;
            let mut block = BytesMut::new();
            sse::serialize_comment(&comment, &mut block);
            encoder.encode_body(&block, true, out)?;
        }
        SendEvent::SseKeepalive { interval, comment } => {
            sse_encoder(resp)?;
            let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            *keepalive = Some((timer, comment));
        }
        SendEvent::SseClose => {
            let encoder = sse_encoder(resp)?;
            encoder.encode_body(b"", false, out)?;
            resp.ended = encoder.is_finished();
            *keepalive = None;
        }
        SendEvent::WebSocketAccept { .. }
        | SendEvent::WebSocketSend(_)
        | SendEvent::WebSocketClose { .. } => {
            return Err(Error::new_user_unexpected_event(
                "websocket event on an http scope",
            ));
        }
        SendEvent::StartupComplete
        | SendEvent::StartupFailed { .. }
        | SendEvent::ShutdownComplete
        | SendEvent::ShutdownFailed { .. } => {
            return Err(Error::new_user_unexpected_event(
                "lifespan event on a request scope",
            ));
        }
    }
    Ok(())
}

fn sse_encoder(resp: &mut RespState) -> crate::Result<&mut Encoder> {
    if resp.ended {
        return Err(Error::new_user_unexpected_event("sse event after close"));
    }
    resp.encoder
        .as_mut()
        .ok_or_else(|| Error::new_user_unexpected_event("sse event before sse.start"))
}

/// Default SSE headers unless the app overrode them.
fn sse_headers(mut headers: Headers) -> Headers {
    let has_type = headers
        .iter()
        .any(|(n, _)| n == http::header::CONTENT_TYPE);
    let has_cache = headers
        .iter()
        .any(|(n, _)| n == http::header::CACHE_CONTROL);
    if !has_type {
        headers.push((
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/event-stream"),
        ));
    }
    if !has_cache {
        headers.push((
            http::header::CACHE_CONTROL,
            http::HeaderValue::from_static("no-cache"),
        ));
    }
    headers
}

/// Decide response framing from the app's declared headers and the first
/// body event.
fn response_mode(
    status: StatusCode,
    headers: &Headers,
    trailers: bool,
    first_body: &Bytes,
    more: bool,
) -> crate::Result<Mode> {
    if Mode::forbids_body(status) {
        return Ok(Mode::NoBody);
    }
    if trailers {
        // trailers require chunked framing no matter the body size
        return Ok(Mode::Chunked);
    }
    if let Some(value) = headers
        .iter()
        .find(|(n, _)| n == http::header::CONTENT_LENGTH)
        .map(|(_, v)| v)
    {
        let n = value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                Error::new_user_unexpected_event("unparseable content-length from app")
            })?;
        return Ok(Mode::Length(n));
    }
    if !more {
        // Single-shot body: emit an exact content-length.
        return Ok(Mode::Length(first_body.len() as u64));
    }
    Ok(Mode::Chunked)
}

async fn wait_stall(stall: &mut Option<Pin<Box<Sleep>>>) {
    match stall {
        Some(timer) => timer.as_mut().await,
        None => futures_util::future::pending().await,
    }
}

async fn wait_keepalive(keepalive: &mut Option<(tokio::time::Interval, String)>) -> String {
    match keepalive {
        Some((timer, comment)) => {
            timer.tick().await;
            comment.clone()
        }
        None => futures_util::future::pending().await,
    }
}

async fn wait_continue(rx: &mut Option<oneshot::Receiver<()>>) {
    match rx {
        Some(receiver) => {
            let fired = (&mut *receiver).await.is_ok();
            *rx = None;
            if !fired {
                futures_util::future::pending::<()>().await;
            }
        }
        None => futures_util::future::pending().await,
    }
}

/// Feed the request body into the app's receive queue, enforcing the body
/// cap, and (for SSE) keep watching the read half for peer hangup after
/// the request completes.
#[allow(clippy::too_many_arguments)]
async fn pump_body<R: AsyncRead + Unpin>(
    rd: &mut R,
    read_buf: &mut BytesMut,
    mut decoder: Decoder,
    events: mpsc::Sender<ReceiveEvent>,
    mut forward_body: bool,
    max_body_size: u64,
    watch_eof: bool,
) -> PumpEnd {
    let mut pending: Option<Bytes> = None;
    let mut total: u64 = 0;
    // A bodiless request still yields exactly one `more: false` event, so
    // the lookahead starts with an empty final chunk either way.

    loop {
        match decoder.decode(read_buf) {
            Ok(Decoded::Data(data)) => {
                total += data.len() as u64;
                if total > max_body_size {
                    return PumpEnd {
                        result: Err(Error::new_body_too_large()),
                        peer_gone: false,
                    };
                }
                if forward_body {
                    if let Some(prev) = pending.take() {
                        let lost = events
                            .send(ReceiveEvent::HttpRequest {
                                body: prev,
                                more: true,
                            })
                            .await
                            .is_err();
                        if lost {
                            // app is gone; keep draining for reuse
                            forward_body = false;
                        }
                    }
                    if forward_body {
                        pending = Some(data);
                    }
                }
            }
            Ok(Decoded::Complete) => {
                if forward_body {
                    let body = pending.take().unwrap_or_else(Bytes::new);
                    let _ = events
                        .send(ReceiveEvent::HttpRequest { body, more: false })
                        .await;
                    forward_body = false;
                }
                break;
            }
            Ok(Decoded::Incomplete) => {
                match rd.read_buf(read_buf).await {
                    Ok(0) => {
                        if forward_body {
                            let _ = events.send(ReceiveEvent::HttpDisconnect).await;
                        } else if watch_eof {
                            let _ = events
                                .send(ReceiveEvent::SseDisconnect {
                                    reason: DisconnectReason::ClientClosed,
                                })
                                .await;
                        }
                        return PumpEnd {
                            result: Err(Error::new_io(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed mid request body",
                            ))),
                            peer_gone: true,
                        };
                    }
                    Ok(_) => {}
                    Err(err) => {
                        return PumpEnd {
                            result: Err(Error::new_io(err)),
                            peer_gone: true,
                        };
                    }
                }
            }
            Err(parse) => {
                return PumpEnd {
                    result: Err(parse.into()),
                    peer_gone: false,
                };
            }
        }
    }

    if watch_eof {
        // SSE: the request is done; the only interesting read event left
        // is the peer hanging up.
        let mut scratch = [0u8; 512];
        loop {
            match rd.read(&mut scratch).await {
                Ok(0) | Err(_) => {
                    let _ = events
                        .send(ReceiveEvent::SseDisconnect {
                            reason: DisconnectReason::ClientClosed,
                        })
                        .await;
                    return PumpEnd {
                        result: Ok(()),
                        peer_gone: true,
                    };
                }
                Ok(_) => {
                    // bytes after an SSE request are not meaningful; drop
                    continue;
                }
            }
        }
    }

    PumpEnd {
        result: Ok(()),
        peer_gone: false,
    }
}

//! The HTTP/2 session driver.
//!
//! Wraps the `h2` crate: advertises the configured SETTINGS, accepts
//! streams, and runs each as an independent task. Extended CONNECT
//! (RFC 8441) streams become WebSocket scopes whose frames travel as DATA
//! payloads; plain CONNECT is refused outright.

use std::cmp;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures_util::future::poll_fn;
use h2::server::SendResponse;
use h2::{Reason, RecvStream, SendStream};
use http::{Method, Response, StatusCode};
use percent_encoding::percent_decode;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::{sleep, Sleep};
use tracing::{debug, trace, warn};

use crate::app::{
    Application, DisconnectReason, Extensions, Headers, Http2Info, HttpScope,
    HttpVersion, ReceiveEvent, RequestParts, Scheme, Scope, ScopeKind, SendEvent,
    SseScope, WebSocketScope,
};
use crate::dispatch::{self, Disposition};
use crate::error::Error;
use crate::proto::sse;
use crate::proto::ws;
use crate::server::shared::{ConnInfo, Shared};
use crate::server::shutdown::Watch;

/// The 24-byte client connection preface, used for h2c sniffing.
pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Serve one HTTP/2 session (TLS+ALPN or sniffed h2c) until GOAWAY or
/// transport death. Each accepted stream runs as its own task.
pub(crate) async fn serve<T, A>(
    io: T,
    shared: Arc<Shared<A>>,
    info: ConnInfo,
    mut watch: Watch,
) -> crate::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    A: Application,
{
    let mut builder = h2::server::Builder::new();
    builder
        .max_concurrent_streams(shared.h2.max_concurrent_streams)
        .initial_window_size(shared.h2.initial_window_size)
        .max_frame_size(shared.h2.max_frame_size)
        .max_header_list_size(shared.h2.max_header_list_size)
        // RFC 8441: advertise :protocol support for CONNECT streams.
        .enable_connect_protocol();

    let mut conn = builder.handshake(io).await.map_err(Error::new_h2)?;
    trace!("http2 session established");

    let mut draining = false;
    loop {
        tokio::select! {
            accepted = conn.accept() => {
                match accepted {
                    Some(Ok((request, respond))) => {
                        let shared = shared.clone();
                        let info = info.clone();
                        let watch = watch.clone();
                        tokio::spawn(async move {
                            if let Err(err) = stream(request, respond, shared, info, watch).await {
                                debug!("http2 stream ended with error: {}", err);
                            }
                        });
                    }
                    Some(Err(err)) => {
                        // Connection-level protocol error; h2 has already
                        // queued GOAWAY where appropriate.
                        if err.is_go_away() || err.is_io() {
                            return Ok(());
                        }
                        return Err(Error::new_h2(err));
                    }
                    // Peer GOAWAY or clean close; pending writes flushed.
                    None => return Ok(()),
                }
            }
            _ = watch.signaled(), if !draining => {
                draining = true;
                debug!("http2 session draining; sending GOAWAY");
                conn.graceful_shutdown();
            }
        }
    }
}

/// Route one accepted stream.
async fn stream<A>(
    request: http::Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    shared: Arc<Shared<A>>,
    info: ConnInfo,
    watch: Watch,
) -> crate::Result<()>
where
    A: Application,
{
    let (parts, recv_body) = request.into_parts();
    let stream_id = u32::from(recv_body.stream_id());

    if parts.method == Method::CONNECT {
        let is_websocket = parts
            .extensions
            .get::<h2::ext::Protocol>()
            .map(|p| p.as_str().eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        if !is_websocket {
            // Plain CONNECT tunnels are refused, defense in depth.
            return respond_error(&mut respond, StatusCode::NOT_IMPLEMENTED);
        }
        return websocket_stream(parts, recv_body, respond, stream_id, shared, info, watch)
            .await;
    }

    // Oversize declarations are refused before any DATA is accepted.
    if let Some(value) = parts.headers.get(http::header::CONTENT_LENGTH) {
        let declared = value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok());
        match declared {
            Some(n) if n > shared.max_body_size => {
                return respond_error(&mut respond, StatusCode::PAYLOAD_TOO_LARGE);
            }
            Some(_) => {}
            None => return respond_error(&mut respond, StatusCode::BAD_REQUEST),
        }
    }

    http_stream(parts, recv_body, respond, stream_id, shared, info).await
}

/// Build the shared scope fields from stream pseudo-headers.
fn request_parts<A>(
    parts: &http::request::Parts,
    stream_id: u32,
    shared: &Shared<A>,
    info: &ConnInfo,
    scheme: Scheme,
) -> RequestParts {
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| Bytes::copy_from_slice(pq.as_str().as_bytes()))
        .unwrap_or_else(|| Bytes::from_static(b"/"));
    let raw_path = parts.uri.path();
    let decoded: Vec<u8> = percent_decode(raw_path.as_bytes()).collect();
    let path = match String::from_utf8(decoded) {
        Ok(p) => p,
        Err(_) => raw_path.to_owned(),
    };
    let query = parts
        .uri
        .query()
        .map(|q| Bytes::copy_from_slice(q.as_bytes()))
        .unwrap_or_default();

    let mut headers: Headers = Vec::with_capacity(parts.headers.len());
    for (name, value) in parts.headers.iter() {
        headers.push((name.clone(), value.clone()));
    }

    RequestParts {
        http_version: HttpVersion::H2,
        method: parts.method.clone(),
        scheme,
        path,
        raw_path: target,
        query_string: query,
        root_path: shared.root_path.clone(),
        headers,
        client: info.client,
        server: info.server,
        extensions: Extensions {
            tls: info.tls.clone(),
            http2: Some(Http2Info { stream_id }),
        },
        state: shared.state.clone(),
    }
}

fn wants_event_stream(parts: &http::request::Parts) -> bool {
    parts
        .headers
        .get_all(http::header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().starts_with("text/event-stream"))
}

/// Response progress for one HTTP/2 stream.
enum H2Resp {
    Init,
    /// `http.response.start` held until the first body event.
    Started {
        status: StatusCode,
        headers: Headers,
        trailers: bool,
    },
    Streaming {
        tx: SendStream<Bytes>,
        trailers: bool,
        ended: bool,
    },
    Done,
}

impl H2Resp {
    fn started(&self) -> bool {
        !matches!(self, H2Resp::Init)
    }

    fn ended(&self) -> bool {
        matches!(self, H2Resp::Done | H2Resp::Streaming { ended: true, .. })
    }
}

struct PumpEnd {
    result: crate::Result<()>,
    peer_gone: bool,
}

/// Drive one plain HTTP (or SSE) stream.
async fn http_stream<A>(
    parts: http::request::Parts,
    mut recv_body: RecvStream,
    mut respond: SendResponse<Bytes>,
    stream_id: u32,
    shared: Arc<Shared<A>>,
    info: ConnInfo,
) -> crate::Result<()>
where
    A: Application,
{
    let is_sse = wants_event_stream(&parts);
    let kind = if is_sse { ScopeKind::Sse } else { ScopeKind::Http };
    let scheme = if info.is_secure() {
        Scheme::Https
    } else {
        Scheme::Http
    };
    let req = request_parts(&parts, stream_id, &shared, &info, scheme);
    let scope = if is_sse {
        Scope::Sse(SseScope { request: req })
    } else {
        Scope::Http(HttpScope { request: req })
    };

    let (receiver, sender, ev_tx, mut send_rx) = crate::app::channel(kind);
    let mut app_task = dispatch::spawn(&shared.app, scope, receiver, sender);

    if is_sse {
        let _ = ev_tx.send(ReceiveEvent::SseRequest).await;
    }
    // Held back so `sse.close` and mid-stream resets can report the right
    // disconnect; plain HTTP streams must not keep the queue open or the
    // synthesized http.disconnect would never fire.
    let ev_hold = is_sse.then(|| ev_tx.clone());

    let pump = pump_body(
        &mut recv_body,
        ev_tx,
        !is_sse,
        shared.max_body_size,
    );
    tokio::pin!(pump);

    let mut resp = H2Resp::Init;
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
                    debug!("http2 request body error: {}", err);
                    match resp {
                        H2Resp::Init | H2Resp::Started { .. } => {
                            return respond_error(&mut respond, err.response_status());
                        }
                        H2Resp::Streaming { ref mut tx, ended: false, .. } => {
                            tx.send_reset(err.h2_reason());
                            return Ok(());
                        }
                        _ => return Ok(()),
                    }
                }
            }
            maybe_ev = send_rx.recv(), if !sender_gone => {
                match maybe_ev {
                    Some(event) => {
                        let outcome =
                            handle_event(event, &mut resp, &mut respond, &mut keepalive)
                                .await;
                        match outcome {
                            Ok(()) => {
                                if resp.started() {
                                    stall = None;
                                }
                                if resp.ended() {
                                    if let Some(tx) = ev_hold.as_ref() {
                                        let _ = tx.try_send(ReceiveEvent::SseDisconnect {
                                            reason: DisconnectReason::ServerClosed,
                                        });
                                    }
                                }
                            }
                            Err(err) if err.is_closed() => {
                                // peer reset the stream mid-response; http
                                // scopes learn via the body pump's error
                                if let Some(tx) = ev_hold.as_ref() {
                                    let _ = tx.try_send(ReceiveEvent::SseDisconnect {
                                        reason: DisconnectReason::ClientClosed,
                                    });
                                }
                                return Ok(());
                            }
                            Err(err) if err.is_user() => {
                                return fail_stream(err, &mut resp, &mut respond);
                            }
                            Err(err) => {
                                debug!("http2 send error: {}", err);
                                return Ok(());
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
                debug!("http2 request stalled; replying 503");
                return respond_error(&mut respond, StatusCode::SERVICE_UNAVAILABLE);
            }
            comment = wait_keepalive(&mut keepalive), if !resp.ended() => {
                let mut block = BytesMut::new();
                sse::serialize_comment(&comment, &mut block);
                if let H2Resp::Streaming { ref mut tx, .. } = resp {
                    if let Err(err) = send_data(tx, block.freeze(), false).await {
                        debug!("sse keepalive failed: {}", err);
                        if let Some(hold) = ev_hold.as_ref() {
                            let _ = hold.try_send(ReceiveEvent::SseDisconnect {
                                reason: DisconnectReason::ClientClosed,
                            });
                        }
                        return Ok(());
                    }
                }
            }
        }

        if app_settled && sender_gone && !app_classified {
            app_classified = true;
            let joined = app_joined.take().unwrap_or(Ok(Ok(())));
            match dispatch::classify(joined, resp.started(), resp.ended()) {
                Disposition::Complete => {
                    if !resp.ended() {
                        return Ok(());
                    }
                }
                Disposition::ErrorResponse(err) => {
                    return fail_stream(err, &mut resp, &mut respond);
                }
                Disposition::Abort(err) => {
                    if let H2Resp::Streaming { ref mut tx, ended: false, .. } = resp {
                        tx.send_reset(err.h2_reason());
                    }
                    return Ok(());
                }
            }
        }

        if resp.ended() && app_classified && (pump_done || is_sse) {
            return Ok(());
        }
    }
}

/// Apply one app event to an HTTP/2 response.
async fn handle_event(
    event: SendEvent,
    resp: &mut H2Resp,
    respond: &mut SendResponse<Bytes>,
    keepalive: &mut Option<(tokio::time::Interval, String)>,
) -> crate::Result<()> {
    match event {
        SendEvent::ResponseStart {
            status,
            headers,
            trailers,
        } => {
            if resp.started() {
                return Err(Error::new_user_unexpected_event("second response.start"));
            }
            *resp = H2Resp::Started {
                status,
                headers,
                trailers,
            };
        }
        SendEvent::ResponseBody { body, more } => {
            match std::mem::replace(resp, H2Resp::Done) {
                H2Resp::Started {
                    status,
                    headers,
                    trailers,
                } => {
                    let response = build_response(status, &headers);
                    let end_now = !more && !trailers && body.is_empty();
                    let mut tx = respond
                        .send_response(response, end_now)
                        .map_err(h2_send_err)?;
                    if !end_now {
                        send_data(&mut tx, body, !more && !trailers).await?;
                    }
                    *resp = H2Resp::Streaming {
                        tx,
                        trailers,
                        ended: !more && !trailers,
                    };
                }
                H2Resp::Streaming {
                    mut tx,
                    trailers,
                    ended,
                } => {
                    if ended {
                        *resp = H2Resp::Streaming {
                            tx,
                            trailers,
                            ended,
                        };
                        return Err(Error::new_user_unexpected_event(
                            "body after response end",
                        ));
                    }
                    send_data(&mut tx, body, !more && !trailers).await?;
                    *resp = H2Resp::Streaming {
                        tx,
                        trailers,
                        ended: !more && !trailers,
                    };
                }
                other => {
                    *resp = other;
                    return Err(Error::new_user_unexpected_event(
                        "body before response.start",
                    ));
                }
            }
        }
        SendEvent::ResponseTrailers { headers } => {
            match std::mem::replace(resp, H2Resp::Done) {
                H2Resp::Streaming {
                    mut tx,
                    trailers: true,
                    ended: false,
                } => {
                    let mut map = http::HeaderMap::with_capacity(headers.len());
                    for (name, value) in headers {
                        map.append(name, value);
                    }
                    tx.send_trailers(map).map_err(h2_send_err)?;
                    *resp = H2Resp::Streaming {
                        tx,
                        trailers: true,
                        ended: true,
                    };
                }
                streaming @ H2Resp::Streaming { trailers: false, .. } => {
                    *resp = streaming;
                    return Err(Error::new_user_trailers_not_declared());
                }
                other => {
                    *resp = other;
                    return Err(Error::new_user_unexpected_event("trailers before body"));
                }
            }
        }
        SendEvent::SseStart { status, headers } => {
            if resp.started() {
                return Err(Error::new_user_unexpected_event("second sse.start"));
            }
            let headers = sse_headers(headers);
            let response = build_response(status, &headers);
            let tx = respond
                .send_response(response, false)
                .map_err(h2_send_err)?;
            *resp = H2Resp::Streaming {
                tx,
                trailers: false,
                ended: false,
            };
        }
        SendEvent::SseSend(event) => {
            let tx = sse_tx(resp)?;
            let mut block = BytesMut::new();
            sse::serialize(&event, &mut block);
            // SSE over HTTP/2: raw DATA frames, no chunked hex framing.
            send_data(tx, block.freeze(), false).await?;
        }
        SendEvent::SseComment(comment) => {
            let tx = sse_tx(resp)?;
            let mut block = BytesMut::new();
            sse::serialize_comment(&comment, &mut block);
            send_data(tx, block.freeze(), false).await?;
        }
        SendEvent::SseKeepalive { interval, comment } => {
            sse_tx(resp)?;
            let mut timer = tokio::time::interval_at(
                tokio::time::Instant::now() + interval,
                interval,
            );
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            *keepalive = Some((timer, comment));
        }
        SendEvent::SseClose => {
            let tx = sse_tx(resp)?;
            send_data(tx, Bytes::new(), true).await?;
            if let H2Resp::Streaming { ended, .. } = resp {
                *ended = true;
            }
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

fn sse_tx(resp: &mut H2Resp) -> crate::Result<&mut SendStream<Bytes>> {
    match resp {
        H2Resp::Streaming {
            tx, ended: false, ..
        } => Ok(tx),
        H2Resp::Streaming { ended: true, .. } | H2Resp::Done => {
            Err(Error::new_user_unexpected_event("sse event after close"))
        }
        _ => Err(Error::new_user_unexpected_event("sse event before sse.start")),
    }
}

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

fn build_response(status: StatusCode, headers: &Headers) -> Response<()> {
    let mut response = Response::new(());
    *response.status_mut() = status;
    let map = response.headers_mut();
    for (name, value) in headers {
        // Connection-oriented headers are illegal in HTTP/2.
        if name == http::header::CONNECTION || name == http::header::TRANSFER_ENCODING {
            warn!("dropping connection header {} from http2 response", name);
            continue;
        }
        map.append(name.clone(), value.clone());
    }
    response
}

/// Send one chunk into the stream, honouring per-stream and connection
/// send windows. Resolves only once every byte was accepted, which is the
/// back-pressure the app's `send` future observes.
pub(crate) async fn send_data(
    tx: &mut SendStream<Bytes>,
    mut chunk: Bytes,
    end_of_stream: bool,
) -> crate::Result<()> {
    if chunk.is_empty() {
        return tx.send_data(chunk, end_of_stream).map_err(h2_send_err);
    }
    while !chunk.is_empty() {
        tx.reserve_capacity(chunk.len());
        let available = match poll_fn(|cx| tx.poll_capacity(cx)).await {
            Some(Ok(0)) => continue,
            Some(Ok(n)) => n,
            Some(Err(err)) => return Err(h2_send_err(err)),
            // No longer streaming: the peer reset us.
            None => return Err(Error::new_closed()),
        };
        let take = cmp::min(available, chunk.len());
        let data = chunk.split_to(take);
        let end = end_of_stream && chunk.is_empty();
        tx.send_data(data, end).map_err(h2_send_err)?;
    }
    Ok(())
}

fn h2_send_err(err: h2::Error) -> Error {
    if err.is_reset() || err.is_go_away() {
        Error::new_closed()
    } else {
        Error::new_h2(err)
    }
}

/// Refuse a stream with a small plain-text response.
fn respond_error(
    respond: &mut SendResponse<Bytes>,
    status: StatusCode,
) -> crate::Result<()> {
    let body = Bytes::from_static(
        status
            .canonical_reason()
            .unwrap_or("Error")
            .as_bytes(),
    );
    let response = Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(())
        .map_err(|_| crate::error::Parse::Internal)?;
    match respond.send_response(response, false) {
        Ok(mut tx) => {
            let _ = tx.send_data(body, true);
        }
        Err(err) => {
            debug!("failed to refuse stream: {}", err);
            respond.send_reset(Reason::INTERNAL_ERROR);
        }
    }
    Ok(())
}

fn fail_stream(
    err: Error,
    resp: &mut H2Resp,
    respond: &mut SendResponse<Bytes>,
) -> crate::Result<()> {
    debug!("http2 stream failed: {}", err);
    match resp {
        H2Resp::Init | H2Resp::Started { .. } => {
            respond_error(respond, err.response_status())
        }
        H2Resp::Streaming {
            tx, ended: false, ..
        } => {
            tx.send_reset(err.h2_reason());
            Ok(())
        }
        _ => Ok(()),
    }
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

/// Deliver DATA frames as `http.request` events (with flow-control credit
/// released as they are consumed), ending with `more: false`.
async fn pump_body(
    recv: &mut RecvStream,
    events: mpsc::Sender<ReceiveEvent>,
    mut forward_body: bool,
    max_body_size: u64,
) -> PumpEnd {
    let mut pending: Option<Bytes> = None;
    let mut total: u64 = 0;

    loop {
        match recv.data().await {
            Some(Ok(data)) => {
                let _ = recv.flow_control().release_capacity(data.len());
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
                            forward_body = false;
                        }
                    }
                    if forward_body {
                        pending = Some(data);
                    }
                }
            }
            Some(Err(err)) => {
                let benign = err
                    .reason()
                    .map(|r| r == Reason::NO_ERROR || r == Reason::CANCEL)
                    .unwrap_or(false);
                if forward_body {
                    let _ = events.send(ReceiveEvent::HttpDisconnect).await;
                }
                return PumpEnd {
                    result: if benign {
                        Ok(())
                    } else {
                        Err(Error::new_h2(err))
                    },
                    peer_gone: true,
                };
            }
            None => {
                // request trailers are consumed and discarded
                let _ = recv.trailers().await;
                if forward_body {
                    let body = pending.take().unwrap_or_else(Bytes::new);
                    let _ = events
                        .send(ReceiveEvent::HttpRequest { body, more: false })
                        .await;
                }
                return PumpEnd {
                    result: Ok(()),
                    peer_gone: false,
                };
            }
        }
    }
}

/// Drive one Extended CONNECT stream as a WebSocket session.
async fn websocket_stream<A>(
    parts: http::request::Parts,
    recv_body: RecvStream,
    mut respond: SendResponse<Bytes>,
    stream_id: u32,
    shared: Arc<Shared<A>>,
    info: ConnInfo,
    watch: Watch,
) -> crate::Result<()>
where
    A: Application,
{
    let scheme = if info.is_secure() {
        Scheme::Wss
    } else {
        Scheme::Ws
    };
    let subprotocols: Vec<String> = parts
        .headers
        .get_all("sec-websocket-protocol")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_owned())
        .filter(|p| !p.is_empty())
        .collect();

    let req = request_parts(&parts, stream_id, &shared, &info, scheme);
    let scope = Scope::WebSocket(WebSocketScope {
        request: req,
        subprotocols,
    });

    let (receiver, sender, ev_tx, mut send_rx) = crate::app::channel(ScopeKind::WebSocket);
    let app_task = dispatch::spawn(&shared.app, scope, receiver, sender);
    let _ = ev_tx.send(ReceiveEvent::WebSocketConnect).await;

    match ws::connect_reply(&mut send_rx, shared.request_timeout).await {
        ws::ConnectReply::Accept {
            subprotocol,
            headers,
        } => {
            let mut response = Response::new(());
            // Over HTTP/2 the 200 is the accept signal; there is no
            // Sec-WebSocket-Accept digest.
            *response.status_mut() = StatusCode::OK;
            if let Some(proto) = subprotocol {
                if let Ok(value) = http::HeaderValue::from_str(&proto) {
                    response
                        .headers_mut()
                        .insert("sec-websocket-protocol", value);
                }
            }
            for (name, value) in headers {
                response.headers_mut().append(name, value);
            }
            let send_stream = respond
                .send_response(response, false)
                .map_err(h2_send_err)?;

            let transport = H2Transport::new(recv_body, send_stream);
            let (rd, wr) = tokio::io::split(transport);
            let config = ws::SessionConfig::from_shared(&shared);
            ws::session(
                rd,
                wr,
                BytesMut::new(),
                ev_tx,
                send_rx,
                app_task,
                config,
                watch,
            )
            .await
        }
        ws::ConnectReply::Reject => {
            respond_error(&mut respond, StatusCode::FORBIDDEN)
        }
    }
}

/// A byte-stream view of one CONNECT stream: reads drain DATA frames,
/// writes become DATA frames. Each stream owns its own transport; nothing
/// is shared across streams.
struct H2Transport {
    recv: RecvStream,
    send: SendStream<Bytes>,
    buf: Bytes,
}

impl H2Transport {
    fn new(recv: RecvStream, send: SendStream<Bytes>) -> H2Transport {
        H2Transport {
            recv,
            send,
            buf: Bytes::new(),
        }
    }
}

impl AsyncRead for H2Transport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        read_buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.buf.is_empty() {
            self.buf = loop {
                match futures_core::ready!(self.recv.poll_data(cx)) {
                    None => return Poll::Ready(Ok(())),
                    Some(Ok(buf)) if buf.is_empty() && !self.recv.is_end_stream() => {
                        continue
                    }
                    Some(Ok(buf)) => break buf,
                    Some(Err(e)) => {
                        return Poll::Ready(match e.reason() {
                            Some(Reason::NO_ERROR) | Some(Reason::CANCEL) => Ok(()),
                            Some(Reason::STREAM_CLOSED) => {
                                Err(io::Error::new(io::ErrorKind::BrokenPipe, e))
                            }
                            _ => Err(h2_to_io_error(e)),
                        })
                    }
                }
            };
        }
        let cnt = cmp::min(self.buf.len(), read_buf.remaining());
        read_buf.put_slice(&self.buf[..cnt]);
        self.buf.advance(cnt);
        let _ = self.recv.flow_control().release_capacity(cnt);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for H2Transport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        self.send.reserve_capacity(buf.len());
        loop {
            match futures_core::ready!(self.send.poll_capacity(cx)) {
                Some(Ok(0)) => continue,
                Some(Ok(cap)) => {
                    let n = cmp::min(cap, buf.len());
                    self.send
                        .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                        .map_err(h2_to_io_error)?;
                    return Poll::Ready(Ok(n));
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_to_io_error(e))),
                None => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "stream capacity unexpectedly closed",
                    )))
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // DATA frames are handed to the session as they are produced;
        // there is no transport-level buffer to flush here.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let _ = self.send.send_data(Bytes::new(), true);
        Poll::Ready(Ok(()))
    }
}

fn h2_to_io_error(e: h2::Error) -> io::Error {
    if e.is_io() {
        e.into_io().expect("h2::Error::is_io")
    } else {
        io::Error::new(io::ErrorKind::Other, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preface_is_24_bytes() {
        assert_eq!(PREFACE.len(), 24);
        assert!(PREFACE.starts_with(b"PRI * HTTP/2.0"));
    }

    #[test]
    fn connection_headers_dropped_from_h2_responses() {
        let headers: Headers = vec![
            (
                http::header::CONNECTION,
                http::HeaderValue::from_static("close"),
            ),
            (
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("text/plain"),
            ),
        ];
        let response = build_response(StatusCode::OK, &headers);
        assert!(response.headers().get(http::header::CONNECTION).is_none());
        assert_eq!(
            response.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
    }

    #[test]
    fn sse_headers_defaulted_not_overridden() {
        let defaulted = sse_headers(vec![]);
        assert!(defaulted
            .iter()
            .any(|(n, v)| n == http::header::CONTENT_TYPE
                && v == "text/event-stream"));
        assert!(defaulted
            .iter()
            .any(|(n, v)| n == http::header::CACHE_CONTROL && v == "no-cache"));

        let custom = sse_headers(vec![(
            http::header::CACHE_CONTROL,
            http::HeaderValue::from_static("no-store"),
        )]);
        let cache: Vec<_> = custom
            .iter()
            .filter(|(n, _)| n == http::header::CACHE_CONTROL)
            .collect();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache[0].1, "no-store");
    }
}

//! The application contract: scopes, events, and the `receive`/`send` pair.
//!
//! Every request or stream the server terminates is presented to the
//! application as an immutable [`Scope`] plus two handles: a [`Receiver`]
//! yielding events that arrived on the wire, and a [`Sender`] accepting
//! events to be framed back out. The application itself is anything
//! implementing [`Application`], usually an async closure:
//!
//! ```no_run
//! use gantry::app::{Scope, Receiver, Sender, SendEvent};
//! use gantry::Result;
//!
//! async fn hello(scope: Scope, _receive: Receiver, send: Sender) -> Result<()> {
//!     if let Scope::Http(_) = scope {
//!         send.send(SendEvent::response_start(200, vec![])).await?;
//!         send.send(SendEvent::response_body("Hello", false)).await?;
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{Method, StatusCode};
use tokio::sync::{mpsc, oneshot};

use crate::lifespan::State;
use crate::proto::sse::SseEvent;

/// Ordered header sequence: lowercase names, duplicates allowed, wire order
/// preserved. Pseudo-headers never appear here.
pub type Headers = Vec<(HeaderName, HeaderValue)>;

/// The HTTP version that carried a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    /// HTTP/1.1, one stream per connection.
    H11,
    /// HTTP/2, multiplexed streams.
    H2,
}

impl HttpVersion {
    /// The scope's `http_version` string: `"1.1"` or `"2"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::H11 => "1.1",
            HttpVersion::H2 => "2",
        }
    }
}

/// URL scheme as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a client certificate chain.
#[derive(Debug, Clone)]
pub struct ClientCert {
    /// Raw DER bytes.
    pub der: Bytes,
    /// Human-readable subject distinguished name.
    pub subject: String,
}

/// TLS details for a terminated connection, shared by all its streams.
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    /// Negotiated protocol version as the numeric wire value
    /// (`0x0303` = TLS 1.2, `0x0304` = TLS 1.3).
    pub tls_version: u16,
    /// Negotiated cipher suite name.
    pub cipher_suite: Option<String>,
    /// Verified client certificate chain, leaf first. Empty unless client
    /// verification was configured and the peer presented one.
    pub client_cert_chain: Vec<ClientCert>,
}

impl TlsInfo {
    /// Subject DN of the leaf client certificate, if any.
    pub fn client_cert_name(&self) -> Option<&str> {
        self.client_cert_chain.first().map(|c| c.subject.as_str())
    }
}

/// HTTP/2 details for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Http2Info {
    /// The wire stream identifier (odd, strictly increasing per connection).
    pub stream_id: u32,
}

/// Optional per-scope extension records.
#[derive(Debug, Clone, Default)]
pub struct Extensions {
    pub tls: Option<Arc<TlsInfo>>,
    pub http2: Option<Http2Info>,
}

/// The shared fields of every request-bearing scope.
#[derive(Debug, Clone)]
pub struct RequestParts {
    pub http_version: HttpVersion,
    pub method: Method,
    pub scheme: Scheme,
    /// Percent-decoded, UTF-8 path. If the decoded bytes were not valid
    /// UTF-8 the raw target is passed through unchanged.
    pub path: String,
    /// The request target exactly as received, before decoding.
    pub raw_path: Bytes,
    /// Bytes after `?`, undecoded; empty if absent.
    pub query_string: Bytes,
    /// Mount prefix; empty unless configured.
    pub root_path: String,
    pub headers: Headers,
    /// Peer address. `None` on Unix-socket transports.
    pub client: Option<SocketAddr>,
    /// Local address. `None` on Unix-socket transports.
    pub server: Option<SocketAddr>,
    pub extensions: Extensions,
    /// Handle to the worker-wide lifespan state. Identical for every scope
    /// in the same worker.
    pub state: State,
}

/// Scope for a plain HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpScope {
    pub request: RequestParts,
}

/// Scope for a WebSocket session (HTTP/1.1 upgrade or RFC 8441 CONNECT).
#[derive(Debug, Clone)]
pub struct WebSocketScope {
    pub request: RequestParts,
    /// Offered subprotocols, in client preference order.
    pub subprotocols: Vec<String>,
}

/// Scope for a Server-Sent Events stream.
#[derive(Debug, Clone)]
pub struct SseScope {
    pub request: RequestParts,
}

/// Scope for the process-wide startup/shutdown lifecycle.
#[derive(Debug, Clone)]
pub struct LifespanScope {
    pub state: State,
}

/// The immutable record describing one call into the application.
#[derive(Debug, Clone)]
pub enum Scope {
    Http(HttpScope),
    WebSocket(WebSocketScope),
    Sse(SseScope),
    Lifespan(LifespanScope),
}

/// Discriminant of [`Scope`], used where only the variant matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeKind {
    Http,
    WebSocket,
    Sse,
    Lifespan,
}

impl Scope {
    /// The scope's `type` string.
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Http(_) => "http",
            Scope::WebSocket(_) => "websocket",
            Scope::Sse(_) => "sse",
            Scope::Lifespan(_) => "lifespan",
        }
    }

    /// The worker-wide lifespan state handle.
    pub fn state(&self) -> &State {
        match self {
            Scope::Http(s) => &s.request.state,
            Scope::WebSocket(s) => &s.request.state,
            Scope::Sse(s) => &s.request.state,
            Scope::Lifespan(s) => &s.state,
        }
    }

    pub(crate) fn scope_kind(&self) -> ScopeKind {
        match self {
            Scope::Http(_) => ScopeKind::Http,
            Scope::WebSocket(_) => ScopeKind::WebSocket,
            Scope::Sse(_) => ScopeKind::Sse,
            Scope::Lifespan(_) => ScopeKind::Lifespan,
        }
    }
}

/// A WebSocket message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

/// Why an SSE stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    ServerClosed,
    ConnectionClosed,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClosed => "client_closed",
            DisconnectReason::ServerClosed => "server_closed",
            DisconnectReason::ConnectionClosed => "connection_closed",
        }
    }
}

/// Events delivered to the application via [`Receiver::recv`].
#[derive(Debug, Clone)]
pub enum ReceiveEvent {
    /// `http.request`: one chunk of request body. The final chunk carries
    /// `more: false`; a bodiless request yields exactly one empty chunk.
    HttpRequest { body: Bytes, more: bool },
    /// `http.disconnect`: the peer or connection is gone. Delivered at most
    /// once per stream.
    HttpDisconnect,
    /// `websocket.connect`: reply with accept or close.
    WebSocketConnect,
    /// `websocket.receive`: one complete text or binary message.
    WebSocketReceive(Message),
    /// `websocket.disconnect`: delivered exactly once after accept.
    WebSocketDisconnect { code: u16, reason: String },
    /// `sse.request`: the stream is ready for `sse.start`.
    SseRequest,
    /// `sse.disconnect`: the stream ended.
    SseDisconnect { reason: DisconnectReason },
    /// `lifespan.startup`
    LifespanStartup,
    /// `lifespan.shutdown`
    LifespanShutdown,
}

impl ReceiveEvent {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReceiveEvent::HttpDisconnect
                | ReceiveEvent::WebSocketDisconnect { .. }
                | ReceiveEvent::SseDisconnect { .. }
        )
    }
}

/// Events accepted from the application via [`Sender::send`].
#[derive(Debug, Clone)]
pub enum SendEvent {
    /// `http.response.start`. Headers are immutable afterwards. Declaring
    /// `trailers: true` forces chunked framing on HTTP/1.1 and permits a
    /// later `ResponseTrailers`.
    ResponseStart {
        status: StatusCode,
        headers: Headers,
        trailers: bool,
    },
    /// `http.response.body`. The final event carries `more: false`.
    ResponseBody { body: Bytes, more: bool },
    /// `http.response.trailers`; only legal if declared in `ResponseStart`.
    ResponseTrailers { headers: Headers },
    /// `websocket.accept`
    WebSocketAccept {
        subprotocol: Option<String>,
        headers: Headers,
    },
    /// `websocket.send`
    WebSocketSend(Message),
    /// `websocket.close`
    WebSocketClose { code: u16, reason: String },
    /// `sse.start`
    SseStart { status: StatusCode, headers: Headers },
    /// `sse.send`
    SseSend(SseEvent),
    /// `sse.comment`: a bare `:<comment>` line.
    SseComment(String),
    /// `sse.keepalive`: start a periodic comment emitter.
    SseKeepalive { interval: Duration, comment: String },
    /// `sse.close`: end the event stream.
    SseClose,
    /// `lifespan.startup.complete`
    StartupComplete,
    /// `lifespan.startup.failed`
    StartupFailed { message: String },
    /// `lifespan.shutdown.complete`
    ShutdownComplete,
    /// `lifespan.shutdown.failed`
    ShutdownFailed { message: String },
}

impl SendEvent {
    /// `http.response.start` with no trailers declared.
    pub fn response_start<S>(status: S, headers: Headers) -> SendEvent
    where
        S: TryInto<StatusCode>,
        S::Error: fmt::Debug,
    {
        SendEvent::ResponseStart {
            status: status.try_into().expect("invalid status code"),
            headers,
            trailers: false,
        }
    }

    /// A final or intermediate `http.response.body`.
    pub fn response_body(body: impl Into<Bytes>, more: bool) -> SendEvent {
        SendEvent::ResponseBody {
            body: body.into(),
            more,
        }
    }
}

/// Yields wire events for one scope. At most one `recv` may be pending at
/// a time, which the `&mut self` receiver enforces statically.
#[derive(Debug)]
pub struct Receiver {
    rx: mpsc::Receiver<ReceiveEvent>,
    kind: ScopeKind,
    ended: bool,
    first_recv: Option<oneshot::Sender<()>>,
}

impl Receiver {
    pub(crate) fn new(rx: mpsc::Receiver<ReceiveEvent>, kind: ScopeKind) -> Receiver {
        Receiver {
            rx,
            kind,
            ended: false,
            first_recv: None,
        }
    }

    /// Arrange for `tx` to fire the first time the application asks for an
    /// event on this scope. The HTTP/1.1 codec keys its lazy
    /// `100 Continue` interim response off this.
    pub(crate) fn notify_first_recv(&mut self, tx: oneshot::Sender<()>) {
        self.first_recv = Some(tx);
    }

    /// Waits for the next event on this scope.
    ///
    /// When the stream dies, the final event is the scope's disconnect
    /// variant, delivered exactly once even if the stream task was torn
    /// down without sending one. After that, `recv` fails with a closed
    /// error.
    pub async fn recv(&mut self) -> crate::Result<ReceiveEvent> {
        if let Some(tx) = self.first_recv.take() {
            let _ = tx.send(());
        }
        if self.ended {
            return Err(crate::Error::new_closed());
        }
        let event = match self.rx.recv().await {
            Some(event) => event,
            None => match self.kind {
                ScopeKind::Http => ReceiveEvent::HttpDisconnect,
                ScopeKind::WebSocket => ReceiveEvent::WebSocketDisconnect {
                    code: 1006,
                    reason: String::new(),
                },
                ScopeKind::Sse => ReceiveEvent::SseDisconnect {
                    reason: DisconnectReason::ConnectionClosed,
                },
                ScopeKind::Lifespan => return Err(crate::Error::new_closed()),
            },
        };
        if event.is_terminal() {
            self.ended = true;
            self.rx.close();
        }
        Ok(event)
    }
}

/// Accepts events from the application and forwards them to the codec.
///
/// `send` resolves only once the stream task has accepted the event; the
/// channel holds a single slot, so an application producing faster than
/// the wire drains is suspended (HTTP/2 flow control and HTTP/1.1 socket
/// flushes propagate through here as back-pressure).
#[derive(Debug, Clone)]
pub struct Sender {
    tx: mpsc::Sender<SendEvent>,
}

impl Sender {
    pub(crate) fn new(tx: mpsc::Sender<SendEvent>) -> Sender {
        Sender { tx }
    }

    /// Queue one event for framing.
    ///
    /// Fails with a closed error when the stream or connection is gone;
    /// the dispatcher treats that as benign, so applications may simply
    /// `?`-propagate it.
    pub async fn send(&self, event: SendEvent) -> crate::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| crate::Error::new_closed())
    }
}

/// The channel capacity for receive-side body chunks.
pub(crate) const RECV_QUEUE: usize = 8;

/// Builds the wired pair of handles for one stream. The codec keeps the
/// returned raw ends.
pub(crate) fn channel(
    kind: ScopeKind,
) -> (
    Receiver,
    Sender,
    mpsc::Sender<ReceiveEvent>,
    mpsc::Receiver<SendEvent>,
) {
    let (ev_tx, ev_rx) = mpsc::channel(RECV_QUEUE);
    let (send_tx, send_rx) = mpsc::channel(1);
    (
        Receiver::new(ev_rx, kind),
        Sender::new(send_tx),
        ev_tx,
        send_rx,
    )
}

type AppFuture = Pin<Box<dyn Future<Output = crate::Result<()>> + Send>>;

/// A user application: one callable invoked per scope.
pub trait Application: Send + Sync + 'static {
    /// Handle one scope to completion.
    fn call(&self, scope: Scope, receive: Receiver, send: Sender) -> AppFuture;
}

impl<F, Fut> Application for F
where
    F: Fn(Scope, Receiver, Sender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<()>> + Send + 'static,
{
    fn call(&self, scope: Scope, receive: Receiver, send: Sender) -> AppFuture {
        Box::pin((self)(scope, receive, send))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receiver_synthesizes_disconnect_once() {
        let (mut receiver, _sender, ev_tx, _send_rx) = channel(ScopeKind::Http);
        drop(ev_tx);

        match receiver.recv().await.unwrap() {
            ReceiveEvent::HttpDisconnect => (),
            other => panic!("expected disconnect, got {:?}", other),
        }
        assert!(receiver.recv().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn receiver_never_yields_two_disconnects() {
        let (mut receiver, _sender, ev_tx, _send_rx) = channel(ScopeKind::Http);
        ev_tx.send(ReceiveEvent::HttpDisconnect).await.unwrap();
        // A buggy producer pushing a second disconnect must not surface it.
        let _ = ev_tx.try_send(ReceiveEvent::HttpDisconnect);
        drop(ev_tx);

        matches::assert_matches!(
            receiver.recv().await.unwrap(),
            ReceiveEvent::HttpDisconnect
        );
        assert!(receiver.recv().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn websocket_receiver_reports_abnormal_close() {
        let (mut receiver, _sender, ev_tx, _send_rx) = channel(ScopeKind::WebSocket);
        drop(ev_tx);

        match receiver.recv().await.unwrap() {
            ReceiveEvent::WebSocketDisconnect { code, .. } => assert_eq!(code, 1006),
            other => panic!("expected disconnect, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn first_recv_notifier_fires_once() {
        let (mut receiver, _sender, ev_tx, _send_rx) = channel(ScopeKind::Http);
        let (tx, mut rx) = oneshot::channel();
        receiver.notify_first_recv(tx);

        // nothing asked for an event yet
        assert!(rx.try_recv().is_err());

        ev_tx
            .send(ReceiveEvent::HttpRequest {
                body: Bytes::new(),
                more: false,
            })
            .await
            .unwrap();
        let _ = receiver.recv().await.unwrap();
        rx.await.expect("notifier fires on the first recv");
    }

    #[tokio::test]
    async fn sender_fails_closed_when_stream_gone() {
        let (_receiver, sender, _ev_tx, send_rx) = channel(ScopeKind::Http);
        drop(send_rx);

        let err = sender
            .send(SendEvent::response_start(200, vec![]))
            .await
            .unwrap_err();
        assert!(err.is_closed());
    }
}

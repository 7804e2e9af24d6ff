//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

/// Result type often returned from methods that can have gantry `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling connections, streams, or the
/// application contract.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(super) enum Kind {
    Parse(Parse),
    User(User),
    Ws(Ws),
    /// A request body exceeded the configured `max_body_size`.
    BodyTooLarge,
    /// A general error from h2.
    Http2,
    /// An `io::Error` while reading or writing a network stream.
    Io,
    /// Error creating the listener socket.
    Listen,
    /// Error accepting a connection.
    Accept,
    /// TLS handshake or context construction failed.
    Tls,
    /// Invalid server configuration.
    Config,
    /// A pending item was dropped before ever being processed.
    Canceled,
    /// The peer (or the stream task) is gone.
    ChannelClosed,
    /// The app did not produce `http.response.start` before the stall deadline.
    RequestTimeout,
    /// The connection sat idle past the configured deadline.
    IdleTimeout,
    /// Worker shutdown interrupted the operation.
    Shutdown,
    /// The application reported a lifespan startup/shutdown failure.
    Lifespan,
}

#[derive(Debug)]
pub(super) enum Parse {
    Method,
    Version,
    Uri,
    Header(Header),
    /// Message head exceeded the read buffer limit.
    TooLarge,
    /// A chunk-size line was not valid hex.
    ChunkSize,
    /// A single chunk exceeded `max_chunk_size`.
    ChunkTooLarge,
    Internal,
}

#[derive(Debug)]
pub(super) enum Header {
    Token,
    ContentLengthInvalid,
    TransferEncodingUnexpected,
}

#[derive(Debug)]
pub(super) enum User {
    /// Error from the future returned by the user's application.
    Application,
    /// The application returned without ever starting a response.
    NoResponse,
    /// The application sent an event that is illegal in the stream's
    /// current state (body before start, second start, events after end).
    UnexpectedEvent,
    /// `http.response.trailers` sent without `trailers: true` declared.
    TrailersNotDeclared,
}

#[derive(Debug)]
pub(super) enum Ws {
    /// The HTTP request did not carry a complete WebSocket handshake.
    BadHandshake,
    /// A text frame (or close reason) held invalid UTF-8. Close code 1007.
    InvalidUtf8,
    /// A close frame carried an illegal code or 1-byte payload. Close code 1002.
    BadCloseFrame,
    /// A frame violated RFC 6455 framing rules. Close code 1002.
    BadFrame,
    /// No pong arrived within the keepalive deadline. Close code 1011.
    PongTimeout,
}

// Sentinel type to indicate the error was caused by a timeout.
#[derive(Debug)]
pub(super) struct TimedOut;

impl Error {
    /// Returns true if this was a request parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error was caused by user application code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if this was a WebSocket protocol violation.
    pub fn is_ws(&self) -> bool {
        matches!(self.inner.kind, Kind::Ws(_))
    }

    /// Returns true if this was about an operation that was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the peer or stream is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ChannelClosed)
    }

    /// Returns true if a body exceeded `max_body_size`.
    pub fn is_body_too_large(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::BodyTooLarge | Kind::Parse(Parse::ChunkTooLarge)
        )
    }

    /// Returns true if the error was caused by a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::RequestTimeout | Kind::IdleTimeout)
            || self.find_source::<TimedOut>().is_some()
    }

    /// Returns true if the server configuration was rejected.
    pub fn is_config(&self) -> bool {
        matches!(self.inner.kind, Kind::Config)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(super) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(super) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    #[allow(unused)]
    pub(super) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(ref typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }

        // else
        None
    }

    pub(crate) fn h2_reason(&self) -> h2::Reason {
        // Find an h2::Reason somewhere in the cause stack, if it exists,
        // otherwise assume an INTERNAL_ERROR.
        self.find_source::<h2::Error>()
            .and_then(|h2_err| h2_err.reason())
            .unwrap_or(h2::Reason::INTERNAL_ERROR)
    }

    /// The status code a wire-facing error is surfaced as: 400 for
    /// malformed requests, 413 for oversize bodies and chunks, 503 for
    /// stall timeouts, 500 otherwise.
    pub(crate) fn response_status(&self) -> StatusCode {
        match self.inner.kind {
            Kind::BodyTooLarge | Kind::Parse(Parse::ChunkTooLarge) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            Kind::Parse(_) => StatusCode::BAD_REQUEST,
            Kind::RequestTimeout => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The close code a WebSocket protocol error maps onto.
    pub(crate) fn ws_close_code(&self) -> u16 {
        match self.inner.kind {
            Kind::Ws(Ws::InvalidUtf8) => 1007,
            Kind::Ws(Ws::BadCloseFrame) | Kind::Ws(Ws::BadFrame) => 1002,
            _ => 1011,
        }
    }

    #[allow(unused)]
    pub(super) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(super) fn new_closed() -> Error {
        Error::new(Kind::ChannelClosed)
    }

    pub(super) fn new_body_too_large() -> Error {
        Error::new(Kind::BodyTooLarge)
    }

    pub(super) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(super) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    #[allow(unused)]
    pub(super) fn new_accept<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(super) fn new_tls<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Tls).with(cause)
    }

    pub(super) fn new_config<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Config).with(cause)
    }

    pub(super) fn new_request_timeout() -> Error {
        Error::new(Kind::RequestTimeout)
    }

    pub(super) fn new_idle_timeout() -> Error {
        Error::new(Kind::IdleTimeout)
    }

    #[allow(unused)]
    pub(super) fn new_shutdown() -> Error {
        Error::new(Kind::Shutdown)
    }

    pub(super) fn new_lifespan<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Lifespan).with(cause)
    }

    pub(super) fn new_ws(ws: Ws) -> Error {
        Error::new(Kind::Ws(ws))
    }

    fn new_user(user: User) -> Error {
        Error::new(Kind::User(user))
    }

    pub(super) fn new_user_application<E: Into<Cause>>(cause: E) -> Error {
        Error::new_user(User::Application).with(cause)
    }

    pub(super) fn new_user_no_response() -> Error {
        Error::new_user(User::NoResponse)
    }

    pub(super) fn new_user_unexpected_event(what: &'static str) -> Error {
        Error::new_user(User::UnexpectedEvent).with(what)
    }

    pub(super) fn new_user_trailers_not_declared() -> Error {
        Error::new_user(User::TrailersNotDeclared)
    }

    pub(super) fn new_h2(cause: ::h2::Error) -> Error {
        if cause.is_io() {
            Error::new_io(cause.into_io().expect("h2::Error::is_io"))
        } else {
            Error::new(Kind::Http2).with(cause)
        }
    }

    /// The error's standalone message, without the message from the source.
    pub fn message(&self) -> impl fmt::Display + '_ {
        self.description()
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Header(Header::Token)) => "invalid HTTP header parsed",
            Kind::Parse(Parse::Header(Header::ContentLengthInvalid)) => {
                "invalid content-length parsed"
            }
            Kind::Parse(Parse::Header(Header::TransferEncodingUnexpected)) => {
                "unexpected transfer-encoding parsed"
            }
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::ChunkSize) => "invalid chunk size line",
            Kind::Parse(Parse::ChunkTooLarge) => "chunk exceeds configured maximum",
            Kind::Parse(Parse::Internal) => {
                "internal error inside gantry and/or its dependencies, please report"
            }
            Kind::BodyTooLarge => "request body exceeds configured maximum",
            Kind::Http2 => "http2 error",
            Kind::Io => "connection error",
            Kind::Listen => "error creating server listener",
            Kind::Accept => "error accepting connection",
            Kind::Tls => "TLS error",
            Kind::Config => "invalid server configuration",
            Kind::Canceled => "operation was canceled",
            Kind::ChannelClosed => "channel closed",
            Kind::RequestTimeout => "app did not start a response in time",
            Kind::IdleTimeout => "connection idle timeout",
            Kind::Shutdown => "worker is shutting down",
            Kind::Lifespan => "application lifespan failure",

            Kind::User(User::Application) => "error from user's application",
            Kind::User(User::NoResponse) => {
                "application returned without sending a response"
            }
            Kind::User(User::UnexpectedEvent) => "application sent event out of order",
            Kind::User(User::TrailersNotDeclared) => {
                "application sent trailers without declaring them"
            }

            Kind::Ws(Ws::BadHandshake) => "incomplete WebSocket handshake",
            Kind::Ws(Ws::InvalidUtf8) => "WebSocket text frame held invalid UTF-8",
            Kind::Ws(Ws::BadCloseFrame) => "WebSocket close frame was illegal",
            Kind::Ws(Ws::BadFrame) => "WebSocket framing violation",
            Kind::Ws(Ws::PongTimeout) => "WebSocket peer stopped answering pings",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("gantry::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[doc(hidden)]
impl From<Parse> for Error {
    fn from(err: Parse) -> Error {
        Error::new(Kind::Parse(err))
    }
}

impl Parse {
    pub(crate) fn content_length_invalid() -> Self {
        Parse::Header(Header::ContentLengthInvalid)
    }

    pub(crate) fn transfer_encoding_unexpected() -> Self {
        Parse::Header(Header::TransferEncodingUnexpected)
    }
}

impl From<httparse::Error> for Parse {
    fn from(err: httparse::Error) -> Parse {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Parse::Header(Header::Token),
            httparse::Error::Status => Parse::Internal,
            httparse::Error::TooManyHeaders => Parse::TooLarge,
            httparse::Error::Version => Parse::Version,
        }
    }
}

impl From<http::method::InvalidMethod> for Parse {
    fn from(_: http::method::InvalidMethod) -> Parse {
        Parse::Method
    }
}

impl From<http::uri::InvalidUri> for Parse {
    fn from(_: http::uri::InvalidUri) -> Parse {
        Parse::Uri
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}

// ===== impl TimedOut ====

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn h2_reason_unknown() {
        let closed = Error::new_closed();
        assert_eq!(closed.h2_reason(), h2::Reason::INTERNAL_ERROR);
    }

    #[test]
    fn h2_reason_nested() {
        let recvd = Error::new_h2(h2::Error::from(h2::Reason::HTTP_1_1_REQUIRED));
        // Suppose the dispatcher were relaying the received error
        let svc_err = Error::new_user_application(recvd);
        assert_eq!(svc_err.h2_reason(), h2::Reason::HTTP_1_1_REQUIRED);
    }

    #[test]
    fn wire_status_mapping() {
        assert_eq!(
            Error::from(Parse::ChunkSize).response_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::new_body_too_large().response_status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            Error::new_request_timeout().response_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn ws_close_codes() {
        assert_eq!(Error::new_ws(Ws::InvalidUtf8).ws_close_code(), 1007);
        assert_eq!(Error::new_ws(Ws::BadCloseFrame).ws_close_code(), 1002);
        assert_eq!(Error::new_ws(Ws::PongTimeout).ws_close_code(), 1011);
    }
}

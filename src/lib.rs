#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # gantry
//!
//! gantry is an asynchronous application-server runtime. It terminates
//! HTTP/1.1, HTTP/2 (ALPN-negotiated over TLS or sniffed h2c), WebSocket
//! (RFC 6455, and RFC 8441 over HTTP/2) and Server-Sent Events, and
//! dispatches every request into a user-supplied application callable as
//! a typed event stream.
//!
//! ## The application contract
//!
//! An application is one async callable invoked per scope:
//!
//! ```no_run
//! use gantry::app::{Scope, Receiver, Sender, SendEvent, ReceiveEvent};
//! use gantry::{Config, Server};
//!
//! async fn app(
//!     scope: Scope,
//!     mut receive: Receiver,
//!     send: Sender,
//! ) -> gantry::Result<()> {
//!     match scope {
//!         Scope::Http(_) => {
//!             // drain the request body
//!             while let ReceiveEvent::HttpRequest { more: true, .. } =
//!                 receive.recv().await?
//!             {}
//!             send.send(SendEvent::response_start(200, vec![])).await?;
//!             send.send(SendEvent::response_body("Hello", false)).await?;
//!         }
//!         Scope::Lifespan(_) => loop {
//!             match receive.recv().await? {
//!                 ReceiveEvent::LifespanStartup => {
//!                     send.send(SendEvent::StartupComplete).await?;
//!                 }
//!                 ReceiveEvent::LifespanShutdown => {
//!                     send.send(SendEvent::ShutdownComplete).await?;
//!                     break;
//!                 }
//!                 _ => {}
//!             }
//!         },
//!         _ => {}
//!     }
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> gantry::Result<()> {
//!     let config = Config::new().port(8000).http2(true).workers(4);
//!     Server::bind(config)?.serve(app).await
//! }
//! ```
//!
//! ## Processes
//!
//! With `workers(n)` for `n > 0`, the bound process becomes a pre-fork
//! supervisor: the listening socket is bound once, `FD_CLOEXEC` is
//! cleared, and the current binary is re-executed `n` times with the
//! configuration in `GANTRY_*` environment variables. `Server::bind`
//! detects worker mode and adopts the socket, so the code above works
//! unchanged in every role.
//!
//! Worker stdout is the heartbeat channel to the supervisor; processes
//! should log to stderr.
//!
//! ## Back-pressure
//!
//! `Sender::send` resolves only once the event's bytes were accepted by
//! the transport: the socket write buffer on HTTP/1.1, the stream and
//! connection flow-control windows on HTTP/2. A slow client therefore
//! suspends the application instead of growing a buffer.

#[doc(no_inline)]
pub use http::{header, HeaderMap, Method, StatusCode, Uri, Version};

pub use crate::error::{Error, Result};

pub mod app;
mod common;
pub mod config;
mod dispatch;
mod error;
mod lifespan;
mod proto;
mod server;
mod tls;

pub use crate::app::{
    Application, Message, ReceiveEvent, Receiver, Scope, SendEvent, Sender,
};
pub use crate::config::{Config, H2Settings, TlsConfig, TlsVersion};
pub use crate::lifespan::State;
pub use crate::proto::sse::SseEvent;
pub use crate::server::Server;

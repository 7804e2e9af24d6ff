//! Per-worker values every connection task borrows.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::app::{Application, TlsInfo};
use crate::config::{Config, H2Settings};
use crate::lifespan::State;

/// Immutable per-worker context, shared by every connection.
pub(crate) struct Shared<A> {
    pub(crate) app: Arc<A>,
    pub(crate) state: State,
    pub(crate) root_path: String,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) max_body_size: u64,
    pub(crate) max_chunk_size: u64,
    pub(crate) http2: bool,
    pub(crate) h2c_enabled: bool,
    pub(crate) h2: H2Settings,
    pub(crate) ws_ping_interval: Option<Duration>,
    pub(crate) ws_ping_timeout: Duration,
}

impl<A: Application> Shared<A> {
    pub(crate) fn new(app: Arc<A>, state: State, config: &Config) -> Shared<A> {
        Shared {
            app,
            state,
            root_path: config.root_path.clone(),
            request_timeout: config.request_timeout,
            idle_timeout: config.idle_timeout,
            max_body_size: config.max_body_size,
            max_chunk_size: config.max_chunk_size,
            http2: config.http2,
            h2c_enabled: config.h2c_enabled(),
            h2: config.h2,
            ws_ping_interval: config.ws_ping_interval,
            ws_ping_timeout: config.ws_ping_timeout,
        }
    }
}

/// Addressing and TLS facts for one accepted connection.
#[derive(Clone)]
pub(crate) struct ConnInfo {
    pub(crate) client: Option<SocketAddr>,
    pub(crate) server: Option<SocketAddr>,
    pub(crate) tls: Option<Arc<TlsInfo>>,
}

impl ConnInfo {
    pub(crate) fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}

//! Server configuration.
//!
//! A [`Config`] is built with chained setters, validated once when the
//! server binds, and propagated to worker processes through `GANTRY_*`
//! environment variables (workers are re-executions of the same binary).

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

/// Minimum accepted TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    V1_2,
    V1_3,
}

impl TlsVersion {
    fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::V1_2 => "1.2",
            TlsVersion::V1_3 => "1.3",
        }
    }

    fn parse(s: &str) -> crate::Result<TlsVersion> {
        match s {
            "1.2" | "TLS1.2" => Ok(TlsVersion::V1_2),
            "1.3" | "TLS1.3" => Ok(TlsVersion::V1_3),
            other => Err(Error::new_config(format!(
                "unknown TLS version {:?}",
                other
            ))),
        }
    }
}

/// TLS termination options.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// PEM server certificate chain.
    pub cert_file: PathBuf,
    /// PEM private key.
    pub key_file: PathBuf,
    /// CA bundle used to verify client certificates.
    pub ca_file: Option<PathBuf>,
    /// Require a trusted client certificate; handshake fails without one.
    pub verify_client: bool,
    /// Minimum protocol version. Defaults to TLS 1.2.
    pub min_version: TlsVersion,
    /// Cipher-suite preference list by rustls suite name; empty means the
    /// provider defaults.
    pub cipher_list: Vec<String>,
}

impl TlsConfig {
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> TlsConfig {
        TlsConfig {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            ca_file: None,
            verify_client: false,
            min_version: TlsVersion::V1_2,
            cipher_list: Vec::new(),
        }
    }
}

/// HTTP/2 SETTINGS advertised by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H2Settings {
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Default for H2Settings {
    fn default() -> H2Settings {
        H2Settings {
            max_concurrent_streams: 100,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_header_list_size: 65_536,
        }
    }
}

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

/// Complete server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    host: Option<String>,
    port: Option<u16>,
    unix_socket: Option<PathBuf>,
    pub(crate) workers: usize,
    pub(crate) tls: Option<TlsConfig>,
    pub(crate) http2: bool,
    pub(crate) h2: H2Settings,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) heartbeat_timeout: Duration,
    pub(crate) max_body_size: u64,
    pub(crate) max_chunk_size: u64,
    pub(crate) lifespan: bool,
    pub(crate) root_path: String,
    pub(crate) tcp_nodelay: bool,
    pub(crate) ws_ping_interval: Option<Duration>,
    pub(crate) ws_ping_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: None,
            port: None,
            unix_socket: None,
            workers: 0,
            tls: None,
            http2: false,
            h2: H2Settings::default(),
            request_timeout: Some(Duration::from_secs(30)),
            idle_timeout: Some(Duration::from_secs(60)),
            shutdown_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            max_body_size: 16 * 1024 * 1024,
            max_chunk_size: 8 * 1024 * 1024,
            lifespan: true,
            root_path: String::new(),
            tcp_nodelay: true,
            ws_ping_interval: None,
            ws_ping_timeout: Duration::from_secs(20),
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// TCP host to bind. Mutually exclusive with [`Config::unix_socket`].
    pub fn host(mut self, host: impl Into<String>) -> Config {
        self.host = Some(host.into());
        self
    }

    /// TCP port to bind. Mutually exclusive with [`Config::unix_socket`].
    pub fn port(mut self, port: u16) -> Config {
        self.port = Some(port);
        self
    }

    /// Unix domain socket path to bind.
    pub fn unix_socket(mut self, path: impl Into<PathBuf>) -> Config {
        self.unix_socket = Some(path.into());
        self
    }

    /// Number of worker processes. `0` runs a single in-process worker.
    pub fn workers(mut self, n: usize) -> Config {
        self.workers = n;
        self
    }

    /// Enable TLS termination.
    pub fn tls(mut self, tls: TlsConfig) -> Config {
        self.tls = Some(tls);
        self
    }

    /// Enable HTTP/2 (ALPN over TLS, preface sniffing on cleartext).
    pub fn http2(mut self, enabled: bool) -> Config {
        self.http2 = enabled;
        self
    }

    /// Override advertised HTTP/2 SETTINGS.
    pub fn h2_settings(mut self, h2: H2Settings) -> Config {
        self.h2 = h2;
        self
    }

    /// Deadline for the app to produce `http.response.start`. `None` disables.
    pub fn request_timeout(mut self, t: Option<Duration>) -> Config {
        self.request_timeout = t;
        self
    }

    /// Keep-alive idle deadline between requests. `None` disables.
    pub fn idle_timeout(mut self, t: Option<Duration>) -> Config {
        self.idle_timeout = t;
        self
    }

    /// How long a worker may drain connections before it is killed.
    pub fn shutdown_timeout(mut self, t: Duration) -> Config {
        self.shutdown_timeout = t;
        self
    }

    /// Maximum worker heartbeat silence before respawn. Zero disables.
    pub fn heartbeat_timeout(mut self, t: Duration) -> Config {
        self.heartbeat_timeout = t;
        self
    }

    /// Hard cap on request body bytes; larger requests get 413.
    pub fn max_body_size(mut self, n: u64) -> Config {
        self.max_body_size = n;
        self
    }

    /// Hard cap on one chunked-encoding chunk; larger chunks get 413.
    pub fn max_chunk_size(mut self, n: u64) -> Config {
        self.max_chunk_size = n;
        self
    }

    /// Whether to drive `lifespan.startup`/`lifespan.shutdown`.
    pub fn lifespan(mut self, enabled: bool) -> Config {
        self.lifespan = enabled;
        self
    }

    /// Mount prefix exposed in every scope's `root_path`.
    pub fn root_path(mut self, p: impl Into<String>) -> Config {
        self.root_path = p.into();
        self
    }

    /// Set `TCP_NODELAY` on accepted connections. Default on.
    pub fn tcp_nodelay(mut self, enabled: bool) -> Config {
        self.tcp_nodelay = enabled;
        self
    }

    /// Periodic server-to-client WebSocket PING. `None` disables.
    pub fn ws_ping_interval(mut self, t: Option<Duration>) -> Config {
        self.ws_ping_interval = t;
        self
    }

    /// How long to wait for a PONG before closing 1011.
    pub fn ws_ping_timeout(mut self, t: Duration) -> Config {
        self.ws_ping_timeout = t;
        self
    }

    /// Whether cleartext HTTP/2 preface sniffing is active: HTTP/2 is
    /// requested and no TLS terminates the connection.
    pub(crate) fn h2c_enabled(&self) -> bool {
        self.http2 && self.tls.is_none()
    }

    /// Resolve and validate the listen endpoint.
    pub(crate) fn endpoint(&self) -> crate::Result<Endpoint> {
        match (&self.unix_socket, &self.host, &self.port) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(Error::new_config(
                "host/port and unix_socket are mutually exclusive",
            )),
            (Some(path), None, None) => Ok(Endpoint::Unix { path: path.clone() }),
            (None, host, port) => Ok(Endpoint::Tcp {
                host: host.clone().unwrap_or_else(|| "127.0.0.1".to_owned()),
                port: port.unwrap_or(8000),
            }),
        }
    }

    /// Serialize the worker-relevant subset into environment pairs for a
    /// re-exec'd worker process.
    pub(crate) fn to_env(&self) -> Vec<(&'static str, String)> {
        fn millis(d: &Duration) -> String {
            d.as_millis().to_string()
        }

        let mut vars = Vec::new();
        if let Some(ref host) = self.host {
            vars.push(("GANTRY_HOST", host.clone()));
        }
        if let Some(port) = self.port {
            vars.push(("GANTRY_PORT", port.to_string()));
        }
        if let Some(ref path) = self.unix_socket {
            vars.push(("GANTRY_UNIX_SOCKET", path.display().to_string()));
        }
        if let Some(ref tls) = self.tls {
            vars.push(("GANTRY_SSL_CERT_FILE", tls.cert_file.display().to_string()));
            vars.push(("GANTRY_SSL_KEY_FILE", tls.key_file.display().to_string()));
            if let Some(ref ca) = tls.ca_file {
                vars.push(("GANTRY_SSL_CA_FILE", ca.display().to_string()));
            }
            vars.push(("GANTRY_SSL_VERIFY_CLIENT", tls.verify_client.to_string()));
            vars.push(("GANTRY_SSL_MIN_VERSION", tls.min_version.as_str().to_owned()));
            if !tls.cipher_list.is_empty() {
                vars.push(("GANTRY_SSL_CIPHER_LIST", tls.cipher_list.join(",")));
            }
        }
        vars.push(("GANTRY_HTTP2", self.http2.to_string()));
        vars.push((
            "GANTRY_H2_MAX_CONCURRENT_STREAMS",
            self.h2.max_concurrent_streams.to_string(),
        ));
        vars.push((
            "GANTRY_H2_INITIAL_WINDOW_SIZE",
            self.h2.initial_window_size.to_string(),
        ));
        vars.push(("GANTRY_H2_MAX_FRAME_SIZE", self.h2.max_frame_size.to_string()));
        vars.push((
            "GANTRY_H2_MAX_HEADER_LIST_SIZE",
            self.h2.max_header_list_size.to_string(),
        ));
        // zero encodes "disabled" so workers do not fall back to defaults
        vars.push((
            "GANTRY_REQUEST_TIMEOUT",
            self.request_timeout
                .as_ref()
                .map(millis)
                .unwrap_or_else(|| "0".to_owned()),
        ));
        vars.push((
            "GANTRY_IDLE_TIMEOUT",
            self.idle_timeout
                .as_ref()
                .map(millis)
                .unwrap_or_else(|| "0".to_owned()),
        ));
        vars.push(("GANTRY_SHUTDOWN_TIMEOUT", millis(&self.shutdown_timeout)));
        vars.push(("GANTRY_HEARTBEAT_TIMEOUT", millis(&self.heartbeat_timeout)));
        vars.push(("GANTRY_MAX_BODY_SIZE", self.max_body_size.to_string()));
        vars.push(("GANTRY_MAX_CHUNK_SIZE", self.max_chunk_size.to_string()));
        vars.push(("GANTRY_LIFESPAN", self.lifespan.to_string()));
        if !self.root_path.is_empty() {
            vars.push(("GANTRY_ROOT_PATH", self.root_path.clone()));
        }
        vars.push(("GANTRY_TCP_NODELAY", self.tcp_nodelay.to_string()));
        if let Some(ref t) = self.ws_ping_interval {
            vars.push(("GANTRY_WS_PING_INTERVAL", millis(t)));
        }
        vars.push(("GANTRY_WS_PING_TIMEOUT", millis(&self.ws_ping_timeout)));
        vars
    }

    /// Rebuild a worker's configuration from the environment written by
    /// [`Config::to_env`]. Unset variables keep their defaults.
    pub(crate) fn from_env() -> crate::Result<Config> {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        fn parse<T: std::str::FromStr>(name: &str) -> crate::Result<Option<T>> {
            match var(name) {
                None => Ok(None),
                Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                    Error::new_config(format!("invalid value for {}: {:?}", name, raw))
                }),
            }
        }
        fn duration(name: &str) -> crate::Result<Option<Duration>> {
            Ok(parse::<u64>(name)?.map(Duration::from_millis))
        }

        let mut config = Config::default();
        config.host = var("GANTRY_HOST");
        config.port = parse("GANTRY_PORT")?;
        config.unix_socket = var("GANTRY_UNIX_SOCKET").map(PathBuf::from);

        if let (Some(cert), Some(key)) =
            (var("GANTRY_SSL_CERT_FILE"), var("GANTRY_SSL_KEY_FILE"))
        {
            let mut tls = TlsConfig::new(cert, key);
            tls.ca_file = var("GANTRY_SSL_CA_FILE").map(PathBuf::from);
            tls.verify_client = parse("GANTRY_SSL_VERIFY_CLIENT")?.unwrap_or(false);
            if let Some(v) = var("GANTRY_SSL_MIN_VERSION") {
                tls.min_version = TlsVersion::parse(&v)?;
            }
            if let Some(list) = var("GANTRY_SSL_CIPHER_LIST") {
                tls.cipher_list = list.split(',').map(str::to_owned).collect();
            }
            config.tls = Some(tls);
        }

        config.http2 = parse("GANTRY_HTTP2")?.unwrap_or(false);
        if let Some(n) = parse("GANTRY_H2_MAX_CONCURRENT_STREAMS")? {
            config.h2.max_concurrent_streams = n;
        }
        if let Some(n) = parse("GANTRY_H2_INITIAL_WINDOW_SIZE")? {
            config.h2.initial_window_size = n;
        }
        if let Some(n) = parse("GANTRY_H2_MAX_FRAME_SIZE")? {
            config.h2.max_frame_size = n;
        }
        if let Some(n) = parse("GANTRY_H2_MAX_HEADER_LIST_SIZE")? {
            config.h2.max_header_list_size = n;
        }
        if let Some(ms) = parse::<u64>("GANTRY_REQUEST_TIMEOUT")? {
            config.request_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = parse::<u64>("GANTRY_IDLE_TIMEOUT")? {
            config.idle_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(t) = duration("GANTRY_SHUTDOWN_TIMEOUT")? {
            config.shutdown_timeout = t;
        }
        if let Some(t) = duration("GANTRY_HEARTBEAT_TIMEOUT")? {
            config.heartbeat_timeout = t;
        }
        if let Some(n) = parse("GANTRY_MAX_BODY_SIZE")? {
            config.max_body_size = n;
        }
        if let Some(n) = parse("GANTRY_MAX_CHUNK_SIZE")? {
            config.max_chunk_size = n;
        }
        config.lifespan = parse("GANTRY_LIFESPAN")?.unwrap_or(true);
        config.root_path = var("GANTRY_ROOT_PATH").unwrap_or_default();
        config.tcp_nodelay = parse("GANTRY_TCP_NODELAY")?.unwrap_or(true);
        config.ws_ping_interval = duration("GANTRY_WS_PING_INTERVAL")?;
        if let Some(t) = duration("GANTRY_WS_PING_TIMEOUT")? {
            config.ws_ping_timeout = t;
        }
        Ok(config)
    }
}

//! The server entry point.

pub(crate) mod conn;
pub(crate) mod shared;
pub(crate) mod shutdown;
pub(crate) mod supervisor;
pub(crate) mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::app::Application;
use crate::config::Config;

/// A bound server, ready to serve an application.
///
/// `bind` resolves the configured endpoint and claims the listening
/// socket; in a worker process (re-executed by the supervisor) it adopts
/// the inherited descriptor instead and reads its configuration from the
/// environment. Must be called within a Tokio runtime.
///
/// ```no_run
/// use gantry::{Config, Server};
///
/// # async fn run() -> gantry::Result<()> {
/// let server = Server::bind(Config::new().port(8000).http2(true))?;
/// server.serve(my_app).await
/// # }
/// # use gantry::app::{Scope, Receiver, Sender};
/// # async fn my_app(_: Scope, _: Receiver, _: Sender) -> gantry::Result<()> { Ok(()) }
/// ```
pub struct Server {
    config: Config,
    listener: tcp::Listener,
    worker_mode: bool,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("worker_mode", &self.worker_mode)
            .finish()
    }
}

impl Server {
    /// Bind the endpoint described by `config` (or adopt the supervisor's
    /// socket when running as a worker).
    pub fn bind(config: Config) -> crate::Result<Server> {
        if supervisor::is_worker() {
            let config = Config::from_env()?;
            let endpoint = config.endpoint()?;
            let listener = tcp::Listener::from_inherited_fd(&endpoint)?;
            return Ok(Server {
                config,
                listener,
                worker_mode: true,
            });
        }
        let endpoint = config.endpoint()?;
        let listener = tcp::Listener::bind(&endpoint)?;
        info!("listening on {:?}", endpoint);
        Ok(Server {
            config,
            listener,
            worker_mode: false,
        })
    }

    /// The bound TCP address, if any. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve the application until shutdown.
    ///
    /// With `workers == 0` (or inside a worker process) this runs the
    /// accept loop inline; otherwise it becomes the supervisor and spawns
    /// `workers` child processes that re-execute the current binary.
    pub async fn serve<A>(self, app: A) -> crate::Result<()>
    where
        A: Application,
    {
        let app = Arc::new(app);
        if self.worker_mode {
            supervisor::run_worker(self.config, self.listener, app, true).await
        } else if self.config.workers == 0 {
            supervisor::run_worker(self.config, self.listener, app, false).await
        } else {
            supervisor::run_supervisor(self.config, self.listener).await
        }
    }
}

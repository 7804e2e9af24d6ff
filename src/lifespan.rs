//! Application startup/shutdown lifecycle and the worker-wide state.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::app::{
    Application, LifespanScope, ReceiveEvent, Scope, ScopeKind, SendEvent,
};

/// The process-wide (per worker) state handle.
///
/// A type-keyed map: the application stores whatever it builds during
/// `lifespan.startup` (connection pools, caches) and reads it back from any
/// scope's `state` field. Every scope in the same worker holds a clone of
/// the same handle; workers do not share state with each other.
#[derive(Clone, Default)]
pub struct State {
    inner: Arc<RwLock<http::Extensions>>,
}

impl State {
    pub fn new() -> State {
        State::default()
    }

    /// Store a value, replacing any previous value of the same type.
    pub fn insert<T: Clone + Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.write().insert(value)
    }

    /// Fetch a clone of the stored value of type `T`.
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.read().get::<T>().cloned()
    }

    /// Remove and return the stored value of type `T`.
    pub fn remove<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.write().remove::<T>()
    }

    /// Whether the two handles refer to the same underlying map.
    pub fn same(&self, other: &State) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, http::Extensions> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, http::Extensions> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State").finish()
    }
}

/// Drives the `lifespan` scope through the application, if enabled.
///
/// The driver owns the state handle for the whole worker; request scopes
/// borrow clones of it whether or not the lifespan protocol itself is
/// enabled.
pub(crate) struct Lifespan {
    state: State,
    enabled: bool,
    running: Option<Running>,
}

struct Running {
    ev_tx: mpsc::Sender<ReceiveEvent>,
    send_rx: mpsc::Receiver<SendEvent>,
    task: JoinHandle<crate::Result<()>>,
}

impl Lifespan {
    pub(crate) fn new(enabled: bool) -> Lifespan {
        Lifespan {
            state: State::new(),
            enabled,
            running: None,
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state.clone()
    }

    /// Runs `lifespan.startup` and waits for the application to complete it.
    /// Must finish before the worker accepts its first connection.
    pub(crate) async fn startup<A: Application>(&mut self, app: &Arc<A>) -> crate::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let (receiver, sender, ev_tx, mut send_rx) = crate::app::channel(ScopeKind::Lifespan);
        let scope = Scope::Lifespan(LifespanScope {
            state: self.state.clone(),
        });
        let app = app.clone();
        let task = tokio::spawn(async move { app.call(scope, receiver, sender).await });

        if ev_tx.send(ReceiveEvent::LifespanStartup).await.is_err() {
            return Err(crate::Error::new_lifespan(
                "application dropped the lifespan receiver before startup",
            ));
        }

        loop {
            match send_rx.recv().await {
                Some(SendEvent::StartupComplete) => {
                    debug!("lifespan startup complete");
                    self.running = Some(Running {
                        ev_tx,
                        send_rx,
                        task,
                    });
                    return Ok(());
                }
                Some(SendEvent::StartupFailed { message }) => {
                    return Err(crate::Error::new_lifespan(message));
                }
                Some(other) => {
                    warn!("ignoring unexpected lifespan event: {:?}", other);
                }
                None => {
                    return Err(crate::Error::new_lifespan(
                        "application returned before completing startup",
                    ));
                }
            }
        }
    }

    /// Runs `lifespan.shutdown`, bounded by `timeout`.
    pub(crate) async fn shutdown(&mut self, timeout: Duration) -> crate::Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.ev_tx.send(ReceiveEvent::LifespanShutdown).await;

        let wait = async {
            loop {
                match running.send_rx.recv().await {
                    Some(SendEvent::ShutdownComplete) => {
                        debug!("lifespan shutdown complete");
                        return Ok(());
                    }
                    Some(SendEvent::ShutdownFailed { message }) => {
                        return Err(crate::Error::new_lifespan(message));
                    }
                    Some(other) => {
                        warn!("ignoring unexpected lifespan event: {:?}", other);
                    }
                    None => return Ok(()),
                }
            }
        };
        let result = match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                running.task.abort();
                return Err(crate::Error::new_lifespan("shutdown timed out"));
            }
        };
        match running.task.await {
            Ok(Ok(())) | Ok(Err(_)) => result,
            Err(join) if join.is_panic() => {
                Err(crate::Error::new_lifespan("application panicked in lifespan"))
            }
            Err(_) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{Receiver, Sender};

    #[test]
    fn state_is_shared_across_clones() {
        let state = State::new();
        let alias = state.clone();
        state.insert(41u32);
        assert_eq!(alias.get::<u32>(), Some(41));
        assert!(state.same(&alias));
        assert!(!state.same(&State::new()));
    }

    async fn well_behaved(_scope: Scope, mut receive: Receiver, send: Sender) -> crate::Result<()> {
        loop {
            match receive.recv().await? {
                ReceiveEvent::LifespanStartup => {
                    send.send(SendEvent::StartupComplete).await?;
                }
                ReceiveEvent::LifespanShutdown => {
                    send.send(SendEvent::ShutdownComplete).await?;
                    return Ok(());
                }
                _ => unreachable!("lifespan scope only sees lifespan events"),
            }
        }
    }

    #[tokio::test]
    async fn drives_startup_then_shutdown() {
        let app = Arc::new(well_behaved);
        let mut lifespan = Lifespan::new(true);
        lifespan.startup(&app).await.unwrap();
        lifespan.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn startup_failure_is_fatal() {
        async fn failing(_scope: Scope, mut receive: Receiver, send: Sender) -> crate::Result<()> {
            let _ = receive.recv().await?;
            send.send(SendEvent::StartupFailed {
                message: "no database".into(),
            })
            .await
        }
        let app = Arc::new(failing);
        let mut lifespan = Lifespan::new(true);
        let err = lifespan.startup(&app).await.unwrap_err();
        assert!(err.to_string().contains("no database"));
    }

    #[tokio::test]
    async fn disabled_lifespan_never_calls_app() {
        async fn panicking(_: Scope, _: Receiver, _: Sender) -> crate::Result<()> {
            panic!("must not be invoked");
        }
        let app = Arc::new(panicking);
        let mut lifespan = Lifespan::new(false);
        lifespan.startup(&app).await.unwrap();
        lifespan.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}

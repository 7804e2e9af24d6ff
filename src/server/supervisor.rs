//! The multi-worker supervisor and the per-worker serve loop.
//!
//! The supervisor binds the listening socket, clears `FD_CLOEXEC`, and
//! re-executes the current binary once per worker with `GANTRY_WORKER=1`
//! and the configuration in the environment. Workers adopt the inherited
//! descriptor (the kernel serializes accepts) and never re-bind.
//!
//! Each worker's stdout pipe doubles as its heartbeat channel: one
//! newline per interval, timestamped by a supervisor-side reader task.
//! Worker logs belong on stderr, which is inherited.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::app::Application;
use crate::config::Config;
use crate::error::Error;
use crate::lifespan::Lifespan;
use crate::server::shared::Shared;
use crate::server::tcp::{Listener, LISTEN_FD_ENV};
use crate::server::{conn, shutdown};
use crate::tls::Terminator;

/// Environment marker identifying a spawned worker process.
pub(crate) const WORKER_ENV: &str = "GANTRY_WORKER";

pub(crate) fn is_worker() -> bool {
    std::env::var(WORKER_ENV).map(|v| v == "1").unwrap_or(false)
}

struct WorkerSlot {
    child: Child,
    /// Millis since `epoch` of the last heartbeat byte.
    last_beat: Arc<AtomicU64>,
}

/// Run the pre-fork supervisor until SIGTERM.
pub(crate) async fn run_supervisor(config: Config, listener: Listener) -> crate::Result<()> {
    let fd = listener.prepare_inherit()?;
    let exe = std::env::current_exe().map_err(Error::new_io)?;
    let env = config.to_env();
    let epoch = Instant::now();

    let mut workers = Vec::with_capacity(config.workers);
    for _ in 0..config.workers {
        workers.push(spawn_worker(&exe, &env, fd, epoch)?);
    }
    info!("supervisor running with {} workers", workers.len());

    let mut sigterm = signal(SignalKind::terminate()).map_err(Error::new_io)?;
    let mut sighup = signal(SignalKind::hangup()).map_err(Error::new_io)?;

    // The heartbeat check cadence is deliberately finer than the timeout
    // so one delayed tick cannot look like a dead worker.
    let heartbeat_timeout = config.heartbeat_timeout;
    let check_every = if heartbeat_timeout.is_zero() {
        Duration::from_secs(1)
    } else {
        std::cmp::max(Duration::from_secs(1), heartbeat_timeout / 4)
    };
    let mut ticker = tokio::time::interval(check_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM: shutting down workers");
                shutdown_workers(&mut workers, config.shutdown_timeout).await;
                // listener drops here, unlinking any unix socket file
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("SIGHUP: restarting worker generation");
                shutdown_workers(&mut workers, config.shutdown_timeout).await;
                for _ in 0..config.workers {
                    workers.push(spawn_worker(&exe, &env, fd, epoch)?);
                }
            }
            _ = ticker.tick() => {
                for slot in workers.iter_mut() {
                    match slot.child.try_wait() {
                        Ok(Some(status)) => {
                            warn!("worker exited ({}); respawning", status);
                            *slot = spawn_worker(&exe, &env, fd, epoch)?;
                            continue;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            debug!("try_wait failed: {}", err);
                            continue;
                        }
                    }
                    if heartbeat_timeout.is_zero() {
                        continue;
                    }
                    let beat_ms = slot.last_beat.load(Ordering::Relaxed);
                    let age = epoch
                        .elapsed()
                        .saturating_sub(Duration::from_millis(beat_ms));
                    if age > heartbeat_timeout {
                        error!(
                            "worker heartbeat silent for {:?}; killing",
                            age
                        );
                        // SIGKILL now; the exit is reaped and the slot
                        // respawned on the next tick.
                        let _ = slot.child.start_kill();
                    }
                }
            }
        }
    }
}

fn spawn_worker(
    exe: &std::path::Path,
    env: &[(&'static str, String)],
    fd: i32,
    epoch: Instant,
) -> crate::Result<WorkerSlot> {
    let mut cmd = Command::new(exe);
    cmd.env(WORKER_ENV, "1")
        .env(LISTEN_FD_ENV, fd.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped());
    for (key, value) in env {
        cmd.env(key, value);
    }
    let mut child = cmd.spawn().map_err(Error::new_io)?;

    let last_beat = Arc::new(AtomicU64::new(epoch.elapsed().as_millis() as u64));
    if let Some(mut stdout) = child.stdout.take() {
        let beat = last_beat.clone();
        tokio::spawn(async move {
            let mut scratch = [0u8; 64];
            loop {
                match stdout.read(&mut scratch).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => beat.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed),
                }
            }
        });
    }

    info!("spawned worker pid={:?}", child.id());
    Ok(WorkerSlot { child, last_beat })
}

/// Graceful shutdown with escalation: SIGTERM, wait out the drain
/// deadline, SIGKILL whatever is left.
async fn shutdown_workers(workers: &mut Vec<WorkerSlot>, deadline: Duration) {
    for slot in workers.iter() {
        if let Some(pid) = slot.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    let cutoff = Instant::now() + deadline;
    for slot in workers.iter_mut() {
        let remaining = cutoff.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, slot.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("worker ignored SIGTERM past the deadline; sending SIGKILL");
                let _ = slot.child.start_kill();
                let _ = slot.child.wait().await;
            }
        }
    }
    workers.clear();
}

/// The per-worker loop: lifespan startup, accept, drain, lifespan
/// shutdown. `heartbeat` is true for supervised workers (their stdout is
/// the heartbeat pipe) and false for the inline single-process mode.
pub(crate) async fn run_worker<A>(
    config: Config,
    listener: Listener,
    app: Arc<A>,
    heartbeat: bool,
) -> crate::Result<()>
where
    A: Application,
{
    let mut lifespan = Lifespan::new(config.lifespan);
    // Startup must complete before the first accept.
    lifespan.startup(&app).await?;

    let tls = match config.tls.as_ref() {
        Some(tls_config) => Some(Terminator::new(tls_config, config.http2)?),
        None => None,
    };
    let shared = Arc::new(Shared::new(app, lifespan.state(), &config));

    if heartbeat && !config.heartbeat_timeout.is_zero() {
        let interval = std::cmp::max(Duration::from_secs(1), config.heartbeat_timeout / 3);
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                if stdout.write_all(b"\n").await.is_err() {
                    return;
                }
                let _ = stdout.flush().await;
            }
        });
    }

    let (drain, watch) = shutdown::channel();
    let mut sigterm = signal(SignalKind::terminate()).map_err(Error::new_io)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(Error::new_io)?;

    info!("worker accepting connections");
    loop {
        tokio::select! {
            accepted = listener.accept(config.tcp_nodelay) => {
                match accepted {
                    Ok(accepted) => {
                        tokio::spawn(conn::handle(
                            accepted,
                            shared.clone(),
                            tls.clone(),
                            watch.clone(),
                        ));
                    }
                    Err(err) => {
                        error!("accept failed: {}", err);
                    }
                }
            }
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
    }

    info!("worker draining connections");
    drop(listener);
    drop(watch);
    if tokio::time::timeout(config.shutdown_timeout, drain.drain())
        .await
        .is_err()
    {
        warn!("drain deadline expired; abandoning remaining connections");
    }

    if let Err(err) = lifespan.shutdown(config.shutdown_timeout).await {
        warn!("lifespan shutdown failed: {}", err);
    }
    info!("worker exiting");
    Ok(())
}

//! Server lifecycle: `Created → Listening → ShuttingDown → Stopped`.
//!
//! [`TrickleServer::start`] binds the listener and spawns the accept loop,
//! returning a [`RunningServer`]. Stopping closes the listener, lets
//! in-flight responses finish for at most the grace period, then aborts
//! whatever is left. Dropping a `RunningServer` starts the same shutdown,
//! and the accept task marks the server `Stopped` on every exit path.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};

use trickle_core::{ConfigError, RateTracker, TrickleConfig};

use crate::connection::{shutdown_requested, ConnectionHandler};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Created => "created",
            ServerState::Listening => "listening",
            ServerState::ShuttingDown => "shutting-down",
            ServerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("document root {path} is not a usable directory: {source}")]
    DocumentRoot { path: PathBuf, source: io::Error },
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("accept loop terminated abnormally: {0}")]
    AcceptLoop(#[from] JoinError),
}

// ── TrickleServer ─────────────────────────────────────────────────────────────

/// A configured server that has not started listening yet.
pub struct TrickleServer {
    config: TrickleConfig,
    tracker: RateTracker,
    state: Arc<watch::Sender<ServerState>>,
}

impl TrickleServer {
    /// Validate `config` and create the server's shared rate tracker.
    pub fn new(config: TrickleConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let tracker = RateTracker::new(config.rate()?);
        let (state, _) = watch::channel(ServerState::Created);
        Ok(Self {
            config,
            tracker,
            state: Arc::new(state),
        })
    }

    pub fn config(&self) -> &TrickleConfig {
        &self.config
    }

    pub fn tracker(&self) -> &RateTracker {
        &self.tracker
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Bind the listener and start accepting connections in the background.
    pub async fn start(self) -> Result<RunningServer, ServerError> {
        let root = resolve_document_root(self.config.document_root())?;

        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(addr.as_str())
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let headroom = self.config.pacing_headroom()?;
        if headroom.exceeds_timeout() {
            tracing::warn!(
                max_write_bytes = headroom.max_write_bytes,
                max_write_delay_secs = headroom.max_write_delay.as_secs_f64(),
                socket_timeout_secs = headroom.socket_timeout.as_secs(),
                "a single paced write can outlast the socket timeout; lower serve.chunk_size or raise the rate"
            );
        }

        self.state.send_replace(ServerState::Listening);
        tracing::info!(
            addr = %local_addr,
            root = %root.display(),
            rate = %self.tracker.rate(),
            "server listening"
        );

        let handler = ConnectionHandler::new(
            self.tracker.clone(),
            crate::router(&root, self.config.serve.chunk_size),
            self.config.socket_timeout(),
            self.state.subscribe(),
        );
        let task = tokio::spawn(accept_loop(
            listener,
            handler,
            self.state.clone(),
            self.config.grace_period(),
        ));

        Ok(RunningServer {
            local_addr,
            document_root: root,
            tracker: self.tracker,
            state: self.state,
            task: Some(task),
        })
    }
}

fn resolve_document_root(path: PathBuf) -> Result<PathBuf, ServerError> {
    let resolved = std::fs::canonicalize(&path).map_err(|source| ServerError::DocumentRoot {
        path: path.clone(),
        source,
    })?;
    if !resolved.is_dir() {
        return Err(ServerError::DocumentRoot {
            path,
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
        });
    }
    Ok(resolved)
}

// ── RunningServer ─────────────────────────────────────────────────────────────

/// Handle to a listening server. Dropping it begins shutdown.
pub struct RunningServer {
    local_addr: SocketAddr,
    document_root: PathBuf,
    tracker: RateTracker,
    state: Arc<watch::Sender<ServerState>>,
    task: Option<JoinHandle<()>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn document_root(&self) -> &std::path::Path {
        &self.document_root
    }

    /// The tracker every connection of this server paces against.
    pub fn tracker(&self) -> &RateTracker {
        &self.tracker
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Stop accepting and ask in-flight connections to finish. Does not wait.
    pub fn shutdown(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ServerState::Listening {
                *state = ServerState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(addr = %self.local_addr, "server shutting down");
        }
    }

    /// Shut down and wait until the server is `Stopped`.
    pub async fn stop(mut self) -> Result<(), ServerError> {
        self.shutdown();
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }

    /// Wait until the server reaches `Stopped`, however it got there.
    pub async fn wait_stopped(&self) {
        let mut state = self.state.subscribe();
        if let Err(e) = state.wait_for(|s| *s == ServerState::Stopped).await {
            tracing::debug!(error = %e, state = %self.state(), "state channel closed before stop");
        };
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shutdown();
        }
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

/// Marks the server stopped when the accept task ends, including by panic
/// or abort.
struct StopOnExit(Arc<watch::Sender<ServerState>>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.send_replace(ServerState::Stopped);
        tracing::info!("server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: ConnectionHandler,
    state: Arc<watch::Sender<ServerState>>,
    grace: Duration,
) {
    let _stopped = StopOnExit(state.clone());
    let mut shutdown = state.subscribe();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,

            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "connection task panicked");
                    }
                }
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, active = connections.len() + 1, "accepted connection");
                    connections.spawn(handler.clone().serve(stream, peer));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    drop(listener);
    tracing::info!(
        in_flight = connections.len(),
        grace_ms = grace.as_millis() as u64,
        "listener closed, draining connections"
    );

    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            remaining = connections.len(),
            "grace period elapsed, closing remaining connections"
        );
        connections.shutdown().await;
    }
}

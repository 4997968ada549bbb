//! Per-connection adapter: installs the throttled writer in front of the
//! HTTP/1.1 engine and the static-file router.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpStream;
use tokio::sync::watch;

use trickle_core::RateTracker;

use crate::server::ServerState;
use crate::throttle::ThrottledStream;

/// Serves one accepted connection. Cheap to clone; every clone paces
/// against the same tracker.
#[derive(Clone)]
pub struct ConnectionHandler {
    tracker: RateTracker,
    router: Router,
    header_timeout: Duration,
    state: watch::Receiver<ServerState>,
}

impl ConnectionHandler {
    pub fn new(
        tracker: RateTracker,
        router: Router,
        header_timeout: Duration,
        state: watch::Receiver<ServerState>,
    ) -> Self {
        Self {
            tracker,
            router,
            header_timeout,
            state,
        }
    }

    /// Serve requests on `stream` until the peer closes it, an error ends
    /// it, or the server begins shutting down and the current response is
    /// done. Errors stay inside this connection.
    pub async fn serve(self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        self.tracker.touch();
        let io = TokioIo::new(ThrottledStream::new(stream, self.tracker.clone()));
        let service = TowerToHyperService::new(self.router.clone());

        // Queue body chunks instead of flattening them into one buffer, so
        // a paced write never exceeds one file chunk.
        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(self.header_timeout)
            .writev(true);

        let conn = builder.serve_connection(io, service);
        tokio::pin!(conn);

        let mut state = self.state;
        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = shutdown_requested(&mut state) => {
                tracing::debug!(%peer, "finishing in-flight response before shutdown");
                conn.as_mut().graceful_shutdown();
                conn.as_mut().await
            }
        };

        match result {
            Ok(()) => tracing::debug!(%peer, "connection closed"),
            Err(e) if e.is_incomplete_message() || e.is_canceled() => {
                tracing::debug!(%peer, error = %e, "connection dropped by peer")
            }
            Err(e) => tracing::warn!(%peer, error = %e, "connection failed"),
        }
    }
}

/// Resolves once the server has left the `Listening` state.
pub(crate) async fn shutdown_requested(state: &mut watch::Receiver<ServerState>) {
    loop {
        if *state.borrow_and_update() != ServerState::Listening {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

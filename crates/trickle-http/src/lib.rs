//! trickle-http — a static-file HTTP server whose responses are paced to a
//! shared byte rate.
//!
//! Every accepted socket is wrapped in a [`ThrottledStream`] bound to the
//! server's single [`RateTracker`](trickle_core::RateTracker) before the
//! HTTP/1.1 engine sees it, so headers and bodies alike are paced.

pub mod connection;
pub mod server;
pub mod throttle;

use std::path::Path;

use axum::Router;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub use connection::ConnectionHandler;
pub use server::{RunningServer, ServerError, ServerState, TrickleServer};
pub use throttle::ThrottledStream;

/// Static-file router for `root`, reading files `chunk_size` bytes at a time.
pub fn router(root: &Path, chunk_size: usize) -> Router {
    let files = ServeDir::new(root)
        .append_index_html_on_directories(true)
        .with_buf_chunk_size(chunk_size);

    Router::new()
        .fallback_service(files)
        .layer(TraceLayer::new_for_http())
}

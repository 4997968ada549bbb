//! trickle integration test harness.
//!
//! Every test starts its own in-process server on an OS-assigned port with
//! a temporary document root, and talks to it over real TCP with plain
//! HTTP/1.1 requests. Each test stops the server it started.

mod files;

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use trickle_core::TrickleConfig;
use trickle_http::{RunningServer, TrickleServer};

// ── Harness ───────────────────────────────────────────────────────────────────

/// A running server plus the directory it serves. Dropping it stops the server.
pub struct TestServer {
    pub running: RunningServer,
    pub root: TempDir,
}

impl TestServer {
    pub fn addr(&self) -> SocketAddr {
        self.running.local_addr()
    }
}

pub fn config_for(root: &Path, bytes_per_second: f64) -> TrickleConfig {
    let mut config = TrickleConfig::default();
    config.throttle.bytes_per_second = bytes_per_second;
    config.network.port = 0;
    config.serve.document_root = root.to_path_buf();
    config.shutdown.grace_period_ms = 500;
    config
}

/// Write `files` under a fresh temp dir and serve it at `bytes_per_second`.
pub async fn start_server(bytes_per_second: f64, files: &[(&str, &[u8])]) -> Result<TestServer> {
    start_server_with(bytes_per_second, files, |_| {}).await
}

pub async fn start_server_with(
    bytes_per_second: f64,
    files: &[(&str, &[u8])],
    tweak: impl FnOnce(&mut TrickleConfig),
) -> Result<TestServer> {
    let root = tempfile::tempdir().context("failed to create document root")?;
    for (name, contents) in files {
        let path = root.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents).with_context(|| format!("failed to write {name}"))?;
    }

    let mut config = config_for(root.path(), bytes_per_second);
    tweak(&mut config);
    let running = TrickleServer::new(config)?.start().await?;
    Ok(TestServer { running, root })
}

pub struct Response {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
    pub elapsed: Duration,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }
}

/// Issue a `GET` with `Connection: close` and read the whole response.
pub async fn http_get(addr: SocketAddr, path: &str) -> Result<Response> {
    let start = Instant::now();
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;

    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    let elapsed = start.elapsed();

    let Some(split) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
        bail!("response has no header terminator: {:?}", String::from_utf8_lossy(&raw));
    };
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let body = raw[split + 4..].to_vec();

    let status = head
        .split_whitespace()
        .nth(1)
        .context("missing status code")?
        .parse()
        .context("status code is not a number")?;

    Ok(Response {
        status,
        head,
        body,
        elapsed,
    })
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

//! trickled — serve the current directory over HTTP at a fixed byte rate.
//!
//! Usage: trickled <bytes-per-second>

use anyhow::{Context, Result};

use trickle_core::{RateLimit, TrickleConfig};
use trickle_http::TrickleServer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let Some(rate_arg) = std::env::args().nth(1) else {
        eprintln!("Need the bytes per-second you want to serve at as an integer.");
        std::process::exit(2);
    };
    let rate = RateLimit::parse_arg(&rate_arg).context("invalid bytes-per-second argument")?;

    let mut config = TrickleConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        let mut config = TrickleConfig::default();
        config.apply_env_overrides(std::env::vars());
        config
    });
    config.throttle.bytes_per_second = rate.bytes_per_second();

    let server = TrickleServer::new(config).context("invalid configuration")?;
    let running = server.start().await.context("failed to start server")?;

    println!(
        "Serving {} at {} bytes per-second",
        running.document_root().display(),
        group_thousands(rate.bytes_per_second() as u64)
    );
    println!("Server is reachable at {}", running.url());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    running.stop().await.context("server did not stop cleanly")?;
    Ok(())
}

/// 1234567 → "1,234,567"
fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

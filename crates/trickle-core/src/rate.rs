//! Server-wide byte pacing.
//!
//! A single [`RateTracker`] is shared by every connection a server accepts,
//! so the configured rate is an aggregate cap rather than a per-connection
//! one. Each write asks the tracker how long it must wait before its bytes
//! may go out; the tracker records the bytes and moves its checkpoint to the
//! instant that write is released.
//!
//! The checkpoint is reset on every write. Pacing therefore follows the
//! instantaneous rate since the previous write, not a long-run average:
//! it reacts quickly to bursts, and idle time between writes is credited
//! to the next one. Many tiny writes in quick succession make the estimate
//! noisy.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ConfigError;

// ── RateLimit ─────────────────────────────────────────────────────────────────

/// Target throughput in bytes per second. Always finite and positive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit(f64);

impl RateLimit {
    pub fn new(bytes_per_second: f64) -> Result<Self, ConfigError> {
        if bytes_per_second.is_finite() && bytes_per_second > 0.0 {
            Ok(Self(bytes_per_second))
        } else {
            Err(ConfigError::InvalidRate(bytes_per_second))
        }
    }

    /// Parse a command-line rate: a positive integer number of bytes per second.
    pub fn parse_arg(text: &str) -> Result<Self, ConfigError> {
        let value: u64 = text
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidRateText(text.to_string()))?;
        Self::new(value as f64)
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.0
    }

    /// Time needed to send `bytes` at this rate.
    pub fn duration_for(&self, bytes: u64) -> Duration {
        clamp_secs(bytes as f64 / self.0)
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} B/s", self.0)
    }
}

// ── RateTracker ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct TrackerState {
    cumulative_bytes: u64,
    checkpoint_bytes: u64,
    checkpoint_time: Instant,
    rate: RateLimit,
}

/// Point-in-time copy of the tracker counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerSnapshot {
    pub cumulative_bytes: u64,
    pub checkpoint_bytes: u64,
    pub checkpoint_time: Instant,
    pub rate: RateLimit,
}

/// Shared, lock-protected pacing state. Clones share the same budget.
#[derive(Debug, Clone)]
pub struct RateTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl RateTracker {
    pub fn new(rate: RateLimit) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState {
                cumulative_bytes: 0,
                checkpoint_bytes: 0,
                checkpoint_time: Instant::now(),
                rate,
            })),
        }
    }

    /// Record `n_bytes` about to be written and return how long the caller
    /// must wait before writing them.
    ///
    /// The lock is released before this returns; callers sleep without
    /// holding it. A zero-byte write never waits and leaves the state
    /// untouched.
    pub fn record(&self, n_bytes: usize) -> Duration {
        if n_bytes == 0 {
            return Duration::ZERO;
        }

        let now = Instant::now();
        let mut state = self.lock();

        state.cumulative_bytes = state.cumulative_bytes.saturating_add(n_bytes as u64);
        let bytes_since = state.cumulative_bytes - state.checkpoint_bytes;

        // Negative when another writer's release time is still ahead of us:
        // that outstanding debt is added to our own wait.
        let elapsed = signed_secs_since(state.checkpoint_time, now);
        let delay = clamp_secs(bytes_since as f64 / state.rate.bytes_per_second() - elapsed);

        let released_at = now.checked_add(delay).unwrap_or(now);
        state.checkpoint_bytes = state.cumulative_bytes;
        if released_at > state.checkpoint_time {
            state.checkpoint_time = released_at;
        }

        tracing::trace!(
            n_bytes,
            cumulative = state.cumulative_bytes,
            elapsed_secs = elapsed,
            delay_ms = delay.as_millis() as u64,
            "pacing write"
        );

        delay
    }

    /// Restart the checkpoint clock at `now` if it lies in the past.
    ///
    /// Called when a connection is accepted so a response following an
    /// idle period is paced from its own start. Pending debt from writers
    /// still sleeping is kept.
    pub fn touch(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        if now > state.checkpoint_time {
            state.checkpoint_time = now;
            state.checkpoint_bytes = state.cumulative_bytes;
        }
    }

    /// Replace the target rate. Applies to subsequent writes only.
    pub fn set_rate(&self, rate: RateLimit) {
        let mut state = self.lock();
        tracing::info!(old = %state.rate, new = %rate, "rate limit changed");
        state.rate = rate;
    }

    pub fn rate(&self) -> RateLimit {
        self.lock().rate
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let state = self.lock();
        TrackerSnapshot {
            cumulative_bytes: state.cumulative_bytes,
            checkpoint_bytes: state.checkpoint_bytes,
            checkpoint_time: state.checkpoint_time,
            rate: state.rate,
        }
    }

    // Counter updates cannot leave the state half-written, so a poisoned
    // lock is still usable.
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn signed_secs_since(checkpoint: Instant, now: Instant) -> f64 {
    if now >= checkpoint {
        (now - checkpoint).as_secs_f64()
    } else {
        -(checkpoint - now).as_secs_f64()
    }
}

fn clamp_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

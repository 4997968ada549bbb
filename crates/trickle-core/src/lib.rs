//! trickle-core — rate accounting and configuration shared by the
//! throttled server and its binary.

pub mod config;
pub mod rate;

pub use config::{ConfigError, TrickleConfig};
pub use rate::{RateLimit, RateTracker, TrackerSnapshot};

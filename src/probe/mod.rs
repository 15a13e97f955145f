//! Probe module: single-shot ping and traceroute against one IP.
//!
//! Probes invoke the platform tools as subprocesses and parse their output.

mod ping;
mod traceroute;

pub use ping::*;
pub use traceroute::*;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Probe error types. Ping never surfaces these to its caller; traceroute
/// does, because the API reports tool problems as service errors.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe tool is not available: {0}")]
    ToolUnavailable(String),
    #[error("probe timed out after {0}s")]
    ToolTimeout(u64),
    #[error("command failed: {0}")]
    Command(String),
}

/// Outcome of a single ping. A lost packet carries neither latency nor hops.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub latency_ms: Option<f64>,
    pub hops: Option<i64>,
    pub packet_loss: bool,
}

impl ProbeResult {
    pub fn success(latency_ms: f64, hops: i64) -> Self {
        Self {
            latency_ms: Some(latency_ms),
            hops: Some(hops),
            packet_loss: false,
        }
    }

    pub fn loss() -> Self {
        Self {
            latency_ms: None,
            hops: None,
            packet_loss: true,
        }
    }
}

/// One parsed traceroute hop. Intermediate timeouts keep `is_timeout = true`
/// with null host/ip/rtt; the raw line is preserved for display.
#[derive(Debug, Clone, Serialize)]
pub struct TraceHop {
    pub hop: i64,
    pub host: Option<String>,
    pub ip: Option<String>,
    pub rtt_ms: Option<f64>,
    pub is_timeout: bool,
    pub raw: String,
}

/// A full traceroute run.
#[derive(Debug, Clone, Serialize)]
pub struct TraceResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub hops: Vec<TraceHop>,
}

//! Single-echo ping via the system tool.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use super::ProbeResult;

/// Run one ping against `ip` and translate the outcome into a probe result.
///
/// Transport failures are data, not errors: a timeout, a non-zero exit, a
/// spawn failure, or unparseable output all come back as packet loss. The
/// child is killed when `timeout` elapses rather than trusting the tool's
/// own deadline flags.
pub async fn ping(ip: &str, timeout: Duration) -> ProbeResult {
    let timeout_secs = timeout.as_secs().max(1);

    let mut cmd = Command::new("ping");
    if cfg!(windows) {
        cmd.args(["-n", "1", "-w", &(timeout_secs * 1000).to_string(), ip]);
    } else {
        cmd.args(["-c", "1", "-W", &timeout_secs.to_string(), ip]);
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("ping spawn failed for {}: {}", ip, e);
            return ProbeResult::loss();
        }
    };

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            tracing::warn!("ping wait failed for {}: {}", ip, e);
            return ProbeResult::loss();
        }
        // Timeout: the child is killed via kill_on_drop.
        Err(_) => return ProbeResult::loss(),
    };

    if !output.status.success() {
        return ProbeResult::loss();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ping_output(&stdout).unwrap_or_else(ProbeResult::loss)
}

/// Parse latency (`time=X ms`) and observed TTL (`ttl=N`) out of ping output.
///
/// Handles the Linux, macOS, and Windows dialects: `time=12.3 ms`,
/// `time<1ms`, `ttl=57` / `TTL=57`.
fn parse_ping_output(output: &str) -> Option<ProbeResult> {
    static TIME_RE: OnceLock<Regex> = OnceLock::new();
    static TTL_RE: OnceLock<Regex> = OnceLock::new();

    let time_re = TIME_RE.get_or_init(|| {
        Regex::new(r"(?i)time[=<]\s*(?P<val>[0-9]+(?:\.[0-9]+)?)\s*ms").unwrap()
    });
    let ttl_re = TTL_RE.get_or_init(|| Regex::new(r"(?i)ttl[=:]?\s*(?P<ttl>[0-9]+)").unwrap());

    let latency_ms: f64 = time_re.captures(output)?.name("val")?.as_str().parse().ok()?;
    let hops: i64 = ttl_re
        .captures(output)
        .and_then(|c| c.name("ttl"))
        .and_then(|m| m.as_str().parse().ok())?;

    Some(ProbeResult::success(latency_ms, hops))
}

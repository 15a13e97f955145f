//! On-demand traceroute via the system tool.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::process::Command;

use super::{ProbeError, TraceHop, TraceResult};

/// Run a traceroute against `ip` with the given hop cap and overall timeout.
///
/// The child is killed when `timeout` elapses. A missing binary is
/// `ToolUnavailable`; hop-level timeouts are data (`is_timeout` rows),
/// not errors.
pub async fn traceroute(
    binary: &str,
    ip: &str,
    max_hops: u32,
    timeout: Duration,
) -> Result<TraceResult, ProbeError> {
    let started_at = Utc::now();

    let mut cmd = Command::new(binary);
    if cfg!(windows) {
        cmd.args(["-h", &max_hops.to_string(), "-w", "1000", ip]);
    } else {
        cmd.args(["-m", &max_hops.to_string(), "-q", "1", ip]);
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProbeError::ToolUnavailable(binary.to_string())
        } else {
            ProbeError::Command(format!("failed to spawn {}: {}", binary, e))
        }
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => return Err(ProbeError::Command(format!("{} failed: {}", binary, e))),
        // Dropping the future kills the child.
        Err(_) => return Err(ProbeError::ToolTimeout(timeout.as_secs())),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::Command(format!(
            "{} exited with {}: {}",
            binary,
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let hops = parse_trace_output(&stdout);

    let finished_at = Utc::now();
    Ok(TraceResult {
        started_at,
        finished_at,
        duration_ms: finished_at
            .signed_duration_since(started_at)
            .num_milliseconds(),
        hops,
    })
}

/// Parse every hop line of a traceroute/tracert transcript.
pub fn parse_trace_output(output: &str) -> Vec<TraceHop> {
    output.lines().filter_map(parse_trace_line).collect()
}

/// Parse one hop line in either the Linux or Windows dialect.
///
/// Linux:   ` 2  _gateway (192.168.1.1)  0.419 ms`
/// Windows: `  2    12 ms    11 ms    13 ms  core-rtr [96.110.46.1]`
/// Timeout: ` 3  * * *` / `  3     *        *        *     Request timed out.`
fn parse_trace_line(line: &str) -> Option<TraceHop> {
    static RTT_RE: OnceLock<Regex> = OnceLock::new();
    static ADDR_RE: OnceLock<Regex> = OnceLock::new();

    let rtt_re =
        RTT_RE.get_or_init(|| Regex::new(r"<?\s*(?P<rtt>[0-9]+(?:\.[0-9]+)?)\s*ms").unwrap());
    let addr_re =
        ADDR_RE.get_or_init(|| Regex::new(r"[(\[](?P<addr>[0-9a-fA-F:.]+)[)\]]").unwrap());

    let trimmed = line.trim();
    let mut tokens = trimmed.split_whitespace();
    let hop: i64 = tokens.next()?.parse().ok()?;
    let rest_tokens: Vec<&str> = tokens.collect();
    if rest_tokens.is_empty() {
        return None;
    }
    let rest = rest_tokens.join(" ");

    let rtt_ms: Option<f64> = rtt_re
        .captures(&rest)
        .and_then(|c| c.name("rtt"))
        .and_then(|m| m.as_str().parse().ok());

    if rtt_ms.is_none() {
        // No reply for this TTL. Still a row, not a failure.
        return Some(TraceHop {
            hop,
            host: None,
            ip: None,
            rtt_ms: None,
            is_timeout: true,
            raw: trimmed.to_string(),
        });
    }

    let ip = addr_re
        .captures(&rest)
        .and_then(|c| c.name("addr"))
        .map(|m| m.as_str().to_string())
        .or_else(|| {
            rest_tokens
                .iter()
                .find(|t| t.parse::<IpAddr>().is_ok())
                .map(|t| t.to_string())
        });

    let host = rest_tokens
        .iter()
        .find(|t| {
            !t.starts_with('*')
                && !t.starts_with('(')
                && !t.starts_with('[')
                && !t.starts_with('<')
                && **t != "ms"
                && t.parse::<f64>().is_err()
        })
        .map(|t| t.to_string());

    Some(TraceHop {
        hop,
        host,
        ip,
        rtt_ms,
        is_timeout: false,
        raw: trimmed.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_linux_hop_with_hostname() {
        let hops = parse_trace_output(
            "traceroute to google.com (142.250.80.46), 30 hops max, 60 byte packets\n \
             1  _gateway (192.168.1.1)  0.419 ms\n",
        );
        assert_eq!(hops.len(), 1);
        let hop = &hops[0];
        assert_eq!(hop.hop, 1);
        assert_eq!(hop.host.as_deref(), Some("_gateway"));
        assert_eq!(hop.ip.as_deref(), Some("192.168.1.1"));
        assert_eq!(hop.rtt_ms, Some(0.419));
        assert!(!hop.is_timeout);
    }

    #[test]
    fn test_parse_linux_timeout_hop() {
        let hops = parse_trace_output(" 3  * * *\n");
        assert_eq!(hops.len(), 1);
        let hop = &hops[0];
        assert_eq!(hop.hop, 3);
        assert!(hop.is_timeout);
        assert!(hop.host.is_none());
        assert!(hop.ip.is_none());
        assert!(hop.rtt_ms.is_none());
        assert_eq!(hop.raw, "3  * * *");
    }

    #[test]
    fn test_parse_linux_bare_ip_hop() {
        let hops = parse_trace_output(" 4  96.120.96.45 (96.120.96.45)  12.543 ms\n");
        let hop = &hops[0];
        assert_eq!(hop.host.as_deref(), Some("96.120.96.45"));
        assert_eq!(hop.ip.as_deref(), Some("96.120.96.45"));
        assert_eq!(hop.rtt_ms, Some(12.543));
    }

    #[test]
    fn test_parse_ipv6_hop() {
        let hops = parse_trace_output(" 2  2001:db8::1 (2001:db8::1)  1.201 ms\n");
        let hop = &hops[0];
        assert_eq!(hop.ip.as_deref(), Some("2001:db8::1"));
    }

    #[test]
    fn test_parse_windows_hop() {
        let hops = parse_trace_output("  1    <1 ms    <1 ms    <1 ms  192.168.1.1\n");
        assert_eq!(hops.len(), 1);
        let hop = &hops[0];
        assert_eq!(hop.hop, 1);
        assert_eq!(hop.rtt_ms, Some(1.0));
        assert_eq!(hop.ip.as_deref(), Some("192.168.1.1"));
    }

    #[test]
    fn test_parse_windows_named_hop() {
        let hops = parse_trace_output("  3    12 ms    11 ms    13 ms  core-rtr [96.110.46.1]\n");
        let hop = &hops[0];
        assert_eq!(hop.host.as_deref(), Some("core-rtr"));
        assert_eq!(hop.ip.as_deref(), Some("96.110.46.1"));
        assert_eq!(hop.rtt_ms, Some(12.0));
    }

    #[test]
    fn test_parse_windows_timeout_hop() {
        let hops = parse_trace_output("  2     *        *        *     Request timed out.\n");
        let hop = &hops[0];
        assert!(hop.is_timeout);
        assert!(hop.host.is_none());
    }

    #[test]
    fn test_header_lines_skipped() {
        let hops = parse_trace_output(
            "Tracing route to google.com [142.250.80.46]\nover a maximum of 30 hops:\n\n",
        );
        assert!(hops.is_empty());
    }
}

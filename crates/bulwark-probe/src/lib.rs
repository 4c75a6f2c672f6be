//! Post-recreate verification. `ProbeConfig` is a tagged union, not
//! a trait hierarchy — dispatch is a single `match`. When a service names
//! more than one probe, they run concurrently with fail-fast semantics:
//! the first failure cancels the others, and the engine still reports
//! every result it collected.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bulwark_config::ProbeDefaults;
use bulwark_retry::{Cancellation, RetryConfig, retry_with};
use bulwark_runtime::{HealthStatus, RuntimeDriver};
use bulwark_types::{ProbeConfig, ProbeKind, ProbeResult};
use chrono::Utc;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::redirect::Policy;

pub struct ProbeEngine {
    http: Client,
}

impl ProbeEngine {
    pub fn new() -> anyhow::Result<Self> {
        let http = Client::builder()
            .redirect(Policy::limited(10))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build probe HTTP client: {e}"))?;
        Ok(Self { http })
    }

    /// Runs a single probe to completion (including its own retry
    /// discipline), honoring `cancel`.
    pub fn run_probe(
        &self,
        probe: &ProbeConfig,
        runtime: &dyn RuntimeDriver,
        container_id: &str,
        defaults: &ProbeDefaults,
        cancel: &Cancellation,
    ) -> ProbeResult {
        let kind = ProbeKind::from(probe);
        let start = Instant::now();

        if let Some(message) = misconfigured(probe) {
            return ProbeResult {
                kind,
                success: false,
                message: Some(message),
                attempts: 0,
                elapsed: start.elapsed(),
            };
        }

        let retry_cfg = RetryConfig::probe(defaults.retries.max(1), defaults.retry_backoff);
        let mut attempts = 0u32;
        let result = retry_with(&retry_cfg, cancel, |attempt| {
            attempts = attempt;
            run_attempt(probe, runtime, container_id, defaults.timeout, cancel)
        });

        ProbeResult {
            kind,
            success: result.is_ok(),
            message: result.err(),
            attempts,
            elapsed: start.elapsed(),
        }
    }

    /// Runs a service's configured probe set concurrently. On the first
    /// failure, the remaining probes' shared cancellation token is
    /// cancelled so they abort promptly (fail-fast); every probe's result
    /// is still reported.
    pub fn run_probes(
        &self,
        probes: &[ProbeConfig],
        runtime: &dyn RuntimeDriver,
        container_id: &str,
        defaults: &ProbeDefaults,
        cancel: &Cancellation,
    ) -> Vec<ProbeResult> {
        if probes.is_empty() {
            return Vec::new();
        }
        let shared_cancel = cancel.clone();

        std::thread::scope(|scope| {
            let handles: Vec<_> = probes
                .iter()
                .map(|probe| {
                    let shared_cancel = shared_cancel.clone();
                    scope.spawn(move || {
                        let result = self.run_probe(probe, runtime, container_id, defaults, &shared_cancel);
                        if !result.success {
                            shared_cancel.cancel();
                        }
                        result
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("probe thread panicked")).collect()
        })
    }
}

/// `true` iff `results` is empty or every result succeeded.
pub fn all_passed(results: &[ProbeResult]) -> bool {
    results.iter().all(|r| r.success)
}

fn misconfigured(probe: &ProbeConfig) -> Option<String> {
    match probe {
        ProbeConfig::Http { url, .. } if url.trim().is_empty() => {
            Some("http probe has no url configured".to_string())
        }
        ProbeConfig::Tcp { host, .. } if host.trim().is_empty() => {
            Some("tcp probe has no host configured".to_string())
        }
        ProbeConfig::Log { pattern, .. } if pattern.trim().is_empty() => {
            Some("log probe has no pattern configured".to_string())
        }
        ProbeConfig::Log { pattern, .. } => match Regex::new(pattern) {
            Ok(_) => None,
            Err(_) => Some("invalid regex pattern".to_string()),
        },
        _ => None,
    }
}

fn run_attempt(
    probe: &ProbeConfig,
    runtime: &dyn RuntimeDriver,
    container_id: &str,
    timeout: Duration,
    cancel: &Cancellation,
) -> Result<(), String> {
    if cancel.is_cancelled() {
        return Err("cancelled".to_string());
    }
    match probe {
        ProbeConfig::None => Ok(()),
        ProbeConfig::Docker => run_docker_probe(runtime, container_id, cancel),
        ProbeConfig::Http { url, expect_status } => {
            run_http_probe(&build_timed_client(timeout), url, *expect_status)
        }
        ProbeConfig::Tcp { host, port } => run_tcp_probe(host, *port, timeout),
        ProbeConfig::Log { pattern, window_sec } => {
            run_log_probe(runtime, container_id, pattern, *window_sec)
        }
        ProbeConfig::Stability { duration_sec } => run_stability_probe(*duration_sec, cancel),
    }
}

fn build_timed_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .redirect(Policy::limited(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn run_docker_probe(runtime: &dyn RuntimeDriver, container_id: &str, cancel: &Cancellation) -> Result<(), String> {
    let inspect = runtime
        .inspect_container(container_id, cancel)
        .map_err(|e| format!("docker probe inspect failed: {e}"))?;
    if !inspect.running {
        return Err("container is not running".to_string());
    }
    match inspect.health {
        HealthStatus::NoHealthcheck | HealthStatus::Healthy => Ok(()),
        HealthStatus::Starting => Err("health check still starting".to_string()),
        HealthStatus::Unhealthy => Err("container reported unhealthy".to_string()),
    }
}

fn run_http_probe(client: &Client, url: &str, expect_status: u16) -> Result<(), String> {
    let resp = client.get(url).send().map_err(|e| format!("http probe request failed: {e}"))?;
    let status = resp.status().as_u16();
    if status == expect_status {
        Ok(())
    } else {
        Err(format!("http probe got status {status}, expected {expect_status}"))
    }
}

fn run_tcp_probe(host: &str, port: u16, timeout: Duration) -> Result<(), String> {
    let addr: SocketAddr = (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("tcp probe could not resolve {host}:{port}: {e}"))?
        .next()
        .ok_or_else(|| format!("tcp probe found no addresses for {host}:{port}"))?;
    TcpStream::connect_timeout(&addr, timeout)
        .map(|_| ())
        .map_err(|e| format!("tcp probe dial failed: {e}"))
}

/// `tail ~500 lines` from the ~`window_sec`-wide window, stripped of any
/// multiplexed 8-byte docker log frame headers (a no-op if the runtime
/// driver already demultiplexed).
fn run_log_probe(
    runtime: &dyn RuntimeDriver,
    container_id: &str,
    pattern: &str,
    window_sec: u64,
) -> Result<(), String> {
    let regex = Regex::new(pattern).map_err(|_| "invalid regex pattern".to_string())?;
    let since = Utc::now() - chrono::Duration::seconds(window_sec as i64);
    let raw = runtime
        .container_logs_since(container_id, since, 500)
        .map_err(|e| format!("log probe fetch failed: {e}"))?;
    let demuxed = demux_docker_logs(&raw);
    let text = String::from_utf8_lossy(&demuxed);
    if text.lines().any(|line| regex.is_match(line)) {
        Ok(())
    } else {
        Err(format!("log probe pattern {pattern:?} matched no lines in window"))
    }
}

fn demux_docker_logs(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0usize;
    while i + 8 <= raw.len() {
        let stream_type = raw[i];
        let reserved_ok = raw[i + 1] == 0 && raw[i + 2] == 0 && raw[i + 3] == 0;
        if stream_type > 2 || !reserved_ok {
            out.extend_from_slice(&raw[i..]);
            return out;
        }
        let size = u32::from_be_bytes([raw[i + 4], raw[i + 5], raw[i + 6], raw[i + 7]]) as usize;
        let start = i + 8;
        let end = (start + size).min(raw.len());
        out.extend_from_slice(&raw[start..end]);
        i = end;
    }
    if i < raw.len() {
        out.extend_from_slice(&raw[i..]);
    }
    out
}

fn run_stability_probe(duration_sec: u64, cancel: &Cancellation) -> Result<(), String> {
    let deadline = Instant::now() + Duration::from_secs(duration_sec);
    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            return Err("stability wait cancelled".to_string());
        }
        std::thread::sleep(Duration::from_millis(20).min(deadline.saturating_duration_since(Instant::now())));
    }
    if cancel.is_cancelled() {
        return Err("stability wait cancelled".to_string());
    }
    Ok(())
}

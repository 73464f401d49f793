use std::{
    net::{IpAddr, SocketAddr},
    ops::Range,
    time::{Duration, Instant},
};

use anyhow::Context;
use tokio::{net::TcpStream, task::JoinSet, time};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_WORKERS: usize = 8;
/// Exclusive end of the TCP port space.
pub const PORT_RANGE_END: u32 = 1 << 16;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub timeout: Duration,
    pub workers: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Split `[from, to)` into at most `workers` contiguous, non-empty ranges that
/// together cover every port exactly once. The remainder goes to the first
/// ranges. `to` is clamped to [`PORT_RANGE_END`].
pub fn partition(from: u32, to: u32, workers: usize) -> Vec<Range<u32>> {
    let to = to.min(PORT_RANGE_END);
    if from >= to {
        return Vec::new();
    }
    let total = (to - from) as usize;
    let workers = workers.clamp(1, total);
    let base = total / workers;
    let extra = total % workers;

    let mut out = Vec::with_capacity(workers);
    let mut start = from;
    for i in 0..workers {
        let len = base + usize::from(i < extra);
        // len >= 1 and the sum of lens is `total`, so this never passes `to`.
        let end = start + len as u32;
        out.push(start..end);
        start = end;
    }
    out
}

/// Connect-and-close. Any failure, timeout included, counts as closed.
pub async fn probe(addr: SocketAddr, timeout: Duration) -> bool {
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(conn)) => {
            drop(conn);
            true
        }
        Ok(Err(_)) | Err(_) => false,
    }
}

/// Probe every port in `[from, to)` on `host` and return the ones that
/// accepted a connection. Order is unspecified.
pub async fn scan(host: &str, from: u16, to: u32, opts: &ScanOptions) -> anyhow::Result<Vec<u16>> {
    let ip = resolve_host(host).await?;
    let ranges = partition(u32::from(from), to, opts.workers);

    tracing::info!(
        host = %host,
        ip = %ip,
        from,
        to,
        workers = ranges.len(),
        timeout = %humantime::format_duration(opts.timeout),
        "scan: starting"
    );
    let started = Instant::now();

    let mut tasks = JoinSet::new();
    for range in ranges {
        let timeout = opts.timeout;
        let host = host.to_string();
        tasks.spawn(async move {
            let mut open = Vec::new();
            for port in range.filter_map(|p| u16::try_from(p).ok()) {
                if probe(SocketAddr::new(ip, port), timeout).await {
                    tracing::info!(host = %host, port, "scan: found open port");
                    open.push(port);
                }
            }
            open
        });
    }

    // Each worker owns its result; merge only after it has finished.
    let mut ports = Vec::new();
    while let Some(res) = tasks.join_next().await {
        ports.extend(res.context("scan: worker failed")?);
    }

    tracing::info!(
        host = %host,
        open = ports.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "scan: finished"
    );
    Ok(ports)
}

async fn resolve_host(host: &str) -> anyhow::Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .with_context(|| format!("scan: resolve {host}"))?;
    addrs
        .next()
        .map(|a| a.ip())
        .with_context(|| format!("scan: resolve {host}: no addresses"))
}

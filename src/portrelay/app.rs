use std::{future::Future, sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinSet};

use crate::portrelay::{config, logging, proxy, relay, scan, supervisor, telemetry};

pub async fn run(args: config::Args) -> anyhow::Result<()> {
    let cfg = config::load(&args)?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    serve(cfg, shutdown_signal()).await
}

/// Run the configured mode until `signal` resolves or a task fails.
pub async fn serve<S>(cfg: config::Config, signal: S) -> anyhow::Result<()>
where
    S: Future<Output = ()>,
{
    tracing::info!(
        mode = %cfg.mode,
        relay = %cfg.forward.relay,
        dial_timeout = %humantime::format_duration(cfg.forward.dial_timeout),
        "portrelay: starting"
    );

    let sessions = Arc::new(telemetry::SessionRegistry::new());
    let forward = proxy::ForwardContext {
        connector: Arc::new(proxy::TcpConnector::new(cfg.forward.dial_timeout)),
        sessions: sessions.clone(),
        relay: relay::RelayOptions {
            policy: cfg.forward.relay,
            buffer_size: cfg.forward.buffer_size,
        },
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    let mut statuses = None;

    match &cfg.mode {
        config::Mode::Direct {
            listen_addr,
            target_addr,
        } => {
            tracing::info!(listen_addr = %listen_addr, target_addr = %target_addr, "portrelay: direct forwarding");
            let listen_addr = listen_addr.clone();
            let handler = forward.handler(target_addr.clone());
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { proxy::serve_tcp(&listen_addr, handler, shutdown).await });
        }
        config::Mode::Discovery {
            listen_host,
            target_host,
        } => {
            tracing::info!(
                listen_host = %listen_host,
                target_host = %target_host,
                from_port = cfg.scan.from_port,
                to_port = cfg.scan.to_port,
                "portrelay: discovery forwarding"
            );
            let mut sup = supervisor::Supervisor::new(
                listen_host.clone(),
                target_host.clone(),
                supervisor::SupervisorOptions {
                    scan: scan::ScanOptions {
                        timeout: cfg.scan.timeout,
                        workers: cfg.scan.workers,
                    },
                    from_port: cfg.scan.from_port,
                    to_port: cfg.scan.to_port,
                    restart_delay: cfg.restart_delay,
                    rescan_interval: cfg.scan.rescan_interval,
                },
                forward,
            );
            statuses = Some(sup.statuses());
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { sup.run(shutdown).await });
        }
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = signal => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!(err = %format!("{err:#}"), "portrelay: listener failed");
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    if !sessions.is_empty() {
        tracing::info!(active_sessions = sessions.len(), "shutdown: closing open sessions");
        for s in sessions.snapshot() {
            tracing::debug!(sid = %s.id, client = %s.client, target = %s.target, "shutdown: open session");
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };

    // Hard cap so a stuck task cannot stall the exit.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!(
            timeout = %humantime::format_duration(drain_timeout),
            "shutdown: tasks did not stop in time; aborting"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    if let Some(statuses) = statuses {
        for entry in statuses.iter() {
            tracing::debug!(
                port = *entry.key(),
                state = %entry.state,
                attempts = entry.attempts,
                last_error = entry.last_error.as_deref().unwrap_or(""),
                "shutdown: listener final state"
            );
        }
    }

    tracing::info!("portrelay: stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{sync::watch, task::JoinHandle};

use crate::portrelay::{net, proxy, scan};

/// Well-known plus registered ports: `[0, 49152)`.
pub const DISCOVERY_PORT_END: u32 = 49152;
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(3);

/// Lifecycle of one supervised listener.
///
/// `Running → Failed → CoolingDown → Running ...` until shutdown, which moves
/// it to `Stopped` from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Starting,
    Running,
    Failed,
    CoolingDown,
    Stopped,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ListenerState::Starting => "starting",
            ListenerState::Running => "running",
            ListenerState::Failed => "failed",
            ListenerState::CoolingDown => "cooling_down",
            ListenerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ListenerStatus {
    pub state: ListenerState,
    /// How many times the listener has been started.
    pub attempts: u64,
    pub last_error: Option<String>,
}

pub type ListenerStatuses = Arc<DashMap<u16, ListenerStatus>>;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub scan: scan::ScanOptions,
    pub from_port: u16,
    /// Exclusive, so it may be 65536.
    pub to_port: u32,
    pub restart_delay: Duration,
    /// `None`: discover once, then only wait for shutdown.
    pub rescan_interval: Option<Duration>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            scan: scan::ScanOptions::default(),
            from_port: 0,
            to_port: DISCOVERY_PORT_END,
            restart_delay: DEFAULT_RESTART_DELAY,
            rescan_interval: None,
        }
    }
}

/// Discovery mode: scan the target host, then keep one listener per open port
/// alive on the listen host.
pub struct Supervisor {
    listen_host: String,
    target_host: String,
    opts: SupervisorOptions,
    forward: proxy::ForwardContext,
    statuses: ListenerStatuses,
    running: HashMap<u16, JoinHandle<()>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("listen_host", &self.listen_host)
            .field("target_host", &self.target_host)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(
        listen_host: impl Into<String>,
        target_host: impl Into<String>,
        opts: SupervisorOptions,
        forward: proxy::ForwardContext,
    ) -> Self {
        Self {
            listen_host: listen_host.into(),
            target_host: target_host.into(),
            opts,
            forward,
            statuses: Arc::new(DashMap::new()),
            running: HashMap::new(),
        }
    }

    pub fn statuses(&self) -> ListenerStatuses {
        self.statuses.clone()
    }

    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            let discovered = tokio::select! {
                res = scan::scan(&self.target_host, self.opts.from_port, self.opts.to_port, &self.opts.scan) => res,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };

            let next_pass = match discovered {
                Ok(ports) => {
                    self.launch(ports, &shutdown);
                    self.opts.rescan_interval
                }
                Err(err) => {
                    tracing::warn!(
                        target_host = %self.target_host,
                        err = %format!("{err:#}"),
                        retry_in = %humantime::format_duration(self.opts.restart_delay),
                        "supervisor: discovery failed"
                    );
                    Some(self.opts.restart_delay)
                }
            };

            match next_pass {
                Some(delay) => {
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
                None => {
                    tracing::info!(
                        listeners = self.running.len(),
                        "supervisor: discovery complete; waiting for shutdown"
                    );
                    wait_for_shutdown(&mut shutdown).await;
                    break;
                }
            }
        }

        self.stop_all().await;
        Ok(())
    }

    /// Start supervision for every port not already supervised.
    fn launch(&mut self, mut ports: Vec<u16>, shutdown: &watch::Receiver<bool>) {
        ports.sort_unstable();
        ports.dedup();

        let mut started = 0usize;
        for port in ports {
            if self.running.get(&port).is_some_and(|t| !t.is_finished()) {
                continue;
            }

            let listen_addr = net::join_host_port(&self.listen_host, port);
            let target_addr = net::join_host_port(&self.target_host, port);
            let handler = self.forward.handler(target_addr.clone());

            self.statuses.insert(
                port,
                ListenerStatus {
                    state: ListenerState::Starting,
                    attempts: 0,
                    last_error: None,
                },
            );

            tracing::info!(port, listen_addr = %listen_addr, target_addr = %target_addr, "supervisor: forwarding discovered port");

            let statuses = self.statuses.clone();
            let restart_delay = self.opts.restart_delay;
            let shutdown = shutdown.clone();
            let task = tokio::spawn(async move {
                supervise(port, &statuses, restart_delay, shutdown, |sd| {
                    let listen_addr = listen_addr.clone();
                    let handler = handler.clone();
                    async move { proxy::serve_tcp(&listen_addr, handler, sd).await }
                })
                .await;
            });
            self.running.insert(port, task);
            started += 1;
        }

        if started > 0 {
            tracing::info!(started, total = self.running.len(), "supervisor: listeners launched");
        }
    }

    async fn stop_all(&mut self) {
        for (port, task) in self.running.drain() {
            if let Err(err) = task.await {
                tracing::debug!(port, err = %err, "supervisor: listener task ended abnormally");
            }
        }
    }
}

/// Run `serve` until shutdown, restarting it after a fixed `restart_delay`
/// every time it returns. Never gives up on its own.
pub async fn supervise<F, Fut>(
    port: u16,
    statuses: &ListenerStatuses,
    restart_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut serve: F,
) where
    F: FnMut(watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut attempts = 0u64;
    loop {
        if *shutdown.borrow() {
            break;
        }

        attempts += 1;
        set_status(statuses, port, ListenerState::Running, attempts, None);

        let res = serve(shutdown.clone()).await;
        if *shutdown.borrow() {
            break;
        }

        let reason = match res {
            Ok(()) => "listener returned".to_string(),
            Err(err) => format!("{err:#}"),
        };
        set_status(statuses, port, ListenerState::Failed, attempts, Some(reason.clone()));
        tracing::warn!(port, attempt = attempts, err = %reason, "supervisor: listener closed");

        set_status(statuses, port, ListenerState::CoolingDown, attempts, Some(reason));
        tracing::info!(
            port,
            delay = %humantime::format_duration(restart_delay),
            "supervisor: restarting listener"
        );
        if sleep_or_shutdown(restart_delay, &mut shutdown).await {
            break;
        }
    }

    if let Some(mut st) = statuses.get_mut(&port) {
        st.state = ListenerState::Stopped;
    }
}

fn set_status(
    statuses: &ListenerStatuses,
    port: u16,
    state: ListenerState,
    attempts: u64,
    last_error: Option<String>,
) {
    let mut entry = statuses.entry(port).or_insert(ListenerStatus {
        state,
        attempts,
        last_error: None,
    });
    entry.state = state;
    entry.attempts = attempts;
    if last_error.is_some() {
        entry.last_error = last_error;
    }
}

/// Returns once shutdown is requested or the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay`; `true` means shutdown interrupted the sleep.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = wait_for_shutdown(shutdown) => true,
    }
}

//! Network connectivity monitors

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reports whether the network is reachable
pub trait ConnectivityMonitor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the most recent probe connected successfully
    fn has_connected(&self) -> bool;

    /// Receives the new value every time `has_connected` flips
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Probes a `host:port` target by opening a TCP connection
pub struct TcpConnectivityMonitor {
    target: String,
    connect_timeout: Duration,
    connected: watch::Sender<bool>,
}

impl TcpConnectivityMonitor {
    pub fn new(target: impl Into<String>) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            target: target.into(),
            connect_timeout: Duration::from_secs(5),
            connected,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Connect once and publish the result
    pub async fn probe(&self) -> bool {
        let reachable =
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.target)).await
            {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    debug!(probe = %self.target, error = %e, "Connectivity probe failed");
                    false
                }
                Err(_) => {
                    debug!(probe = %self.target, "Connectivity probe timed out");
                    false
                }
            };

        let changed = self.connected.send_if_modified(|connected| {
            let changed = *connected != reachable;
            *connected = reachable;
            changed
        });
        if changed {
            if reachable {
                info!(probe = %self.target, "Network reachable");
            } else {
                warn!(probe = %self.target, "Network unreachable");
            }
        }
        reachable
    }

    /// Probe immediately, then every `interval` until `shutdown`
    pub fn spawn(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.probe().await;
                    }
                }
            }
            debug!(probe = %monitor.target, "Connectivity monitor stopped");
        })
    }
}

impl ConnectivityMonitor for TcpConnectivityMonitor {
    fn name(&self) -> &str {
        &self.target
    }

    fn has_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

/// Call `on_recovery` each time the network comes back after an outage
///
/// The network counts as up while any monitor reports a connection. The
/// first time it comes up is not a recovery. Returns when `shutdown` fires.
pub async fn watch_recovery<F, Fut>(
    monitors: Vec<Arc<dyn ConnectivityMonitor>>,
    shutdown: CancellationToken,
    mut on_recovery: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let is_up = |monitors: &[Arc<dyn ConnectivityMonitor>]| monitors.iter().any(|m| m.has_connected());

    let mut changes = stream::select_all(
        monitors
            .iter()
            .map(|monitor| WatchStream::from_changes(monitor.subscribe())),
    );
    let mut up = is_up(&monitors);
    let mut seen_up = up;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            change = changes.next() => {
                if change.is_none() {
                    return;
                }
            }
        }

        let now_up = is_up(&monitors);
        if now_up && !up && seen_up {
            info!("Network connectivity restored");
            on_recovery().await;
        }
        seen_up |= now_up;
        up = now_up;
    }
}

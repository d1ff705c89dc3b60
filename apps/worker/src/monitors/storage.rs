//! Local storage availability

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Latest storage observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageStatus {
    /// The database answered its last probe
    pub online: bool,
    /// Storage work is held back on purpose (e.g. during maintenance)
    pub blocked: bool,
}

impl StorageStatus {
    pub fn is_available(&self) -> bool {
        self.online && !self.blocked
    }
}

/// Publishes whether storage-dependent work may run
pub struct StorageMonitor {
    status: watch::Sender<StorageStatus>,
}

impl Default for StorageMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

impl StorageMonitor {
    pub fn new(online: bool) -> Self {
        let (status, _) = watch::channel(StorageStatus {
            online,
            blocked: false,
        });
        Self { status }
    }

    pub fn status(&self) -> StorageStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StorageStatus> {
        self.status.subscribe()
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.status.send_if_modified(|status| {
            let changed = status.online != online;
            status.online = online;
            changed
        });
        if changed {
            if online {
                info!("Storage online");
            } else {
                warn!("Storage offline");
            }
        }
    }

    pub fn set_blocked(&self, blocked: bool) {
        let changed = self.status.send_if_modified(|status| {
            let changed = status.blocked != blocked;
            status.blocked = blocked;
            changed
        });
        if changed {
            info!(blocked, "Storage block changed");
        }
    }

    /// Ping the database with `SELECT 1` every `interval` until `shutdown`
    pub fn spawn_pg_probe(
        self: &Arc<Self>,
        pool: PgPool,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let probe = sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&pool);
                        let online = match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
                            Ok(Ok(_)) => true,
                            Ok(Err(e)) => {
                                debug!(error = %e, "Storage probe failed");
                                false
                            }
                            Err(_) => {
                                debug!("Storage probe timed out");
                                false
                            }
                        };
                        monitor.set_online(online);
                    }
                }
            }
            debug!("Storage probe stopped");
        })
    }
}

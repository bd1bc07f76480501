//! Connectivity glue
//!
//! The platform tells us whether the network is reachable; on a desktop
//! build we approximate that by probing the backend's health endpoint.
//! Either way the status is published on a watch channel the scheduler
//! subscribes to.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{with_timeout, BackendApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Connectivity::Online => "online",
            Connectivity::Offline => "offline",
        })
    }
}

/// Publishes online/offline transitions
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<Connectivity>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Record the current status; returns true on a transition
    pub fn report(&self, status: Connectivity) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!("Connectivity is now {}", status);
        }
        changed
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Online)
    }
}

/// Poll the backend's health endpoint and report transitions
///
/// Runs until `cancel` fires.
pub fn spawn_health_probe(
    backend: Arc<dyn BackendApi>,
    monitor: ConnectivityMonitor,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let status = match with_timeout(timeout, backend.health()).await {
                Ok(()) => Connectivity::Online,
                Err(e) => {
                    debug!("Health probe failed: {}", e);
                    Connectivity::Offline
                }
            };
            monitor.report(status);
        }
        debug!("Health probe stopped");
    })
}

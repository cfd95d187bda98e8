//! Bridge Engine
//!
//! Materializes one supervised [`ForwardingRoute`] per route table entry,
//! and stops them as a group.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::route::{ForwardingRoute, RouteShared, RouteState, RouteStatus};
use super::table::RouteTable;
use crate::broker::ConnectionPool;
use crate::config::{PayloadMode, SupervisionConfig};

/// Builds and starts the forwarding routes for a route table
pub struct BridgeEngine {
    table: RouteTable,
    pool: Arc<ConnectionPool>,
    supervision: SupervisionConfig,
    payload_mode: PayloadMode,
}

impl BridgeEngine {
    pub fn new(table: RouteTable, pool: Arc<ConnectionPool>) -> Self {
        Self {
            table,
            pool,
            supervision: SupervisionConfig::default(),
            payload_mode: PayloadMode::default(),
        }
    }

    /// Override the restart and shutdown settings
    pub fn with_supervision(mut self, supervision: SupervisionConfig) -> Self {
        self.supervision = supervision;
        self
    }

    /// Select how message bodies are converted
    pub fn with_payload_mode(mut self, payload_mode: PayloadMode) -> Self {
        self.payload_mode = payload_mode;
        self
    }

    /// Spawn one supervised task per route. Must be called within a tokio
    /// runtime.
    pub fn start(self) -> BridgeHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut routes = Vec::with_capacity(self.table.len());

        for entry in self.table {
            let shared = Arc::new(RouteShared::new(entry));
            let route = ForwardingRoute::new(shared.clone(), self.payload_mode, self.pool.clone());

            info!(
                "Bridge engine: registered route {} (consume '{}' on {}, produce '{}' on {})",
                route.name(),
                shared.entry().source_queue(),
                self.pool.broker_name(shared.entry().direction.source()),
                shared.entry().target_queue(),
                self.pool.broker_name(shared.entry().direction.target()),
            );

            let supervision = self.supervision.clone();
            let shutdown = shutdown_rx.clone();
            let task = tokio::spawn(async move {
                supervise(route, supervision, shutdown).await;
            });

            routes.push(RouteHandle { shared, task });
        }

        info!("Bridge engine: started {} routes", routes.len());

        BridgeHandle {
            routes,
            shutdown: shutdown_tx,
            pool: self.pool,
            shutdown_timeout: self.supervision.shutdown_timeout,
        }
    }
}

/// Run a route until shutdown or a non-transient failure, restarting it
/// with exponential backoff after transient failures.
async fn supervise(
    route: ForwardingRoute,
    supervision: SupervisionConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let shared = route.shared().clone();
    let mut backoff = supervision.initial_backoff;

    loop {
        if *shutdown.borrow() {
            break;
        }

        shared.set_state(RouteState::Idle);
        let forwarded_before = shared.forwarded();

        let error = match route.run(&mut shutdown).await {
            Ok(()) => break,
            Err(e) => e,
        };
        shared.record_failure(&error);

        if !error.is_transient() {
            error!("Route '{}': stopped: {}", route.name(), error);
            break;
        }

        // Progress since the last restart means the failure is fresh
        if shared.forwarded() > forwarded_before {
            backoff = supervision.initial_backoff;
        }

        warn!(
            "Route '{}': {}; restarting in {:?}",
            route.name(),
            error,
            backoff
        );
        shared.set_state(RouteState::Backoff);

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }

        backoff = next_backoff(backoff, supervision.max_backoff);
        shared.record_restart();
    }

    shared.set_state(RouteState::Stopped);
    debug!("Route '{}': supervisor exited", route.name());
}

/// Double `current`, capped at `max`
fn next_backoff(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current.saturating_mul(2), max)
}

struct RouteHandle {
    shared: Arc<RouteShared>,
    task: JoinHandle<()>,
}

/// Outcome of [`BridgeHandle::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSummary {
    /// Routes that finished their transaction and exited
    pub stopped: usize,
    /// Routes aborted after the shutdown timeout
    pub aborted: usize,
}

/// Handle to a running engine
pub struct BridgeHandle {
    routes: Vec<RouteHandle>,
    shutdown: watch::Sender<bool>,
    pool: Arc<ConnectionPool>,
    shutdown_timeout: Duration,
}

impl BridgeHandle {
    /// Status of every route, in route table order
    pub fn routes(&self) -> Vec<RouteStatus> {
        self.routes.iter().map(|r| r.shared.status()).collect()
    }

    /// Status of one route by name
    pub fn route(&self, name: &str) -> Option<RouteStatus> {
        self.routes
            .iter()
            .find(|r| r.shared.entry().name() == name)
            .map(|r| r.shared.status())
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Routes that have not stopped
    pub fn active_count(&self) -> usize {
        self.routes
            .iter()
            .filter(|r| r.shared.state() != RouteState::Stopped)
            .count()
    }

    /// Ask every route to stop after its in-flight transaction resolves,
    /// wait for them, then close the pooled connections.
    ///
    /// Routes still running after the shutdown timeout are aborted.
    pub async fn stop(self) -> StopSummary {
        info!("Bridge engine: stopping {} routes", self.routes.len());
        let _ = self.shutdown.send(true);

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let mut summary = StopSummary {
            stopped: 0,
            aborted: 0,
        };

        for route in self.routes {
            let RouteHandle { shared, mut task } = route;
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => summary.stopped += 1,
                Ok(Err(e)) => {
                    error!("Route '{}': task failed: {}", shared.entry().name(), e);
                    shared.set_state(RouteState::Stopped);
                    summary.aborted += 1;
                }
                Err(_) => {
                    warn!(
                        "Route '{}': did not stop within {:?}, aborting",
                        shared.entry().name(),
                        self.shutdown_timeout
                    );
                    task.abort();
                    shared.set_state(RouteState::Stopped);
                    summary.aborted += 1;
                }
            }
        }

        self.pool.close_all().await;
        info!(
            "Bridge engine: stopped ({} clean, {} aborted)",
            summary.stopped, summary.aborted
        );
        summary
    }
}

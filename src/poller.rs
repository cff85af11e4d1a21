//! Poll scheduler: one full pass over all configured silos per cycle.
//!
//! The poller is the sole owner of the bus transport and the sole writer to
//! the reading store. Requests run strictly one at a time in ascending unit
//! id order; the bus is half-duplex and shared, so there is no cross-device
//! parallelism. The cycle interval is counted from cycle start; an overrun
//! cycle starts the next one immediately. Shutdown is checked between
//! device reads and inside every sleep, so stop latency is bounded by one
//! request timeout plus the inter-request delay.

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::calibration::fill_percent;
use crate::config::{PollingConfig, SiloConfig};
use crate::health::SharedHealth;
use crate::store::{Reading, SharedStore};
use crate::transport::Transport;

/// Outcome counts for one full pass.
#[derive(Debug, Default)]
struct CycleStats {
    ok: usize,
    failed: usize,
    skipped: usize,
}

/// The polling worker.
pub struct Poller<T: Transport> {
    transport: T,
    silos: Vec<SiloConfig>,
    store: SharedStore,
    health: SharedHealth,
    settings: PollingConfig,
}

impl<T: Transport> Poller<T> {
    /// Create a poller over the given silos. The poll order is ascending
    /// unit id regardless of configuration order.
    pub fn new(
        transport: T,
        mut silos: Vec<SiloConfig>,
        store: SharedStore,
        health: SharedHealth,
        settings: PollingConfig,
    ) -> Self {
        silos.sort_by_key(|s| s.id);
        Self {
            transport,
            silos,
            store,
            health,
            settings,
        }
    }

    /// Run the polling loop until the shutdown signal flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            silos = self.silos.len(),
            interval_secs = self.settings.interval_secs,
            register = self.settings.register_address,
            "starting poll loop"
        );

        if let Err(e) = self.transport.connect().await {
            warn!("initial bus connect failed, will retry: {}", e);
        }

        loop {
            let cycle_start = tokio::time::Instant::now();

            let Some(stats) = self.poll_cycle(&mut shutdown).await else {
                break;
            };

            self.health.record_cycle(self.transport.is_connected());
            info!(
                ok = stats.ok,
                failed = stats.failed,
                skipped = stats.skipped,
                duration_ms = cycle_start.elapsed().as_millis() as u64,
                "poll cycle complete"
            );

            let deadline = cycle_start + self.settings.interval();
            if tokio::time::Instant::now() >= deadline {
                warn!("poll cycle overran the interval, starting next cycle immediately");
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = wait_for_stop(&mut shutdown) => break,
            }
        }

        self.transport.close().await;
        info!("poll loop stopped");
    }

    /// One pass over all silos. Returns `None` when the shutdown signal was
    /// observed mid-cycle.
    async fn poll_cycle(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<CycleStats> {
        let mut stats = CycleStats::default();
        let address = self.settings.register_address;
        let delay = self.settings.inter_request_delay();

        let Self {
            transport,
            silos,
            store,
            ..
        } = self;
        let total = silos.len();

        for (index, silo) in silos.iter().enumerate() {
            if *shutdown.borrow() {
                return None;
            }

            match transport.read_register(silo.id, address).await {
                Ok(raw) => {
                    let percent = fill_percent(i64::from(raw), silo.capacity);
                    store.put(
                        silo.id,
                        Reading {
                            raw_value: raw,
                            percent,
                            timestamp: Utc::now(),
                        },
                    );
                    debug!(unit = silo.id, raw, percent, "read ok");
                    stats.ok += 1;
                }
                Err(e) if e.is_transport() => {
                    // Further reads would fail fast until the transport has
                    // reconnected; finish this cycle early and retry on the
                    // next one.
                    error!(unit = silo.id, "bus failure, skipping rest of cycle: {}", e);
                    stats.failed += 1;
                    stats.skipped = total - index - 1;
                    break;
                }
                Err(e) => {
                    warn!(unit = silo.id, "read failed: {}", e);
                    stats.failed += 1;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_stop(shutdown) => return None,
            }
        }

        Some(stats)
    }
}

/// Resolves when the shutdown flag flips to true or the sender is gone.
async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
